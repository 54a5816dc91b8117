use crate::{
    composer::ProfileGapError,
    config::ConfigError,
    placement::PlacementError,
    profile::{CyclicDependencyError, ProfileError, ValidationError},
    selector::InfeasibleError,
};

/// Any failure of an optimization run.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum OptimizerError {
    #[error("invalid profiles: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Cyclic(#[from] CyclicDependencyError),
    #[error(transparent)]
    ProfileGap(#[from] ProfileGapError),
    #[error("infeasible: {0}")]
    Infeasible(#[from] InfeasibleError),
    #[error("placement failed: {0}")]
    Placement(#[from] PlacementError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl From<ProfileError> for OptimizerError {
    fn from(error: ProfileError) -> Self {
        match error {
            ProfileError::Validation(e) => OptimizerError::Validation(e),
            ProfileError::Cyclic(e) => OptimizerError::Cyclic(e),
        }
    }
}
