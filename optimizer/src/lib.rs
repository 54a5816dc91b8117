//! Variant selection and worker placement for multi-stage inference workflows.
//!
//! Profiles of every stage are validated into a [`ProfileGraph`], a [`ModelSelector`]
//! picks one variant per stage against composed accuracy under a cost budget, and a
//! [`WorkerPlacer`] maps the chosen variants onto a worker pool. [`OptimizerDriver`]
//! runs the whole pipeline and emits a [`DeploymentPlan`].

pub mod composer;
pub mod config;
pub mod driver;
mod error;
pub mod objective;
pub mod placement;
pub mod plan;
pub mod profile;
pub mod selector;
pub mod testing;

pub use composer::{AccuracyComposer, ProfileGapError};
pub use config::{ConfigError, OptimizerConfig, SearchConfig};
pub use driver::OptimizerDriver;
pub use error::OptimizerError;
pub use objective::{ObjectiveSet, ObjectiveSpec};
pub use placement::{Placement, PlacementError, WorkerPlacer, WorkerSpec};
pub use plan::{DeploymentPlan, PipelineSpec};
pub use profile::{
    Assignment, CyclicDependencyError, ProfileError, ProfileGraph, ProfileRecords, ProfileStore,
    StageId, ValidationError, VariantId,
};
pub use selector::{
    Candidate, InfeasibleError, ModelSelector, SearchStrategy, Selection, SelectionMode,
};
