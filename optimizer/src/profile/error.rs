//! Errors raised while loading and validating profile records.

/// Malformed or inconsistent profile input. Always surfaced before search begins.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("record `{record}`, field `{field}`: {reason}")]
    Schema {
        record: String,
        field: String,
        reason: String,
    },
    #[error("unable to read profiles from `{path}`: {reason}")]
    Io { path: String, reason: String },
    #[error("no operator profile found in the record set")]
    NoStages,
    #[error("stage `{stage}` is defined more than once")]
    DuplicateStage { stage: String },
    #[error("stage `{stage}` has no variants")]
    NoVariants { stage: String },
    #[error("stage `{stage}` references unknown upstream stage `{upstream}`")]
    UnknownUpstream { stage: String, upstream: String },
    #[error("stage `{stage}`: variant `{variant}` has a cost profile but no accuracy profile")]
    MissingAccuracy { stage: String, variant: String },
    #[error("stage `{stage}`: variant `{variant}` has an accuracy profile but no cost profile")]
    MissingCost { stage: String, variant: String },
    #[error(
        "stage `{stage}`: sample #{sample} of variant `{variant}` has {found} input accuracies, expected {expected}"
    )]
    InputArity {
        stage: String,
        variant: String,
        sample: usize,
        expected: usize,
        found: usize,
    },
    #[error("stage `{stage}`: variant `{variant}` has {found} accuracy samples, expected {expected}")]
    SampleCount {
        stage: String,
        variant: String,
        expected: usize,
        found: usize,
    },
    #[error("unknown stage `{stage}`")]
    UnknownStage { stage: String },
    #[error("unknown variant `{variant}` for stage `{stage}`")]
    UnknownVariant { stage: String, variant: String },
    #[error("end-to-end profile `{profile}`: {reason}")]
    EndToEnd { profile: String, reason: String },
    #[error(
        "end-to-end profile `{profile}` disagrees with composition at `{sink}` for ({}): cached {cached}, composed {composed}",
        .key.join(", ")
    )]
    EndToEndMismatch {
        profile: String,
        sink: String,
        key: Vec<String>,
        cached: f64,
        composed: f64,
    },
    #[error("unknown objective `{name}`: neither an end-to-end profile nor a stage")]
    UnknownObjective { name: String },
    #[error("objective `{name}` has invalid weight {weight}")]
    InvalidWeight { name: String, weight: f64 },
}

impl ValidationError {
    pub(crate) fn schema(
        record: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        ValidationError::Schema {
            record: record.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// The stage graph contains a cycle, which is never a legitimate inference pipeline.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("stage graph has a dependency cycle through: {}", .stages.join(", "))]
pub struct CyclicDependencyError {
    /// Stages that could not be ordered, sorted by name.
    pub stages: Vec<String>,
}

/// Any error produced by [`super::ProfileStore`].
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ProfileError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Cyclic(#[from] CyclicDependencyError),
}
