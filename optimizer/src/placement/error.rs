#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PlacementError {
    #[error("the worker pool is empty")]
    EmptyPool,
    #[error("worker `{id}` is defined more than once")]
    DuplicateWorker { id: String },
    #[error("worker `{id}`: {reason}")]
    InvalidWorker { id: String, reason: String },
    #[error(
        "stage `{stage}` (variant `{variant}`, cost {cost}) does not fit on any worker, even alone"
    )]
    Unplaceable {
        stage: String,
        variant: String,
        cost: f64,
    },
    #[error(
        "stage `{stage}` (variant `{variant}`, cost {cost}) fits no worker's remaining capacity"
    )]
    CapacityExhausted {
        stage: String,
        variant: String,
        cost: f64,
    },
    #[error(
        "critical path {} takes {latency}, above the latency objective {slo}",
        .path.join(" -> ")
    )]
    SloViolated {
        path: Vec<String>,
        latency: f64,
        slo: f64,
    },
}
