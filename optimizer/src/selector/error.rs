/// No assignment satisfies the requested constraint.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum InfeasibleError {
    #[error(
        "budget {budget} is below the cheapest assignment ({}), which costs {min_cost}",
        describe(.cheapest)
    )]
    Budget {
        budget: f64,
        min_cost: f64,
        /// `(stage, variant)` of the cheapest assignment.
        cheapest: Vec<(String, String)>,
    },
    #[error("no assignment reaches accuracy {floor}{}", best_achievable(.best_accuracy))]
    AccuracyFloor {
        floor: f64,
        best_accuracy: Option<f64>,
    },
    #[error("all {candidates} candidates within the bound hit a profile gap")]
    Unprofiled { candidates: u64 },
}

fn describe(assignment: &[(String, String)]) -> String {
    assignment
        .iter()
        .map(|(stage, variant)| format!("{stage}={variant}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn best_achievable(best: &Option<f64>) -> String {
    best.map(|b| format!(", best achievable is {b}"))
        .unwrap_or_default()
}
