//! The deployment plan handed to the runtime.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    objective::ObjectiveSet,
    placement::{Placement, WorkerSpec},
    profile::ProfileGraph,
    selector::{SearchStrategy, Selection, SelectionMode},
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StagePlan {
    pub stage: String,
    pub variant: String,
    pub worker: String,
    /// Reference cost of the variant.
    pub cost: f64,
    /// Cost on the chosen worker.
    pub exec_cost: f64,
    pub accuracy: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectivePlan {
    pub name: String,
    pub weight: f64,
    pub accuracy: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerPlan {
    pub id: String,
    pub capacity: f64,
    pub load: f64,
    pub stages: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchSummary {
    pub strategy: SearchStrategy,
    pub exhaustive: bool,
    pub candidates_evaluated: u64,
    /// Number of full assignments, saturated to `u64::MAX`.
    pub search_space: u64,
}

/// Variant and worker of every stage, with the accuracy and cost they achieve.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    pub mode: SelectionMode,
    /// In topological order.
    pub stages: Vec<StagePlan>,
    pub objectives: Vec<ObjectivePlan>,
    pub weighted_accuracy: f64,
    pub total_cost: f64,
    pub workers: Vec<WorkerPlan>,
    pub critical_path: Vec<String>,
    pub critical_path_latency: f64,
    pub search: SearchSummary,
}

/// The runtime's view of a plan: which variant runs each stage, and where.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub model_assignments: BTreeMap<String, String>,
    pub device_placements: BTreeMap<String, Vec<String>>,
}

impl DeploymentPlan {
    pub fn new(
        graph: &ProfileGraph,
        objectives: &ObjectiveSet,
        selection: &Selection,
        placement: &Placement,
        workers: &[WorkerSpec],
    ) -> Self {
        let stages = graph
            .stages()
            .iter()
            .zip(&placement.stages)
            .zip(&selection.stage_accuracies)
            .map(|((stage, placed), accuracy)| {
                let v = selection.assignment.variant(stage.id());
                StagePlan {
                    stage: stage.name().to_string(),
                    variant: stage.variant(v).to_string(),
                    worker: workers[placed.worker].id.clone(),
                    cost: stage.cost(v),
                    exec_cost: placed.exec_cost,
                    accuracy: *accuracy,
                }
            })
            .collect::<Vec<_>>();
        let workers = workers
            .iter()
            .enumerate()
            .zip(&placement.loads)
            .map(|((i, w), load)| WorkerPlan {
                id: w.id.clone(),
                capacity: w.capacity,
                load: *load,
                stages: placement
                    .stages
                    .iter()
                    .filter(|p| p.worker == i)
                    .map(|p| graph.stage(p.stage).name().to_string())
                    .collect(),
            })
            .collect();
        Self {
            mode: selection.mode,
            stages,
            objectives: objectives
                .objectives()
                .iter()
                .zip(&selection.objective_values)
                .map(|(o, accuracy)| ObjectivePlan {
                    name: o.name().to_string(),
                    weight: o.weight(),
                    accuracy: *accuracy,
                })
                .collect(),
            weighted_accuracy: selection.weighted_accuracy,
            total_cost: selection.total_cost,
            workers,
            critical_path: placement
                .critical_path
                .iter()
                .map(|s| graph.stage(*s).name().to_string())
                .collect(),
            critical_path_latency: placement.critical_path_latency,
            search: SearchSummary {
                strategy: selection.strategy,
                exhaustive: selection.exhaustive,
                candidates_evaluated: selection.candidates_evaluated,
                search_space: u64::try_from(graph.search_space()).unwrap_or(u64::MAX),
            },
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn pipeline_spec(&self) -> PipelineSpec {
        PipelineSpec {
            model_assignments: self
                .stages
                .iter()
                .map(|s| (s.stage.clone(), s.variant.clone()))
                .collect(),
            device_placements: self
                .stages
                .iter()
                .map(|s| (s.stage.clone(), vec![s.worker.clone()]))
                .collect(),
        }
    }
}
