//! Worker placement of a fixed variant assignment.
//!
//! Stages are list-scheduled onto a heterogeneous pool: the costliest stage first,
//! each to the worker it leaves least loaded. The placement never changes the
//! assignment it is given.

use std::collections::{BTreeMap, HashSet};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

pub use error::PlacementError;

use crate::profile::{Assignment, ProfileGraph, StageId, VariantId};

mod error;

fn default_speed() -> f64 {
    1.0
}

/// An execution resource.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WorkerSpec {
    pub id: String,
    /// Upper bound on the summed execution cost of the stages placed here.
    pub capacity: f64,
    /// Multiplier applied to the reference cost of a variant on this worker.
    #[serde(default)]
    pub speed_factors: BTreeMap<String, f64>,
    /// Multiplier for variants missing from `speed_factors`.
    #[serde(default = "default_speed")]
    pub default_speed: f64,
}

impl WorkerSpec {
    pub fn new(id: impl Into<String>, capacity: f64) -> Self {
        Self {
            id: id.into(),
            capacity,
            speed_factors: BTreeMap::new(),
            default_speed: default_speed(),
        }
    }

    pub fn with_speed_factor(mut self, variant: impl Into<String>, factor: f64) -> Self {
        self.speed_factors.insert(variant.into(), factor);
        self
    }

    pub fn with_default_speed(mut self, factor: f64) -> Self {
        self.default_speed = factor;
        self
    }

    pub fn speed_for(&self, variant: &VariantId) -> f64 {
        self.speed_factors
            .get(variant.as_str())
            .copied()
            .unwrap_or(self.default_speed)
    }

    fn validate(&self) -> Result<(), PlacementError> {
        let invalid = |reason: String| PlacementError::InvalidWorker {
            id: self.id.clone(),
            reason,
        };
        if self.id.is_empty() {
            return Err(invalid("empty id".to_string()));
        }
        if !self.capacity.is_finite() || self.capacity < 0.0 {
            return Err(invalid(format!("capacity {} is not a non-negative number", self.capacity)));
        }
        for (variant, factor) in std::iter::once(("<default>", &self.default_speed))
            .chain(self.speed_factors.iter().map(|(v, f)| (v.as_str(), f)))
        {
            if !factor.is_finite() || *factor <= 0.0 {
                return Err(invalid(format!("speed factor {factor} of `{variant}` is not positive")));
            }
        }
        Ok(())
    }
}

/// Where one stage runs.
#[derive(Clone, Debug, PartialEq)]
pub struct StagePlacement {
    pub stage: StageId,
    /// Index into the worker pool.
    pub worker: usize,
    /// Reference cost times the worker's speed factor.
    pub exec_cost: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Placement {
    /// Indexed by [`StageId`].
    pub stages: Vec<StagePlacement>,
    /// Summed execution cost per worker, in pool order.
    pub loads: Vec<f64>,
    /// Longest dependency chain of execution costs, leaves first.
    pub critical_path: Vec<StageId>,
    pub critical_path_latency: f64,
}

pub struct WorkerPlacer<'a> {
    graph: &'a ProfileGraph,
    workers: Vec<WorkerSpec>,
    latency_slo: Option<f64>,
}

impl<'a> WorkerPlacer<'a> {
    pub fn new(
        graph: &'a ProfileGraph,
        workers: Vec<WorkerSpec>,
        latency_slo: Option<f64>,
    ) -> Result<Self, PlacementError> {
        if workers.is_empty() {
            return Err(PlacementError::EmptyPool);
        }
        let mut seen = HashSet::new();
        for worker in &workers {
            worker.validate()?;
            if !seen.insert(worker.id.as_str()) {
                return Err(PlacementError::DuplicateWorker {
                    id: worker.id.clone(),
                });
            }
        }
        Ok(Self {
            graph,
            workers,
            latency_slo,
        })
    }

    pub fn workers(&self) -> &[WorkerSpec] {
        &self.workers
    }

    #[instrument(name = "WorkerPlacer::place", skip_all, level = "debug")]
    pub fn place(&self, assignment: &Assignment) -> Result<Placement, PlacementError> {
        let stages = self.graph.stages();
        let order = stages
            .iter()
            .sorted_by(|a, b| {
                b.cost(assignment.variant(b.id()))
                    .total_cmp(&a.cost(assignment.variant(a.id())))
                    .then(a.id().cmp(&b.id()))
            })
            .collect::<Vec<_>>();

        let mut loads = vec![0.0f64; self.workers.len()];
        let mut placed: Vec<Option<StagePlacement>> = vec![None; stages.len()];
        for stage in order {
            let variant = stage.variant(assignment.variant(stage.id()));
            let cost = stage.cost(assignment.variant(stage.id()));
            let exec = |w: &WorkerSpec| cost * w.speed_for(variant);
            let choice = self
                .workers
                .iter()
                .enumerate()
                .filter(|(i, w)| loads[*i] + exec(*w) <= w.capacity)
                .min_by(|(i, a), (j, b)| {
                    (loads[*i] + exec(*a)).total_cmp(&(loads[*j] + exec(*b)))
                });
            let Some((worker, spec)) = choice else {
                let fits_alone = self.workers.iter().any(|w| exec(w) <= w.capacity);
                let (stage, variant) = (stage.name().to_string(), variant.to_string());
                return Err(if fits_alone {
                    PlacementError::CapacityExhausted {
                        stage,
                        variant,
                        cost,
                    }
                } else {
                    PlacementError::Unplaceable {
                        stage,
                        variant,
                        cost,
                    }
                });
            };
            let exec_cost = exec(spec);
            loads[worker] += exec_cost;
            debug!(
                "{} ({variant}) -> {} (exec cost {exec_cost}, load {})",
                stage.name(),
                spec.id,
                loads[worker]
            );
            placed[stage.id().index()] = Some(StagePlacement {
                stage: stage.id(),
                worker,
                exec_cost,
            });
        }
        let stages = placed.into_iter().flatten().collect::<Vec<_>>();

        let (critical_path, critical_path_latency) = self.critical_path(&stages);
        if let Some(slo) = self.latency_slo {
            if critical_path_latency > slo {
                return Err(PlacementError::SloViolated {
                    path: critical_path
                        .iter()
                        .map(|s| self.graph.stage(*s).name().to_string())
                        .collect(),
                    latency: critical_path_latency,
                    slo,
                });
            }
        }
        Ok(Placement {
            stages,
            loads,
            critical_path,
            critical_path_latency,
        })
    }

    /// Longest path through the stage DAG weighted by execution cost. Ties go to the
    /// earlier stage.
    fn critical_path(&self, placed: &[StagePlacement]) -> (Vec<StageId>, f64) {
        let stages = self.graph.stages();
        let mut finish = vec![0.0f64; stages.len()];
        let mut via: Vec<Option<StageId>> = vec![None; stages.len()];
        for stage in stages {
            let i = stage.id().index();
            let longest = stage
                .inputs()
                .iter()
                .copied()
                .max_by(|a, b| finish[a.index()].total_cmp(&finish[b.index()]).then(b.cmp(a)));
            let start = longest.map_or(0.0, |u| finish[u.index()]);
            finish[i] = start + placed[i].exec_cost;
            via[i] = longest;
        }
        let Some(end) = (0..stages.len())
            .max_by(|a, b| finish[*a].total_cmp(&finish[*b]).then(b.cmp(a)))
        else {
            return (vec![], 0.0);
        };
        let mut path = vec![stages[end].id()];
        while let Some(prev) = via[path[path.len() - 1].index()] {
            path.push(prev);
        }
        path.reverse();
        (path, finish[end])
    }
}
