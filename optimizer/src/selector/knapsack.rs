//! Multi-choice knapsack over discretized cost buckets.
//!
//! Stages are added one at a time in topological order. Each layer keeps, per cost
//! bucket, the single best partial assignment, with its exact cost and a partial score.
//! Objectives whose root stage is already assigned contribute their exact accuracy;
//! the others contribute the accuracy of their assigned stages that still feed an
//! unassigned stage of the objective. Cells sharing a bucket are compared on that
//! score, so the result is a heuristic and never reported as exhaustive.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, btree_map::Entry},
    time::Instant,
};

use itertools::Itertools;
use tracing::{debug, trace, warn};

use super::{Candidate, ModelSelector, SearchOutcome, SelectionMode};
use crate::{
    composer::{AccuracyComposer, ProfileGapError},
    objective::ObjectiveSet,
    profile::{Assignment, ProfileGraph, StageId},
};

#[derive(Clone, Debug)]
struct Cell {
    prefix: Vec<usize>,
    cost: f64,
    score: f64,
}

impl Cell {
    fn rank(&self, other: &Cell) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then(self.cost.total_cmp(&other.cost))
            .then_with(|| self.prefix.cmp(&other.prefix))
    }
}

/// Contribution of one objective once the first `k + 1` stages are assigned.
#[derive(Clone, Debug)]
enum Term {
    Exact,
    Proxy(Vec<StageId>),
}

fn terms(graph: &ProfileGraph, objectives: &ObjectiveSet) -> Vec<Vec<Term>> {
    (0..graph.num_stages())
        .map(|k| {
            objectives
                .objectives()
                .iter()
                .map(|o| {
                    if o.root().index() <= k {
                        return Term::Exact;
                    }
                    let closure = graph.stage(o.root()).closure();
                    Term::Proxy(
                        closure
                            .iter()
                            .copied()
                            .filter(|s| s.index() <= k)
                            .filter(|s| {
                                graph
                                    .stage(*s)
                                    .consumers()
                                    .iter()
                                    .any(|c| c.index() > k && closure.contains(c))
                            })
                            .collect(),
                    )
                })
                .collect()
        })
        .collect()
}

fn partial_score(
    composer: &mut AccuracyComposer<'_>,
    objectives: &ObjectiveSet,
    terms: &[Term],
    prefix: &[usize],
) -> Result<f64, ProfileGapError> {
    objectives
        .objectives()
        .iter()
        .zip(terms)
        .try_fold(0.0, |acc, (objective, term)| {
            let value = match term {
                Term::Exact => objective.value(composer, prefix)?,
                Term::Proxy(open) => open.iter().try_fold(0.0, |sum, s| {
                    Ok::<_, ProfileGapError>(sum + composer.accuracy_of(*s, prefix)?)
                })?,
            };
            Ok(acc + objective.weight() * value)
        })
}

pub(super) fn search(
    selector: &ModelSelector<'_>,
    mode: &SelectionMode,
    deadline: Option<Instant>,
) -> SearchOutcome {
    let graph = selector.graph();
    let objectives = selector.objectives();
    let bound = mode
        .cost_bound()
        .unwrap_or_else(|| graph.stages().iter().map(|s| s.max_cost()).sum());
    let buckets = selector.config().cost_buckets;
    let width = if bound > 0.0 {
        bound / buckets as f64
    } else {
        1.0
    };
    let terms = terms(graph, objectives);
    let last = graph.num_stages() - 1;

    let mut composer = AccuracyComposer::new(graph);
    let mut outcome = SearchOutcome::new();
    let mut layer = vec![Cell {
        prefix: vec![],
        cost: 0.0,
        score: 0.0,
    }];
    for (k, stage) in graph.stages().iter().enumerate() {
        if outcome.complete && deadline.is_some_and(|d| Instant::now() >= d) {
            warn!("deadline reached at stage {}, completing with cheapest variants", stage.name());
            outcome.complete = false;
        }
        let choices: Vec<usize> = if outcome.complete {
            (0..stage.num_variants()).collect()
        } else {
            (0..stage.num_variants())
                .position_min_by(|a, b| stage.cost(*a).total_cmp(&stage.cost(*b)))
                .into_iter()
                .collect()
        };

        let mut next: BTreeMap<usize, Cell> = BTreeMap::new();
        for cell in &layer {
            for &v in &choices {
                let cost = cell.cost + stage.cost(v);
                if !selector.may_fit(k + 1, cost, bound) {
                    continue;
                }
                let mut prefix = cell.prefix.clone();
                prefix.push(v);
                let score = match partial_score(&mut composer, objectives, &terms[k], &prefix) {
                    Ok(score) => score,
                    Err(gap) => {
                        trace!("partial assignment {prefix:?} dropped: {gap}");
                        if k == last {
                            outcome.evaluated += 1;
                            outcome.unprofiled += 1;
                        }
                        continue;
                    }
                };
                let cell = Cell {
                    prefix,
                    cost,
                    score,
                };
                let bucket = ((cost / width) as usize).min(buckets);
                match next.entry(bucket) {
                    Entry::Vacant(entry) => {
                        entry.insert(cell);
                    }
                    Entry::Occupied(mut entry) => {
                        if cell.rank(entry.get()) == Ordering::Less {
                            entry.insert(cell);
                        }
                    }
                }
            }
        }
        layer = next.into_values().collect();
        trace!("stage {}: {} cells", stage.name(), layer.len());
    }

    for cell in layer {
        if cell.cost > bound {
            continue;
        }
        outcome.evaluated += 1;
        let values = match objectives.values(&mut composer, &cell.prefix) {
            Ok(values) => values,
            Err(_) => {
                outcome.unprofiled += 1;
                continue;
            }
        };
        let candidate = Candidate {
            assignment: Assignment::new(cell.prefix),
            cost: cell.cost,
            score: objectives.weighted(&values),
            values,
        };
        outcome.offer(candidate, mode);
    }
    debug!(
        "knapsack over {buckets} buckets of width {width}: {} final cells",
        outcome.evaluated
    );
    outcome
}
