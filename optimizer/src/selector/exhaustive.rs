//! Depth-first enumeration of every assignment within the cost bound.
//!
//! The search is split on the variants of the first stage with a choice. Each branch
//! runs on its own rayon task with its own composer, and branch results are merged in
//! branch order, so the outcome does not depend on scheduling.

use std::time::Instant;

use itertools::Itertools;
use rayon::prelude::*;
use tracing::trace;

use super::{Candidate, ModelSelector, SearchOutcome, SelectionMode};
use crate::{composer::AccuracyComposer, profile::Assignment};

pub(super) fn search(
    selector: &ModelSelector<'_>,
    mode: &SelectionMode,
    deadline: Option<Instant>,
) -> SearchOutcome {
    let graph = selector.graph();
    let branches = match graph.stages().iter().position(|s| s.num_variants() > 1) {
        Some(split) => (0..graph.stages()[split].num_variants())
            .map(|v| {
                let mut prefix = vec![0; split];
                prefix.push(v);
                prefix
            })
            .collect(),
        None => vec![vec![]],
    };
    trace!("exhaustive search over {} branches", branches.len());
    branches
        .into_par_iter()
        .map(|prefix| Branch::new(selector, mode, deadline).run(prefix))
        .collect::<Vec<_>>()
        .into_iter()
        .fold(SearchOutcome::new(), |acc, outcome| acc.merge(outcome, mode))
}

struct Branch<'s, 'a> {
    selector: &'s ModelSelector<'a>,
    composer: AccuracyComposer<'a>,
    mode: &'s SelectionMode,
    bound: f64,
    deadline: Option<Instant>,
    assignment: Vec<usize>,
    outcome: SearchOutcome,
    stopped: bool,
}

impl<'s, 'a> Branch<'s, 'a> {
    fn new(
        selector: &'s ModelSelector<'a>,
        mode: &'s SelectionMode,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            selector,
            composer: AccuracyComposer::new(selector.graph()),
            mode,
            bound: mode.cost_bound().unwrap_or(f64::INFINITY),
            deadline,
            assignment: Vec::with_capacity(selector.graph().num_stages()),
            outcome: SearchOutcome::new(),
            stopped: false,
        }
    }

    fn run(mut self, prefix: Vec<usize>) -> SearchOutcome {
        let stages = self.selector.graph().stages();
        let cost = prefix
            .iter()
            .zip(stages)
            .fold(0.0, |acc, (v, stage)| acc + stage.cost(*v));
        self.assignment = prefix;
        self.descend(cost);
        self.outcome.complete = !self.stopped;
        self.outcome
    }

    fn descend(&mut self, cost: f64) {
        let k = self.assignment.len();
        if !self.selector.may_fit(k, cost, self.bound) {
            return;
        }
        // in floor mode nothing costlier than the incumbent can win
        if let (SelectionMode::MinimizeCost { .. }, Some(best)) = (self.mode, &self.outcome.best) {
            if !self.selector.may_fit(k, cost, best.cost) {
                return;
            }
        }
        let graph = self.selector.graph();
        if k == graph.num_stages() {
            self.evaluate(cost);
            return;
        }
        let stage = &graph.stages()[k];
        for v in 0..stage.num_variants() {
            self.assignment.push(v);
            self.descend(cost + stage.cost(v));
            self.assignment.pop();
            if self.stopped {
                return;
            }
        }
    }

    fn evaluate(&mut self, cost: f64) {
        if cost > self.bound {
            return;
        }
        self.outcome.evaluated += 1;
        let values = match self
            .selector
            .objectives()
            .values(&mut self.composer, &self.assignment)
        {
            Ok(values) => values,
            Err(gap) => {
                trace!("candidate {:?} dropped: {gap}", self.assignment);
                self.outcome.unprofiled += 1;
                return;
            }
        };
        let candidate = Candidate {
            assignment: Assignment::new(self.assignment.clone()),
            cost,
            score: self.selector.objectives().weighted(&values),
            values,
        };
        self.outcome.offer(candidate, self.mode);
        if self.outcome.best.is_some() && self.deadline.is_some_and(|d| Instant::now() >= d) {
            self.stopped = true;
        }
    }
}

/// Every profiled assignment reduced to its cost/accuracy Pareto frontier.
pub(super) fn frontier(selector: &ModelSelector<'_>) -> Vec<Candidate> {
    let graph = selector.graph();
    let objectives = selector.objectives();
    let mut candidates = graph
        .stages()
        .iter()
        .map(|s| 0..s.num_variants())
        .multi_cartesian_product()
        .par_bridge()
        .map_init(
            || AccuracyComposer::new(graph),
            |composer, variants| {
                let values = objectives.values(composer, &variants).ok()?;
                let assignment = Assignment::new(variants);
                Some(Candidate {
                    cost: assignment.cost(graph),
                    score: objectives.weighted(&values),
                    assignment,
                    values,
                })
            },
        )
        .flatten()
        .collect::<Vec<_>>();
    candidates.sort_by(|a, b| {
        a.cost
            .total_cmp(&b.cost)
            .then(b.score.total_cmp(&a.score))
            .then_with(|| a.assignment.cmp(&b.assignment))
    });
    let mut best = f64::NEG_INFINITY;
    candidates
        .into_iter()
        .filter(|c| {
            let keep = c.score > best;
            best = best.max(c.score);
            keep
        })
        .collect()
}
