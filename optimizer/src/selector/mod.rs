//! Model selection: one variant per stage, maximizing weighted accuracy under a cost
//! budget or minimizing cost above an accuracy floor.
//!
//! Small search spaces are enumerated exhaustively with branch pruning; larger ones
//! fall back to a multi-choice knapsack over discretized costs.

use std::{
    cmp::Ordering,
    time::{Duration, Instant},
};

use derive_more::Display;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

pub use error::InfeasibleError;

use crate::{
    composer::AccuracyComposer,
    config::SearchConfig,
    objective::ObjectiveSet,
    profile::{Assignment, ProfileGraph},
};

mod error;
mod exhaustive;
mod knapsack;

/// Relative slack applied to pruning bounds so that summation order never prunes a
/// candidate whose exact cost fits.
const PRUNE_SLACK: f64 = 1e-9;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SelectionMode {
    MaximizeAccuracy {
        budget: f64,
    },
    MinimizeCost {
        accuracy_floor: f64,
        budget: Option<f64>,
    },
}

impl SelectionMode {
    /// Upper bound on the total cost of any admissible assignment.
    pub fn cost_bound(&self) -> Option<f64> {
        match *self {
            SelectionMode::MaximizeAccuracy { budget } => Some(budget),
            SelectionMode::MinimizeCost { budget, .. } => budget,
        }
    }

    pub fn admits(&self, candidate: &Candidate) -> bool {
        let within_budget = self.cost_bound().is_none_or(|b| candidate.cost <= b);
        match *self {
            SelectionMode::MaximizeAccuracy { .. } => within_budget,
            SelectionMode::MinimizeCost { accuracy_floor, .. } => {
                within_budget && candidate.score >= accuracy_floor
            }
        }
    }

    /// Total order over candidates, `Less` meaning `a` is preferred.
    ///
    /// Budget mode: higher score, then lower cost. Floor mode: lower cost, then higher
    /// score. Remaining ties go to the lexicographically smaller assignment.
    pub fn rank(&self, a: &Candidate, b: &Candidate) -> Ordering {
        let by_score = b.score.total_cmp(&a.score);
        let by_cost = a.cost.total_cmp(&b.cost);
        match self {
            SelectionMode::MaximizeAccuracy { .. } => by_score.then(by_cost),
            SelectionMode::MinimizeCost { .. } => by_cost.then(by_score),
        }
        .then_with(|| a.assignment.cmp(&b.assignment))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum SearchStrategy {
    #[display("exhaustive")]
    Exhaustive,
    #[display("knapsack")]
    Knapsack,
}

/// A fully evaluated assignment.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Candidate {
    pub assignment: Assignment,
    pub cost: f64,
    /// Weighted sum of `values`.
    pub score: f64,
    /// Accuracy of every objective, in objective order.
    pub values: Vec<f64>,
}

/// Result of model selection, before placement.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Selection {
    pub assignment: Assignment,
    pub total_cost: f64,
    pub weighted_accuracy: f64,
    pub objective_values: Vec<f64>,
    /// Composed accuracy of every stage, `None` where the profile has a gap.
    pub stage_accuracies: Vec<Option<f64>>,
    pub mode: SelectionMode,
    pub strategy: SearchStrategy,
    /// Whether every candidate within the bound was considered.
    pub exhaustive: bool,
    pub candidates_evaluated: u64,
}

/// What a search produced, before it is turned into a [`Selection`].
#[derive(Clone, Debug, Default)]
pub(crate) struct SearchOutcome {
    pub(crate) best: Option<Candidate>,
    pub(crate) evaluated: u64,
    pub(crate) unprofiled: u64,
    /// Highest score among profiled candidates within the cost bound.
    pub(crate) best_score: Option<f64>,
    pub(crate) complete: bool,
}

impl SearchOutcome {
    fn new() -> Self {
        Self {
            complete: true,
            ..Default::default()
        }
    }

    fn offer(&mut self, candidate: Candidate, mode: &SelectionMode) {
        self.best_score = Some(
            self.best_score
                .map_or(candidate.score, |s| s.max(candidate.score)),
        );
        if !mode.admits(&candidate) {
            return;
        }
        match &self.best {
            Some(best) if mode.rank(&candidate, best) != Ordering::Less => {}
            _ => self.best = Some(candidate),
        }
    }

    fn merge(mut self, other: SearchOutcome, mode: &SelectionMode) -> Self {
        self.evaluated += other.evaluated;
        self.unprofiled += other.unprofiled;
        self.complete &= other.complete;
        self.best_score = match (self.best_score, other.best_score) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        if let Some(candidate) = other.best {
            match &self.best {
                Some(best) if mode.rank(&candidate, best) != Ordering::Less => {}
                _ => self.best = Some(candidate),
            }
        }
        self
    }
}

pub struct ModelSelector<'a> {
    graph: &'a ProfileGraph,
    objectives: &'a ObjectiveSet,
    config: SearchConfig,
    /// `min_rest[k]` is the cheapest cost of stages `k..`.
    min_rest: Vec<f64>,
}

impl<'a> ModelSelector<'a> {
    pub fn new(graph: &'a ProfileGraph, objectives: &'a ObjectiveSet, config: SearchConfig) -> Self {
        let mut min_rest = vec![0.0f64; graph.num_stages() + 1];
        for (k, stage) in graph.stages().iter().enumerate().rev() {
            min_rest[k] = min_rest[k + 1] + stage.min_cost();
        }
        Self {
            graph,
            objectives,
            config,
            min_rest,
        }
    }

    pub fn graph(&self) -> &'a ProfileGraph {
        self.graph
    }

    pub fn objectives(&self) -> &'a ObjectiveSet {
        self.objectives
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Strategy used by [`Self::select`].
    pub fn strategy(&self) -> SearchStrategy {
        self.config.strategy.unwrap_or_else(|| {
            if self.graph.search_space() <= u128::from(self.config.exhaustive_limit) {
                SearchStrategy::Exhaustive
            } else {
                SearchStrategy::Knapsack
            }
        })
    }

    /// Whether a partial assignment over the first `k` stages at `cost` can still
    /// complete under `bound`.
    fn may_fit(&self, k: usize, cost: f64, bound: f64) -> bool {
        cost + self.min_rest[k] <= bound + PRUNE_SLACK * bound.abs().max(1.0)
    }

    #[instrument(name = "ModelSelector::select", skip_all, level = "debug")]
    pub fn select(&self, mode: SelectionMode) -> Result<Selection, InfeasibleError> {
        let (cheapest, min_cost) = self.graph.min_cost_assignment();
        if let Some(budget) = mode.cost_bound() {
            if min_cost > budget {
                return Err(InfeasibleError::Budget {
                    budget,
                    min_cost,
                    cheapest: cheapest.describe(self.graph),
                });
            }
        }

        let deadline = self
            .config
            .deadline_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let strategy = self.strategy();
        info!(
            "searching {} assignments of {} stages ({strategy})",
            self.graph.search_space(),
            self.graph.num_stages()
        );
        let outcome = match strategy {
            SearchStrategy::Exhaustive => exhaustive::search(self, &mode, deadline),
            SearchStrategy::Knapsack => knapsack::search(self, &mode, deadline),
        };
        debug!(
            "evaluated {} candidates, {} hit a profile gap",
            outcome.evaluated, outcome.unprofiled
        );

        let Some(best) = outcome.best else {
            if outcome.best_score.is_none() && outcome.unprofiled > 0 {
                return Err(InfeasibleError::Unprofiled {
                    candidates: outcome.unprofiled,
                });
            }
            return Err(match mode {
                SelectionMode::MinimizeCost { accuracy_floor, .. } => {
                    InfeasibleError::AccuracyFloor {
                        floor: accuracy_floor,
                        best_accuracy: outcome.best_score,
                    }
                }
                SelectionMode::MaximizeAccuracy { budget } => InfeasibleError::Budget {
                    budget,
                    min_cost,
                    cheapest: cheapest.describe(self.graph),
                },
            });
        };

        let mut composer = AccuracyComposer::new(self.graph);
        let stage_accuracies = composer.stage_accuracies(&best.assignment);
        info!(
            "selected {} (accuracy {}, cost {})",
            best.assignment
                .describe(self.graph)
                .iter()
                .map(|(stage, variant)| format!("{stage}={variant}"))
                .collect::<Vec<_>>()
                .join(", "),
            best.score,
            best.cost
        );
        Ok(Selection {
            total_cost: best.cost,
            weighted_accuracy: best.score,
            objective_values: best.values,
            assignment: best.assignment,
            stage_accuracies,
            mode,
            strategy,
            exhaustive: strategy == SearchStrategy::Exhaustive && outcome.complete,
            candidates_evaluated: outcome.evaluated,
        })
    }

    /// Cost/accuracy Pareto frontier over every profiled assignment, by ascending cost.
    #[instrument(name = "ModelSelector::frontier", skip_all, level = "debug")]
    pub fn frontier(&self) -> Vec<Candidate> {
        exhaustive::frontier(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        objective::ObjectiveSpec,
        profile::{AccuracySample, OperatorAccuracyProfile, ProfileRecords, ProfileStore},
        testing::{self, ASR, FUSION, IMAGE, VQA_E2E},
    };
    use rstest::rstest;

    fn budget(budget: f64) -> SelectionMode {
        SelectionMode::MaximizeAccuracy { budget }
    }

    fn select(
        graph: &ProfileGraph,
        mode: SelectionMode,
        config: SearchConfig,
    ) -> Result<Selection, InfeasibleError> {
        let objectives = ObjectiveSet::resolve(graph, &[ObjectiveSpec::new(VQA_E2E, 1.0)]).unwrap();
        ModelSelector::new(graph, &objectives, config).select(mode)
    }

    fn names(graph: &ProfileGraph, selection: &Selection) -> Vec<String> {
        selection
            .assignment
            .describe(graph)
            .into_iter()
            .map(|(_, variant)| variant)
            .collect()
    }

    #[rstest]
    #[case(SearchStrategy::Exhaustive)]
    #[case(SearchStrategy::Knapsack)]
    fn test_full_budget_selects_best_pair(#[case] strategy: SearchStrategy) {
        let graph = testing::vqa_graph();
        let selection =
            select(&graph, budget(52.10), SearchConfig::default().with_strategy(strategy)).unwrap();
        assert_eq!(
            names(&graph, &selection),
            vec!["resnet152", "wav2vec2-large-960h-lv60-self", "default"]
        );
        assert_eq!(selection.weighted_accuracy, 58.33);
        assert!((selection.total_cost - 52.09481051).abs() < 1e-6);
        assert_eq!(selection.strategy, strategy);
        assert_eq!(selection.exhaustive, strategy == SearchStrategy::Exhaustive);
        assert_eq!(
            selection.stage_accuracies,
            vec![Some(94.046), Some(-1.8621), Some(58.33)]
        );
    }

    #[rstest]
    #[case(SearchStrategy::Exhaustive)]
    #[case(SearchStrategy::Knapsack)]
    fn test_tighter_budget(#[case] strategy: SearchStrategy) {
        let graph = testing::vqa_graph();
        let selection =
            select(&graph, budget(50.0), SearchConfig::default().with_strategy(strategy)).unwrap();
        assert_eq!(
            names(&graph, &selection),
            vec!["resnet101", "wav2vec2-large-960h-lv60-self", "default"]
        );
        assert_eq!(selection.weighted_accuracy, 58.19);
        assert!((selection.total_cost - 45.267510564833).abs() < 1e-6);
    }

    #[test]
    fn test_budget_below_cheapest_assignment() {
        let graph = testing::vqa_graph();
        let err = select(&graph, budget(18.0), SearchConfig::default()).unwrap_err();
        match err {
            InfeasibleError::Budget {
                budget,
                min_cost,
                cheapest,
            } => {
                assert_eq!(budget, 18.0);
                assert!((min_cost - testing::MIN_TOTAL_COST).abs() < 1e-9);
                assert_eq!(cheapest[0], (IMAGE.to_string(), "resnet18".to_string()));
                assert_eq!(cheapest[1], (ASR.to_string(), "wav2vec2-base-960h".to_string()));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_optimum_is_monotone_in_budget() {
        let graph = testing::vqa_graph();
        let budgets = [18.74, 20.0, 25.0, 30.0, 35.0, 37.0, 40.0, 45.0, 50.0, 52.1, 100.0];
        let scores = budgets
            .iter()
            .map(|b| {
                select(&graph, budget(*b), SearchConfig::default())
                    .unwrap()
                    .weighted_accuracy
            })
            .collect::<Vec<_>>();
        assert!(scores.windows(2).all(|w| w[0] <= w[1]), "{scores:?}");
        assert_eq!(scores[0], 53.02);
        assert_eq!(scores[scores.len() - 1], 58.33);
    }

    #[test]
    fn test_knapsack_agrees_with_exhaustive() {
        let graph = testing::vqa_graph();
        for b in [20.0, 28.0, 33.0, 38.7, 41.0, 47.5, 52.1] {
            let exhaustive = select(
                &graph,
                budget(b),
                SearchConfig::default().with_strategy(SearchStrategy::Exhaustive),
            )
            .unwrap();
            let knapsack = select(
                &graph,
                budget(b),
                SearchConfig::default().with_strategy(SearchStrategy::Knapsack),
            )
            .unwrap();
            assert_eq!(exhaustive.assignment, knapsack.assignment, "budget {b}");
            assert_eq!(exhaustive.weighted_accuracy, knapsack.weighted_accuracy);
        }
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(4)]
    fn test_coarse_buckets_stay_feasible_and_below_optimum(#[case] cost_buckets: usize) {
        let graph = testing::vqa_graph();
        let mut coarse = SearchConfig::default().with_strategy(SearchStrategy::Knapsack);
        coarse.cost_buckets = cost_buckets;
        let mut lost = false;
        for b in [25.0, 30.0, 40.0, 45.0, 50.0, 52.1] {
            let exhaustive = select(
                &graph,
                budget(b),
                SearchConfig::default().with_strategy(SearchStrategy::Exhaustive),
            )
            .unwrap();
            let knapsack = select(&graph, budget(b), coarse.clone()).unwrap();
            assert!(knapsack.total_cost <= b, "budget {b}");
            assert!(!knapsack.exhaustive);
            assert_eq!(knapsack.strategy, SearchStrategy::Knapsack);
            assert!(
                knapsack.weighted_accuracy <= exhaustive.weighted_accuracy,
                "budget {b}: {} above the optimum {}",
                knapsack.weighted_accuracy,
                exhaustive.weighted_accuracy
            );
            lost |= knapsack.weighted_accuracy < exhaustive.weighted_accuracy;
        }
        // colliding buckets drop partial assignments the optimum needs
        assert!(lost);
    }

    #[rstest]
    #[case(SearchStrategy::Exhaustive)]
    #[case(SearchStrategy::Knapsack)]
    fn test_floor_mode_picks_cheapest_above_floor(#[case] strategy: SearchStrategy) {
        let graph = testing::vqa_graph();
        let config = SearchConfig::default().with_strategy(strategy);
        let mode = SelectionMode::MinimizeCost {
            accuracy_floor: 56.0,
            budget: None,
        };
        let selection = select(&graph, mode, config.clone()).unwrap();
        // the most accurate image model paired with the cheapest recognizer
        assert_eq!(
            names(&graph, &selection),
            vec!["resnet152", "wav2vec2-base-960h", "default"]
        );
        assert_eq!(selection.weighted_accuracy, 56.08);

        let mode = SelectionMode::MinimizeCost {
            accuracy_floor: 58.0,
            budget: None,
        };
        let selection = select(&graph, mode, config.clone()).unwrap();
        assert_eq!(
            names(&graph, &selection),
            vec!["resnet101", "wav2vec2-large-960h-lv60-self", "default"]
        );

        let mode = SelectionMode::MinimizeCost {
            accuracy_floor: 58.0,
            budget: Some(45.0),
        };
        assert_eq!(
            select(&graph, mode, config).unwrap_err(),
            InfeasibleError::AccuracyFloor {
                floor: 58.0,
                best_accuracy: Some(57.94),
            }
        );
    }

    #[test]
    fn test_unreachable_floor_reports_best_accuracy() {
        let graph = testing::vqa_graph();
        let mode = SelectionMode::MinimizeCost {
            accuracy_floor: 60.0,
            budget: None,
        };
        assert_eq!(
            select(&graph, mode, SearchConfig::default()).unwrap_err(),
            InfeasibleError::AccuracyFloor {
                floor: 60.0,
                best_accuracy: Some(58.33),
            }
        );
    }

    #[test]
    fn test_equal_scores_prefer_cheaper_then_lexicographic() {
        // a1 and a2 compose to the same accuracy, a2 is cheaper
        let records = ProfileRecords::new(
            vec![
                OperatorAccuracyProfile::leaf(
                    "A",
                    [("a1", 10.0, 2.0), ("a2", 20.0, 1.0), ("a3", 30.0, 1.0)],
                ),
                OperatorAccuracyProfile::fusion(
                    "F",
                    &["A"],
                    0.0,
                    vec![
                        AccuracySample::new(vec![10.0], 50.0),
                        AccuracySample::new(vec![20.0], 50.0),
                        AccuracySample::new(vec![30.0], 50.0),
                    ],
                ),
            ],
            vec![],
        );
        let graph = ProfileStore::load(records).unwrap();
        let objectives = ObjectiveSet::sinks(&graph);
        let selector = ModelSelector::new(&graph, &objectives, SearchConfig::default());
        let selection = selector.select(budget(10.0)).unwrap();
        // a2 and a3 tie on score and cost, a2 comes first
        assert_eq!(selection.assignment.variant(graph.stage_id("A").unwrap()), 1);
        assert_eq!(selection.total_cost, 1.0);
    }

    #[test]
    fn test_profile_gap_only_drops_the_candidate() {
        let records = ProfileRecords::new(
            vec![
                OperatorAccuracyProfile::leaf("A", [("a1", 10.0, 1.0), ("a2", 20.0, 2.0)]),
                OperatorAccuracyProfile::fusion(
                    "F",
                    &["A"],
                    0.0,
                    vec![
                        AccuracySample::new(vec![10.0], 50.0),
                        AccuracySample::new(vec![25.0], 90.0),
                    ],
                ),
            ],
            vec![],
        );
        let graph = ProfileStore::load(records).unwrap();
        let objectives = ObjectiveSet::sinks(&graph);
        let selector = ModelSelector::new(&graph, &objectives, SearchConfig::default());
        let selection = selector.select(budget(10.0)).unwrap();
        assert_eq!(selection.weighted_accuracy, 50.0);
        assert_eq!(selection.candidates_evaluated, 2);

        // only the gapped candidate fits
        let records = ProfileRecords::new(
            vec![
                OperatorAccuracyProfile::leaf("A", [("a1", 20.0, 1.0)]),
                OperatorAccuracyProfile::fusion(
                    "F",
                    &["A"],
                    0.0,
                    vec![AccuracySample::new(vec![25.0], 90.0)],
                ),
            ],
            vec![],
        );
        let graph = ProfileStore::load(records).unwrap();
        let objectives = ObjectiveSet::sinks(&graph);
        let selector = ModelSelector::new(&graph, &objectives, SearchConfig::default());
        assert_eq!(
            selector.select(budget(10.0)).unwrap_err(),
            InfeasibleError::Unprofiled { candidates: 1 }
        );
    }

    #[test]
    fn test_default_objective_matches_end_to_end() {
        let graph = testing::vqa_graph();
        let objectives = ObjectiveSet::resolve(&graph, &[]).unwrap();
        let selector = ModelSelector::new(&graph, &objectives, SearchConfig::default());
        let selection = selector.select(budget(52.1)).unwrap();
        assert_eq!(selection.objective_values, vec![58.33]);
        assert_eq!(objectives.objectives()[0].name(), FUSION);
    }

    #[test]
    fn test_strategy_follows_exhaustive_limit() {
        let graph = testing::vqa_graph();
        let objectives = ObjectiveSet::sinks(&graph);
        let config = SearchConfig {
            exhaustive_limit: 14,
            ..Default::default()
        };
        let selector = ModelSelector::new(&graph, &objectives, config);
        assert_eq!(selector.strategy(), SearchStrategy::Knapsack);
        let selection = selector.select(budget(52.1)).unwrap();
        assert!(!selection.exhaustive);
        assert_eq!(selection.weighted_accuracy, 58.33);
    }

    #[test]
    fn test_expired_deadline_returns_a_feasible_assignment() {
        let graph = testing::vqa_graph();
        let config = SearchConfig {
            deadline_ms: Some(0),
            ..Default::default()
        };
        let selection = select(&graph, budget(52.1), config).unwrap();
        assert!(!selection.exhaustive);
        assert!(selection.total_cost <= 52.1);
    }

    #[test]
    fn test_frontier() {
        let graph = testing::vqa_graph();
        let objectives = ObjectiveSet::resolve(&graph, &[ObjectiveSpec::new(VQA_E2E, 1.0)]).unwrap();
        let selector = ModelSelector::new(&graph, &objectives, SearchConfig::default());
        let frontier = selector.frontier();
        assert_eq!(frontier.first().map(|c| c.score), Some(53.02));
        assert_eq!(frontier.last().map(|c| c.score), Some(58.33));
        assert!(
            frontier
                .windows(2)
                .all(|w| w[0].cost < w[1].cost && w[0].score < w[1].score)
        );
        // every budget optimum lies on the frontier
        for candidate in &frontier {
            let selection = selector.select(budget(candidate.cost)).unwrap();
            assert_eq!(selection.assignment, candidate.assignment);
        }
    }
}
