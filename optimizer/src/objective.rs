//! Weighted accuracy objectives.
//!
//! An objective is named by the caller and resolved against the profile graph: an
//! end-to-end profile of that name wins, otherwise the stage of that name.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    composer::{AccuracyComposer, ProfileGapError},
    profile::{ProfileGraph, StageId, ValidationError},
};

/// Objective as written in the configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ObjectiveSpec {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl ObjectiveSpec {
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectiveTarget {
    /// Index into [`ProfileGraph::end_to_end_profiles`].
    EndToEnd(usize),
    Stage(StageId),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Objective {
    name: String,
    weight: f64,
    target: ObjectiveTarget,
    root: StageId,
}

impl Objective {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn target(&self) -> ObjectiveTarget {
        self.target
    }

    /// Stage whose dependency closure fully determines this objective.
    pub fn root(&self) -> StageId {
        self.root
    }

    /// Accuracy of this objective under `assignment`. Only stages up to [`Self::root`]
    /// are read, so a prefix of a full assignment is enough.
    pub fn value(
        &self,
        composer: &mut AccuracyComposer<'_>,
        assignment: &[usize],
    ) -> Result<f64, ProfileGapError> {
        match self.target {
            ObjectiveTarget::EndToEnd(i) => {
                let profile = &composer.graph().end_to_end_profiles()[i];
                match profile.lookup(assignment) {
                    Some(accuracy) => Ok(accuracy),
                    None => composer.accuracy_of(profile.sink(), assignment),
                }
            }
            ObjectiveTarget::Stage(stage) => composer.accuracy_of(stage, assignment),
        }
    }
}

/// The objectives of one run, in configuration order.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectiveSet {
    objectives: Vec<Objective>,
}

impl ObjectiveSet {
    /// Resolves `specs` against `graph`. An empty list means [`Self::sinks`].
    pub fn resolve(graph: &ProfileGraph, specs: &[ObjectiveSpec]) -> Result<Self, ValidationError> {
        if specs.is_empty() {
            return Ok(Self::sinks(graph));
        }
        let objectives = specs
            .iter()
            .map(|spec| {
                if !spec.weight.is_finite() || spec.weight < 0.0 {
                    return Err(ValidationError::InvalidWeight {
                        name: spec.name.clone(),
                        weight: spec.weight,
                    });
                }
                let (target, root) = if let Some(i) = graph
                    .end_to_end_profiles()
                    .iter()
                    .position(|p| p.name() == spec.name)
                {
                    (
                        ObjectiveTarget::EndToEnd(i),
                        graph.end_to_end_profiles()[i].sink(),
                    )
                } else if let Some(stage) = graph.stage_id(&spec.name) {
                    (ObjectiveTarget::Stage(stage), stage)
                } else {
                    return Err(ValidationError::UnknownObjective {
                        name: spec.name.clone(),
                    });
                };
                Ok(Objective {
                    name: spec.name.clone(),
                    weight: spec.weight,
                    target,
                    root,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!(
            "resolved objectives: {}",
            objectives
                .iter()
                .map(|o| format!("{}x{}", o.weight, o.name))
                .collect::<Vec<_>>()
                .join(" + ")
        );
        Ok(Self { objectives })
    }

    /// Every sink stage, weighted by the stage weight.
    pub fn sinks(graph: &ProfileGraph) -> Self {
        Self {
            objectives: graph
                .sinks()
                .map(|s| Objective {
                    name: s.name().to_string(),
                    weight: s.weight(),
                    target: ObjectiveTarget::Stage(s.id()),
                    root: s.id(),
                })
                .collect(),
        }
    }

    pub fn objectives(&self) -> &[Objective] {
        &self.objectives
    }

    pub fn len(&self) -> usize {
        self.objectives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objectives.is_empty()
    }

    /// Accuracy of every objective, in order.
    pub fn values(
        &self,
        composer: &mut AccuracyComposer<'_>,
        assignment: &[usize],
    ) -> Result<Vec<f64>, ProfileGapError> {
        self.objectives
            .iter()
            .map(|o| o.value(composer, assignment))
            .collect()
    }

    /// Weighted sum of the objective accuracies, accumulated in objective order.
    pub fn score(
        &self,
        composer: &mut AccuracyComposer<'_>,
        assignment: &[usize],
    ) -> Result<f64, ProfileGapError> {
        self.objectives.iter().try_fold(0.0, |acc, o| {
            Ok(acc + o.weight * o.value(composer, assignment)?)
        })
    }

    pub fn weighted(&self, values: &[f64]) -> f64 {
        self.objectives
            .iter()
            .zip(values)
            .fold(0.0, |acc, (o, v)| acc + o.weight * v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, ASR, FUSION, IMAGE, VQA_E2E};
    use rstest::rstest;

    #[test]
    fn test_default_objectives_are_sinks() {
        let graph = testing::vqa_graph();
        let objectives = ObjectiveSet::resolve(&graph, &[]).unwrap();
        assert_eq!(objectives.len(), 1);
        let sink = &objectives.objectives()[0];
        assert_eq!(sink.name(), FUSION);
        assert_eq!(sink.weight(), 1.0);
        assert_eq!(sink.target(), ObjectiveTarget::Stage(graph.stage_id(FUSION).unwrap()));
    }

    #[test]
    fn test_end_to_end_name_wins() {
        let graph = testing::vqa_graph();
        let objectives = ObjectiveSet::resolve(&graph, &[ObjectiveSpec::new(VQA_E2E, 2.0)]).unwrap();
        let objective = &objectives.objectives()[0];
        assert_eq!(objective.target(), ObjectiveTarget::EndToEnd(0));
        assert_eq!(objective.root(), graph.stage_id(FUSION).unwrap());

        let mut composer = AccuracyComposer::new(&graph);
        let assignment = graph
            .assignment([(IMAGE, "resnet152"), (ASR, "wav2vec2-large-960h-lv60-self")])
            .unwrap();
        assert_eq!(objectives.values(&mut composer, &assignment), Ok(vec![58.33]));
        assert_eq!(objectives.score(&mut composer, &assignment), Ok(2.0 * 58.33));
        // the cache answered, nothing was composed
        assert_eq!(composer.memo_len(), 0);
    }

    #[test]
    fn test_stage_objectives_are_summed() {
        let graph = testing::vqa_graph();
        let objectives = ObjectiveSet::resolve(
            &graph,
            &[ObjectiveSpec::new(FUSION, 1.0), ObjectiveSpec::new(IMAGE, 0.5)],
        )
        .unwrap();
        let mut composer = AccuracyComposer::new(&graph);
        let assignment = graph
            .assignment([(IMAGE, "resnet50"), (ASR, "wav2vec2-large-960h-lv60-self")])
            .unwrap();
        assert_eq!(
            objectives.values(&mut composer, &assignment),
            Ok(vec![57.94, 92.866])
        );
        assert_eq!(
            objectives.score(&mut composer, &assignment),
            Ok(57.94 + 0.5 * 92.866)
        );
        assert_eq!(objectives.weighted(&[57.94, 92.866]), 57.94 + 0.5 * 92.866);
    }

    #[rstest]
    #[case(ObjectiveSpec::new("Detector", 1.0))]
    #[case(ObjectiveSpec::new(FUSION, -0.5))]
    #[case(ObjectiveSpec::new(FUSION, f64::NAN))]
    fn test_bad_objectives_are_rejected(#[case] spec: ObjectiveSpec) {
        let graph = testing::vqa_graph();
        let err = ObjectiveSet::resolve(&graph, &[spec]).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::UnknownObjective { .. } | ValidationError::InvalidWeight { .. }
        ));
    }
}
