//! Accuracy composition over the stage DAG.
//!
//! The accuracy of a composite stage is looked up, never computed: the upstream
//! accuracies are resolved recursively and must match one profiled sample exactly.

use std::collections::HashMap;

use tracing::trace;

use crate::profile::{EndToEndProfile, ProfileGraph, StageId, StageKind, ValidationError};

/// A composite stage was asked for an upstream accuracy combination that was never profiled.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("stage `{stage}` (variant `{variant}`) has no profiled sample for input accuracies {inputs_acc:?}")]
pub struct ProfileGapError {
    pub stage: String,
    pub variant: String,
    pub inputs_acc: Vec<f64>,
}

/// Memoized accuracy lookups for one optimization run.
///
/// Entries are keyed by the stage and the assignment restricted to the stage's
/// dependency closure, so candidates sharing an upstream sub-assignment share work.
#[derive(Debug)]
pub struct AccuracyComposer<'a> {
    graph: &'a ProfileGraph,
    memo: HashMap<(StageId, Vec<usize>), Result<f64, ProfileGapError>>,
    hits: usize,
}

impl<'a> AccuracyComposer<'a> {
    pub fn new(graph: &'a ProfileGraph) -> Self {
        Self {
            graph,
            memo: HashMap::new(),
            hits: 0,
        }
    }

    pub fn graph(&self) -> &'a ProfileGraph {
        self.graph
    }

    /// Accuracy at `stage` when every stage of its closure runs the variant chosen by
    /// `assignment` (indexed by [`StageId`]; entries past `stage` are never read).
    pub fn accuracy_of(
        &mut self,
        stage: StageId,
        assignment: &[usize],
    ) -> Result<f64, ProfileGapError> {
        let graph = self.graph;
        let node = graph.stage(stage);
        let variant = assignment[stage.index()];
        let (inputs, samples) = match node.kind() {
            StageKind::Leaf { accuracy } => return Ok(accuracy[variant]),
            StageKind::Composite { inputs, samples } => (inputs, &samples[variant]),
        };

        let key = (
            stage,
            node.closure()
                .iter()
                .map(|s| assignment[s.index()])
                .collect::<Vec<_>>(),
        );
        if let Some(cached) = self.memo.get(&key) {
            self.hits += 1;
            return cached.clone();
        }

        let result = inputs
            .iter()
            .map(|upstream| self.accuracy_of(*upstream, assignment))
            .collect::<Result<Vec<_>, _>>()
            .and_then(|inputs_acc| {
                samples
                    .iter()
                    .find(|s| s.inputs_acc == inputs_acc)
                    .map(|s| s.output_acc)
                    .ok_or_else(|| ProfileGapError {
                        stage: node.name().to_string(),
                        variant: node.variant(variant).to_string(),
                        inputs_acc,
                    })
            });
        if let Err(gap) = &result {
            trace!("{gap}");
        }
        self.memo.insert(key, result.clone());
        result
    }

    /// Accuracy of every stage of `assignment`, `None` where the profile has a gap.
    pub fn stage_accuracies(&mut self, assignment: &[usize]) -> Vec<Option<f64>> {
        self.graph
            .stages()
            .iter()
            .map(|s| self.accuracy_of(s.id(), assignment).ok())
            .collect()
    }

    /// Checks that every cached entry of `profile` equals recursive composition at its
    /// sink. Entries whose composition hits a profile gap are skipped. Returns the number
    /// of entries compared.
    pub fn check_end_to_end(&mut self, profile: &EndToEndProfile) -> Result<usize, ValidationError> {
        let sink = profile.sink();
        let mut checked = 0;
        for (key, cached) in profile.entries() {
            // every non-leaf stage under the sink has a single variant, index 0
            let mut assignment = vec![0; sink.index() + 1];
            for (op, variant) in profile.operators().iter().zip(key) {
                assignment[op.index()] = *variant;
            }
            let composed = match self.accuracy_of(sink, &assignment) {
                Ok(composed) => composed,
                Err(_) => continue,
            };
            if composed != cached {
                return Err(ValidationError::EndToEndMismatch {
                    profile: profile.name().to_string(),
                    sink: self.graph.stage(sink).name().to_string(),
                    key: profile
                        .operators()
                        .iter()
                        .zip(key)
                        .map(|(op, v)| self.graph.stage(*op).variant(*v).to_string())
                        .collect(),
                    cached,
                    composed,
                });
            }
            checked += 1;
        }
        Ok(checked)
    }

    /// Number of lookups answered from the memo.
    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn memo_len(&self) -> usize {
        self.memo.len()
    }
}
