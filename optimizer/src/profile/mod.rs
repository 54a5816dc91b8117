//! Profile store: validates profiler records into an immutable [`ProfileGraph`].
//!
//! Stages are stored in topological order (leaves first, ties broken by name), so a
//! [`StageId`] is also the stage's position in that order. Variants of a stage are
//! sorted by name and addressed by their index.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    ops::Deref,
    path::Path,
};

use derive_more::{Display, From};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

pub use error::{CyclicDependencyError, ProfileError, ValidationError};
pub use record::{
    AccuracySample, DEFAULT_VARIANT, EndToEndAccuracyProfile, OperatorAccuracyProfile,
    ProfileRecords, parse_variant_tuple,
};

mod error;
mod record;

/// Name of a stage implementation.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From,
)]
#[serde(transparent)]
pub struct VariantId(String);

impl VariantId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the single implementation of a composite stage.
    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_VARIANT
    }
}

impl From<&str> for VariantId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Position of a stage in topological order.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
pub struct StageId(usize);

impl StageId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Variant {
    pub id: VariantId,
    pub cost: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StageKind {
    /// No upstream dependency; one standalone accuracy per variant.
    Leaf { accuracy: Vec<f64> },
    /// Accuracy is a profiled function of the upstream accuracies; one sample list per variant.
    Composite {
        inputs: Vec<StageId>,
        samples: Vec<Vec<AccuracySample>>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Stage {
    id: StageId,
    name: String,
    variants: Vec<Variant>,
    kind: StageKind,
    weight: f64,
    // this stage and everything it transitively depends on, sorted
    closure: Vec<StageId>,
    consumers: Vec<StageId>,
}

impl Stage {
    pub fn id(&self) -> StageId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &StageKind {
        &self.kind
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn variants(&self) -> &[Variant] {
        &self.variants
    }

    pub fn num_variants(&self) -> usize {
        self.variants.len()
    }

    pub fn variant(&self, index: usize) -> &VariantId {
        &self.variants[index].id
    }

    pub fn variant_index(&self, name: &str) -> Option<usize> {
        self.variants
            .binary_search_by(|v| v.id.as_str().cmp(name))
            .ok()
    }

    pub fn cost(&self, index: usize) -> f64 {
        self.variants[index].cost
    }

    pub fn min_cost(&self) -> f64 {
        self.variants
            .iter()
            .map(|v| v.cost)
            .fold(f64::INFINITY, f64::min)
    }

    pub fn max_cost(&self) -> f64 {
        self.variants
            .iter()
            .map(|v| v.cost)
            .fold(f64::NEG_INFINITY, f64::max)
    }

    /// Upstream stages in positional order, empty for a leaf.
    pub fn inputs(&self) -> &[StageId] {
        match &self.kind {
            StageKind::Leaf { .. } => &[],
            StageKind::Composite { inputs, .. } => inputs,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, StageKind::Leaf { .. })
    }

    /// Stages this one transitively depends on, itself included, in ascending order.
    pub fn closure(&self) -> &[StageId] {
        &self.closure
    }

    pub fn consumers(&self) -> &[StageId] {
        &self.consumers
    }

    /// A stage no other stage consumes.
    pub fn is_sink(&self) -> bool {
        self.consumers.is_empty()
    }
}

/// Validated end-to-end profile, keyed by variant indices of its leaf operators.
#[derive(Clone, Debug, PartialEq)]
pub struct EndToEndProfile {
    name: String,
    operators: Vec<StageId>,
    sink: StageId,
    table: BTreeMap<Vec<usize>, f64>,
}

impl EndToEndProfile {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operators(&self) -> &[StageId] {
        &self.operators
    }

    pub fn sink(&self) -> StageId {
        self.sink
    }

    pub fn entries(&self) -> impl Iterator<Item = (&[usize], f64)> {
        self.table.iter().map(|(k, v)| (k.as_slice(), *v))
    }

    /// Cached accuracy for the leaf variants chosen by `assignment`, if profiled.
    pub fn lookup(&self, assignment: &[usize]) -> Option<f64> {
        let key = self
            .operators
            .iter()
            .map(|s| assignment[s.index()])
            .collect::<Vec<_>>();
        self.table.get(&key).copied()
    }
}

/// One variant index per stage, indexed by [`StageId`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Assignment(Vec<usize>);

impl Assignment {
    pub fn new(variants: Vec<usize>) -> Self {
        Self(variants)
    }

    pub fn variant(&self, stage: StageId) -> usize {
        self.0[stage.index()]
    }

    /// Sum of the assigned variants' costs, accumulated in stage order.
    pub fn cost(&self, graph: &ProfileGraph) -> f64 {
        graph
            .stages()
            .iter()
            .zip(&self.0)
            .fold(0.0, |acc, (stage, &v)| acc + stage.cost(v))
    }

    /// `(stage, variant)` names in stage order.
    pub fn describe(&self, graph: &ProfileGraph) -> Vec<(String, String)> {
        graph
            .stages()
            .iter()
            .zip(&self.0)
            .map(|(stage, &v)| (stage.name().to_string(), stage.variant(v).to_string()))
            .collect()
    }

    pub fn into_inner(self) -> Vec<usize> {
        self.0
    }
}

impl Deref for Assignment {
    type Target = [usize];

    fn deref(&self) -> &[usize] {
        &self.0
    }
}

/// Read-only, validated view over all profiles of one optimization run.
#[derive(Clone, Debug, PartialEq)]
pub struct ProfileGraph {
    stages: Vec<Stage>,
    by_name: BTreeMap<String, StageId>,
    end_to_end: Vec<EndToEndProfile>,
}

impl ProfileGraph {
    /// Stages in topological order, leaves first.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, id: StageId) -> &Stage {
        &self.stages[id.index()]
    }

    pub fn stage_by_name(&self, name: &str) -> Option<&Stage> {
        self.by_name.get(name).map(|id| self.stage(*id))
    }

    pub fn stage_id(&self, name: &str) -> Option<StageId> {
        self.by_name.get(name).copied()
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    /// Stage names in topological order.
    pub fn topological_order(&self) -> Vec<&str> {
        self.stages.iter().map(Stage::name).collect()
    }

    pub fn sinks(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter().filter(|s| s.is_sink())
    }

    pub fn end_to_end_profiles(&self) -> &[EndToEndProfile] {
        &self.end_to_end
    }

    pub fn end_to_end(&self, name: &str) -> Option<&EndToEndProfile> {
        self.end_to_end.iter().find(|p| p.name == name)
    }

    /// Number of full assignments, saturating.
    pub fn search_space(&self) -> u128 {
        self.stages
            .iter()
            .fold(1u128, |acc, s| acc.saturating_mul(s.num_variants() as u128))
    }

    /// Builds an assignment from `(stage, variant)` names. Stages with a single variant
    /// may be omitted.
    pub fn assignment<'a, I>(&self, choices: I) -> Result<Assignment, ValidationError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut variants: Vec<Option<usize>> = self
            .stages
            .iter()
            .map(|s| (s.num_variants() == 1).then_some(0))
            .collect();
        for (stage_name, variant_name) in choices {
            let stage = self
                .stage_by_name(stage_name)
                .ok_or_else(|| ValidationError::UnknownStage {
                    stage: stage_name.to_string(),
                })?;
            let index =
                stage
                    .variant_index(variant_name)
                    .ok_or_else(|| ValidationError::UnknownVariant {
                        stage: stage_name.to_string(),
                        variant: variant_name.to_string(),
                    })?;
            variants[stage.id.index()] = Some(index);
        }
        variants
            .into_iter()
            .zip(&self.stages)
            .map(|(v, s)| {
                v.ok_or_else(|| ValidationError::UnknownVariant {
                    stage: s.name.clone(),
                    variant: "<unassigned>".to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Assignment)
    }

    /// Cheapest assignment and its cost.
    pub fn min_cost_assignment(&self) -> (Assignment, f64) {
        let assignment = Assignment(
            self.stages
                .iter()
                .map(|s| {
                    s.variants
                        .iter()
                        .position_min_by(|a, b| a.cost.total_cmp(&b.cost))
                        .unwrap_or(0)
                })
                .collect(),
        );
        let cost = assignment.cost(self);
        (assignment, cost)
    }
}

/// Entry point turning profiler records into a [`ProfileGraph`].
pub struct ProfileStore;

impl ProfileStore {
    /// Reads and validates every profile of `dir`.
    pub fn load_dir(dir: &Path) -> Result<ProfileGraph, ProfileError> {
        let records = ProfileRecords::read_dir(dir)?;
        Self::load(records)
    }

    #[instrument(name = "ProfileStore::load", skip_all, level = "debug")]
    pub fn load(records: ProfileRecords) -> Result<ProfileGraph, ProfileError> {
        let ProfileRecords {
            operators,
            end_to_end,
        } = records;
        if operators.is_empty() {
            return Err(ValidationError::NoStages.into());
        }

        let mut by_name: BTreeMap<&str, &OperatorAccuracyProfile> = BTreeMap::new();
        for op in &operators {
            check_operator(op)?;
            if by_name.insert(op.op_name.as_str(), op).is_some() {
                return Err(ValidationError::DuplicateStage {
                    stage: op.op_name.clone(),
                }
                .into());
            }
        }
        for op in &operators {
            if let Some(upstream) = op.inputs().iter().find(|u| !by_name.contains_key(u.as_str()))
            {
                return Err(ValidationError::UnknownUpstream {
                    stage: op.op_name.clone(),
                    upstream: upstream.clone(),
                }
                .into());
            }
        }

        let order = topological_sort(&by_name)?;
        let ids: BTreeMap<String, StageId> = order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_string(), StageId(i)))
            .collect();

        let mut stages: Vec<Stage> = Vec::with_capacity(order.len());
        for (i, name) in order.iter().enumerate() {
            let stage = build_stage(StageId(i), by_name[name], &ids, &stages)?;
            stages.push(stage);
        }
        for i in 0..stages.len() {
            let consumers = stages
                .iter()
                .filter(|s| s.inputs().contains(&StageId(i)))
                .map(|s| s.id)
                .collect();
            stages[i].consumers = consumers;
        }

        let mut graph = ProfileGraph {
            stages,
            by_name: ids,
            end_to_end: vec![],
        };
        let mut seen = HashSet::new();
        for record in &end_to_end {
            let profile = build_end_to_end(&graph, record)?;
            if !seen.insert(profile.name.clone()) {
                return Err(ValidationError::EndToEnd {
                    profile: profile.name,
                    reason: "defined more than once".to_string(),
                }
                .into());
            }
            graph.end_to_end.push(profile);
        }
        debug!(
            "loaded {} stages ({}) and {} end-to-end profiles",
            graph.num_stages(),
            graph.topological_order().join(" -> "),
            graph.end_to_end.len()
        );
        Ok(graph)
    }
}

/// Checks that only involve the record itself.
fn check_operator(op: &OperatorAccuracyProfile) -> Result<(), ValidationError> {
    let stage = &op.op_name;
    if stage.is_empty() {
        return Err(ValidationError::schema("<unnamed>", "op_name", "must not be empty"));
    }
    if op.acc_profile.is_empty() && op.cost_profile.is_empty() {
        return Err(ValidationError::NoVariants {
            stage: stage.clone(),
        });
    }
    if let Some(variant) = op.cost_profile.keys().find(|v| !op.acc_profile.contains_key(*v)) {
        return Err(ValidationError::MissingAccuracy {
            stage: stage.clone(),
            variant: variant.clone(),
        });
    }
    if let Some(variant) = op.acc_profile.keys().find(|v| !op.cost_profile.contains_key(*v)) {
        return Err(ValidationError::MissingCost {
            stage: stage.clone(),
            variant: variant.clone(),
        });
    }
    if op.acc_profile.contains_key(DEFAULT_VARIANT) && op.acc_profile.len() > 1 {
        return Err(ValidationError::schema(
            stage,
            "acc_profile",
            "`default` cannot be mixed with named variants",
        ));
    }
    if !op.weight.is_finite() || op.weight < 0.0 {
        return Err(ValidationError::schema(
            stage,
            "weight",
            format!("must be a non-negative number, got {}", op.weight),
        ));
    }
    if let Some((variant, cost)) = op
        .cost_profile
        .iter()
        .find(|(_, c)| !c.is_finite() || **c < 0.0)
    {
        return Err(ValidationError::schema(
            stage,
            "cost_profile",
            format!("cost of `{variant}` must be a non-negative number, got {cost}"),
        ));
    }
    if let Some(upstream) = op.inputs().iter().duplicates().next() {
        return Err(ValidationError::schema(
            stage,
            "inputs",
            format!("upstream `{upstream}` is listed more than once"),
        ));
    }
    let non_finite = op.acc_profile.iter().find(|(_, samples)| {
        samples
            .iter()
            .any(|s| !s.output_acc.is_finite() || s.inputs_acc.iter().any(|a| !a.is_finite()))
    });
    if let Some((variant, _)) = non_finite {
        return Err(ValidationError::schema(
            stage,
            "acc_profile",
            format!("variant `{variant}` has a non-finite accuracy"),
        ));
    }
    Ok(())
}

/// Kahn's algorithm over stage names; ready stages are taken in name order so the
/// resulting order is reproducible.
fn topological_sort<'a>(
    ops: &BTreeMap<&'a str, &'a OperatorAccuracyProfile>,
) -> Result<Vec<&'a str>, CyclicDependencyError> {
    let mut pending: BTreeMap<&str, usize> = ops
        .iter()
        .map(|(name, op)| (*name, op.inputs().iter().unique().count()))
        .collect();
    let mut ready: BTreeSet<&str> = pending
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(ops.len());
    while let Some(name) = ready.pop_first() {
        pending.remove(name);
        order.push(name);
        for (consumer, op) in ops {
            if op.inputs().iter().any(|u| u == name) {
                if let Some(deg) = pending.get_mut(consumer) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(*consumer);
                    }
                }
            }
        }
    }
    if !pending.is_empty() {
        return Err(CyclicDependencyError {
            stages: pending.keys().map(|s| s.to_string()).collect(),
        });
    }
    Ok(order)
}

fn build_stage(
    id: StageId,
    op: &OperatorAccuracyProfile,
    ids: &BTreeMap<String, StageId>,
    built: &[Stage],
) -> Result<Stage, ValidationError> {
    let stage = op.op_name.clone();
    // BTreeMap iteration keeps variants sorted by name
    let variants = op
        .cost_profile
        .iter()
        .map(|(name, cost)| Variant {
            id: VariantId::new(name.clone()),
            cost: *cost,
        })
        .collect::<Vec<_>>();
    let inputs = op.inputs().iter().map(|u| ids[u]).collect::<Vec<_>>();
    let expected = inputs
        .iter()
        .map(|u| upstream_cardinality(&built[u.index()]))
        .try_fold(1usize, usize::checked_mul)
        .ok_or_else(|| {
            ValidationError::schema(
                &stage,
                "inputs",
                "the number of upstream accuracy combinations overflows",
            )
        })?;

    let mut samples = Vec::with_capacity(variants.len());
    for variant in &variants {
        let list = &op.acc_profile[variant.id.as_str()];
        if let Some((i, sample)) = list
            .iter()
            .enumerate()
            .find(|(_, s)| s.inputs_acc.len() != inputs.len())
        {
            return Err(ValidationError::InputArity {
                stage,
                variant: variant.id.to_string(),
                sample: i,
                expected: inputs.len(),
                found: sample.inputs_acc.len(),
            });
        }
        if list.len() != expected {
            return Err(ValidationError::SampleCount {
                stage,
                variant: variant.id.to_string(),
                expected,
                found: list.len(),
            });
        }
        samples.push(list.clone());
    }

    let kind = if inputs.is_empty() {
        StageKind::Leaf {
            accuracy: samples.iter().map(|s| s[0].output_acc).collect(),
        }
    } else {
        StageKind::Composite {
            inputs: inputs.clone(),
            samples,
        }
    };
    let closure = inputs
        .iter()
        .flat_map(|u| built[u.index()].closure.iter().copied())
        .chain(std::iter::once(id))
        .sorted()
        .dedup()
        .collect();
    Ok(Stage {
        id,
        name: stage,
        variants,
        kind,
        weight: op.weight,
        closure,
        consumers: vec![],
    })
}

/// Number of accuracy values a downstream stage must be profiled against for this
/// upstream: the variant count of a leaf, the distinct profiled outputs of a composite.
fn upstream_cardinality(stage: &Stage) -> usize {
    match &stage.kind {
        StageKind::Leaf { .. } => stage.num_variants(),
        StageKind::Composite { samples, .. } => samples
            .iter()
            .flatten()
            .map(|s| s.output_acc.to_bits())
            .unique()
            .count(),
    }
}

fn build_end_to_end(
    graph: &ProfileGraph,
    record: &EndToEndAccuracyProfile,
) -> Result<EndToEndProfile, ValidationError> {
    let name = record.display_name();
    let fail = |reason: String| ValidationError::EndToEnd {
        profile: name.clone(),
        reason,
    };
    if record.operators.is_empty() {
        return Err(fail("`operators` is empty".to_string()));
    }
    let mut operators = Vec::with_capacity(record.operators.len());
    for op in &record.operators {
        let stage = graph
            .stage_by_name(op)
            .ok_or_else(|| fail(format!("unknown operator `{op}`")))?;
        if !stage.is_leaf() {
            return Err(fail(format!("operator `{op}` is not a leaf stage")));
        }
        if operators.contains(&stage.id) {
            return Err(fail(format!("operator `{op}` is listed twice")));
        }
        operators.push(stage.id);
    }
    let operator_set: BTreeSet<StageId> = operators.iter().copied().collect();
    let leaves_of = |stage: &Stage| -> BTreeSet<StageId> {
        stage
            .closure
            .iter()
            .copied()
            .filter(|s| graph.stage(*s).is_leaf())
            .collect()
    };

    let sink = match &record.sink {
        Some(sink_name) => {
            let sink = graph
                .stage_by_name(sink_name)
                .ok_or_else(|| fail(format!("unknown sink `{sink_name}`")))?;
            if leaves_of(sink) != operator_set {
                return Err(fail(format!(
                    "the leaves feeding `{sink_name}` are not exactly the listed operators"
                )));
            }
            sink.id
        }
        None => {
            let candidates = graph
                .sinks()
                .filter(|s| leaves_of(s) == operator_set)
                .map(|s| s.id)
                .collect::<Vec<_>>();
            match candidates.as_slice() {
                [sink] => *sink,
                [] => return Err(fail("no sink stage is fed by exactly these operators".into())),
                _ => return Err(fail("several sink stages match, set `sink`".into())),
            }
        }
    };
    if let Some(s) = graph
        .stage(sink)
        .closure
        .iter()
        .map(|s| graph.stage(*s))
        .find(|s| !s.is_leaf() && s.num_variants() != 1)
    {
        return Err(fail(format!(
            "intermediate stage `{}` has several variants, which leaf keys cannot express",
            s.name
        )));
    }

    let mut table = BTreeMap::new();
    for (key, accuracy) in &record.acc_profile {
        let names = parse_variant_tuple(key);
        if names.len() != operators.len() {
            return Err(fail(format!(
                "key `{key}` names {} variants, expected {}",
                names.len(),
                operators.len()
            )));
        }
        if !accuracy.is_finite() {
            return Err(fail(format!("accuracy of `{key}` is not finite")));
        }
        let indices = names
            .iter()
            .zip(&operators)
            .map(|(variant, op)| {
                let stage = graph.stage(*op);
                stage.variant_index(variant).ok_or_else(|| {
                    fail(format!(
                        "key `{key}`: unknown variant `{variant}` for `{}`",
                        stage.name
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if table.insert(indices, *accuracy).is_some() {
            return Err(fail(format!(
                "key `{key}` names a variant tuple that is already profiled"
            )));
        }
    }
    Ok(EndToEndProfile {
        name,
        operators,
        sink,
        table,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, ASR, FUSION, IMAGE};

    fn two_leaf_records() -> ProfileRecords {
        ProfileRecords::new(
            vec![
                OperatorAccuracyProfile::leaf("A", [("a1", 10.0, 1.0), ("a2", 20.0, 2.0)]),
                OperatorAccuracyProfile::leaf("B", [("b1", 1.0, 1.0)]),
                OperatorAccuracyProfile::fusion(
                    "F",
                    &["A", "B"],
                    0.5,
                    vec![
                        AccuracySample::new(vec![10.0, 1.0], 50.0),
                        AccuracySample::new(vec![20.0, 1.0], 60.0),
                    ],
                ),
            ],
            vec![],
        )
    }

    #[test]
    fn test_vqa_graph_shape() {
        let graph = testing::vqa_graph();
        assert_eq!(graph.topological_order(), vec![IMAGE, ASR, FUSION]);
        let vqa = graph.stage_by_name(FUSION).unwrap();
        assert_eq!(
            vqa.inputs(),
            &[graph.stage_id(IMAGE).unwrap(), graph.stage_id(ASR).unwrap()]
        );
        assert_eq!(vqa.num_variants(), 1);
        assert!(vqa.variant(0).is_default());
        assert!(vqa.is_sink());
        assert_eq!(vqa.closure().len(), 3);
        assert_eq!(graph.sinks().count(), 1);
        assert_eq!(graph.search_space(), 15);
        let image = graph.stage_by_name(IMAGE).unwrap();
        assert_eq!(
            image.variants().iter().map(|v| v.id.as_str()).collect::<Vec<_>>(),
            vec!["resnet101", "resnet152", "resnet18", "resnet34", "resnet50"]
        );
        assert_eq!(graph.end_to_end_profiles().len(), 1);
        assert_eq!(graph.end_to_end(testing::VQA_E2E).unwrap().sink(), vqa.id());
    }

    #[test]
    fn test_min_cost_assignment() {
        let graph = testing::vqa_graph();
        let (assignment, cost) = graph.min_cost_assignment();
        assert_eq!(
            assignment.describe(&graph),
            vec![
                (IMAGE.to_string(), "resnet18".to_string()),
                (ASR.to_string(), "wav2vec2-base-960h".to_string()),
                (FUSION.to_string(), "default".to_string()),
            ]
        );
        assert!((cost - testing::MIN_TOTAL_COST).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_upstream() {
        let mut records = two_leaf_records();
        records.operators[2].inputs = Some(vec!["A".into(), "C".into()]);
        assert_eq!(
            ProfileStore::load(records),
            Err(ProfileError::Validation(ValidationError::UnknownUpstream {
                stage: "F".into(),
                upstream: "C".into()
            }))
        );
    }

    #[test]
    fn test_cost_and_accuracy_keys_must_match() {
        let mut records = two_leaf_records();
        records.operators[0].cost_profile.insert("a3".into(), 3.0);
        assert!(matches!(
            ProfileStore::load(records),
            Err(ProfileError::Validation(ValidationError::MissingAccuracy { .. }))
        ));

        let mut records = two_leaf_records();
        records.operators[0]
            .acc_profile
            .insert("a3".into(), vec![AccuracySample::standalone(1.0)]);
        assert_eq!(
            ProfileStore::load(records),
            Err(ProfileError::Validation(ValidationError::MissingCost {
                stage: "A".into(),
                variant: "a3".into()
            }))
        );
    }

    #[test]
    fn test_input_arity_mismatch() {
        let mut records = two_leaf_records();
        records.operators[2].acc_profile.get_mut("default").unwrap()[1].inputs_acc = vec![20.0];
        assert_eq!(
            ProfileStore::load(records),
            Err(ProfileError::Validation(ValidationError::InputArity {
                stage: "F".into(),
                variant: "default".into(),
                sample: 1,
                expected: 2,
                found: 1,
            }))
        );
    }

    #[test]
    fn test_sample_count_must_cover_cartesian_product() {
        let mut records = two_leaf_records();
        records.operators[2].acc_profile.get_mut("default").unwrap().pop();
        assert_eq!(
            ProfileStore::load(records),
            Err(ProfileError::Validation(ValidationError::SampleCount {
                stage: "F".into(),
                variant: "default".into(),
                expected: 2,
                found: 1,
            }))
        );
    }

    #[test]
    fn test_composite_upstream_counts_distinct_outputs() -> anyhow::Result<()> {
        let mut records = two_leaf_records();
        records.operators.push(OperatorAccuracyProfile::fusion(
            "G",
            &["F"],
            0.1,
            vec![
                AccuracySample::new(vec![50.0], 49.0),
                AccuracySample::new(vec![60.0], 58.0),
            ],
        ));
        let graph = ProfileStore::load(records)?;
        assert_eq!(graph.topological_order(), vec!["A", "B", "F", "G"]);
        assert_eq!(graph.sinks().map(Stage::name).collect::<Vec<_>>(), vec!["G"]);
        assert_eq!(graph.stage_by_name("F").unwrap().consumers().len(), 1);
        Ok(())
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut records = two_leaf_records();
        records.operators[0].inputs = Some(vec!["F".into()]);
        records.operators[0].acc_profile = BTreeMap::from([
            ("a1".into(), vec![AccuracySample::new(vec![50.0], 10.0)]),
            ("a2".into(), vec![AccuracySample::new(vec![50.0], 20.0)]),
        ]);
        assert_eq!(
            ProfileStore::load(records),
            Err(ProfileError::Cyclic(CyclicDependencyError {
                stages: vec!["A".into(), "F".into()]
            }))
        );
    }

    #[test]
    fn test_duplicate_and_empty_stages() {
        let mut records = two_leaf_records();
        records.operators.push(records.operators[1].clone());
        assert!(matches!(
            ProfileStore::load(records),
            Err(ProfileError::Validation(ValidationError::DuplicateStage { .. }))
        ));
        assert_eq!(
            ProfileStore::load(ProfileRecords::default()),
            Err(ProfileError::Validation(ValidationError::NoStages))
        );
        let mut records = two_leaf_records();
        records.operators[1].acc_profile.clear();
        records.operators[1].cost_profile.clear();
        assert!(matches!(
            ProfileStore::load(records),
            Err(ProfileError::Validation(ValidationError::NoVariants { .. }))
        ));
    }

    #[test]
    fn test_negative_weight_is_rejected() {
        let mut records = two_leaf_records();
        records.operators[2].weight = -1.0;
        assert!(matches!(
            ProfileStore::load(records),
            Err(ProfileError::Validation(ValidationError::Schema { field, .. })) if field == "weight"
        ));
    }

    #[test]
    fn test_negative_cost_is_rejected() {
        let mut records = two_leaf_records();
        records.operators[0].cost_profile.insert("a2".into(), -2.0);
        assert!(matches!(
            ProfileStore::load(records),
            Err(ProfileError::Validation(ValidationError::Schema { field, .. })) if field == "cost_profile"
        ));
    }

    #[test]
    fn test_repeated_upstream_is_rejected() {
        let mut records = two_leaf_records();
        records.operators[2].inputs = Some(vec!["A".into(), "A".into()]);
        assert_eq!(
            ProfileStore::load(records),
            Err(ProfileError::Validation(ValidationError::schema(
                "F",
                "inputs",
                "upstream `A` is listed more than once"
            )))
        );
    }

    #[test]
    fn test_sample_count_overflow_is_an_error() {
        // 5^30 combinations do not fit in a usize
        let names = (0..30).map(|i| format!("L{i:02}")).collect::<Vec<_>>();
        let variants = ["v1", "v2", "v3", "v4", "v5"];
        let mut operators = names
            .iter()
            .map(|name| {
                OperatorAccuracyProfile::leaf(
                    name,
                    variants.iter().enumerate().map(|(i, v)| (*v, i as f64, 1.0)),
                )
            })
            .collect::<Vec<_>>();
        let inputs = names.iter().map(String::as_str).collect::<Vec<_>>();
        operators.push(OperatorAccuracyProfile::fusion(
            "F",
            &inputs,
            1.0,
            vec![AccuracySample::new(vec![0.0; 30], 1.0)],
        ));
        assert!(matches!(
            ProfileStore::load(ProfileRecords::new(operators, vec![])),
            Err(ProfileError::Validation(ValidationError::Schema { record, field, .. }))
                if record == "F" && field == "inputs"
        ));
    }

    #[test]
    fn test_end_to_end_key_spelled_twice() {
        let mut records = two_leaf_records();
        let mut profile =
            EndToEndAccuracyProfile::new("e2e", &["A", "B"]).with_entry(&["a1", "b1"], 50.0);
        profile.acc_profile.insert("a1,b1".into(), 51.0);
        records.end_to_end.push(profile);
        assert!(matches!(
            ProfileStore::load(records),
            Err(ProfileError::Validation(ValidationError::EndToEnd { reason, .. }))
                if reason.contains("already profiled")
        ));
    }

    #[test]
    fn test_end_to_end_validation() {
        let mut records = two_leaf_records();
        records.end_to_end.push(
            EndToEndAccuracyProfile::new("e2e", &["A", "B"])
                .with_entry(&["a1", "b1"], 50.0)
                .with_entry(&["a2", "b1"], 60.0),
        );
        let graph = ProfileStore::load(records.clone()).unwrap();
        let profile = graph.end_to_end("e2e").unwrap();
        assert_eq!(profile.sink(), graph.stage_id("F").unwrap());
        assert_eq!(profile.entries().count(), 2);

        let mut bad = records.clone();
        bad.end_to_end[0] = bad.end_to_end[0].clone().with_entry(&["a9", "b1"], 1.0);
        assert!(matches!(
            ProfileStore::load(bad),
            Err(ProfileError::Validation(ValidationError::EndToEnd { .. }))
        ));

        let mut bad = records.clone();
        bad.end_to_end[0].operators = vec!["A".into(), "F".into()];
        assert!(matches!(
            ProfileStore::load(bad),
            Err(ProfileError::Validation(ValidationError::EndToEnd { .. }))
        ));

        let mut bad = records;
        bad.end_to_end.push(bad.end_to_end[0].clone());
        assert!(matches!(
            ProfileStore::load(bad),
            Err(ProfileError::Validation(ValidationError::EndToEnd { .. }))
        ));
    }

    #[test]
    fn test_assignment_from_names() {
        let graph = testing::vqa_graph();
        let assignment = graph
            .assignment([(IMAGE, "resnet50"), (ASR, "wav2vec2-base-960h")])
            .unwrap();
        assert_eq!(assignment.variant(graph.stage_id(FUSION).unwrap()), 0);
        assert!(matches!(
            graph.assignment([(IMAGE, "resnet50")]),
            Err(ValidationError::UnknownVariant { .. })
        ));
        assert!(matches!(
            graph.assignment([(IMAGE, "vgg16"), (ASR, "wav2vec2-base-960h")]),
            Err(ValidationError::UnknownVariant { .. })
        ));
        assert!(matches!(
            graph.assignment([("Detector", "yolo")]),
            Err(ValidationError::UnknownStage { .. })
        ));
    }

    #[test]
    fn test_load_dir_from_assets() -> anyhow::Result<()> {
        let graph = ProfileStore::load_dir(&testing::vqa_profiles_dir())?;
        assert_eq!(graph, testing::vqa_graph());
        Ok(())
    }
}
