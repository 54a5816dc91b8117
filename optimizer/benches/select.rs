use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use itertools::Itertools;
use optimizer::{
    ModelSelector, ObjectiveSet, ProfileGraph, ProfileRecords, ProfileStore, SearchConfig,
    SearchStrategy, SelectionMode,
    profile::{AccuracySample, OperatorAccuracyProfile},
    testing,
};

/// `leaves` perception stages of `variants` variants each, fused by a single stage.
fn synthetic_graph(leaves: usize, variants: usize) -> ProfileGraph {
    let names = (0..leaves).map(|l| format!("leaf{l}")).collect::<Vec<_>>();
    let leaf_profiles = names
        .iter()
        .map(|name| {
            let variants = (0..variants)
                .map(|v| (format!("v{v:02}"), 60.0 + v as f64, 1.0 + (v * v) as f64 * 0.5))
                .collect::<Vec<_>>();
            OperatorAccuracyProfile::leaf(
                name,
                variants.iter().map(|(v, acc, cost)| (v.as_str(), *acc, *cost)),
            )
        })
        .collect::<Vec<_>>();
    let samples = (0..leaves)
        .map(|_| (0..variants).map(|v| 60.0 + v as f64))
        .multi_cartesian_product()
        .map(|inputs| {
            // diminishing returns on every input
            let output = inputs.iter().map(|a| (a - 59.0).ln()).sum::<f64>();
            AccuracySample::new(inputs, output)
        })
        .collect();
    let inputs = names.iter().map(String::as_str).collect::<Vec<_>>();
    let mut operators = leaf_profiles;
    operators.push(OperatorAccuracyProfile::fusion("fusion", &inputs, 2.0, samples));
    ProfileStore::load(ProfileRecords::new(operators, vec![])).expect("synthetic profiles are valid")
}

fn criterion_benchmark(c: &mut Criterion) {
    let vqa = testing::vqa_graph();
    let objectives = ObjectiveSet::sinks(&vqa);
    c.bench_function("vqa", |b| {
        let selector = ModelSelector::new(&vqa, &objectives, SearchConfig::default());
        b.iter(|| selector.select(SelectionMode::MaximizeAccuracy { budget: 52.1 }))
    });

    let graph = synthetic_graph(4, 8);
    let objectives = ObjectiveSet::sinks(&graph);
    let budget = SelectionMode::MaximizeAccuracy { budget: 60.0 };
    let mut group = c.benchmark_group("synthetic");
    for strategy in [SearchStrategy::Exhaustive, SearchStrategy::Knapsack] {
        group.bench_with_input(BenchmarkId::from_parameter(strategy), &strategy, |b, s| {
            let selector = ModelSelector::new(
                &graph,
                &objectives,
                SearchConfig::default().with_strategy(*s),
            );
            b.iter(|| selector.select(budget))
        });
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
