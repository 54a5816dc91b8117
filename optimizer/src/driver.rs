//! One optimization run: load, select, place, emit the plan.

use std::path::Path;

use tracing::{info, instrument};

use crate::{
    composer::AccuracyComposer,
    config::{ConfigError, OptimizerConfig},
    error::OptimizerError,
    objective::ObjectiveSet,
    placement::WorkerPlacer,
    plan::DeploymentPlan,
    profile::{ProfileGraph, ProfileRecords, ProfileStore},
    selector::{ModelSelector, Selection, SelectionMode},
};

pub struct OptimizerDriver {
    config: OptimizerConfig,
}

impl OptimizerDriver {
    pub fn new(config: OptimizerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Loads every profile of `profiles_dir` and plans the deployment.
    #[instrument(name = "OptimizerDriver::run", skip_all, level = "debug")]
    pub fn run(&self, profiles_dir: &Path) -> Result<DeploymentPlan, OptimizerError> {
        info!("STEP: loading profiles from {}", profiles_dir.display());
        let graph = ProfileStore::load_dir(profiles_dir)?;
        self.run_with_graph(&graph)
    }

    pub fn run_records(&self, records: ProfileRecords) -> Result<DeploymentPlan, OptimizerError> {
        let graph = ProfileStore::load(records)?;
        self.run_with_graph(&graph)
    }

    pub fn run_with_graph(&self, graph: &ProfileGraph) -> Result<DeploymentPlan, OptimizerError> {
        Self::check_end_to_end(graph)?;
        let objectives = ObjectiveSet::resolve(graph, &self.config.objectives)?;
        let placer = WorkerPlacer::new(
            graph,
            self.config.worker_pool.clone(),
            self.config.latency_slo,
        )?;

        info!("STEP: selecting variants");
        let selection = self.select(graph, &objectives, self.config.mode()?)?;

        info!("STEP: placing {} stages on {} workers", graph.num_stages(), placer.workers().len());
        let placement = placer.place(&selection.assignment)?;
        Ok(DeploymentPlan::new(
            graph,
            &objectives,
            &selection,
            &placement,
            placer.workers(),
        ))
    }

    /// Every end-to-end profile must agree with composition before it is trusted.
    pub fn check_end_to_end(graph: &ProfileGraph) -> Result<(), OptimizerError> {
        let mut composer = AccuracyComposer::new(graph);
        for profile in graph.end_to_end_profiles() {
            let checked = composer.check_end_to_end(profile)?;
            info!(
                "end-to-end profile `{}` agrees with composition on {checked} entries",
                profile.name()
            );
        }
        Ok(())
    }

    /// Model selection alone, on the configured thread pool.
    pub fn select(
        &self,
        graph: &ProfileGraph,
        objectives: &ObjectiveSet,
        mode: SelectionMode,
    ) -> Result<Selection, OptimizerError> {
        let selector = ModelSelector::new(graph, objectives, self.config.search.clone());
        let selection = match self.config.search.threads {
            Some(threads) => rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|e| ConfigError::ThreadPool(e.to_string()))?
                .install(|| selector.select(mode)),
            None => selector.select(mode),
        }?;
        Ok(selection)
    }
}
