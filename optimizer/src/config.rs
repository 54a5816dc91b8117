//! Optimizer configuration, read from a JSON file.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    objective::ObjectiveSpec,
    placement::WorkerSpec,
    selector::{SearchStrategy, SelectionMode},
};

/// Search spaces up to this many assignments are enumerated exhaustively.
pub const DEFAULT_EXHAUSTIVE_LIMIT: u64 = 1 << 20;
/// Number of cost buckets of the knapsack fallback.
pub const DEFAULT_COST_BUCKETS: usize = 1024;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("unable to read config `{path}`: {reason}")]
    Io { path: String, reason: String },
    #[error("invalid config `{path}`: {reason}")]
    Parse { path: String, reason: String },
    #[error("either `budget` or `accuracy_floor` must be set")]
    MissingBudget,
    #[error("invalid `{field}`: {reason}")]
    Invalid { field: String, reason: String },
    #[error("unable to build a thread pool: {0}")]
    ThreadPool(String),
}

impl ConfigError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SearchConfig {
    #[serde(default = "default_exhaustive_limit")]
    pub exhaustive_limit: u64,
    #[serde(default = "default_cost_buckets")]
    pub cost_buckets: usize,
    /// Return the best assignment found once this many milliseconds have elapsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
    /// Size of the thread pool used by one run. Unset means the global rayon pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<usize>,
    /// Forces a strategy instead of choosing by search space size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<SearchStrategy>,
}

fn default_exhaustive_limit() -> u64 {
    DEFAULT_EXHAUSTIVE_LIMIT
}

fn default_cost_buckets() -> usize {
    DEFAULT_COST_BUCKETS
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            exhaustive_limit: DEFAULT_EXHAUSTIVE_LIMIT,
            cost_buckets: DEFAULT_COST_BUCKETS,
            deadline_ms: None,
            threads: None,
            strategy: None,
        }
    }
}

impl SearchConfig {
    pub fn with_strategy(mut self, strategy: SearchStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cost_buckets == 0 {
            return Err(ConfigError::invalid("search.cost_buckets", "must be positive"));
        }
        if self.threads == Some(0) {
            return Err(ConfigError::invalid("search.threads", "must be positive"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OptimizerConfig {
    /// Upper bound on the summed cost of all stages.
    #[serde(default)]
    pub budget: Option<f64>,
    /// When set, minimize cost subject to this weighted accuracy instead.
    #[serde(default)]
    pub accuracy_floor: Option<f64>,
    /// Empty means every sink stage, weighted by its stage weight.
    #[serde(default)]
    pub objectives: Vec<ObjectiveSpec>,
    #[serde(default)]
    pub worker_pool: Vec<WorkerSpec>,
    #[serde(default)]
    pub latency_slo: Option<f64>,
    #[serde(default)]
    pub search: SearchConfig,
}

impl OptimizerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("budget", self.budget),
            ("accuracy_floor", self.accuracy_floor),
            ("latency_slo", self.latency_slo),
        ] {
            if value.is_some_and(|v| v.is_nan()) {
                return Err(ConfigError::invalid(field, "must be a number"));
            }
        }
        if self.latency_slo.is_some_and(|slo| slo < 0.0) {
            return Err(ConfigError::invalid("latency_slo", "must be non-negative"));
        }
        self.search.validate()
    }

    /// Floor mode when `accuracy_floor` is set (with `budget` as an extra ceiling),
    /// budget mode otherwise.
    pub fn mode(&self) -> Result<SelectionMode, ConfigError> {
        match (self.accuracy_floor, self.budget) {
            (Some(accuracy_floor), budget) => Ok(SelectionMode::MinimizeCost {
                accuracy_floor,
                budget,
            }),
            (None, Some(budget)) => Ok(SelectionMode::MaximizeAccuracy { budget }),
            (None, None) => Err(ConfigError::MissingBudget),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_asset_config() -> anyhow::Result<()> {
        let config = OptimizerConfig::from_file(&testing::vqa_config_path())?;
        assert_eq!(config.mode()?, SelectionMode::MaximizeAccuracy { budget: 52.1 });
        assert_eq!(config.objectives, vec![ObjectiveSpec::new(testing::VQA_E2E, 1.0)]);
        assert_eq!(config.worker_pool, testing::vqa_workers());
        assert_eq!(config.latency_slo, Some(60.0));
        assert_eq!(config.search, SearchConfig::default());
        Ok(())
    }

    #[test]
    fn test_mode_selection() {
        let mut config = OptimizerConfig::default();
        assert_eq!(config.mode(), Err(ConfigError::MissingBudget));
        config.budget = Some(40.0);
        config.accuracy_floor = Some(56.0);
        assert_eq!(
            config.mode(),
            Ok(SelectionMode::MinimizeCost {
                accuracy_floor: 56.0,
                budget: Some(40.0)
            })
        );
    }

    #[test]
    fn test_defaults_and_unknown_fields() -> anyhow::Result<()> {
        let config: OptimizerConfig = serde_json::from_str(r#"{"budget": 10.0}"#)?;
        assert_eq!(config.search.cost_buckets, DEFAULT_COST_BUCKETS);
        assert!(config.objectives.is_empty());
        assert!(serde_json::from_str::<OptimizerConfig>(r#"{"budjet": 10.0}"#).is_err());
        let config: OptimizerConfig =
            serde_json::from_str(r#"{"budget": 10.0, "search": {"strategy": "knapsack"}}"#)?;
        assert_eq!(config.search.strategy, Some(SearchStrategy::Knapsack));
        Ok(())
    }

    #[test]
    fn test_invalid_search_limits() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"budget": 10.0, "search": {"cost_buckets": 0}}"#)?;
        assert!(matches!(
            OptimizerConfig::from_file(&path),
            Err(ConfigError::Invalid { field, .. }) if field == "search.cost_buckets"
        ));
        assert!(matches!(
            OptimizerConfig::from_file(&dir.path().join("missing.json")),
            Err(ConfigError::Io { .. })
        ));
        Ok(())
    }
}
