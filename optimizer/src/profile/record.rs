//! Raw profile records, as written by the profiler, before any validation.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::ValidationError;

/// Key used in `acc_profile` by composite stages that have a single implementation.
pub const DEFAULT_VARIANT: &str = "default";

/// One measured point: the stage produced `output_acc` when fed inputs at exactly `inputs_acc`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AccuracySample {
    pub inputs_acc: Vec<f64>,
    pub output_acc: f64,
}

impl AccuracySample {
    pub fn new(inputs_acc: Vec<f64>, output_acc: f64) -> Self {
        Self {
            inputs_acc,
            output_acc,
        }
    }

    /// Sample of a leaf stage, i.e. the standalone accuracy of a variant.
    pub fn standalone(output_acc: f64) -> Self {
        Self::new(vec![], output_acc)
    }
}

/// Per-operator profile: cost and accuracy of every variant of a stage.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OperatorAccuracyProfile {
    pub op_name: String,
    /// Upstream stages in positional order, absent or empty for a leaf.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<String>>,
    pub acc_profile: BTreeMap<String, Vec<AccuracySample>>,
    pub cost_profile: BTreeMap<String, f64>,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl OperatorAccuracyProfile {
    /// Profile of a leaf stage from `(variant, standalone accuracy, cost)` triples.
    pub fn leaf<'a, I>(op_name: &str, variants: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, f64, f64)>,
    {
        let mut acc_profile = BTreeMap::new();
        let mut cost_profile = BTreeMap::new();
        for (variant, accuracy, cost) in variants {
            acc_profile.insert(variant.to_string(), vec![AccuracySample::standalone(accuracy)]);
            cost_profile.insert(variant.to_string(), cost);
        }
        Self {
            op_name: op_name.to_string(),
            inputs: None,
            acc_profile,
            cost_profile,
            weight: default_weight(),
        }
    }

    /// Profile of a single-implementation composite stage.
    pub fn fusion(op_name: &str, inputs: &[&str], cost: f64, samples: Vec<AccuracySample>) -> Self {
        Self {
            op_name: op_name.to_string(),
            inputs: Some(inputs.iter().map(|s| s.to_string()).collect()),
            acc_profile: BTreeMap::from([(DEFAULT_VARIANT.to_string(), samples)]),
            cost_profile: BTreeMap::from([(DEFAULT_VARIANT.to_string(), cost)]),
            weight: default_weight(),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn inputs(&self) -> &[String] {
        self.inputs.as_deref().unwrap_or_default()
    }
}

/// Precomputed end-to-end accuracy for every tuple of leaf variants.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EndToEndAccuracyProfile {
    /// Name used by objectives. Defaults to the file stem when loaded from a directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Leaf stages, in the order used by the keys of `acc_profile`.
    pub operators: Vec<String>,
    /// Stage this profile is a shortcut for. Inferred when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sink: Option<String>,
    /// Keys are variant tuples, either `"('a', 'b')"` or `"a,b"`.
    pub acc_profile: BTreeMap<String, f64>,
}

impl EndToEndAccuracyProfile {
    pub fn new(name: &str, operators: &[&str]) -> Self {
        Self {
            name: Some(name.to_string()),
            operators: operators.iter().map(|s| s.to_string()).collect(),
            sink: None,
            acc_profile: BTreeMap::new(),
        }
    }

    pub fn with_sink(mut self, sink: &str) -> Self {
        self.sink = Some(sink.to_string());
        self
    }

    pub fn with_entry(mut self, variants: &[&str], accuracy: f64) -> Self {
        let key = format!(
            "({})",
            variants
                .iter()
                .map(|v| format!("'{v}'"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.acc_profile.insert(key, accuracy);
        self
    }

    /// Name of the profile, falling back to the joined operator names.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.operators.join("+"))
    }
}

/// Splits an end-to-end key into variant names.
///
/// Accepts Python tuple notation (`"('resnet101', 'wav2vec2-base-960h')"`, with or
/// without a trailing comma) as well as plain comma separated names.
pub fn parse_variant_tuple(key: &str) -> Vec<String> {
    let trimmed = key.trim();
    let inner = trimmed
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .or_else(|| trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')))
        .unwrap_or(trimmed);
    inner
        .split(',')
        .map(|part| part.trim().trim_matches(|c| c == '\'' || c == '"').trim())
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// The full set of records of one optimization run.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ProfileRecords {
    pub operators: Vec<OperatorAccuracyProfile>,
    pub end_to_end: Vec<EndToEndAccuracyProfile>,
}

impl ProfileRecords {
    pub fn new(
        operators: Vec<OperatorAccuracyProfile>,
        end_to_end: Vec<EndToEndAccuracyProfile>,
    ) -> Self {
        Self {
            operators,
            end_to_end,
        }
    }

    /// Reads every `*.json` file of `dir`, in file name order.
    ///
    /// A file holding an `op_name` field is an operator profile, one holding `operators`
    /// is an end-to-end profile. Unnamed end-to-end profiles take the file stem as name.
    pub fn read_dir(dir: &Path) -> Result<Self, ValidationError> {
        let io_err = |reason: String| ValidationError::Io {
            path: dir.display().to_string(),
            reason,
        };
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(|e| io_err(e.to_string()))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| io_err(e.to_string()))?
            .into_iter()
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        let mut records = Self::default();
        for path in files {
            records.read_file(&path)?;
        }
        debug!(
            "read {} operator and {} end-to-end profiles from {}",
            records.operators.len(),
            records.end_to_end.len(),
            dir.display()
        );
        Ok(records)
    }

    fn read_file(&mut self, path: &Path) -> Result<(), ValidationError> {
        let record = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let bytes = fs::read(path).map_err(|e| ValidationError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| ValidationError::schema(&record, "<document>", e.to_string()))?;
        let Value::Object(fields) = &value else {
            return Err(ValidationError::schema(
                &record,
                "<document>",
                "expected a JSON object",
            ));
        };
        if fields.contains_key("op_name") {
            let profile: OperatorAccuracyProfile = serde_json::from_value(value)
                .map_err(|e| ValidationError::schema(&record, field_of(&e), e.to_string()))?;
            self.operators.push(profile);
        } else if fields.contains_key("operators") {
            let mut profile: EndToEndAccuracyProfile = serde_json::from_value(value)
                .map_err(|e| ValidationError::schema(&record, field_of(&e), e.to_string()))?;
            if profile.name.is_none() {
                profile.name = path.file_stem().map(|s| s.to_string_lossy().into_owned());
            }
            self.end_to_end.push(profile);
        } else {
            return Err(ValidationError::schema(
                &record,
                "op_name",
                "record is neither an operator profile (`op_name`) nor an end-to-end profile (`operators`)",
            ));
        }
        Ok(())
    }
}

/// Best effort extraction of the offending field from a serde error message.
fn field_of(error: &serde_json::Error) -> String {
    let msg = error.to_string();
    msg.split('`')
        .nth(1)
        .map(str::to_string)
        .unwrap_or_else(|| "<document>".to_string())
}
