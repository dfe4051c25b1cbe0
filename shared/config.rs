//! Run configuration, stored as TOML.
//!
//! Every field has a default, so a configuration file only needs the values it
//! changes. Command-line flags are applied on top of the loaded file.

use crate::cohort::{LabelMode, LoadOptions};
use crate::harness::{EvaluationError, EvaluationSettings, UndefinedMetricPolicy};
use crate::metrics::Averaging;
use crate::models::{Classifier, ModelSpec};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSection {
    pub labels: LabelMode,
    /// Explicit feature columns; every biomarker column when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<String>>,
    pub include_demographics: bool,
}

impl Default for DataSection {
    fn default() -> Self {
        Self {
            labels: LabelMode::Binary,
            features: None,
            include_demographics: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationSection {
    pub n_folds: usize,
    pub seed: u64,
    pub threshold: f64,
    /// One of `auto`, `binary` or `macro`.
    pub averaging: String,
    pub undefined_metrics: UndefinedMetricPolicy,
    pub parallel: bool,
}

impl Default for EvaluationSection {
    fn default() -> Self {
        let settings = EvaluationSettings::default();
        Self {
            n_folds: settings.n_folds,
            seed: settings.seed,
            threshold: settings.threshold,
            averaging: settings.averaging.to_string(),
            undefined_metrics: settings.undefined_metrics,
            parallel: settings.parallel,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportSection {
    /// Rows of the importance ranking printed to the terminal.
    pub top_features: usize,
}

impl Default for ReportSection {
    fn default() -> Self {
        Self { top_features: 30 }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub cohorts: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    pub data: DataSection,
    pub evaluation: EvaluationSection,
    pub report: ReportSection,
    pub model: ModelSpec,
}

impl RunConfig {
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config = toml::from_str(&toml_string)?;
        Ok(config)
    }

    pub fn evaluation_settings(&self) -> Result<EvaluationSettings, EvaluationError> {
        let averaging: Averaging = self
            .evaluation
            .averaging
            .parse()
            .map_err(EvaluationError::UnknownAveraging)?;
        Ok(EvaluationSettings {
            n_folds: self.evaluation.n_folds,
            seed: self.evaluation.seed,
            threshold: self.evaluation.threshold,
            averaging,
            undefined_metrics: self.evaluation.undefined_metrics,
            parallel: self.evaluation.parallel,
        })
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            features: self.data.features.clone(),
            include_demographics: self.data.include_demographics,
        }
    }

    /// The configured model with the run seed applied.
    pub fn seeded_model(&self) -> ModelSpec {
        self.model.clone().with_seed(self.evaluation.seed)
    }

    pub fn classifier(&self) -> Box<dyn Classifier> {
        self.seeded_model().build()
    }
}
