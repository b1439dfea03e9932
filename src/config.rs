//! YAML run configuration.
//!
//! Required keys are checked on the raw document first so one run reports
//! every missing key; typed parsing and range checks follow.

use crate::columns::{Instrument, InstrumentRegistry};
use crate::hmc::{InitStrategy, SamplerConfig};
use crate::model::Priors;
use crate::types::TimeCoding;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const REQUIRED_KEYS: [&str; 7] = [
    "data.url",
    "data.out_path",
    "sampler.draws",
    "sampler.tune",
    "sampler.chains",
    "sampler.target_accept",
    "outputs.outdir",
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Missing required config keys: {}", .0.join(", "))]
    MissingKeys(Vec<String>),

    #[error("invalid config value: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    pub url: String,
    pub out_path: PathBuf,
    #[serde(default)]
    pub md5: Option<String>,
    /// Column holding a subject identifier; row position when absent.
    #[serde(default)]
    pub id_column: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputsConfig {
    pub outdir: PathBuf,
    #[serde(default = "default_true")]
    pub save_idata: bool,
    #[serde(default = "default_true")]
    pub save_summary: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub time_coding: TimeCoding,
    pub priors: Priors,
    pub hdi_prob: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            time_coding: TimeCoding::default(),
            priors: Priors::default(),
            hdi_prob: 0.95,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
struct SamplerSection {
    draws: usize,
    tune: usize,
    chains: usize,
    target_accept: f64,
    #[serde(default = "default_max_treedepth")]
    max_treedepth: usize,
    #[serde(default)]
    init: InitStrategy,
}

#[derive(Clone, Debug, Deserialize)]
struct RawConfig {
    data: DataConfig,
    sampler: SamplerSection,
    outputs: OutputsConfig,
    #[serde(default = "default_seed")]
    seed: u64,
    #[serde(default)]
    model: ModelConfig,
    #[serde(default)]
    instruments: Option<Vec<Instrument>>,
}

fn default_true() -> bool {
    true
}

fn default_seed() -> u64 {
    42
}

fn default_max_treedepth() -> usize {
    12
}

/// Fully resolved run configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub data: DataConfig,
    pub sampler: SamplerConfig,
    pub outputs: OutputsConfig,
    pub model: ModelConfig,
    pub registry: InstrumentRegistry,
}

impl Config {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let cfg = Self::from_yaml_str(&text)?;
        log::info!("loaded config from {}", path.display());
        Ok(cfg)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let doc: Value = serde_yaml::from_str(text)?;
        let missing = missing_keys(&doc);
        if !missing.is_empty() {
            return Err(ConfigError::MissingKeys(missing));
        }
        let raw: RawConfig = serde_yaml::from_value(doc)?;

        let registry = match raw.instruments {
            Some(list) => InstrumentRegistry::new(list)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?,
            None => InstrumentRegistry::scales_results(),
        };
        let cfg = Self {
            data: raw.data,
            sampler: SamplerConfig {
                draws: raw.sampler.draws,
                tune: raw.sampler.tune,
                chains: raw.sampler.chains,
                target_accept: raw.sampler.target_accept,
                max_treedepth: raw.sampler.max_treedepth,
                seed: raw.seed,
                init: raw.sampler.init,
            },
            outputs: raw.outputs,
            model: raw.model,
            registry,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data.url.trim().is_empty() {
            return Err(ConfigError::Invalid("data.url cannot be empty".into()));
        }
        if let Some(md5) = &self.data.md5
            && (md5.len() != 32 || !md5.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return Err(ConfigError::Invalid(format!(
                "data.md5 must be 32 hex characters, got '{md5}'"
            )));
        }
        self.sampler
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let p = self.model.hdi_prob;
        if !(p > 0.0 && p < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "model.hdi_prob must be in (0, 1), got {p}"
            )));
        }
        self.model
            .priors
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }
}

/// Dotted required keys absent from the document, in declaration order.
fn missing_keys(doc: &Value) -> Vec<String> {
    REQUIRED_KEYS
        .iter()
        .filter(|key| {
            let mut node = Some(doc);
            for part in key.split('.') {
                node = node.and_then(|n| n.get(part));
            }
            matches!(node, None | Some(Value::Null))
        })
        .map(|k| k.to_string())
        .collect()
}
