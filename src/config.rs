use crate::error::HarnessError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One entry of the model registry
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelSpec {
    /// Label used in `LLM [<name>]` lines and on the command line
    pub name: String,
    /// Provider model identifier
    pub model: String,
    /// OpenAI-compatible API endpoint
    pub api_endpoint: String,
    /// Environment variable name containing the API key
    pub env_var_api_key: String,
    /// Price in USD per million prompt tokens
    pub price_in: f64,
    /// Price in USD per million completion tokens
    pub price_out: f64,
    /// Added to the token budget for models that reason before answering
    #[serde(default)]
    pub extra_tokens: u32,
    /// Whether the model accepts a system message
    #[serde(default = "default_true")]
    pub has_system: bool,
    /// Disabled models stay in the price table but are never queried
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Settings for the SQL generation and categorization runs
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExperimentConfig {
    /// JSON-lines file with `key`, `question_refine` and `sql`
    pub dataset: PathBuf,
    /// SQLite database queried for execution results
    pub database: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// System prompt file made of `[section]` blocks
    #[serde(default)]
    pub prompts_file: Option<PathBuf>,
    /// Prompt sections left out of the system prompt
    #[serde(default)]
    pub exclude_prompts: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Number of batches to run; non-positive means all of them
    #[serde(default = "default_batch_limit")]
    pub batch_limit: i64,
    /// Repetition number of this experiment, part of the log name
    #[serde(default = "default_take")]
    pub take: u32,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Minimum wall-clock time of one batch
    #[serde(default = "default_min_batch_millis")]
    pub min_batch_millis: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Model asked to categorize wrong answers
    #[serde(default = "default_judge_model")]
    pub judge_model: String,
}

/// Retry policy for inference calls
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_limit")]
    pub limit: u32,
    /// Multiplier for the backoff delay; 0 disables waiting
    #[serde(default = "default_backoff_scale")]
    pub backoff_scale: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            limit: default_retry_limit(),
            backoff_scale: default_backoff_scale(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_batch_size() -> usize {
    5
}

fn default_batch_limit() -> i64 {
    -1
}

fn default_take() -> u32 {
    1
}

fn default_seed() -> u64 {
    42
}

fn default_query_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    120
}

fn default_min_batch_millis() -> u64 {
    2000
}

fn default_max_tokens() -> u32 {
    200
}

fn default_judge_model() -> String {
    "gpt-4o".to_string()
}

fn default_retry_limit() -> u32 {
    5
}

fn default_backoff_scale() -> f64 {
    1.0
}

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Model registry
    pub models: Vec<ModelSpec>,
    pub experiment: Option<ExperimentConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Per-model token prices in USD per million tokens
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceTable {
    prices: BTreeMap<String, (f64, f64)>,
}

impl PriceTable {
    pub fn insert(&mut self, model: impl Into<String>, price_in: f64, price_out: f64) {
        self.prices.insert(model.into(), (price_in, price_out));
    }

    /// `(price_in, price_out)` for a model label
    pub fn get(&self, model: &str) -> Option<(f64, f64)> {
        self.prices.get(model).copied()
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config: {}", path.display()))
    }

    pub fn model(&self, name: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.name == name)
    }

    pub fn price_table(&self) -> PriceTable {
        let mut table = PriceTable::default();
        for spec in &self.models {
            table.insert(spec.name.clone(), spec.price_in, spec.price_out);
        }
        table
    }

    /// Check every label against the registry before any work starts
    pub fn validate_llms(&self, names: &[String]) -> Result<(), HarnessError> {
        match names.iter().find(|name| self.model(name).is_none()) {
            Some(unknown) => Err(HarnessError::UnknownModel(unknown.clone())),
            None => Ok(()),
        }
    }

    /// Enabled models, optionally restricted to `filter`, in registry order
    pub fn active_models(&self, filter: Option<&[String]>) -> Vec<String> {
        self.models
            .iter()
            .filter(|m| m.enabled)
            .filter(|m| filter.is_none_or(|names| names.contains(&m.name)))
            .map(|m| m.name.clone())
            .collect()
    }

    /// Directory holding experiment logs; `output` without an experiment section
    pub fn output_dir(&self) -> PathBuf {
        self.experiment
            .as_ref()
            .map_or_else(default_output_dir, |e| e.output_dir.clone())
    }

    pub fn experiment(&self) -> Result<&ExperimentConfig> {
        self.experiment
            .as_ref()
            .context("Config has no [experiment] section")
    }
}
