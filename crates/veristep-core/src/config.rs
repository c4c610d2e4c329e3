use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const SUPPORTED_CONFIG_VERSION: u32 = 1;

/// Top-level YAML configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VeristepConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub judge: JudgeSettings,
    #[serde(default)]
    pub runner: RunnerSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

fn default_version() -> u32 {
    SUPPORTED_CONFIG_VERSION
}

impl Default for VeristepConfig {
    fn default() -> Self {
        Self {
            version: SUPPORTED_CONFIG_VERSION,
            judge: JudgeSettings::default(),
            runner: RunnerSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

/// Provider settings for the judge capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeSettings {
    /// "openai" or "fake".
    pub provider: String,
    pub model: String,
    pub api_key_env: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for JudgeSettings {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.0,
            max_tokens: 1500,
            timeout_secs: 120,
        }
    }
}

/// Evaluation pacing, retry bounds and concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    /// Case-level parallelism (counting-semaphore width).
    pub parallel: usize,
    /// Judge attempts per step before the step resolves to NeedDiscussion.
    pub max_judge_retries: u32,
    pub retry_delay_ms: u64,
    /// Pacing delay before the first judge call of a case; 0 disables.
    pub pre_call_delay_ms: u64,
    /// Hard cap on correction rounds per step during optimization.
    pub optimizer_rounds: u32,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            parallel: 4,
            max_judge_retries: 5,
            retry_delay_ms: 3000,
            pre_call_delay_ms: 3000,
            optimizer_rounds: 6,
        }
    }
}

/// Durable-state locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub rules_dir: PathBuf,
    pub examples_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            rules_dir: PathBuf::from("rules"),
            examples_path: PathBuf::from("rules/cases.json"),
        }
    }
}

pub fn load_config(path: &Path) -> Result<VeristepConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError(format!("failed to read config {}: {}", path.display(), e)))?;
    let cfg: VeristepConfig = serde_yaml::from_str(&raw)
        .map_err(|e| ConfigError(format!("failed to parse YAML: {}", e)))?;
    if cfg.version != SUPPORTED_CONFIG_VERSION {
        return Err(ConfigError(format!(
            "unsupported config version {} (supported: {})",
            cfg.version, SUPPORTED_CONFIG_VERSION
        )));
    }
    Ok(cfg)
}
