//! Unified configuration for the learner, the parameter server and the
//! scheduler.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults
//!
//! # Example config file (sparsebcd.toml)
//! ```toml
//! [learner]
//! data_in = "data/train.libsvm"
//! data_val = "data/val.libsvm"
//! max_num_epochs = 5
//! num_feature_group_bits = 4
//!
//! [server]
//! sync_mode = true
//! num_workers = 4
//!
//! [scheduler]
//! job_timeout_secs = 600
//! ```
//!
//! Environment variables use the `SPARSEBCD_` prefix with `__` between
//! section and key, e.g. `SPARSEBCD_LEARNER__MAX_NUM_EPOCHS=3`.

mod defaults;

pub use defaults::*;

use crate::feature_map::validate_nbit;
use crate::server::protocol::ValueCodes;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnerConfig {
    pub learner: LearnerSection,
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
}

impl LearnerConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    pub fn load(config_path: Option<&str>, overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(LearnerConfig::default()));

        // Layer 1: Config file (if provided)
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Layer 2: Environment variables with SPARSEBCD_ prefix
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        // Layer 3: CLI overrides
        figment = figment.merge(Serialized::defaults(overrides));

        let config: LearnerConfig = figment.extract().map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment and optional config file only (no CLI overrides)
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_nbit(self.learner.num_feature_group_bits).map_err(|e| ConfigError::new(e.to_string()))?;
        if self.server.num_workers == 0 {
            return Err(ConfigError::new("server.num_workers must be at least 1"));
        }
        if self.learner.chunk_bytes == 0 {
            return Err(ConfigError::new("learner.chunk_bytes must be positive"));
        }
        let codes = self.server.value_codes;
        if codes.fea_count == codes.weight || codes.weight == codes.gradient || codes.fea_count == codes.gradient {
            return Err(ConfigError::new("server.value_codes must be distinct"));
        }
        Ok(())
    }
}

/// Data and training-loop parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnerSection {
    /// Training data source
    pub data_in: String,
    /// Validation data source; validation is skipped when unset
    pub data_val: Option<String>,
    pub max_num_epochs: usize,
    /// `log2` of the number of feature blocks; a multiple of 4, at most 16
    pub num_feature_group_bits: u32,
    /// Features with a global count at or below this are dropped
    pub tail_feature_filter: f32,
    /// Raw bytes per shard
    pub chunk_bytes: usize,
    /// Where to dump the trained model, if anywhere
    pub model_out: Option<PathBuf>,
    /// Include auxiliary state (feature counts) in dumps
    pub dump_aux: bool,
    /// Byte-reverse feature ids in dumps
    pub need_reverse: bool,
}

impl Default for LearnerSection {
    fn default() -> Self {
        Self {
            data_in: String::new(),
            data_val: None,
            max_num_epochs: DEFAULT_MAX_NUM_EPOCHS,
            num_feature_group_bits: DEFAULT_NUM_FEATURE_GROUP_BITS,
            tail_feature_filter: DEFAULT_TAIL_FEATURE_FILTER,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            model_out: None,
            dump_aux: false,
            need_reverse: false,
        }
    }
}

/// Parameter server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Merge gradient pushes in synchronous rounds
    pub sync_mode: bool,
    /// Number of workers, and so the size of a synchronous round
    pub num_workers: usize,
    pub value_codes: ValueCodes,
    pub learning_rate: f32,
    pub l2: f32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            sync_mode: false,
            num_workers: default_num_workers(),
            value_codes: ValueCodes::default(),
            learning_rate: DEFAULT_LEARNING_RATE,
            l2: DEFAULT_L2,
        }
    }
}

/// Job failure policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Abort when a batch of jobs is not drained within this; unbounded when unset
    pub job_timeout_secs: Option<u64>,
    pub max_job_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            job_timeout_secs: None,
            max_job_retries: DEFAULT_MAX_JOB_RETRIES,
        }
    }
}

impl SchedulerConfig {
    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learner: Option<LearnerOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnerOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_in: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_val: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_num_epochs: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_out: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_workers: Option<usize>,
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = LearnerConfig::default();
        assert_eq!(config.learner.max_num_epochs, DEFAULT_MAX_NUM_EPOCHS);
        assert_eq!(config.learner.chunk_bytes, 256 * 1024 * 1024);
        assert!(!config.server.sync_mode);
        assert_eq!(config.server.value_codes.gradient, 3);
        assert!(config.scheduler.job_timeout().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_then_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[learner]\ndata_in = \"train.txt\"\nmax_num_epochs = 3\n\n[server]\nsync_mode = true\nnum_workers = 2\n\n[scheduler]\njob_timeout_secs = 30"
        )
        .unwrap();
        let overrides = ConfigOverrides {
            learner: Some(LearnerOverrides {
                max_num_epochs: Some(7),
                ..LearnerOverrides::default()
            }),
            ..ConfigOverrides::default()
        };
        let config = LearnerConfig::load(file.path().to_str(), overrides).unwrap();
        assert_eq!(config.learner.data_in, "train.txt");
        assert_eq!(config.learner.max_num_epochs, 7);
        assert!(config.server.sync_mode);
        assert_eq!(config.server.num_workers, 2);
        assert_eq!(config.scheduler.job_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = LearnerConfig::default();
        config.learner.num_feature_group_bits = 6;
        assert!(config.validate().is_err());

        let mut config = LearnerConfig::default();
        config.server.num_workers = 0;
        assert!(config.validate().is_err());

        let mut config = LearnerConfig::default();
        config.server.value_codes.weight = config.server.value_codes.gradient;
        assert!(config.validate().is_err());
    }
}
