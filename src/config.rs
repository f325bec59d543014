//! Configuration management for the scoring service

use crate::types::result::ModelRole;
use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/config.toml";

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub nats: NatsConfig,
    pub models: ModelsConfig,
    #[serde(default)]
    pub normalization: NormalizationConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// NATS JetStream configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    /// NATS server URL
    pub url: String,
    /// JetStream stream holding inbound transactions
    pub stream: String,
    /// Subject for incoming transactions
    pub transaction_subject: String,
    /// Durable consumer name; the stream cursor lives here
    pub durable_name: String,
    /// Subject for outgoing ensemble results
    pub result_subject: String,
    /// Seconds before an unacknowledged event is redelivered
    #[serde(default = "default_ack_wait_secs")]
    pub ack_wait_secs: u64,
    /// Delivery attempts before the server gives up on an event
    #[serde(default = "default_max_deliver")]
    pub max_deliver: i64,
}

fn default_ack_wait_secs() -> u64 {
    30
}

fn default_max_deliver() -> i64 {
    5
}

/// Model artifact configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    /// Directory containing ONNX model files
    pub models_dir: String,
    /// Per-role artifact file names, overriding the defaults
    #[serde(default)]
    pub artifacts: HashMap<ModelRole, String>,
    /// Score with whatever roles loaded instead of refusing to start
    #[serde(default)]
    pub degraded_mode: bool,
    /// Per-role weights; unlisted roles weigh 1.0
    #[serde(default)]
    pub weights: HashMap<ModelRole, f64>,
    /// Number of threads for ONNX inference per model (default: 1)
    #[serde(default = "default_onnx_threads")]
    pub onnx_threads: usize,
}

fn default_onnx_threads() -> usize {
    1
}

impl ModelsConfig {
    /// Resolved artifact path for a role
    pub fn artifact_path(&self, role: ModelRole) -> PathBuf {
        let file = self
            .artifacts
            .get(&role)
            .map(String::as_str)
            .unwrap_or_else(|| role.default_artifact());
        Path::new(&self.models_dir).join(file)
    }

    /// Weight for a role, defaulting to an unweighted mean
    pub fn weight(&self, role: ModelRole) -> f64 {
        self.weights.get(&role).copied().unwrap_or(1.0)
    }
}

/// Robust-scaling statistics for one feature, frozen at training time
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ScalingStats {
    pub median: f64,
    /// Interquartile range (q75 - q25)
    pub iqr: f64,
}

/// Normalization statistics for the scaled features
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct NormalizationConfig {
    pub amount: ScalingStats,
    pub time: ScalingStats,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        // Training-set statistics of the credit card dataset
        Self {
            amount: ScalingStats {
                median: 22.0,
                iqr: 71.565,
            },
            time: ScalingStats {
                median: 84692.0,
                iqr: 85119.0,
            },
        }
    }
}

/// Detection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    /// Fraud probability at or above which the verdict is FRAUD
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

fn default_threshold() -> f64 {
    0.5
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Maximum events processed concurrently
    pub workers: usize,
    /// Per-event processing budget in milliseconds
    pub timeout_ms: u64,
    /// Run the four models of one event on parallel threads
    #[serde(default = "default_parallel_models")]
    pub parallel_models: bool,
    /// Interval between metrics summaries
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,
}

fn default_parallel_models() -> bool {
    true
}

fn default_metrics_interval() -> u64 {
    30
}

impl PipelineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Results log configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_enabled")]
    pub enabled: bool,
    /// JSON-lines file receiving one line per dispatched result
    #[serde(default = "default_results_path")]
    pub results_path: String,
}

fn default_storage_enabled() -> bool {
    true
}

fn default_results_path() -> String {
    "data/results.jsonl".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: default_storage_enabled(),
            results_path: default_results_path(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl AppConfig {
    /// Load configuration from the default file
    pub fn load() -> Result<Self> {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific path, overlaid with
    /// `FRAUD_ENSEMBLE__SECTION__KEY` environment variables
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("FRAUD_ENSEMBLE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the scoring path cannot work with
    pub fn validate(&self) -> Result<()> {
        let threshold = self.detection.threshold;
        if !(0.0..=1.0).contains(&threshold) {
            bail!("detection.threshold must be within [0, 1], got {}", threshold);
        }
        if self.pipeline.workers == 0 {
            bail!("pipeline.workers must be at least 1");
        }
        if self.pipeline.timeout_ms == 0 {
            bail!("pipeline.timeout_ms must be positive");
        }
        for (role, weight) in &self.models.weights {
            if !weight.is_finite() || *weight < 0.0 {
                bail!("models.weights.{} must be a non-negative number", role);
            }
        }
        let total_weight: f64 = ModelRole::ALL.iter().map(|r| self.models.weight(*r)).sum();
        if total_weight <= 0.0 {
            bail!("models.weights must give at least one role a positive weight");
        }
        for (name, stats) in [
            ("amount", self.normalization.amount),
            ("time", self.normalization.time),
        ] {
            if !stats.median.is_finite() || !stats.iqr.is_finite() || stats.iqr <= 0.0 {
                bail!(
                    "normalization.{} needs a finite median and a positive iqr",
                    name
                );
            }
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            nats: NatsConfig {
                url: "nats://localhost:4222".to_string(),
                stream: "TRANSACTIONS".to_string(),
                transaction_subject: "transactions".to_string(),
                durable_name: "fraud-ensemble".to_string(),
                result_subject: "fraud.results".to_string(),
                ack_wait_secs: default_ack_wait_secs(),
                max_deliver: default_max_deliver(),
            },
            models: ModelsConfig {
                models_dir: "models".to_string(),
                artifacts: HashMap::new(),
                degraded_mode: false,
                weights: HashMap::new(),
                onnx_threads: 1,
            },
            normalization: NormalizationConfig::default(),
            detection: DetectionConfig::default(),
            pipeline: PipelineConfig {
                workers: 4,
                timeout_ms: 1000,
                parallel_models: true,
                metrics_interval_secs: 30,
            },
            storage: StorageConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.nats.url, "nats://localhost:4222");
        assert_eq!(config.detection.threshold, 0.5);
        assert!(!config.models.degraded_mode);
        assert_eq!(config.models.weight(ModelRole::Margin), 1.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_artifact_paths() {
        let mut config = AppConfig::default();
        assert_eq!(
            config.models.artifact_path(ModelRole::Neighbor),
            Path::new("models").join("kneighbors.onnx")
        );

        config
            .models
            .artifacts
            .insert(ModelRole::Tree, "tree_v2.onnx".to_string());
        assert_eq!(
            config.models.artifact_path(ModelRole::Tree),
            Path::new("models").join("tree_v2.onnx")
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.detection.threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.normalization.amount.iqr = 0.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.models.weights.insert(ModelRole::Linear, -1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_all_zero_weights() {
        let mut config = AppConfig::default();
        for role in ModelRole::ALL {
            config.models.weights.insert(role, 0.0);
        }
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("positive weight"));

        config.models.weights.insert(ModelRole::Tree, 0.5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[nats]
url = "nats://example:4222"
stream = "TX"
transaction_subject = "tx.in"
durable_name = "scorer"
result_subject = "tx.scored"

[models]
models_dir = "/opt/models"
degraded_mode = true

[models.weights]
tree = 2.0

[detection]
threshold = 0.4

[pipeline]
workers = 8
timeout_ms = 250

[logging]
level = "debug"
format = "json"
"#
        )
        .unwrap();

        let config = AppConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.nats.stream, "TX");
        assert_eq!(config.nats.max_deliver, 5);
        assert!(config.models.degraded_mode);
        assert_eq!(config.models.weight(ModelRole::Tree), 2.0);
        assert_eq!(config.models.weight(ModelRole::Linear), 1.0);
        assert_eq!(config.detection.threshold, 0.4);
        assert_eq!(config.pipeline.timeout(), Duration::from_millis(250));
        assert!(config.pipeline.parallel_models);
        assert_eq!(config.normalization, NormalizationConfig::default());
    }
}
