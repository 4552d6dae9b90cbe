//! Agent configuration
//!
//! Layers, lowest precedence first: built-in defaults, an optional TOML file,
//! then `FOREST__SECTION__KEY` environment variables. Command-line flags are
//! applied on top by the caller. The provider credential is never read from
//! here.

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use forest_lib::{
    ClassifierConfig, PreprocessConfig, ProviderConfig, ScheduleConfig, StageTimeouts,
    StoreConfig,
};
use serde::Deserialize;
use std::path::Path;

/// File looked up in the working directory when `--config` is not given
pub const DEFAULT_CONFIG_FILE: &str = "forest-agent";

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Name attached to structured log events
    pub instance_name: String,

    /// API server port for health/metrics
    pub api_port: u16,

    pub provider: ProviderConfig,
    pub preprocess: PreprocessConfig,
    pub classifier: ClassifierConfig,
    pub store: StoreConfig,
    pub timeouts: StageTimeouts,
    pub schedule: ScheduleConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            api_port: 8080,
            provider: ProviderConfig::default(),
            preprocess: PreprocessConfig::default(),
            classifier: ClassifierConfig::default(),
            store: StoreConfig::default(),
            timeouts: StageTimeouts::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

fn default_instance_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "forest-agent".to_string())
}

impl AgentConfig {
    /// Load configuration from an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => File::from(p).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let config = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("FOREST")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read configuration")?;

        config
            .try_deserialize()
            .context("invalid configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forest_lib::classifier::ClassifierKind;
    use forest_lib::scheduler::OverrunPolicy;
    use forest_lib::{ConflictPolicy, ProviderProfile};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn toml_file() -> NamedTempFile {
        tempfile::Builder::new().suffix(".toml").tempfile().unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.provider.profile, ProviderProfile::EarthAssets);
        assert_eq!(config.classifier.kind, ClassifierKind::VegetationIndex);
        assert_eq!(config.store.conflict_policy, ConflictPolicy::Replace);
        assert_eq!(config.schedule.overrun, OverrunPolicy::Skip);
        assert_eq!(config.classifier.labels.len(), 3);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = toml_file();
        writeln!(
            file,
            r#"
api_port = 9100

[provider]
profile = "direct-download"
base_url = "https://imagery.example.test/download"

[store]
path = "/var/lib/forest/results.db"
conflict_policy = "reject"

[classifier]
kind = "onnx"
model_path = "/models/forest.onnx"
output = "probabilities"
labels = ["Healthy", "Degraded", "Deforested", "Water"]

[schedule]
overrun = "queue"
lag_days = 2

[schedule.retry]
max_attempts = 5
"#
        )
        .unwrap();

        let config = AgentConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.api_port, 9100);
        assert_eq!(config.provider.profile, ProviderProfile::DirectDownload);
        assert_eq!(config.provider.resolution_deg, 0.1);
        assert_eq!(config.store.conflict_policy, ConflictPolicy::Reject);
        assert_eq!(config.classifier.kind, ClassifierKind::Onnx);
        assert_eq!(config.classifier.labels.len(), 4);
        assert_eq!(config.schedule.overrun, OverrunPolicy::Queue);
        assert_eq!(config.schedule.lag_days, 2);
        assert_eq!(config.schedule.retry.max_attempts, 5);
        assert_eq!(config.schedule.retry.initial_backoff_secs, 30);
        assert_eq!(config.timeouts.acquisition_secs, 120);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        assert!(AgentConfig::load(Some(Path::new("/nonexistent/forest-agent.toml"))).is_err());
    }

    #[test]
    fn test_invalid_labels_rejected() {
        let mut file = toml_file();
        writeln!(file, "[classifier]\nlabels = []").unwrap();
        assert!(AgentConfig::load(Some(file.path())).is_err());
    }
}
