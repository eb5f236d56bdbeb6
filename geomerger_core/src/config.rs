//! Merging parameters and the stage's TOML configuration file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable naming the stage config file.
pub const CONFIG_ENV_VAR: &str = "GEOMERGER_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Which merger drives the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Per-source position tracks, emits the extrapolated state
    #[default]
    WorldModel,

    /// Sliding window over raw frames, emits merged slices
    Windowed,
}

/// Parameters of both merger strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergingConfig {
    /// Merge threshold in meters (default: 2.0)
    pub max_distance_m: f64,

    /// Target span of the windowed buffer (default: 1000 ms)
    pub merging_window_ms: i64,

    /// Output messages per second (default: 10)
    pub target_mps: u32,

    /// Identities and tracks untouched for longer than this expire (default: 5 s)
    pub expire_ids_after_ms: u64,

    /// Minimum time between two expiration sweeps (default: 1 s)
    pub expiration_sweep_interval_ms: u64,

    /// Only match detections of equal class
    pub class_gating: bool,

    /// Destination of merged frames; also their source id
    pub output_stream_id: String,

    /// Streams consumed by the stage
    pub input_stream_ids: Vec<String>,

    pub strategy: Strategy,
}

impl Default for MergingConfig {
    fn default() -> Self {
        Self {
            max_distance_m: 2.0,
            merging_window_ms: 1000,
            target_mps: 10,
            expire_ids_after_ms: 5_000,
            expiration_sweep_interval_ms: 1_000,
            class_gating: false,
            output_stream_id: "merged".to_string(),
            input_stream_ids: vec!["stream1".to_string()],
            strategy: Strategy::WorldModel,
        }
    }
}

impl MergingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.max_distance_m > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "max_distance_m must be positive, got {}",
                self.max_distance_m
            )));
        }
        if self.merging_window_ms <= 0 {
            return Err(ConfigError::Invalid(format!(
                "merging_window_ms must be positive, got {}",
                self.merging_window_ms
            )));
        }
        if self.target_mps == 0 {
            return Err(ConfigError::Invalid("target_mps must be positive".to_string()));
        }
        if self.expire_ids_after_ms == 0 {
            return Err(ConfigError::Invalid("expire_ids_after_ms must be positive".to_string()));
        }
        if self.output_stream_id.is_empty() {
            return Err(ConfigError::Invalid("output_stream_id must not be empty".to_string()));
        }
        if self.input_stream_ids.is_empty() {
            return Err(ConfigError::Invalid("input_stream_ids must not be empty".to_string()));
        }
        Ok(())
    }

    /// Minimum slice length / emission period, `ceil(1000 / target_mps)` ms.
    pub fn min_slice_ms(&self) -> i64 {
        let mps = i64::from(self.target_mps.max(1));
        (1000 + mps - 1) / mps
    }

    pub fn expiration_age(&self) -> Duration {
        Duration::from_millis(self.expire_ids_after_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.expiration_sweep_interval_ms)
    }
}

/// Stream naming on the message bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub input_stream_prefix: String,
    pub output_stream_prefix: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            input_stream_prefix: "objecttracker".to_string(),
            output_stream_prefix: "geomerger".to_string(),
        }
    }
}

/// Everything the stage reads from its config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub log_level: String,
    pub bus: BusConfig,
    pub merging: MergingConfig,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            bus: BusConfig::default(),
            merging: MergingConfig::default(),
        }
    }
}

impl StageConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: StageConfig = toml::from_str(s)?;
        config.merging.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Loads `path`, else the file named by [`CONFIG_ENV_VAR`], else defaults.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => match std::env::var_os(CONFIG_ENV_VAR) {
                Some(path) => Self::load(path),
                None => Ok(Self::default()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(MergingConfig::default().validate().is_ok());
    }

    #[test]
    fn test_min_slice_ms_rounds_up() {
        let mut config = MergingConfig::default();
        assert_eq!(config.min_slice_ms(), 100);

        config.target_mps = 3;
        assert_eq!(config.min_slice_ms(), 334);

        config.target_mps = 1;
        assert_eq!(config.min_slice_ms(), 1000);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = StageConfig::from_toml_str(
            r#"
            log_level = "debug"

            [merging]
            max_distance_m = 3.5
            strategy = "windowed"
            input_stream_ids = ["cam1", "cam2"]
            "#,
        )
        .unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.bus, BusConfig::default());
        assert_eq!(config.merging.max_distance_m, 3.5);
        assert_eq!(config.merging.strategy, Strategy::Windowed);
        assert_eq!(config.merging.target_mps, 10);
        assert_eq!(config.merging.input_stream_ids.len(), 2);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let err = StageConfig::from_toml_str("[merging]\nmax_distance_m = -1.0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = StageConfig::from_toml_str("[merging]\ninput_stream_ids = []").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = StageConfig::from_toml_str("[merging]\ntarget_mps = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_malformed_toml() {
        let err = StageConfig::from_toml_str("merging = [").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
