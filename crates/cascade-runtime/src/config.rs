use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cascade_core::error::{CascadeError, Result};

use crate::driver::DriverConfig;
use crate::sweeper::SweeperConfig;

/// Root configuration for the cascade runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Persistent driver settings.
    #[serde(default)]
    pub driver: DriverSection,

    /// Timeout sweeper settings.
    #[serde(default)]
    pub sweeper: SweeperSection,
}

/// Driver settings as they appear in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSection {
    /// Default signal timeout in seconds.
    #[serde(default = "default_signal_timeout_secs")]
    pub default_signal_timeout_secs: u64,
}

impl Default for DriverSection {
    fn default() -> Self {
        Self {
            default_signal_timeout_secs: default_signal_timeout_secs(),
        }
    }
}

/// Sweeper settings as they appear in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperSection {
    /// Interval between sweeps in seconds.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Maximum instances cancelled per sweep.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

impl Default for SweeperSection {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

fn default_signal_timeout_secs() -> u64 {
    86400
}

fn default_check_interval_secs() -> u64 {
    300
}

fn default_max_batch_size() -> usize {
    100
}

impl RuntimeConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| CascadeError::Config(format!("Failed to read config file: {}", e)))?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from TOML text.
    pub fn parse_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| CascadeError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Driver configuration derived from this file.
    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            default_signal_timeout: Duration::from_secs(self.driver.default_signal_timeout_secs),
        }
    }

    /// Sweeper configuration derived from this file.
    pub fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig {
            check_interval: Duration::from_secs(self.sweeper.check_interval_secs),
            max_batch_size: self.sweeper.max_batch_size,
            ..SweeperConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.driver.default_signal_timeout_secs, 86400);
        assert_eq!(config.sweeper.check_interval_secs, 300);
        assert_eq!(config.sweeper.max_batch_size, 100);
    }

    #[test]
    fn test_parse_full_config() {
        let config = RuntimeConfig::parse_toml(
            r#"
            [driver]
            default_signal_timeout_secs = 3600

            [sweeper]
            check_interval_secs = 30
            max_batch_size = 25
            "#,
        )
        .unwrap();

        assert_eq!(
            config.driver_config().default_signal_timeout,
            Duration::from_secs(3600)
        );
        let sweeper = config.sweeper_config();
        assert_eq!(sweeper.check_interval, Duration::from_secs(30));
        assert_eq!(sweeper.max_batch_size, 25);
    }

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config = RuntimeConfig::parse_toml("").unwrap();
        assert_eq!(config.sweeper.max_batch_size, 100);
    }

    #[test]
    fn test_parse_invalid_config() {
        assert!(matches!(
            RuntimeConfig::parse_toml("sweeper = 12"),
            Err(CascadeError::Config(_))
        ));
    }
}
