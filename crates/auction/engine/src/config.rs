//! Configuration for the auction engine

use std::time::Duration;

use auction_types::KAnonMode;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker process limits
    #[serde(default)]
    pub processes: ProcessConfig,

    /// Bid generation limits
    #[serde(default)]
    pub bidding: BiddingConfig,

    /// Scoring limits
    #[serde(default)]
    pub scoring: ScoringConfig,

    /// k-anonymity enforcement
    #[serde(default)]
    pub kanon: KAnonConfig,

    /// Reporting behaviour
    #[serde(default)]
    pub reporting: ReportingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Worker process limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Maximum concurrent bidder processes
    #[serde(default = "default_max_bidder_processes")]
    pub max_bidder_processes: usize,

    /// Maximum concurrent seller processes
    #[serde(default = "default_max_seller_processes")]
    pub max_seller_processes: usize,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            max_bidder_processes: default_max_bidder_processes(),
            max_seller_processes: default_max_seller_processes(),
        }
    }
}

/// Bid generation limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BiddingConfig {
    /// Ceiling applied to every per-buyer timeout, in milliseconds
    #[serde(default = "default_max_timeout_ms")]
    pub max_per_buyer_timeout_ms: u64,

    /// Maximum ad components in one bid
    #[serde(default = "default_max_ad_components")]
    pub max_ad_components: usize,

    /// Interest groups per buyer when the auction sets no limit
    #[serde(default = "default_group_limit")]
    pub default_group_limit: u16,
}

impl Default for BiddingConfig {
    fn default() -> Self {
        Self {
            max_per_buyer_timeout_ms: default_max_timeout_ms(),
            max_ad_components: default_max_ad_components(),
            default_group_limit: default_group_limit(),
        }
    }
}

impl BiddingConfig {
    pub fn max_per_buyer_timeout(&self) -> Duration {
        Duration::from_millis(self.max_per_buyer_timeout_ms)
    }
}

/// Scoring limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Ceiling applied to the seller timeout, in milliseconds
    #[serde(default = "default_max_timeout_ms")]
    pub max_seller_timeout_ms: u64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            max_seller_timeout_ms: default_max_timeout_ms(),
        }
    }
}

impl ScoringConfig {
    pub fn max_seller_timeout(&self) -> Duration {
        Duration::from_millis(self.max_seller_timeout_ms)
    }
}

/// k-anonymity enforcement
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KAnonConfig {
    #[serde(default)]
    pub mode: KAnonMode,
}

/// Reporting behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportingConfig {
    /// Significant bits kept when rounding values shown to reporting
    #[serde(default = "default_rounding_bits")]
    pub rounding_bits: u32,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            rounding_bits: default_rounding_bits(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_max_bidder_processes() -> usize {
    10
}

fn default_max_seller_processes() -> usize {
    3
}

fn default_max_timeout_ms() -> u64 {
    500
}

fn default_max_ad_components() -> usize {
    20
}

fn default_group_limit() -> u16 {
    u16::MAX
}

fn default_rounding_bits() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

impl EngineConfig {
    /// Load configuration: defaults, then an optional file, then
    /// `AUCTION_*` environment variables (`AUCTION_KANON__MODE=enforce`).
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&EngineConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("AUCTION")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.processes.max_bidder_processes == 0 || self.processes.max_seller_processes == 0 {
            return Err(ConfigError::Invalid(
                "process limits must be at least 1".to_string(),
            ));
        }
        if !(1..=52).contains(&self.reporting.rounding_bits) {
            return Err(ConfigError::Invalid(format!(
                "rounding_bits must be between 1 and 52, got {}",
                self.reporting.rounding_bits
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.processes.max_bidder_processes, 10);
        assert_eq!(config.processes.max_seller_processes, 3);
        assert_eq!(config.bidding.max_per_buyer_timeout(), Duration::from_millis(500));
        assert_eq!(config.bidding.max_ad_components, 20);
        assert_eq!(config.reporting.rounding_bits, 8);
        assert_eq!(config.kanon.mode, KAnonMode::Disabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = EngineConfig::load(None).unwrap();
        assert_eq!(config.bidding.default_group_limit, u16::MAX);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"kanon": {"mode": "enforce"}, "processes": {"max_bidder_processes": 2}}"#)
                .unwrap();
        assert_eq!(config.kanon.mode, KAnonMode::Enforce);
        assert_eq!(config.processes.max_bidder_processes, 2);
        assert_eq!(config.processes.max_seller_processes, 3);
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = EngineConfig::default();
        config.processes.max_seller_processes = 0;
        assert!(config.validate().is_err());
        let mut config = EngineConfig::default();
        config.reporting.rounding_bits = 0;
        assert!(config.validate().is_err());
    }
}
