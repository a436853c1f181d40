use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};
use crate::quota::QuotaLimit;

/// Configuration for the quota engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Free-tier allowance per period
    #[serde(default = "default_free_tier_limit")]
    pub free_tier_limit: u32,

    /// Length of the rolling usage period in days
    #[serde(default = "default_period_days")]
    pub period_days: i64,

    /// Whether to admit (true) or deny (false) when the usage record store
    /// is unavailable on the check path
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,

    /// Remaining-count threshold at or below which the projected status
    /// switches to the warning band
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: u32,

    /// Timeout for store and oracle Redis operations in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub redis_timeout_ms: u64,

    /// TTL for cached subscription views in milliseconds
    #[serde(default = "default_subscription_cache_ttl_ms")]
    pub subscription_cache_ttl_ms: u64,

    /// Maximum number of cached subscription views
    #[serde(default = "default_subscription_cache_size")]
    pub subscription_cache_size: u64,
}

fn default_free_tier_limit() -> u32 {
    5
}

fn default_period_days() -> i64 {
    30
}

fn default_fail_open() -> bool {
    true
}

fn default_warning_threshold() -> u32 {
    1
}

fn default_redis_timeout_ms() -> u64 {
    500
}

fn default_subscription_cache_ttl_ms() -> u64 {
    5000
}

fn default_subscription_cache_size() -> u64 {
    10_000
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            free_tier_limit: default_free_tier_limit(),
            period_days: default_period_days(),
            fail_open: default_fail_open(),
            warning_threshold: default_warning_threshold(),
            redis_timeout_ms: default_redis_timeout_ms(),
            subscription_cache_ttl_ms: default_subscription_cache_ttl_ms(),
            subscription_cache_size: default_subscription_cache_size(),
        }
    }
}

impl QuotaConfig {
    /// The free-tier limit as a quota limit value.
    pub fn limit(&self) -> QuotaLimit {
        QuotaLimit::Limited(self.free_tier_limit)
    }

    /// Length of one usage period.
    pub fn period(&self) -> chrono::Duration {
        chrono::Duration::days(self.period_days)
    }

    pub fn redis_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.redis_timeout_ms)
    }
}

/// Top-level configuration file contents.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
}

/// Gateway process configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            redis_url: default_redis_url(),
        }
    }
}

impl Config {
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file {}: {e}", path.display()),
            })
        })?;
        Self::load_from_toml(&raw)
    }

    pub fn load_from_toml(raw: &str) -> Result<Self, Error> {
        toml::from_str(raw).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config file: {e}"),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_config_defaults() {
        let config = QuotaConfig::default();
        assert_eq!(config.free_tier_limit, 5);
        assert_eq!(config.period_days, 30);
        assert!(config.fail_open);
        assert_eq!(config.warning_threshold, 1);
        assert_eq!(config.limit(), QuotaLimit::Limited(5));
        assert_eq!(config.period(), chrono::Duration::days(30));
    }

    #[test]
    fn test_load_from_toml() {
        let raw = r#"
[gateway]
bind_address = "0.0.0.0:8080"
redis_url = "redis://redis.internal:6379"

[quota]
free_tier_limit = 10
fail_open = false
"#;
        let config = Config::load_from_toml(raw).unwrap();
        assert_eq!(config.gateway.bind_address.port(), 8080);
        assert_eq!(config.quota.free_tier_limit, 10);
        assert!(!config.quota.fail_open);
        // Unspecified fields fall back to defaults
        assert_eq!(config.quota.period_days, 30);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::load_from_toml("").unwrap();
        assert_eq!(config.quota.free_tier_limit, 5);
        assert_eq!(config.gateway.redis_url, "redis://127.0.0.1:6379");
    }

    #[test]
    fn test_invalid_toml_is_a_config_error() {
        let result = Config::load_from_toml("[quota\nfree_tier_limit = 5");
        assert!(result.is_err());
    }
}
