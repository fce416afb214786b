//! Typed engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use tally_infra::PoolConfig;

use crate::error::ConfigError;

pub const MIN_POLL_INTERVAL_SECONDS: u64 = 10;
pub const MAX_POLL_INTERVAL_SECONDS: u64 = 120;

/// Settings consumed by the engine. Keys are camelCase in JSON; unknown keys
/// are rejected and missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct EngineConfig {
    /// Seconds between sync cycles, within [10, 120].
    pub poll_interval_seconds: u64,
    pub pool_size: usize,
    /// Every N-th cycle also rebuilds the heavy session report.
    pub heavy_refresh_every_n_cycles: u64,
    pub acquire_timeout_ms: u64,
    /// Retries after a failed compare-and-swap before a submission gives up.
    pub max_commit_retries: u32,
    pub retry_backoff_ms: u64,
    pub recent_history_limit: usize,
    pub report_row_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 30,
            pool_size: 10,
            heavy_refresh_every_n_cycles: 3,
            acquire_timeout_ms: 5_000,
            max_commit_retries: 3,
            retry_backoff_ms: 25,
            recent_history_limit: 15,
            report_row_limit: 100,
        }
    }
}

fn out_of_range(field: &'static str, value: impl ToString, expected: &'static str) -> ConfigError {
    ConfigError::OutOfRange {
        field,
        value: value.to_string(),
        expected,
    }
}

impl EngineConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_POLL_INTERVAL_SECONDS..=MAX_POLL_INTERVAL_SECONDS)
            .contains(&self.poll_interval_seconds)
        {
            return Err(out_of_range(
                "pollIntervalSeconds",
                self.poll_interval_seconds,
                "10..=120",
            ));
        }
        if self.pool_size == 0 {
            return Err(out_of_range("poolSize", self.pool_size, "> 0"));
        }
        if self.heavy_refresh_every_n_cycles == 0 {
            return Err(out_of_range(
                "heavyRefreshEveryNCycles",
                self.heavy_refresh_every_n_cycles,
                "> 0",
            ));
        }
        if self.acquire_timeout_ms == 0 {
            return Err(out_of_range("acquireTimeoutMs", self.acquire_timeout_ms, "> 0"));
        }
        if self.recent_history_limit == 0 {
            return Err(out_of_range("recentHistoryLimit", self.recent_history_limit, "> 0"));
        }
        if self.report_row_limit == 0 {
            return Err(out_of_range("reportRowLimit", self.report_row_limit, "> 0"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_size: self.pool_size,
            acquire_timeout: self.acquire_timeout(),
            ..PoolConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.pool_config().max_size, 10);
    }

    #[test]
    fn partial_document_keeps_defaults() {
        let config = EngineConfig::from_json_str(r#"{"pollIntervalSeconds": 45}"#).unwrap();
        assert_eq!(config.poll_interval_seconds, 45);
        assert_eq!(config.heavy_refresh_every_n_cycles, 3);
    }

    #[test]
    fn poll_interval_bounds() {
        for (secs, ok) in [(9, false), (10, true), (120, true), (121, false)] {
            let raw = format!(r#"{{"pollIntervalSeconds": {secs}}}"#);
            assert_eq!(EngineConfig::from_json_str(&raw).is_ok(), ok, "{secs}");
        }
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let err = EngineConfig::from_json_str(r#"{"poolSize": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { field: "poolSize", .. }));
        let err = EngineConfig::from_json_str(r#"{"heavyRefreshEveryNCycles": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { field: "heavyRefreshEveryNCycles", .. }));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = EngineConfig::from_json_str(r#"{"syncInterval": 30}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
