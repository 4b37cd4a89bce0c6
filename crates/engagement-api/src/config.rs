use std::path::Path;
use std::time::Duration;

use engagement_core::RankingConfig;
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};

/// Tunables for the view-dedupe gate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GateConfig {
    /// Window in which a second view by the same actor on the same entity is a duplicate.
    pub dedupe_window_ms: u64,
    pub rate_limit: u32,
    pub rate_window_ms: u64,
    /// Upper bound on waiting for the fast-store lock before failing closed.
    pub lock_timeout_ms: u64,
    pub route_class: String,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            dedupe_window_ms: 120_000,
            rate_limit: 10,
            rate_window_ms: 30_000,
            lock_timeout_ms: 250,
            route_class: "view".to_string(),
        }
    }
}

impl GateConfig {
    #[must_use]
    pub fn dedupe_window(&self) -> Duration {
        Duration::from_millis(self.dedupe_window_ms)
    }

    #[must_use]
    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// # Errors
    /// Returns [`ApiError::Config`] for zero windows, limits or timeouts, or a blank
    /// route class.
    pub fn validate(&self) -> ApiResult<()> {
        if self.dedupe_window_ms == 0 {
            return Err(ApiError::Config("gate.dedupe_window_ms MUST be > 0".to_string()));
        }
        if self.rate_limit == 0 {
            return Err(ApiError::Config("gate.rate_limit MUST be > 0".to_string()));
        }
        if self.rate_window_ms == 0 {
            return Err(ApiError::Config("gate.rate_window_ms MUST be > 0".to_string()));
        }
        if self.lock_timeout_ms == 0 {
            return Err(ApiError::Config("gate.lock_timeout_ms MUST be > 0".to_string()));
        }
        if self.route_class.trim().is_empty() {
            return Err(ApiError::Config("gate.route_class MUST be non-empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RankCacheConfig {
    /// Zero disables fresh cache hits; the last good ordering is still kept for fallback.
    pub ttl_ms: u64,
    pub max_entries: usize,
}

impl Default for RankCacheConfig {
    fn default() -> Self {
        Self { ttl_ms: 0, max_entries: 1_024 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngagementConfig {
    pub ranking: RankingConfig,
    pub gate: GateConfig,
    pub rank_cache: RankCacheConfig,
}

impl EngagementConfig {
    /// Parse and validate a YAML document. Missing keys take their defaults.
    ///
    /// # Errors
    /// Returns [`ApiError::Config`] when the YAML is malformed or a value is out of range.
    pub fn from_yaml_str(raw: &str) -> ApiResult<Self> {
        let config: Self = if raw.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(raw)
                .map_err(|err| ApiError::Config(format!("invalid engagement config: {err}")))?
        };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`ApiError::Config`] when the file cannot be read or fails validation.
    pub fn load(path: &Path) -> ApiResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            ApiError::Config(format!("failed to read config {}: {err}", path.display()))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// # Errors
    /// Returns [`ApiError::Config`] for the first out-of-range value.
    pub fn validate(&self) -> ApiResult<()> {
        self.ranking.validate()?;
        self.gate.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_tunables() -> Result<(), ApiError> {
        let config = EngagementConfig::from_yaml_str("")?;
        assert_eq!(config.gate.dedupe_window(), Duration::from_secs(120));
        assert_eq!(config.gate.rate_limit, 10);
        assert_eq!(config.gate.rate_window(), Duration::from_secs(30));
        assert!((config.ranking.weights.rating - 0.45).abs() < f64::EPSILON);
        assert!((config.ranking.prior.mean - 3.5).abs() < f64::EPSILON);
        assert_eq!(config.rank_cache.ttl_ms, 0);
        Ok(())
    }

    #[test]
    fn partial_yaml_overrides_only_named_keys() -> Result<(), ApiError> {
        let config = EngagementConfig::from_yaml_str(
            "ranking:\n  weights:\n    view: 0.5\ngate:\n  rate_limit: 3\nrank_cache:\n  ttl_ms: 5000\n",
        )?;
        assert!((config.ranking.weights.view - 0.5).abs() < f64::EPSILON);
        assert!((config.ranking.weights.comment - 0.35).abs() < f64::EPSILON);
        assert_eq!(config.gate.rate_limit, 3);
        assert_eq!(config.gate.rate_window_ms, 30_000);
        assert_eq!(config.rank_cache.ttl_ms, 5_000);
        Ok(())
    }

    #[test]
    fn rejects_negative_weight() {
        let result = EngagementConfig::from_yaml_str("ranking:\n  weights:\n    view: -0.1\n");
        assert!(matches!(result, Err(ApiError::Config(message)) if message.contains("weights")));
    }

    #[test]
    fn rejects_zero_rate_window() {
        let result = EngagementConfig::from_yaml_str("gate:\n  rate_window_ms: 0\n");
        assert!(matches!(result, Err(ApiError::Config(message)) if message.contains("rate_window_ms")));
    }

    #[test]
    fn rejects_malformed_yaml() {
        let result = EngagementConfig::from_yaml_str("gate: [1, 2");
        assert!(matches!(result, Err(ApiError::Config(_))));
    }
}
