//! Engine configuration

use crate::error::ConfigError;
use blobflow_cascade::{CascadeConfig, FailurePolicy, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine configuration
///
/// Every field has a default, so an empty TOML document is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Deadline for one provider dispatch, in milliseconds
    pub dispatch_timeout_ms: u64,
    pub failure_policy: FailurePolicy,
    /// In-flight dispatches across all cascades
    pub max_concurrent_dispatches: usize,
    /// Materialized states kept in memory
    pub state_cache_capacity: u64,
    /// Broadcast buffer per subscriber
    pub notification_capacity: usize,
    /// Queue a cascade for every accepted delta
    pub auto_cascade: bool,
    pub cascade_queue_depth: usize,
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout_ms: 30_000,
            failure_policy: FailurePolicy::Continue,
            max_concurrent_dispatches: 64,
            state_cache_capacity: 10_000,
            notification_capacity: 1024,
            auto_cascade: false,
            cascade_queue_depth: 256,
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a TOML document
    ///
    /// # Errors
    /// Returns error on syntax errors, unknown keys or invalid values
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    ///
    /// # Errors
    /// Returns error if the file cannot be read or is invalid
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&input)
    }

    /// Render as TOML
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Reject values the engine cannot run with
    ///
    /// # Errors
    /// Names the first invalid field
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, bool); 5] = [
            ("dispatch_timeout_ms", self.dispatch_timeout_ms > 0),
            ("max_concurrent_dispatches", self.max_concurrent_dispatches > 0),
            ("retry.max_attempts", self.retry.max_attempts > 0),
            ("notification_capacity", self.notification_capacity > 0),
            ("cascade_queue_depth", self.cascade_queue_depth > 0),
        ];
        if let Some(&(field, _)) = checks.iter().find(|(_, ok)| !ok) {
            return Err(ConfigError::Invalid {
                field,
                reason: "must be greater than zero".into(),
            });
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::Invalid {
                field: "retry.initial_backoff_ms",
                reason: "must not exceed retry.max_backoff_ms".into(),
            });
        }
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_max_concurrent_dispatches(mut self, max: usize) -> Self {
        self.max_concurrent_dispatches = max;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_auto_cascade(mut self, enabled: bool) -> Self {
        self.auto_cascade = enabled;
        self
    }

    #[inline]
    #[must_use]
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    #[must_use]
    pub fn cascade(&self) -> CascadeConfig {
        CascadeConfig::default()
            .with_dispatch_timeout(self.dispatch_timeout())
            .with_failure_policy(self.failure_policy)
            .with_max_concurrent_dispatches(self.max_concurrent_dispatches)
    }
}

/// Retry schedule of the registry-backed dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5000,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_document_is_default() {
        assert_eq!(EngineConfig::from_toml_str("").unwrap(), EngineConfig::default());
    }

    #[test]
    fn partial_document_keeps_other_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            dispatch_timeout_ms = 500
            failure_policy = "skip_descendants"

            [retry]
            max_attempts = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.dispatch_timeout(), Duration::from_millis(500));
        assert_eq!(config.failure_policy, FailurePolicy::SkipDescendants);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_backoff_ms, 100);
        assert_eq!(config.max_concurrent_dispatches, 64);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            EngineConfig::from_toml_str("dispatch_timeout = 5"),
            Err(ConfigError::Parse(_))
        ));
        assert!(EngineConfig::from_toml_str("[retry]\nattempts = 2").is_err());
    }

    #[test]
    fn zero_values_are_rejected() {
        let err = EngineConfig::from_toml_str("max_concurrent_dispatches = 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "max_concurrent_dispatches",
                ..
            }
        ));
    }

    #[test]
    fn default_roundtrips_through_toml() {
        let rendered = EngineConfig::default().to_toml_string().unwrap();
        assert_eq!(
            EngineConfig::from_toml_str(&rendered).unwrap(),
            EngineConfig::default()
        );
    }

    #[test]
    fn builders_feed_cascade_config() {
        let config = EngineConfig::new()
            .with_dispatch_timeout(Duration::from_millis(250))
            .with_failure_policy(FailurePolicy::SkipDescendants)
            .with_max_concurrent_dispatches(4);
        let cascade = config.cascade();
        assert_eq!(cascade.dispatch_timeout, Duration::from_millis(250));
        assert_eq!(cascade.failure_policy, FailurePolicy::SkipDescendants);
        assert_eq!(cascade.max_concurrent_dispatches, 4);
        assert_eq!(config.retry.policy().max_attempts, 3);
    }
}
