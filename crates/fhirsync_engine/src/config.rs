//! Configuration for the synchronization engine.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Granularity of the mutual-exclusion scope held around each
/// transform-and-persist attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockScope {
    /// One write at a time across the whole engine.
    Global,
    /// One write at a time per owning configuration.
    #[default]
    PerConfiguration,
    /// One write at a time per source resource.
    PerResource,
}

/// Engine-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Retry applied to version conflicts. `max_attempts` counts the first try.
    pub conflict_retry: RetryConfig,
    /// Lock granularity.
    pub lock_scope: LockScope,
    /// Number of mutex stripes keys are hashed onto.
    pub lock_stripes: usize,
    /// Maximum entries per cache namespace.
    pub cache_capacity: usize,
    /// Queue listener settings.
    pub listener: ListenerConfig,
}

impl EngineConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            conflict_retry: RetryConfig::default(),
            lock_scope: LockScope::default(),
            lock_stripes: 64,
            cache_capacity: 10_000,
            listener: ListenerConfig::default(),
        }
    }

    /// Sets the conflict retry configuration.
    pub fn with_conflict_retry(mut self, retry: RetryConfig) -> Self {
        self.conflict_retry = retry;
        self
    }

    /// Sets the lock scope.
    pub fn with_lock_scope(mut self, scope: LockScope) -> Self {
        self.lock_scope = scope;
        self
    }

    /// Sets the cache capacity per namespace.
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Sets the listener configuration.
    pub fn with_listener(mut self, listener: ListenerConfig) -> Self {
        self.listener = listener;
        self
    }

    /// Loads a configuration from a JSON file. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidConfiguration`] if the file cannot be read
    /// or parsed, or fails [`EngineConfig::validate`].
    pub fn from_json_file(path: &Path) -> SyncResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SyncError::InvalidConfiguration(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            SyncError::InvalidConfiguration(format!("cannot parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the values can drive an engine.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidConfiguration`] naming the first bad value.
    pub fn validate(&self) -> SyncResult<()> {
        if self.conflict_retry.max_attempts == 0 {
            return Err(SyncError::InvalidConfiguration(
                "conflict_retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.lock_stripes == 0 {
            return Err(SyncError::InvalidConfiguration(
                "lock_stripes must be at least 1".into(),
            ));
        }
        if self.listener.workers == 0 {
            return Err(SyncError::InvalidConfiguration(
                "listener.workers must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Worker threads per listener.
    pub workers: usize,
    /// Whether FHIR-side changes are imported.
    pub import_enabled: bool,
    /// Whether registry-side changes are exported.
    pub export_enabled: bool,
    /// How long a worker waits for a message before checking for shutdown.
    #[serde(with = "millis")]
    pub receive_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            import_enabled: true,
            export_enabled: true,
            receive_timeout: Duration::from_millis(500),
        }
    }
}

/// How often a transform-and-persist attempt is repeated after the target
/// store reports a version conflict.
///
/// Every retry re-reads the target, so the default runs them back to back.
/// A non-zero `delay` doubles after each retry when `doubling` is set, up to
/// `max_delay`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts in total, the first one included.
    pub max_attempts: u32,
    /// Pause before the first retry.
    #[serde(with = "millis")]
    pub delay: Duration,
    #[serde(with = "millis")]
    #[allow(missing_docs)]
    pub max_delay: Duration,
    /// Double the pause after each retry.
    pub doubling: bool,
}

impl RetryConfig {
    /// `max_attempts` attempts with no pause between them.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            delay: Duration::ZERO,
            max_delay: Duration::from_secs(5),
            doubling: false,
        }
    }

    /// A single attempt. Conflicts surface immediately.
    pub fn once() -> Self {
        Self::new(1)
    }

    /// Pauses `delay` before each retry.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Doubles the pause after every retry, never exceeding `max_delay`.
    pub fn doubling_up_to(mut self, max_delay: Duration) -> Self {
        self.doubling = true;
        self.max_delay = max_delay;
        self
    }

    /// Pause before retry number `retry`, counting from 1. Retry 0 is the
    /// first attempt and never waits.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        if !self.doubling {
            return self.delay;
        }
        let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
        self.delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Serde helper writing durations as whole milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_allow_two_conflict_retries() {
        let config = EngineConfig::default();
        assert_eq!(config.conflict_retry.max_attempts, 3);
        assert_eq!(config.conflict_retry.delay_for_attempt(2), Duration::ZERO);
        assert_eq!(config.lock_scope, LockScope::PerConfiguration);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn fixed_pause_between_retries() {
        let retry = RetryConfig::new(4).with_delay(Duration::from_millis(20));
        assert_eq!(retry.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(20));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(20));
    }

    #[test]
    fn doubling_pause_is_capped() {
        let retry = RetryConfig::new(10)
            .with_delay(Duration::from_millis(100))
            .doubling_up_to(Duration::from_millis(500));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(retry.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(retry.delay_for_attempt(40), Duration::from_millis(500));
    }

    #[test]
    fn json_fills_missing_fields() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"lock_scope": "global", "listener": {"workers": 2, "receive_timeout": 50}}"#,
        )
        .unwrap();
        assert_eq!(config.lock_scope, LockScope::Global);
        assert_eq!(config.listener.workers, 2);
        assert_eq!(config.listener.receive_timeout, Duration::from_millis(50));
        assert!(config.listener.import_enabled);
        assert_eq!(config.cache_capacity, 10_000);
    }

    #[test]
    fn validation_rejects_zero_attempts() {
        let config = EngineConfig::new().with_conflict_retry(RetryConfig::new(0));
        assert!(matches!(
            config.validate(),
            Err(SyncError::InvalidConfiguration(_))
        ));
    }
}
