//! Registrar configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for one registrar instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RegistrarConfig {
    /// Lease time-to-live; rounded up to whole seconds by the directory.
    #[serde(with = "crate::humantime_serde")]
    pub lease_ttl: Duration,

    /// Re-registration policy after a lease is lost.
    pub recovery: RecoveryConfig,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(5),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl RegistrarConfig {
    #[must_use]
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }
}

/// Bounded retry around the re-registration sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RecoveryConfig {
    /// Attempts per loss event, including the first (minimum 1).
    pub max_attempts: u32,

    /// Delay after the first failed attempt.
    #[serde(with = "crate::humantime_serde")]
    pub initial_backoff: Duration,

    /// Upper bound for any single delay.
    #[serde(with = "crate::humantime_serde")]
    pub max_backoff: Duration,

    /// Growth factor between consecutive delays.
    pub multiplier: f64,

    /// Add up to 25% random delay to spread out reconnecting instances.
    pub jitter: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RecoveryConfig {
    /// One attempt per loss event and no backoff.
    #[must_use]
    pub fn single_shot() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Fast settings for tests (1ms initial, 20ms max, no jitter).
    #[must_use]
    pub fn fast(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(20),
            multiplier: 2.0,
            jitter: false,
        }
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}
