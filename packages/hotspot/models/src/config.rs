//! Tunable parameters of the aggregation engine.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! default_radius_meters = 500
//! max_active_clusters = 10000
//! half_life_days = 30.0
//! dormancy_floor_score = 0.05
//! ```

use std::path::Path;
use std::time::Duration;

use crime_watch_crime_models::Severity;
use serde::{Deserialize, Serialize};

/// Errors that can occur while loading a [`HotspotConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The config file is not valid TOML or has mistyped fields.
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field holds a value the engine cannot work with.
    #[error("Invalid config value for `{field}`: {message}")]
    Invalid {
        /// Name of the offending field.
        field: &'static str,
        /// Description of what went wrong.
        message: String,
    },
}

/// Configuration of the clustering engine, scorer, and alerting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotspotConfig {
    /// Membership radius of newly created clusters.
    #[serde(default = "default_radius_meters")]
    pub default_radius_meters: u32,
    /// Maximum number of clusters that may be active at once.
    #[serde(default = "default_max_active_clusters")]
    pub max_active_clusters: usize,
    /// Half-life of the recency decay, in days.
    #[serde(default = "default_half_life_days")]
    pub half_life_days: f64,
    /// Clusters scoring below this are retired by reconciliation.
    #[serde(default = "default_dormancy_floor_score")]
    pub dormancy_floor_score: f64,
    /// Clusters with fewer members than this are retired by reconciliation.
    #[serde(default = "default_dormancy_min_members")]
    pub dormancy_min_members: u32,
    /// Lower bound of the recency decay factor.
    #[serde(default = "default_decay_epsilon")]
    pub decay_epsilon: f64,
    /// Upper bound of a cluster's severity score.
    #[serde(default = "default_score_cap")]
    pub score_cap: f64,
    /// Fraction of the radius a centroid may drift from its anchor before
    /// reconciliation re-partitions the cluster.
    #[serde(default = "default_drift_fraction")]
    pub drift_fraction: f64,
    /// How long a single attempt waits for a cluster lock.
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
    /// How many times acquiring a cluster lock is retried after the first
    /// attempt times out.
    #[serde(default = "default_lock_retry_attempts")]
    pub lock_retry_attempts: u32,
    /// Base of the exponential backoff between lock attempts.
    #[serde(default = "default_lock_backoff_base_ms")]
    pub lock_backoff_base_ms: u64,
    /// Score at which a hotspot alerts the users watching it.
    #[serde(default = "default_hotspot_alert_threshold")]
    pub hotspot_alert_threshold: f64,
    /// Minimum severity of an incident that alerts users watching its area.
    #[serde(default = "default_incident_alert_min_severity")]
    pub incident_alert_min_severity: Severity,
    /// Capacity of the change event channel per subscriber.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

const fn default_radius_meters() -> u32 {
    500
}

const fn default_max_active_clusters() -> usize {
    10_000
}

const fn default_half_life_days() -> f64 {
    30.0
}

const fn default_dormancy_floor_score() -> f64 {
    0.05
}

const fn default_dormancy_min_members() -> u32 {
    1
}

const fn default_decay_epsilon() -> f64 {
    1e-3
}

const fn default_score_cap() -> f64 {
    10.0
}

const fn default_drift_fraction() -> f64 {
    0.5
}

const fn default_lock_wait_ms() -> u64 {
    250
}

const fn default_lock_retry_attempts() -> u32 {
    3
}

const fn default_lock_backoff_base_ms() -> u64 {
    10
}

const fn default_hotspot_alert_threshold() -> f64 {
    5.0
}

const fn default_incident_alert_min_severity() -> Severity {
    Severity::High
}

const fn default_event_buffer() -> usize {
    1024
}

impl Default for HotspotConfig {
    fn default() -> Self {
        Self {
            default_radius_meters: default_radius_meters(),
            max_active_clusters: default_max_active_clusters(),
            half_life_days: default_half_life_days(),
            dormancy_floor_score: default_dormancy_floor_score(),
            dormancy_min_members: default_dormancy_min_members(),
            decay_epsilon: default_decay_epsilon(),
            score_cap: default_score_cap(),
            drift_fraction: default_drift_fraction(),
            lock_wait_ms: default_lock_wait_ms(),
            lock_retry_attempts: default_lock_retry_attempts(),
            lock_backoff_base_ms: default_lock_backoff_base_ms(),
            hotspot_alert_threshold: default_hotspot_alert_threshold(),
            incident_alert_min_severity: default_incident_alert_min_severity(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl HotspotConfig {
    /// Parses and validates a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the TOML is malformed or a value is out of
    /// range.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses, and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, is malformed, or
    /// holds an out-of-range value.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Checks that every value is usable by the engine.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_radius_meters == 0 {
            return Err(invalid("default_radius_meters", "must be greater than 0"));
        }
        if self.max_active_clusters == 0 {
            return Err(invalid("max_active_clusters", "must be greater than 0"));
        }
        if !(self.half_life_days.is_finite() && self.half_life_days > 0.0) {
            return Err(invalid("half_life_days", "must be a positive number"));
        }
        if !(self.decay_epsilon > 0.0 && self.decay_epsilon < 1.0) {
            return Err(invalid("decay_epsilon", "must be between 0 and 1"));
        }
        if !(self.score_cap.is_finite() && self.score_cap > 0.0) {
            return Err(invalid("score_cap", "must be a positive number"));
        }
        if !(self.dormancy_floor_score >= 0.0 && self.dormancy_floor_score < self.score_cap) {
            return Err(invalid(
                "dormancy_floor_score",
                "must be at least 0 and below score_cap",
            ));
        }
        if !(self.drift_fraction.is_finite() && self.drift_fraction > 0.0) {
            return Err(invalid("drift_fraction", "must be a positive number"));
        }
        if self.lock_wait_ms == 0 {
            return Err(invalid("lock_wait_ms", "must be greater than 0"));
        }
        if self.event_buffer == 0 {
            return Err(invalid("event_buffer", "must be greater than 0"));
        }
        Ok(())
    }

    /// Membership radius of new clusters, in meters.
    #[must_use]
    pub fn radius_meters(&self) -> f64 {
        f64::from(self.default_radius_meters)
    }

    /// Per-attempt wait for a cluster lock.
    #[must_use]
    pub const fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    /// Backoff before retry number `attempt` (1-based).
    #[must_use]
    pub const fn lock_backoff(&self, attempt: u32) -> Duration {
        match self
            .lock_backoff_base_ms
            .checked_shl(attempt.saturating_sub(1))
        {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_millis(u64::MAX),
        }
    }
}

fn invalid(field: &'static str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.to_string(),
    }
}
