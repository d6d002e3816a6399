#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Incident-to-hotspot aggregation engine.
//!
//! Reports flow through three stages:
//!
//! 1. [`ingest`] validates a raw [`IncidentSubmission`] into a normalized
//!    [`Incident`], which is stored before anything else happens.
//! 2. [`engine::ClusterEngine`] assigns the incident to the nearest active
//!    cluster within the configured radius, or opens a new one.
//! 3. [`score`] recomputes the cluster's recency-weighted severity score and
//!    dominant crime type.
//!
//! [`pipeline::HotspotPipeline`] ties the stages together with persistence,
//! alerting, and the [`events::EventBus`] change feed.
//!
//! [`IncidentSubmission`]: crime_watch_hotspot_models::IncidentSubmission
//! [`Incident`]: crime_watch_hotspot_models::Incident

pub mod alerts;
pub mod clock;
pub mod cluster;
pub mod engine;
pub mod events;
pub mod ingest;
pub mod lock;
pub mod pipeline;
pub mod repository;
pub mod score;

use chrono::{DateTime, Utc};
use crime_watch_hotspot_models::ClusterId;

pub use repository::RepositoryError;

/// Reasons a submission is rejected before any state changes.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// A required field was absent or blank.
    #[error("Missing required field `{0}`")]
    MissingField(&'static str),

    /// The crime type is not part of the taxonomy.
    #[error("Unknown crime type `{0}`")]
    UnknownCrimeType(String),

    /// The severity is not one of `low`, `medium`, `high`, `critical`.
    #[error("Unknown severity `{0}`")]
    UnknownSeverity(String),

    /// Latitude or longitude is outside its valid range or not finite.
    #[error("Coordinates out of range: lat={lat}, lng={lng}")]
    CoordinatesOutOfRange {
        /// Submitted latitude.
        lat: f64,
        /// Submitted longitude.
        lng: f64,
    },

    /// The event time is later than the time of submission.
    #[error("Timestamp {timestamp} is in the future (now {now})")]
    FutureTimestamp {
        /// Submitted event time.
        timestamp: DateTime<Utc>,
        /// Time the submission was received.
        now: DateTime<Utc>,
    },

    /// A field is present but holds an unusable value.
    #[error("Invalid value for `{field}`: {message}")]
    InvalidField {
        /// Name of the offending field.
        field: &'static str,
        /// Description of what went wrong.
        message: String,
    },
}

/// Failures of the clustering stage. Neither is fatal: the incident stays
/// stored and is retried by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    /// Opening another cluster would exceed the active cluster limit.
    #[error("No capacity for a new cluster ({active} of {max} active)")]
    NoCapacity {
        /// Clusters active at the time of the attempt.
        active: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The cluster's update lock could not be acquired in time.
    #[error("Timed out waiting for cluster {cluster_id} after {attempts} attempts")]
    LockTimeout {
        /// Cluster whose lock was contended.
        cluster_id: ClusterId,
        /// Number of attempts made.
        attempts: u32,
    },
}

impl ClusterError {
    /// Whether retrying the same operation later may succeed without any
    /// configuration change.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}

/// Errors surfaced by [`pipeline::HotspotPipeline::ingest`].
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// The submission was rejected.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The incident could not be stored.
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Errors surfaced by [`alerts::AlertService`].
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    /// The request was rejected.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Alert storage failed.
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// No alert exists with the given id.
    #[error("Alert {alert_id} not found")]
    NotFound {
        /// The id that was looked up.
        alert_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_lock_timeouts_are_transient() {
        assert!(
            ClusterError::LockTimeout {
                cluster_id: ClusterId(1),
                attempts: 4,
            }
            .is_transient()
        );
        assert!(!ClusterError::NoCapacity { active: 2, max: 2 }.is_transient());
    }

    #[test]
    fn error_messages_name_the_problem() {
        assert_eq!(
            ValidationError::MissingField("severity").to_string(),
            "Missing required field `severity`"
        );
        assert_eq!(
            ClusterError::NoCapacity { active: 3, max: 3 }.to_string(),
            "No capacity for a new cluster (3 of 3 active)"
        );
    }
}
