#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Record types shared by the hotspot aggregation engine and its
//! consumers.
//!
//! These types mirror the rows of the `incidents`, `hotspots`, and `alerts`
//! tables. They are distinct from the API response types in
//! `crime_watch_server_models`, which wrap them for the REST surface.

pub mod config;

use chrono::{DateTime, Utc};
use crime_watch_crime_models::{CrimeType, IncidentStatus, Severity};
use serde::{Deserialize, Serialize};

pub use config::{ConfigError, HotspotConfig};

/// A WGS84 coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees, `[-90, 90]`.
    pub lat: f64,
    /// Longitude in degrees, `[-180, 180]`.
    pub lng: f64,
}

impl GeoPoint {
    /// Creates a new point from latitude and longitude.
    #[must_use]
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Whether both coordinates are finite and inside their valid ranges.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// Location as submitted by a reporter, before presence checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RawLocation {
    /// Latitude, if provided.
    pub lat: Option<f64>,
    /// Longitude, if provided.
    pub lng: Option<f64>,
}

/// An incident report as submitted by a community member.
///
/// Every field is optional so that missing values can be reported back as
/// validation errors rather than failing deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncidentSubmission {
    /// Short headline for the report.
    pub title: Option<String>,
    /// What happened.
    pub description: Option<String>,
    /// Crime type label or id (e.g. `"Theft"`, `"vehicle_crime"`).
    #[serde(rename = "type")]
    pub crime_type: Option<String>,
    /// Where it happened.
    pub location: Option<RawLocation>,
    /// Severity name (`low`, `medium`, `high`, `critical`).
    pub severity: Option<String>,
    /// When it happened.
    pub timestamp: Option<DateTime<Utc>>,
    /// User who filed the report, `None` for anonymous reports.
    pub reporter_id: Option<String>,
}

/// A validated, normalized incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    /// Opaque unique id.
    pub id: String,
    /// Short headline, if the reporter gave one.
    pub title: Option<String>,
    /// What happened (trimmed, non-empty).
    pub description: String,
    /// Crime type from the fixed taxonomy.
    #[serde(rename = "type")]
    pub crime_type: CrimeType,
    /// Reported severity.
    pub severity: Severity,
    /// Where it happened.
    pub location: GeoPoint,
    /// When it happened. Never later than `created_at`.
    pub timestamp: DateTime<Utc>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// Moderation state.
    pub status: IncidentStatus,
    /// User who filed the report, `None` for anonymous reports.
    pub reporter_id: Option<String>,
}

/// Identifier of a cluster. Allocated in increasing order, so a lower id
/// always means an older cluster.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ClusterId(pub u64);

impl std::fmt::Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A hotspot row: the persisted view of a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hotspot {
    /// Cluster id.
    pub id: ClusterId,
    /// Current centroid of the member incidents.
    pub location: GeoPoint,
    /// Membership radius in meters.
    pub radius_meters: u32,
    /// Number of member incidents.
    pub crime_count: u32,
    /// Recency-weighted risk score in `[0, 10]`.
    pub severity_score: f64,
    /// Crime type with the highest weighted frequency.
    pub dominant_crime_type: Option<CrimeType>,
    /// When the score was last recomputed.
    pub last_updated: DateTime<Utc>,
    /// Whether the cluster has been retired below the dormancy floor.
    pub dormant: bool,
}

/// Kind of notification.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AlertType {
    /// A serious incident was reported inside the recipient's watch area.
    Incident,
    /// A hotspot inside the recipient's watch area crossed the risk threshold.
    Hotspot,
    /// A message broadcast to a neighbourhood watch group.
    Community,
}

/// A notification owned by a single user.
///
/// Immutable once created apart from `is_read`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Opaque unique id.
    pub id: String,
    /// Recipient.
    pub user_id: String,
    /// Incident the alert is about, if any.
    pub incident_id: Option<String>,
    /// Hotspot the alert is about, if any.
    pub hotspot_id: Option<ClusterId>,
    /// Headline.
    pub title: String,
    /// Body text.
    pub message: String,
    /// Kind of alert.
    pub alert_type: AlertType,
    /// Whether the recipient has read it.
    pub is_read: bool,
    /// When the alert was raised.
    pub created_at: DateTime<Utc>,
}

/// A user's subscription to alerts around a location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchArea {
    /// Subscribed user.
    pub user_id: String,
    /// Neighbourhood watch group this subscription belongs to, if any.
    pub group_id: Option<String>,
    /// Center of the watched area.
    pub center: GeoPoint,
    /// Radius of the watched area in meters.
    pub radius_meters: u32,
}

/// Change notification emitted by the engine whenever an incident,
/// hotspot, or alert is created or modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HotspotEvent {
    /// A new incident was validated and stored.
    IncidentIngested {
        /// The stored incident.
        incident: Incident,
    },
    /// A stored incident could not be clustered yet.
    IncidentDeferred {
        /// Id of the deferred incident.
        incident_id: String,
        /// Why clustering was deferred.
        reason: String,
    },
    /// A new cluster was created.
    HotspotCreated {
        /// The new hotspot.
        hotspot: Hotspot,
    },
    /// An existing cluster's membership or score changed.
    HotspotUpdated {
        /// The updated hotspot.
        hotspot: Hotspot,
    },
    /// A cluster fell below the dormancy floor.
    HotspotRetired {
        /// The retired hotspot.
        hotspot: Hotspot,
    },
    /// An alert was raised for a user.
    AlertRaised {
        /// The new alert.
        alert: Alert,
    },
}
