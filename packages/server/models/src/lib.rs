#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! API request and response types for the crime watch server.
//!
//! These types are serialized to JSON for the REST API. They are separate
//! from the engine types to allow independent evolution of the API
//! contract.

use chrono::{DateTime, Utc};
use crime_watch_crime_models::{CrimeType, IncidentStatus, Severity};
use crime_watch_hotspot::pipeline::{ClusteringOutcome, IngestReport, ReconcileReport};
use crime_watch_hotspot_models::{Alert, AlertType, Hotspot, Incident};
use serde::{Deserialize, Serialize};

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiHealth {
    /// Whether the service is healthy.
    pub healthy: bool,
    /// Service version.
    pub version: String,
    /// Number of active hotspots.
    pub active_hotspots: usize,
}

/// An entry of the crime type taxonomy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCrimeType {
    /// Machine id, e.g. `vehicle_crime`.
    pub id: String,
    /// Display label, e.g. `Vehicle Crime`.
    pub label: String,
}

impl From<CrimeType> for ApiCrimeType {
    fn from(crime_type: CrimeType) -> Self {
        Self {
            id: crime_type.as_ref().to_string(),
            label: crime_type.label().to_string(),
        }
    }
}

/// A reported incident as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiIncident {
    /// Unique incident id.
    pub id: String,
    /// Short headline.
    pub title: Option<String>,
    /// What happened.
    pub description: String,
    /// Crime type label.
    #[serde(rename = "type")]
    pub crime_type: CrimeType,
    /// Severity level name.
    pub severity: Severity,
    /// Severity numeric value (1-4).
    pub severity_value: u8,
    /// Latitude.
    pub latitude: f64,
    /// Longitude.
    pub longitude: f64,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// When it was reported.
    pub created_at: DateTime<Utc>,
    /// Moderation status.
    pub status: IncidentStatus,
}

impl From<Incident> for ApiIncident {
    fn from(incident: Incident) -> Self {
        Self {
            id: incident.id,
            title: incident.title,
            description: incident.description,
            crime_type: incident.crime_type,
            severity: incident.severity,
            severity_value: incident.severity.value(),
            latitude: incident.location.lat,
            longitude: incident.location.lng,
            timestamp: incident.timestamp,
            created_at: incident.created_at,
            status: incident.status,
        }
    }
}

/// A hotspot as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiHotspot {
    /// Cluster id.
    pub id: u64,
    /// Centroid latitude.
    pub latitude: f64,
    /// Centroid longitude.
    pub longitude: f64,
    /// Membership radius in meters.
    pub radius_meters: u32,
    /// Number of incidents in the hotspot.
    pub crime_count: u32,
    /// Risk score, 0 to 10.
    pub severity_score: f64,
    /// Most significant crime type.
    pub dominant_crime_type: Option<CrimeType>,
    /// When the score was last recomputed.
    pub last_updated: DateTime<Utc>,
    /// Whether the hotspot has gone quiet.
    pub dormant: bool,
}

impl From<Hotspot> for ApiHotspot {
    fn from(hotspot: Hotspot) -> Self {
        Self {
            id: hotspot.id.0,
            latitude: hotspot.location.lat,
            longitude: hotspot.location.lng,
            radius_meters: hotspot.radius_meters,
            crime_count: hotspot.crime_count,
            severity_score: hotspot.severity_score,
            dominant_crime_type: hotspot.dominant_crime_type,
            last_updated: hotspot.last_updated,
            dormant: hotspot.dormant,
        }
    }
}

/// An alert as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiAlert {
    /// Alert id.
    pub id: String,
    /// Recipient.
    pub user_id: String,
    /// Related incident.
    pub incident_id: Option<String>,
    /// Related hotspot.
    pub hotspot_id: Option<u64>,
    /// Headline.
    pub title: String,
    /// Body text.
    pub message: String,
    /// Kind of alert.
    pub alert_type: AlertType,
    /// Whether it has been read.
    pub is_read: bool,
    /// When it was raised.
    pub created_at: DateTime<Utc>,
}

impl From<Alert> for ApiAlert {
    fn from(alert: Alert) -> Self {
        Self {
            id: alert.id,
            user_id: alert.user_id,
            incident_id: alert.incident_id,
            hotspot_id: alert.hotspot_id.map(|id| id.0),
            title: alert.title,
            message: alert.message,
            alert_type: alert.alert_type,
            is_read: alert.is_read,
            created_at: alert.created_at,
        }
    }
}

/// Clustering result of a new report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiClustering {
    /// `assigned` or `deferred`.
    pub status: String,
    /// Hotspot the report joined.
    pub hotspot_id: Option<u64>,
    /// Whether the report started a new hotspot.
    pub created: bool,
    /// Why clustering was deferred.
    pub reason: Option<String>,
}

impl From<ClusteringOutcome> for ApiClustering {
    fn from(outcome: ClusteringOutcome) -> Self {
        match outcome {
            ClusteringOutcome::Assigned {
                cluster_id,
                created,
            } => Self {
                status: "assigned".to_string(),
                hotspot_id: Some(cluster_id.0),
                created,
                reason: None,
            },
            ClusteringOutcome::Deferred { reason } => Self {
                status: "deferred".to_string(),
                hotspot_id: None,
                created: false,
                reason: Some(reason),
            },
        }
    }
}

/// Response to `POST /api/incidents`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    /// The stored incident.
    pub incident: ApiIncident,
    /// Clustering result.
    pub clustering: ApiClustering,
    /// Number of alerts raised by the report.
    pub alerts_raised: usize,
}

impl From<IngestReport> for IngestResponse {
    fn from(report: IngestReport) -> Self {
        Self {
            incident: report.incident.into(),
            clustering: report.clustering.into(),
            alerts_raised: report.alerts_raised.len(),
        }
    }
}

/// Response to `POST /api/reconcile`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiReconcileReport {
    /// Deferred incidents clustered on retry.
    pub retried: usize,
    /// Deferred incidents still waiting.
    pub still_deferred: usize,
    /// Incidents moved out of drifted hotspots.
    pub evicted: usize,
    /// Hotspots rescored.
    pub updated: usize,
    /// Hotspots retired.
    pub retired: usize,
    /// Hotspots skipped due to lock contention.
    pub skipped: usize,
}

impl From<ReconcileReport> for ApiReconcileReport {
    fn from(report: ReconcileReport) -> Self {
        Self {
            retried: report.retried,
            still_deferred: report.still_deferred,
            evicted: report.evicted,
            updated: report.updated,
            retired: report.retired,
            skipped: report.skipped,
        }
    }
}

/// Query parameters for the hotspots endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HotspotQueryParams {
    /// Include retired hotspots.
    pub include_dormant: Option<bool>,
}

/// Query parameters for the alerts endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertQueryParams {
    /// Only return unread alerts.
    pub unread_only: Option<bool>,
}

/// Body of `PATCH /api/incidents/{id}/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdateRequest {
    /// New moderation status.
    pub status: IncidentStatus,
}

/// Body of `POST /api/watch-areas`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchAreaRequest {
    /// Subscribing user.
    pub user_id: String,
    /// Neighbourhood watch group, if any.
    pub group_id: Option<String>,
    /// Center latitude.
    pub latitude: f64,
    /// Center longitude.
    pub longitude: f64,
    /// Radius in meters.
    pub radius_meters: u32,
}

/// Body of `POST /api/groups/{id}/alerts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunityAlertRequest {
    /// Headline.
    pub title: String,
    /// Body text.
    pub message: String,
}

/// Response to `POST /api/groups/{id}/alerts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunityAlertResponse {
    /// Number of members notified.
    pub recipients: usize,
}

/// Error body returned with 4xx and 5xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable message.
    pub error: String,
}

impl ErrorResponse {
    /// Creates an error body.
    #[must_use]
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crime_watch_hotspot_models::{ClusterId, GeoPoint};

    use super::*;

    #[test]
    fn hotspot_serializes_camel_case() {
        let hotspot = Hotspot {
            id: ClusterId(4),
            location: GeoPoint::new(-26.2, 28.0),
            radius_meters: 500,
            crime_count: 2,
            severity_score: 7.5,
            dominant_crime_type: Some(CrimeType::VehicleCrime),
            last_updated: DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            dormant: false,
        };
        let json = serde_json::to_value(ApiHotspot::from(hotspot)).unwrap();
        assert_eq!(json["id"], 4);
        assert_eq!(json["crimeCount"], 2);
        assert_eq!(json["severityScore"], 7.5);
        assert_eq!(json["dominantCrimeType"], "Vehicle Crime");
        assert_eq!(json["radiusMeters"], 500);
    }

    #[test]
    fn deferred_clustering_has_reason_and_no_hotspot() {
        let api = ApiClustering::from(ClusteringOutcome::Deferred {
            reason: "No capacity".to_string(),
        });
        assert_eq!(api.status, "deferred");
        assert!(api.hotspot_id.is_none());
        assert_eq!(api.reason.as_deref(), Some("No capacity"));
    }

    #[test]
    fn crime_type_entry_has_id_and_label() {
        let entry = ApiCrimeType::from(CrimeType::SuspiciousActivity);
        assert_eq!(entry.id, "suspicious_activity");
        assert_eq!(entry.label, "Suspicious Activity");
    }

    #[test]
    fn status_request_parses_lowercase() {
        let request: StatusUpdateRequest =
            serde_json::from_str(r#"{"status":"verified"}"#).unwrap();
        assert_eq!(request.status, IncidentStatus::Verified);
    }
}
