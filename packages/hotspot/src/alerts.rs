//! Notification of users watching an area.
//!
//! Three kinds of alert are raised:
//!
//! - **incident**: a report at or above the configured severity lands in a
//!   user's watch area (reporters are not alerted about their own report)
//! - **hotspot**: a hotspot's score crosses the alert threshold upward while
//!   its center is inside a user's watch area
//! - **community**: a message broadcast to every member of a watch group
//!
//! A user with several matching watch areas still gets a single alert.

use std::collections::BTreeSet;
use std::sync::Arc;

use crime_watch_hotspot_models::{
    Alert, AlertType, GeoPoint, Hotspot, HotspotConfig, HotspotEvent, Incident, WatchArea,
};
use crime_watch_spatial::within_radius;

use crate::clock::Clock;
use crate::events::EventBus;
use crate::repository::{IncidentRepository, RepositoryError};
use crate::{AlertError, ValidationError};

/// Raises, stores, and publishes alerts.
pub struct AlertService {
    config: HotspotConfig,
    repository: Arc<dyn IncidentRepository>,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

/// Content of an alert before it is addressed to a recipient.
struct Draft<'a> {
    alert_type: AlertType,
    incident_id: Option<&'a str>,
    hotspot: Option<&'a Hotspot>,
    title: String,
    message: String,
}

impl AlertService {
    /// Creates a service storing alerts in `repository` and publishing them
    /// on `events`.
    #[must_use]
    pub fn new(
        config: HotspotConfig,
        repository: Arc<dyn IncidentRepository>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            repository,
            events,
            clock,
        }
    }

    /// Subscribes a user to alerts around a location.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::Validation`] for a blank user id, invalid
    /// center, or zero radius, and [`AlertError::Repository`] if storing
    /// fails.
    pub async fn add_watch_area(&self, area: WatchArea) -> Result<WatchArea, AlertError> {
        let user_id = area.user_id.trim().to_string();
        if user_id.is_empty() {
            return Err(ValidationError::MissingField("user_id").into());
        }
        if !area.center.is_valid() {
            return Err(ValidationError::CoordinatesOutOfRange {
                lat: area.center.lat,
                lng: area.center.lng,
            }
            .into());
        }
        if area.radius_meters == 0 {
            return Err(ValidationError::InvalidField {
                field: "radius_meters",
                message: "must be greater than 0".to_string(),
            }
            .into());
        }

        let area = WatchArea {
            user_id,
            group_id: area
                .group_id
                .map(|g| g.trim().to_string())
                .filter(|g| !g.is_empty()),
            ..area
        };
        self.repository.insert_watch_area(&area).await?;
        log::info!(
            "User {} now watching {:.5},{:.5} (r={}m)",
            area.user_id,
            area.center.lat,
            area.center.lng,
            area.radius_meters
        );
        Ok(area)
    }

    /// Alerts users watching the location of a newly ingested incident.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError`] if watch areas cannot be read or an
    /// alert cannot be stored.
    pub async fn on_incident(&self, incident: &Incident) -> Result<Vec<Alert>, RepositoryError> {
        if incident.severity < self.config.incident_alert_min_severity {
            return Ok(Vec::new());
        }

        let recipients = self
            .watchers_of(incident.location, incident.reporter_id.as_deref())
            .await?;
        let draft = Draft {
            alert_type: AlertType::Incident,
            incident_id: Some(&incident.id),
            hotspot: None,
            title: format!("{} reported nearby", incident.crime_type),
            message: format!(
                "A {} severity {} was reported in your area: {}",
                incident.severity, incident.crime_type, incident.description
            ),
        };
        self.raise(recipients, &draft).await
    }

    /// Alerts users watching a hotspot whose score rose from
    /// `previous_score` to at least the alert threshold.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError`] if watch areas cannot be read or an
    /// alert cannot be stored.
    pub async fn on_hotspot_change(
        &self,
        previous_score: f64,
        hotspot: &Hotspot,
    ) -> Result<Vec<Alert>, RepositoryError> {
        let threshold = self.config.hotspot_alert_threshold;
        if hotspot.dormant || !(previous_score < threshold && hotspot.severity_score >= threshold)
        {
            return Ok(Vec::new());
        }

        log::info!(
            "Hotspot {} crossed alert threshold ({previous_score:.2} -> {:.2})",
            hotspot.id,
            hotspot.severity_score
        );

        let recipients = self.watchers_of(hotspot.location, None).await?;
        let dominant = hotspot
            .dominant_crime_type
            .map_or_else(|| "crime".to_string(), |t| t.to_string());
        let draft = Draft {
            alert_type: AlertType::Hotspot,
            incident_id: None,
            hotspot: Some(hotspot),
            title: "New hotspot in your area".to_string(),
            message: format!(
                "{} recent reports, mostly {dominant}, put this area at risk level {:.1}/10",
                hotspot.crime_count, hotspot.severity_score
            ),
        };
        self.raise(recipients, &draft).await
    }

    /// Sends a community alert to every member of a watch group.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::Validation`] for a blank group, title, or
    /// message, and [`AlertError::Repository`] if storage fails.
    pub async fn notify_group(
        &self,
        group_id: &str,
        title: &str,
        message: &str,
    ) -> Result<Vec<Alert>, AlertError> {
        let group_id = group_id.trim();
        if group_id.is_empty() {
            return Err(ValidationError::MissingField("group_id").into());
        }
        let title = title.trim();
        if title.is_empty() {
            return Err(ValidationError::MissingField("title").into());
        }
        let message = message.trim();
        if message.is_empty() {
            return Err(ValidationError::MissingField("message").into());
        }

        let recipients: BTreeSet<String> = self
            .repository
            .list_watch_areas()
            .await?
            .into_iter()
            .filter(|area| area.group_id.as_deref() == Some(group_id))
            .map(|area| area.user_id)
            .collect();

        if recipients.is_empty() {
            log::warn!("Community alert for group {group_id} has no recipients");
        }

        let draft = Draft {
            alert_type: AlertType::Community,
            incident_id: None,
            hotspot: None,
            title: title.to_string(),
            message: message.to_string(),
        };
        Ok(self.raise(recipients, &draft).await?)
    }

    /// A user's alerts, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError`] if the query fails.
    pub async fn alerts_for(
        &self,
        user_id: &str,
        unread_only: bool,
    ) -> Result<Vec<Alert>, RepositoryError> {
        self.repository.list_alerts(user_id, unread_only).await
    }

    /// Marks an alert read.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::NotFound`] if no such alert exists.
    pub async fn mark_read(&self, alert_id: &str) -> Result<Alert, AlertError> {
        self.repository
            .mark_alert_read(alert_id)
            .await?
            .ok_or_else(|| AlertError::NotFound {
                alert_id: alert_id.to_string(),
            })
    }

    async fn watchers_of(
        &self,
        point: GeoPoint,
        exclude_user: Option<&str>,
    ) -> Result<BTreeSet<String>, RepositoryError> {
        Ok(self
            .repository
            .list_watch_areas()
            .await?
            .into_iter()
            .filter(|area| Some(area.user_id.as_str()) != exclude_user)
            .filter(|area| within_radius(area.center, point, f64::from(area.radius_meters)))
            .map(|area| area.user_id)
            .collect())
    }

    async fn raise(
        &self,
        recipients: BTreeSet<String>,
        draft: &Draft<'_>,
    ) -> Result<Vec<Alert>, RepositoryError> {
        let now = self.clock.now();
        let mut raised = Vec::with_capacity(recipients.len());

        for user_id in recipients {
            let alert = Alert {
                id: uuid::Uuid::new_v4().to_string(),
                user_id,
                incident_id: draft.incident_id.map(str::to_string),
                hotspot_id: draft.hotspot.map(|h| h.id),
                title: draft.title.clone(),
                message: draft.message.clone(),
                alert_type: draft.alert_type,
                is_read: false,
                created_at: now,
            };
            self.repository.insert_alert(&alert).await?;
            log::debug!(
                "Raised {} alert {} for user {}",
                alert.alert_type,
                alert.id,
                alert.user_id
            );
            self.events.publish(HotspotEvent::AlertRaised {
                alert: alert.clone(),
            });
            raised.push(alert);
        }

        Ok(raised)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};
    use crime_watch_crime_models::{CrimeType, IncidentStatus, Severity};
    use crime_watch_hotspot_models::ClusterId;

    use super::*;
    use crate::clock::FixedClock;
    use crate::repository::InMemoryRepository;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    const HOME: GeoPoint = GeoPoint::new(-26.2041, 28.0473);
    const FAR: GeoPoint = GeoPoint::new(-26.3041, 28.0473);

    fn service() -> (AlertService, EventBus) {
        let events = EventBus::new(16);
        let service = AlertService::new(
            HotspotConfig::default(),
            Arc::new(InMemoryRepository::new()),
            events.clone(),
            Arc::new(FixedClock::new(now())),
        );
        (service, events)
    }

    fn area(user: &str, group: Option<&str>, center: GeoPoint) -> WatchArea {
        WatchArea {
            user_id: user.to_string(),
            group_id: group.map(str::to_string),
            center,
            radius_meters: 1_000,
        }
    }

    fn incident(severity: Severity, reporter: Option<&str>) -> Incident {
        Incident {
            id: "inc-1".to_string(),
            title: None,
            description: "Armed robbery at the corner shop".to_string(),
            crime_type: CrimeType::Robbery,
            severity,
            location: HOME,
            timestamp: now() - Duration::minutes(5),
            created_at: now(),
            status: IncidentStatus::Pending,
            reporter_id: reporter.map(str::to_string),
        }
    }

    fn hotspot(score: f64) -> Hotspot {
        Hotspot {
            id: ClusterId(3),
            location: HOME,
            radius_meters: 500,
            crime_count: 2,
            severity_score: score,
            dominant_crime_type: Some(CrimeType::Theft),
            last_updated: now(),
            dormant: false,
        }
    }

    #[tokio::test]
    async fn watch_area_requires_positive_radius() {
        let (service, _) = service();
        let err = service
            .add_watch_area(WatchArea {
                radius_meters: 0,
                ..area("u1", None, HOME)
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AlertError::Validation(ValidationError::InvalidField {
                field: "radius_meters",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn serious_incident_alerts_nearby_watchers_once() {
        let (service, events) = service();
        let mut rx = events.subscribe();
        service.add_watch_area(area("near", None, HOME)).await.unwrap();
        service.add_watch_area(area("near", Some("g"), HOME)).await.unwrap();
        service.add_watch_area(area("far", None, FAR)).await.unwrap();

        let alerts = service
            .on_incident(&incident(Severity::High, None))
            .await
            .unwrap();

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].user_id, "near");
        assert_eq!(alerts[0].alert_type, AlertType::Incident);
        assert_eq!(alerts[0].incident_id.as_deref(), Some("inc-1"));
        assert!(!alerts[0].is_read);
        assert!(matches!(
            rx.recv().await.unwrap(),
            HotspotEvent::AlertRaised { .. }
        ));
    }

    #[tokio::test]
    async fn minor_incident_and_own_report_do_not_alert() {
        let (service, _) = service();
        service.add_watch_area(area("u1", None, HOME)).await.unwrap();

        let minor = service
            .on_incident(&incident(Severity::Medium, None))
            .await
            .unwrap();
        assert!(minor.is_empty());

        let own = service
            .on_incident(&incident(Severity::Critical, Some("u1")))
            .await
            .unwrap();
        assert!(own.is_empty());
    }

    #[tokio::test]
    async fn hotspot_alerts_only_on_upward_crossing() {
        let (service, _) = service();
        service.add_watch_area(area("u1", None, HOME)).await.unwrap();

        assert!(service.on_hotspot_change(1.0, &hotspot(4.0)).await.unwrap().is_empty());
        let crossed = service.on_hotspot_change(4.0, &hotspot(6.0)).await.unwrap();
        assert_eq!(crossed.len(), 1);
        assert_eq!(crossed[0].hotspot_id, Some(ClusterId(3)));
        assert_eq!(crossed[0].alert_type, AlertType::Hotspot);
        assert!(service.on_hotspot_change(6.0, &hotspot(7.0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn community_alert_reaches_group_members_only() {
        let (service, _) = service();
        service.add_watch_area(area("a", Some("oak-street"), HOME)).await.unwrap();
        service.add_watch_area(area("b", Some("oak-street"), FAR)).await.unwrap();
        service.add_watch_area(area("c", Some("elm-road"), HOME)).await.unwrap();

        let alerts = service
            .notify_group("oak-street", "Meeting", "Thursday 7pm at the hall")
            .await
            .unwrap();
        let users: Vec<&str> = alerts.iter().map(|a| a.user_id.as_str()).collect();
        assert_eq!(users, vec!["a", "b"]);
        assert!(alerts.iter().all(|a| a.alert_type == AlertType::Community));

        assert!(matches!(
            service.notify_group("oak-street", " ", "x").await,
            Err(AlertError::Validation(ValidationError::MissingField("title")))
        ));
    }

    #[tokio::test]
    async fn mark_read_flips_flag_and_reports_missing() {
        let (service, _) = service();
        service.add_watch_area(area("u1", Some("g"), HOME)).await.unwrap();
        let alert = service.notify_group("g", "Hi", "Hello").await.unwrap().remove(0);

        let read = service.mark_read(&alert.id).await.unwrap();
        assert!(read.is_read);
        assert!(service.alerts_for("u1", true).await.unwrap().is_empty());
        assert_eq!(service.alerts_for("u1", false).await.unwrap().len(), 1);

        assert!(matches!(
            service.mark_read("missing").await,
            Err(AlertError::NotFound { .. })
        ));
    }
}
