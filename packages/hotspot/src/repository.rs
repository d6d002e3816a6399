//! Storage seam for incidents, hotspots, watch areas, and alerts.
//!
//! The engine only talks to storage through [`IncidentRepository`].
//! [`InMemoryRepository`] backs tests and ephemeral deployments; the
//! `crime_watch_database` crate provides a `SQLite` implementation.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use crime_watch_crime_models::IncidentStatus;
use crime_watch_hotspot_models::{Alert, ClusterId, Hotspot, Incident, WatchArea};

/// Errors from storage operations.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// A database query or command failed.
    #[error("Database error: {0}")]
    Database(String),

    /// A stored value could not be converted back into a record.
    #[error("Data conversion error: {message}")]
    Conversion {
        /// Description of what went wrong.
        message: String,
    },
}

/// Persistence operations required by the pipeline.
#[async_trait]
pub trait IncidentRepository: Send + Sync {
    /// Stores a new incident.
    async fn insert_incident(&self, incident: &Incident) -> Result<(), RepositoryError>;

    /// Looks up an incident by id.
    async fn get_incident(&self, id: &str) -> Result<Option<Incident>, RepositoryError>;

    /// All incidents, oldest record first.
    async fn list_incidents(&self) -> Result<Vec<Incident>, RepositoryError>;

    /// Sets the moderation status of an incident, returning the updated
    /// record or `None` if it does not exist.
    async fn update_status(
        &self,
        id: &str,
        status: IncidentStatus,
    ) -> Result<Option<Incident>, RepositoryError>;

    /// Flags a stored incident as waiting for clustering.
    async fn mark_unclustered(&self, id: &str, reason: &str) -> Result<(), RepositoryError>;

    /// Clears the waiting-for-clustering flag.
    async fn clear_unclustered(&self, id: &str) -> Result<(), RepositoryError>;

    /// Incidents waiting for clustering, oldest record first.
    async fn list_unclustered(&self) -> Result<Vec<Incident>, RepositoryError>;

    /// Inserts or replaces a hotspot row.
    async fn upsert_hotspot(&self, hotspot: &Hotspot) -> Result<(), RepositoryError>;

    /// Hotspots ordered by id, optionally including dormant ones.
    async fn list_hotspots(&self, include_dormant: bool) -> Result<Vec<Hotspot>, RepositoryError>;

    /// Deletes every hotspot row.
    async fn clear_hotspots(&self) -> Result<(), RepositoryError>;

    /// Stores a watch area subscription.
    async fn insert_watch_area(&self, area: &WatchArea) -> Result<(), RepositoryError>;

    /// All watch area subscriptions.
    async fn list_watch_areas(&self) -> Result<Vec<WatchArea>, RepositoryError>;

    /// Stores a new alert.
    async fn insert_alert(&self, alert: &Alert) -> Result<(), RepositoryError>;

    /// A user's alerts, newest first.
    async fn list_alerts(
        &self,
        user_id: &str,
        unread_only: bool,
    ) -> Result<Vec<Alert>, RepositoryError>;

    /// Marks an alert read, returning it or `None` if it does not exist.
    async fn mark_alert_read(&self, alert_id: &str) -> Result<Option<Alert>, RepositoryError>;
}

#[derive(Default)]
struct State {
    incidents: BTreeMap<String, Incident>,
    unclustered: BTreeMap<String, String>,
    hotspots: BTreeMap<ClusterId, Hotspot>,
    watch_areas: Vec<WatchArea>,
    alerts: Vec<Alert>,
}

/// Process-local repository.
#[derive(Default)]
pub struct InMemoryRepository {
    state: Mutex<State>,
}

impl InMemoryRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn oldest_first(mut incidents: Vec<Incident>) -> Vec<Incident> {
    incidents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    incidents
}

#[async_trait]
impl IncidentRepository for InMemoryRepository {
    async fn insert_incident(&self, incident: &Incident) -> Result<(), RepositoryError> {
        let mut state = self.state();
        if state.incidents.contains_key(&incident.id) {
            return Err(RepositoryError::Database(format!(
                "incident {} already exists",
                incident.id
            )));
        }
        state
            .incidents
            .insert(incident.id.clone(), incident.clone());
        Ok(())
    }

    async fn get_incident(&self, id: &str) -> Result<Option<Incident>, RepositoryError> {
        Ok(self.state().incidents.get(id).cloned())
    }

    async fn list_incidents(&self) -> Result<Vec<Incident>, RepositoryError> {
        Ok(oldest_first(
            self.state().incidents.values().cloned().collect(),
        ))
    }

    async fn update_status(
        &self,
        id: &str,
        status: IncidentStatus,
    ) -> Result<Option<Incident>, RepositoryError> {
        let mut state = self.state();
        Ok(state.incidents.get_mut(id).map(|incident| {
            incident.status = status;
            incident.clone()
        }))
    }

    async fn mark_unclustered(&self, id: &str, reason: &str) -> Result<(), RepositoryError> {
        self.state()
            .unclustered
            .insert(id.to_string(), reason.to_string());
        Ok(())
    }

    async fn clear_unclustered(&self, id: &str) -> Result<(), RepositoryError> {
        self.state().unclustered.remove(id);
        Ok(())
    }

    async fn list_unclustered(&self) -> Result<Vec<Incident>, RepositoryError> {
        let state = self.state();
        Ok(oldest_first(
            state
                .unclustered
                .keys()
                .filter_map(|id| state.incidents.get(id).cloned())
                .collect(),
        ))
    }

    async fn upsert_hotspot(&self, hotspot: &Hotspot) -> Result<(), RepositoryError> {
        self.state().hotspots.insert(hotspot.id, hotspot.clone());
        Ok(())
    }

    async fn list_hotspots(&self, include_dormant: bool) -> Result<Vec<Hotspot>, RepositoryError> {
        Ok(self
            .state()
            .hotspots
            .values()
            .filter(|h| include_dormant || !h.dormant)
            .cloned()
            .collect())
    }

    async fn clear_hotspots(&self) -> Result<(), RepositoryError> {
        self.state().hotspots.clear();
        Ok(())
    }

    async fn insert_watch_area(&self, area: &WatchArea) -> Result<(), RepositoryError> {
        self.state().watch_areas.push(area.clone());
        Ok(())
    }

    async fn list_watch_areas(&self) -> Result<Vec<WatchArea>, RepositoryError> {
        Ok(self.state().watch_areas.clone())
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<(), RepositoryError> {
        self.state().alerts.push(alert.clone());
        Ok(())
    }

    async fn list_alerts(
        &self,
        user_id: &str,
        unread_only: bool,
    ) -> Result<Vec<Alert>, RepositoryError> {
        let state = self.state();
        let mut alerts: Vec<Alert> = state
            .alerts
            .iter()
            .filter(|a| a.user_id == user_id && (!unread_only || !a.is_read))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(alerts)
    }

    async fn mark_alert_read(&self, alert_id: &str) -> Result<Option<Alert>, RepositoryError> {
        let mut state = self.state();
        Ok(state
            .alerts
            .iter_mut()
            .find(|a| a.id == alert_id)
            .map(|alert| {
                alert.is_read = true;
                alert.clone()
            }))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};
    use crime_watch_crime_models::{CrimeType, Severity};
    use crime_watch_hotspot_models::{AlertType, GeoPoint};

    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn incident(id: &str, created_offset_mins: i64) -> Incident {
        Incident {
            id: id.to_string(),
            title: None,
            description: "test".to_string(),
            crime_type: CrimeType::Burglary,
            severity: Severity::Medium,
            location: GeoPoint::new(1.0, 2.0),
            timestamp: now() - Duration::hours(3),
            created_at: now() + Duration::minutes(created_offset_mins),
            status: IncidentStatus::Pending,
            reporter_id: None,
        }
    }

    fn alert(id: &str, user: &str, minutes: i64) -> Alert {
        Alert {
            id: id.to_string(),
            user_id: user.to_string(),
            incident_id: None,
            hotspot_id: None,
            title: "t".to_string(),
            message: "m".to_string(),
            alert_type: AlertType::Community,
            is_read: false,
            created_at: now() + Duration::minutes(minutes),
        }
    }

    #[tokio::test]
    async fn duplicate_incident_is_rejected() {
        let repo = InMemoryRepository::new();
        repo.insert_incident(&incident("a", 0)).await.unwrap();
        assert!(repo.insert_incident(&incident("a", 0)).await.is_err());
    }

    #[tokio::test]
    async fn incidents_list_oldest_first() {
        let repo = InMemoryRepository::new();
        repo.insert_incident(&incident("late", 10)).await.unwrap();
        repo.insert_incident(&incident("early", 1)).await.unwrap();
        let ids: Vec<String> = repo
            .list_incidents()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[tokio::test]
    async fn status_update_only_touches_status() {
        let repo = InMemoryRepository::new();
        repo.insert_incident(&incident("a", 0)).await.unwrap();
        let updated = repo
            .update_status("a", IncidentStatus::Verified)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, IncidentStatus::Verified);
        assert_eq!(updated.description, "test");
        assert!(
            repo.update_status("missing", IncidentStatus::Resolved)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn unclustered_backlog_round_trip() {
        let repo = InMemoryRepository::new();
        repo.insert_incident(&incident("a", 0)).await.unwrap();
        repo.mark_unclustered("a", "capacity").await.unwrap();
        assert_eq!(repo.list_unclustered().await.unwrap().len(), 1);
        repo.clear_unclustered("a").await.unwrap();
        assert!(repo.list_unclustered().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn alerts_are_per_user_newest_first_and_markable() {
        let repo = InMemoryRepository::new();
        repo.insert_alert(&alert("1", "u1", 0)).await.unwrap();
        repo.insert_alert(&alert("2", "u1", 5)).await.unwrap();
        repo.insert_alert(&alert("3", "u2", 1)).await.unwrap();

        let ids: Vec<String> = repo
            .list_alerts("u1", false)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec!["2", "1"]);

        let read = repo.mark_alert_read("2").await.unwrap().unwrap();
        assert!(read.is_read);
        let unread = repo.list_alerts("u1", true).await.unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].id, "1");
        assert!(repo.mark_alert_read("nope").await.unwrap().is_none());
    }
}
