//! [`IncidentRepository`] implementation over `switchy_database`.
//!
//! Timestamps are stored as fixed-precision RFC 3339 text so that text
//! ordering matches time ordering. Severity is stored as its numeric level,
//! enums as their lowercase ids.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use crime_watch_crime_models::{CrimeType, IncidentStatus, Severity};
use crime_watch_hotspot::repository::{IncidentRepository, RepositoryError};
use crime_watch_hotspot_models::{
    Alert, AlertType, ClusterId, GeoPoint, Hotspot, Incident, WatchArea,
};
use moosicbox_json_utils::database::ToValue as _;
use switchy_database::{Database, DatabaseValue, Row};

use crate::{DbError, db::open_db};

const INCIDENT_COLUMNS: &str = "id, title, description, crime_type, severity, lat, lng, \
                                occurred_at, created_at, status, reporter_id";

/// Repository backed by a `SQLite` file.
pub struct SqliteRepository {
    db: Box<dyn Database>,
}

impl std::fmt::Debug for SqliteRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRepository").finish_non_exhaustive()
    }
}

impl SqliteRepository {
    /// Opens the database at `path`, creating it and its schema if needed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the database cannot be opened.
    pub async fn open(path: &Path) -> Result<Self, DbError> {
        Ok(Self::new(open_db(path).await?))
    }

    /// Wraps an already opened database. The schema must exist.
    #[must_use]
    pub fn new(db: Box<dyn Database>) -> Self {
        Self { db }
    }

    async fn query(
        &self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> Result<Vec<Row>, RepositoryError> {
        self.db
            .query_raw_params(sql, params)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))
    }

    async fn exec(&self, sql: &str, params: &[DatabaseValue]) -> Result<u64, RepositoryError> {
        self.db
            .exec_raw_params(sql, params)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))
    }
}

fn text(value: &str) -> DatabaseValue {
    DatabaseValue::String(value.to_string())
}

fn opt_text(value: Option<&str>) -> DatabaseValue {
    value.map_or(DatabaseValue::Null, text)
}

fn timestamp(value: DateTime<Utc>) -> DatabaseValue {
    DatabaseValue::String(value.to_rfc3339_opts(SecondsFormat::Micros, true))
}

fn flag(value: bool) -> DatabaseValue {
    DatabaseValue::Int32(i32::from(value))
}

fn cluster_id(id: ClusterId) -> DatabaseValue {
    DatabaseValue::Int64(i64::try_from(id.0).unwrap_or(i64::MAX))
}

fn conversion(column: &str, error: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::Conversion {
        message: format!("column `{column}`: {error}"),
    }
}

fn get_string(row: &Row, column: &str) -> Result<String, RepositoryError> {
    row.to_value(column).map_err(|e| conversion(column, e))
}

fn get_opt_string(row: &Row, column: &str) -> Result<Option<String>, RepositoryError> {
    row.to_value(column).map_err(|e| conversion(column, e))
}

fn get_f64(row: &Row, column: &str) -> Result<f64, RepositoryError> {
    row.to_value(column).map_err(|e| conversion(column, e))
}

fn get_i64(row: &Row, column: &str) -> Result<i64, RepositoryError> {
    row.to_value(column).map_err(|e| conversion(column, e))
}

fn get_u32(row: &Row, column: &str) -> Result<u32, RepositoryError> {
    u32::try_from(get_i64(row, column)?).map_err(|e| conversion(column, e))
}

fn get_time(row: &Row, column: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&get_string(row, column)?)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion(column, e))
}

fn get_crime_type(row: &Row, column: &str) -> Result<CrimeType, RepositoryError> {
    let value = get_string(row, column)?;
    CrimeType::parse(&value).map_err(|e| conversion(column, e))
}

fn row_to_incident(row: &Row) -> Result<Incident, RepositoryError> {
    let severity = u8::try_from(get_i64(row, "severity")?).map_err(|e| conversion("severity", e))?;

    Ok(Incident {
        id: get_string(row, "id")?,
        title: get_opt_string(row, "title")?,
        description: get_string(row, "description")?,
        crime_type: get_crime_type(row, "crime_type")?,
        severity: Severity::from_value(severity).map_err(|e| conversion("severity", e))?,
        location: GeoPoint::new(get_f64(row, "lat")?, get_f64(row, "lng")?),
        timestamp: get_time(row, "occurred_at")?,
        created_at: get_time(row, "created_at")?,
        status: get_string(row, "status")?
            .parse::<IncidentStatus>()
            .map_err(|e| conversion("status", e))?,
        reporter_id: get_opt_string(row, "reporter_id")?,
    })
}

fn row_to_hotspot(row: &Row) -> Result<Hotspot, RepositoryError> {
    Ok(Hotspot {
        id: ClusterId(u64::try_from(get_i64(row, "id")?).map_err(|e| conversion("id", e))?),
        location: GeoPoint::new(get_f64(row, "lat")?, get_f64(row, "lng")?),
        radius_meters: get_u32(row, "radius_meters")?,
        crime_count: get_u32(row, "crime_count")?,
        severity_score: get_f64(row, "severity_score")?,
        dominant_crime_type: get_opt_string(row, "dominant_crime_type")?
            .map(|t| CrimeType::parse(&t).map_err(|e| conversion("dominant_crime_type", e)))
            .transpose()?,
        last_updated: get_time(row, "last_updated")?,
        dormant: get_i64(row, "dormant")? != 0,
    })
}

fn row_to_watch_area(row: &Row) -> Result<WatchArea, RepositoryError> {
    Ok(WatchArea {
        user_id: get_string(row, "user_id")?,
        group_id: get_opt_string(row, "group_id")?,
        center: GeoPoint::new(get_f64(row, "lat")?, get_f64(row, "lng")?),
        radius_meters: get_u32(row, "radius_meters")?,
    })
}

fn row_to_alert(row: &Row) -> Result<Alert, RepositoryError> {
    let hotspot_id: Option<i64> = row
        .to_value("hotspot_id")
        .map_err(|e| conversion("hotspot_id", e))?;

    Ok(Alert {
        id: get_string(row, "id")?,
        user_id: get_string(row, "user_id")?,
        incident_id: get_opt_string(row, "incident_id")?,
        hotspot_id: hotspot_id
            .map(|id| u64::try_from(id).map(ClusterId))
            .transpose()
            .map_err(|e| conversion("hotspot_id", e))?,
        title: get_string(row, "title")?,
        message: get_string(row, "message")?,
        alert_type: get_string(row, "alert_type")?
            .parse::<AlertType>()
            .map_err(|e| conversion("alert_type", e))?,
        is_read: get_i64(row, "is_read")? != 0,
        created_at: get_time(row, "created_at")?,
    })
}

fn collect<T>(
    rows: &[Row],
    convert: fn(&Row) -> Result<T, RepositoryError>,
) -> Result<Vec<T>, RepositoryError> {
    rows.iter().map(convert).collect()
}

#[async_trait]
impl IncidentRepository for SqliteRepository {
    async fn insert_incident(&self, incident: &Incident) -> Result<(), RepositoryError> {
        self.exec(
            "INSERT INTO incidents (id, title, description, crime_type, severity, lat, lng,
                                    occurred_at, created_at, status, reporter_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            &[
                text(&incident.id),
                opt_text(incident.title.as_deref()),
                text(&incident.description),
                text(incident.crime_type.as_ref()),
                DatabaseValue::Int32(i32::from(incident.severity.value())),
                DatabaseValue::Real64(incident.location.lat),
                DatabaseValue::Real64(incident.location.lng),
                timestamp(incident.timestamp),
                timestamp(incident.created_at),
                text(incident.status.as_ref()),
                opt_text(incident.reporter_id.as_deref()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_incident(&self, id: &str) -> Result<Option<Incident>, RepositoryError> {
        let rows = self
            .query(
                &format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE id = $1"),
                &[text(id)],
            )
            .await?;
        rows.first().map(row_to_incident).transpose()
    }

    async fn list_incidents(&self) -> Result<Vec<Incident>, RepositoryError> {
        let rows = self
            .query(
                &format!("SELECT {INCIDENT_COLUMNS} FROM incidents ORDER BY created_at, id"),
                &[],
            )
            .await?;
        collect(&rows, row_to_incident)
    }

    async fn update_status(
        &self,
        id: &str,
        status: IncidentStatus,
    ) -> Result<Option<Incident>, RepositoryError> {
        let updated = self
            .exec(
                "UPDATE incidents SET status = $1 WHERE id = $2",
                &[text(status.as_ref()), text(id)],
            )
            .await?;
        if updated == 0 {
            return Ok(None);
        }
        self.get_incident(id).await
    }

    async fn mark_unclustered(&self, id: &str, reason: &str) -> Result<(), RepositoryError> {
        self.exec(
            "UPDATE incidents SET unclustered_reason = $1 WHERE id = $2",
            &[text(reason), text(id)],
        )
        .await?;
        Ok(())
    }

    async fn clear_unclustered(&self, id: &str) -> Result<(), RepositoryError> {
        self.exec(
            "UPDATE incidents SET unclustered_reason = NULL WHERE id = $1",
            &[text(id)],
        )
        .await?;
        Ok(())
    }

    async fn list_unclustered(&self) -> Result<Vec<Incident>, RepositoryError> {
        let rows = self
            .query(
                &format!(
                    "SELECT {INCIDENT_COLUMNS} FROM incidents
                     WHERE unclustered_reason IS NOT NULL
                     ORDER BY created_at, id"
                ),
                &[],
            )
            .await?;
        collect(&rows, row_to_incident)
    }

    async fn upsert_hotspot(&self, hotspot: &Hotspot) -> Result<(), RepositoryError> {
        self.exec(
            "INSERT INTO hotspots (id, lat, lng, radius_meters, crime_count, severity_score,
                                   dominant_crime_type, last_updated, dormant)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (id) DO UPDATE SET
               lat = excluded.lat,
               lng = excluded.lng,
               radius_meters = excluded.radius_meters,
               crime_count = excluded.crime_count,
               severity_score = excluded.severity_score,
               dominant_crime_type = excluded.dominant_crime_type,
               last_updated = excluded.last_updated,
               dormant = excluded.dormant",
            &[
                cluster_id(hotspot.id),
                DatabaseValue::Real64(hotspot.location.lat),
                DatabaseValue::Real64(hotspot.location.lng),
                DatabaseValue::Int64(i64::from(hotspot.radius_meters)),
                DatabaseValue::Int64(i64::from(hotspot.crime_count)),
                DatabaseValue::Real64(hotspot.severity_score),
                opt_text(hotspot.dominant_crime_type.as_ref().map(AsRef::as_ref)),
                timestamp(hotspot.last_updated),
                flag(hotspot.dormant),
            ],
        )
        .await?;
        Ok(())
    }

    async fn list_hotspots(&self, include_dormant: bool) -> Result<Vec<Hotspot>, RepositoryError> {
        let sql = if include_dormant {
            "SELECT * FROM hotspots ORDER BY id"
        } else {
            "SELECT * FROM hotspots WHERE dormant = 0 ORDER BY id"
        };
        let rows = self.query(sql, &[]).await?;
        collect(&rows, row_to_hotspot)
    }

    async fn clear_hotspots(&self) -> Result<(), RepositoryError> {
        let removed = self.exec("DELETE FROM hotspots", &[]).await?;
        log::debug!("Cleared {removed} hotspot rows");
        Ok(())
    }

    async fn insert_watch_area(&self, area: &WatchArea) -> Result<(), RepositoryError> {
        self.exec(
            "INSERT INTO watch_areas (user_id, group_id, lat, lng, radius_meters)
             VALUES ($1, $2, $3, $4, $5)",
            &[
                text(&area.user_id),
                opt_text(area.group_id.as_deref()),
                DatabaseValue::Real64(area.center.lat),
                DatabaseValue::Real64(area.center.lng),
                DatabaseValue::Int64(i64::from(area.radius_meters)),
            ],
        )
        .await?;
        Ok(())
    }

    async fn list_watch_areas(&self) -> Result<Vec<WatchArea>, RepositoryError> {
        let rows = self
            .query(
                "SELECT user_id, group_id, lat, lng, radius_meters FROM watch_areas ORDER BY id",
                &[],
            )
            .await?;
        collect(&rows, row_to_watch_area)
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<(), RepositoryError> {
        self.exec(
            "INSERT INTO alerts (id, user_id, incident_id, hotspot_id, title, message,
                                 alert_type, is_read, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            &[
                text(&alert.id),
                text(&alert.user_id),
                opt_text(alert.incident_id.as_deref()),
                alert.hotspot_id.map_or(DatabaseValue::Null, cluster_id),
                text(&alert.title),
                text(&alert.message),
                text(alert.alert_type.as_ref()),
                flag(alert.is_read),
                timestamp(alert.created_at),
            ],
        )
        .await?;
        Ok(())
    }

    async fn list_alerts(
        &self,
        user_id: &str,
        unread_only: bool,
    ) -> Result<Vec<Alert>, RepositoryError> {
        let sql = if unread_only {
            "SELECT * FROM alerts WHERE user_id = $1 AND is_read = 0 ORDER BY created_at DESC"
        } else {
            "SELECT * FROM alerts WHERE user_id = $1 ORDER BY created_at DESC"
        };
        let rows = self.query(sql, &[text(user_id)]).await?;
        collect(&rows, row_to_alert)
    }

    async fn mark_alert_read(&self, alert_id: &str) -> Result<Option<Alert>, RepositoryError> {
        let updated = self
            .exec(
                "UPDATE alerts SET is_read = 1 WHERE id = $1",
                &[text(alert_id)],
            )
            .await?;
        if updated == 0 {
            return Ok(None);
        }
        let rows = self
            .query("SELECT * FROM alerts WHERE id = $1", &[text(alert_id)])
            .await?;
        rows.first().map(row_to_alert).transpose()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::Duration;

    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T08:30:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("crime_watch_test_{}.db", uuid::Uuid::new_v4()))
    }

    async fn repository() -> (SqliteRepository, PathBuf) {
        let path = temp_path();
        (SqliteRepository::open(&path).await.unwrap(), path)
    }

    fn incident(id: &str, created_offset_mins: i64) -> Incident {
        Incident {
            id: id.to_string(),
            title: Some("Car window smashed".to_string()),
            description: "Window broken, bag taken from the back seat".to_string(),
            crime_type: CrimeType::VehicleCrime,
            severity: Severity::High,
            location: GeoPoint::new(-26.2041, 28.0473),
            timestamp: now() - Duration::hours(2),
            created_at: now() + Duration::minutes(created_offset_mins),
            status: IncidentStatus::Pending,
            reporter_id: None,
        }
    }

    #[tokio::test]
    async fn incidents_survive_storage_unchanged() {
        let (repo, path) = repository().await;
        let original = incident("a", 0);
        repo.insert_incident(&original).await.unwrap();

        assert_eq!(repo.get_incident("a").await.unwrap(), Some(original));
        assert!(repo.get_incident("missing").await.unwrap().is_none());
        assert!(repo.insert_incident(&incident("a", 0)).await.is_err());

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn reopening_keeps_data() {
        let path = temp_path();
        {
            let repo = SqliteRepository::open(&path).await.unwrap();
            repo.insert_incident(&incident("late", 5)).await.unwrap();
            repo.insert_incident(&incident("early", 1)).await.unwrap();
        }

        let repo = SqliteRepository::open(&path).await.unwrap();
        let ids: Vec<String> = repo
            .list_incidents()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["early", "late"]);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn status_and_backlog_flags() {
        let (repo, path) = repository().await;
        repo.insert_incident(&incident("a", 0)).await.unwrap();

        let updated = repo
            .update_status("a", IncidentStatus::Reported)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, IncidentStatus::Reported);
        assert!(
            repo.update_status("zzz", IncidentStatus::Resolved)
                .await
                .unwrap()
                .is_none()
        );

        repo.mark_unclustered("a", "No capacity").await.unwrap();
        assert_eq!(repo.list_unclustered().await.unwrap().len(), 1);
        repo.clear_unclustered("a").await.unwrap();
        assert!(repo.list_unclustered().await.unwrap().is_empty());

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn hotspots_upsert_and_filter_dormant() {
        let (repo, path) = repository().await;
        let mut hotspot = Hotspot {
            id: ClusterId(7),
            location: GeoPoint::new(1.5, 2.5),
            radius_meters: 500,
            crime_count: 3,
            severity_score: 6.25,
            dominant_crime_type: Some(CrimeType::DrugActivity),
            last_updated: now(),
            dormant: false,
        };
        repo.upsert_hotspot(&hotspot).await.unwrap();
        assert_eq!(repo.list_hotspots(false).await.unwrap(), vec![hotspot.clone()]);

        hotspot.dormant = true;
        hotspot.dominant_crime_type = None;
        repo.upsert_hotspot(&hotspot).await.unwrap();
        assert!(repo.list_hotspots(false).await.unwrap().is_empty());
        assert_eq!(repo.list_hotspots(true).await.unwrap(), vec![hotspot]);

        repo.clear_hotspots().await.unwrap();
        assert!(repo.list_hotspots(true).await.unwrap().is_empty());

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn watch_areas_and_alerts() {
        let (repo, path) = repository().await;
        let area = WatchArea {
            user_id: "u1".to_string(),
            group_id: Some("block-9".to_string()),
            center: GeoPoint::new(3.0, 4.0),
            radius_meters: 750,
        };
        repo.insert_watch_area(&area).await.unwrap();
        assert_eq!(repo.list_watch_areas().await.unwrap(), vec![area]);

        for (id, minutes, hotspot) in [("old", 0, None), ("new", 10, Some(ClusterId(2)))] {
            repo.insert_alert(&Alert {
                id: id.to_string(),
                user_id: "u1".to_string(),
                incident_id: None,
                hotspot_id: hotspot,
                title: "t".to_string(),
                message: "m".to_string(),
                alert_type: AlertType::Hotspot,
                is_read: false,
                created_at: now() + Duration::minutes(minutes),
            })
            .await
            .unwrap();
        }

        let alerts = repo.list_alerts("u1", false).await.unwrap();
        assert_eq!(alerts[0].id, "new");
        assert_eq!(alerts[0].hotspot_id, Some(ClusterId(2)));
        assert_eq!(alerts[1].id, "old");

        let read = repo.mark_alert_read("new").await.unwrap().unwrap();
        assert!(read.is_read);
        let unread = repo.list_alerts("u1", true).await.unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].id, "old");
        assert!(repo.mark_alert_read("missing").await.unwrap().is_none());

        let _ = std::fs::remove_file(path);
    }
}
