//! Database lifecycle.

use std::path::Path;

use switchy_database::Database;
use switchy_database_connection::init_sqlite_rusqlite;

use crate::DbError;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS incidents (
        id                 TEXT PRIMARY KEY,
        title              TEXT,
        description        TEXT NOT NULL,
        crime_type         TEXT NOT NULL,
        severity           INTEGER NOT NULL,
        lat                REAL NOT NULL,
        lng                REAL NOT NULL,
        occurred_at        TEXT NOT NULL,
        created_at         TEXT NOT NULL,
        status             TEXT NOT NULL,
        reporter_id        TEXT,
        unclustered_reason TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_incidents_created
     ON incidents (created_at)",
    "CREATE TABLE IF NOT EXISTS hotspots (
        id                  INTEGER PRIMARY KEY,
        lat                 REAL NOT NULL,
        lng                 REAL NOT NULL,
        radius_meters       INTEGER NOT NULL,
        crime_count         INTEGER NOT NULL,
        severity_score      REAL NOT NULL,
        dominant_crime_type TEXT,
        last_updated        TEXT NOT NULL,
        dormant             INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS watch_areas (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id       TEXT NOT NULL,
        group_id      TEXT,
        lat           REAL NOT NULL,
        lng           REAL NOT NULL,
        radius_meters INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS alerts (
        id          TEXT PRIMARY KEY,
        user_id     TEXT NOT NULL,
        incident_id TEXT,
        hotspot_id  INTEGER,
        title       TEXT NOT NULL,
        message     TEXT NOT NULL,
        alert_type  TEXT NOT NULL,
        is_read     INTEGER NOT NULL DEFAULT 0,
        created_at  TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_alerts_user
     ON alerts (user_id, created_at)",
];

/// Opens (or creates) the `SQLite` database at `path` and ensures the
/// schema exists.
///
/// # Errors
///
/// Returns [`DbError`] if the directory cannot be created, the database
/// cannot be opened, or schema creation fails.
pub async fn open_db(path: &Path) -> Result<Box<dyn Database>, DbError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db = init_sqlite_rusqlite(Some(path)).map_err(|e| DbError::Database(e.to_string()))?;
    ensure_schema(db.as_ref()).await?;

    log::info!("Opened incident database at {}", path.display());
    Ok(db)
}

async fn ensure_schema(db: &dyn Database) -> Result<(), DbError> {
    for statement in SCHEMA {
        db.exec_raw(statement)
            .await
            .map_err(|e| DbError::Database(e.to_string()))?;
    }
    Ok(())
}
