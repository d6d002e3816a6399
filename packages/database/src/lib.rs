#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! `SQLite` storage for the hotspot pipeline.
//!
//! [`SqliteRepository`] implements
//! [`IncidentRepository`](crime_watch_hotspot::repository::IncidentRepository)
//! on top of `switchy_database`. The schema is created on open, so a fresh
//! path is a valid empty store.

pub mod db;
pub mod queries;

pub use db::open_db;
pub use queries::SqliteRepository;

/// Default path of the incident database.
pub const DEFAULT_DB_PATH: &str = "data/crime_watch.db";

/// Errors that can occur while opening the database.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A database query or command failed.
    #[error("Database error: {0}")]
    Database(String),

    /// An I/O operation failed (e.g., creating the database directory).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
