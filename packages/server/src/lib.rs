#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Actix-Web API server for the crime watch hotspot engine.
//!
//! Accepts incident reports, serves the current hotspots and per-user
//! alerts, and streams engine events to clients over server-sent events.
//! Incidents are stored in `SQLite` (or in memory with `--in-memory`) and
//! the clusters are rebuilt from storage on startup.

mod handlers;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware, web};
use crime_watch_database::SqliteRepository;
use crime_watch_hotspot::clock::SystemClock;
use crime_watch_hotspot::pipeline::HotspotPipeline;
use crime_watch_hotspot::repository::{InMemoryRepository, IncidentRepository};
use crime_watch_hotspot_models::{ConfigError, HotspotConfig};

/// Shared application state.
pub struct AppState {
    /// The hotspot pipeline serving every request.
    pub pipeline: Arc<HotspotPipeline>,
}

/// Errors that prevent the server from starting.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The configuration file could not be loaded.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// The database could not be opened.
    #[error("Database error: {0}")]
    Database(#[from] crime_watch_database::DbError),

    /// Rebuilding clusters from storage failed.
    #[error("Replay error: {0}")]
    Replay(#[from] crime_watch_hotspot::RepositoryError),

    /// Binding or running the HTTP server failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Startup options.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Address to bind.
    pub bind_addr: String,
    /// Port to bind.
    pub port: u16,
    /// Hotspot configuration file. Defaults apply when `None`.
    pub config_path: Option<PathBuf>,
    /// `SQLite` database path. Ignored when `in_memory` is set.
    pub database_path: PathBuf,
    /// Keep everything in memory instead of `SQLite`.
    pub in_memory: bool,
    /// Seconds between background reconciliation passes. `0` disables them.
    pub reconcile_interval_secs: u64,
}

/// Loads the hotspot configuration, falling back to defaults.
///
/// # Errors
///
/// Returns [`ConfigError`] if the file exists but cannot be read or
/// parsed, or if it holds invalid values.
pub fn load_config(path: Option<&Path>) -> Result<HotspotConfig, ConfigError> {
    let Some(path) = path else {
        log::info!("No config file given, using defaults");
        return Ok(HotspotConfig::default());
    };
    let config = HotspotConfig::load(path)?;
    log::info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Opens storage and rebuilds the pipeline's clusters from it.
///
/// # Errors
///
/// Returns [`ServerError`] if storage cannot be opened or replayed.
pub async fn build_pipeline(
    options: &ServerOptions,
    config: HotspotConfig,
) -> Result<HotspotPipeline, ServerError> {
    let repository: Arc<dyn IncidentRepository> = if options.in_memory {
        log::warn!("Using in-memory storage, reports will not survive a restart");
        Arc::new(InMemoryRepository::new())
    } else {
        log::info!("Opening incident database...");
        Arc::new(SqliteRepository::open(&options.database_path).await?)
    };

    let pipeline = HotspotPipeline::new(config, repository, Arc::new(SystemClock));

    log::info!("Rebuilding hotspots from stored incidents...");
    pipeline.replay().await?;
    pipeline.reconcile().await?;

    Ok(pipeline)
}

/// Registers every API route.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/health", web::get().to(handlers::health))
            .route("/crime-types", web::get().to(handlers::crime_types))
            .route("/incidents", web::post().to(handlers::submit_incident))
            .route("/incidents/{id}", web::get().to(handlers::incident))
            .route(
                "/incidents/{id}/status",
                web::patch().to(handlers::update_status),
            )
            .route("/hotspots", web::get().to(handlers::hotspots))
            .route("/watch-areas", web::post().to(handlers::add_watch_area))
            .route("/users/{id}/alerts", web::get().to(handlers::user_alerts))
            .route("/alerts/{id}/read", web::post().to(handlers::mark_alert_read))
            .route(
                "/groups/{id}/alerts",
                web::post().to(handlers::community_alert),
            )
            .route("/reconcile", web::post().to(handlers::reconcile))
            .route("/events", web::get().to(handlers::events)),
    );
}

fn spawn_reconciler(pipeline: Arc<HotspotPipeline>, every: Duration) {
    actix_rt::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The first tick fires immediately and startup already reconciled.
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = pipeline.reconcile().await {
                log::error!("Background reconciliation failed: {e}");
            }
        }
    });
}

/// Starts the crime watch API server.
///
/// Loads the configuration, opens storage, rebuilds hotspots, and serves
/// the API until shutdown. This is a regular async function; the caller
/// provides the runtime (e.g. via `#[actix_web::main]`).
///
/// # Errors
///
/// Returns [`ServerError`] if startup fails or the HTTP server fails to
/// bind or encounters a runtime error.
#[allow(clippy::future_not_send)]
pub async fn run_server(options: ServerOptions) -> Result<(), ServerError> {
    let config = load_config(options.config_path.as_deref())?;
    let pipeline = Arc::new(build_pipeline(&options, config).await?);

    if options.reconcile_interval_secs > 0 {
        log::info!(
            "Reconciling every {}s",
            options.reconcile_interval_secs
        );
        spawn_reconciler(
            Arc::clone(&pipeline),
            Duration::from_secs(options.reconcile_interval_secs),
        );
    }

    let state = web::Data::new(AppState { pipeline });

    log::info!("Starting server on {}:{}", options.bind_addr, options.port);

    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .configure(configure)
    })
    .bind((options.bind_addr.as_str(), options.port))?
    .run()
    .await?;

    Ok(())
}
