//! HTTP handler functions for the crime watch API.

use actix_web::{HttpResponse, web};
use crime_watch_crime_models::CrimeType;
use crime_watch_hotspot::{AlertError, IngestError};
use crime_watch_hotspot_models::{GeoPoint, IncidentSubmission, WatchArea};
use crime_watch_server_models::{
    AlertQueryParams, ApiAlert, ApiCrimeType, ApiHealth, ApiHotspot, ApiIncident,
    ApiReconcileReport, CommunityAlertRequest, CommunityAlertResponse, ErrorResponse,
    HotspotQueryParams, IngestResponse, StatusUpdateRequest, WatchAreaRequest,
};
use tokio::sync::broadcast::error::RecvError;

use crate::AppState;

fn internal_error(what: &str, e: impl std::fmt::Display) -> HttpResponse {
    log::error!("Failed to {what}: {e}");
    HttpResponse::InternalServerError().json(ErrorResponse::new(format!("Failed to {what}")))
}

fn alert_error(what: &str, e: AlertError) -> HttpResponse {
    match e {
        AlertError::Validation(e) => HttpResponse::BadRequest().json(ErrorResponse::new(e.to_string())),
        AlertError::NotFound { alert_id } => {
            HttpResponse::NotFound().json(ErrorResponse::new(format!("Alert {alert_id} not found")))
        }
        AlertError::Repository(e) => internal_error(what, e),
    }
}

/// `GET /api/health`
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(ApiHealth {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_hotspots: state.pipeline.engine().active_count(),
    })
}

/// `GET /api/crime-types`
///
/// Returns the crime types a report can be filed under.
pub async fn crime_types() -> HttpResponse {
    let types: Vec<ApiCrimeType> = CrimeType::all()
        .iter()
        .copied()
        .map(ApiCrimeType::from)
        .collect();
    HttpResponse::Ok().json(types)
}

/// `POST /api/incidents`
///
/// Validates and stores a report, then clusters it. A report that cannot
/// be clustered yet is still stored and answered with `201`.
pub async fn submit_incident(
    state: web::Data<AppState>,
    body: web::Json<IncidentSubmission>,
) -> HttpResponse {
    match state.pipeline.ingest(body.into_inner()).await {
        Ok(report) => HttpResponse::Created().json(IngestResponse::from(report)),
        Err(IngestError::Validation(e)) => {
            HttpResponse::BadRequest().json(ErrorResponse::new(e.to_string()))
        }
        Err(IngestError::Repository(e)) => internal_error("store incident", e),
    }
}

/// `GET /api/incidents/{id}`
pub async fn incident(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let id = path.into_inner();
    match state.pipeline.incident(&id).await {
        Ok(Some(incident)) => HttpResponse::Ok().json(ApiIncident::from(incident)),
        Ok(None) => {
            HttpResponse::NotFound().json(ErrorResponse::new(format!("Incident {id} not found")))
        }
        Err(e) => internal_error("load incident", e),
    }
}

/// `PATCH /api/incidents/{id}/status`
///
/// Moderation: changes the status of a report without touching hotspots.
pub async fn update_status(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<StatusUpdateRequest>,
) -> HttpResponse {
    let id = path.into_inner();
    match state.pipeline.update_status(&id, body.status).await {
        Ok(Some(incident)) => HttpResponse::Ok().json(ApiIncident::from(incident)),
        Ok(None) => {
            HttpResponse::NotFound().json(ErrorResponse::new(format!("Incident {id} not found")))
        }
        Err(e) => internal_error("update incident status", e),
    }
}

/// `GET /api/hotspots`
pub async fn hotspots(
    state: web::Data<AppState>,
    params: web::Query<HotspotQueryParams>,
) -> HttpResponse {
    match state
        .pipeline
        .hotspots(params.include_dormant.unwrap_or(false))
        .await
    {
        Ok(hotspots) => HttpResponse::Ok().json(
            hotspots
                .into_iter()
                .map(ApiHotspot::from)
                .collect::<Vec<_>>(),
        ),
        Err(e) => internal_error("load hotspots", e),
    }
}

/// `POST /api/watch-areas`
pub async fn add_watch_area(
    state: web::Data<AppState>,
    body: web::Json<WatchAreaRequest>,
) -> HttpResponse {
    let request = body.into_inner();
    let area = WatchArea {
        user_id: request.user_id,
        group_id: request.group_id,
        center: GeoPoint::new(request.latitude, request.longitude),
        radius_meters: request.radius_meters,
    };
    match state.pipeline.alerts().add_watch_area(area).await {
        Ok(area) => HttpResponse::Created().json(area),
        Err(e) => alert_error("store watch area", e),
    }
}

/// `GET /api/users/{id}/alerts`
pub async fn user_alerts(
    state: web::Data<AppState>,
    path: web::Path<String>,
    params: web::Query<AlertQueryParams>,
) -> HttpResponse {
    let user_id = path.into_inner();
    match state
        .pipeline
        .alerts()
        .alerts_for(&user_id, params.unread_only.unwrap_or(false))
        .await
    {
        Ok(alerts) => {
            let alerts: Vec<ApiAlert> = alerts.into_iter().map(ApiAlert::from).collect();
            HttpResponse::Ok().json(alerts)
        }
        Err(e) => internal_error("load alerts", e),
    }
}

/// `POST /api/alerts/{id}/read`
pub async fn mark_alert_read(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    match state.pipeline.alerts().mark_read(&path.into_inner()).await {
        Ok(alert) => HttpResponse::Ok().json(ApiAlert::from(alert)),
        Err(e) => alert_error("mark alert read", e),
    }
}

/// `POST /api/groups/{id}/alerts`
///
/// Sends a community alert to every member of a watch group.
pub async fn community_alert(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<CommunityAlertRequest>,
) -> HttpResponse {
    let group_id = path.into_inner();
    match state
        .pipeline
        .alerts()
        .notify_group(&group_id, &body.title, &body.message)
        .await
    {
        Ok(alerts) => HttpResponse::Created().json(CommunityAlertResponse {
            recipients: alerts.len(),
        }),
        Err(e) => alert_error("send community alert", e),
    }
}

/// `POST /api/reconcile`
///
/// Runs a reconciliation pass immediately.
pub async fn reconcile(state: web::Data<AppState>) -> HttpResponse {
    match state.pipeline.reconcile().await {
        Ok(report) => HttpResponse::Ok().json(ApiReconcileReport::from(report)),
        Err(e) => internal_error("reconcile hotspots", e),
    }
}

/// `GET /api/events`
///
/// Streams engine events as server-sent events, one JSON object per
/// `data:` line. A client that falls behind gets a comment with the number
/// of skipped events and continues from the oldest event still buffered.
pub async fn events(state: web::Data<AppState>) -> HttpResponse {
    let mut rx = state.pipeline.subscribe();
    log::debug!("Event stream client connected");

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => {
                        yield Ok::<_, actix_web::Error>(web::Bytes::from(format!("data: {json}\n\n")));
                    }
                    Err(e) => log::error!("Failed to serialize event: {e}"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Event stream client lagged, skipped {skipped} events");
                    yield Ok(web::Bytes::from(format!(": skipped {skipped} events\n\n")));
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(stream)
}
