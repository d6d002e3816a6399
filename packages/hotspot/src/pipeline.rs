//! End-to-end handling of incident reports.
//!
//! [`HotspotPipeline`] validates a submission, stores it, assigns it to a
//! cluster, persists the affected hotspot, raises alerts, and publishes
//! the resulting [`HotspotEvent`]s. Storage of the incident is the only step
//! that can fail an ingest once validation passes: clustering, hotspot
//! persistence, and alerting failures are logged with the incident id and
//! the incident is left for [`HotspotPipeline::reconcile`] to pick up.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crime_watch_crime_models::IncidentStatus;
use crime_watch_hotspot_models::{
    Alert, ClusterId, Hotspot, HotspotConfig, HotspotEvent, Incident, IncidentSubmission,
};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::alerts::AlertService;
use crate::clock::Clock;
use crate::engine::{Assignment, ClusterEngine};
use crate::events::EventBus;
use crate::ingest::normalize_submission;
use crate::repository::{IncidentRepository, RepositoryError};
use crate::{ClusterError, IngestError};

/// What happened to an incident in the clustering stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ClusteringOutcome {
    /// The incident joined or opened a cluster.
    #[serde(rename_all = "camelCase")]
    Assigned {
        /// The cluster it belongs to.
        cluster_id: ClusterId,
        /// Whether the incident opened the cluster.
        created: bool,
    },
    /// Clustering failed and will be retried by reconciliation.
    Deferred {
        /// Why clustering failed.
        reason: String,
    },
}

/// Result of a successful ingest.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    /// The stored incident.
    pub incident: Incident,
    /// Clustering result.
    pub clustering: ClusteringOutcome,
    /// Alerts raised by this report.
    pub alerts_raised: Vec<Alert>,
}

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Deferred incidents that were clustered on retry.
    pub retried: usize,
    /// Deferred incidents still waiting after this pass.
    pub still_deferred: usize,
    /// Incidents evicted from drifted clusters and re-assigned.
    pub evicted: usize,
    /// Active clusters rescored.
    pub updated: usize,
    /// Clusters retired below the dormancy floor.
    pub retired: usize,
    /// Clusters skipped because their lock could not be acquired.
    pub skipped: usize,
    /// Alerts raised during the pass.
    pub alerts_raised: usize,
}

/// Ingest, clustering, scoring, and alerting wired together.
pub struct HotspotPipeline {
    config: HotspotConfig,
    repository: Arc<dyn IncidentRepository>,
    engine: ClusterEngine,
    alerts: AlertService,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl HotspotPipeline {
    /// Creates a pipeline with an empty engine.
    ///
    /// Call [`Self::replay`] to rebuild clusters from incidents already in
    /// `repository`.
    #[must_use]
    pub fn new(
        config: HotspotConfig,
        repository: Arc<dyn IncidentRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let events = EventBus::new(config.event_buffer);
        let alerts = AlertService::new(
            config.clone(),
            Arc::clone(&repository),
            events.clone(),
            Arc::clone(&clock),
        );
        Self {
            engine: ClusterEngine::new(config.clone()),
            config,
            repository,
            alerts,
            events,
            clock,
        }
    }

    /// Pipeline configuration.
    #[must_use]
    pub const fn config(&self) -> &HotspotConfig {
        &self.config
    }

    /// The clustering engine.
    #[must_use]
    pub const fn engine(&self) -> &ClusterEngine {
        &self.engine
    }

    /// The alert service.
    #[must_use]
    pub const fn alerts(&self) -> &AlertService {
        &self.alerts
    }

    /// The backing repository.
    #[must_use]
    pub fn repository(&self) -> &dyn IncidentRepository {
        self.repository.as_ref()
    }

    /// Subscribes to the change feed.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HotspotEvent> {
        self.events.subscribe()
    }

    /// Validates, stores, and clusters a submission.
    ///
    /// # Errors
    ///
    /// * [`IngestError::Validation`] if the submission is rejected; nothing
    ///   is stored
    /// * [`IngestError::Repository`] if the incident cannot be stored
    pub async fn ingest(&self, submission: IncidentSubmission) -> Result<IngestReport, IngestError> {
        let now = self.clock.now();
        let incident = match normalize_submission(submission, now) {
            Ok(incident) => incident,
            Err(e) => {
                log::info!("Rejected submission: {e}");
                return Err(e.into());
            }
        };

        self.repository.insert_incident(&incident).await?;
        log::info!(
            "Stored incident {} ({} {}, {:.5},{:.5})",
            incident.id,
            incident.severity,
            incident.crime_type,
            incident.location.lat,
            incident.location.lng
        );
        self.events.publish(HotspotEvent::IncidentIngested {
            incident: incident.clone(),
        });

        let (clustering, mut alerts_raised) = self.cluster(&incident, now).await;

        match self.alerts.on_incident(&incident).await {
            Ok(alerts) => alerts_raised.extend(alerts),
            Err(e) => log::error!("Failed to raise alerts for incident {}: {e}", incident.id),
        }

        Ok(IngestReport {
            incident,
            clustering,
            alerts_raised,
        })
    }

    /// Assigns a stored incident, deferring it on failure.
    async fn cluster(
        &self,
        incident: &Incident,
        now: DateTime<Utc>,
    ) -> (ClusteringOutcome, Vec<Alert>) {
        match self.engine.assign(incident, now).await {
            Ok(assignment) => {
                let outcome = ClusteringOutcome::Assigned {
                    cluster_id: assignment.cluster_id,
                    created: assignment.created,
                };
                let alerts = self.record_assignment(assignment, &incident.id).await;
                (outcome, alerts)
            }
            Err(e) => {
                self.defer(incident, &e).await;
                (
                    ClusteringOutcome::Deferred {
                        reason: e.to_string(),
                    },
                    Vec::new(),
                )
            }
        }
    }

    /// Persists and publishes the new snapshot while the cluster is still
    /// locked, then releases it before raising alerts.
    async fn record_assignment(&self, assignment: Assignment, incident_id: &str) -> Vec<Alert> {
        self.persist_hotspot(&assignment.hotspot, Some(incident_id))
            .await;
        self.events.publish(if assignment.created {
            HotspotEvent::HotspotCreated {
                hotspot: assignment.hotspot.clone(),
            }
        } else {
            HotspotEvent::HotspotUpdated {
                hotspot: assignment.hotspot.clone(),
            }
        });

        let previous_score = assignment.previous_score;
        let hotspot = assignment.release();
        self.hotspot_alerts(previous_score, &hotspot).await
    }

    async fn defer(&self, incident: &Incident, error: &ClusterError) {
        log::warn!("Deferred clustering of incident {}: {error}", incident.id);
        if let Err(e) = self
            .repository
            .mark_unclustered(&incident.id, &error.to_string())
            .await
        {
            log::error!("Failed to flag incident {} as unclustered: {e}", incident.id);
        }
        self.events.publish(HotspotEvent::IncidentDeferred {
            incident_id: incident.id.clone(),
            reason: error.to_string(),
        });
    }

    async fn persist_hotspot(&self, hotspot: &Hotspot, incident_id: Option<&str>) {
        if let Err(e) = self.repository.upsert_hotspot(hotspot).await {
            match incident_id {
                Some(incident_id) => log::error!(
                    "Failed to persist hotspot {} after incident {incident_id}: {e}",
                    hotspot.id
                ),
                None => log::error!("Failed to persist hotspot {}: {e}", hotspot.id),
            }
        }
    }

    async fn hotspot_alerts(&self, previous_score: f64, hotspot: &Hotspot) -> Vec<Alert> {
        match self.alerts.on_hotspot_change(previous_score, hotspot).await {
            Ok(alerts) => alerts,
            Err(e) => {
                log::error!("Failed to raise alerts for hotspot {}: {e}", hotspot.id);
                Vec::new()
            }
        }
    }

    /// Runs a reconciliation pass at the current time.
    ///
    /// Rescores every cluster, evicts and re-assigns members of drifted
    /// clusters, retires clusters below the dormancy floor, and then
    /// retries the deferred backlog so that capacity freed by retirement is
    /// used in the same pass.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError`] if the deferred backlog cannot be read.
    pub async fn reconcile(&self) -> Result<ReconcileReport, RepositoryError> {
        let now = self.clock.now();
        let mut report = ReconcileReport::default();
        let mut evicted = Vec::new();

        for id in self.engine.active_ids() {
            let mut step = match self.engine.reconcile_cluster(id, now).await {
                Ok(Some(step)) => step,
                Ok(None) => continue,
                Err(e) => {
                    report.skipped += 1;
                    log::warn!("Reconciliation skipped cluster {id}: {e}");
                    continue;
                }
            };
            evicted.append(&mut step.evicted);

            self.persist_hotspot(&step.hotspot, None).await;
            if step.retired() {
                report.retired += 1;
                self.events.publish(HotspotEvent::HotspotRetired {
                    hotspot: step.release(),
                });
                continue;
            }

            report.updated += 1;
            self.events.publish(HotspotEvent::HotspotUpdated {
                hotspot: step.hotspot.clone(),
            });
            let previous_score = step.previous_score;
            let hotspot = step.release();
            report.alerts_raised += self.hotspot_alerts(previous_score, &hotspot).await.len();
        }

        for incident in evicted {
            report.evicted += 1;
            let (_, alerts) = self.cluster(&incident, now).await;
            report.alerts_raised += alerts.len();
        }

        for incident in self.repository.list_unclustered().await? {
            match self.engine.assign(&incident, now).await {
                Ok(assignment) => {
                    report.retried += 1;
                    log::info!(
                        "Clustered deferred incident {} into cluster {}",
                        incident.id,
                        assignment.cluster_id
                    );
                    if let Err(e) = self.repository.clear_unclustered(&incident.id).await {
                        log::error!(
                            "Failed to clear unclustered flag of incident {}: {e}",
                            incident.id
                        );
                    }
                    report.alerts_raised +=
                        self.record_assignment(assignment, &incident.id).await.len();
                }
                Err(e) => {
                    report.still_deferred += 1;
                    log::debug!("Incident {} still deferred: {e}", incident.id);
                }
            }
        }

        log::info!(
            "Reconciled: {} updated, {} retired, {} evicted, {} retried, {} still deferred, {} skipped",
            report.updated,
            report.retired,
            report.evicted,
            report.retried,
            report.still_deferred,
            report.skipped
        );
        Ok(report)
    }

    /// Rebuilds the in-memory clusters from every stored incident, oldest
    /// first, and rewrites the hotspot table to match. Returns the number
    /// of incidents clustered.
    ///
    /// Meant to run once at startup, before any ingest.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError`] if the stored incidents cannot be read or
    /// the hotspot table cannot be cleared.
    pub async fn replay(&self) -> Result<usize, RepositoryError> {
        let now = self.clock.now();
        self.repository.clear_hotspots().await?;
        let incidents = self.repository.list_incidents().await?;
        let total = incidents.len();
        let mut clustered = 0;

        for incident in incidents {
            match self.engine.assign(&incident, now).await {
                Ok(_) => {
                    clustered += 1;
                    self.repository.clear_unclustered(&incident.id).await?;
                }
                Err(e) => {
                    log::warn!("Incident {} not clustered on replay: {e}", incident.id);
                    self.repository
                        .mark_unclustered(&incident.id, &e.to_string())
                        .await?;
                }
            }
        }

        for hotspot in self.engine.hotspots().await {
            self.repository.upsert_hotspot(&hotspot).await?;
        }

        log::info!(
            "Replayed {clustered}/{total} incidents into {} clusters",
            self.engine.active_count()
        );
        Ok(clustered)
    }

    /// Looks up a stored incident.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError`] if the lookup fails.
    pub async fn incident(&self, id: &str) -> Result<Option<Incident>, RepositoryError> {
        self.repository.get_incident(id).await
    }

    /// Sets an incident's moderation status. Clustering is unaffected.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError`] if the update fails.
    pub async fn update_status(
        &self,
        id: &str,
        status: IncidentStatus,
    ) -> Result<Option<Incident>, RepositoryError> {
        let updated = self.repository.update_status(id, status).await?;
        if updated.is_some() {
            log::info!("Incident {id} moved to {status}");
        }
        Ok(updated)
    }

    /// Current hotspots ordered by id.
    ///
    /// Active hotspots come from the engine. Dormant ones are only kept in
    /// the repository and are read from there when `include_dormant` is set.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError`] if dormant hotspots cannot be read.
    pub async fn hotspots(&self, include_dormant: bool) -> Result<Vec<Hotspot>, RepositoryError> {
        let mut hotspots = self.engine.hotspots().await;
        if include_dormant {
            let active: BTreeSet<ClusterId> = hotspots.iter().map(|h| h.id).collect();
            hotspots.extend(
                self.repository
                    .list_hotspots(true)
                    .await?
                    .into_iter()
                    .filter(|h| h.dormant && !active.contains(&h.id)),
            );
            hotspots.sort_by_key(|h| h.id);
        }
        Ok(hotspots)
    }
}
