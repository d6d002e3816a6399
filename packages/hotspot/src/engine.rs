//! Assignment of incidents to clusters.
//!
//! Active clusters live in a registry holding the spatial index of cluster
//! centers plus one [`tokio::sync::Mutex`] per cluster. The registry itself
//! is a short-lived [`std::sync::RwLock`] that is never held across an
//! `.await`.
//!
//! Lock order is always cluster lock first, registry second. New clusters
//! are opened while holding the registry write lock, after re-checking that
//! no cluster appeared within range in the meantime, so two reports at the
//! same spot can never open two clusters.
//!
//! An [`Assignment`] or [`Reconciled`] step keeps its cluster locked until
//! the caller drops it, so snapshots leave the engine in the same order as
//! the changes that produced them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use crime_watch_hotspot_models::{ClusterId, Hotspot, HotspotConfig, Incident};
use crime_watch_spatial::{CenterIndex, haversine_meters};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::ClusterError;
use crate::cluster::Cluster;
use crate::lock::lock_with_backoff;

type Slot = Arc<Mutex<Cluster>>;

#[derive(Default)]
struct Registry {
    index: CenterIndex,
    slots: BTreeMap<ClusterId, Slot>,
}

/// Result of assigning one incident.
///
/// Holds the cluster's update lock until it is dropped or
/// [released](Self::release), so the caller can persist and publish
/// [`Self::hotspot`] before any later change to the same cluster.
#[derive(Debug)]
pub struct Assignment {
    /// Cluster the incident joined.
    pub cluster_id: ClusterId,
    /// Snapshot of the cluster after the join.
    pub hotspot: Hotspot,
    /// Whether the incident opened a new cluster.
    pub created: bool,
    /// Score before the join, `0.0` for a new cluster.
    pub previous_score: f64,
    /// Distance from the cluster center at the time of the join.
    pub distance_meters: f64,
    _guard: OwnedMutexGuard<Cluster>,
}

impl Assignment {
    /// Releases the cluster lock and returns the snapshot.
    #[must_use]
    pub fn release(self) -> Hotspot {
        self.hotspot
    }
}

/// One cluster after a reconciliation step. Holds the cluster lock like
/// [`Assignment`].
#[derive(Debug)]
pub struct Reconciled {
    /// Score before reconciliation.
    pub previous_score: f64,
    /// Snapshot after reconciliation, dormant if the cluster was retired.
    pub hotspot: Hotspot,
    /// Members evicted because the centroid drifted away from them. They
    /// belong to no cluster until re-assigned.
    pub evicted: Vec<Incident>,
    _guard: OwnedMutexGuard<Cluster>,
}

impl Reconciled {
    /// Whether the cluster was retired in this step.
    #[must_use]
    pub const fn retired(&self) -> bool {
        self.hotspot.dormant
    }

    /// Releases the cluster lock and returns the snapshot.
    #[must_use]
    pub fn release(self) -> Hotspot {
        self.hotspot
    }
}

/// In-memory clustering state.
///
/// Only active clusters are kept. Retired clusters are dropped from memory
/// once their dormant snapshot has been handed to the caller.
pub struct ClusterEngine {
    config: HotspotConfig,
    registry: RwLock<Registry>,
    next_id: AtomicU64,
}

enum Route {
    Join(ClusterId, Slot),
    Open,
}

enum Opened {
    Created(Assignment),
    /// A cluster within range appeared since routing.
    Raced(ClusterId),
}

impl ClusterEngine {
    /// Creates an engine with no clusters.
    #[must_use]
    pub fn new(config: HotspotConfig) -> Self {
        Self {
            config,
            registry: RwLock::new(Registry::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Engine configuration.
    #[must_use]
    pub const fn config(&self) -> &HotspotConfig {
        &self.config
    }

    /// Number of active clusters.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.read().index.len()
    }

    /// Ids of the active clusters in ascending order.
    #[must_use]
    pub fn active_ids(&self) -> Vec<ClusterId> {
        self.read().slots.keys().copied().collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, id: ClusterId) -> Option<Slot> {
        self.read().slots.get(&id).map(Arc::clone)
    }

    /// Assigns `incident` to the nearest active cluster whose center is
    /// within the cluster radius, or opens a new cluster centered on it.
    ///
    /// A cluster that moved out of range or retired while we waited for its
    /// lock causes a reroute, at most
    /// [`HotspotConfig::lock_retry_attempts`] + 1 routes in total.
    ///
    /// # Errors
    ///
    /// * [`ClusterError::NoCapacity`] if a new cluster is needed and the
    ///   active cluster limit has been reached
    /// * [`ClusterError::LockTimeout`] if the target cluster stayed locked
    ///   through every retry, or kept changing under every reroute
    pub async fn assign(
        &self,
        incident: &Incident,
        now: DateTime<Utc>,
    ) -> Result<Assignment, ClusterError> {
        let routes = self.config.lock_retry_attempts.saturating_add(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let contended = match self.route(incident) {
                Route::Join(cluster_id, slot) => {
                    let cluster = lock_with_backoff(&slot, cluster_id, &self.config).await?;
                    if !cluster.is_retired() && cluster.accepts(incident.location) {
                        return Ok(self.join(cluster, incident, now));
                    }
                    log::debug!(
                        "Cluster {cluster_id} no longer accepts incident {}, rerouting",
                        incident.id
                    );
                    cluster_id
                }
                Route::Open => match self.open(incident, now)? {
                    Opened::Created(assignment) => return Ok(assignment),
                    Opened::Raced(cluster_id) => cluster_id,
                },
            };

            if attempt >= routes {
                log::warn!(
                    "Gave up routing incident {} after {attempt} attempts, last at cluster {contended}",
                    incident.id
                );
                return Err(ClusterError::LockTimeout {
                    cluster_id: contended,
                    attempts: attempt,
                });
            }
        }
    }

    fn route(&self, incident: &Incident) -> Route {
        let registry = self.read();
        let Some((id, _)) = registry
            .index
            .nearest_within(incident.location, self.config.radius_meters())
        else {
            return Route::Open;
        };
        registry.slots.get(&id).map_or_else(
            || {
                log::warn!("Cluster {id} indexed without a slot");
                Route::Open
            },
            |slot| Route::Join(id, Arc::clone(slot)),
        )
    }

    fn join(
        &self,
        mut cluster: OwnedMutexGuard<Cluster>,
        incident: &Incident,
        now: DateTime<Utc>,
    ) -> Assignment {
        let cluster_id = cluster.id();
        let previous_score = cluster.score();
        let distance_meters = haversine_meters(cluster.center(), incident.location);
        cluster.join(incident.clone(), now, &self.config);
        self.write().index.upsert(cluster_id, cluster.center());

        log::debug!(
            "Incident {} joined cluster {cluster_id} ({distance_meters:.1}m from center, score {previous_score:.2} -> {:.2})",
            incident.id,
            cluster.score()
        );

        Assignment {
            cluster_id,
            hotspot: cluster.to_hotspot(),
            created: false,
            previous_score,
            distance_meters,
            _guard: cluster,
        }
    }

    /// Opens a cluster for `incident` under the registry write lock, after
    /// re-checking that no cluster within range appeared since routing.
    fn open(&self, incident: &Incident, now: DateTime<Utc>) -> Result<Opened, ClusterError> {
        let mut registry = self.write();

        if let Some((existing, _)) = registry
            .index
            .nearest_within(incident.location, self.config.radius_meters())
        {
            return Ok(Opened::Raced(existing));
        }

        let active = registry.index.len();
        if active >= self.config.max_active_clusters {
            log::warn!(
                "Cannot open cluster for incident {}: {active} of {} clusters active",
                incident.id,
                self.config.max_active_clusters
            );
            return Err(ClusterError::NoCapacity {
                active,
                max: self.config.max_active_clusters,
            });
        }

        let id = ClusterId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let cluster = Cluster::new(
            id,
            incident.clone(),
            self.config.default_radius_meters,
            now,
            &self.config,
        );
        let center = cluster.center();
        let hotspot = cluster.to_hotspot();

        // Nobody else can see the slot yet, so the lock is free.
        let slot = Arc::new(Mutex::new(cluster));
        let guard = Arc::clone(&slot)
            .try_lock_owned()
            .map_err(|_| ClusterError::LockTimeout {
                cluster_id: id,
                attempts: 1,
            })?;
        registry.index.upsert(id, center);
        registry.slots.insert(id, slot);

        log::info!(
            "Opened cluster {id} at {:.5},{:.5} for incident {}",
            center.lat,
            center.lng,
            incident.id
        );

        Ok(Opened::Created(Assignment {
            cluster_id: id,
            hotspot,
            created: true,
            previous_score: 0.0,
            distance_meters: 0.0,
            _guard: guard,
        }))
    }

    /// Rescores one active cluster at `now`. Returns `None` if the cluster
    /// is no longer active.
    ///
    /// A cluster whose centroid drifted more than
    /// [`HotspotConfig::drift_fraction`] of its radius from the anchor first
    /// evicts members now outside the radius. A cluster that ends up below
    /// the dormancy floor is retired: removed from matching and from memory.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::LockTimeout`] if the cluster stayed locked.
    pub async fn reconcile_cluster(
        &self,
        id: ClusterId,
        now: DateTime<Utc>,
    ) -> Result<Option<Reconciled>, ClusterError> {
        let Some(slot) = self.slot(id) else {
            return Ok(None);
        };
        let mut cluster = lock_with_backoff(&slot, id, &self.config).await?;
        if cluster.is_retired() {
            return Ok(None);
        }

        let previous_score = cluster.score();
        let drift_limit = self.config.drift_fraction * f64::from(cluster.radius_meters());
        let drift = cluster.drift_meters();
        let evicted = if drift > drift_limit {
            let evicted = cluster.evict_outside_radius(now, &self.config);
            if !evicted.is_empty() {
                log::info!(
                    "Cluster {id} drifted {drift:.0}m, evicted {} incidents",
                    evicted.len()
                );
            }
            evicted
        } else {
            cluster.rescore(now, &self.config);
            Vec::new()
        };

        if cluster.below_dormancy_floor(&self.config) {
            cluster.retire();
            {
                let mut registry = self.write();
                registry.index.remove(id);
                registry.slots.remove(&id);
            }
            log::info!(
                "Retired cluster {id} (score {:.3}, {} incidents)",
                cluster.score(),
                cluster.len()
            );
        } else {
            self.write().index.upsert(id, cluster.center());
        }

        Ok(Some(Reconciled {
            previous_score,
            hotspot: cluster.to_hotspot(),
            evicted,
            _guard: cluster,
        }))
    }

    /// Snapshots of the active clusters ordered by id.
    pub async fn hotspots(&self) -> Vec<Hotspot> {
        let slots: Vec<Slot> = self.read().slots.values().map(Arc::clone).collect();

        let mut hotspots = Vec::with_capacity(slots.len());
        for slot in slots {
            let cluster = slot.lock().await;
            if !cluster.is_retired() {
                hotspots.push(cluster.to_hotspot());
            }
        }
        hotspots.sort_by_key(|h| h.id);
        hotspots
    }

    #[cfg(test)]
    pub(crate) fn cluster_slot(&self, id: ClusterId) -> Option<Slot> {
        self.slot(id)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use chrono::Duration;
    use crime_watch_crime_models::{CrimeType, IncidentStatus, Severity};
    use crime_watch_hotspot_models::GeoPoint;
    use crime_watch_spatial::EARTH_RADIUS_METERS;

    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn incident(id: &str, lat: f64, lng: f64, severity: Severity) -> Incident {
        Incident {
            id: id.to_string(),
            title: None,
            description: "test".to_string(),
            crime_type: CrimeType::Theft,
            severity,
            location: GeoPoint::new(lat, lng),
            timestamp: now() - Duration::hours(1),
            created_at: now(),
            status: IncidentStatus::Pending,
            reporter_id: None,
        }
    }

    fn north_of(p: GeoPoint, meters: f64) -> GeoPoint {
        GeoPoint::new(p.lat + (meters / EARTH_RADIUS_METERS).to_degrees(), p.lng)
    }

    fn quick_locks() -> HotspotConfig {
        HotspotConfig {
            lock_wait_ms: 5,
            lock_retry_attempts: 1,
            lock_backoff_base_ms: 1,
            ..HotspotConfig::default()
        }
    }

    async fn reconcile_all(engine: &ClusterEngine, at: DateTime<Utc>) -> Vec<Reconciled> {
        let mut steps = Vec::new();
        for id in engine.active_ids() {
            if let Some(step) = engine.reconcile_cluster(id, at).await.unwrap() {
                steps.push(step);
            }
        }
        steps
    }

    #[tokio::test]
    async fn nearby_report_joins_existing_cluster() {
        let engine = ClusterEngine::new(HotspotConfig::default());
        let first = engine
            .assign(&incident("a", -26.2041, 28.0473, Severity::High), now())
            .await
            .unwrap();
        assert!(first.created);
        assert_eq!(first.cluster_id, ClusterId(1));
        drop(first);

        let second = engine
            .assign(&incident("b", -26.2045, 28.0480, Severity::High), now())
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.cluster_id, ClusterId(1));
        assert_eq!(second.hotspot.crime_count, 2);
        assert!(second.distance_meters > 70.0 && second.distance_meters < 100.0);
        assert!(second.hotspot.severity_score > second.previous_score);
        assert!((second.hotspot.location.lat - -26.2043).abs() < 1e-9);
        assert_eq!(second.hotspot.dominant_crime_type, Some(CrimeType::Theft));
        assert_eq!(engine.active_count(), 1);
    }

    #[tokio::test]
    async fn distant_report_opens_new_cluster() {
        let engine = ClusterEngine::new(HotspotConfig::default());
        let start = GeoPoint::new(-26.2041, 28.0473);
        engine
            .assign(&incident("a", start.lat, start.lng, Severity::Low), now())
            .await
            .unwrap();
        let far = north_of(start, 10_000.0);
        let assignment = engine
            .assign(&incident("b", far.lat, far.lng, Severity::Low), now())
            .await
            .unwrap();
        assert!(assignment.created);
        assert_eq!(assignment.cluster_id, ClusterId(2));
        assert_eq!(engine.active_count(), 2);
    }

    #[tokio::test]
    async fn report_exactly_at_radius_joins() {
        let engine = ClusterEngine::new(HotspotConfig::default());
        let start = GeoPoint::new(10.0, 10.0);
        engine
            .assign(&incident("a", start.lat, start.lng, Severity::Low), now())
            .await
            .unwrap();
        let edge = north_of(start, 500.0);
        let joined = engine
            .assign(&incident("b", edge.lat, edge.lng, Severity::Low), now())
            .await
            .unwrap()
            .created;
        assert!(!joined);

        let beyond = north_of(start, 1_500.0);
        assert!(
            engine
                .assign(&incident("c", beyond.lat, beyond.lng, Severity::Low), now())
                .await
                .unwrap()
                .created
        );
    }

    #[tokio::test]
    async fn full_engine_reports_no_capacity() {
        let engine = ClusterEngine::new(HotspotConfig {
            max_active_clusters: 1,
            ..HotspotConfig::default()
        });
        engine
            .assign(&incident("a", 0.0, 0.0, Severity::Low), now())
            .await
            .unwrap();

        let err = engine
            .assign(&incident("b", 1.0, 1.0, Severity::Low), now())
            .await
            .unwrap_err();
        assert_eq!(err, ClusterError::NoCapacity { active: 1, max: 1 });

        // Joining an existing cluster still works at capacity.
        assert!(
            !engine
                .assign(&incident("c", 0.0, 0.001, Severity::Low), now())
                .await
                .unwrap()
                .created
        );
    }

    #[tokio::test]
    async fn locked_cluster_times_out_then_accepts_after_release() {
        let engine = ClusterEngine::new(quick_locks());
        engine
            .assign(&incident("a", 0.0, 0.0, Severity::Low), now())
            .await
            .unwrap();

        let held = engine
            .cluster_slot(ClusterId(1))
            .unwrap()
            .lock_owned()
            .await;
        let err = engine
            .assign(&incident("b", 0.0, 0.001, Severity::Low), now())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ClusterError::LockTimeout {
                cluster_id: ClusterId(1),
                attempts: 2,
            }
        );
        assert!(err.is_transient());
        drop(held);

        let retry = engine
            .assign(&incident("b", 0.0, 0.001, Severity::Low), now())
            .await
            .unwrap();
        assert_eq!(retry.cluster_id, ClusterId(1));
        assert_eq!(retry.hotspot.crime_count, 2);
    }

    #[tokio::test]
    async fn exhausted_reroutes_name_the_cluster_that_moved_away() {
        let config = HotspotConfig {
            lock_retry_attempts: 0,
            lock_wait_ms: 1_000,
            ..HotspotConfig::default()
        };
        let engine = Arc::new(ClusterEngine::new(config.clone()));
        engine
            .assign(&incident("a", 0.0, 0.0, Severity::Low), now())
            .await
            .unwrap();

        let mut held = engine
            .cluster_slot(ClusterId(1))
            .unwrap()
            .lock_owned()
            .await;
        let waiting = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .assign(&incident("b", 0.004, 0.0, Severity::Low), now())
                    .await
                    .map(|a| a.cluster_id)
            })
        };
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        // Pull the center south while "b" waits; it is routed on the old
        // center but finds itself out of range once it gets the lock.
        held.join(incident("c", -0.004, 0.0, Severity::Low), now(), &config);
        drop(held);

        assert_eq!(
            waiting.await.unwrap().unwrap_err(),
            ClusterError::LockTimeout {
                cluster_id: ClusterId(1),
                attempts: 1,
            }
        );
    }

    #[tokio::test]
    async fn assignment_holds_the_cluster_until_released() {
        let engine = ClusterEngine::new(quick_locks());
        let opened = engine
            .assign(&incident("a", 0.0, 0.0, Severity::Low), now())
            .await
            .unwrap();

        assert!(matches!(
            engine
                .assign(&incident("b", 0.0, 0.001, Severity::Low), now())
                .await,
            Err(ClusterError::LockTimeout { .. })
        ));

        let snapshot = opened.release();
        assert_eq!(snapshot.crime_count, 1);
        assert!(
            engine
                .assign(&incident("b", 0.0, 0.001, Severity::Low), now())
                .await
                .is_ok()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reports_at_one_spot_share_a_cluster() {
        let engine = Arc::new(ClusterEngine::new(HotspotConfig::default()));

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    engine
                        .assign(
                            &incident(&format!("i{i:02}"), 51.5072, -0.1276, Severity::Medium),
                            now(),
                        )
                        .await
                        .map(|a| a.created)
                })
            })
            .collect();

        let mut created = 0;
        for task in tasks {
            if task.await.unwrap().unwrap() {
                created += 1;
            }
        }

        assert_eq!(created, 1);
        assert_eq!(engine.active_count(), 1);
        let hotspots = engine.hotspots().await;
        assert_eq!(hotspots.len(), 1);
        assert_eq!(hotspots[0].crime_count, 32);
    }

    #[tokio::test]
    async fn reconcile_evicts_members_left_behind_by_drift() {
        let engine = ClusterEngine::new(HotspotConfig::default());
        for (id, lat) in [
            ("a", 0.0),
            ("b", 0.004),
            ("c", 0.006),
            ("d", 0.0075),
            ("e", 0.0085),
        ] {
            let assignment = engine
                .assign(&incident(id, lat, 0.0, Severity::High), now())
                .await
                .unwrap();
            assert_eq!(assignment.cluster_id, ClusterId(1), "{id} should chain");
        }

        let mut steps = reconcile_all(&engine, now()).await;
        assert_eq!(steps.len(), 1);
        let step = steps.remove(0);
        assert!(!step.retired());
        let evicted: Vec<&str> = step.evicted.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(evicted, vec!["a"]);
        assert_eq!(step.hotspot.crime_count, 4);
        assert!((step.hotspot.location.lat - 0.0065).abs() < 1e-9);
        let left_behind = step.evicted[0].clone();
        drop(step);

        // The evicted incident is now too far from the moved center.
        let reassigned = engine.assign(&left_behind, now()).await.unwrap();
        assert!(reassigned.created);
    }

    #[tokio::test]
    async fn quiet_cluster_is_retired_and_forgotten() {
        let config = HotspotConfig {
            dormancy_floor_score: 0.9,
            ..HotspotConfig::default()
        };
        let engine = ClusterEngine::new(config);
        engine
            .assign(&incident("a", 0.0, 0.0, Severity::Low), now())
            .await
            .unwrap();

        let fresh = reconcile_all(&engine, now()).await;
        assert!(fresh.iter().all(|step| !step.retired()));
        drop(fresh);

        let later = now() + Duration::days(60);
        let steps = reconcile_all(&engine, later).await;
        assert_eq!(steps.len(), 1);
        assert!(steps[0].retired());
        assert!(steps[0].hotspot.dormant);
        drop(steps);

        assert_eq!(engine.active_count(), 0);
        assert!(engine.active_ids().is_empty());
        assert!(engine.hotspots().await.is_empty());
        assert!(
            engine
                .reconcile_cluster(ClusterId(1), later)
                .await
                .unwrap()
                .is_none()
        );

        let next = engine
            .assign(&incident("b", 0.0, 0.0, Severity::Low), later)
            .await
            .unwrap();
        assert!(next.created);
        assert_eq!(next.cluster_id, ClusterId(2));
    }
}
