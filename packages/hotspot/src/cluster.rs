//! A single cluster of nearby incidents.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use crime_watch_crime_models::CrimeType;
use crime_watch_hotspot_models::{ClusterId, GeoPoint, Hotspot, HotspotConfig, Incident};
use crime_watch_spatial::{centroid, haversine_meters, within_radius};

use crate::score;

/// Mutable state of one cluster. Always accessed through its per-cluster
/// lock in [`crate::engine::ClusterEngine`].
#[derive(Debug, Clone)]
pub struct Cluster {
    id: ClusterId,
    center: GeoPoint,
    /// Center at creation or at the last re-partition; drift is measured
    /// from here.
    anchor: GeoPoint,
    radius_meters: u32,
    members: BTreeMap<String, Incident>,
    score: f64,
    dominant_type: Option<CrimeType>,
    last_updated: DateTime<Utc>,
    retired: bool,
}

impl Cluster {
    /// Opens a cluster centered on its first incident.
    #[must_use]
    pub fn new(
        id: ClusterId,
        first: Incident,
        radius_meters: u32,
        now: DateTime<Utc>,
        config: &HotspotConfig,
    ) -> Self {
        let center = first.location;
        let mut cluster = Self {
            id,
            center,
            anchor: center,
            radius_meters,
            members: BTreeMap::new(),
            score: 0.0,
            dominant_type: None,
            last_updated: now,
            retired: false,
        };
        cluster.members.insert(first.id.clone(), first);
        cluster.rescore(now, config);
        cluster
    }

    /// Cluster id.
    #[must_use]
    pub const fn id(&self) -> ClusterId {
        self.id
    }

    /// Current centroid.
    #[must_use]
    pub const fn center(&self) -> GeoPoint {
        self.center
    }

    /// Membership radius in meters.
    #[must_use]
    pub const fn radius_meters(&self) -> u32 {
        self.radius_meters
    }

    /// Current score.
    #[must_use]
    pub const fn score(&self) -> f64 {
        self.score
    }

    /// Number of member incidents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the cluster has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether the cluster has been retired. A retired cluster accepts no
    /// further members.
    #[must_use]
    pub const fn is_retired(&self) -> bool {
        self.retired
    }

    /// Whether `incident_id` is a member.
    #[must_use]
    pub fn contains(&self, incident_id: &str) -> bool {
        self.members.contains_key(incident_id)
    }

    /// Member incidents, ordered by id.
    pub fn members(&self) -> impl Iterator<Item = &Incident> {
        self.members.values()
    }

    /// Whether `point` is within this cluster's radius of its center.
    #[must_use]
    pub fn accepts(&self, point: GeoPoint) -> bool {
        within_radius(self.center, point, f64::from(self.radius_meters))
    }

    /// Distance the centroid has moved away from its anchor.
    #[must_use]
    pub fn drift_meters(&self) -> f64 {
        haversine_meters(self.anchor, self.center)
    }

    /// Adds an incident and recomputes the centroid and score.
    ///
    /// Joining with an id that is already a member replaces the stored
    /// record and leaves membership unchanged.
    pub fn join(&mut self, incident: Incident, now: DateTime<Utc>, config: &HotspotConfig) {
        self.members.insert(incident.id.clone(), incident);
        self.recenter();
        self.rescore(now, config);
    }

    /// Removes every member outside the radius of the current center and
    /// resets the anchor to the recomputed centroid.
    pub fn evict_outside_radius(
        &mut self,
        now: DateTime<Utc>,
        config: &HotspotConfig,
    ) -> Vec<Incident> {
        let radius = f64::from(self.radius_meters);
        let center = self.center;
        let outside: Vec<String> = self
            .members
            .values()
            .filter(|m| !within_radius(center, m.location, radius))
            .map(|m| m.id.clone())
            .collect();

        let evicted: Vec<Incident> = outside
            .iter()
            .filter_map(|id| self.members.remove(id))
            .collect();

        self.recenter();
        self.anchor = self.center;
        self.rescore(now, config);
        evicted
    }

    /// Recomputes the score and dominant type at `now`.
    pub fn rescore(&mut self, now: DateTime<Utc>, config: &HotspotConfig) {
        let result = score::score(self.members.values(), now, config);
        self.score = result.score;
        self.dominant_type = result.dominant_type;
        self.last_updated = now;
    }

    /// Whether the cluster has fallen below the dormancy floor.
    #[must_use]
    pub fn below_dormancy_floor(&self, config: &HotspotConfig) -> bool {
        self.members.is_empty()
            || self.score < config.dormancy_floor_score
            || self.members.len() < config.dormancy_min_members as usize
    }

    /// Marks the cluster retired.
    pub const fn retire(&mut self) {
        self.retired = true;
    }

    /// Persistable view of the cluster.
    #[must_use]
    pub fn to_hotspot(&self) -> Hotspot {
        Hotspot {
            id: self.id,
            location: self.center,
            radius_meters: self.radius_meters,
            crime_count: u32::try_from(self.members.len()).unwrap_or(u32::MAX),
            severity_score: self.score,
            dominant_crime_type: self.dominant_type,
            last_updated: self.last_updated,
            dormant: self.retired,
        }
    }

    fn recenter(&mut self) {
        if let Some(center) = centroid(self.members.values().map(|m| m.location)) {
            self.center = center;
        }
    }
}
