#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Spatial primitives for hotspot clustering.
//!
//! Provides great-circle distances, unweighted centroids, and an in-memory
//! R-tree of cluster centers that answers "which clusters are within `r`
//! meters of this point" without scanning every cluster.

use std::collections::BTreeMap;

use crime_watch_hotspot_models::{ClusterId, GeoPoint};
use geo::{Centroid, Distance, Haversine, MultiPoint, Point};
use rstar::{AABB, RTree, RTreeObject};

/// Mean earth radius in meters, as used by the haversine metric.
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// Slack applied to radius comparisons so that a point computed to lie
/// exactly on the boundary is not excluded by floating-point rounding.
pub const BOUNDARY_TOLERANCE_METERS: f64 = 1e-6;

/// Meters per degree of latitude on the mean-radius sphere.
const METERS_PER_DEGREE: f64 = EARTH_RADIUS_METERS * std::f64::consts::PI / 180.0;

/// Great-circle distance between two points in meters.
#[must_use]
pub fn haversine_meters(a: GeoPoint, b: GeoPoint) -> f64 {
    Haversine.distance(to_point(a), to_point(b))
}

/// Whether `point` lies within `radius_meters` of `center`, boundary
/// included.
#[must_use]
pub fn within_radius(center: GeoPoint, point: GeoPoint, radius_meters: f64) -> bool {
    haversine_meters(center, point) <= radius_meters + BOUNDARY_TOLERANCE_METERS
}

/// Unweighted mean of the given locations, `None` when there are none.
///
/// Longitudes are unwrapped relative to the first point before averaging,
/// so points on both sides of the antimeridian average to a point next to
/// them rather than to one on the far side of the globe.
#[must_use]
pub fn centroid<I>(points: I) -> Option<GeoPoint>
where
    I: IntoIterator<Item = GeoPoint>,
{
    let mut points = points.into_iter().peekable();
    let reference = points.peek()?.lng;

    let multi: MultiPoint<f64> = points
        .map(|p| {
            let offset = (p.lng - reference + 180.0).rem_euclid(360.0) - 180.0;
            to_point(GeoPoint::new(p.lat, reference + offset))
        })
        .collect();
    multi.centroid().map(|c| {
        let mean = from_point(c);
        GeoPoint::new(mean.lat, normalize_lng(mean.lng))
    })
}

/// Wraps a longitude into `[-180, 180)`.
fn normalize_lng(lng: f64) -> f64 {
    if (-180.0..180.0).contains(&lng) {
        lng
    } else {
        (lng + 180.0).rem_euclid(360.0) - 180.0
    }
}

fn to_point(p: GeoPoint) -> Point<f64> {
    Point::new(p.lng, p.lat)
}

fn from_point(p: Point<f64>) -> GeoPoint {
    GeoPoint::new(p.y(), p.x())
}

/// A cluster center stored in the R-tree.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CenterEntry {
    id: ClusterId,
    center: GeoPoint,
}

impl RTreeObject for CenterEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.center.lng, self.center.lat])
    }
}

/// Spatial index of active cluster centers.
///
/// Lookups use a degree-space bounding box to find candidates and then
/// filter them by exact haversine distance.
#[derive(Default)]
pub struct CenterIndex {
    tree: RTree<CenterEntry>,
    centers: BTreeMap<ClusterId, GeoPoint>,
}

impl CenterIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed clusters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.centers.len()
    }

    /// Whether the index holds no clusters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.centers.is_empty()
    }

    /// Current center of a cluster, if indexed.
    #[must_use]
    pub fn center(&self, id: ClusterId) -> Option<GeoPoint> {
        self.centers.get(&id).copied()
    }

    /// Ids of all indexed clusters in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = ClusterId> + '_ {
        self.centers.keys().copied()
    }

    /// Inserts a cluster or moves it to a new center.
    pub fn upsert(&mut self, id: ClusterId, center: GeoPoint) {
        if let Some(old) = self.centers.insert(id, center) {
            self.tree.remove(&CenterEntry { id, center: old });
        }
        self.tree.insert(CenterEntry { id, center });
    }

    /// Removes a cluster, returning its last center.
    pub fn remove(&mut self, id: ClusterId) -> Option<GeoPoint> {
        let center = self.centers.remove(&id)?;
        if self.tree.remove(&CenterEntry { id, center }).is_none() {
            log::warn!("Cluster {id} missing from R-tree while removing");
        }
        Some(center)
    }

    /// All clusters whose center is within `radius_meters` of `point`,
    /// ordered by distance and then by id.
    #[must_use]
    pub fn within(&self, point: GeoPoint, radius_meters: f64) -> Vec<(ClusterId, f64)> {
        let envelope = search_envelope(point, radius_meters);

        let mut hits: Vec<(ClusterId, f64)> = self
            .tree
            .locate_in_envelope(&envelope)
            .filter_map(|entry| {
                let distance = haversine_meters(entry.center, point);
                (distance <= radius_meters + BOUNDARY_TOLERANCE_METERS)
                    .then_some((entry.id, distance))
            })
            .collect();

        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        hits
    }

    /// The nearest cluster within `radius_meters` of `point`. Ties on
    /// distance go to the lowest id.
    #[must_use]
    pub fn nearest_within(&self, point: GeoPoint, radius_meters: f64) -> Option<(ClusterId, f64)> {
        self.within(point, radius_meters).into_iter().next()
    }
}

/// Degree-space box guaranteed to contain every point within
/// `radius_meters` of `point`.
///
/// Falls back to the full longitude band near the poles and when the box
/// would wrap the antimeridian.
fn search_envelope(point: GeoPoint, radius_meters: f64) -> AABB<[f64; 2]> {
    // Pad by 1% so rounding never drops a candidate on the edge.
    let lat_delta = radius_meters * 1.01 / METERS_PER_DEGREE;
    let min_lat = (point.lat - lat_delta).max(-90.0);
    let max_lat = (point.lat + lat_delta).min(90.0);

    let widest_lat = min_lat.abs().max(max_lat.abs());
    let cos_lat = widest_lat.to_radians().cos();

    let full_band = AABB::from_corners([-180.0, min_lat], [180.0, max_lat]);
    if cos_lat < 1e-6 {
        return full_band;
    }

    let lng_delta = lat_delta / cos_lat;
    let min_lng = point.lng - lng_delta;
    let max_lng = point.lng + lng_delta;
    if lng_delta >= 180.0 || min_lng < -180.0 || max_lng > 180.0 {
        return full_band;
    }

    AABB::from_corners([min_lng, min_lat], [max_lng, max_lat])
}
