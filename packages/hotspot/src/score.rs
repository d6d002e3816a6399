//! Recency-weighted severity scoring.
//!
//! Each member incident contributes
//! `severity weight x 0.5^(age / half_life)`, with the decay factor floored
//! at the configured epsilon so that old incidents fade out smoothly
//! instead of dropping to zero. A cluster's score is the sum of its
//! members' contributions, capped at the configured maximum.
//!
//! Everything here is a pure function of the member list and `now`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use crime_watch_crime_models::CrimeType;
use crime_watch_hotspot_models::{HotspotConfig, Incident};

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Result of scoring a cluster.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterScore {
    /// Capped sum of member weights.
    pub score: f64,
    /// Crime type with the highest summed weight, `None` for no members.
    pub dominant_type: Option<CrimeType>,
}

/// Age of an event in fractional days. Events timestamped after `now`
/// count as brand new.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn age_days(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let millis = (now - timestamp).num_milliseconds().max(0);
    millis as f64 / MILLIS_PER_DAY
}

/// Exponential decay factor for an event `age_days` old.
#[must_use]
pub fn recency_decay(age_days: f64, half_life_days: f64, epsilon: f64) -> f64 {
    0.5_f64.powf(age_days.max(0.0) / half_life_days).max(epsilon)
}

/// Contribution of one incident to its cluster's score at `now`.
#[must_use]
pub fn incident_weight(incident: &Incident, now: DateTime<Utc>, config: &HotspotConfig) -> f64 {
    let decay = recency_decay(
        age_days(incident.timestamp, now),
        config.half_life_days,
        config.decay_epsilon,
    );
    incident.severity.weight() * decay
}

/// Scores a set of member incidents.
///
/// Ties on the dominant type go to the type reported most recently; a
/// further tie goes to the type declared first in [`CrimeType`].
#[must_use]
#[allow(clippy::float_cmp)]
pub fn score<'a, I>(members: I, now: DateTime<Utc>, config: &HotspotConfig) -> ClusterScore
where
    I: IntoIterator<Item = &'a Incident>,
{
    let mut total = 0.0;
    let mut by_type: BTreeMap<CrimeType, (f64, DateTime<Utc>)> = BTreeMap::new();

    for incident in members {
        let weight = incident_weight(incident, now, config);
        total += weight;

        by_type
            .entry(incident.crime_type)
            .and_modify(|(sum, latest)| {
                *sum += weight;
                if incident.timestamp > *latest {
                    *latest = incident.timestamp;
                }
            })
            .or_insert((weight, incident.timestamp));
    }

    let mut dominant: Option<(CrimeType, f64, DateTime<Utc>)> = None;
    for (crime_type, (sum, latest)) in by_type {
        let better = match dominant {
            None => true,
            Some((_, best_sum, best_latest)) => {
                sum > best_sum || (sum == best_sum && latest > best_latest)
            }
        };
        if better {
            dominant = Some((crime_type, sum, latest));
        }
    }

    ClusterScore {
        score: total.min(config.score_cap),
        dominant_type: dominant.map(|(crime_type, _, _)| crime_type),
    }
}
