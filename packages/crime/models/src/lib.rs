#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Crime type taxonomy, severity levels, and incident status definitions.
//!
//! This crate defines the fixed crime type set that community members pick
//! from when reporting an incident, along with the ordered severity scale
//! used by hotspot scoring and the moderation lifecycle of a report.

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, EnumString};

/// Severity reported for an incident, ordered from least to most severe.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Severity {
    /// Nuisance-level incidents.
    Low = 1,
    /// Incidents with some risk to property or people.
    Medium = 2,
    /// Incidents with clear risk to people.
    High = 3,
    /// Incidents involving serious harm or weapons.
    Critical = 4,
}

impl Severity {
    /// Returns the numeric value of this severity level.
    #[must_use]
    pub const fn value(self) -> u8 {
        self as u8
    }

    /// Creates a severity level from a numeric value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not in the range 1-4.
    pub const fn from_value(value: u8) -> Result<Self, InvalidSeverityError> {
        match value {
            1 => Ok(Self::Low),
            2 => Ok(Self::Medium),
            3 => Ok(Self::High),
            4 => Ok(Self::Critical),
            _ => Err(InvalidSeverityError { value }),
        }
    }

    /// Scoring weight of a single incident at this severity.
    ///
    /// Each level doubles the weight of the one below it.
    #[must_use]
    pub const fn weight(self) -> f64 {
        match self {
            Self::Low => 1.0,
            Self::Medium => 2.0,
            Self::High => 4.0,
            Self::Critical => 8.0,
        }
    }

    /// Returns all variants of this enum, least severe first.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Low, Self::Medium, Self::High, Self::Critical]
    }
}

/// Error returned when attempting to create a [`Severity`] from an invalid
/// numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidSeverityError {
    /// The invalid severity value that was provided.
    pub value: u8,
}

impl std::fmt::Display for InvalidSeverityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid severity value {}: expected 1-4", self.value)
    }
}

impl std::error::Error for InvalidSeverityError {}

/// The fixed set of crime types a report can be filed under.
///
/// Serialized with the human-readable labels shown to reporters (e.g.
/// `"Vehicle Crime"`). [`CrimeType::parse`] also accepts `snake_case` ids.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, EnumString, AsRefStr,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum CrimeType {
    /// Taking property without force (pickpocketing, shoplifting).
    Theft,
    /// Unlawful entry into a building.
    Burglary,
    /// Taking property by force or threat.
    Robbery,
    /// Physical attack on a person.
    Assault,
    /// Damage to property.
    Vandalism,
    /// Theft of or from a vehicle, hijacking.
    #[serde(rename = "Vehicle Crime")]
    VehicleCrime,
    /// Dealing or use of illegal drugs.
    #[serde(rename = "Drug Activity")]
    DrugActivity,
    /// Scams and financial deception.
    Fraud,
    /// Intimidation, stalking, or verbal abuse.
    Harassment,
    /// Behaviour that is not yet a crime but worth reporting.
    #[serde(rename = "Suspicious Activity")]
    SuspiciousActivity,
    /// Anything that does not fit the other types.
    Other,
}

impl CrimeType {
    /// Human-readable label for this crime type.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Theft => "Theft",
            Self::Burglary => "Burglary",
            Self::Robbery => "Robbery",
            Self::Assault => "Assault",
            Self::Vandalism => "Vandalism",
            Self::VehicleCrime => "Vehicle Crime",
            Self::DrugActivity => "Drug Activity",
            Self::Fraud => "Fraud",
            Self::Harassment => "Harassment",
            Self::SuspiciousActivity => "Suspicious Activity",
            Self::Other => "Other",
        }
    }

    /// Parses a crime type from either its label (`"Vehicle Crime"`) or
    /// its id (`"vehicle_crime"`), ignoring case.
    ///
    /// # Errors
    ///
    /// Returns [`strum::ParseError`] if the input names no known crime type.
    pub fn parse(input: &str) -> Result<Self, strum::ParseError> {
        let normalized: String = input
            .trim()
            .chars()
            .map(|c| if c == ' ' || c == '-' { '_' } else { c })
            .collect();
        normalized.parse()
    }

    /// Returns all variants of this enum in declaration order.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Theft,
            Self::Burglary,
            Self::Robbery,
            Self::Assault,
            Self::Vandalism,
            Self::VehicleCrime,
            Self::DrugActivity,
            Self::Fraud,
            Self::Harassment,
            Self::SuspiciousActivity,
            Self::Other,
        ]
    }
}

impl std::fmt::Display for CrimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Moderation lifecycle of a report.
///
/// Only the moderation workflow moves an incident between states; the
/// aggregation engine reads but never writes this field.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum IncidentStatus {
    /// Freshly submitted, awaiting review.
    #[default]
    Pending,
    /// Confirmed by a moderator.
    Verified,
    /// Forwarded to the police.
    Reported,
    /// Closed.
    Resolved,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_from_value_roundtrip() {
        for sev in Severity::all() {
            assert_eq!(Severity::from_value(sev.value()).unwrap(), *sev);
        }
        assert!(Severity::from_value(0).is_err());
        assert!(Severity::from_value(5).is_err());
    }

    #[test]
    fn severity_weights_double_per_level() {
        let weights: Vec<f64> = Severity::all().iter().map(|s| s.weight()).collect();
        assert_eq!(weights, vec![1.0, 2.0, 4.0, 8.0]);
    }

    #[test]
    fn severity_is_ordered() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn severity_parses_case_insensitively() {
        assert_eq!("HIGH".parse::<Severity>().unwrap(), Severity::High);
        assert_eq!("critical".parse::<Severity>().unwrap(), Severity::Critical);
        assert!("severe".parse::<Severity>().is_err());
    }

    #[test]
    fn crime_type_parses_labels_and_ids() {
        assert_eq!(CrimeType::parse("Theft").unwrap(), CrimeType::Theft);
        assert_eq!(
            CrimeType::parse("Vehicle Crime").unwrap(),
            CrimeType::VehicleCrime
        );
        assert_eq!(
            CrimeType::parse("suspicious_activity").unwrap(),
            CrimeType::SuspiciousActivity
        );
        assert_eq!(
            CrimeType::parse(" drug-activity ").unwrap(),
            CrimeType::DrugActivity
        );
        assert!(CrimeType::parse("Piracy").is_err());
    }

    #[test]
    fn crime_type_labels_parse_back() {
        for ty in CrimeType::all() {
            assert_eq!(CrimeType::parse(ty.label()).unwrap(), *ty);
        }
    }

    #[test]
    fn crime_type_serializes_as_label() {
        let json = serde_json::to_string(&CrimeType::VehicleCrime).unwrap();
        assert_eq!(json, "\"Vehicle Crime\"");
    }

    #[test]
    fn status_defaults_to_pending() {
        assert_eq!(IncidentStatus::default(), IncidentStatus::Pending);
        assert_eq!(IncidentStatus::Verified.to_string(), "verified");
    }
}
