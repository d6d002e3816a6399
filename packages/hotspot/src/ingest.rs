//! Validation and normalization of raw incident submissions.

use chrono::{DateTime, Utc};
use crime_watch_crime_models::{CrimeType, IncidentStatus, Severity};
use crime_watch_hotspot_models::{GeoPoint, Incident, IncidentSubmission};

use crate::ValidationError;

/// Turns a submission into a pending [`Incident`] received at `now`.
///
/// Required fields are checked in the order type, description, location,
/// severity, timestamp, and the first one missing is reported. Text fields
/// are trimmed; a blank value counts as missing.
///
/// # Errors
///
/// Returns a [`ValidationError`] if a required field is missing, the type
/// or severity is unknown, the coordinates are out of range, or the
/// timestamp is later than `now`.
pub fn normalize_submission(
    submission: IncidentSubmission,
    now: DateTime<Utc>,
) -> Result<Incident, ValidationError> {
    let crime_type = non_blank(submission.crime_type.as_deref())
        .ok_or(ValidationError::MissingField("type"))?;
    let description = non_blank(submission.description.as_deref())
        .ok_or(ValidationError::MissingField("description"))?;
    let location = submission
        .location
        .ok_or(ValidationError::MissingField("location"))?;
    let lat = location
        .lat
        .ok_or(ValidationError::MissingField("location.lat"))?;
    let lng = location
        .lng
        .ok_or(ValidationError::MissingField("location.lng"))?;
    let severity = non_blank(submission.severity.as_deref())
        .ok_or(ValidationError::MissingField("severity"))?;
    let timestamp = submission
        .timestamp
        .ok_or(ValidationError::MissingField("timestamp"))?;

    let crime_type = CrimeType::parse(crime_type)
        .map_err(|_| ValidationError::UnknownCrimeType(crime_type.to_string()))?;
    let severity: Severity = severity
        .parse()
        .map_err(|_| ValidationError::UnknownSeverity(severity.to_string()))?;

    let location = GeoPoint::new(lat, lng);
    if !location.is_valid() {
        return Err(ValidationError::CoordinatesOutOfRange { lat, lng });
    }

    if timestamp > now {
        return Err(ValidationError::FutureTimestamp { timestamp, now });
    }

    Ok(Incident {
        id: uuid::Uuid::new_v4().to_string(),
        title: non_blank(submission.title.as_deref()).map(str::to_string),
        description: description.to_string(),
        crime_type,
        severity,
        location,
        timestamp,
        created_at: now,
        status: IncidentStatus::Pending,
        reporter_id: non_blank(submission.reporter_id.as_deref()).map(str::to_string),
    })
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
