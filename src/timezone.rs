//! Conversion of stored UTC instants into a user's display timezone.
//!
//! Timezone names come from the `users.timezone` column, one per row, so the
//! zone is always an explicit argument rather than process-wide state.
use chrono::{DateTime, Utc};
use chrono_tz::Tz;

/// Resolve an IANA timezone name, falling back to UTC for unknown names.
pub fn resolve(name: &str) -> Tz {
    match name.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            tracing::debug!(timezone = %name, "Unknown timezone, using UTC");
            Tz::UTC
        }
    }
}

/// Express `instant` in the timezone called `name`.
pub fn convert(name: &str, instant: DateTime<Utc>) -> DateTime<Tz> {
    instant.with_timezone(&resolve(name))
}

/// Express a stored unix timestamp (seconds, UTC) in the timezone `name`.
///
/// Out-of-range timestamps map to the unix epoch.
pub fn from_unix(name: &str, secs: i64) -> DateTime<Tz> {
    let instant = DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_default();
    convert(name, instant)
}
