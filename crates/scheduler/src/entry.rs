//! Schedule entries, cron parsing, and coordination key formats.

use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use cron::Schedule;

/// A cron spec that could not be parsed.
#[derive(Debug, thiserror::Error)]
#[error("invalid cron spec '{spec}': {reason}")]
pub struct InvalidCron {
    pub(crate) spec: String,
    pub(crate) reason: String,
}

/// Parse a standard 5-field cron spec (`min hour dom month dow`).
///
/// A leading seconds field (6 or 7 fields) and `@hourly`-style shortcuts
/// are also accepted; plain 5-field specs get a zero seconds field
/// prepended so they fire at the top of the minute on every replica.
pub(crate) fn parse_standard(spec: &str) -> Result<Schedule, InvalidCron> {
    let trimmed = spec.trim();
    let invalid = |reason: String| InvalidCron {
        spec: spec.to_owned(),
        reason,
    };

    let normalized = if trimmed.starts_with('@') {
        trimmed.to_owned()
    } else {
        match trimmed.split_whitespace().count() {
            5 => format!("0 {trimmed}"),
            6 | 7 => trimmed.to_owned(),
            n => return Err(invalid(format!("expected 5 fields, found {n}"))),
        }
    };

    Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))
}

/// Truncate to whole seconds so cross-replica comparisons are stable.
pub(crate) fn coarse(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(t.timestamp(), 0).unwrap_or(t)
}

/// Shared next-execution register key.
pub(crate) fn scheduler_key(job_name: &str, cron_spec: &str) -> String {
    format!("scheduler:{job_name}-{}", URL_SAFE.encode(cron_spec))
}

/// Fire mutex key.
pub(crate) fn mutex_key(job_name: &str, cron_spec: &str) -> String {
    format!("handlerMutex:{job_name}-{}", URL_SAFE.encode(cron_spec))
}

/// One scheduled job as this replica sees it.
///
/// `next_execution` is a cache: the shared register holds the canonical
/// value and the tick loop refreshes from it before sorting.
#[derive(Clone)]
pub(crate) struct ScheduleEntry {
    pub(crate) job_name: String,
    pub(crate) cron_spec: String,
    pub(crate) schedule: Schedule,
    pub(crate) next_execution: DateTime<Utc>,
}

impl ScheduleEntry {
    /// The first fire instant strictly after `t`, coarsened to seconds.
    pub(crate) fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&t).next().map(coarse)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn five_field_specs_parse() {
        assert!(parse_standard("0 * * * *").is_ok());
        assert!(parse_standard("*/5 1,2 * * MON-FRI").is_ok());
    }

    #[test]
    fn seconds_field_and_shortcuts_pass_through() {
        assert!(parse_standard("* * * * * *").is_ok());
        assert!(parse_standard("@hourly").is_ok());
    }

    #[test]
    fn wrong_field_counts_are_rejected() {
        assert!(parse_standard("* * *").is_err());
        assert!(parse_standard("not a cron").is_err());
        assert!(parse_standard("").is_err());
    }

    #[test]
    fn five_field_spec_fires_on_the_minute() {
        let schedule = parse_standard("0 * * * *").unwrap();
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 12).unwrap();
        let next = schedule.after(&t).next().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
    }

    #[test]
    fn keys_embed_the_encoded_spec() {
        assert_eq!(
            scheduler_key("hourly", "0 * * * *"),
            format!("scheduler:hourly-{}", URL_SAFE.encode("0 * * * *"))
        );
        assert_eq!(
            mutex_key("hourly", "0 * * * *"),
            format!("handlerMutex:hourly-{}", URL_SAFE.encode("0 * * * *"))
        );
        // Different specs for the same job must not collide.
        assert_ne!(
            scheduler_key("job", "0 * * * *"),
            scheduler_key("job", "5 * * * *")
        );
    }

    #[test]
    fn coarse_drops_subsecond_precision() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 12).unwrap()
            + chrono::Duration::milliseconds(750);
        assert_eq!(coarse(t).timestamp_subsec_millis(), 0);
        assert_eq!(coarse(t).timestamp(), t.timestamp());
    }
}
