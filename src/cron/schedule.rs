//! Next-run computation and error backoff.

use std::str::FromStr;

use chrono::{TimeZone, Utc};
use chrono_tz::Tz;

use crate::cron::types::Schedule;
use crate::error::CronError;
use crate::util::time::floor_to_second;

/// Error backoff table; the last value applies to all further errors.
const BACKOFF_TABLE_MS: [i64; 5] = [30_000, 60_000, 300_000, 900_000, 3_600_000];

/// Backoff for the given error streak. Zero errors means no backoff.
pub fn backoff_ms(consecutive_errors: u32) -> i64 {
    if consecutive_errors == 0 {
        return 0;
    }
    let index = (consecutive_errors as usize - 1).min(BACKOFF_TABLE_MS.len() - 1);
    BACKOFF_TABLE_MS[index]
}

/// Accept classic five-field cron expressions by prepending a seconds
/// column; the parser itself wants six or seven fields.
pub fn normalize_cron_expr(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// The natural next run for a schedule.
///
/// - `at`: the fixed instant while the job has never completed, `None` after.
/// - `every` without anchor: one interval past the last completion (or past
///   now when the job has never run).
/// - `every` with anchor: the next grid point `anchor + k*every` at or after
///   now.
/// - `cron`: the parser's next occurrence strictly after now floored to the
///   previous whole second, in the configured zone.
pub fn next_run_at(
    schedule: &Schedule,
    last_end_ms: Option<i64>,
    now_ms: i64,
) -> Result<Option<i64>, CronError> {
    match schedule {
        Schedule::At { at } => {
            if last_end_ms.is_some() {
                Ok(None)
            } else {
                Ok(Some(at.timestamp_millis()))
            }
        }
        Schedule::Every {
            every_ms,
            anchor_ms,
        } => {
            if *every_ms <= 0 {
                return Err(CronError::InvalidSchedule {
                    reason: format!("everyMs must be positive, got {every_ms}"),
                });
            }
            match anchor_ms {
                Some(anchor) => {
                    if now_ms <= *anchor {
                        return Ok(Some(*anchor));
                    }
                    let diff = now_ms - anchor;
                    let intervals = (diff + *every_ms - 1) / *every_ms;
                    Ok(Some(anchor + intervals * every_ms))
                }
                None => Ok(Some(last_end_ms.unwrap_or(now_ms) + every_ms)),
            }
        }
        Schedule::Cron { expr, tz } => next_cron_occurrence(expr, tz.as_deref(), now_ms),
    }
}

/// Next occurrence of a cron expression strictly after `now_ms` floored to
/// the previous whole second, in the given IANA zone (UTC default).
pub fn next_cron_occurrence(
    expr: &str,
    tz: Option<&str>,
    now_ms: i64,
) -> Result<Option<i64>, CronError> {
    let normalized = normalize_cron_expr(expr);
    let schedule =
        cron::Schedule::from_str(&normalized).map_err(|e| CronError::InvalidSchedule {
            reason: format!("invalid cron expression {expr:?}: {e}"),
        })?;

    let tz: Tz = match tz {
        Some(name) => name.parse().map_err(|_| CronError::InvalidSchedule {
            reason: format!("unknown time zone {name:?}"),
        })?,
        None => chrono_tz::UTC,
    };

    let floored = floor_to_second(now_ms);
    let Some(from) = Utc.timestamp_millis_opt(floored).single() else {
        return Err(CronError::InvalidSchedule {
            reason: format!("timestamp {floored} out of range"),
        });
    };
    Ok(schedule
        .after(&from.with_timezone(&tz))
        .next()
        .map(|dt| dt.timestamp_millis()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn ms(rfc3339: &str) -> i64 {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .timestamp_millis()
    }

    #[test]
    fn backoff_table_progression() {
        assert_eq!(backoff_ms(0), 0);
        assert_eq!(backoff_ms(1), 30_000);
        assert_eq!(backoff_ms(2), 60_000);
        assert_eq!(backoff_ms(3), 300_000);
        assert_eq!(backoff_ms(4), 900_000);
        assert_eq!(backoff_ms(5), 3_600_000);
        // The last value applies to every further error.
        assert_eq!(backoff_ms(6), 3_600_000);
        assert_eq!(backoff_ms(100), 3_600_000);
    }

    #[test]
    fn five_field_expressions_gain_a_seconds_column() {
        assert_eq!(normalize_cron_expr("0 9 * * MON-FRI"), "0 0 9 * * MON-FRI");
        assert_eq!(normalize_cron_expr("0 0 9 * * *"), "0 0 9 * * *");
    }

    #[test]
    fn at_schedule_fires_once() {
        let at = Schedule::At {
            at: DateTime::parse_from_rfc3339("2030-01-01T00:00:05Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        assert_eq!(
            next_run_at(&at, None, ms("2029-12-31T00:00:00Z")).unwrap(),
            Some(ms("2030-01-01T00:00:05Z"))
        );
        // Already completed: no further runs.
        assert_eq!(
            next_run_at(&at, Some(ms("2030-01-01T00:00:06Z")), ms("2030-01-01T01:00:00Z"))
                .unwrap(),
            None
        );
    }

    #[test]
    fn every_without_anchor_follows_last_completion() {
        let every = Schedule::Every {
            every_ms: 60_000,
            anchor_ms: None,
        };
        assert_eq!(
            next_run_at(&every, Some(1_000_000), 1_010_000).unwrap(),
            Some(1_060_000)
        );
        // Never ran: one interval from now.
        assert_eq!(
            next_run_at(&every, None, 2_000_000).unwrap(),
            Some(2_060_000)
        );
    }

    #[test]
    fn every_with_anchor_snaps_to_the_grid() {
        let every = Schedule::Every {
            every_ms: 60_000,
            anchor_ms: Some(1_000_000),
        };
        // Mid-interval: next grid point.
        assert_eq!(
            next_run_at(&every, None, 1_090_000).unwrap(),
            Some(1_120_000)
        );
        // Exactly on a grid point stays on it.
        assert_eq!(
            next_run_at(&every, None, 1_120_000).unwrap(),
            Some(1_120_000)
        );
        // Before the anchor: the anchor itself.
        assert_eq!(next_run_at(&every, None, 500_000).unwrap(), Some(1_000_000));
    }

    #[test]
    fn invalid_interval_is_rejected() {
        let bad = Schedule::Every {
            every_ms: 0,
            anchor_ms: None,
        };
        assert!(next_run_at(&bad, None, 0).is_err());
    }

    #[test]
    fn weekday_morning_in_new_york() {
        // 2025-01-03 is a Friday; 13:59:59.500Z is 08:59:59.500 local.
        // The sub-second part must not push the result past 09:00.
        let next = next_cron_occurrence(
            "0 9 * * MON-FRI",
            Some("America/New_York"),
            ms("2025-01-03T13:59:59.500Z"),
        )
        .unwrap();
        assert_eq!(next, Some(ms("2025-01-03T14:00:00Z")));
    }

    #[test]
    fn cron_occurrence_is_strictly_after() {
        // Exactly at 09:00: the next fire is Monday (Jan 6), not now.
        let next = next_cron_occurrence(
            "0 9 * * MON-FRI",
            Some("America/New_York"),
            ms("2025-01-03T14:00:00Z"),
        )
        .unwrap();
        assert_eq!(next, Some(ms("2025-01-06T14:00:00Z")));
    }

    #[test]
    fn bad_expression_and_zone_are_errors() {
        assert!(next_cron_occurrence("not a cron", None, 0).is_err());
        assert!(next_cron_occurrence("0 9 * * *", Some("Mars/Olympus"), 0).is_err());
    }
}
