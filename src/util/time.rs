//! Timestamp and time-zone helpers.

use chrono::{DateTime, Local, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Format a millisecond timestamp as a local `hh:mm:ss` clock string.
pub fn clock_hhmmss(ts_ms: i64) -> String {
    match Utc.timestamp_millis_opt(ts_ms).single() {
        Some(dt) => dt.with_timezone(&Local).format("%H:%M:%S").to_string(),
        None => "??:??:??".to_string(),
    }
}

/// Minute-of-day (0..1440) for `ts_ms` in the given IANA zone.
///
/// Returns `None` when the zone name does not parse.
pub fn minute_of_day_in(zone: &str, ts_ms: i64) -> Option<u16> {
    let tz: Tz = zone.parse().ok()?;
    let dt: DateTime<Tz> = Utc.timestamp_millis_opt(ts_ms).single()?.with_timezone(&tz);
    Some((dt.hour() * 60 + dt.minute()) as u16)
}

/// Floor a millisecond timestamp to the previous whole second.
pub fn floor_to_second(ts_ms: i64) -> i64 {
    ts_ms - ts_ms.rem_euclid(1000)
}
