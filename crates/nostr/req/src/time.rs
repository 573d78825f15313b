//! Human-friendly timestamps and durations for `--since`, `--until` and
//! `--paginate-interval`.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TimeError {
    #[error("empty timestamp")]
    Empty,

    #[error("unrecognized time '{0}'")]
    Unrecognized(String),

    #[error("'{0}' is before 1970")]
    BeforeEpoch(String),

    #[error("invalid duration '{0}'")]
    InvalidDuration(String),
}

/// Parse a timestamp: unix seconds, `now`, `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS`,
/// RFC 3339, or a span in the past such as `2h`, `30 minutes ago` or `3 days ago`.
pub fn parse_timestamp(input: &str) -> Result<u64, TimeError> {
    parse_timestamp_at(input, Utc::now())
}

pub fn parse_timestamp_at(input: &str, now: DateTime<Utc>) -> Result<u64, TimeError> {
    let value = input.trim();
    if value.is_empty() {
        return Err(TimeError::Empty);
    }
    if let Ok(seconds) = value.parse::<u64>() {
        return Ok(seconds);
    }
    if value.eq_ignore_ascii_case("now") {
        return to_unix(now, input);
    }
    if let Ok(datetime) = DateTime::parse_from_rfc3339(value) {
        return to_unix(datetime.with_timezone(&Utc), input);
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return to_unix(naive.and_utc(), input);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return to_unix(midnight.and_utc(), input);
        }
    }

    let span = value.strip_suffix("ago").map(str::trim_end).unwrap_or(value);
    let seconds = parse_span(span).ok_or_else(|| TimeError::Unrecognized(input.to_string()))?;
    let past = now.timestamp().saturating_sub(seconds as i64);
    u64::try_from(past).map_err(|_| TimeError::BeforeEpoch(input.to_string()))
}

/// Parse a duration: plain seconds, or a number with a unit (`500ms`, `10s`, `2m`, `1h`).
pub fn parse_duration(input: &str) -> Result<Duration, TimeError> {
    let value = input.trim();
    if let Some(millis) = value.strip_suffix("ms") {
        return millis
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| TimeError::InvalidDuration(input.to_string()));
    }
    if let Ok(seconds) = value.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }
    parse_span(value)
        .map(Duration::from_secs)
        .ok_or_else(|| TimeError::InvalidDuration(input.to_string()))
}

fn to_unix(datetime: DateTime<Utc>, input: &str) -> Result<u64, TimeError> {
    u64::try_from(datetime.timestamp()).map_err(|_| TimeError::BeforeEpoch(input.to_string()))
}

/// `<n><unit>` or `<n> <unit>`, in seconds.
fn parse_span(span: &str) -> Option<u64> {
    let span = span.trim();
    let split = span.find(|c: char| !c.is_ascii_digit())?;
    let (number, unit) = span.split_at(split);
    let number: u64 = number.parse().ok()?;
    let unit_seconds = match unit.trim().to_ascii_lowercase().as_str() {
        "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "m" | "min" | "mins" | "minute" | "minutes" => 60,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600,
        "d" | "day" | "days" => 86_400,
        "w" | "week" | "weeks" => 604_800,
        _ => return None,
    };
    number.checked_mul(unit_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_unix_seconds_and_now() {
        let now = fixed_now();
        assert_eq!(parse_timestamp_at("1700000000", now).unwrap(), 1_700_000_000);
        assert_eq!(parse_timestamp_at("now", now).unwrap(), now.timestamp() as u64);
    }

    #[test]
    fn test_dates() {
        let now = fixed_now();
        assert_eq!(parse_timestamp_at("2024-01-01", now).unwrap(), 1_704_067_200);
        assert_eq!(
            parse_timestamp_at("2024-01-01T00:00:10Z", now).unwrap(),
            1_704_067_210
        );
        assert_eq!(
            parse_timestamp_at("2024-01-01 01:00:00", now).unwrap(),
            1_704_070_800
        );
    }

    #[test]
    fn test_relative_spans() {
        let now = fixed_now();
        let base = now.timestamp() as u64;
        assert_eq!(parse_timestamp_at("2h", now).unwrap(), base - 7_200);
        assert_eq!(parse_timestamp_at("3 days ago", now).unwrap(), base - 259_200);
        assert_eq!(parse_timestamp_at("30 minutes ago", now).unwrap(), base - 1_800);
        assert_eq!(parse_timestamp_at("1w", now).unwrap(), base - 604_800);
    }

    #[test]
    fn test_rejects_garbage() {
        let now = fixed_now();
        assert_eq!(parse_timestamp_at("", now), Err(TimeError::Empty));
        assert!(parse_timestamp_at("yesterday-ish", now).is_err());
        assert!(parse_timestamp_at("5 fortnights ago", now).is_err());
    }

    #[test]
    fn test_durations() {
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("15").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3_600));
        assert!(parse_duration("fast").is_err());
    }
}
