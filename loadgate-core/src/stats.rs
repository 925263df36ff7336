use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Hourly usage row, unique on `(group_id, time)`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GroupHourlyStat {
    pub group_id: i64,
    pub time: DateTime<Utc>,
    pub success_count: i64,
    pub failure_count: i64,
}

/// Monthly usage row, unique on `(group_id, month)`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GroupMonthlyStat {
    pub group_id: i64,
    pub month: DateTime<Utc>,
    pub request_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
}

/// Truncate to the containing hour.
pub fn hour_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(ts.year(), ts.month(), ts.day(), ts.hour(), 0, 0)
        .single()
        .expect("hour truncation is always a valid instant")
}

/// Truncate to the first instant of the containing month.
pub fn month_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(ts.year(), ts.month(), 1, 0, 0, 0)
        .single()
        .expect("month truncation is always a valid instant")
}

/// Start of the next hour — the hourly quota's reset instant.
pub fn next_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    hour_bucket(ts) + Duration::hours(1)
}

/// First instant of the next month — the monthly quota's reset instant.
pub fn next_month(ts: DateTime<Utc>) -> DateTime<Utc> {
    let bucket = month_bucket(ts);
    let (year, month) = if bucket.month() == 12 {
        (bucket.year() + 1, 1)
    } else {
        (bucket.year(), bucket.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .expect("first of month is always a valid instant")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_hour_bucket() {
        assert_eq!(
            hour_bucket(ts("2026-03-05T17:42:31Z")),
            ts("2026-03-05T17:00:00Z")
        );
        assert_eq!(
            hour_bucket(ts("2026-03-05T17:00:00Z")),
            ts("2026-03-05T17:00:00Z")
        );
    }

    #[test]
    fn test_month_bucket() {
        assert_eq!(
            month_bucket(ts("2026-03-05T17:42:31Z")),
            ts("2026-03-01T00:00:00Z")
        );
    }

    #[test]
    fn test_next_hour_crosses_midnight() {
        assert_eq!(
            next_hour(ts("2026-03-05T23:59:59Z")),
            ts("2026-03-06T00:00:00Z")
        );
    }

    #[test]
    fn test_next_month_crosses_year() {
        assert_eq!(
            next_month(ts("2026-12-31T23:00:00Z")),
            ts("2027-01-01T00:00:00Z")
        );
        assert_eq!(
            next_month(ts("2026-02-03T00:00:00Z")),
            ts("2026-03-01T00:00:00Z")
        );
    }
}
