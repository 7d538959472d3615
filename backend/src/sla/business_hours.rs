//! Business-hours arithmetic at one-hour granularity.
//!
//! Coarse but deterministic: whole elapsed hours are walked one by one and
//! counted when their starting instant falls on an allowed weekday inside
//! the allowed hour window. `days_of_week_mask` bit 0 is Monday.

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::config::BusinessHoursConfig;

fn hour_counts(at: DateTime<Utc>, config: &BusinessHoursConfig) -> bool {
    let weekday_bit = 1u8 << at.weekday().num_days_from_monday();
    if config.days_of_week_mask & weekday_bit == 0 {
        return false;
    }
    let hour = at.hour() as u8;
    hour >= config.start_hour && hour < config.end_hour
}

/// Whole business hours elapsed between `start` and `end`.
pub fn business_hours_between(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    config: &BusinessHoursConfig,
) -> f64 {
    if end <= start {
        return 0.0;
    }

    let mut counted = 0u64;
    let mut cursor = start;
    while cursor + chrono::Duration::hours(1) <= end {
        if hour_counts(cursor, config) {
            counted += 1;
        }
        cursor += chrono::Duration::hours(1);
    }
    counted as f64
}

/// Plain wall-clock hours between two instants.
pub fn calendar_hours_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    if end <= start {
        return 0.0;
    }
    (end - start).num_seconds() as f64 / 3600.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn weekdays_nine_to_five() -> BusinessHoursConfig {
        BusinessHoursConfig {
            start_hour: 9,
            end_hour: 17,
            days_of_week_mask: 0x1f,
        }
    }

    #[test]
    fn test_always_on_counts_whole_hours() {
        let config = BusinessHoursConfig::always_on();
        let start = Utc.with_ymd_and_hms(2025, 6, 2, 8, 0, 0).unwrap();
        assert_eq!(business_hours_between(start, start + chrono::Duration::hours(5), &config), 5.0);
        // Partial trailing hour does not count.
        assert_eq!(
            business_hours_between(start, start + chrono::Duration::minutes(90), &config),
            1.0
        );
    }

    #[test]
    fn test_window_excludes_night_hours() {
        let config = weekdays_nine_to_five();
        // Monday 2025-06-02, 08:00 to 20:00: only 09:00..17:00 counts.
        let start = Utc.with_ymd_and_hms(2025, 6, 2, 8, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 6, 2, 20, 0, 0).unwrap();
        assert_eq!(business_hours_between(start, end, &config), 8.0);
    }

    #[test]
    fn test_weekend_excluded() {
        let config = weekdays_nine_to_five();
        // Saturday 2025-06-07 and Sunday 2025-06-08 contribute nothing.
        let start = Utc.with_ymd_and_hms(2025, 6, 7, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 6, 9, 0, 0, 0).unwrap();
        assert_eq!(business_hours_between(start, end, &config), 0.0);

        // Friday 16:00 through Monday 10:00: one Friday hour, one Monday hour.
        let start = Utc.with_ymd_and_hms(2025, 6, 6, 16, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 6, 9, 10, 0, 0).unwrap();
        assert_eq!(business_hours_between(start, end, &config), 2.0);
    }

    #[test]
    fn test_reversed_range_is_zero() {
        let config = BusinessHoursConfig::always_on();
        let start = Utc.with_ymd_and_hms(2025, 6, 2, 8, 0, 0).unwrap();
        assert_eq!(business_hours_between(start, start - chrono::Duration::hours(2), &config), 0.0);
        assert_eq!(calendar_hours_between(start, start - chrono::Duration::hours(2)), 0.0);
    }

    #[test]
    fn test_calendar_hours() {
        let start = Utc.with_ymd_and_hms(2025, 6, 2, 8, 0, 0).unwrap();
        let end = start + chrono::Duration::minutes(150);
        assert!((calendar_hours_between(start, end) - 2.5).abs() < 1e-9);
    }
}
