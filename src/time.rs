//! Arithmetic on resolution boundaries.
//!
//! All timestamps are UTC. A candle's `started_at` is always a multiple of its
//! resolution since the unix epoch, so "normalizing" means rounding down to such
//! a multiple. The `*_at` variants take the current time explicitly; the others
//! read the wall clock.

use chrono::{DateTime, Duration, Utc};

use crate::{Candle, Resolution};

/// Rounds `date` down to the nearest resolution boundary.
pub fn normalize(date: DateTime<Utc>, resolution: Resolution) -> DateTime<Utc> {
    let seconds = date.timestamp();
    let normalized = seconds - seconds.rem_euclid(resolution.seconds());
    DateTime::from_timestamp(normalized, 0).unwrap_or(date)
}

/// The start of the bucket that is currently being formed.
pub fn normalized_now(resolution: Resolution) -> DateTime<Utc> {
    normalize(Utc::now(), resolution)
}

/// `started_at` of the most recently finished bucket.
pub fn valid_up_to(resolution: Resolution) -> DateTime<Utc> {
    valid_up_to_at(resolution, Utc::now())
}

pub fn valid_up_to_at(resolution: Resolution, now: DateTime<Utc>) -> DateTime<Utc> {
    normalize(now, resolution) - resolution.duration()
}

/// The moment the bucket currently being formed finishes.
pub fn next_tick(resolution: Resolution) -> DateTime<Utc> {
    next_tick_at(resolution, Utc::now())
}

pub fn next_tick_at(resolution: Resolution, now: DateTime<Utc>) -> DateTime<Utc> {
    normalize(now, resolution) + resolution.duration()
}

pub fn add_resolutions(date: DateTime<Utc>, resolution: Resolution, n: i64) -> DateTime<Utc> {
    date + Duration::seconds(resolution.seconds() * n)
}

pub fn subtract_resolutions(
    date: DateTime<Utc>,
    resolution: Resolution,
    n: i64,
) -> DateTime<Utc> {
    date - Duration::seconds(resolution.seconds() * n)
}

/// Number of candles starting in `[start, end)`. Empty or reversed ranges hold none.
pub fn candles_in_range(start: DateTime<Utc>, end: DateTime<Utc>, resolution: Resolution) -> usize {
    let seconds = (end - start).num_seconds();
    if seconds <= 0 {
        0
    } else {
        (seconds / resolution.seconds()) as usize
    }
}

/// Whether `candle` is the most recently finished candle of its series.
pub fn is_newest_valid(candle: &Candle) -> bool {
    candle.started_at == valid_up_to(candle.resolution)
}

/// Timestamps strictly between `newer` and `older` that a contiguous series would hold.
pub fn missing_between(
    newer: DateTime<Utc>,
    older: DateTime<Utc>,
    resolution: Resolution,
) -> Vec<DateTime<Utc>> {
    let mut missing = Vec::new();
    let mut date = newer - resolution.duration();
    while date > older {
        missing.push(date);
        date = date - resolution.duration();
    }
    missing
}

/// Finds the gaps in a newest-first list of `started_at` values.
pub fn detect_missing(dates: &[DateTime<Utc>], resolution: Resolution) -> Vec<DateTime<Utc>> {
    dates
        .windows(2)
        .flat_map(|pair| missing_between(pair[0], pair[1], resolution))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Exchange, Interval};
    use chrono::TimeZone;

    fn resolution(interval: Interval) -> Resolution {
        Exchange::DydxV4.resolution(interval).unwrap()
    }

    #[test]
    fn normalize_rounds_down() {
        let date = Utc.with_ymd_and_hms(2024, 3, 1, 12, 37, 12).unwrap();
        assert_eq!(
            normalize(date, resolution(Interval::OneMinute)),
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 37, 0).unwrap()
        );
        assert_eq!(
            normalize(date, resolution(Interval::FiveMinutes)),
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 35, 0).unwrap()
        );
        assert_eq!(
            normalize(date, resolution(Interval::FifteenMinutes)),
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap()
        );
        assert_eq!(
            normalize(date, resolution(Interval::FourHours)),
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn normalize_is_idempotent_on_boundaries() {
        let date = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        assert_eq!(normalize(date, resolution(Interval::FourHours)), date);
    }

    #[test]
    fn ticks_around_now() {
        let res = resolution(Interval::OneHour);
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 37, 12).unwrap();
        assert_eq!(
            valid_up_to_at(res, now),
            Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap()
        );
        assert_eq!(
            next_tick_at(res, now),
            Utc.with_ymd_and_hms(2024, 3, 1, 13, 0, 0).unwrap()
        );
    }

    #[test]
    fn next_tick_follows_wall_clock() {
        for interval in [Interval::OneMinute, Interval::FourHours, Interval::OneDay] {
            let res = resolution(interval);
            let tick = next_tick(res);
            assert_eq!(normalize(tick, res), tick);
            assert!(tick > Utc::now());
            assert!(tick - Utc::now() <= res.duration());
        }
    }

    #[test]
    fn counting_candles() {
        let res = resolution(Interval::OneMinute);
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        assert_eq!(candles_in_range(start, end, res), 600);
        assert_eq!(candles_in_range(end, start, res), 0);
        assert_eq!(candles_in_range(start, start, res), 0);
    }

    #[test]
    fn stepping() {
        let res = resolution(Interval::FifteenMinutes);
        let date = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(add_resolutions(date, res, 4), date + Duration::hours(1));
        assert_eq!(subtract_resolutions(date, res, 2), date - Duration::minutes(30));
    }

    #[test]
    fn gaps_are_found() {
        let res = resolution(Interval::OneMinute);
        let newest = Utc.with_ymd_and_hms(2024, 1, 1, 0, 10, 0).unwrap();
        let dates = vec![
            newest,
            newest - Duration::minutes(1),
            newest - Duration::minutes(4),
            newest - Duration::minutes(5),
        ];
        assert_eq!(
            detect_missing(&dates, res),
            vec![newest - Duration::minutes(2), newest - Duration::minutes(3)]
        );
    }

    #[test]
    fn contiguous_dates_have_no_gaps() {
        let res = resolution(Interval::OneMinute);
        let newest = Utc.with_ymd_and_hms(2024, 1, 1, 0, 10, 0).unwrap();
        let dates: Vec<_> = (0..10).map(|i| newest - Duration::minutes(i)).collect();
        assert!(detect_missing(&dates, res).is_empty());
    }
}
