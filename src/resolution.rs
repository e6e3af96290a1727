use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The standard candle durations, in seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Interval {
    OneMinute = 60,
    FiveMinutes = 300,
    FifteenMinutes = 900,
    ThirtyMinutes = 1800,
    OneHour = 3600,
    FourHours = 14400,
    OneDay = 86400,
    OneWeek = 604800,
}

impl Interval {
    pub const ALL: [Interval; 8] = [
        Interval::OneMinute,
        Interval::FiveMinutes,
        Interval::FifteenMinutes,
        Interval::ThirtyMinutes,
        Interval::OneHour,
        Interval::FourHours,
        Interval::OneDay,
        Interval::OneWeek,
    ];

    pub const fn seconds(self) -> i64 {
        self as i64
    }

    pub fn from_seconds(seconds: i64) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|interval| interval.seconds() == seconds)
    }

    pub fn duration(self) -> Duration {
        Duration::seconds(self.seconds())
    }
}

/// A candle duration together with the notation an exchange uses for it.
///
/// Notations come from the static per-exchange tables in [`crate::Exchange`],
/// which keeps this type `Copy`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Resolution {
    interval: Interval,
    notation: &'static str,
}

impl Resolution {
    pub const fn new(interval: Interval, notation: &'static str) -> Self {
        Resolution { interval, notation }
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn notation(&self) -> &'static str {
        self.notation
    }

    pub fn seconds(&self) -> i64 {
        self.interval.seconds()
    }

    pub fn duration(&self) -> Duration {
        self.interval.duration()
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.notation)
    }
}
