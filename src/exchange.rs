use crate::{Interval, Resolution};
use serde::{Deserialize, Serialize};
use std::fmt;

const DYDX_RESOLUTIONS: [Resolution; 7] = [
    Resolution::new(Interval::OneMinute, "1MIN"),
    Resolution::new(Interval::FiveMinutes, "5MINS"),
    Resolution::new(Interval::FifteenMinutes, "15MINS"),
    Resolution::new(Interval::ThirtyMinutes, "30MINS"),
    Resolution::new(Interval::OneHour, "1HOUR"),
    Resolution::new(Interval::FourHours, "4HOURS"),
    Resolution::new(Interval::OneDay, "1DAY"),
];

/// Exchanges candles can be sourced from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Exchange {
    DydxV4,
}

impl Exchange {
    pub fn name(&self) -> &'static str {
        match self {
            Exchange::DydxV4 => "DYDX_V4",
        }
    }

    /// All resolutions this exchange serves.
    pub fn resolutions(&self) -> &'static [Resolution] {
        match self {
            Exchange::DydxV4 => &DYDX_RESOLUTIONS,
        }
    }

    pub fn resolution(&self, interval: Interval) -> Option<Resolution> {
        self.resolutions()
            .iter()
            .copied()
            .find(|resolution| resolution.interval() == interval)
    }

    pub fn resolution_from_notation(&self, notation: &str) -> Option<Resolution> {
        self.resolutions()
            .iter()
            .copied()
            .find(|resolution| resolution.notation() == notation)
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
