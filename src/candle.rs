use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::{collections::HashSet, fmt};

use crate::{Exchange, Resolution};

/// One OHLCV bucket. `started_at` is the left edge of the bucket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Candle {
    pub exchange: Exchange,
    pub market: String,
    pub resolution: Resolution,
    pub started_at: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub base_volume: Decimal,
    pub trades: u64,
    pub quote_volume: Decimal,
    pub starting_open_interest: Decimal,
}

impl Candle {
    pub fn key(&self) -> SeriesKey {
        SeriesKey {
            exchange: self.exchange,
            market: self.market.clone(),
            resolution: self.resolution,
        }
    }

    pub fn belongs_to(&self, key: &SeriesKey) -> bool {
        self.exchange == key.exchange
            && self.resolution == key.resolution
            && self.market == key.market
    }
}

/// Identity of one cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct SeriesKey {
    pub exchange: Exchange,
    pub market: String,
    pub resolution: Resolution,
}

impl SeriesKey {
    pub fn new<T: Into<String>>(exchange: Exchange, market: T, resolution: Resolution) -> Self {
        SeriesKey {
            exchange,
            market: market.into(),
            resolution,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.exchange, self.market, self.resolution)
    }
}

/// Panics unless every candle shares one exchange, market and resolution.
pub fn assert_unity(candles: &[Candle]) {
    let Some(first) = candles.first() else {
        return;
    };
    let key = first.key();
    if let Some((index, candle)) = candles
        .iter()
        .enumerate()
        .find(|(_, candle)| !candle.belongs_to(&key))
    {
        panic!(
            "Candles need to be identical in exchange, market and resolution \
             (candle #{} is a mismatch: {} {} {} at {}).",
            index, candle.exchange, candle.market, candle.resolution, candle.started_at
        );
    }
}

/// Panics unless the candles are newest-first and exactly one resolution apart.
pub fn assert_chronological(candles: &[Candle]) {
    for pair in candles.windows(2) {
        let (newer, older) = (&pair[0], &pair[1]);
        assert_eq!(
            newer.started_at - older.started_at,
            newer.resolution.duration(),
            "Order violated from candle at {} to candle at {}.",
            older.started_at,
            newer.started_at,
        );
    }
}

/// Keeps the first candle seen for every `started_at`.
pub fn remove_duplicates(candles: Vec<Candle>) -> Vec<Candle> {
    let mut seen = HashSet::new();
    let before = candles.len();
    let unique: Vec<Candle> = candles
        .into_iter()
        .filter(|candle| seen.insert(candle.started_at))
        .collect();
    if unique.len() < before {
        log::debug!("Removed {} duplicate candles.", before - unique.len());
    }
    unique
}
