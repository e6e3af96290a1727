use super::{Api, ApiError};
use crate::{time, Candle, Exchange, Resolution};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::{
    collections::HashSet,
    sync::atomic::{AtomicUsize, Ordering},
};

pub struct MockSettings {
    pub exchange: Exchange,
    /// Oldest candle the backend serves, 2020-01-01 by default.
    pub horizon: DateTime<Utc>,
    /// Maximum amount of candles per response, newest first.
    pub batch_size: usize,
    /// Candles the backend never produced.
    pub missing: HashSet<DateTime<Utc>>,
    /// Answer requests spanning exactly one candle with nothing.
    pub single_candle_quirk: bool,
    /// Fail the n-th request (1-based) with a network error.
    pub fail_on_call: Option<usize>,
}

impl Default for MockSettings {
    fn default() -> Self {
        MockSettings {
            exchange: Exchange::DydxV4,
            horizon: DateTime::from_timestamp(1_577_836_800, 0).unwrap_or_default(),
            batch_size: 1000,
            missing: HashSet::new(),
            single_candle_quirk: false,
            fail_on_call: None,
        }
    }
}

/// The Mock API serves generated candles for every finished bucket between its
/// horizon and now, without touching the network.
/// This is useful for testing.
pub struct Mock {
    settings: MockSettings,
    calls: AtomicUsize,
}

impl Mock {
    pub fn new(exchange: Exchange) -> Self {
        Mock::with_settings(MockSettings {
            exchange,
            ..Default::default()
        })
    }

    pub fn with_settings(settings: MockSettings) -> Self {
        Mock {
            settings,
            calls: AtomicUsize::new(0),
        }
    }

    /// Amount of requests served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn candle(&self, market: &str, resolution: Resolution, started_at: DateTime<Utc>) -> Candle {
        let step = started_at.timestamp() / resolution.seconds();
        let open = Decimal::new(10_000 + step % 500, 1);
        let close = Decimal::new(10_000 + (step + 1) % 500, 1);
        Candle {
            exchange: self.settings.exchange,
            market: market.to_string(),
            resolution,
            started_at,
            open,
            high: open.max(close) + Decimal::ONE,
            low: open.min(close) - Decimal::ONE,
            close,
            base_volume: Decimal::new(step % 97, 0),
            trades: (step % 13) as u64,
            quote_volume: Decimal::new(step % 97, 0) * close,
            starting_open_interest: Decimal::new(11_132, 0),
        }
    }
}

#[async_trait]
impl Api for Mock {
    const NAME: &'static str = "Mock";

    fn exchange(&self) -> Exchange {
        self.settings.exchange
    }

    async fn get_candles(
        &self,
        market: &str,
        resolution: Resolution,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, ApiError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.settings.fail_on_call == Some(call) {
            return Err(ApiError::Network("connection reset by peer".to_string()));
        }
        if self.settings.single_candle_quirk && time::candles_in_range(start, end, resolution) == 1
        {
            return Ok(Vec::new());
        }

        let mut date = time::normalize(end, resolution);
        if date >= end {
            date = date - resolution.duration();
        }
        date = date.min(time::valid_up_to(resolution));
        let oldest = start.max(self.settings.horizon);

        let mut candles = Vec::new();
        while date >= oldest && candles.len() < self.settings.batch_size {
            if !self.settings.missing.contains(&date) {
                candles.push(self.candle(market, resolution, date));
            }
            date = date - Duration::seconds(resolution.seconds());
        }

        Ok(candles)
    }
}
