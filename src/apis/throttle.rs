use super::{Api, ApiError};
use crate::{Candle, Exchange, Resolution};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::lock::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// The Throttle API is a middleware that keeps a minimum interval between
/// the end of one request and the start of the next.
/// Requests made through the same throttle are issued one at a time.
pub struct Throttle<A>
where
    A: Api,
{
    api: A,
    interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl<A> Throttle<A>
where
    A: Api,
{
    pub fn new(api: A, interval: Duration) -> Self {
        Throttle {
            api,
            interval,
            last_request: Mutex::new(None),
        }
    }

    pub fn inner(&self) -> &A {
        &self.api
    }
}

#[async_trait]
impl<A: Api> Api for Throttle<A> {
    const NAME: &'static str = A::NAME;

    fn exchange(&self) -> Exchange {
        self.api.exchange()
    }

    async fn get_candles(
        &self,
        market: &str,
        resolution: Resolution,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, ApiError> {
        let mut last_request = self.last_request.lock().await;

        if let Some(finished) = *last_request {
            let elapsed = finished.elapsed();
            if elapsed < self.interval {
                let wait = self.interval - elapsed;
                log::trace!("Throttling {} request for {:?}.", A::NAME, wait);
                tokio::time::sleep(wait).await;
            }
        }

        let candles = self.api.get_candles(market, resolution, start, end).await;
        *last_request = Some(Instant::now());
        candles
    }
}
