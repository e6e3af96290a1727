#[cfg(feature = "dydx")]
mod dydx;
mod mock;
mod throttle;

#[cfg(feature = "dydx")]
pub use self::dydx::*;
pub use mock::*;
pub use throttle::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{Candle, Exchange, Resolution};

/// A source of historic candles for one exchange.
#[async_trait]
pub trait Api: Send + Sync {
    const NAME: &'static str;

    fn exchange(&self) -> Exchange;
    /// Get the candles starting in `[start, end)` using a single request.
    /// The exchange may cap the amount of candles it returns per request.
    async fn get_candles(
        &self,
        market: &str,
        resolution: Resolution,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, ApiError>;
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Could not connect to the API: {0}")]
    Network(String),
    #[error("API responded with status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Unexpected payload: {0}")]
    Payload(String),
}
