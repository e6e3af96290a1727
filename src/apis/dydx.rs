use super::{Api, ApiError};
use crate::{Candle, Exchange, Resolution};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;

const MAINNET: &str = "https://indexer.dydx.trade";
const TESTNET: &str = "https://indexer.v4testnet.dydx.exchange";

/// Largest page the v4 indexer serves.
const LIMIT: usize = 1000;

/// Client for the candle endpoint of the dYdX v4 indexer.
pub struct Dydx {
    client: reqwest::Client,
    endpoint: String,
}

impl Dydx {
    pub fn new<T: Into<String>>(endpoint: T) -> Self {
        Dydx {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn mainnet() -> Self {
        Dydx::new(MAINNET)
    }

    pub fn testnet() -> Self {
        Dydx::new(TESTNET)
    }

    /// Reads `DYDX_ENDPOINT`, which is `mainnet`, `testnet` or an indexer URL.
    pub fn from_env() -> Self {
        match env::var("DYDX_ENDPOINT") {
            Ok(endpoint) => match endpoint.to_ascii_lowercase().as_str() {
                "mainnet" => Dydx::mainnet(),
                "testnet" => Dydx::testnet(),
                _ => Dydx::new(endpoint),
            },
            Err(_) => Dydx::mainnet(),
        }
    }
}

#[async_trait]
impl Api for Dydx {
    const NAME: &'static str = "dYdX";

    fn exchange(&self) -> Exchange {
        Exchange::DydxV4
    }

    async fn get_candles(
        &self,
        market: &str,
        resolution: Resolution,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, ApiError> {
        let url = format!("{}/v4/candles/perpetualMarkets/{}", self.endpoint, market);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("resolution", resolution.notation().to_string()),
                ("fromISO", iso(start)),
                ("toISO", iso(end)),
                ("limit", LIMIT.to_string()),
            ])
            .send()
            .await
            .map_err(|err| ApiError::Network(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|err| ApiError::Network(err.to_string()))?;

        decode(&body, self.exchange(), market, resolution)
    }
}

fn iso(date: DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Deserialize)]
struct CandlesResponse {
    candles: Vec<DydxCandle>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DydxCandle {
    started_at: DateTime<Utc>,
    ticker: String,
    resolution: String,
    low: Decimal,
    high: Decimal,
    open: Decimal,
    close: Decimal,
    base_token_volume: Decimal,
    usd_volume: Decimal,
    trades: u64,
    starting_open_interest: Decimal,
}

impl DydxCandle {
    /// Rejects candles of another market or resolution than requested.
    fn into_candle(
        self,
        exchange: Exchange,
        market: &str,
        requested: Resolution,
    ) -> Result<Candle, ApiError> {
        if self.ticker != market {
            return Err(ApiError::Payload(format!(
                "candle of '{}' in response for '{}'",
                self.ticker, market
            )));
        }
        let resolution = exchange
            .resolution_from_notation(&self.resolution)
            .ok_or_else(|| {
                ApiError::Payload(format!("unknown resolution '{}'", self.resolution))
            })?;
        if resolution != requested {
            return Err(ApiError::Payload(format!(
                "{} candle in response for {}",
                resolution, requested
            )));
        }

        Ok(Candle {
            exchange,
            market: self.ticker,
            resolution,
            started_at: self.started_at,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            base_volume: self.base_token_volume,
            trades: self.trades,
            quote_volume: self.usd_volume,
            starting_open_interest: self.starting_open_interest,
        })
    }
}

fn decode(
    body: &str,
    exchange: Exchange,
    market: &str,
    resolution: Resolution,
) -> Result<Vec<Candle>, ApiError> {
    let response: CandlesResponse =
        serde_json::from_str(body).map_err(|err| ApiError::Payload(err.to_string()))?;

    response
        .candles
        .into_iter()
        .map(|candle| candle.into_candle(exchange, market, resolution))
        .collect()
}
