use super::{ClusterInfo, Storage, StoreError};
use crate::{assert_unity, Candle, SeriesKey};

use async_trait::async_trait;
use chrono::DateTime;
use rust_decimal::Decimal;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    ConnectOptions, QueryBuilder, Row, Sqlite, SqlitePool,
};
use std::{path::Path, str::FromStr};

/// Rows per insert statement, well below SQLite's parameter limit.
const CHUNK_SIZE: usize = 64;

/// Keeps every cluster in a single SQLite table.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens the database file, creating it and its directory if missing.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .disable_statement_logging();

        let pool = SqlitePool::connect_with(options).await?;
        log::debug!("Opened candle store at {}.", path.display());

        SqliteStore::with_pool(pool).await
    }

    /// A store that lives as long as the value does.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.disable_statement_logging();

        // Every connection to `:memory:` is its own database, so the pool must
        // hold on to exactly one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        SqliteStore::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(
            "
                CREATE TABLE IF NOT EXISTS candle (
                    exchange TEXT NOT NULL,
                    market TEXT NOT NULL,
                    resolution INTEGER NOT NULL,
                    started_at INTEGER NOT NULL,
                    open BLOB NOT NULL,
                    high BLOB NOT NULL,
                    low BLOB NOT NULL,
                    close BLOB NOT NULL,
                    base_volume BLOB NOT NULL,
                    trades INTEGER NOT NULL,
                    quote_volume BLOB NOT NULL,
                    starting_open_interest BLOB NOT NULL,
                    PRIMARY KEY(exchange, market, resolution, started_at)
                )
            ",
        )
        .execute(&pool)
        .await?;

        Ok(SqliteStore { pool })
    }

    /// Candles of a cluster ordered by `started_at`, `limit` of -1 meaning all of them.
    async fn select(
        &self,
        key: &SeriesKey,
        newest_first: bool,
        limit: i64,
    ) -> Result<Vec<Candle>, StoreError> {
        let order = if newest_first { "DESC" } else { "ASC" };
        let rows = sqlx::query(&format!(
            "
                SELECT started_at, open, high, low, close, base_volume, trades, quote_volume, starting_open_interest
                FROM candle
                WHERE exchange = $1
                AND market = $2
                AND resolution = $3
                ORDER BY started_at {}
                LIMIT $4
            ",
            order
        ))
        .bind(key.exchange.name())
        .bind(key.market.as_str())
        .bind(key.resolution.seconds())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| row_to_candle(key, row)).collect()
    }
}

#[async_trait]
impl Storage for SqliteStore {
    async fn store_candles(&self, candles: &[Candle]) -> Result<(), StoreError> {
        if candles.is_empty() {
            return Ok(());
        }
        assert_unity(candles);

        let mut tx = self.pool.begin().await?;
        for chunk in candles.chunks(CHUNK_SIZE) {
            let mut query = QueryBuilder::<Sqlite>::new(
                "INSERT INTO candle (exchange, market, resolution, started_at, open, high, low, close, base_volume, trades, quote_volume, starting_open_interest) ",
            );
            query.push_values(chunk, |mut row, candle| {
                row.push_bind(candle.exchange.name())
                    .push_bind(candle.market.clone())
                    .push_bind(candle.resolution.seconds())
                    .push_bind(candle.started_at.timestamp())
                    .push_bind(dec_to_blob(candle.open))
                    .push_bind(dec_to_blob(candle.high))
                    .push_bind(dec_to_blob(candle.low))
                    .push_bind(dec_to_blob(candle.close))
                    .push_bind(dec_to_blob(candle.base_volume))
                    .push_bind(candle.trades as i64)
                    .push_bind(dec_to_blob(candle.quote_volume))
                    .push_bind(dec_to_blob(candle.starting_open_interest));
            });
            query.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        log::trace!("Stored {} candles of {}.", candles.len(), candles[0].key());
        Ok(())
    }

    async fn retrieve_cluster(&self, key: &SeriesKey) -> Result<Vec<Candle>, StoreError> {
        self.select(key, true, -1).await
    }

    async fn retrieve_newest_candles(
        &self,
        key: &SeriesKey,
        n: usize,
    ) -> Result<Vec<Candle>, StoreError> {
        let limit = i64::try_from(n).unwrap_or(i64::MAX);
        self.select(key, true, limit).await
    }

    async fn delete_cluster(&self, key: &SeriesKey) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "
                DELETE FROM candle
                WHERE exchange = $1
                AND market = $2
                AND resolution = $3
            ",
        )
        .bind(key.exchange.name())
        .bind(key.market.as_str())
        .bind(key.resolution.seconds())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn cluster_info(&self, key: &SeriesKey) -> Result<Option<ClusterInfo>, StoreError> {
        let size: i64 = sqlx::query_scalar(
            "
                SELECT COUNT(*)
                FROM candle
                WHERE exchange = $1
                AND market = $2
                AND resolution = $3
            ",
        )
        .bind(key.exchange.name())
        .bind(key.market.as_str())
        .bind(key.resolution.seconds())
        .fetch_one(&self.pool)
        .await?;

        if size == 0 {
            return Ok(None);
        }

        let newest = self.select(key, true, 1).await?.pop();
        let oldest = self.select(key, false, 1).await?.pop();
        match (newest, oldest) {
            (Some(newest), Some(oldest)) => {
                Ok(Some(ClusterInfo::new(newest, oldest, size as usize)))
            }
            // Deleted in between.
            _ => Ok(None),
        }
    }
}

fn row_to_candle(key: &SeriesKey, row: &SqliteRow) -> Result<Candle, StoreError> {
    let started_at: i64 = row.try_get("started_at")?;
    let trades: i64 = row.try_get("trades")?;

    Ok(Candle {
        exchange: key.exchange,
        market: key.market.clone(),
        resolution: key.resolution,
        started_at: DateTime::from_timestamp(started_at, 0)
            .ok_or_else(|| StoreError::Corrupt(format!("timestamp {} out of range", started_at)))?,
        open: blob_to_dec(row.try_get("open")?)?,
        high: blob_to_dec(row.try_get("high")?)?,
        low: blob_to_dec(row.try_get("low")?)?,
        close: blob_to_dec(row.try_get("close")?)?,
        base_volume: blob_to_dec(row.try_get("base_volume")?)?,
        trades: u64::try_from(trades)
            .map_err(|_| StoreError::Corrupt(format!("negative trade count {}", trades)))?,
        quote_volume: blob_to_dec(row.try_get("quote_volume")?)?,
        starting_open_interest: blob_to_dec(row.try_get("starting_open_interest")?)?,
    })
}

fn blob_to_dec(blob: Vec<u8>) -> Result<Decimal, StoreError> {
    let buf: [u8; 16] = blob
        .as_slice()
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("decimal of {} bytes", blob.len())))?;
    Ok(Decimal::deserialize(buf))
}

fn dec_to_blob(decimal: Decimal) -> Vec<u8> {
    decimal.serialize().to_vec()
}
