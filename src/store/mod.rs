mod sqlite;

pub use sqlite::*;

use async_trait::async_trait;
use thiserror::Error;

use crate::{time, Candle, SeriesKey};

/// Durable home of the clusters. Candles are only ever appended or dropped
/// a whole cluster at a time.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Stores candles of a single cluster. Storing a candle twice is an error.
    async fn store_candles(&self, candles: &[Candle]) -> Result<(), StoreError>;
    /// The whole cluster, newest first. Empty if there is none.
    async fn retrieve_cluster(&self, key: &SeriesKey) -> Result<Vec<Candle>, StoreError>;
    /// The `n` newest candles of the cluster, newest first.
    async fn retrieve_newest_candles(
        &self,
        key: &SeriesKey,
        n: usize,
    ) -> Result<Vec<Candle>, StoreError>;
    /// Removes the cluster and returns how many candles it held.
    async fn delete_cluster(&self, key: &SeriesKey) -> Result<u64, StoreError>;
    /// Summary of the cluster, `None` if there is none.
    async fn cluster_info(&self, key: &SeriesKey) -> Result<Option<ClusterInfo>, StoreError>;
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Could not prepare the database file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Stored candle is corrupt: {0}")]
    Corrupt(String),
}

/// Derived summary of one cluster, computed on demand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterInfo {
    pub newest: Candle,
    pub oldest: Candle,
    pub size: usize,
    /// The newest candle is the most recently finished one.
    pub is_uptodate: bool,
}

impl ClusterInfo {
    pub fn new(newest: Candle, oldest: Candle, size: usize) -> Self {
        let is_uptodate = time::is_newest_valid(&newest);
        ClusterInfo {
            newest,
            oldest,
            size,
            is_uptodate,
        }
    }
}
