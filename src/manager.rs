use chrono::{DateTime, Utc};
use futures_util::lock::Mutex;
use std::collections::HashMap;
use thiserror::Error;

use crate::{
    apis::Api,
    store::{ClusterInfo, Storage, StoreError},
    time, Candle, CandleFetcher, FetchError, Resolution, SeriesKey,
};

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Cluster {0} already exists")]
    ExistingCluster(SeriesKey),
    #[error("Cluster {0} does not exist")]
    MissingCluster(SeriesKey),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of [`ClusterManager::create_cluster`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    /// Start of the new cluster.
    pub start: DateTime<Utc>,
    /// The requested start, if it lay before the horizon and was moved up to it.
    pub shifted_from: Option<DateTime<Utc>>,
    /// Amount of candles stored.
    pub stored: usize,
}

/// Outcome of [`ClusterManager::update_cluster`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// Nothing to do before `next_tick`.
    UpToDate { next_tick: DateTime<Utc> },
    Extended {
        added: usize,
        newest: DateTime<Utc>,
    },
}

/// Keeps clusters of one exchange in a storage and brings them up to date.
///
/// Operations on the same market and resolution must not run concurrently.
pub struct ClusterManager<A, S>
where
    A: Api,
    S: Storage,
{
    fetcher: CandleFetcher<A>,
    storage: S,
    horizons: Mutex<HashMap<(String, Resolution), DateTime<Utc>>>,
}

impl<A, S> ClusterManager<A, S>
where
    A: Api,
    S: Storage,
{
    pub fn new(fetcher: CandleFetcher<A>, storage: S) -> Self {
        ClusterManager {
            fetcher,
            storage,
            horizons: Mutex::new(HashMap::new()),
        }
    }

    pub fn fetcher(&self) -> &CandleFetcher<A> {
        &self.fetcher
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn key(&self, market: &str, resolution: Resolution) -> SeriesKey {
        SeriesKey::new(self.fetcher.exchange(), market, resolution)
    }

    /// Oldest candle of the series, looked up once per process.
    pub async fn horizon(
        &self,
        market: &str,
        resolution: Resolution,
    ) -> Result<DateTime<Utc>, ManagerError> {
        let memo = (market.to_string(), resolution);
        if let Some(horizon) = self.horizons.lock().await.get(&memo) {
            return Ok(*horizon);
        }

        let horizon = self.fetcher.find_horizon(market, resolution).await?;
        self.horizons.lock().await.insert(memo, horizon);
        Ok(horizon)
    }

    pub async fn get_cluster_info(
        &self,
        market: &str,
        resolution: Resolution,
    ) -> Result<Option<ClusterInfo>, ManagerError> {
        Ok(self
            .storage
            .cluster_info(&self.key(market, resolution))
            .await?)
    }

    async fn require(
        &self,
        market: &str,
        resolution: Resolution,
    ) -> Result<ClusterInfo, ManagerError> {
        self.get_cluster_info(market, resolution)
            .await?
            .ok_or_else(|| ManagerError::MissingCluster(self.key(market, resolution)))
    }

    /// Fetches everything from `start` up to now and stores it as a new cluster.
    ///
    /// A start before the horizon is moved up to the horizon. An existing
    /// cluster is only replaced if `replace` is set.
    pub async fn create_cluster(
        &self,
        market: &str,
        resolution: Resolution,
        start: DateTime<Utc>,
        replace: bool,
    ) -> Result<Created, ManagerError> {
        let key = self.key(market, resolution);

        if self.storage.cluster_info(&key).await?.is_some() {
            if !replace {
                return Err(ManagerError::ExistingCluster(key));
            }
            let deleted = self.storage.delete_cluster(&key).await?;
            log::info!("Replacing cluster {} of {} candles.", key, deleted);
        }

        let requested = time::normalize(start, resolution);
        let horizon = self.horizon(market, resolution).await?;
        let (start, shifted_from) = if requested < horizon {
            log::warn!(
                "Requested start {} of {} lies before its horizon, starting at {} instead.",
                requested,
                key,
                horizon
            );
            (horizon, Some(requested))
        } else {
            (requested, None)
        };

        let candles = self
            .fetcher
            .fetch_range_up_to_now(market, resolution, start)
            .await?;
        self.storage.store_candles(&candles).await?;
        log::info!("Created cluster {} with {} candles.", key, candles.len());

        Ok(Created {
            start,
            shifted_from,
            stored: candles.len(),
        })
    }

    /// Appends every candle that finished since the newest stored one.
    pub async fn update_cluster(
        &self,
        market: &str,
        resolution: Resolution,
    ) -> Result<Update, ManagerError> {
        let info = self.require(market, resolution).await?;
        if info.is_uptodate {
            let next_tick = time::next_tick(resolution);
            log::info!(
                "Cluster {} is up to date, next update possible at {}.",
                self.key(market, resolution),
                next_tick
            );
            return Ok(Update::UpToDate { next_tick });
        }

        let start = time::add_resolutions(info.newest.started_at, resolution, 1);
        let candles = self
            .fetcher
            .fetch_range_up_to_now(market, resolution, start)
            .await?;
        self.storage.store_candles(&candles).await?;

        Ok(Update::Extended {
            added: candles.len(),
            newest: candles
                .first()
                .map_or(info.newest.started_at, |candle| candle.started_at),
        })
    }

    pub async fn retrieve_cluster(
        &self,
        market: &str,
        resolution: Resolution,
    ) -> Result<Vec<Candle>, ManagerError> {
        self.require(market, resolution).await?;
        Ok(self
            .storage
            .retrieve_cluster(&self.key(market, resolution))
            .await?)
    }

    /// The `n` newest candles, or the whole cluster if it holds fewer.
    pub async fn retrieve_newest_candles(
        &self,
        market: &str,
        resolution: Resolution,
        n: usize,
    ) -> Result<Vec<Candle>, ManagerError> {
        let info = self.require(market, resolution).await?;
        Ok(self
            .storage
            .retrieve_newest_candles(&self.key(market, resolution), n.min(info.size))
            .await?)
    }

    pub async fn delete_cluster(
        &self,
        market: &str,
        resolution: Resolution,
    ) -> Result<u64, ManagerError> {
        self.require(market, resolution).await?;
        let key = self.key(market, resolution);
        let deleted = self.storage.delete_cluster(&key).await?;
        log::info!("Deleted cluster {} of {} candles.", key, deleted);
        Ok(deleted)
    }
}
