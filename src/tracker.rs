use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    apis::Api, store::Storage, time, ClusterManager, ManagerError, Resolution, SeriesKey, Update,
};

/// What happened in one refresh round of a [`Tracker`].
#[derive(Debug)]
pub enum ClusterEvent {
    Updated {
        key: SeriesKey,
        added: usize,
        newest: DateTime<Utc>,
    },
    UpToDate {
        key: SeriesKey,
        next_tick: DateTime<Utc>,
    },
    Failed {
        key: SeriesKey,
        error: ManagerError,
    },
}

/// Keeps one existing cluster up to date in the background.
///
/// Right after spawning and then once per finished candle, shortly after
/// the candle closed, the cluster is updated and the outcome is reported.
pub struct Tracker {
    key: SeriesKey,
    events: mpsc::Receiver<ClusterEvent>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Tracker {
    pub fn spawn<A, S>(
        manager: Arc<ClusterManager<A, S>>,
        market: &str,
        resolution: Resolution,
        settle: Duration,
    ) -> Self
    where
        A: Api + 'static,
        S: Storage + 'static,
    {
        let key = manager.key(market, resolution);
        let (sender, events) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let key = key.clone();
            let cancel = cancel.clone();
            async move {
                log::debug!("Tracking {}.", key);
                loop {
                    let update = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        update = manager.update_cluster(&key.market, key.resolution) => update,
                    };

                    let event = match update {
                        Ok(Update::Extended { added, newest }) => ClusterEvent::Updated {
                            key: key.clone(),
                            added,
                            newest,
                        },
                        Ok(Update::UpToDate { next_tick }) => ClusterEvent::UpToDate {
                            key: key.clone(),
                            next_tick,
                        },
                        Err(error) => {
                            log::error!("Could not update {}: {}", key, error);
                            ClusterEvent::Failed {
                                key: key.clone(),
                                error,
                            }
                        }
                    };
                    if sender.send(event).await.is_err() {
                        break;
                    }

                    let wait = (time::next_tick(key.resolution) - Utc::now())
                        .to_std()
                        .unwrap_or_default()
                        + settle;
                    log::trace!("Next update of {} in {:?}.", key, wait);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                log::debug!("Stopped tracking {}.", key);
            }
        });

        Tracker {
            key,
            events,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    /// The next event, `None` once the tracker has stopped.
    pub async fn recv(&mut self) -> Option<ClusterEvent> {
        self.events.recv().await
    }

    /// Stops tracking and waits for the background task to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                log::error!("Tracker of {} panicked: {}", self.key, err);
            }
        }
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
