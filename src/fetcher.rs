use chrono::{DateTime, Utc};
use log::Level;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    apis::{Api, ApiError},
    remove_duplicates, time, Candle, Exchange, Resolution, Settings,
};

/// A range fetch that failed as a whole. Partial results are dropped.
#[derive(Error, Debug)]
#[error("{exchange}: Error fetching market data for market '{market}' and resolution '{resolution}': {cause}")]
pub struct FetchError {
    pub exchange: Exchange,
    pub market: String,
    pub resolution: Resolution,
    #[source]
    pub cause: FetchCause,
}

#[derive(Error, Debug)]
pub enum FetchCause {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("fetch was cancelled")]
    Cancelled,
    #[error("new candles kept completing after {rounds} rounds")]
    Starved { rounds: usize },
    #[error("exchange serves no candles")]
    NoHistory,
}

/// The outcome of walking a range backwards.
#[derive(Debug, Default)]
pub struct Backfill {
    /// Newest first, without duplicates.
    pub candles: Vec<Candle>,
    /// Buckets in the range the exchange did not deliver, newest first.
    pub missing: Vec<DateTime<Utc>>,
    /// Candles dropped because they were outside the requested window or already seen.
    pub duplicates: usize,
}

/// Pages through the history of one exchange, batch by batch.
pub struct CandleFetcher<A>
where
    A: Api,
{
    api: A,
    pub(crate) horizon_step: i64,
    max_rounds: usize,
    log_progress: bool,
    cancel: CancellationToken,
}

impl<A> CandleFetcher<A>
where
    A: Api,
{
    pub fn new(api: A) -> Self {
        Self::with_settings(api, &Settings::default())
    }

    pub fn with_settings(api: A, settings: &Settings) -> Self {
        CandleFetcher {
            api,
            horizon_step: settings.horizon_step.max(1),
            max_rounds: settings.max_rounds.max(1),
            log_progress: settings.log_progress,
            cancel: CancellationToken::new(),
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn exchange(&self) -> Exchange {
        self.api.exchange()
    }

    /// Cancelling this token aborts every running and future fetch.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn error(&self, market: &str, resolution: Resolution, cause: FetchCause) -> FetchError {
        FetchError {
            exchange: self.exchange(),
            market: market.to_string(),
            resolution,
            cause,
        }
    }

    /// One request for the candles starting in `[start, end)`, newest first.
    ///
    /// Some backends answer one-candle windows with nothing, so those are
    /// widened backwards by one resolution and trimmed afterwards.
    pub async fn fetch_batch(
        &self,
        market: &str,
        resolution: Resolution,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, FetchError> {
        let request_start = if time::candles_in_range(start, end, resolution) == 1 {
            start - resolution.duration()
        } else {
            start
        };

        log::trace!(
            "Requesting {} {} candles from {} to {}.",
            market,
            resolution,
            request_start,
            end
        );

        let request = self
            .api
            .get_candles(market, resolution, request_start, end);
        let mut batch = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(self.error(market, resolution, FetchCause::Cancelled));
            }
            batch = request => batch.map_err(|err| self.error(market, resolution, err.into()))?,
        };

        if request_start != start {
            batch.retain(|candle| candle.started_at >= start);
        }
        batch.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(batch)
    }

    /// Every candle starting in `[start, end)`, newest first.
    pub async fn fetch_range(
        &self,
        market: &str,
        resolution: Resolution,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, FetchError> {
        Ok(self.backfill(market, resolution, start, end).await?.candles)
    }

    /// Walks from `end` back to `start`, checking every batch seam for gaps.
    ///
    /// The loop stops once the oldest candle reaches `start`, or when the
    /// exchange has nothing older to give. Buckets older than the oldest
    /// candle served are not part of the exchange's history and are not
    /// reported as missing.
    pub async fn backfill(
        &self,
        market: &str,
        resolution: Resolution,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Backfill, FetchError> {
        // Seams are measured from a bucket boundary.
        let end = match time::normalize(end, resolution) {
            floor if floor == end => end,
            floor => floor + resolution.duration(),
        };
        let mut total = time::candles_in_range(start, end, resolution);
        let mut backfill = Backfill::default();
        let mut cursor = end;
        let level = if self.log_progress {
            Level::Info
        } else {
            Level::Debug
        };

        while backfill
            .candles
            .last()
            .map_or(start < end, |oldest| oldest.started_at > start)
        {
            let mut batch = self.fetch_batch(market, resolution, start, cursor).await?;

            let received = batch.len();
            batch.retain(|candle| candle.started_at >= start && candle.started_at < cursor);
            let mut batch = remove_duplicates(batch);
            if batch.len() < received {
                log::debug!(
                    "Dropped {} {} candles outside of {} to {}.",
                    received - batch.len(),
                    market,
                    start,
                    cursor
                );
                backfill.duplicates += received - batch.len();
            }

            if batch.is_empty() {
                break;
            }

            let mut dates = Vec::with_capacity(batch.len() + 1);
            dates.push(cursor);
            dates.extend(batch.iter().map(|candle| candle.started_at));
            let missing = time::detect_missing(&dates, resolution);
            total = total.saturating_sub(missing.len());
            backfill.missing.extend(missing);

            cursor = batch[batch.len() - 1].started_at;
            backfill.candles.append(&mut batch);

            log::log!(
                level,
                "{} of {} {} candles fetched.",
                backfill.candles.len(),
                total,
                market
            );
        }

        match backfill.candles.last() {
            Some(oldest) if oldest.started_at > start => {
                log::info!(
                    "{} serves no {} {} candles before {}, {} requested.",
                    self.exchange(),
                    market,
                    resolution,
                    oldest.started_at,
                    start
                );
            }
            None if start < end => {
                log::warn!(
                    "{} served no {} {} candles between {} and {}.",
                    self.exchange(),
                    market,
                    resolution,
                    start,
                    end
                );
            }
            _ => {}
        }

        if !backfill.missing.is_empty() {
            log_missing(self.exchange(), market, resolution, &backfill.missing);
        }

        Ok(backfill)
    }

    /// Every candle from `start` up to the most recently finished one, newest first.
    ///
    /// New candles keep finishing while older ones are fetched, so the range is
    /// fetched again from the newest candle until it has caught up with now.
    pub async fn fetch_range_up_to_now(
        &self,
        market: &str,
        resolution: Resolution,
        start: DateTime<Utc>,
    ) -> Result<Vec<Candle>, FetchError> {
        let mut candles: Vec<Candle> = Vec::new();
        let mut start = start;
        let mut now = time::normalized_now(resolution);
        let mut rounds = 0;

        while start < now {
            if rounds == self.max_rounds {
                return Err(self.error(market, resolution, FetchCause::Starved { rounds }));
            }
            rounds += 1;

            let mut fresh = self.fetch_range(market, resolution, start, now).await?;
            if fresh.is_empty() {
                log::warn!(
                    "{} has no {} {} candles newer than {} yet.",
                    self.exchange(),
                    market,
                    resolution,
                    start
                );
                break;
            }

            fresh.append(&mut candles);
            candles = fresh;

            start = time::add_resolutions(candles[0].started_at, resolution, 1);
            now = time::normalized_now(resolution);
        }

        Ok(candles)
    }
}

fn log_missing(
    exchange: Exchange,
    market: &str,
    resolution: Resolution,
    missing: &[DateTime<Utc>],
) {
    log::warn!(
        "{} failed to deliver {} {} for {}, {}.",
        exchange,
        missing.len(),
        if missing.len() == 1 { "candle" } else { "candles" },
        market,
        resolution
    );
    for date in missing {
        log::warn!("Candle missing: {}.", date);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        apis::{Mock, MockSettings},
        assert_chronological, assert_unity, Interval,
    };
    use chrono::{Duration, TimeZone};
    use std::collections::HashSet;

    fn resolution(interval: Interval) -> Resolution {
        Exchange::DydxV4.resolution(interval).unwrap()
    }

    fn init_logger() {
        // Fails when another test installed the logger first.
        let _ = simple_logger::SimpleLogger::new()
            .with_level(log::LevelFilter::Trace)
            .with_utc_timestamps()
            .init();
    }

    fn mock(settings: MockSettings) -> CandleFetcher<Mock> {
        CandleFetcher::new(Mock::with_settings(settings))
    }

    #[tokio::test]
    async fn fetch_600_historic_candles() {
        let fetcher = CandleFetcher::new(Mock::new(Exchange::DydxV4));
        let res = resolution(Interval::OneMinute);
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();

        let candles = fetcher.fetch_range("ETH-USD", res, start, end).await.unwrap();

        assert_eq!(candles.len(), 600);
        assert_eq!(candles[0].started_at, end - res.duration());
        assert_eq!(candles[599].started_at, start);
        let unique: HashSet<_> = candles.iter().map(|candle| candle.started_at).collect();
        assert_eq!(unique.len(), 600);
    }

    #[tokio::test]
    async fn range_spans_many_batches() {
        let fetcher = mock(MockSettings {
            batch_size: 100,
            ..Default::default()
        });
        let res = resolution(Interval::FiveMinutes);
        let start = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let end = time::add_resolutions(start, res, 1234);

        let backfill = fetcher.backfill("BTC-USD", res, start, end).await.unwrap();

        assert_eq!(backfill.candles.len(), 1234);
        assert!(backfill.missing.is_empty());
        assert_eq!(fetcher.api().calls(), 13);
        assert_unity(&backfill.candles);
        assert_chronological(&backfill.candles);
    }

    #[tokio::test]
    async fn gap_inside_a_batch_is_reported() {
        init_logger();
        let res = resolution(Interval::OneMinute);
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = time::add_resolutions(start, res, 50);
        let gone = time::add_resolutions(start, res, 17);
        let fetcher = mock(MockSettings {
            missing: [gone].into_iter().collect(),
            ..Default::default()
        });

        let backfill = fetcher.backfill("ETH-USD", res, start, end).await.unwrap();

        assert_eq!(backfill.candles.len(), 49);
        assert_eq!(backfill.missing, vec![gone]);
    }

    #[tokio::test]
    async fn gap_on_a_batch_seam_is_reported() {
        init_logger();
        let res = resolution(Interval::OneMinute);
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = time::add_resolutions(start, res, 30);
        // The first batch holds minutes 29 down to 20, so 19 and 18 sit on its seam.
        let seam = [
            time::add_resolutions(start, res, 19),
            time::add_resolutions(start, res, 18),
        ];
        let fetcher = mock(MockSettings {
            batch_size: 10,
            missing: seam.into_iter().collect(),
            ..Default::default()
        });

        let backfill = fetcher.backfill("ETH-USD", res, start, end).await.unwrap();

        assert_eq!(backfill.candles.len(), 28);
        assert_eq!(backfill.missing, seam.to_vec());
    }

    #[tokio::test]
    async fn missing_newest_candle_is_reported() {
        let res = resolution(Interval::OneHour);
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = time::add_resolutions(start, res, 24);
        let newest = end - res.duration();
        let fetcher = mock(MockSettings {
            missing: [newest].into_iter().collect(),
            ..Default::default()
        });

        let backfill = fetcher.backfill("ETH-USD", res, start, end).await.unwrap();

        assert_eq!(backfill.candles.len(), 23);
        assert_eq!(backfill.missing, vec![newest]);
    }

    #[tokio::test]
    async fn nothing_older_than_the_horizon() {
        init_logger();
        let res = resolution(Interval::OneHour);
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = time::add_resolutions(start, res, 24);
        let fetcher = mock(MockSettings {
            horizon: time::add_resolutions(start, res, 2),
            ..Default::default()
        });

        let backfill = fetcher.backfill("ETH-USD", res, start, end).await.unwrap();

        assert_eq!(backfill.candles.len(), 22);
        assert!(backfill.missing.is_empty());
    }

    #[tokio::test]
    async fn year_before_the_horizon_is_not_itemized() {
        let res = resolution(Interval::OneMinute);
        let horizon = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let fetcher = mock(MockSettings {
            horizon,
            ..Default::default()
        });

        let backfill = fetcher
            .backfill(
                "ETH-USD",
                res,
                horizon - Duration::days(365),
                horizon + Duration::minutes(10),
            )
            .await
            .unwrap();

        assert_eq!(backfill.candles.len(), 10);
        assert_eq!(backfill.candles[9].started_at, horizon);
        assert!(backfill.missing.is_empty());
    }

    #[tokio::test]
    async fn unaligned_end_reports_whole_buckets() {
        init_logger();
        let res = resolution(Interval::OneMinute);
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 1, 0, 10, 30).unwrap();
        let newest = Utc.with_ymd_and_hms(2024, 1, 1, 0, 10, 0).unwrap();
        let fetcher = mock(MockSettings {
            missing: [newest].into_iter().collect(),
            ..Default::default()
        });

        let backfill = fetcher.backfill("ETH-USD", res, start, end).await.unwrap();

        assert_eq!(backfill.candles.len(), 10);
        assert_eq!(backfill.candles[0].started_at, newest - res.duration());
        assert_eq!(backfill.missing, vec![newest]);
    }

    /// Treats `end` as inclusive, like the dYdX indexer's `toISO`, so every
    /// batch repeats the candle the previous one ended on.
    struct InclusiveEnd(Mock);

    #[async_trait::async_trait]
    impl Api for InclusiveEnd {
        const NAME: &'static str = "InclusiveEnd";

        fn exchange(&self) -> Exchange {
            self.0.exchange()
        }

        async fn get_candles(
            &self,
            market: &str,
            resolution: Resolution,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<Candle>, ApiError> {
            self.0
                .get_candles(market, resolution, start, end + resolution.duration())
                .await
        }
    }

    #[tokio::test]
    async fn overlapping_batches_are_deduplicated() {
        let res = resolution(Interval::OneMinute);
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = time::add_resolutions(start, res, 100);
        let fetcher = CandleFetcher::new(InclusiveEnd(Mock::with_settings(MockSettings {
            batch_size: 10,
            ..Default::default()
        })));

        let backfill = fetcher.backfill("ETH-USD", res, start, end).await.unwrap();

        let unique: HashSet<_> = backfill
            .candles
            .iter()
            .map(|candle| candle.started_at)
            .collect();
        assert_eq!(backfill.candles.len(), 100);
        assert_eq!(unique.len(), 100);
        assert!(backfill.missing.is_empty());
        assert!(backfill.duplicates > 0);
        assert_chronological(&backfill.candles);
    }

    #[tokio::test]
    async fn single_candle_windows_are_widened() {
        let res = resolution(Interval::FifteenMinutes);
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap();
        let fetcher = mock(MockSettings {
            single_candle_quirk: true,
            ..Default::default()
        });

        let candles = fetcher
            .fetch_range("ETH-USD", res, start, start + res.duration())
            .await
            .unwrap();

        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].started_at, start);
    }

    #[tokio::test]
    async fn transport_failure_aborts_the_range() {
        let res = resolution(Interval::OneMinute);
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = time::add_resolutions(start, res, 100);
        let fetcher = mock(MockSettings {
            batch_size: 10,
            fail_on_call: Some(3),
            ..Default::default()
        });

        let err = fetcher
            .fetch_range("ETH-USD", res, start, end)
            .await
            .unwrap_err();

        assert_eq!(err.exchange, Exchange::DydxV4);
        assert_eq!(err.market, "ETH-USD");
        assert_eq!(err.resolution, res);
        assert!(matches!(err.cause, FetchCause::Api(ApiError::Network(_))));
        assert_eq!(fetcher.api().calls(), 3);
    }

    #[tokio::test]
    async fn empty_range_fetches_nothing() {
        let fetcher = CandleFetcher::new(Mock::new(Exchange::DydxV4));
        let res = resolution(Interval::OneMinute);
        let date = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let candles = fetcher.fetch_range("ETH-USD", res, date, date).await.unwrap();

        assert!(candles.is_empty());
        assert_eq!(fetcher.api().calls(), 0);
    }

    #[tokio::test]
    async fn up_to_now_converges() {
        let res = resolution(Interval::FourHours);
        let fetcher = mock(MockSettings {
            batch_size: 7,
            ..Default::default()
        });
        let start = time::subtract_resolutions(time::normalized_now(res), res, 50);

        let candles = fetcher
            .fetch_range_up_to_now("ETH-USD", res, start)
            .await
            .unwrap();

        assert_eq!(candles[0].started_at, time::valid_up_to(res));
        assert_eq!(candles[candles.len() - 1].started_at, start);
        assert_chronological(&candles);
    }

    #[tokio::test]
    async fn up_to_now_from_the_newest_candle() {
        let res = resolution(Interval::OneDay);
        let fetcher = CandleFetcher::new(Mock::new(Exchange::DydxV4));
        let start = time::valid_up_to(res);

        let candles = fetcher
            .fetch_range_up_to_now("ETH-USD", res, start)
            .await
            .unwrap();

        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].started_at, start);
    }

    #[tokio::test]
    async fn up_to_now_when_nothing_is_new() {
        let res = resolution(Interval::OneDay);
        let fetcher = CandleFetcher::new(Mock::new(Exchange::DydxV4));

        let candles = fetcher
            .fetch_range_up_to_now("ETH-USD", res, time::normalized_now(res))
            .await
            .unwrap();

        assert!(candles.is_empty());
        assert_eq!(fetcher.api().calls(), 0);
    }

    /// Serves only the oldest candle of every window, so each round makes
    /// one candle of progress.
    struct Trickle(Mock);

    #[async_trait::async_trait]
    impl Api for Trickle {
        const NAME: &'static str = "Trickle";

        fn exchange(&self) -> Exchange {
            self.0.exchange()
        }

        async fn get_candles(
            &self,
            market: &str,
            resolution: Resolution,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<Candle>, ApiError> {
            let mut candles = self.0.get_candles(market, resolution, start, end).await?;
            Ok(candles.pop().into_iter().collect())
        }
    }

    #[tokio::test]
    async fn one_round_when_up_to_date() {
        let res = resolution(Interval::OneDay);
        let settings = Settings {
            max_rounds: 1,
            ..Default::default()
        };
        let fetcher = CandleFetcher::with_settings(Mock::new(Exchange::DydxV4), &settings);
        let start = time::subtract_resolutions(time::normalized_now(res), res, 10);

        let candles = fetcher
            .fetch_range_up_to_now("ETH-USD", res, start)
            .await
            .unwrap();

        assert_eq!(candles.len(), 10);
    }

    #[tokio::test]
    async fn starvation_is_guarded() {
        let res = resolution(Interval::OneDay);
        let settings = Settings {
            max_rounds: 3,
            ..Default::default()
        };
        let fetcher =
            CandleFetcher::with_settings(Trickle(Mock::new(Exchange::DydxV4)), &settings);
        let start = time::subtract_resolutions(time::normalized_now(res), res, 10);

        let err = fetcher
            .fetch_range_up_to_now("ETH-USD", res, start)
            .await
            .unwrap_err();

        assert!(matches!(err.cause, FetchCause::Starved { rounds: 3 }));
    }

    #[tokio::test]
    async fn cancelled_fetch_fails() {
        let fetcher = CandleFetcher::new(Mock::new(Exchange::DydxV4));
        let res = resolution(Interval::OneMinute);
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        fetcher.cancellation_token().cancel();

        let err = fetcher
            .fetch_range("ETH-USD", res, start, start + Duration::hours(1))
            .await
            .unwrap_err();

        assert!(matches!(err.cause, FetchCause::Cancelled));
    }
}
