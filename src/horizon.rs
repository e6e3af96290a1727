use chrono::{DateTime, Utc};

use crate::{
    apis::Api,
    fetcher::{CandleFetcher, FetchCause, FetchError},
    time, Resolution,
};

impl<A> CandleFetcher<A>
where
    A: Api,
{
    /// Finds the `started_at` of the oldest candle the exchange serves.
    ///
    /// Steps back exponentially until a lookup comes back empty, then bisects
    /// between the last hit and the first miss. Every lookup is a single
    /// one-candle batch.
    pub async fn find_horizon(
        &self,
        market: &str,
        resolution: Resolution,
    ) -> Result<DateTime<Utc>, FetchError> {
        let now = time::normalized_now(resolution);
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        let mut upper = now;
        let mut step = self.horizon_step;
        let mut lookups = 0;

        let mut lower = loop {
            let candidate = time::subtract_resolutions(now, resolution, step);
            let at = if candidate < epoch { epoch } else { candidate };

            lookups += 1;
            if !self.has_candle_at(market, resolution, at).await? {
                break at;
            }
            upper = at;
            if at == epoch {
                log::debug!("{} {} has candles back to the epoch.", market, resolution);
                return Ok(epoch);
            }
            step = step.saturating_mul(2);
        };

        while upper - lower > resolution.duration() {
            let middle = time::normalize(lower + (upper - lower) / 2, resolution);
            lookups += 1;
            if self.has_candle_at(market, resolution, middle).await? {
                upper = middle;
            } else {
                lower = middle;
            }
        }

        let confirmation = self
            .fetch_batch(market, resolution, upper, upper + resolution.duration())
            .await?;
        let horizon = confirmation
            .first()
            .map(|candle| candle.started_at)
            .ok_or_else(|| self.error(market, resolution, FetchCause::NoHistory))?;

        log::debug!(
            "Horizon of {} {} is {} ({} lookups).",
            market,
            resolution,
            horizon,
            lookups + 1
        );
        Ok(horizon)
    }

    async fn has_candle_at(
        &self,
        market: &str,
        resolution: Resolution,
        at: DateTime<Utc>,
    ) -> Result<bool, FetchError> {
        let batch = self
            .fetch_batch(market, resolution, at, at + resolution.duration())
            .await?;
        Ok(!batch.is_empty())
    }
}
