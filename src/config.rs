use std::{env, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;

use crate::{
    apis::{Api, Throttle},
    store::{SqliteStore, StoreError},
    CandleFetcher, ClusterManager,
};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {var}")]
    Invalid { var: &'static str, value: String },
}

pub struct Settings {
    /// Minimum pause between two requests to the exchange.
    pub throttle: Duration,
    /// First step of the horizon search, in resolutions.
    pub horizon_step: i64,
    /// Rounds after which catching up with now is given up.
    pub max_rounds: usize,
    /// Log the progress of range fetches on `info` instead of `debug`.
    pub log_progress: bool,
    pub database: PathBuf,
    /// Delay after a candle closed before the tracker picks it up.
    pub settle: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            throttle: Duration::from_millis(250),
            horizon_step: 1000,
            max_rounds: 16,
            log_progress: false,
            database: PathBuf::from("./.store/candles.db"),
            settle: Duration::from_secs(5),
        }
    }
}

impl Settings {
    /// The defaults, overridden by `CANDLEKEEP_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Settings::from_vars(|var| env::var(var).ok())
    }

    fn from_vars<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();

        if let Some(millis) = parse::<u64, _>(&var, "CANDLEKEEP_THROTTLE_MS")? {
            settings.throttle = Duration::from_millis(millis);
        }
        if let Some(step) = parse::<i64, _>(&var, "CANDLEKEEP_HORIZON_STEP")? {
            settings.horizon_step = step;
        }
        if let Some(rounds) = parse::<usize, _>(&var, "CANDLEKEEP_MAX_ROUNDS")? {
            settings.max_rounds = rounds;
        }
        if let Some(value) = var("CANDLEKEEP_LOG_PROGRESS") {
            settings.log_progress = match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" | "" => false,
                _ => {
                    return Err(ConfigError::Invalid {
                        var: "CANDLEKEEP_LOG_PROGRESS",
                        value,
                    })
                }
            };
        }
        if let Some(path) = var("CANDLEKEEP_DATABASE") {
            settings.database = PathBuf::from(path);
        }
        if let Some(millis) = parse::<u64, _>(&var, "CANDLEKEEP_SETTLE_MS")? {
            settings.settle = Duration::from_millis(millis);
        }

        Ok(settings)
    }

    /// Throttled fetcher over `api`, backed by the configured database.
    pub async fn open<A: Api>(
        &self,
        api: A,
    ) -> Result<ClusterManager<Throttle<A>, SqliteStore>, StoreError> {
        let storage = SqliteStore::open(&self.database).await?;
        let fetcher = CandleFetcher::with_settings(Throttle::new(api, self.throttle), self);
        Ok(ClusterManager::new(fetcher, storage))
    }
}

fn parse<T, F>(var: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var: name, value }),
        None => Ok(None),
    }
}
