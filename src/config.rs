//! Explicit configuration passed into constructors.
//!
//! Values come from the process environment (a `.env` file is loaded by the
//! binary) and may be overridden by command-line flags.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::data::retry::{Backoff, RetryPolicy};
use crate::error::ConfigError;

pub const DEFAULT_BASE_URL: &str = "https://api.coingecko.com/api/v3";

/// Settings for [`MarketDataClient`](crate::data::MarketDataClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub user_agent: String,
    /// Upper bound for `per_page` on the markets endpoint.
    pub max_page_size: u32,
    /// Quote currency used for historical requests.
    pub vs_currency: String,
    pub retry: RetryPolicy,
    pub history_requests_per_minute: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            timeout: Duration::from_secs(10),
            user_agent: format!("coin-pipeline/{}", env!("CARGO_PKG_VERSION")),
            max_page_size: 250,
            vs_currency: "usd".to_string(),
            retry: RetryPolicy::default(),
            history_requests_per_minute: 10,
        }
    }
}

impl ClientConfig {
    /// Reads `COINGECKO_*` variables on top of the defaults.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidValue`] when a variable is set but does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(base_url) = env_string("COINGECKO_API_URL") {
            config.base_url = base_url.trim_end_matches('/').to_string();
        }
        config.api_key = env_string("COINGECKO_API_KEY");
        if let Some(secs) = env_parse::<u64>("COINGECKO_TIMEOUT_SECS")? {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(currency) = env_string("COINGECKO_VS_CURRENCY") {
            config.vs_currency = currency.to_ascii_lowercase();
        }
        if let Some(retries) = env_parse::<u32>("COINGECKO_MAX_RETRIES")? {
            config.retry.max_retries = retries;
        }
        if let Some(base_ms) = env_parse::<u64>("COINGECKO_BACKOFF_BASE_MS")? {
            if let Backoff::Exponential { ref mut base, .. } = config.retry.backoff {
                *base = Duration::from_millis(base_ms);
            }
        }
        if let Some(limit) = env_parse::<u32>("COINGECKO_HISTORY_REQUESTS_PER_MINUTE")? {
            config.history_requests_per_minute = limit;
        }

        Ok(config)
    }
}

/// Settings for storage, snapshots, alerts and enrichment.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub db_path: PathBuf,
    pub backup_dir: PathBuf,
    pub max_backups: usize,
    pub alert_log_path: PathBuf,
    pub alert_recipient: Option<String>,
    pub sma_short_window: usize,
    pub sma_long_window: usize,
    /// How far past ingestion time an observation timestamp may lie.
    pub max_clock_skew: chrono::Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/market.duckdb"),
            backup_dir: PathBuf::from("data/backups"),
            max_backups: 4,
            alert_log_path: PathBuf::from("data/alerts.log"),
            alert_recipient: None,
            sma_short_window: 7,
            sma_long_window: 30,
            max_clock_skew: chrono::Duration::zero(),
        }
    }
}

impl PipelineConfig {
    /// Reads `PIPELINE_*` variables on top of the defaults.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidValue`] when a variable is set but does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(path) = env_string("PIPELINE_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(path) = env_string("PIPELINE_BACKUP_DIR") {
            config.backup_dir = PathBuf::from(path);
        }
        if let Some(max) = env_parse::<usize>("PIPELINE_MAX_BACKUPS")? {
            config.max_backups = max;
        }
        if let Some(path) = env_string("PIPELINE_ALERT_LOG") {
            config.alert_log_path = PathBuf::from(path);
        }
        config.alert_recipient = env_string("PIPELINE_ALERT_EMAIL");
        if let Some(window) = env_parse::<usize>("PIPELINE_SMA_SHORT")? {
            config.sma_short_window = window;
        }
        if let Some(window) = env_parse::<usize>("PIPELINE_SMA_LONG")? {
            config.sma_long_window = window;
        }
        if let Some(secs) = env_parse::<i64>("PIPELINE_MAX_CLOCK_SKEW_SECS")? {
            config.max_clock_skew = chrono::Duration::seconds(secs.max(0));
        }

        Ok(config)
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        None => Ok(None),
        Some(raw) => parse_value(key, &raw).map(Some),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_target_the_public_api() {
        let config = ClientConfig::default();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.max_page_size, 250);
        assert_eq!(config.retry.max_attempts(), 5);
    }

    #[test]
    fn unparsable_values_name_the_variable() {
        let err = parse_value::<u32>("COINGECKO_MAX_RETRIES", "many").unwrap_err();
        assert!(err.to_string().starts_with("COINGECKO_MAX_RETRIES=many is invalid"));
    }

    #[test]
    fn parses_numeric_values() {
        assert_eq!(parse_value::<u64>("K", "15").unwrap(), 15);
    }
}
