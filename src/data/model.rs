use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One element of the `/coins/markets` payload, untouched.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// A single historical observation as returned by the market chart endpoint.
///
/// The API reports prices, market caps and volumes as three parallel arrays of
/// `[timestamp_ms, value]` pairs; the client merges them by timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPricePoint {
    pub timestamp_ms: i64,
    pub price: Option<f64>,
    pub market_cap: Option<f64>,
    pub total_volume: Option<f64>,
}

/// Represents one validated observation of one asset at one point in time.
///
/// Produced only by the schema validator. Price, market cap and volume are
/// finite and non-negative; fields the API did not report are `None` rather
/// than zero, since zero is a legitimate price floor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshotRecord {
    pub asset_id: String,
    pub symbol: String,
    pub name: String,
    pub current_price: f64,
    pub market_cap: f64,
    pub total_volume: f64,
    pub market_cap_rank: Option<u32>,
    pub high_24h: Option<f64>,
    pub low_24h: Option<f64>,
    pub price_change_24h: Option<f64>,
    pub price_change_percentage_24h: Option<f64>,
    pub circulating_supply: Option<f64>,
    pub total_supply: Option<f64>,
    pub max_supply: Option<f64>,
    pub ath: Option<f64>,
    pub atl: Option<f64>,
    pub ath_date: Option<DateTime<Utc>>,
    pub atl_date: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
}

/// A validated historical price point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub observed_at: DateTime<Utc>,
    pub price: f64,
    pub market_cap: Option<f64>,
    pub volume: Option<f64>,
}

/// A derived ratio that is either computed or explicitly undefined.
///
/// Undefined is reported instead of dividing by zero or inventing a default.
/// Serializes as a plain number or `null`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "Option<f64>", into = "Option<f64>")]
pub enum Metric {
    Value(f64),
    Undefined,
}

impl Metric {
    pub fn value(self) -> Option<f64> {
        match self {
            Self::Value(value) => Some(value),
            Self::Undefined => None,
        }
    }

    pub fn is_undefined(self) -> bool {
        matches!(self, Self::Undefined)
    }
}

impl From<Option<f64>> for Metric {
    fn from(value: Option<f64>) -> Self {
        match value {
            Some(value) => Self::Value(value),
            None => Self::Undefined,
        }
    }
}

impl From<Metric> for Option<f64> {
    fn from(metric: Metric) -> Self {
        metric.value()
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => write!(f, "{value:.4}"),
            Self::Undefined => f.write_str("undefined"),
        }
    }
}

/// Market snapshot extended with the metrics computed during enrichment.
///
/// # Fields
/// * `snapshot`: The validated source record
/// * `volatility_24h`: 24h high/low spread as a percentage of price
/// * `distance_from_ath`: `(ath - price) / ath`
/// * `distance_from_atl`: `(price - atl) / atl`
/// * `volume_to_market_cap`: 24h volume over market capitalisation
/// * `sma_short` / `sma_long`: simple moving averages, set only when enough
///   history exists to fill the whole window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub snapshot: MarketSnapshotRecord,
    pub volatility_24h: Metric,
    pub distance_from_ath: Metric,
    pub distance_from_atl: Metric,
    pub volume_to_market_cap: Metric,
    pub sma_short: Option<f64>,
    pub sma_long: Option<f64>,
}

/// Resampling interval for OHLC aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    Hourly,
    Daily,
}

impl Interval {
    pub const fn seconds(self) -> i64 {
        match self {
            Self::Hourly => 3_600,
            Self::Daily => 86_400,
        }
    }

    /// Start of the UTC bucket containing `at`.
    pub fn bucket_start(self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let width = self.seconds();
        let start = at.timestamp().div_euclid(width) * width;
        DateTime::from_timestamp(start, 0)
    }

    /// Start of the first bucket lying wholly at or after `at`: the bucket of
    /// `at` itself when `at` sits on its boundary, otherwise the next one.
    pub fn first_full_bucket(self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = self.bucket_start(at)?;
        if start == at {
            return Some(start);
        }
        start.checked_add_signed(Duration::seconds(self.seconds()))
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Open-High-Low-Close summary of one asset over one interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub asset_id: String,
    pub interval: Interval,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: Option<f64>,
    pub sma_short: Option<f64>,
    pub sma_long: Option<f64>,
}

/// Where a batch came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    Snapshot,
    Backfill,
}

impl SourceMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::Backfill => "backfill",
        }
    }
}

impl fmt::Display for SourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Records from one ingestion cycle, processed and persisted as a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T> {
    pub cycle_at: DateTime<Utc>,
    pub mode: SourceMode,
    pub records: Vec<T>,
}

impl<T> Batch<T> {
    pub fn new(cycle_at: DateTime<Utc>, mode: SourceMode, records: Vec<T>) -> Self {
        Self {
            cycle_at,
            mode,
            records,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// An enriched batch ready for the persistence gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedBatch {
    pub cycle_at: DateTime<Utc>,
    pub mode: SourceMode,
    pub records: Vec<EnrichedRecord>,
    pub candles: Vec<Candle>,
}

/// Previously stored closes per asset, oldest first.
///
/// Loaded once at the start of a cycle and only read during enrichment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriorContext {
    closes: BTreeMap<String, Vec<f64>>,
}

impl PriorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, asset_id: impl Into<String>, closes: Vec<f64>) {
        self.closes.insert(asset_id.into(), closes);
    }

    pub fn closes_for(&self, asset_id: &str) -> &[f64] {
        self.closes.get(asset_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.closes.values().all(Vec::is_empty)
    }
}

/// Canonical text form used for timestamps in storage and logs.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
