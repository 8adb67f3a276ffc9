use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use super::model::{
    Candle, EnrichedRecord, Interval, MarketSnapshotRecord, Metric, PricePoint, PriorContext,
};
use crate::data::model::format_timestamp;
use crate::error::EnrichmentError;

/// Computes derived metrics and aggregates on validated market data.
///
/// `DataProcessor` holds only configuration. History needed for moving
/// averages comes from the supplied [`PriorContext`] and from the batch
/// itself, so enriching the same input twice gives the same output.
///
/// # Key Features
/// * Volatility, distance from all-time extremes, volume/market cap ratio
/// * Simple moving averages over two configurable windows
/// * OHLC aggregation over hourly or daily buckets
#[derive(Debug, Clone)]
pub struct DataProcessor {
    short_window: usize,
    long_window: usize,
}

impl Default for DataProcessor {
    fn default() -> Self {
        Self::new(7, 30)
    }
}

impl DataProcessor {
    /// Creates a processor with the given moving-average windows.
    ///
    /// # Arguments
    /// * `short_window`: Points in the short simple moving average
    /// * `long_window`: Points in the long simple moving average
    pub fn new(short_window: usize, long_window: usize) -> Self {
        Self {
            short_window,
            long_window,
        }
    }

    /// Number of prior closes worth loading for one asset.
    pub fn history_depth(&self) -> usize {
        self.short_window.max(self.long_window)
    }

    /// Enriches a batch of validated records.
    ///
    /// Records keep their input order. Moving averages are sequenced per asset
    /// by observation time, after any prior closes in `prior`.
    ///
    /// # Errors
    /// Returns [`EnrichmentError`] when a record carries values validation
    /// should have rejected.
    pub fn enrich(
        &self,
        records: &[MarketSnapshotRecord],
        prior: Option<&PriorContext>,
    ) -> Result<Vec<EnrichedRecord>, EnrichmentError> {
        for (index, record) in records.iter().enumerate() {
            check_record(index, record)?;
        }

        let averages = self.moving_averages(records, prior);

        Ok(records
            .iter()
            .zip(averages)
            .map(|(record, (sma_short, sma_long))| EnrichedRecord {
                volatility_24h: volatility(record),
                distance_from_ath: distance_from_ath(record.current_price, record.ath),
                distance_from_atl: distance_from_atl(record.current_price, record.atl),
                volume_to_market_cap: volume_to_market_cap(record.total_volume, record.market_cap),
                sma_short,
                sma_long,
                snapshot: record.clone(),
            })
            .collect())
    }

    /// Aggregates one asset's price points into candles and attaches moving
    /// averages over candle closes.
    ///
    /// # Errors
    /// Returns [`EnrichmentError`] on negative or non-finite prices.
    pub fn build_candles(
        &self,
        asset_id: &str,
        points: &[PricePoint],
        interval: Interval,
        prior: Option<&PriorContext>,
    ) -> Result<Vec<Candle>, EnrichmentError> {
        let mut candles = aggregate_ohlc(asset_id, points, interval)?;

        let mut closes: Vec<f64> = prior
            .map(|context| context.closes_for(asset_id).to_vec())
            .unwrap_or_default();
        let offset = closes.len();
        closes.extend(candles.iter().map(|c| c.close));

        let short = simple_moving_average(&closes, self.short_window);
        let long = simple_moving_average(&closes, self.long_window);

        for (i, candle) in candles.iter_mut().enumerate() {
            candle.sma_short = short[offset + i];
            candle.sma_long = long[offset + i];
        }

        Ok(candles)
    }

    fn moving_averages(
        &self,
        records: &[MarketSnapshotRecord],
        prior: Option<&PriorContext>,
    ) -> Vec<(Option<f64>, Option<f64>)> {
        let mut by_asset: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (index, record) in records.iter().enumerate() {
            by_asset.entry(record.asset_id.as_str()).or_default().push(index);
        }

        let mut averages = vec![(None, None); records.len()];
        for (asset_id, mut indexes) in by_asset {
            indexes.sort_by_key(|&i| records[i].observed_at);

            let mut closes: Vec<f64> = prior
                .map(|context| context.closes_for(asset_id).to_vec())
                .unwrap_or_default();
            let offset = closes.len();
            closes.extend(indexes.iter().map(|&i| records[i].current_price));

            let short = simple_moving_average(&closes, self.short_window);
            let long = simple_moving_average(&closes, self.long_window);

            for (position, &index) in indexes.iter().enumerate() {
                averages[index] = (short[offset + position], long[offset + position]);
            }
        }

        averages
    }
}

/// Simple moving average where position `i` averages `values[i + 1 - window..=i]`.
///
/// Positions without a full window stay `None`; a zero window yields nothing.
pub fn simple_moving_average(values: &[f64], window: usize) -> Vec<Option<f64>> {
    let mut averages = vec![None; values.len()];
    if window == 0 || values.len() < window {
        return averages;
    }

    for (offset, slice) in values.windows(window).enumerate() {
        averages[offset + window - 1] = Some(slice.iter().sum::<f64>() / window as f64);
    }

    averages
}

/// Groups price points into interval buckets: open is the first price, high
/// the maximum, low the minimum and close the last, in chronological order.
///
/// Volume is the largest reported rolling 24h volume in the bucket. Empty
/// buckets are not synthesised.
///
/// # Errors
/// Returns [`EnrichmentError`] on negative or non-finite prices.
pub fn aggregate_ohlc(
    asset_id: &str,
    points: &[PricePoint],
    interval: Interval,
) -> Result<Vec<Candle>, EnrichmentError> {
    let mut ordered: Vec<&PricePoint> = points.iter().collect();
    ordered.sort_by_key(|p| p.observed_at);

    let mut candles: Vec<Candle> = Vec::new();
    for (index, point) in ordered.into_iter().enumerate() {
        check_numeric(index, asset_id, "price", point.price)?;
        let open_time = interval.bucket_start(point.observed_at).ok_or_else(|| {
            EnrichmentError::UnbucketableTimestamp {
                at: format_timestamp(point.observed_at),
                interval: interval.to_string(),
            }
        })?;

        match candles.last_mut() {
            Some(candle) if candle.open_time == open_time => {
                candle.high = candle.high.max(point.price);
                candle.low = candle.low.min(point.price);
                candle.close = point.price;
                candle.volume = max_option(candle.volume, point.volume);
            }
            _ => candles.push(Candle {
                asset_id: asset_id.to_string(),
                interval,
                open_time,
                open: point.price,
                high: point.price,
                low: point.price,
                close: point.price,
                volume: point.volume,
                sma_short: None,
                sma_long: None,
            }),
        }
    }

    Ok(candles)
}

/// 24h range relative to price, in percent; falls back to the magnitude of
/// the 24h change percentage.
pub fn volatility(record: &MarketSnapshotRecord) -> Metric {
    match (record.high_24h, record.low_24h) {
        (Some(high), Some(low)) if record.current_price > 0.0 => {
            Metric::Value((high - low) / record.current_price * 100.0)
        }
        _ => record
            .price_change_percentage_24h
            .map(f64::abs)
            .into(),
    }
}

pub fn distance_from_ath(price: f64, ath: Option<f64>) -> Metric {
    match ath {
        Some(ath) if ath != 0.0 => Metric::Value((ath - price) / ath),
        _ => Metric::Undefined,
    }
}

pub fn distance_from_atl(price: f64, atl: Option<f64>) -> Metric {
    match atl {
        Some(atl) if atl != 0.0 => Metric::Value((price - atl) / atl),
        _ => Metric::Undefined,
    }
}

pub fn volume_to_market_cap(volume: f64, market_cap: f64) -> Metric {
    if market_cap == 0.0 {
        Metric::Undefined
    } else {
        Metric::Value(volume / market_cap)
    }
}

fn max_option(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

fn check_record(index: usize, record: &MarketSnapshotRecord) -> Result<(), EnrichmentError> {
    if record.asset_id.trim().is_empty() {
        return Err(EnrichmentError::EmptyAssetId { index });
    }
    let asset = record.asset_id.as_str();
    check_numeric(index, asset, "current_price", record.current_price)?;
    check_numeric(index, asset, "market_cap", record.market_cap)?;
    check_numeric(index, asset, "total_volume", record.total_volume)?;

    let optional = [
        ("high_24h", record.high_24h),
        ("low_24h", record.low_24h),
        ("ath", record.ath),
        ("atl", record.atl),
    ];
    for (field, value) in optional {
        if let Some(value) = value {
            check_numeric(index, asset, field, value)?;
        }
    }
    Ok(())
}

fn check_numeric(
    index: usize,
    asset_id: &str,
    field: &'static str,
    value: f64,
) -> Result<(), EnrichmentError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(EnrichmentError::InvalidNumeric {
            index,
            asset_id: asset_id.to_string(),
            field,
            value,
        })
    }
}

/// Columns available to [`sort_by_metric`] and [`summary_statistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricColumn {
    CurrentPrice,
    MarketCap,
    TotalVolume,
    PriceChangePercentage24h,
    Volatility24h,
    DistanceFromAth,
    DistanceFromAtl,
    VolumeToMarketCap,
}

impl MetricColumn {
    pub const ALL: [MetricColumn; 8] = [
        Self::CurrentPrice,
        Self::MarketCap,
        Self::TotalVolume,
        Self::PriceChangePercentage24h,
        Self::Volatility24h,
        Self::DistanceFromAth,
        Self::DistanceFromAtl,
        Self::VolumeToMarketCap,
    ];

    pub fn extract(self, record: &EnrichedRecord) -> Option<f64> {
        let snapshot = &record.snapshot;
        match self {
            Self::CurrentPrice => Some(snapshot.current_price),
            Self::MarketCap => Some(snapshot.market_cap),
            Self::TotalVolume => Some(snapshot.total_volume),
            Self::PriceChangePercentage24h => snapshot.price_change_percentage_24h,
            Self::Volatility24h => record.volatility_24h.value(),
            Self::DistanceFromAth => record.distance_from_ath.value(),
            Self::DistanceFromAtl => record.distance_from_atl.value(),
            Self::VolumeToMarketCap => record.volume_to_market_cap.value(),
        }
    }
}

/// Descriptive statistics for one column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnSummary {
    pub column: MetricColumn,
    pub count: usize,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// Count, mean, sample standard deviation, min and max for every numeric
/// column. Undefined values are skipped, not counted as zero.
pub fn summary_statistics(records: &[EnrichedRecord]) -> Vec<ColumnSummary> {
    MetricColumn::ALL
        .iter()
        .map(|&column| {
            let values: Vec<f64> = records.iter().filter_map(|r| column.extract(r)).collect();
            let count = values.len();
            let mean = (count > 0).then(|| values.iter().sum::<f64>() / count as f64);
            let std = mean.filter(|_| count > 1).map(|mean| {
                let variance = values
                    .iter()
                    .map(|v| {
                        let diff = v - mean;
                        diff * diff
                    })
                    .sum::<f64>()
                    / (count - 1) as f64;
                variance.sqrt()
            });

            ColumnSummary {
                column,
                count,
                mean,
                std,
                min: values.iter().copied().reduce(f64::min),
                max: values.iter().copied().reduce(f64::max),
            }
        })
        .collect()
}

/// Keeps records whose market cap is at least `min_market_cap`.
pub fn filter_by_market_cap(records: &[EnrichedRecord], min_market_cap: f64) -> Vec<EnrichedRecord> {
    records
        .iter()
        .filter(|r| r.snapshot.market_cap >= min_market_cap)
        .cloned()
        .collect()
}

/// Sorts by a metric column; undefined values always sort last.
pub fn sort_by_metric(
    records: &[EnrichedRecord],
    column: MetricColumn,
    ascending: bool,
) -> Vec<EnrichedRecord> {
    let mut sorted = records.to_vec();
    sorted.sort_by(|a, b| match (column.extract(a), column.extract(b)) {
        (Some(x), Some(y)) => {
            let ordering = x.partial_cmp(&y).unwrap_or(Ordering::Equal);
            if ascending {
                ordering
            } else {
                ordering.reverse()
            }
        }
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
    sorted
}

/// Groups records by asset id, preserving input order within each group.
pub fn group_by_asset(records: &[EnrichedRecord]) -> HashMap<&str, Vec<&EnrichedRecord>> {
    let mut groups: HashMap<&str, Vec<&EnrichedRecord>> = HashMap::new();
    for record in records {
        groups
            .entry(record.snapshot.asset_id.as_str())
            .or_default()
            .push(record);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 31, hour, minute, 0).unwrap()
    }

    fn create_test_record(asset_id: &str, price: f64) -> MarketSnapshotRecord {
        MarketSnapshotRecord {
            asset_id: asset_id.to_string(),
            symbol: asset_id.to_uppercase(),
            name: asset_id.to_string(),
            current_price: price,
            market_cap: 1_000_000_000.0,
            total_volume: 50_000_000.0,
            market_cap_rank: Some(1),
            high_24h: Some(price * 1.02),
            low_24h: Some(price * 0.98),
            price_change_24h: None,
            price_change_percentage_24h: Some(1.5),
            circulating_supply: None,
            total_supply: None,
            max_supply: None,
            ath: Some(price * 2.0),
            atl: Some(price / 2.0),
            ath_date: None,
            atl_date: None,
            observed_at: at(12, 0),
        }
    }

    fn point(observed_at: DateTime<Utc>, price: f64) -> PricePoint {
        PricePoint {
            observed_at,
            price,
            market_cap: None,
            volume: None,
        }
    }

    #[test]
    fn computes_the_derived_metrics() {
        let mut record = create_test_record("bitcoin", 50_000.0);
        record.high_24h = Some(51_000.0);
        record.low_24h = Some(49_000.0);
        record.ath = Some(100_000.0);
        record.atl = Some(25_000.0);

        let enriched = DataProcessor::default().enrich(&[record], None).unwrap();
        let row = &enriched[0];

        assert!((row.volatility_24h.value().unwrap() - 4.0).abs() < 1e-12);
        assert_eq!(row.distance_from_ath, Metric::Value(0.5));
        assert_eq!(row.distance_from_atl, Metric::Value(1.0));
        assert_eq!(row.volume_to_market_cap, Metric::Value(0.05));
    }

    #[test]
    fn distance_from_ath_is_exact_at_and_half_the_high() {
        assert_eq!(distance_from_ath(69_000.0, Some(69_000.0)), Metric::Value(0.0));
        assert_eq!(distance_from_ath(34_500.0, Some(69_000.0)), Metric::Value(0.5));
        assert_eq!(distance_from_ath(10.0, None), Metric::Undefined);
        assert_eq!(distance_from_ath(10.0, Some(0.0)), Metric::Undefined);
        assert_eq!(distance_from_atl(67.81, Some(67.81)), Metric::Value(0.0));
        assert_eq!(distance_from_atl(10.0, None), Metric::Undefined);
    }

    #[test]
    fn zero_market_cap_gives_an_undefined_ratio() {
        let mut record = create_test_record("deadcoin", 0.0);
        record.market_cap = 0.0;
        record.total_volume = 0.0;

        let enriched = DataProcessor::default().enrich(&[record], None).unwrap();

        assert_eq!(enriched[0].volume_to_market_cap, Metric::Undefined);
        assert_eq!(volume_to_market_cap(0.0, 0.0), Metric::Undefined);
    }

    #[test]
    fn volatility_falls_back_to_change_percentage() {
        let mut record = create_test_record("bitcoin", 100.0);
        record.high_24h = None;
        record.price_change_percentage_24h = Some(-3.25);
        assert_eq!(volatility(&record), Metric::Value(3.25));

        record.price_change_percentage_24h = None;
        assert_eq!(volatility(&record), Metric::Undefined);

        record.current_price = 0.0;
        record.high_24h = Some(1.0);
        record.low_24h = Some(0.0);
        assert_eq!(volatility(&record), Metric::Undefined);
    }

    #[test]
    fn moving_average_needs_a_full_window() {
        assert_eq!(
            simple_moving_average(&[1.0, 2.0, 3.0, 4.0], 3),
            vec![None, None, Some(2.0), Some(3.0)]
        );
        assert_eq!(simple_moving_average(&[1.0, 2.0], 3), vec![None, None]);
        assert_eq!(simple_moving_average(&[1.0, 2.0], 0), vec![None, None]);
    }

    #[test]
    fn moving_average_is_exact_after_a_collapse() {
        let mut closes = vec![65_000.0; 40];
        closes.extend([0.1, 0.2, 0.3]);

        let averages = simple_moving_average(&closes, 3);

        assert_eq!(averages[42], Some((0.1 + 0.2 + 0.3) / 3.0));
        assert_eq!(averages[39], Some(65_000.0));
    }

    #[test]
    fn prior_context_seeds_moving_averages() {
        let processor = DataProcessor::new(3, 5);
        let mut prior = PriorContext::new();
        prior.insert("bitcoin", vec![10.0, 11.0, 12.0, 13.0]);

        let enriched = processor
            .enrich(&[create_test_record("bitcoin", 14.0)], Some(&prior))
            .unwrap();

        assert_eq!(enriched[0].sma_short, Some(13.0));
        assert_eq!(enriched[0].sma_long, Some(12.0));

        let without = processor
            .enrich(&[create_test_record("bitcoin", 14.0)], None)
            .unwrap();
        assert_eq!(without[0].sma_short, None);
    }

    #[test]
    fn moving_averages_follow_observation_order_per_asset() {
        let processor = DataProcessor::new(2, 3);
        let mut late = create_test_record("solana", 30.0);
        late.observed_at = at(14, 0);
        let mut early = create_test_record("solana", 10.0);
        early.observed_at = at(12, 0);
        let mut middle = create_test_record("solana", 20.0);
        middle.observed_at = at(13, 0);
        let other = create_test_record("bitcoin", 99.0);

        let enriched = processor
            .enrich(&[late, other, early, middle], None)
            .unwrap();

        assert_eq!(enriched[0].sma_short, Some(25.0));
        assert_eq!(enriched[0].sma_long, Some(20.0));
        assert_eq!(enriched[1].sma_short, None);
        assert_eq!(enriched[2].sma_short, None);
        assert_eq!(enriched[3].sma_short, Some(15.0));
    }

    #[test]
    fn enrichment_is_deterministic() {
        let processor = DataProcessor::new(2, 3);
        let records: Vec<MarketSnapshotRecord> = (0..6)
            .map(|i| {
                let mut record = create_test_record("ethereum", 2_000.0 + f64::from(i) * 17.5);
                record.observed_at = at(12, 0) + Duration::minutes(i64::from(i) * 5);
                record
            })
            .collect();
        let mut prior = PriorContext::new();
        prior.insert("ethereum", vec![1_990.0, 1_995.0]);

        let first = processor.enrich(&records, Some(&prior)).unwrap();
        let second = processor.enrich(&records, Some(&prior)).unwrap();

        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn contract_violations_surface_as_errors() {
        let mut record = create_test_record("bitcoin", 50_000.0);
        record.current_price = -1.0;
        let err = DataProcessor::default().enrich(&[record], None).unwrap_err();
        assert!(matches!(
            err,
            EnrichmentError::InvalidNumeric {
                field: "current_price",
                ..
            }
        ));

        let mut record = create_test_record("bitcoin", 50_000.0);
        record.atl = Some(f64::NAN);
        assert!(DataProcessor::default().enrich(&[record], None).is_err());

        let record = create_test_record(" ", 1.0);
        assert_eq!(
            DataProcessor::default().enrich(&[record], None).unwrap_err(),
            EnrichmentError::EmptyAssetId { index: 0 }
        );
    }

    #[test]
    fn ohlc_within_one_interval() {
        let points = vec![
            point(at(10, 5), 10.0),
            point(at(10, 20), 15.0),
            point(at(10, 35), 7.0),
            point(at(10, 50), 12.0),
        ];

        let candles = aggregate_ohlc("bitcoin", &points, Interval::Hourly).unwrap();

        assert_eq!(candles.len(), 1);
        let candle = &candles[0];
        assert_eq!(candle.open_time, at(10, 0));
        assert_eq!(
            (candle.open, candle.high, candle.low, candle.close),
            (10.0, 15.0, 7.0, 12.0)
        );
    }

    #[test]
    fn ohlc_orders_points_and_splits_intervals() {
        let mut points = vec![
            point(at(11, 30), 21.0),
            point(at(10, 0), 10.0),
            point(at(11, 0), 20.0),
            point(at(10, 59), 11.0),
        ];
        points[0].volume = Some(5.0);
        points[2].volume = Some(8.0);

        let candles = aggregate_ohlc("bitcoin", &points, Interval::Hourly).unwrap();

        assert_eq!(candles.len(), 2);
        assert_eq!((candles[0].open, candles[0].close), (10.0, 11.0));
        assert_eq!((candles[1].open, candles[1].close), (20.0, 21.0));
        assert_eq!(candles[0].volume, None);
        assert_eq!(candles[1].volume, Some(8.0));

        let daily = aggregate_ohlc("bitcoin", &points, Interval::Daily).unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!((daily[0].high, daily[0].low), (21.0, 10.0));
    }

    #[test]
    fn candles_carry_moving_averages_over_closes() {
        let points: Vec<PricePoint> = [1.0, 2.0, 3.0, 4.0]
            .iter()
            .enumerate()
            .map(|(i, &price)| point(at(8 + i as u32, 15), price))
            .collect();

        let candles = DataProcessor::new(3, 10)
            .build_candles("bitcoin", &points, Interval::Hourly, None)
            .unwrap();

        let smas: Vec<Option<f64>> = candles.iter().map(|c| c.sma_short).collect();
        assert_eq!(smas, vec![None, None, Some(2.0), Some(3.0)]);
        assert!(candles.iter().all(|c| c.sma_long.is_none()));
    }

    #[test]
    fn summary_skips_undefined_values() {
        let mut zero_cap = create_test_record("deadcoin", 1.0);
        zero_cap.market_cap = 0.0;
        let records = DataProcessor::default()
            .enrich(&[create_test_record("bitcoin", 10.0), zero_cap], None)
            .unwrap();

        let summary = summary_statistics(&records);
        let ratio = summary
            .iter()
            .find(|s| s.column == MetricColumn::VolumeToMarketCap)
            .unwrap();
        assert_eq!(ratio.count, 1);
        assert_eq!(ratio.std, None);

        let price = summary
            .iter()
            .find(|s| s.column == MetricColumn::CurrentPrice)
            .unwrap();
        assert_eq!(price.count, 2);
        assert_eq!(price.mean, Some(5.5));
        assert_eq!((price.min, price.max), (Some(1.0), Some(10.0)));
    }

    #[test]
    fn sorting_puts_undefined_last() {
        let mut zero_cap = create_test_record("deadcoin", 1.0);
        zero_cap.market_cap = 0.0;
        let mut busy = create_test_record("busy", 1.0);
        busy.total_volume = 900_000_000.0;
        let records = DataProcessor::default()
            .enrich(&[zero_cap, create_test_record("calm", 1.0), busy], None)
            .unwrap();

        let sorted = sort_by_metric(&records, MetricColumn::VolumeToMarketCap, false);
        let ids: Vec<&str> = sorted.iter().map(|r| r.snapshot.asset_id.as_str()).collect();
        assert_eq!(ids, vec!["busy", "calm", "deadcoin"]);

        let big = filter_by_market_cap(&records, 1.0);
        assert_eq!(big.len(), 2);
        assert_eq!(group_by_asset(&records).len(), 3);
    }
}
