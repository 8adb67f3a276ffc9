//! DuckDB-backed persistence for enriched snapshots and candles.
//!
//! Timestamps are stored as RFC 3339 text with millisecond precision and a
//! `Z` suffix, so lexical order is chronological order.

use chrono::{DateTime, Duration, Utc};
use duckdb::types::Type;
use duckdb::{params, Connection, Row};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use crate::data::model::{
    format_timestamp, Candle, EnrichedBatch, EnrichedRecord, Interval, MarketSnapshotRecord,
    PriorContext,
};
use crate::error::StorageError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS market_snapshots (
    asset_id VARCHAR NOT NULL,
    observed_at VARCHAR NOT NULL,
    symbol VARCHAR NOT NULL,
    name VARCHAR NOT NULL,
    current_price DOUBLE NOT NULL,
    market_cap DOUBLE NOT NULL,
    total_volume DOUBLE NOT NULL,
    market_cap_rank BIGINT,
    high_24h DOUBLE,
    low_24h DOUBLE,
    price_change_24h DOUBLE,
    price_change_percentage_24h DOUBLE,
    circulating_supply DOUBLE,
    total_supply DOUBLE,
    max_supply DOUBLE,
    ath DOUBLE,
    atl DOUBLE,
    ath_date VARCHAR,
    atl_date VARCHAR,
    volatility_24h DOUBLE,
    distance_from_ath DOUBLE,
    distance_from_atl DOUBLE,
    volume_to_market_cap DOUBLE,
    sma_short DOUBLE,
    sma_long DOUBLE,
    source_mode VARCHAR NOT NULL,
    collected_at VARCHAR NOT NULL,
    PRIMARY KEY (asset_id, observed_at)
);

CREATE TABLE IF NOT EXISTS ohlc_candles (
    asset_id VARCHAR NOT NULL,
    candle_interval VARCHAR NOT NULL,
    open_time VARCHAR NOT NULL,
    open DOUBLE NOT NULL,
    high DOUBLE NOT NULL,
    low DOUBLE NOT NULL,
    close DOUBLE NOT NULL,
    volume DOUBLE,
    sma_short DOUBLE,
    sma_long DOUBLE,
    collected_at VARCHAR NOT NULL,
    PRIMARY KEY (asset_id, candle_interval, open_time)
);
";

const SNAPSHOT_COLUMNS: &str = "asset_id, observed_at, symbol, name, current_price, market_cap, \
     total_volume, market_cap_rank, high_24h, low_24h, price_change_24h, \
     price_change_percentage_24h, circulating_supply, total_supply, max_supply, ath, atl, \
     volatility_24h, distance_from_ath, distance_from_atl, volume_to_market_cap, sma_short, sma_long, \
     ath_date, atl_date";

/// Rows written by one [`BatchGateway::persist`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistReport {
    pub records_written: usize,
    pub candles_written: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStatistics {
    pub snapshot_rows: u64,
    pub candle_rows: u64,
    pub distinct_assets: u64,
    pub first_observed_at: Option<String>,
    pub last_observed_at: Option<String>,
}

/// What the pipeline needs from persistence.
pub trait BatchGateway: Send + Sync {
    /// Writes a whole batch atomically; re-writing a key replaces the row.
    fn persist(&self, batch: &EnrichedBatch) -> Result<PersistReport, StorageError>;

    /// Up to `depth` stored snapshot prices per asset, oldest first, strictly
    /// before that asset's cutoff.
    fn load_prior_closes(
        &self,
        cutoffs: &BTreeMap<String, DateTime<Utc>>,
        depth: usize,
    ) -> Result<PriorContext, StorageError>;

    /// Same as [`Self::load_prior_closes`] over stored candle closes.
    fn load_prior_candle_closes(
        &self,
        cutoffs: &BTreeMap<String, DateTime<Utc>>,
        interval: Interval,
        depth: usize,
    ) -> Result<PriorContext, StorageError>;
}

/// Embedded analytical store keyed by (asset id, observation time).
pub struct MarketStore {
    path: PathBuf,
    connection: Mutex<Connection>,
}

impl MarketStore {
    /// Opens or creates the database file and its schema.
    ///
    /// # Errors
    /// Returns [`StorageError`] if the parent directory cannot be created or
    /// the database cannot be opened.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let connection = Connection::open(&path)?;
        connection.execute_batch("PRAGMA disable_progress_bar;")?;
        connection.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "opened market store");

        Ok(Self {
            path,
            connection: Mutex::new(connection),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Most recent snapshot rows across all assets, newest first.
    pub fn latest(&self, limit: usize) -> Result<Vec<EnrichedRecord>, StorageError> {
        let connection = self.lock();
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM market_snapshots \
             ORDER BY observed_at DESC, asset_id LIMIT ?"
        );
        let mut statement = connection.prepare(&sql)?;
        let rows = statement.query_map(params![limit as i64], enriched_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Rows written by the most recent collection cycle, largest market cap first.
    pub fn latest_cycle(&self) -> Result<Vec<EnrichedRecord>, StorageError> {
        let connection = self.lock();
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM market_snapshots \
             WHERE collected_at = (SELECT MAX(collected_at) FROM market_snapshots) \
             ORDER BY market_cap DESC, asset_id"
        );
        let mut statement = connection.prepare(&sql)?;
        let rows = statement.query_map([], enriched_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Snapshot rows of one asset from the last `days` days, oldest first.
    pub fn asset_history(
        &self,
        asset_id: &str,
        days: u32,
    ) -> Result<Vec<EnrichedRecord>, StorageError> {
        let since = format_timestamp(days_ago(days));
        let connection = self.lock();
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM market_snapshots \
             WHERE asset_id = ? AND observed_at >= ? ORDER BY observed_at"
        );
        let mut statement = connection.prepare(&sql)?;
        let rows = statement.query_map(params![asset_id, since], enriched_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Latest row per asset, largest market cap first.
    pub fn top_by_market_cap(&self, limit: usize) -> Result<Vec<EnrichedRecord>, StorageError> {
        let connection = self.lock();
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM ( \
                 SELECT *, ROW_NUMBER() OVER (PARTITION BY asset_id ORDER BY observed_at DESC) AS rn \
                 FROM market_snapshots \
             ) WHERE rn = 1 ORDER BY market_cap DESC, asset_id LIMIT ?"
        );
        let mut statement = connection.prepare(&sql)?;
        let rows = statement.query_map(params![limit as i64], enriched_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Latest row per asset whose absolute 24h change is at least `min_abs_pct`,
    /// biggest movers first.
    pub fn price_changes(&self, min_abs_pct: f64) -> Result<Vec<EnrichedRecord>, StorageError> {
        let connection = self.lock();
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM ( \
                 SELECT *, ROW_NUMBER() OVER (PARTITION BY asset_id ORDER BY observed_at DESC) AS rn \
                 FROM market_snapshots \
             ) WHERE rn = 1 AND ABS(price_change_percentage_24h) >= ? \
             ORDER BY ABS(price_change_percentage_24h) DESC, asset_id"
        );
        let mut statement = connection.prepare(&sql)?;
        let rows = statement.query_map(params![min_abs_pct], enriched_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Stored candles of one asset and interval, oldest first.
    pub fn candles(&self, asset_id: &str, interval: Interval) -> Result<Vec<Candle>, StorageError> {
        let connection = self.lock();
        let mut statement = connection.prepare(
            "SELECT asset_id, open_time, open, high, low, close, volume, sma_short, sma_long \
             FROM ohlc_candles WHERE asset_id = ? AND candle_interval = ? ORDER BY open_time",
        )?;
        let rows = statement.query_map(params![asset_id, interval.as_str()], |row| {
            Ok(Candle {
                asset_id: row.get(0)?,
                interval,
                open_time: timestamp_at(row, 1)?,
                open: row.get(2)?,
                high: row.get(3)?,
                low: row.get(4)?,
                close: row.get(5)?,
                volume: row.get(6)?,
                sma_short: row.get(7)?,
                sma_long: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn statistics(&self) -> Result<StoreStatistics, StorageError> {
        let connection = self.lock();
        let (snapshot_rows, distinct_assets, first_observed_at, last_observed_at) = connection
            .query_row(
                "SELECT COUNT(*), COUNT(DISTINCT asset_id), MIN(observed_at), MAX(observed_at) \
                 FROM market_snapshots",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )?;
        let candle_rows: i64 =
            connection.query_row("SELECT COUNT(*) FROM ohlc_candles", [], |row| row.get(0))?;

        Ok(StoreStatistics {
            snapshot_rows: snapshot_rows.max(0) as u64,
            candle_rows: candle_rows.max(0) as u64,
            distinct_assets: distinct_assets.max(0) as u64,
            first_observed_at,
            last_observed_at,
        })
    }

    /// Deletes snapshots and candles older than `days` days.
    pub fn delete_older_than(&self, days: u32) -> Result<usize, StorageError> {
        self.delete_before(days_ago(days))
    }

    /// Deletes snapshots observed, and candles opened, before `cutoff`.
    pub fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let cutoff = format_timestamp(cutoff);
        let connection = self.lock();
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<usize, StorageError> {
            let snapshots = connection.execute(
                "DELETE FROM market_snapshots WHERE observed_at < ?",
                params![cutoff],
            )?;
            let candles = connection
                .execute("DELETE FROM ohlc_candles WHERE open_time < ?", params![cutoff])?;
            Ok(snapshots + candles)
        })();

        let deleted = finalize_transaction(&connection, result)?;
        info!(deleted, cutoff = %cutoff, "pruned old market data");
        Ok(deleted)
    }

    /// Flushes the write-ahead log into the database file.
    pub fn checkpoint(&self) -> Result<(), StorageError> {
        self.lock().execute_batch("CHECKPOINT")?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_closes(
        &self,
        sql: &str,
        cutoffs: &BTreeMap<String, DateTime<Utc>>,
        interval: Option<Interval>,
        depth: usize,
    ) -> Result<PriorContext, StorageError> {
        let mut context = PriorContext::new();
        if depth == 0 {
            return Ok(context);
        }

        let connection = self.lock();
        let mut statement = connection.prepare(sql)?;
        for (asset_id, cutoff) in cutoffs {
            let cutoff = format_timestamp(*cutoff);
            let rows = match interval {
                Some(interval) => statement.query_map(
                    params![asset_id, interval.as_str(), cutoff, depth as i64],
                    first_f64,
                )?,
                None => statement.query_map(params![asset_id, cutoff, depth as i64], first_f64)?,
            };
            let mut closes = rows.collect::<Result<Vec<_>, _>>()?;
            closes.reverse();
            if !closes.is_empty() {
                context.insert(asset_id.clone(), closes);
            }
        }
        Ok(context)
    }
}

impl BatchGateway for MarketStore {
    fn persist(&self, batch: &EnrichedBatch) -> Result<PersistReport, StorageError> {
        let collected_at = format_timestamp(batch.cycle_at);
        let mode = batch.mode.as_str();

        let connection = self.lock();
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<PersistReport, StorageError> {
            let mut report = PersistReport::default();

            for record in &batch.records {
                let s = &record.snapshot;
                connection.execute(
                    "INSERT OR REPLACE INTO market_snapshots ( \
                         asset_id, observed_at, symbol, name, current_price, market_cap, \
                         total_volume, market_cap_rank, high_24h, low_24h, price_change_24h, \
                         price_change_percentage_24h, circulating_supply, total_supply, \
                         max_supply, ath, atl, volatility_24h, distance_from_ath, \
                         distance_from_atl, volume_to_market_cap, sma_short, sma_long, \
                         ath_date, atl_date, source_mode, collected_at \
                     ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    params![
                        s.asset_id,
                        format_timestamp(s.observed_at),
                        s.symbol,
                        s.name,
                        s.current_price,
                        s.market_cap,
                        s.total_volume,
                        s.market_cap_rank.map(i64::from),
                        s.high_24h,
                        s.low_24h,
                        s.price_change_24h,
                        s.price_change_percentage_24h,
                        s.circulating_supply,
                        s.total_supply,
                        s.max_supply,
                        s.ath,
                        s.atl,
                        record.volatility_24h.value(),
                        record.distance_from_ath.value(),
                        record.distance_from_atl.value(),
                        record.volume_to_market_cap.value(),
                        record.sma_short,
                        record.sma_long,
                        s.ath_date.map(format_timestamp),
                        s.atl_date.map(format_timestamp),
                        mode,
                        collected_at,
                    ],
                )?;
                report.records_written += 1;
            }

            for candle in &batch.candles {
                connection.execute(
                    "INSERT OR REPLACE INTO ohlc_candles ( \
                         asset_id, candle_interval, open_time, open, high, low, close, volume, \
                         sma_short, sma_long, collected_at \
                     ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    params![
                        candle.asset_id,
                        candle.interval.as_str(),
                        format_timestamp(candle.open_time),
                        candle.open,
                        candle.high,
                        candle.low,
                        candle.close,
                        candle.volume,
                        candle.sma_short,
                        candle.sma_long,
                        collected_at,
                    ],
                )?;
                report.candles_written += 1;
            }

            Ok(report)
        })();

        let report = finalize_transaction(&connection, result)?;
        info!(
            mode,
            records = report.records_written,
            candles = report.candles_written,
            "persisted batch"
        );
        Ok(report)
    }

    fn load_prior_closes(
        &self,
        cutoffs: &BTreeMap<String, DateTime<Utc>>,
        depth: usize,
    ) -> Result<PriorContext, StorageError> {
        self.load_closes(
            "SELECT current_price FROM market_snapshots \
             WHERE asset_id = ? AND observed_at < ? ORDER BY observed_at DESC LIMIT ?",
            cutoffs,
            None,
            depth,
        )
    }

    fn load_prior_candle_closes(
        &self,
        cutoffs: &BTreeMap<String, DateTime<Utc>>,
        interval: Interval,
        depth: usize,
    ) -> Result<PriorContext, StorageError> {
        self.load_closes(
            "SELECT close FROM ohlc_candles \
             WHERE asset_id = ? AND candle_interval = ? AND open_time < ? \
             ORDER BY open_time DESC LIMIT ?",
            cutoffs,
            Some(interval),
            depth,
        )
    }
}

/// Commits on success, rolls back on failure.
fn finalize_transaction<T>(
    connection: &Connection,
    result: Result<T, StorageError>,
) -> Result<T, StorageError> {
    match result {
        Ok(value) => {
            connection.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(error) => {
            let _ = connection.execute_batch("ROLLBACK");
            Err(error)
        }
    }
}

/// `days` before now, clamped to the earliest representable instant.
fn days_ago(days: u32) -> DateTime<Utc> {
    Utc::now()
        .checked_sub_signed(Duration::days(i64::from(days)))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn first_f64(row: &Row<'_>) -> duckdb::Result<f64> {
    row.get(0)
}

fn timestamp_at(row: &Row<'_>, index: usize) -> duckdb::Result<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| duckdb::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e)))
}

fn optional_timestamp_at(row: &Row<'_>, index: usize) -> duckdb::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(index)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|at| at.with_timezone(&Utc))
            .map_err(|e| duckdb::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn enriched_from_row(row: &Row<'_>) -> duckdb::Result<EnrichedRecord> {
    let rank: Option<i64> = row.get(7)?;
    let snapshot = MarketSnapshotRecord {
        asset_id: row.get(0)?,
        observed_at: timestamp_at(row, 1)?,
        symbol: row.get(2)?,
        name: row.get(3)?,
        current_price: row.get(4)?,
        market_cap: row.get(5)?,
        total_volume: row.get(6)?,
        market_cap_rank: rank.and_then(|r| u32::try_from(r).ok()),
        high_24h: row.get(8)?,
        low_24h: row.get(9)?,
        price_change_24h: row.get(10)?,
        price_change_percentage_24h: row.get(11)?,
        circulating_supply: row.get(12)?,
        total_supply: row.get(13)?,
        max_supply: row.get(14)?,
        ath: row.get(15)?,
        atl: row.get(16)?,
        ath_date: optional_timestamp_at(row, 23)?,
        atl_date: optional_timestamp_at(row, 24)?,
    };

    Ok(EnrichedRecord {
        snapshot,
        volatility_24h: row.get::<_, Option<f64>>(17)?.into(),
        distance_from_ath: row.get::<_, Option<f64>>(18)?.into(),
        distance_from_atl: row.get::<_, Option<f64>>(19)?.into(),
        volume_to_market_cap: row.get::<_, Option<f64>>(20)?.into(),
        sma_short: row.get(21)?,
        sma_long: row.get(22)?,
    })
}
