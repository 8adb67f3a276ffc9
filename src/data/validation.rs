//! Field-level contracts applied to raw API payloads.
//!
//! Untyped JSON is converted into fixed-shape records here and nowhere else.
//! Batches are all-or-nothing: one bad record rejects the whole batch, with
//! every violation reported so the alert carries the full picture.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

use super::model::{MarketSnapshotRecord, PricePoint, RawPricePoint, RawRecord};

/// Why a field failed its contract.
#[derive(Debug, Clone, PartialEq)]
pub enum ViolationKind {
    NotAnObject,
    Missing,
    Empty,
    NotNumeric(String),
    NonFinite,
    Negative(f64),
    InvalidTimestamp(String),
    FutureTimestamp { at: String, ingested_at: String },
    DuplicateKey,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAnObject => f.write_str("record is not a JSON object"),
            Self::Missing => f.write_str("required field missing"),
            Self::Empty => f.write_str("must not be empty"),
            Self::NotNumeric(raw) => write!(f, "not numeric: {raw}"),
            Self::NonFinite => f.write_str("not a finite number"),
            Self::Negative(value) => write!(f, "negative value {value}"),
            Self::InvalidTimestamp(raw) => write!(f, "unparsable timestamp {raw}"),
            Self::FutureTimestamp { at, ingested_at } => {
                write!(f, "timestamp {at} is after ingestion time {ingested_at}")
            }
            Self::DuplicateKey => f.write_str("duplicate (asset, timestamp) in batch"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldViolation {
    pub record_index: usize,
    pub asset_id: Option<String>,
    pub field: String,
    pub kind: ViolationKind,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "record {} ({}): {}: {}",
            self.record_index,
            self.asset_id.as_deref().unwrap_or("?"),
            self.field,
            self.kind
        )
    }
}

/// A rejected record or batch.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{} violation(s), first: {}", .violations.len(), first_violation(.violations))]
pub struct ValidationError {
    pub violations: Vec<FieldViolation>,
}

fn first_violation(violations: &[FieldViolation]) -> String {
    violations
        .first()
        .map(ToString::to_string)
        .unwrap_or_else(|| "none".to_string())
}

impl ValidationError {
    /// Indexes of the records that failed, in order, without repeats.
    pub fn rejected_indexes(&self) -> Vec<usize> {
        let mut indexes: Vec<usize> = self.violations.iter().map(|v| v.record_index).collect();
        indexes.dedup();
        indexes
    }
}

const NON_NEGATIVE_OPTIONAL: [&str; 7] = [
    "high_24h",
    "low_24h",
    "circulating_supply",
    "total_supply",
    "max_supply",
    "ath",
    "atl",
];

/// Checks raw payloads against the market data contract.
#[derive(Debug, Clone)]
pub struct SchemaValidator {
    max_clock_skew: Duration,
}

impl Default for SchemaValidator {
    fn default() -> Self {
        Self::new(Duration::zero())
    }
}

impl SchemaValidator {
    pub fn new(max_clock_skew: Duration) -> Self {
        Self { max_clock_skew }
    }

    /// Validates one market record.
    ///
    /// # Errors
    /// Returns every violation found in the record.
    pub fn validate(
        &self,
        raw: &RawRecord,
        ingested_at: DateTime<Utc>,
    ) -> Result<MarketSnapshotRecord, ValidationError> {
        let mut violations = Vec::new();
        let record = self.check_record(0, raw, ingested_at, &mut violations);
        match record {
            Some(record) if violations.is_empty() => Ok(record),
            _ => Err(ValidationError { violations }),
        }
    }

    /// Validates a whole batch of market records, failing closed.
    ///
    /// # Errors
    /// Returns the violations of every failing record; no record is returned
    /// when any of them fails.
    pub fn validate_batch(
        &self,
        raws: &[Value],
        ingested_at: DateTime<Utc>,
    ) -> Result<Vec<MarketSnapshotRecord>, ValidationError> {
        let mut violations = Vec::new();
        let mut records = Vec::with_capacity(raws.len());
        let mut seen = HashSet::new();

        for (index, raw) in raws.iter().enumerate() {
            let Some(object) = raw.as_object() else {
                violations.push(violation(index, None, "<record>", ViolationKind::NotAnObject));
                continue;
            };

            if let Some(record) = self.check_record(index, object, ingested_at, &mut violations) {
                if !seen.insert((record.asset_id.clone(), record.observed_at)) {
                    violations.push(violation(
                        index,
                        Some(&record.asset_id),
                        "id",
                        ViolationKind::DuplicateKey,
                    ));
                    continue;
                }
                records.push(record);
            }
        }

        if violations.is_empty() {
            Ok(records)
        } else {
            Err(ValidationError { violations })
        }
    }

    /// Validates the historical series of one asset, failing closed.
    ///
    /// # Errors
    /// Returns every point that has a missing or negative price, a negative
    /// market cap or volume, or an impossible timestamp.
    pub fn validate_history(
        &self,
        asset_id: &str,
        points: &[RawPricePoint],
        ingested_at: DateTime<Utc>,
    ) -> Result<Vec<PricePoint>, ValidationError> {
        let mut violations = Vec::new();
        let mut validated = Vec::with_capacity(points.len());
        let asset = Some(asset_id);

        if asset_id.trim().is_empty() {
            violations.push(violation(0, None, "id", ViolationKind::Empty));
        }

        for (index, point) in points.iter().enumerate() {
            let before = violations.len();

            let observed_at = match DateTime::from_timestamp_millis(point.timestamp_ms) {
                Some(at) => {
                    self.check_not_future(index, asset, "timestamp", at, ingested_at, &mut violations);
                    Some(at)
                }
                None => {
                    violations.push(violation(
                        index,
                        asset,
                        "timestamp",
                        ViolationKind::InvalidTimestamp(point.timestamp_ms.to_string()),
                    ));
                    None
                }
            };

            let price = match point.price {
                Some(price) => check_non_negative(index, asset, "price", price, &mut violations),
                None => {
                    violations.push(violation(index, asset, "price", ViolationKind::Missing));
                    None
                }
            };
            let market_cap = point
                .market_cap
                .and_then(|v| check_non_negative(index, asset, "market_cap", v, &mut violations));
            let volume = point
                .total_volume
                .and_then(|v| check_non_negative(index, asset, "total_volume", v, &mut violations));

            if violations.len() != before {
                continue;
            }
            if let (Some(observed_at), Some(price)) = (observed_at, price) {
                validated.push(PricePoint {
                    observed_at,
                    price,
                    market_cap,
                    volume,
                });
            }
        }

        if violations.is_empty() {
            Ok(validated)
        } else {
            Err(ValidationError { violations })
        }
    }

    fn check_record(
        &self,
        index: usize,
        raw: &RawRecord,
        ingested_at: DateTime<Utc>,
        violations: &mut Vec<FieldViolation>,
    ) -> Option<MarketSnapshotRecord> {
        let before = violations.len();

        let asset_id = required_string(index, None, raw, "id", violations);
        let asset = asset_id.as_deref();
        let symbol = required_string(index, asset, raw, "symbol", violations);
        let name = required_string(index, asset, raw, "name", violations);

        let current_price = required_non_negative(index, asset, raw, "current_price", violations);
        let market_cap = required_non_negative(index, asset, raw, "market_cap", violations);
        let total_volume = required_non_negative(index, asset, raw, "total_volume", violations);

        let observed_at = match raw.get("last_updated") {
            None | Some(Value::Null) => {
                violations.push(violation(index, asset, "last_updated", ViolationKind::Missing));
                None
            }
            Some(value) => match parse_timestamp(value) {
                Some(at) => {
                    self.check_not_future(index, asset, "last_updated", at, ingested_at, violations);
                    Some(at)
                }
                None => {
                    violations.push(violation(
                        index,
                        asset,
                        "last_updated",
                        ViolationKind::InvalidTimestamp(value.to_string()),
                    ));
                    None
                }
            },
        };

        let mut optional = [None; NON_NEGATIVE_OPTIONAL.len()];
        for (slot, field) in optional.iter_mut().zip(NON_NEGATIVE_OPTIONAL) {
            *slot = optional_number(index, asset, raw, field, violations)
                .and_then(|v| check_non_negative(index, asset, field, v, violations));
        }
        let [high_24h, low_24h, circulating_supply, total_supply, max_supply, ath, atl] = optional;
        let ath_date = optional_timestamp(index, asset, raw, "ath_date", violations);
        let atl_date = optional_timestamp(index, asset, raw, "atl_date", violations);

        let price_change_24h = optional_number(index, asset, raw, "price_change_24h", violations);
        let price_change_percentage_24h =
            optional_number(index, asset, raw, "price_change_percentage_24h", violations);
        let market_cap_rank = optional_number(index, asset, raw, "market_cap_rank", violations)
            .and_then(|rank| {
                if rank >= 0.0 && rank <= f64::from(u32::MAX) && rank.fract() == 0.0 {
                    Some(rank as u32)
                } else {
                    violations.push(violation(
                        index,
                        asset,
                        "market_cap_rank",
                        ViolationKind::NotNumeric(rank.to_string()),
                    ));
                    None
                }
            });

        if violations.len() != before {
            return None;
        }

        Some(MarketSnapshotRecord {
            asset_id: asset_id?,
            symbol: symbol?.to_uppercase(),
            name: name?,
            current_price: current_price?,
            market_cap: market_cap?,
            total_volume: total_volume?,
            market_cap_rank,
            high_24h,
            low_24h,
            price_change_24h,
            price_change_percentage_24h,
            circulating_supply,
            total_supply,
            max_supply,
            ath,
            atl,
            ath_date,
            atl_date,
            observed_at: observed_at?,
        })
    }

    fn check_not_future(
        &self,
        index: usize,
        asset: Option<&str>,
        field: &str,
        at: DateTime<Utc>,
        ingested_at: DateTime<Utc>,
        violations: &mut Vec<FieldViolation>,
    ) {
        if at > ingested_at + self.max_clock_skew {
            violations.push(violation(
                index,
                asset,
                field,
                ViolationKind::FutureTimestamp {
                    at: at.to_rfc3339(),
                    ingested_at: ingested_at.to_rfc3339(),
                },
            ));
        }
    }
}

fn violation(index: usize, asset: Option<&str>, field: &str, kind: ViolationKind) -> FieldViolation {
    FieldViolation {
        record_index: index,
        asset_id: asset.map(str::to_string),
        field: field.to_string(),
        kind,
    }
}

fn required_string(
    index: usize,
    asset: Option<&str>,
    raw: &RawRecord,
    field: &str,
    violations: &mut Vec<FieldViolation>,
) -> Option<String> {
    match raw.get(field) {
        None | Some(Value::Null) => {
            violations.push(violation(index, asset, field, ViolationKind::Missing));
            None
        }
        Some(Value::String(s)) if s.trim().is_empty() => {
            violations.push(violation(index, asset, field, ViolationKind::Empty));
            None
        }
        Some(Value::String(s)) => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(other) => {
            violations.push(violation(
                index,
                asset,
                field,
                ViolationKind::NotNumeric(other.to_string()),
            ));
            None
        }
    }
}

fn required_non_negative(
    index: usize,
    asset: Option<&str>,
    raw: &RawRecord,
    field: &str,
    violations: &mut Vec<FieldViolation>,
) -> Option<f64> {
    if matches!(raw.get(field), None | Some(Value::Null)) {
        violations.push(violation(index, asset, field, ViolationKind::Missing));
        return None;
    }
    optional_number(index, asset, raw, field, violations)
        .and_then(|value| check_non_negative(index, asset, field, value, violations))
}

/// Reads a numeric field that may be a JSON number or a numeric string.
/// Absent or null yields `None` without a violation.
fn optional_number(
    index: usize,
    asset: Option<&str>,
    raw: &RawRecord,
    field: &str,
    violations: &mut Vec<FieldViolation>,
) -> Option<f64> {
    let value = match raw.get(field)? {
        Value::Null => return None,
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match value {
        Some(v) if v.is_finite() => Some(v),
        Some(_) => {
            violations.push(violation(index, asset, field, ViolationKind::NonFinite));
            None
        }
        None => {
            let raw_text = raw.get(field).map(Value::to_string).unwrap_or_default();
            violations.push(violation(index, asset, field, ViolationKind::NotNumeric(raw_text)));
            None
        }
    }
}

fn check_non_negative(
    index: usize,
    asset: Option<&str>,
    field: &str,
    value: f64,
    violations: &mut Vec<FieldViolation>,
) -> Option<f64> {
    if !value.is_finite() {
        violations.push(violation(index, asset, field, ViolationKind::NonFinite));
        None
    } else if value < 0.0 {
        violations.push(violation(index, asset, field, ViolationKind::Negative(value)));
        None
    } else {
        Some(value)
    }
}

/// Absent or null yields `None`; anything present must parse.
fn optional_timestamp(
    index: usize,
    asset: Option<&str>,
    raw: &RawRecord,
    field: &str,
    violations: &mut Vec<FieldViolation>,
) -> Option<DateTime<Utc>> {
    let value = raw.get(field).filter(|v| !v.is_null())?;
    let parsed = parse_timestamp(value);
    if parsed.is_none() {
        violations.push(violation(
            index,
            asset,
            field,
            ViolationKind::InvalidTimestamp(value.to_string()),
        ));
    }
    parsed
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|at| at.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}
