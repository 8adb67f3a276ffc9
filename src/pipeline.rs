//! One ingestion cycle: fetch, validate, enrich, persist.
//!
//! Stages run strictly in that order and a failing stage stops the cycle
//! before anything reaches storage.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::alert::{AlertContext, AlertSink};
use crate::config::PipelineConfig;
use crate::data::model::{Batch, EnrichedBatch, Interval, PricePoint, SourceMode};
use crate::data::validation::{SchemaValidator, ValidationError};
use crate::data::{DataProcessor, MarketDataClient};
use crate::error::PipelineError;
use crate::storage::{BatchGateway, PersistReport};

/// How a cycle ended when nothing went wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Persisted(PersistReport),
    /// The API returned no data; an alert was raised and nothing was written.
    Empty { mode: SourceMode },
}

pub struct Pipeline {
    client: MarketDataClient,
    validator: SchemaValidator,
    processor: DataProcessor,
    gateway: Arc<dyn BatchGateway>,
    alerts: Arc<dyn AlertSink>,
}

impl Pipeline {
    pub fn new(
        client: MarketDataClient,
        validator: SchemaValidator,
        processor: DataProcessor,
        gateway: Arc<dyn BatchGateway>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            client,
            validator,
            processor,
            gateway,
            alerts,
        }
    }

    pub fn from_config(
        client: MarketDataClient,
        config: &PipelineConfig,
        gateway: Arc<dyn BatchGateway>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self::new(
            client,
            SchemaValidator::new(config.max_clock_skew),
            DataProcessor::new(config.sma_short_window, config.sma_long_window),
            gateway,
            alerts,
        )
    }

    /// Collects the current top `limit` assets and stores them enriched.
    ///
    /// # Errors
    /// Returns the first failing stage. A rejected batch also raises an alert.
    pub async fn run_snapshot_cycle(
        &self,
        limit: u32,
        currency: &str,
    ) -> Result<CycleOutcome, PipelineError> {
        let mode = SourceMode::Snapshot;
        let cycle_at = Utc::now();
        info!(limit, currency, "starting snapshot cycle");

        let raws = self.client.fetch_top_assets(limit, currency).await?;
        if raws.is_empty() {
            return Ok(self.empty_cycle(mode, limit));
        }

        let values: Vec<Value> = raws.into_iter().map(Value::Object).collect();
        let batch = self
            .validator
            .validate_batch(&values, cycle_at)
            .map(|records| Batch::new(cycle_at, mode, records))
            .map_err(|err| self.rejected(mode, values.len(), err))?;
        debug!(records = batch.len(), "batch validated");

        let mut cutoffs: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();
        for record in &batch.records {
            cutoffs
                .entry(record.asset_id.clone())
                .and_modify(|at| *at = (*at).min(record.observed_at))
                .or_insert(record.observed_at);
        }
        let prior = self
            .gateway
            .load_prior_closes(&cutoffs, self.processor.history_depth())?;

        let enriched = self.processor.enrich(&batch.records, Some(&prior))?;
        let report = self.gateway.persist(&EnrichedBatch {
            cycle_at: batch.cycle_at,
            mode: batch.mode,
            records: enriched,
            candles: Vec::new(),
        })?;

        info!(records = report.records_written, "snapshot cycle complete");
        Ok(CycleOutcome::Persisted(report))
    }

    /// Rebuilds `days` of candles for the top `limit` assets.
    ///
    /// Histories are fetched one asset at a time under the client's pacing
    /// budget; every history is validated before any candle is built.
    ///
    /// # Errors
    /// Returns the first failing stage. A rejected history also raises an alert.
    pub async fn run_backfill_cycle(
        &self,
        limit: u32,
        days: u32,
        interval: Interval,
    ) -> Result<CycleOutcome, PipelineError> {
        let mode = SourceMode::Backfill;
        let cycle_at = Utc::now();
        info!(limit, days, %interval, "starting backfill cycle");

        let currency = self.client.config().vs_currency.clone();
        let raws = self.client.fetch_top_assets(limit, &currency).await?;
        let values: Vec<Value> = raws.into_iter().map(Value::Object).collect();
        let assets = self
            .validator
            .validate_batch(&values, cycle_at)
            .map_err(|err| self.rejected(mode, values.len(), err))?;

        let mut histories: Vec<(String, Vec<PricePoint>)> = Vec::with_capacity(assets.len());
        for asset in &assets {
            let points = self.client.fetch_history(&asset.asset_id, days).await?;
            let validated = self
                .validator
                .validate_history(&asset.asset_id, &points, cycle_at)
                .map_err(|err| self.rejected(mode, points.len(), err))?;
            if !validated.is_empty() {
                histories.push((asset.asset_id.clone(), validated));
            }
        }

        if histories.is_empty() {
            return Ok(self.empty_cycle(mode, limit));
        }

        // Candles start at the first bucket the window covers whole. The tail
        // of a bucket already under way would replace a complete stored candle.
        let mut cutoffs: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();
        for (asset_id, points) in &mut histories {
            let Some(start) = points
                .iter()
                .map(|p| p.observed_at)
                .min()
                .and_then(|first| interval.first_full_bucket(first))
            else {
                continue;
            };
            let before = points.len();
            points.retain(|p| p.observed_at >= start);
            if points.len() < before {
                debug!(
                    asset_id = asset_id.as_str(),
                    dropped = before - points.len(),
                    "skipped partial leading bucket"
                );
            }
            cutoffs.insert(asset_id.clone(), start);
        }
        let prior = self.gateway.load_prior_candle_closes(
            &cutoffs,
            interval,
            self.processor.history_depth(),
        )?;

        let mut candles = Vec::new();
        for (asset_id, points) in &histories {
            candles.extend(
                self.processor
                    .build_candles(asset_id, points, interval, Some(&prior))?,
            );
        }

        let report = self.gateway.persist(&EnrichedBatch {
            cycle_at,
            mode,
            records: Vec::new(),
            candles,
        })?;

        info!(
            assets = histories.len(),
            candles = report.candles_written,
            "backfill cycle complete"
        );
        Ok(CycleOutcome::Persisted(report))
    }

    fn empty_cycle(&self, mode: SourceMode, limit: u32) -> CycleOutcome {
        warn!(%mode, limit, "no market data returned");
        self.alerts.notify_failure(
            "no market data returned",
            &AlertContext::new().with("mode", mode).with("limit", limit),
        );
        CycleOutcome::Empty { mode }
    }

    fn rejected(&self, mode: SourceMode, batch_size: usize, err: ValidationError) -> PipelineError {
        warn!(%mode, violations = err.violations.len(), error = %err, "batch rejected");
        let mut context = AlertContext::new()
            .with("mode", mode)
            .with("batch_size", batch_size)
            .with("violations", err.violations.len());
        if let Some(first) = err.violations.first() {
            context = context.with("first", first);
        }
        self.alerts
            .notify_failure("market data failed validation", &context);
        PipelineError::Validation(err)
    }
}
