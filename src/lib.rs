//! Cryptocurrency market data pipeline.
//!
//! Fetches market snapshots and price histories from a CoinGecko-compatible
//! API, validates them against a strict schema, derives analytics and stores
//! the result in an embedded DuckDB database.

pub mod alert;
pub mod config;
pub mod data;
pub mod error;
pub mod pipeline;
pub mod snapshot;
pub mod storage;

pub use alert::{AlertContext, AlertSink, LogAlertSink};
pub use config::{ClientConfig, PipelineConfig};
pub use error::{ConfigError, EnrichmentError, FetchError, PipelineError, SnapshotError, StorageError};
pub use pipeline::{CycleOutcome, Pipeline};
pub use snapshot::SnapshotManager;
pub use storage::{BatchGateway, MarketStore, PersistReport};
