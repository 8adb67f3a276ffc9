pub mod ingestion;
pub mod model;
pub mod pacing;
pub mod processing;
pub mod retry;
pub mod validation;

pub use ingestion::{HttpTransport, MarketDataClient, ReqwestTransport, ScriptedTransport};
pub use model::{
    Batch, Candle, EnrichedBatch, EnrichedRecord, Interval, MarketSnapshotRecord, Metric,
    PricePoint, PriorContext, RawPricePoint, RawRecord, SourceMode,
};
pub use processing::DataProcessor;
pub use retry::{Backoff, RetryPolicy};
pub use validation::{SchemaValidator, ValidationError};
