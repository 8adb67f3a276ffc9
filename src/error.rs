use thiserror::Error;

use crate::data::validation::ValidationError;

/// Failures surfaced by the market data client.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    /// Rate limiting or network trouble that outlasted the retry ceiling.
    #[error("transient fetch failure after {attempts} attempt(s): {last_error}")]
    TransientFetchFailure { attempts: u32, last_error: String },

    /// The API rejected the request; retrying will not help.
    #[error("request rejected with HTTP {status}: {body}")]
    ClientRequestError { status: u16, body: String },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

/// Input reached enrichment in a shape validation should have rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EnrichmentError {
    #[error("record {index} ({asset_id}): {field} is {value}, expected a finite non-negative number")]
    InvalidNumeric {
        index: usize,
        asset_id: String,
        field: &'static str,
        value: f64,
    },

    #[error("record {index} has an empty asset id")]
    EmptyAssetId { index: usize },

    #[error("could not place {at} into a {interval} bucket")]
    UnbucketableTimestamp { at: String, interval: String },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    DuckDb(#[from] duckdb::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("database not found at {0}")]
    DatabaseMissing(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{key}={value} is invalid: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// Anything that aborts an ingestion cycle.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Enrichment(#[from] EnrichmentError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl PipelineError {
    /// Short label used in alerts and logs.
    pub const fn stage(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "fetch",
            Self::Validation(_) => "validation",
            Self::Enrichment(_) => "enrichment",
            Self::Storage(_) => "persistence",
        }
    }

    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) => 2,
            Self::Fetch(_) => 3,
            Self::Storage(_) => 4,
            Self::Enrichment(_) => 5,
        }
    }
}
