use thiserror::Error;

/// Failures surfaced by the aggregation path.
///
/// Only `InvalidRange` and `Cancelled` ever escape `run_aggregation`; partition
/// and record failures are logged and tallied in the report instead.
#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("invalid time range: {0}")]
    InvalidRange(String),

    #[error("failed to fetch partition {partition}: {source}")]
    PartitionFetch {
        partition: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("malformed record: {0}")]
    Decode(String),

    #[error("aggregation cancelled")]
    Cancelled,
}

pub type AggregationResult<T> = std::result::Result<T, AggregationError>;
