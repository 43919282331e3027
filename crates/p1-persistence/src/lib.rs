//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Measurement sinks and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Persistence backends consuming decoded measurements.
//!
//! Every backend implements [`MeasurementSink`]. [`RetryingSink`] wraps one
//! backend with a fixed-delay retry discipline and registers it on the
//! measurement buffer.

use async_trait::async_trait;
use p1_core::Measurement;

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while writing measurement files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Wrapper for CSV serialization issues.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    /// Wrapper for SQLite connection and statement errors.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),
    /// Sink metrics could not be registered.
    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
    /// A sink reported a record count other than exactly one.
    #[error("sink '{sink}' wrote {written} records instead of 1")]
    StorageWrite {
        /// Sink name.
        sink: String,
        /// Records the sink reported as written.
        written: usize,
    },
    /// The measurement is dated before the day the sink already rotated to.
    #[error("sink '{sink}' is writing {current}; measurement dated {date} skipped")]
    StaleMeasurement {
        /// Sink name.
        sink: String,
        /// Date of the rejected measurement.
        date: chrono::NaiveDate,
        /// Date of the storage currently open.
        current: chrono::NaiveDate,
    },
    /// A bounded retry policy gave up.
    #[error("sink '{sink}' gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Sink name.
        sink: String,
        /// Attempts made, including the first.
        attempts: usize,
        /// Error of the final attempt.
        last: Box<PersistenceError>,
    },
}

impl PersistenceError {
    /// Whether writing the same measurement again can succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PersistenceError::StaleMeasurement { .. } | PersistenceError::RetriesExhausted { .. }
        )
    }
}

/// Persistence backend for measurements.
#[async_trait]
pub trait MeasurementSink: Send + Sync {
    /// Name used in log events and as the buffer handler name.
    fn name(&self) -> &str;

    /// Store one measurement and return the number of records written.
    async fn save(&self, measurement: &Measurement) -> Result<usize>;
}

#[async_trait]
impl<S> MeasurementSink for Box<S>
where
    S: MeasurementSink + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn save(&self, measurement: &Measurement) -> Result<usize> {
        (**self).save(measurement).await
    }
}

pub mod csv_sink;
pub mod daily;
pub mod jsonl;
pub mod log_sink;
pub mod retry;
pub mod sqlite_sink;

pub use csv_sink::CsvSink;
pub use daily::DailyFile;
pub use jsonl::JsonLinesSink;
pub use log_sink::LogSink;
pub use retry::{RetryPolicy, RetryingSink};
pub use sqlite_sink::SqliteSink;
