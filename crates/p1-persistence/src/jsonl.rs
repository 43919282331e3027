//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "JSON-lines measurement files with daily rotation."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use p1_core::Measurement;
use parking_lot::Mutex;
use tracing::trace;

use crate::daily::DailyFile;
use crate::{MeasurementSink, Result};

/// Appends one JSON object per measurement to `p1-YYYYMMDD.jsonl`, choosing the
/// file from the measurement's UTC date.
#[derive(Debug)]
pub struct JsonLinesSink<W = File> {
    files: Mutex<DailyFile<W>>,
}

impl JsonLinesSink {
    /// Sink writing below `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self::with_files(DailyFile::new(directory, "p1", "jsonl"))
    }
}

impl<W: Write> JsonLinesSink<W> {
    /// Sink appending to an already configured file set.
    pub fn with_files(files: DailyFile<W>) -> Self {
        Self {
            files: Mutex::new(files),
        }
    }

    /// File currently being appended to.
    pub fn current_path(&self) -> Option<PathBuf> {
        self.files.lock().current_path().map(PathBuf::from)
    }
}

#[async_trait]
impl<W: Write + Send> MeasurementSink for JsonLinesSink<W> {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn save(&self, measurement: &Measurement) -> Result<usize> {
        let bytes = self
            .files
            .lock()
            .append(measurement.time_stamp.date_naive(), |_fresh| {
                let mut line = serde_json::to_vec(measurement)?;
                line.push(b'\n');
                Ok(line)
            })?;
        trace!(bytes, "measurement appended");
        Ok(1)
    }
}
