//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "CSV measurement files with daily rotation."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use csv::WriterBuilder;
use p1_core::Measurement;
use parking_lot::Mutex;

use crate::daily::DailyFile;
use crate::{MeasurementSink, PersistenceError, Result};

/// Appends measurements as CSV rows to `p1-YYYYMMDD.csv`.
///
/// The header row is written once, when a file is created empty; appending to
/// a file left over from an earlier run adds rows only.
#[derive(Debug)]
pub struct CsvSink<W = File> {
    files: Mutex<DailyFile<W>>,
}

impl CsvSink {
    /// Sink writing below `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self::with_files(DailyFile::new(directory, "p1", "csv"))
    }
}

impl<W: Write> CsvSink<W> {
    /// Sink appending to an already configured file set.
    pub fn with_files(files: DailyFile<W>) -> Self {
        Self {
            files: Mutex::new(files),
        }
    }
}

/// One CSV row, preceded by the header row when `header` is set.
fn render_row(measurement: &Measurement, header: bool) -> Result<Vec<u8>> {
    let mut rows = WriterBuilder::new()
        .has_headers(header)
        .from_writer(Vec::new());
    rows.serialize(measurement)?;
    rows.into_inner()
        .map_err(|err| PersistenceError::Io(err.into_error()))
}

#[async_trait]
impl<W: Write + Send> MeasurementSink for CsvSink<W> {
    fn name(&self) -> &str {
        "csv"
    }

    async fn save(&self, measurement: &Measurement) -> Result<usize> {
        self.files
            .lock()
            .append(measurement.time_stamp.date_naive(), |fresh| {
                render_row(measurement, fresh)
            })?;
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daily::testing::FlakyDisk;
    use chrono::{TimeZone, Utc};
    use std::fs;

    fn measurement() -> Measurement {
        let mut measurement =
            Measurement::empty(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        measurement.instantaneous_voltage_l1 = 220.1;
        measurement.tariff = 2;
        measurement
    }

    #[tokio::test]
    async fn header_written_once_per_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = CsvSink::new(dir.path());
        sink.save(&measurement()).await?;
        sink.save(&measurement()).await?;

        let contents = fs::read_to_string(dir.path().join("p1-20240301.csv"))?;
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("time_stamp,version,equipment_identifier"));
        assert_eq!(lines.iter().filter(|line| line.starts_with("time_stamp")).count(), 1);

        let mut reader = csv::Reader::from_path(dir.path().join("p1-20240301.csv"))?;
        let rows: Vec<Measurement> = reader.deserialize().collect::<std::result::Result<_, _>>()?;
        assert_eq!(rows[1].instantaneous_voltage_l1, 220.1);
        assert_eq!(rows[1].tariff, 2);
        Ok(())
    }

    #[tokio::test]
    async fn existing_file_gets_no_second_header() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        CsvSink::new(dir.path()).save(&measurement()).await?;
        CsvSink::new(dir.path()).save(&measurement()).await?;

        let contents = fs::read_to_string(dir.path().join("p1-20240301.csv"))?;
        assert_eq!(contents.lines().count(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn failed_flush_does_not_duplicate_header_or_row() {
        let disk = FlakyDisk::default();
        let sink = CsvSink::with_files(disk.daily("p1", "csv"));

        disk.fail_next_flushes(1);
        assert!(sink.save(&measurement()).await.is_err());
        sink.save(&measurement()).await.unwrap();

        let contents = disk.contents(&PathBuf::from("measurements/p1-20240301.csv"));
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("time_stamp,"));
        assert!(lines[1].contains("220.1"));
    }
}
