//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Per-day SQLite databases holding the p1power table."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use p1_core::Measurement;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{MeasurementSink, PersistenceError, Result};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS p1power (
    MeasurementId INTEGER PRIMARY KEY AUTOINCREMENT,
    ActualElectricityPowerDelivery DECIMAL(10,3),
    ActualElectricityPowerDraw DECIMAL(10,3),
    ElectricityDeliveredByClientTariff1 DECIMAL(10,3),
    ElectricityDeliveredByClientTariff2 DECIMAL(10,3),
    ElectricityDeliveredToClientTariff1 DECIMAL(10,3),
    ElectricityDeliveredToClientTariff2 DECIMAL(10,3),
    InstantaneousActivePowerDeliveryL1 DECIMAL(10,3),
    InstantaneousActivePowerDeliveryL2 DECIMAL(10,3),
    InstantaneousActivePowerDeliveryL3 DECIMAL(10,3),
    InstantaneousActivePowerDrawL1 DECIMAL(10,3),
    InstantaneousActivePowerDrawL2 DECIMAL(10,3),
    InstantaneousActivePowerDrawL3 DECIMAL(10,3),
    InstantaneousCurrentL1 INT,
    InstantaneousCurrentL2 INT,
    InstantaneousCurrentL3 INT,
    InstantaneousVoltageL1 DECIMAL(10,1),
    InstantaneousVoltageL2 DECIMAL(10,1),
    InstantaneousVoltageL3 DECIMAL(10,1),
    NetActualElectricityPower DECIMAL(10,3),
    TotalInstantaneousCurrent INT,
    TotalInstantaneousVoltage DECIMAL(10,1),
    TimeStamp TIMESTAMP
)
"#;

const INSERT: &str = r#"
INSERT INTO p1power (
    ActualElectricityPowerDelivery, ActualElectricityPowerDraw,
    ElectricityDeliveredByClientTariff1, ElectricityDeliveredByClientTariff2,
    ElectricityDeliveredToClientTariff1, ElectricityDeliveredToClientTariff2,
    InstantaneousActivePowerDeliveryL1, InstantaneousActivePowerDeliveryL2,
    InstantaneousActivePowerDeliveryL3, InstantaneousActivePowerDrawL1,
    InstantaneousActivePowerDrawL2, InstantaneousActivePowerDrawL3,
    InstantaneousCurrentL1, InstantaneousCurrentL2, InstantaneousCurrentL3,
    InstantaneousVoltageL1, InstantaneousVoltageL2, InstantaneousVoltageL3,
    NetActualElectricityPower, TotalInstantaneousCurrent, TotalInstantaneousVoltage,
    TimeStamp
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

struct OpenDatabase {
    date: NaiveDate,
    path: PathBuf,
    pool: SqlitePool,
}

/// Inserts measurements into the `p1power` table of
/// `<directory>/YYYYMMDD-p1power.db`.
///
/// The sink owns its rotation: the first measurement of a new UTC day closes
/// the previous database and opens (or creates) the one for that day. A
/// measurement dated before the open database is rejected.
pub struct SqliteSink {
    directory: PathBuf,
    current: Mutex<Option<OpenDatabase>>,
}

impl std::fmt::Debug for SqliteSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSink")
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}

impl SqliteSink {
    /// Sink keeping its databases below `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            current: Mutex::new(None),
        }
    }

    /// Database file for measurements dated `date`.
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.directory
            .join(format!("{}-p1power.db", date.format("%Y%m%d")))
    }

    /// Database currently receiving inserts.
    pub async fn current_path(&self) -> Option<PathBuf> {
        self.current.lock().await.as_ref().map(|open| open.path.clone())
    }

    /// Close the open database, if any. The next save reopens it.
    pub async fn close(&self) {
        if let Some(open) = self.current.lock().await.take() {
            open.pool.close().await;
            debug!(path = %open.path.display(), "sqlite database closed");
        }
    }
}

async fn open_database(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5))
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    sqlx::query(CREATE_TABLE).execute(&pool).await?;
    info!(path = %path.display(), "sqlite database opened");
    Ok(pool)
}

#[async_trait]
impl MeasurementSink for SqliteSink {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn save(&self, measurement: &Measurement) -> Result<usize> {
        let date = measurement.time_stamp.date_naive();
        let mut current = self.current.lock().await;

        match current.as_ref().map(|open| open.date) {
            Some(open_date) if date < open_date => {
                warn!(
                    measurement_date = %date,
                    database_date = %open_date,
                    "measurement from a day already rotated away; skipped"
                );
                return Err(PersistenceError::StaleMeasurement {
                    sink: self.name().to_owned(),
                    date,
                    current: open_date,
                });
            }
            Some(open_date) if date == open_date => {}
            _ => {
                let path = self.path_for(date);
                let pool = open_database(&path).await?;
                if let Some(previous) = current.replace(OpenDatabase { date, path, pool }) {
                    previous.pool.close().await;
                    info!(path = %previous.path.display(), "sqlite database rotated");
                }
            }
        }
        let Some(open) = current.as_ref() else {
            return Err(std::io::Error::other("sqlite database not open").into());
        };

        let m = measurement;
        let result = sqlx::query(INSERT)
            .bind(m.actual_electricity_power_delivery)
            .bind(m.actual_electricity_power_draw)
            .bind(m.electricity_delivered_by_client_tariff1)
            .bind(m.electricity_delivered_by_client_tariff2)
            .bind(m.electricity_delivered_to_client_tariff1)
            .bind(m.electricity_delivered_to_client_tariff2)
            .bind(m.instantaneous_active_power_delivery_l1)
            .bind(m.instantaneous_active_power_delivery_l2)
            .bind(m.instantaneous_active_power_delivery_l3)
            .bind(m.instantaneous_active_power_draw_l1)
            .bind(m.instantaneous_active_power_draw_l2)
            .bind(m.instantaneous_active_power_draw_l3)
            .bind(m.instantaneous_current_l1)
            .bind(m.instantaneous_current_l2)
            .bind(m.instantaneous_current_l3)
            .bind(m.instantaneous_voltage_l1)
            .bind(m.instantaneous_voltage_l2)
            .bind(m.instantaneous_voltage_l3)
            .bind(m.net_actual_electricity_power)
            .bind(m.total_instantaneous_current)
            .bind(m.total_instantaneous_voltage)
            .bind(m.time_stamp)
            .execute(&open.pool)
            .await?;
        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn measurement_at(day: u32, hour: u32) -> Measurement {
        let mut measurement =
            Measurement::empty(Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap());
        measurement.instantaneous_voltage_l1 = 230.5;
        measurement.instantaneous_current_l1 = 3;
        measurement.instantaneous_current_l2 = 2;
        measurement.update_derived();
        measurement
    }

    async fn rows(path: &Path) -> Vec<(f64, i64)> {
        let pool = SqlitePool::connect_with(SqliteConnectOptions::new().filename(path))
            .await
            .unwrap();
        let rows = sqlx::query_as::<_, (f64, i64)>(
            "SELECT CAST(InstantaneousVoltageL1 AS REAL), CAST(TotalInstantaneousCurrent AS INTEGER) \
             FROM p1power ORDER BY MeasurementId",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        pool.close().await;
        rows
    }

    #[tokio::test]
    async fn inserts_one_row_per_measurement() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = SqliteSink::new(dir.path());
        assert_eq!(sink.save(&measurement_at(1, 10)).await?, 1);
        assert_eq!(sink.save(&measurement_at(1, 11)).await?, 1);
        sink.close().await;

        let path = dir.path().join("20240301-p1power.db");
        assert_eq!(rows(&path).await, vec![(230.5, 5), (230.5, 5)]);
        Ok(())
    }

    #[tokio::test]
    async fn new_day_opens_new_database() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = SqliteSink::new(dir.path());
        sink.save(&measurement_at(1, 23)).await?;
        sink.save(&measurement_at(2, 0)).await?;
        assert_eq!(
            sink.current_path().await,
            Some(dir.path().join("20240302-p1power.db"))
        );
        sink.close().await;

        assert_eq!(rows(&dir.path().join("20240301-p1power.db")).await.len(), 1);
        assert_eq!(rows(&dir.path().join("20240302-p1power.db")).await.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn measurement_from_rotated_day_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = SqliteSink::new(dir.path());
        sink.save(&measurement_at(2, 0)).await?;

        let err = sink.save(&measurement_at(1, 23)).await.unwrap_err();
        assert!(matches!(err, PersistenceError::StaleMeasurement { .. }));
        assert!(!err.is_retryable());
        sink.close().await;

        assert!(!dir.path().join("20240301-p1power.db").exists());
        assert_eq!(rows(&dir.path().join("20240302-p1power.db")).await.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn reopening_appends_to_existing_database() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        SqliteSink::new(dir.path()).save(&measurement_at(1, 10)).await?;
        let sink = SqliteSink::new(dir.path());
        sink.save(&measurement_at(1, 11)).await?;
        sink.close().await;

        assert_eq!(rows(&dir.path().join("20240301-p1power.db")).await.len(), 2);
        Ok(())
    }
}
