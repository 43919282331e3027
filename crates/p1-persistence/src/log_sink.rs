//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Measurement sink emitting structured log events."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use async_trait::async_trait;
use p1_core::Measurement;
use tracing::info;

use crate::{MeasurementSink, Result};

/// Emits every measurement as an `info` event on the `p1_measurements` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl MeasurementSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn save(&self, measurement: &Measurement) -> Result<usize> {
        info!(
            target: "p1_measurements",
            time_stamp = %measurement.time_stamp,
            equipment = %measurement.equipment_identifier,
            tariff = measurement.tariff,
            delivered_to_client_kwh = measurement.total_delivered_to_client(),
            delivered_by_client_kwh = measurement.total_delivered_by_client(),
            net_power_kw = measurement.net_actual_electricity_power,
            voltage_l1 = measurement.instantaneous_voltage_l1,
            voltage_l2 = measurement.instantaneous_voltage_l2,
            voltage_l3 = measurement.instantaneous_voltage_l3,
            current_total_a = measurement.total_instantaneous_current,
            "measurement"
        );
        Ok(1)
    }
}
