//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Typed measurement record decoded from a telegram."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Flat record of every field decoded from one telegram.
///
/// Every field is always present; values missing from the telegram are zero or
/// empty. Energy registers are in kWh, power in kW, voltage in V and current
/// in A. Field order is the column order of tabular sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Receipt time of the telegram; the meter's own clock is not used.
    pub time_stamp: DateTime<Utc>,
    pub version: String,
    pub equipment_identifier: String,
    pub electricity_delivered_to_client_tariff1: f64,
    pub electricity_delivered_to_client_tariff2: f64,
    pub electricity_delivered_by_client_tariff1: f64,
    pub electricity_delivered_by_client_tariff2: f64,
    pub tariff: i32,
    pub actual_electricity_power_draw: f64,
    pub actual_electricity_power_delivery: f64,
    pub power_failures_in_any_phase: i32,
    pub long_power_failures_in_any_phase: i32,
    pub instantaneous_voltage_l1: f64,
    pub instantaneous_voltage_l2: f64,
    pub instantaneous_voltage_l3: f64,
    pub instantaneous_current_l1: i32,
    pub instantaneous_current_l2: i32,
    pub instantaneous_current_l3: i32,
    pub instantaneous_active_power_draw_l1: f64,
    pub instantaneous_active_power_draw_l2: f64,
    pub instantaneous_active_power_draw_l3: f64,
    pub instantaneous_active_power_delivery_l1: f64,
    pub instantaneous_active_power_delivery_l2: f64,
    pub instantaneous_active_power_delivery_l3: f64,
    /// Draw minus delivery.
    pub net_actual_electricity_power: f64,
    pub total_instantaneous_current: i32,
    pub total_instantaneous_voltage: f64,
}

impl Measurement {
    /// Record with every reading at zero, stamped `time_stamp`.
    pub fn empty(time_stamp: DateTime<Utc>) -> Self {
        Self {
            time_stamp,
            version: String::new(),
            equipment_identifier: String::new(),
            electricity_delivered_to_client_tariff1: 0.0,
            electricity_delivered_to_client_tariff2: 0.0,
            electricity_delivered_by_client_tariff1: 0.0,
            electricity_delivered_by_client_tariff2: 0.0,
            tariff: 0,
            actual_electricity_power_draw: 0.0,
            actual_electricity_power_delivery: 0.0,
            power_failures_in_any_phase: 0,
            long_power_failures_in_any_phase: 0,
            instantaneous_voltage_l1: 0.0,
            instantaneous_voltage_l2: 0.0,
            instantaneous_voltage_l3: 0.0,
            instantaneous_current_l1: 0,
            instantaneous_current_l2: 0,
            instantaneous_current_l3: 0,
            instantaneous_active_power_draw_l1: 0.0,
            instantaneous_active_power_draw_l2: 0.0,
            instantaneous_active_power_draw_l3: 0.0,
            instantaneous_active_power_delivery_l1: 0.0,
            instantaneous_active_power_delivery_l2: 0.0,
            instantaneous_active_power_delivery_l3: 0.0,
            net_actual_electricity_power: 0.0,
            total_instantaneous_current: 0,
            total_instantaneous_voltage: 0.0,
        }
    }

    /// Recompute the fields derived from the raw readings.
    pub fn update_derived(&mut self) {
        self.net_actual_electricity_power =
            self.actual_electricity_power_draw - self.actual_electricity_power_delivery;
        self.total_instantaneous_current = self
            .instantaneous_current_l1
            .saturating_add(self.instantaneous_current_l2)
            .saturating_add(self.instantaneous_current_l3);
        self.total_instantaneous_voltage = self.instantaneous_voltage_l1
            + self.instantaneous_voltage_l2
            + self.instantaneous_voltage_l3;
    }

    /// Total energy taken from the grid over both tariffs, in kWh.
    pub fn total_delivered_to_client(&self) -> f64 {
        self.electricity_delivered_to_client_tariff1 + self.electricity_delivered_to_client_tariff2
    }

    /// Total energy fed back into the grid over both tariffs, in kWh.
    pub fn total_delivered_by_client(&self) -> f64 {
        self.electricity_delivered_by_client_tariff1 + self.electricity_delivered_by_client_tariff2
    }
}
