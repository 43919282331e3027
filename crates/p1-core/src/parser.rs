//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Field extraction from telegrams into measurements."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use p1_msg::{MessageBuffer, PublishOutcome};
use thiserror::Error;
use tracing::{debug, error};

use crate::measurement::Measurement;
use crate::obis::{FieldDictionary, FieldKind, FieldName};
use crate::telegram::Telegram;

/// Errors raised while turning a telegram into a measurement.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("field {field}: cannot convert '{raw}' to {target}")]
    Conversion {
        field: FieldName,
        raw: String,
        target: FieldKind,
    },
    #[error("no descriptor registered for field {0}")]
    MissingDescriptor(FieldName),
    #[error("field {field}: invalid value pattern: {message}")]
    InvalidPattern { field: FieldName, message: String },
}

/// Builds [`Measurement`]s from telegrams using a [`FieldDictionary`] and
/// publishes them to the measurement buffer.
#[derive(Debug, Clone)]
pub struct FieldParser {
    dictionary: Arc<FieldDictionary>,
    output: MessageBuffer<Measurement>,
}

impl FieldParser {
    /// Parser over the standard DSMR dictionary.
    pub fn new(output: MessageBuffer<Measurement>) -> Result<Self, ParseError> {
        Self::with_dictionary(FieldDictionary::standard()?, output)
    }

    /// Parser over a caller supplied dictionary. Fails when any field lacks a
    /// descriptor.
    pub fn with_dictionary(
        dictionary: Arc<FieldDictionary>,
        output: MessageBuffer<Measurement>,
    ) -> Result<Self, ParseError> {
        dictionary.validate()?;
        Ok(Self { dictionary, output })
    }

    /// Register this parser as the `field-parser` handler of `telegrams`.
    pub fn attach(self: Arc<Self>, telegrams: &MessageBuffer<Telegram>) {
        telegrams.register_named("field-parser", move |telegram: Telegram| {
            let parser = Arc::clone(&self);
            async move {
                parser.handle(&telegram);
                Ok(())
            }
        });
    }

    /// Parse `telegram` and publish the result. Conversion failures are logged
    /// and the telegram is abandoned.
    pub fn handle(&self, telegram: &Telegram) -> Option<PublishOutcome> {
        match self.parse(telegram) {
            Ok(measurement) => {
                debug!(
                    received_at = %measurement.time_stamp,
                    power_draw_kw = measurement.actual_electricity_power_draw,
                    "telegram parsed"
                );
                Some(self.output.publish(measurement))
            }
            Err(ParseError::Conversion { field, raw, target }) => {
                error!(%field, %raw, %target, lines = telegram.len(), "telegram dropped: field conversion failed");
                None
            }
            Err(err) => {
                error!(error = %err, "telegram dropped: field dictionary is inconsistent");
                None
            }
        }
    }

    /// Decode every field of `telegram`.
    ///
    /// The time stamp is the telegram's receipt time; the meter's own
    /// `0-0:1.0.0` clock is never consulted.
    pub fn parse(&self, telegram: &Telegram) -> Result<Measurement, ParseError> {
        let decimal = |name| self.decimal(telegram, name);
        let integer = |name| self.integer(telegram, name);

        let mut measurement = Measurement {
            time_stamp: telegram.received_at(),
            version: self.text(telegram, FieldName::Version)?,
            equipment_identifier: self.text(telegram, FieldName::EquipmentIdentifier)?,
            electricity_delivered_to_client_tariff1: decimal(
                FieldName::ElectricityDeliveredToClientTariff1,
            )?,
            electricity_delivered_to_client_tariff2: decimal(
                FieldName::ElectricityDeliveredToClientTariff2,
            )?,
            electricity_delivered_by_client_tariff1: decimal(
                FieldName::ElectricityDeliveredByClientTariff1,
            )?,
            electricity_delivered_by_client_tariff2: decimal(
                FieldName::ElectricityDeliveredByClientTariff2,
            )?,
            tariff: integer(FieldName::Tariff)?,
            actual_electricity_power_draw: decimal(FieldName::ActualElectricityPowerDraw)?,
            actual_electricity_power_delivery: decimal(FieldName::ActualElectricityPowerDelivery)?,
            power_failures_in_any_phase: integer(FieldName::PowerFailuresInAnyPhase)?,
            long_power_failures_in_any_phase: integer(FieldName::LongPowerFailuresInAnyPhase)?,
            instantaneous_voltage_l1: decimal(FieldName::InstantaneousVoltageL1)?,
            instantaneous_voltage_l2: decimal(FieldName::InstantaneousVoltageL2)?,
            instantaneous_voltage_l3: decimal(FieldName::InstantaneousVoltageL3)?,
            instantaneous_current_l1: integer(FieldName::InstantaneousCurrentL1)?,
            instantaneous_current_l2: integer(FieldName::InstantaneousCurrentL2)?,
            instantaneous_current_l3: integer(FieldName::InstantaneousCurrentL3)?,
            instantaneous_active_power_draw_l1: decimal(FieldName::InstantaneousActivePowerDrawL1)?,
            instantaneous_active_power_draw_l2: decimal(FieldName::InstantaneousActivePowerDrawL2)?,
            instantaneous_active_power_draw_l3: decimal(FieldName::InstantaneousActivePowerDrawL3)?,
            instantaneous_active_power_delivery_l1: decimal(
                FieldName::InstantaneousActivePowerDeliveryL1,
            )?,
            instantaneous_active_power_delivery_l2: decimal(
                FieldName::InstantaneousActivePowerDeliveryL2,
            )?,
            instantaneous_active_power_delivery_l3: decimal(
                FieldName::InstantaneousActivePowerDeliveryL3,
            )?,
            net_actual_electricity_power: 0.0,
            total_instantaneous_current: 0,
            total_instantaneous_voltage: 0.0,
        };
        measurement.update_derived();
        Ok(measurement)
    }

    /// Raw capture of `name`, empty when the telegram does not carry it.
    fn raw<'t>(&self, telegram: &'t Telegram, name: FieldName) -> Result<&'t str, ParseError> {
        let descriptor = self.dictionary.lookup(name)?;
        Ok(telegram
            .line_starting_with(descriptor.reference)
            .and_then(|line| descriptor.extract(line))
            .unwrap_or_default())
    }

    fn text(&self, telegram: &Telegram, name: FieldName) -> Result<String, ParseError> {
        self.raw(telegram, name).map(str::to_owned)
    }

    fn decimal(&self, telegram: &Telegram, name: FieldName) -> Result<f64, ParseError> {
        let raw = self.raw(telegram, name)?;
        parse_decimal(raw).ok_or_else(|| conversion(name, raw, FieldKind::Decimal))
    }

    fn integer(&self, telegram: &Telegram, name: FieldName) -> Result<i32, ParseError> {
        let raw = self.raw(telegram, name)?;
        parse_integer(raw).ok_or_else(|| conversion(name, raw, FieldKind::Integer))
    }
}

fn conversion(field: FieldName, raw: &str, target: FieldKind) -> ParseError {
    ParseError::Conversion {
        field,
        raw: raw.to_owned(),
        target,
    }
}

/// `.` separated decimal with an optional sign; blank is zero. Exponents,
/// `inf` and `nan` are rejected.
fn parse_decimal(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Some(0.0);
    }
    let plain = trimmed
        .bytes()
        .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'+' | b'-'));
    if !plain {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|value| value.is_finite())
}

fn parse_integer(raw: &str) -> Option<i32> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Some(0);
    }
    trimmed.parse::<i32>().ok()
}
