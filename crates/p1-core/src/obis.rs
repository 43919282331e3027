//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "OBIS reference codes and value patterns of telegram fields."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Static dictionary mapping measurement fields onto telegram lines.
//!
//! Each [`FieldDescriptor`] names the OBIS reference prefix of the line that
//! carries the field and a pattern whose first capture group is the raw value.
//! Patterns are matched against the remainder of the line after the prefix, so
//! `0-0:96.7.9` never matches a `0-0:96.7.91` line.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use strum::{Display, EnumIter, IntoEnumIterator, IntoStaticStr};

use crate::parser::ParseError;

/// Semantic name of every field the dictionary knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr)]
pub enum FieldName {
    Version,
    MeterTimestamp,
    EquipmentIdentifier,
    ElectricityDeliveredToClientTariff1,
    ElectricityDeliveredToClientTariff2,
    ElectricityDeliveredByClientTariff1,
    ElectricityDeliveredByClientTariff2,
    Tariff,
    ActualElectricityPowerDraw,
    ActualElectricityPowerDelivery,
    PowerFailuresInAnyPhase,
    LongPowerFailuresInAnyPhase,
    InstantaneousVoltageL1,
    InstantaneousVoltageL2,
    InstantaneousVoltageL3,
    InstantaneousCurrentL1,
    InstantaneousCurrentL2,
    InstantaneousCurrentL3,
    InstantaneousActivePowerDrawL1,
    InstantaneousActivePowerDrawL2,
    InstantaneousActivePowerDrawL3,
    InstantaneousActivePowerDeliveryL1,
    InstantaneousActivePowerDeliveryL2,
    InstantaneousActivePowerDeliveryL3,
}

/// Declared value type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum FieldKind {
    Decimal,
    Integer,
    Text,
    Timestamp,
}

#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: FieldName,
    /// OBIS reference prefix, e.g. `1-0:32.7.0`.
    pub reference: &'static str,
    pub pattern: Regex,
    pub kind: FieldKind,
}

impl FieldDescriptor {
    pub fn new(
        name: FieldName,
        reference: &'static str,
        pattern: &str,
        kind: FieldKind,
    ) -> Result<Self, ParseError> {
        let pattern = Regex::new(pattern).map_err(|err| ParseError::InvalidPattern {
            field: name,
            message: err.to_string(),
        })?;
        Ok(Self {
            name,
            reference,
            pattern,
            kind,
        })
    }

    /// Raw value of this field in `line`, or `None` when the line does not
    /// carry it.
    pub fn extract<'a>(&self, line: &'a str) -> Option<&'a str> {
        let rest = line.strip_prefix(self.reference)?;
        self.pattern
            .captures(rest)
            .and_then(|captures| captures.get(1))
            .map(|value| value.as_str())
    }
}

const PLAIN: &str = r"^\(([^)]*)\)";
const KWH: &str = r"^\(([^*)]*)\*kWh\)";
const KW: &str = r"^\(([^*)]*)\*kW\)";
const VOLT: &str = r"^\(([^*)]*)\*V\)";
const AMPERE: &str = r"^\(([^*)]*)\*A\)";

const STANDARD_FIELDS: &[(FieldName, &str, &str, FieldKind)] = &[
    (FieldName::Version, "1-3:0.2.8", PLAIN, FieldKind::Text),
    (FieldName::MeterTimestamp, "0-0:1.0.0", PLAIN, FieldKind::Timestamp),
    (FieldName::EquipmentIdentifier, "0-0:96.1.1", PLAIN, FieldKind::Text),
    (FieldName::ElectricityDeliveredToClientTariff1, "1-0:1.8.1", KWH, FieldKind::Decimal),
    (FieldName::ElectricityDeliveredToClientTariff2, "1-0:1.8.2", KWH, FieldKind::Decimal),
    (FieldName::ElectricityDeliveredByClientTariff1, "1-0:2.8.1", KWH, FieldKind::Decimal),
    (FieldName::ElectricityDeliveredByClientTariff2, "1-0:2.8.2", KWH, FieldKind::Decimal),
    (FieldName::Tariff, "0-0:96.14.0", PLAIN, FieldKind::Integer),
    (FieldName::ActualElectricityPowerDraw, "1-0:1.7.0", KW, FieldKind::Decimal),
    (FieldName::ActualElectricityPowerDelivery, "1-0:2.7.0", KW, FieldKind::Decimal),
    (FieldName::PowerFailuresInAnyPhase, "0-0:96.7.21", PLAIN, FieldKind::Integer),
    (FieldName::LongPowerFailuresInAnyPhase, "0-0:96.7.9", PLAIN, FieldKind::Integer),
    (FieldName::InstantaneousVoltageL1, "1-0:32.7.0", VOLT, FieldKind::Decimal),
    (FieldName::InstantaneousVoltageL2, "1-0:52.7.0", VOLT, FieldKind::Decimal),
    (FieldName::InstantaneousVoltageL3, "1-0:72.7.0", VOLT, FieldKind::Decimal),
    (FieldName::InstantaneousCurrentL1, "1-0:31.7.0", AMPERE, FieldKind::Integer),
    (FieldName::InstantaneousCurrentL2, "1-0:51.7.0", AMPERE, FieldKind::Integer),
    (FieldName::InstantaneousCurrentL3, "1-0:71.7.0", AMPERE, FieldKind::Integer),
    (FieldName::InstantaneousActivePowerDrawL1, "1-0:21.7.0", KW, FieldKind::Decimal),
    (FieldName::InstantaneousActivePowerDrawL2, "1-0:41.7.0", KW, FieldKind::Decimal),
    (FieldName::InstantaneousActivePowerDrawL3, "1-0:61.7.0", KW, FieldKind::Decimal),
    (FieldName::InstantaneousActivePowerDeliveryL1, "1-0:22.7.0", KW, FieldKind::Decimal),
    (FieldName::InstantaneousActivePowerDeliveryL2, "1-0:42.7.0", KW, FieldKind::Decimal),
    (FieldName::InstantaneousActivePowerDeliveryL3, "1-0:62.7.0", KW, FieldKind::Decimal),
];

static STANDARD: Lazy<Result<Arc<FieldDictionary>, ParseError>> = Lazy::new(|| {
    STANDARD_FIELDS
        .iter()
        .map(|(name, reference, pattern, kind)| {
            FieldDescriptor::new(*name, *reference, pattern, *kind)
        })
        .collect::<Result<Vec<_>, _>>()
        .map(|descriptors| Arc::new(FieldDictionary::from_descriptors(descriptors)))
});

/// Read-only lookup table from [`FieldName`] to [`FieldDescriptor`].
#[derive(Debug, Clone, Default)]
pub struct FieldDictionary {
    descriptors: HashMap<FieldName, FieldDescriptor>,
}

impl FieldDictionary {
    /// Process-wide DSMR dictionary, compiled on first use.
    pub fn standard() -> Result<Arc<FieldDictionary>, ParseError> {
        (*STANDARD).clone()
    }

    pub fn from_descriptors(descriptors: impl IntoIterator<Item = FieldDescriptor>) -> Self {
        Self {
            descriptors: descriptors
                .into_iter()
                .map(|descriptor| (descriptor.name, descriptor))
                .collect(),
        }
    }

    pub fn get(&self, name: FieldName) -> Option<&FieldDescriptor> {
        self.descriptors.get(&name)
    }

    pub fn lookup(&self, name: FieldName) -> Result<&FieldDescriptor, ParseError> {
        self.get(name).ok_or(ParseError::MissingDescriptor(name))
    }

    /// Remove a descriptor, returning the reduced dictionary.
    pub fn without(mut self, name: FieldName) -> Self {
        self.descriptors.remove(&name);
        self
    }

    /// Fails with the first [`FieldName`] lacking a descriptor.
    pub fn validate(&self) -> Result<(), ParseError> {
        match FieldName::iter().find(|name| !self.descriptors.contains_key(name)) {
            Some(missing) => Err(ParseError::MissingDescriptor(missing)),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_dictionary_covers_every_field() {
        let dictionary = FieldDictionary::standard().unwrap();
        dictionary.validate().unwrap();
        assert_eq!(dictionary.len(), FieldName::iter().count());
    }

    #[test]
    fn standard_dictionary_is_shared() {
        let first = FieldDictionary::standard().unwrap();
        let second = FieldDictionary::standard().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn extracts_capture_after_reference() {
        let dictionary = FieldDictionary::standard().unwrap();
        let voltage = dictionary.lookup(FieldName::InstantaneousVoltageL1).unwrap();
        assert_eq!(voltage.extract("1-0:32.7.0(220.1*V)"), Some("220.1"));
        assert_eq!(voltage.extract("1-0:32.7.0(220.1*kV)"), None);
        assert_eq!(voltage.extract("1-0:52.7.0(220.2*V)"), None);

        let failures = dictionary.lookup(FieldName::LongPowerFailuresInAnyPhase).unwrap();
        assert_eq!(failures.extract("0-0:96.7.9(00002)"), Some("00002"));
        assert_eq!(failures.extract("0-0:96.7.91(00002)"), None);
    }

    #[test]
    fn malformed_values_are_still_captured() {
        let dictionary = FieldDictionary::standard().unwrap();
        let energy = dictionary
            .lookup(FieldName::ElectricityDeliveredToClientTariff1)
            .unwrap();
        assert_eq!(energy.extract("1-0:1.8.1(12x4.5*kWh)"), Some("12x4.5"));
    }

    #[test]
    fn missing_descriptor_is_reported() {
        let dictionary = FieldDictionary::standard()
            .unwrap()
            .as_ref()
            .clone()
            .without(FieldName::Tariff);
        assert_eq!(
            dictionary.validate(),
            Err(ParseError::MissingDescriptor(FieldName::Tariff))
        );
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = FieldDescriptor::new(FieldName::Version, "1-3:0.2.8", "(", FieldKind::Text)
            .unwrap_err();
        assert!(matches!(err, ParseError::InvalidPattern { field: FieldName::Version, .. }));
    }

    #[test]
    fn field_names_display_as_identifiers() {
        assert_eq!(FieldName::InstantaneousVoltageL1.to_string(), "InstantaneousVoltageL1");
        assert_eq!(FieldKind::Decimal.to_string(), "decimal");
    }
}
