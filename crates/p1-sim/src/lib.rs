//! ---
//! ems_section: "11-simulation-test-harness"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Simulated meter and replay line sources."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Stand-ins for a physical P1 port.
//!
//! [`SimulatedMeter`] synthesizes DSMR telegrams with drifting energy registers.
//! [`ReplayLineSource`] plays back a captured dump of meter output.

pub mod fixtures;
pub mod meter;
pub mod replay;

pub use meter::SimulatedMeter;
pub use replay::ReplayLineSource;
