//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the ingestion runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the P1-EMS workspace.
//! This crate exposes configuration loading and tracing setup consumed by the
//! reader daemon and the pipeline crates.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, BufferConfig, LoadedAppConfig, LoggingConfig, Parity, SerialConfig, SimulationConfig,
    SinkKind, SourceConfig, SourceKind, StorageConfig,
};
pub use logging::{init_tracing, LogFormat};
