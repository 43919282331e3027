//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telegram framing, field extraction and pipeline lifecycle."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Telegram reader, field parser and the pipeline tying them to the buffers.

pub mod measurement;
pub mod obis;
pub mod parser;
pub mod pipeline;
pub mod reader;
pub mod telegram;

pub use measurement::Measurement;
pub use obis::{FieldDescriptor, FieldDictionary, FieldKind, FieldName};
pub use parser::{FieldParser, ParseError};
pub use pipeline::{Pipeline, PipelineError, PipelineMetrics};
pub use reader::{ReaderError, ReaderOptions, TelegramReader};
pub use telegram::Telegram;
