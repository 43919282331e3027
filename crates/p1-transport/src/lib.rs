//! ---
//! ems_section: "03-field-connectivity"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Line sources feeding raw meter telegram text."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Line sources for the P1 telegram reader.
//!
//! A [`LineSource`] yields the meter output one text line at a time. The reader
//! only relies on the open/close lifecycle and on `read_line` distinguishing a
//! timeout from every other failure.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod scripted;
pub mod serial;

pub use scripted::{ScriptedLineSource, ScriptedStep};
pub use serial::SerialLineSource;

/// Errors raised by line sources.
#[derive(Debug, Error)]
pub enum LineSourceError {
    /// No complete line arrived within the requested timeout.
    #[error("no line received within {0:?}")]
    Timeout(Duration),
    /// The underlying transport failed.
    #[error("line source I/O failure: {0}")]
    Io(#[from] std::io::Error),
    /// `read_line` or `close` was called on a closed source.
    #[error("line source '{0}' is not open")]
    NotOpen(String),
    /// `open` was called on a source that is already open.
    #[error("line source '{0}' is already open")]
    AlreadyOpen(String),
}

impl LineSourceError {
    /// True for the timeout case the reader treats as routine.
    pub fn is_timeout(&self) -> bool {
        matches!(self, LineSourceError::Timeout(_))
    }
}

/// Result alias used across line sources.
pub type Result<T> = std::result::Result<T, LineSourceError>;

/// Text line stream produced by a meter or a stand-in for one.
#[async_trait]
pub trait LineSource: Send {
    /// Human readable identifier used in log events.
    fn name(&self) -> &str;

    /// Whether the source is currently open.
    fn is_open(&self) -> bool;

    /// Open the underlying transport.
    async fn open(&mut self) -> Result<()>;

    /// Close the underlying transport.
    async fn close(&mut self) -> Result<()>;

    /// Read one line without its line terminator, waiting at most `timeout`.
    async fn read_line(&mut self, timeout: Duration) -> Result<String>;
}

#[async_trait]
impl<S> LineSource for Box<S>
where
    S: LineSource + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    async fn open(&mut self) -> Result<()> {
        (**self).open().await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }

    async fn read_line(&mut self, timeout: Duration) -> Result<String> {
        (**self).read_line(timeout).await
    }
}

/// Strip trailing `\r`/`\n` characters left by CRLF framed transports.
pub fn trim_line_ending(line: &str) -> &str {
    line.trim_end_matches(['\r', '\n'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_crlf_only() {
        assert_eq!(trim_line_ending("1-3:0.2.8(50)\r\n"), "1-3:0.2.8(50)");
        assert_eq!(trim_line_ending("!EF2F\r"), "!EF2F");
        assert_eq!(trim_line_ending("  padded  "), "  padded  ");
    }

    #[test]
    fn timeout_is_distinct_from_io() {
        assert!(LineSourceError::Timeout(Duration::from_secs(1)).is_timeout());
        let io = LineSourceError::from(std::io::Error::other("boom"));
        assert!(!io.is_timeout());
    }
}
