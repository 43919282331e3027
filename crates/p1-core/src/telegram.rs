//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Raw telegram frames as received from the meter."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use chrono::{DateTime, Utc};

/// One complete frame of meter output, from header line to `!` terminator.
///
/// Lines are shared behind an `Arc`, so cloning a telegram for every handler
/// of a buffer does not copy the text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telegram {
    lines: Arc<[String]>,
    received_at: DateTime<Utc>,
}

impl Telegram {
    pub fn new(lines: Vec<String>, received_at: DateTime<Utc>) -> Self {
        Self {
            lines: lines.into(),
            received_at,
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Wall clock time at which the terminator line was read.
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// First line starting with `prefix`.
    pub fn line_starting_with(&self, prefix: &str) -> Option<&str> {
        self.lines
            .iter()
            .map(String::as_str)
            .find(|line| line.starts_with(prefix))
    }

    /// Checksum text following the `!` of the terminator line, if any.
    pub fn checksum(&self) -> Option<&str> {
        self.lines
            .last()
            .and_then(|line| line.strip_prefix('!'))
            .map(str::trim)
            .filter(|checksum| !checksum.is_empty())
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn telegram(lines: &[&str]) -> Telegram {
        Telegram::new(lines.iter().map(|l| l.to_string()).collect(), Utc::now())
    }

    #[test]
    fn finds_first_matching_line() {
        let telegram = telegram(&["/HDR", "1-0:1.8.1(1*kWh)", "1-0:1.8.1(2*kWh)", "!AB12"]);
        assert_eq!(
            telegram.line_starting_with("1-0:1.8.1"),
            Some("1-0:1.8.1(1*kWh)")
        );
        assert_eq!(telegram.line_starting_with("1-0:2.8.1"), None);
    }

    #[test]
    fn exposes_checksum() {
        assert_eq!(telegram(&["/HDR", "!EF2F"]).checksum(), Some("EF2F"));
        assert_eq!(telegram(&["/HDR", "!"]).checksum(), None);
    }

    #[test]
    fn clones_share_lines() {
        let original = telegram(&["/HDR", "!EF2F"]);
        let copy = original.clone();
        assert!(Arc::ptr_eq(&original.lines, &copy.lines));
        assert_eq!(copy.len(), 2);
    }
}
