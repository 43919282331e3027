//! ---
//! ems_section: "11-simulation-test-harness"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Replay of captured P1 port output."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use p1_transport::{trim_line_ending, LineSource, LineSourceError};
use tracing::{debug, info};

/// Line source cycling through a text dump of meter output.
///
/// The dump is read once at construction; playback wraps around to the first
/// line after the last one.
#[derive(Debug, Clone)]
pub struct ReplayLineSource {
    name: String,
    lines: Vec<String>,
    cursor: usize,
    line_delay: Duration,
    open: bool,
}

impl ReplayLineSource {
    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read telegram dump {}", path.display()))?;
        Self::from_text(path.display().to_string(), &contents)
            .with_context(|| format!("invalid telegram dump {}", path.display()))
    }

    pub fn from_text(name: impl Into<String>, contents: &str) -> Result<Self> {
        let lines: Vec<String> = contents
            .lines()
            .map(|line| trim_line_ending(line).to_owned())
            .collect();
        if !lines.iter().any(|line| line.starts_with('!')) {
            anyhow::bail!("dump contains no complete telegram");
        }
        Ok(Self {
            name: name.into(),
            lines,
            cursor: 0,
            line_delay: Duration::ZERO,
            open: false,
        })
    }

    /// Pause before each line, mimicking the pacing of a real port.
    pub fn with_line_delay(mut self, delay: Duration) -> Self {
        self.line_delay = delay;
        self
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[async_trait]
impl LineSource for ReplayLineSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn open(&mut self) -> p1_transport::Result<()> {
        if self.open {
            return Err(LineSourceError::AlreadyOpen(self.name.clone()));
        }
        self.open = true;
        info!(source = %self.name, lines = self.lines.len(), "telegram replay opened");
        Ok(())
    }

    async fn close(&mut self) -> p1_transport::Result<()> {
        if !self.open {
            return Err(LineSourceError::NotOpen(self.name.clone()));
        }
        self.open = false;
        Ok(())
    }

    async fn read_line(&mut self, timeout: Duration) -> p1_transport::Result<String> {
        if !self.open {
            return Err(LineSourceError::NotOpen(self.name.clone()));
        }
        if self.line_delay > timeout {
            tokio::time::sleep(timeout).await;
            return Err(LineSourceError::Timeout(timeout));
        }
        if !self.line_delay.is_zero() {
            tokio::time::sleep(self.line_delay).await;
        }

        let line = self.lines[self.cursor].clone();
        self.cursor += 1;
        if self.cursor == self.lines.len() {
            debug!(source = %self.name, "telegram replay wrapped around");
            self.cursor = 0;
        }
        Ok(line)
    }
}
