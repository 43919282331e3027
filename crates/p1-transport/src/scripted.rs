//! ---
//! ems_section: "03-field-connectivity"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Scripted in-memory line source for tests and tooling."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{LineSource, LineSourceError, Result};

/// One scripted outcome of `read_line`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedStep {
    Line(String),
    /// Report a read timeout immediately.
    Timeout,
    /// Report an I/O failure carrying this message.
    Error(String),
}

#[derive(Debug, Default)]
struct Stats {
    opens: AtomicUsize,
    closes: AtomicUsize,
    reads: AtomicUsize,
}

/// Line source replaying queued [`ScriptedStep`]s.
///
/// Once the queue is empty `read_line` behaves like an idle meter: it waits for
/// the full timeout (or the next pushed step) and reports
/// [`LineSourceError::Timeout`].
pub struct ScriptedLineSource {
    name: String,
    open: bool,
    open_failure: Option<String>,
    steps: mpsc::UnboundedReceiver<ScriptedStep>,
    stats: Arc<Stats>,
}

/// Feeding side of a [`ScriptedLineSource`], usable while a reader owns the source.
#[derive(Clone)]
pub struct ScriptedFeed {
    tx: mpsc::UnboundedSender<ScriptedStep>,
    stats: Arc<Stats>,
}

impl ScriptedLineSource {
    /// Empty source plus the feed used to push steps into it.
    pub fn new(name: impl Into<String>) -> (Self, ScriptedFeed) {
        let (tx, steps) = mpsc::unbounded_channel();
        let stats = Arc::new(Stats::default());
        let source = Self {
            name: name.into(),
            open: false,
            open_failure: None,
            steps,
            stats: Arc::clone(&stats),
        };
        (source, ScriptedFeed { tx, stats })
    }

    /// Source pre-loaded with `lines`.
    pub fn from_lines<I, L>(name: impl Into<String>, lines: I) -> (Self, ScriptedFeed)
    where
        I: IntoIterator<Item = L>,
        L: Into<String>,
    {
        let (source, feed) = Self::new(name);
        feed.push_lines(lines);
        (source, feed)
    }

    /// Make every `open` call fail with an I/O error.
    pub fn with_open_failure(mut self, message: impl Into<String>) -> Self {
        self.open_failure = Some(message.into());
        self
    }
}

impl ScriptedFeed {
    pub fn push(&self, step: ScriptedStep) {
        let _ = self.tx.send(step);
    }

    pub fn push_line(&self, line: impl Into<String>) {
        self.push(ScriptedStep::Line(line.into()));
    }

    pub fn push_lines<I, L>(&self, lines: I)
    where
        I: IntoIterator<Item = L>,
        L: Into<String>,
    {
        for line in lines {
            self.push_line(line);
        }
    }

    /// Number of successful `open` calls.
    pub fn opens(&self) -> usize {
        self.stats.opens.load(Ordering::Relaxed)
    }

    /// Number of successful `close` calls.
    pub fn closes(&self) -> usize {
        self.stats.closes.load(Ordering::Relaxed)
    }

    /// Number of `read_line` calls made on an open source.
    pub fn reads(&self) -> usize {
        self.stats.reads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LineSource for ScriptedLineSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn open(&mut self) -> Result<()> {
        if self.open {
            return Err(LineSourceError::AlreadyOpen(self.name.clone()));
        }
        if let Some(message) = &self.open_failure {
            return Err(LineSourceError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                message.clone(),
            )));
        }
        self.open = true;
        self.stats.opens.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.open {
            return Err(LineSourceError::NotOpen(self.name.clone()));
        }
        self.open = false;
        self.stats.closes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn read_line(&mut self, timeout: Duration) -> Result<String> {
        if !self.open {
            return Err(LineSourceError::NotOpen(self.name.clone()));
        }
        self.stats.reads.fetch_add(1, Ordering::Relaxed);

        let step = match tokio::time::timeout(timeout, self.steps.recv()).await {
            Ok(Some(step)) => step,
            Ok(None) => {
                // every feed handle is gone; idle until the deadline
                tokio::time::sleep(timeout).await;
                return Err(LineSourceError::Timeout(timeout));
            }
            Err(_) => return Err(LineSourceError::Timeout(timeout)),
        };

        match step {
            ScriptedStep::Line(line) => Ok(line),
            ScriptedStep::Timeout => Err(LineSourceError::Timeout(timeout)),
            ScriptedStep::Error(message) => Err(LineSourceError::Io(io::Error::other(message))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn replays_steps_in_order() {
        let (mut source, feed) = ScriptedLineSource::from_lines("scripted", ["a", "b"]);
        feed.push(ScriptedStep::Timeout);
        feed.push(ScriptedStep::Error("unplugged".into()));

        source.open().await.unwrap();
        assert_eq!(source.read_line(WAIT).await.unwrap(), "a");
        assert_eq!(source.read_line(WAIT).await.unwrap(), "b");
        assert!(source.read_line(WAIT).await.unwrap_err().is_timeout());
        assert!(matches!(
            source.read_line(WAIT).await,
            Err(LineSourceError::Io(_))
        ));
        assert!(source.read_line(WAIT).await.unwrap_err().is_timeout());
        assert_eq!(feed.reads(), 5);
    }

    #[tokio::test]
    async fn lifecycle_is_enforced() {
        let (mut source, feed) = ScriptedLineSource::new("scripted");
        assert!(matches!(
            source.read_line(WAIT).await,
            Err(LineSourceError::NotOpen(_))
        ));
        source.open().await.unwrap();
        assert!(matches!(
            source.open().await,
            Err(LineSourceError::AlreadyOpen(_))
        ));
        source.close().await.unwrap();
        assert!(matches!(
            source.close().await,
            Err(LineSourceError::NotOpen(_))
        ));
        assert_eq!((feed.opens(), feed.closes()), (1, 1));
    }

    #[tokio::test]
    async fn open_failure_is_reported() {
        let (source, _feed) = ScriptedLineSource::new("scripted");
        let mut source = source.with_open_failure("no such device");
        assert!(matches!(source.open().await, Err(LineSourceError::Io(_))));
        assert!(!source.is_open());
    }

    #[tokio::test]
    async fn boxed_source_delegates() {
        let (source, _feed) = ScriptedLineSource::from_lines("boxed", ["x"]);
        let mut boxed: Box<dyn LineSource> = Box::new(source);
        boxed.open().await.unwrap();
        assert_eq!(boxed.name(), "boxed");
        assert_eq!(boxed.read_line(WAIT).await.unwrap(), "x");
    }
}
