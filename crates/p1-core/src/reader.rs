//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telegram framing over a line source."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use p1_common::SourceConfig;
use p1_msg::{MessageBuffer, PublishOutcome};
use p1_transport::{trim_line_ending, LineSource, LineSourceError};
use prometheus::{IntCounter, Opts, Registry};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::telegram::Telegram;

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("failed to open line source: {0}")]
    Open(#[source] LineSourceError),
    #[error("failed to close line source: {0}")]
    Close(#[source] LineSourceError),
    #[error("failed to register reader metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Timing of the read loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderOptions {
    /// Longest wait for a single line before logging a timeout.
    pub read_timeout: Duration,
    /// Pause after a read error other than a timeout.
    pub error_backoff: Duration,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(20),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl From<&SourceConfig> for ReaderOptions {
    fn from(config: &SourceConfig) -> Self {
        Self {
            read_timeout: config.read_timeout,
            error_backoff: config.error_backoff,
        }
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Assembles lines from a [`LineSource`] into telegrams and publishes them.
pub struct TelegramReader<S> {
    source: Arc<Mutex<S>>,
    output: MessageBuffer<Telegram>,
    options: ReaderOptions,
    running: parking_lot::Mutex<Option<Running>>,
    telegrams: IntCounter,
}

impl<S> TelegramReader<S>
where
    S: LineSource + 'static,
{
    /// Build a reader whose telegram counter is registered with `registry`.
    pub fn new(
        source: S,
        output: MessageBuffer<Telegram>,
        options: ReaderOptions,
        registry: &Registry,
    ) -> Result<Self, ReaderError> {
        let telegrams = IntCounter::with_opts(Opts::new(
            "p1_telegrams_read_total",
            "Telegrams framed from the line source",
        ))?;
        registry.register(Box::new(telegrams.clone()))?;
        Ok(Self {
            source: Arc::new(Mutex::new(source)),
            output,
            options,
            running: parking_lot::Mutex::new(None),
            telegrams,
        })
    }

    /// Open the source and spawn the read loop.
    ///
    /// A source that is already open is logged and left alone; the call still
    /// succeeds.
    pub async fn start(&self) -> Result<(), ReaderError> {
        let mut source = self.source.lock().await;
        if source.is_open() {
            error!(source = %source.name(), "line source already open; reader not started");
            return Ok(());
        }
        source.open().await.map_err(ReaderError::Open)?;
        info!(source = %source.name(), timeout = ?self.options.read_timeout, "telegram reader started");
        drop(source);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(read_loop(
            Arc::clone(&self.source),
            self.output.clone(),
            self.options,
            cancel.clone(),
            self.telegrams.clone(),
        ));
        let previous = self.running.lock().replace(Running { cancel, task });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        Ok(())
    }

    /// Cancel the read loop, wait for it and close the source. Calling it
    /// again, or before `start`, does nothing.
    pub async fn stop(&self) -> Result<(), ReaderError> {
        let running = self.running.lock().take();
        let Some(running) = running else {
            debug!("telegram reader not running");
            return Ok(());
        };
        running.cancel.cancel();
        if let Err(err) = running.task.await {
            error!(error = %err, "telegram read loop terminated abnormally");
        }

        let mut source = self.source.lock().await;
        if source.is_open() {
            source.close().await.map_err(ReaderError::Close)?;
        }
        info!(
            source = %source.name(),
            telegrams = self.telegrams_read(),
            "telegram reader stopped"
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Number of telegrams completed since construction.
    pub fn telegrams_read(&self) -> u64 {
        self.telegrams.get()
    }

    /// Shared handle on the source, for inspection while the reader is stopped.
    pub fn source(&self) -> Arc<Mutex<S>> {
        Arc::clone(&self.source)
    }
}

async fn read_loop<S>(
    source: Arc<Mutex<S>>,
    output: MessageBuffer<Telegram>,
    options: ReaderOptions,
    cancel: CancellationToken,
    telegrams: IntCounter,
) where
    S: LineSource + 'static,
{
    let mut lines: Vec<String> = Vec::new();
    loop {
        let result = {
            let mut source = source.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = source.read_line(options.read_timeout) => result,
            }
        };

        match result {
            Ok(line) => {
                let line = trim_line_ending(&line).to_owned();
                let complete = line.starts_with('!');
                lines.push(line);
                if complete {
                    let telegram = Telegram::new(std::mem::take(&mut lines), Utc::now());
                    publish(&output, telegram, &telegrams);
                }
            }
            Err(err) if err.is_timeout() => {
                debug!(partial_lines = lines.len(), "no line within read timeout");
            }
            Err(err) => {
                warn!(error = %err, backoff = ?options.error_backoff, "line source read failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(options.error_backoff) => {}
                }
            }
        }
    }
    if !lines.is_empty() {
        debug!(partial_lines = lines.len(), "discarding partial telegram on shutdown");
    }
}

fn publish(output: &MessageBuffer<Telegram>, telegram: Telegram, telegrams: &IntCounter) {
    for line in telegram.lines() {
        trace!(%line, "telegram line");
    }
    telegrams.inc();
    let count = telegrams.get();
    let lines = telegram.len();
    match output.publish(telegram) {
        PublishOutcome::Queued => debug!(telegram = count, lines, "telegram published"),
        PublishOutcome::Dropped => warn!(telegram = count, "telegram buffer full; telegram dropped"),
        PublishOutcome::Closed => error!(telegram = count, "telegram buffer closed"),
    }
}
