//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Wiring of reader, buffers and parser."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use p1_common::AppConfig;
use p1_msg::{BufferMetrics, BufferOptions, MessageBuffer, MessagingError};
use p1_transport::LineSource;
use prometheus::Registry;
use thiserror::Error;
use tracing::{info, warn};

use crate::measurement::Measurement;
use crate::parser::{FieldParser, ParseError};
use crate::reader::{ReaderError, ReaderOptions, TelegramReader};
use crate::telegram::Telegram;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("field dictionary rejected: {0}")]
    Dictionary(#[from] ParseError),
    #[error("message buffer setup failed: {0}")]
    Buffer(#[from] MessagingError),
    #[error("telegram reader setup failed: {0}")]
    Reader(#[from] ReaderError),
}

/// Activity summary logged at shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineMetrics {
    pub telegrams_read: u64,
    pub telegrams: BufferMetrics,
    pub measurements: BufferMetrics,
}

/// Line source, telegram reader, telegram buffer, field parser and
/// measurement buffer connected in that order.
///
/// Sinks and other consumers register on [`Pipeline::measurements`] before
/// [`Pipeline::start`] so they see the first measurement.
pub struct Pipeline<S> {
    reader: TelegramReader<S>,
    telegrams: MessageBuffer<Telegram>,
    measurements: MessageBuffer<Measurement>,
    registry: Registry,
}

impl<S> Pipeline<S>
where
    S: LineSource + 'static,
{
    /// Build the pipeline with a fresh metrics registry. Fails when the field
    /// dictionary is incomplete.
    pub fn new(
        source: S,
        reader: ReaderOptions,
        buffers: BufferOptions,
    ) -> Result<Self, PipelineError> {
        Self::with_registry(source, reader, buffers, Registry::new())
    }

    /// Build the pipeline and register its buffer and reader metrics with
    /// `registry`.
    pub fn with_registry(
        source: S,
        reader: ReaderOptions,
        buffers: BufferOptions,
        registry: Registry,
    ) -> Result<Self, PipelineError> {
        let telegrams = MessageBuffer::with_registry("telegrams", buffers, &registry)?;
        let measurements = MessageBuffer::with_registry("measurements", buffers, &registry)?;

        let parser = Arc::new(FieldParser::new(measurements.clone())?);
        parser.attach(&telegrams);

        Ok(Self {
            reader: TelegramReader::new(source, telegrams.clone(), reader, &registry)?,
            telegrams,
            measurements,
            registry,
        })
    }

    pub fn from_config(source: S, config: &AppConfig) -> Result<Self, PipelineError> {
        Self::new(
            source,
            ReaderOptions::from(&config.source),
            BufferOptions {
                capacity: config.buffer.capacity,
            },
        )
    }

    /// Registry holding the buffer and reader metrics. Sinks attached to the
    /// pipeline register their own metrics here too.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn telegrams(&self) -> &MessageBuffer<Telegram> {
        &self.telegrams
    }

    pub fn measurements(&self) -> &MessageBuffer<Measurement> {
        &self.measurements
    }

    pub fn reader(&self) -> &TelegramReader<S> {
        &self.reader
    }

    pub async fn start(&self) -> Result<(), ReaderError> {
        self.reader.start().await
    }

    /// Stop the reader, then give queued telegrams and measurements up to
    /// `drain_timeout` per buffer to reach their handlers.
    pub async fn shutdown(&self, drain_timeout: Duration) -> Result<PipelineMetrics, ReaderError> {
        self.reader.stop().await?;
        for (name, drained) in [
            ("telegrams", self.telegrams.wait_idle(drain_timeout).await),
            ("measurements", self.measurements.wait_idle(drain_timeout).await),
        ] {
            if !drained {
                warn!(buffer = name, timeout = ?drain_timeout, "buffer not drained before shutdown");
            }
        }

        let metrics = self.metrics();
        info!(
            telegrams_read = metrics.telegrams_read,
            measurements_published = metrics.measurements.published,
            deliveries_failed = metrics.measurements.failed,
            items_dropped = metrics.telegrams.dropped + metrics.measurements.dropped,
            "pipeline stopped"
        );
        Ok(metrics)
    }

    pub fn metrics(&self) -> PipelineMetrics {
        PipelineMetrics {
            telegrams_read: self.reader.telegrams_read(),
            telegrams: self.telegrams.metrics(),
            measurements: self.measurements.metrics(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p1_sim::fixtures::sample_lines;
    use p1_transport::ScriptedLineSource;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn sample_telegram_reaches_measurement_handlers() {
        let (source, feed) = ScriptedLineSource::new("scripted");
        let pipeline = Pipeline::new(
            source,
            ReaderOptions {
                read_timeout: Duration::from_millis(50),
                error_backoff: Duration::from_millis(5),
            },
            BufferOptions::unbounded(),
        )
        .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        pipeline
            .measurements()
            .register_named("collector", move |measurement: Measurement| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(measurement);
                    Ok(())
                }
            });

        pipeline.start().await.unwrap();
        feed.push_lines(sample_lines());
        let measurement = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let metrics = pipeline.shutdown(Duration::from_secs(1)).await.unwrap();

        assert_eq!(measurement.instantaneous_voltage_l2, 220.2);
        assert_eq!(metrics.telegrams_read, 1);
        assert_eq!(metrics.measurements.delivered, 1);
        assert_eq!(metrics.measurements.pending, 0);
    }

    #[tokio::test]
    async fn malformed_telegram_publishes_nothing() {
        let (source, feed) = ScriptedLineSource::new("scripted");
        let pipeline = Pipeline::from_config(source, &AppConfig::default()).unwrap();
        pipeline.start().await.unwrap();

        feed.push_lines(["/HDR", "1-0:1.8.1(x*kWh)", "!0000"]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let metrics = pipeline.shutdown(Duration::from_secs(1)).await.unwrap();

        assert_eq!(metrics.telegrams.published, 1);
        assert_eq!(metrics.telegrams.delivered, 1);
        assert_eq!(metrics.measurements.published, 0);
    }

    #[tokio::test]
    async fn buffers_and_reader_share_the_pipeline_registry() {
        let (source, _feed) = ScriptedLineSource::new("scripted");
        let pipeline = Pipeline::from_config(source, &AppConfig::default()).unwrap();

        let families = pipeline.registry().gather();
        let published = families
            .iter()
            .find(|f| f.get_name() == "p1_buffer_published_total")
            .expect("buffer counters exported");
        let buffers: Vec<&str> = published
            .get_metric()
            .iter()
            .flat_map(|metric| metric.get_label())
            .map(|label| label.get_value())
            .collect();
        assert!(buffers.contains(&"telegrams"));
        assert!(buffers.contains(&"measurements"));
        assert!(families
            .iter()
            .any(|f| f.get_name() == "p1_telegrams_read_total"));
    }
}
