//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Fixed-delay retry wrapper attaching sinks to the measurement buffer."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use p1_common::StorageConfig;
use p1_core::Measurement;
use p1_msg::MessageBuffer;
use prometheus::{IntCounter, Opts, Registry};
use tracing::{error, info, warn};

use crate::{MeasurementSink, PersistenceError, Result};

/// Fixed-delay retry policy for sink writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause between attempts.
    pub delay: Duration,
    /// Give up after this many attempts; `None` retries forever.
    pub max_attempts: Option<usize>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

impl From<&StorageConfig> for RetryPolicy {
    fn from(config: &StorageConfig) -> Self {
        Self {
            delay: config.retry_delay,
            max_attempts: config.max_attempts,
        }
    }
}

/// Sink wrapper retrying failed writes according to a [`RetryPolicy`].
///
/// A write counts as failed when the sink errors or reports a record count
/// other than one.
#[derive(Debug)]
pub struct RetryingSink<S> {
    sink: S,
    policy: RetryPolicy,
    attempts: IntCounter,
    failures: IntCounter,
}

impl<S> RetryingSink<S>
where
    S: MeasurementSink + 'static,
{
    /// Wrap `sink` with `policy`, keeping its counters in a private registry.
    pub fn new(sink: S, policy: RetryPolicy) -> Result<Self> {
        Self::with_registry(sink, policy, &Registry::new())
    }

    /// Wrap `sink` with `policy` and register its attempt and failure
    /// counters, labelled with the sink name, with `registry`.
    pub fn with_registry(sink: S, policy: RetryPolicy, registry: &Registry) -> Result<Self> {
        let opts = |name: &str, help: &str| Opts::new(name, help).const_label("sink", sink.name());
        let attempts = IntCounter::with_opts(opts(
            "p1_sink_write_attempts_total",
            "Measurement write attempts, successful or not",
        ))?;
        let failures = IntCounter::with_opts(opts(
            "p1_sink_write_failures_total",
            "Measurement write attempts that failed",
        ))?;
        registry.register(Box::new(attempts.clone()))?;
        registry.register(Box::new(failures.clone()))?;

        Ok(Self {
            sink,
            policy,
            attempts,
            failures,
        })
    }

    /// Wrapped sink.
    pub fn inner(&self) -> &S {
        &self.sink
    }

    /// Write attempts made so far, successful or not.
    pub fn attempts(&self) -> u64 {
        self.attempts.get()
    }

    /// Failed write attempts so far.
    pub fn failures(&self) -> u64 {
        self.failures.get()
    }

    /// Store `measurement`, retrying until it succeeds or the policy gives up.
    pub async fn save(&self, measurement: &Measurement) -> Result<usize> {
        let name = self.sink.name();
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            self.attempts.inc();
            let err = match self.sink.save(measurement).await {
                Ok(1) => {
                    if attempt > 1 {
                        info!(sink = name, attempt, "measurement stored after retry");
                    }
                    return Ok(1);
                }
                Ok(written) => PersistenceError::StorageWrite {
                    sink: name.to_owned(),
                    written,
                },
                Err(err) => err,
            };
            self.failures.inc();

            if !err.is_retryable() {
                warn!(sink = name, attempt, error = %err, "measurement not retried");
                return Err(err);
            }
            if self.policy.max_attempts.is_some_and(|max| attempt >= max) {
                error!(sink = name, attempt, error = %err, "measurement write abandoned");
                return Err(PersistenceError::RetriesExhausted {
                    sink: name.to_owned(),
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
            warn!(
                sink = name,
                attempt,
                delay = ?self.policy.delay,
                error = %err,
                "measurement write failed; retrying"
            );
            tokio::time::sleep(self.policy.delay).await;
        }
    }

    /// Register this sink as a named handler of `measurements`.
    pub fn attach(self: Arc<Self>, measurements: &MessageBuffer<Measurement>) {
        let name = format!("sink-{}", self.sink.name());
        measurements.register_named(name, move |measurement: Measurement| {
            let sink = Arc::clone(&self);
            async move {
                sink.save(&measurement).await?;
                Ok(())
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Sink replaying scripted outcomes, then succeeding.
    struct FlakySink {
        outcomes: Mutex<VecDeque<Result<usize>>>,
        stored: AtomicU64,
    }

    impl FlakySink {
        fn new(outcomes: Vec<Result<usize>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                stored: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl MeasurementSink for FlakySink {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn save(&self, _measurement: &Measurement) -> Result<usize> {
            let outcome = self.outcomes.lock().pop_front().unwrap_or(Ok(1));
            if matches!(outcome, Ok(1)) {
                self.stored.fetch_add(1, Ordering::Relaxed);
            }
            outcome
        }
    }

    fn fast(max_attempts: Option<usize>) -> RetryPolicy {
        RetryPolicy {
            delay: Duration::from_millis(1),
            max_attempts,
        }
    }

    fn io_error() -> PersistenceError {
        PersistenceError::Io(std::io::Error::other("disk full"))
    }

    #[tokio::test]
    async fn retries_until_success() {
        let sink = RetryingSink::new(
            FlakySink::new(vec![Err(io_error()), Ok(0), Err(io_error())]),
            fast(None),
        )
        .unwrap();
        let written = sink.save(&Measurement::empty(Utc::now())).await.unwrap();
        assert_eq!(written, 1);
        assert_eq!(sink.attempts(), 4);
        assert_eq!(sink.failures(), 3);
        assert_eq!(sink.inner().stored.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn wrong_record_count_is_a_failure() {
        let sink = RetryingSink::new(FlakySink::new(vec![Ok(2)]), fast(Some(1))).unwrap();
        let err = sink.save(&Measurement::empty(Utc::now())).await.unwrap_err();
        match err {
            PersistenceError::RetriesExhausted { attempts, last, .. } => {
                assert_eq!(attempts, 1);
                assert!(matches!(
                    *last,
                    PersistenceError::StorageWrite { written: 2, .. }
                ));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn bounded_policy_gives_up() {
        let sink = RetryingSink::new(
            FlakySink::new(vec![Err(io_error()), Err(io_error()), Err(io_error())]),
            fast(Some(2)),
        )
        .unwrap();
        assert!(sink.save(&Measurement::empty(Utc::now())).await.is_err());
        assert_eq!(sink.attempts(), 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let stale = PersistenceError::StaleMeasurement {
            sink: "flaky".into(),
            date: chrono::NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            current: chrono::NaiveDate::from_ymd_opt(2024, 3, 2).unwrap(),
        };
        let sink = RetryingSink::new(FlakySink::new(vec![Err(stale)]), fast(None)).unwrap();
        let err = sink.save(&Measurement::empty(Utc::now())).await.unwrap_err();
        assert!(matches!(err, PersistenceError::StaleMeasurement { .. }));
        assert_eq!(sink.attempts(), 1);
        assert_eq!(sink.inner().stored.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn attached_sink_stores_buffered_measurements() {
        let buffer = MessageBuffer::new("measurements").unwrap();
        let sink = Arc::new(
            RetryingSink::new(FlakySink::new(vec![Err(io_error())]), fast(None)).unwrap(),
        );
        Arc::clone(&sink).attach(&buffer);

        buffer.publish(Measurement::empty(Utc::now()));
        buffer.publish(Measurement::empty(Utc::now()));
        assert!(buffer.wait_idle(Duration::from_secs(2)).await);

        assert_eq!(sink.inner().stored.load(Ordering::Relaxed), 2);
        assert_eq!(buffer.metrics().delivered, 2);
        assert_eq!(buffer.metrics().failed, 0);
    }

    #[tokio::test]
    async fn counters_are_exported_per_sink() {
        let registry = Registry::new();
        let sink = RetryingSink::with_registry(
            FlakySink::new(vec![Err(io_error())]),
            fast(None),
            &registry,
        )
        .unwrap();
        sink.save(&Measurement::empty(Utc::now())).await.unwrap();

        let families = registry.gather();
        let failures = families
            .iter()
            .find(|f| f.get_name() == "p1_sink_write_failures_total")
            .expect("failure counter exported");
        let metric = &failures.get_metric()[0];
        assert_eq!(metric.get_counter().get_value(), 1.0);
        assert_eq!(metric.get_label()[0].get_value(), "flaky");
        assert!(families
            .iter()
            .any(|f| f.get_name() == "p1_sink_write_attempts_total"));
    }

    #[test]
    fn policy_follows_storage_config() {
        let config = StorageConfig {
            retry_delay: Duration::from_secs(9),
            max_attempts: Some(3),
            ..StorageConfig::default()
        };
        assert_eq!(
            RetryPolicy::from(&config),
            RetryPolicy {
                delay: Duration::from_secs(9),
                max_attempts: Some(3),
            }
        );
        assert_eq!(RetryPolicy::default().delay, Duration::from_secs(5));
    }
}
