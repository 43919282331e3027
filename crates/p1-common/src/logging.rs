//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Tracing setup for the reader daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "P1_EMS_LOG";
const DEFAULT_DIRECTIVE: &str = "info";

/// Console log formats for the daemon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Keeps the log file writer alive; buffered events are flushed when it is
/// dropped, so hold it until the daemon exits.
#[must_use = "dropping the guard stops the log file writer"]
pub struct LogGuard {
    _file: WorkerGuard,
}

/// Install the global subscriber: console output in `config.format` plus a
/// daily rolling JSON file `<directory>/<prefix>.log.YYYY-MM-DD`.
///
/// `P1_EMS_LOG` overrides the filter (e.g. `p1_core=trace` to see every
/// telegram line), then `RUST_LOG`, then `info`. A subscriber installed
/// earlier is left in place.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<LogGuard> {
    std::fs::create_dir_all(&config.directory)?;
    let prefix = log_file_prefix(service_name, config);
    let (file_writer, file_guard) =
        tracing_appender::non_blocking(daily(&config.directory, format!("{prefix}.log")));

    let file_layer = fmt::layer()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_current_span(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(build_filter(std::env::var(LOG_ENV).ok()))
        .with(console_layer(config.format))
        .with(file_layer)
        .try_init()
        .ok();

    info!(service = %service_name, log_dir = %config.directory.display(), format = ?config.format, "tracing initialised");
    Ok(LogGuard { _file: file_guard })
}

fn log_file_prefix(service_name: &str, config: &LoggingConfig) -> String {
    config
        .file_prefix
        .clone()
        .filter(|prefix| !prefix.trim().is_empty())
        .unwrap_or_else(|| service_name.to_owned())
}

fn console_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = fmt::layer()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_writer(std::io::stdout);
    match format {
        LogFormat::StructuredJson => layer.with_target(false).json().boxed(),
        LogFormat::Pretty => layer.with_target(true).compact().boxed(),
    }
}

fn build_filter(override_directive: Option<String>) -> EnvFilter {
    match override_directive {
        Some(directive) => EnvFilter::try_new(&directive).unwrap_or_else(|err| {
            eprintln!("invalid {LOG_ENV} directive ({err}); defaulting to {DEFAULT_DIRECTIVE} logging");
            EnvFilter::new(DEFAULT_DIRECTIVE)
        }),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logging_in(dir: &std::path::Path, prefix: Option<&str>) -> LoggingConfig {
        LoggingConfig {
            directory: dir.join("logs"),
            format: LogFormat::Pretty,
            file_prefix: prefix.map(str::to_owned),
        }
    }

    #[test]
    fn override_directive_is_used() {
        let filter = build_filter(Some("p1_core=trace".into()));
        assert!(filter.to_string().contains("p1_core=trace"));
    }

    #[test]
    fn invalid_directive_falls_back_to_info() {
        let filter = build_filter(Some("p1_core=loud".into()));
        assert_eq!(filter.to_string(), DEFAULT_DIRECTIVE);
    }

    #[test]
    fn blank_prefix_uses_service_name() {
        let dir = std::path::Path::new("/var/log/p1");
        assert_eq!(log_file_prefix("p1-readerd", &logging_in(dir, Some(" "))), "p1-readerd");
        assert_eq!(log_file_prefix("p1-readerd", &logging_in(dir, Some("meter"))), "meter");
    }

    #[test]
    fn init_creates_log_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = logging_in(dir.path(), Some("test"));
        let _guard = init_tracing("p1-test", &config).unwrap();
        assert!(config.directory.is_dir());
    }
}
