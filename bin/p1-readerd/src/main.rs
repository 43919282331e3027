//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the P1 reader daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use p1_common::{init_tracing, AppConfig, SinkKind, SourceKind};
use p1_core::Pipeline;
use p1_persistence::{
    CsvSink, JsonLinesSink, LogSink, MeasurementSink, RetryPolicy, RetryingSink, SqliteSink,
};
use p1_sim::{ReplayLineSource, SimulatedMeter};
use p1_transport::{LineSource, SerialLineSource};
use tokio::signal;
use tracing::{debug, info, warn};

const SERVICE_NAME: &str = "p1-readerd";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Reads DSMR P1 telegrams and stores decoded measurements",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "Override the configured line source")]
    source: Option<CliSource>,

    #[arg(
        long = "sink",
        value_enum,
        help = "Override the configured sinks (repeatable)"
    )]
    sinks: Vec<CliSink>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliSource {
    Serial,
    Simulated,
    Replay,
}

impl From<CliSource> for SourceKind {
    fn from(value: CliSource) -> Self {
        match value {
            CliSource::Serial => SourceKind::Serial,
            CliSource::Simulated => SourceKind::Simulated,
            CliSource::Replay => SourceKind::Replay,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliSink {
    Jsonl,
    Csv,
    Sqlite,
    Log,
}

impl From<CliSink> for SinkKind {
    fn from(value: CliSink) -> Self {
        match value {
            CliSink::Jsonl => SinkKind::Jsonl,
            CliSink::Csv => SinkKind::Csv,
            CliSink::Sqlite => SinkKind::Sqlite,
            CliSink::Log => SinkKind::Log,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Read telegrams until interrupted")]
    Run,
    #[command(about = "Load and validate the configuration, then print it")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let candidates = [
        PathBuf::from("configs/p1-ems.toml"),
        PathBuf::from("configs/p1-ems.dev.toml"),
    ];
    let loaded = AppConfig::locate(cli.config.as_deref(), &candidates)?;
    let mut config = loaded.config;
    if let Some(source) = cli.source {
        config.source.kind = source.into();
    }
    if !cli.sinks.is_empty() {
        config.storage.sinks = cli.sinks.iter().copied().map(SinkKind::from).collect();
    }
    config.validate().context("configuration rejected")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let _log_guard = init_tracing(SERVICE_NAME, &config.logging)?;
            match &loaded.source {
                Some(path) => info!(config_path = %path.display(), "configuration loaded"),
                None => info!("no configuration file found; running with defaults"),
            }
            run_daemon(config).await?;
        }
        Commands::CheckConfig => {
            let source = loaded
                .source
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<defaults>".to_owned());
            println!("# configuration OK (source: {source})");
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let source = build_source(&config)?;
    let pipeline = Pipeline::from_config(source, &config).context("pipeline setup failed")?;

    let policy = RetryPolicy::from(&config.storage);
    for kind in &config.storage.sinks {
        let sink = build_sink(*kind, &config);
        info!(sink = sink.name(), directory = %config.storage.directory.display(), "sink enabled");
        let sink = RetryingSink::with_registry(sink, policy, pipeline.registry())
            .context("sink metrics registration failed")?;
        Arc::new(sink).attach(pipeline.measurements());
    }

    pipeline.start().await.context("failed to start telegram reader")?;
    info!(source = ?config.source.kind, "reader running; waiting for termination signal");

    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    let metrics = pipeline.shutdown(DRAIN_TIMEOUT).await?;
    if metrics.measurements.pending > 0 {
        warn!(pending = metrics.measurements.pending, "measurements still pending at exit");
    }
    info!(
        telegrams = ?metrics.telegrams,
        measurements = ?metrics.measurements,
        "buffer metrics"
    );
    for family in pipeline.registry().gather() {
        for metric in family.get_metric() {
            let labels: Vec<String> = metric
                .get_label()
                .iter()
                .map(|label| format!("{}={}", label.get_name(), label.get_value()))
                .collect();
            let value = if metric.has_gauge() {
                metric.get_gauge().get_value()
            } else {
                metric.get_counter().get_value()
            };
            debug!(metric = family.get_name(), labels = %labels.join(","), value, "final metric");
        }
    }
    Ok(())
}

fn build_source(config: &AppConfig) -> Result<Box<dyn LineSource>> {
    let source: Box<dyn LineSource> = match config.source.kind {
        SourceKind::Serial => Box::new(SerialLineSource::new(config.serial.clone())),
        SourceKind::Simulated => Box::new(SimulatedMeter::new(&config.simulation)),
        SourceKind::Replay => {
            let path = config
                .simulation
                .replay_path
                .as_deref()
                .context("simulation.replay_path is required for the replay source")?;
            Box::new(
                ReplayLineSource::from_path(path)?
                    .with_line_delay(config.simulation.line_delay_min),
            )
        }
    };
    Ok(source)
}

fn build_sink(kind: SinkKind, config: &AppConfig) -> Box<dyn MeasurementSink> {
    let directory = config.storage.directory.clone();
    match kind {
        SinkKind::Jsonl => Box::new(JsonLinesSink::new(directory)),
        SinkKind::Csv => Box::new(CsvSink::new(directory)),
        SinkKind::Sqlite => Box::new(SqliteSink::new(directory)),
        SinkKind::Log => Box::new(LogSink),
    }
}
