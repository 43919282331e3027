//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the ingestion runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_source_kind() -> SourceKind {
    SourceKind::Serial
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_error_backoff() -> Duration {
    Duration::from_millis(1000)
}

fn default_serial_port() -> String {
    "/dev/ttyUSB0".to_owned()
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_simulation_seed() -> u64 {
    0xD5_u64
}

fn default_line_delay_min() -> Duration {
    Duration::from_millis(20)
}

fn default_line_delay_max() -> Duration {
    Duration::from_millis(30)
}

fn default_sinks() -> Vec<SinkKind> {
    vec![SinkKind::Jsonl]
}

fn default_storage_directory() -> PathBuf {
    PathBuf::from("target/measurements")
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Primary configuration object for the reader daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    /// `None` when no candidate existed and built-in defaults were used.
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "P1_EMS_CONFIG";

    /// Load configuration from disk, respecting the `P1_EMS_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the effective source path.
    ///
    /// The environment override must point at an existing file. When none of the
    /// candidates exist the defaults are returned; a meter reader is expected to
    /// come up on a bare install with the standard serial settings.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path.to_path_buf()),
                });
            }
        }

        debug!(
            inspected = %candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            "no configuration file found; using defaults"
        );
        Ok(LoadedAppConfig {
            config: AppConfig::default(),
            source: None,
        })
    }

    /// Resolve the configuration for a command line. An explicit path must
    /// exist and parse; there is no fallback for it. Without one the
    /// environment override and then `candidates` are consulted as in
    /// [`AppConfig::load_with_source`].
    pub fn locate<P: AsRef<Path>>(
        explicit: Option<&Path>,
        candidates: &[P],
    ) -> Result<LoadedAppConfig> {
        match explicit {
            Some(path) => Ok(LoadedAppConfig {
                config: Self::from_path(path)?,
                source: Some(path.to_path_buf()),
            }),
            None => Self::load_with_source(candidates),
        }
    }

    /// Read and parse one configuration file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Validate semantic invariants the type system cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.source.read_timeout.is_zero() {
            return Err(anyhow!("source.read_timeout must be greater than zero"));
        }
        match self.source.kind {
            SourceKind::Serial => self.serial.validate()?,
            SourceKind::Replay if self.simulation.replay_path.is_none() => {
                return Err(anyhow!(
                    "source.kind = \"replay\" requires simulation.replay_path"
                ));
            }
            _ => {}
        }
        self.simulation.validate()?;
        if self.buffer.capacity == Some(0) {
            return Err(anyhow!("buffer.capacity must be greater than zero when set"));
        }
        if self.storage.sinks.is_empty() {
            return Err(anyhow!("storage.sinks must name at least one sink"));
        }
        if self.storage.max_attempts == Some(0) {
            return Err(anyhow!("storage.max_attempts must be greater than zero when set"));
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Where telegram lines come from.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Serial,
    Simulated,
    Replay,
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "serial" => Ok(SourceKind::Serial),
            "simulated" => Ok(SourceKind::Simulated),
            "replay" => Ok(SourceKind::Replay),
            other => Err(format!("unknown source kind: {}", other)),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_kind")]
    pub kind: SourceKind,
    /// Upper bound for a single line read. The meter reports every 1 to 10 s.
    #[serde(default = "default_read_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub read_timeout: Duration,
    #[serde(default = "default_error_backoff")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub error_backoff: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: default_source_kind(),
            read_timeout: default_read_timeout(),
            error_backoff: default_error_backoff(),
        }
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Serial line settings of the P1 port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    #[serde(default = "default_serial_port")]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: Parity,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::default(),
        }
    }
}

impl SerialConfig {
    pub fn validate(&self) -> Result<()> {
        if self.port.trim().is_empty() {
            return Err(anyhow!("serial.port must not be empty"));
        }
        if self.baud_rate == 0 {
            return Err(anyhow!("serial.baud_rate must be greater than zero"));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(anyhow!(
                "serial.data_bits must be between 5 and 8, got {}",
                self.data_bits
            ));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(anyhow!(
                "serial.stop_bits must be 1 or 2, got {}",
                self.stop_bits
            ));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_simulation_seed")]
    pub random_seed: u64,
    #[serde(default = "default_line_delay_min")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub line_delay_min: Duration,
    #[serde(default = "default_line_delay_max")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub line_delay_max: Duration,
    /// Captured telegram dump used by the replay source.
    #[serde(default)]
    pub replay_path: Option<PathBuf>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            random_seed: default_simulation_seed(),
            line_delay_min: default_line_delay_min(),
            line_delay_max: default_line_delay_max(),
            replay_path: None,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.line_delay_min > self.line_delay_max {
            return Err(anyhow!(
                "simulation.line_delay_min ({:?}) exceeds line_delay_max ({:?})",
                self.line_delay_min,
                self.line_delay_max
            ));
        }
        Ok(())
    }
}

/// Queue sizing shared by the telegram and measurement buffers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BufferConfig {
    /// `None` keeps the queues unbounded; `Some(n)` drops the newest item when full.
    #[serde(default)]
    pub capacity: Option<usize>,
}

/// Persistence backends the daemon can attach to the measurement buffer.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Jsonl,
    Csv,
    Sqlite,
    Log,
}

impl std::str::FromStr for SinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "jsonl" => Ok(SinkKind::Jsonl),
            "csv" => Ok(SinkKind::Csv),
            "sqlite" => Ok(SinkKind::Sqlite),
            "log" => Ok(SinkKind::Log),
            other => Err(format!("unknown sink kind: {}", other)),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_sinks")]
    pub sinks: Vec<SinkKind>,
    #[serde(default = "default_storage_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_retry_delay")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub retry_delay: Duration,
    /// `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<usize>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sinks: default_sinks(),
            directory: default_storage_directory(),
            retry_delay: default_retry_delay(),
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}
