//! ---
//! ems_section: "03-field-connectivity"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Serial port line source for the meter P1 port."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use p1_common::{Parity, SerialConfig};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, error, info};

use crate::{trim_line_ending, LineSource, LineSourceError, Result};

/// Longest line accepted from the port before the stream is considered garbled.
const MAX_LINE_LENGTH: usize = 4096;

/// Reads telegram lines from a serial device such as `/dev/ttyUSB0`.
///
/// Lines are framed by [`LinesCodec`], which keeps partial input across calls,
/// so a `read_line` that times out never loses bytes already received.
pub struct SerialLineSource {
    settings: SerialConfig,
    frames: Option<FramedRead<SerialStream, LinesCodec>>,
}

impl SerialLineSource {
    pub fn new(settings: SerialConfig) -> Self {
        Self {
            settings,
            frames: None,
        }
    }

    pub fn settings(&self) -> &SerialConfig {
        &self.settings
    }
}

fn parity(parity: Parity) -> tokio_serial::Parity {
    match parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Even => tokio_serial::Parity::Even,
    }
}

fn data_bits(bits: u8) -> tokio_serial::DataBits {
    match bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    }
}

fn stop_bits(bits: u8) -> tokio_serial::StopBits {
    match bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    }
}

#[async_trait]
impl LineSource for SerialLineSource {
    fn name(&self) -> &str {
        &self.settings.port
    }

    fn is_open(&self) -> bool {
        self.frames.is_some()
    }

    async fn open(&mut self) -> Result<()> {
        if self.frames.is_some() {
            return Err(LineSourceError::AlreadyOpen(self.settings.port.clone()));
        }
        let settings = &self.settings;
        debug!(port = %settings.port, baud = settings.baud_rate, "opening serial port");

        let stream = tokio_serial::new(settings.port.as_str(), settings.baud_rate)
            .data_bits(data_bits(settings.data_bits))
            .parity(parity(settings.parity))
            .stop_bits(stop_bits(settings.stop_bits))
            .open_native_async()
            .map_err(|err| {
                error!(port = %settings.port, error = %err, "failed to open serial port");
                LineSourceError::Io(io::Error::from(err))
            })?;

        self.frames = Some(FramedRead::new(
            stream,
            LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        ));
        info!(port = %settings.port, baud = settings.baud_rate, "serial port opened");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        match self.frames.take() {
            Some(_) => {
                info!(port = %self.settings.port, "serial port closed");
                Ok(())
            }
            None => Err(LineSourceError::NotOpen(self.settings.port.clone())),
        }
    }

    async fn read_line(&mut self, timeout: Duration) -> Result<String> {
        let frames = self
            .frames
            .as_mut()
            .ok_or_else(|| LineSourceError::NotOpen(self.settings.port.clone()))?;

        match tokio::time::timeout(timeout, frames.next()).await {
            Err(_) => Err(LineSourceError::Timeout(timeout)),
            Ok(Some(Ok(line))) => Ok(trim_line_ending(&line).to_owned()),
            Ok(Some(Err(LinesCodecError::Io(err)))) => Err(LineSourceError::Io(err)),
            Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                Err(LineSourceError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("line longer than {MAX_LINE_LENGTH} bytes"),
                )))
            }
            Ok(None) => Err(LineSourceError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "serial stream ended",
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_map_onto_port_builder() {
        assert_eq!(parity(Parity::Even), tokio_serial::Parity::Even);
        assert_eq!(parity(Parity::None), tokio_serial::Parity::None);
        assert_eq!(data_bits(7), tokio_serial::DataBits::Seven);
        assert_eq!(data_bits(8), tokio_serial::DataBits::Eight);
        assert_eq!(stop_bits(2), tokio_serial::StopBits::Two);
        assert_eq!(stop_bits(1), tokio_serial::StopBits::One);
    }

    #[tokio::test]
    async fn closed_port_reports_not_open() {
        let mut source = SerialLineSource::new(SerialConfig::default());
        assert!(!source.is_open());
        let err = source
            .read_line(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, LineSourceError::NotOpen(_)));
        assert!(matches!(
            source.close().await,
            Err(LineSourceError::NotOpen(_))
        ));
    }

    #[tokio::test]
    async fn missing_device_fails_to_open() {
        let mut source = SerialLineSource::new(SerialConfig {
            port: "/dev/p1-ems-does-not-exist".into(),
            ..SerialConfig::default()
        });
        assert!(matches!(source.open().await, Err(LineSourceError::Io(_))));
        assert!(!source.is_open());
    }
}
