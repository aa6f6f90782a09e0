//! Serial port transport for modem communication.
//!
//! This module provides [`SerialTransport`], which implements the [`Transport`]
//! trait for the virtual COM ports exposed by USB GSM dongles and for
//! RS-232 modem boards.
//!
//! USB dongles usually expose several ports; only one of them accepts AT
//! commands. Most modems auto-baud, so 115200 is a safe default.
//!
//! # Example
//!
//! ```no_run
//! use atgsm_transport::SerialTransport;
//! use atgsm_core::transport::Transport;
//! use std::time::Duration;
//!
//! # async fn example() -> atgsm_core::Result<()> {
//! let mut transport = SerialTransport::open("/dev/ttyUSB2", 115200).await?;
//!
//! transport.send(b"ATI\r\n").await?;
//!
//! let mut buf = [0u8; 256];
//! let n = transport.receive(&mut buf, Duration::from_secs(1)).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use atgsm_core::error::{Error, Result};
use atgsm_core::transport::Transport;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

/// Serial port configuration.
///
/// Characters are always 8N1; GSM modems use nothing else. Defaults are
/// 115200 baud, no flow control, DTR asserted.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Baud rate (e.g., 9600, 57600, 115200)
    pub baud_rate: u32,
    /// Flow control (RTS/CTS on some embedded modules)
    pub flow_control: FlowControl,
    /// Assert DTR after opening. Many modems ignore commands while DTR is low.
    pub assert_dtr: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115200,
            flow_control: FlowControl::None,
            assert_dtr: true,
        }
    }
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlowControl {
    #[default]
    None,
    Software,
    Hardware,
}

impl From<FlowControl> for tokio_serial::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Software => tokio_serial::FlowControl::Software,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        }
    }
}

/// Serial port transport for modem communication.
pub struct SerialTransport {
    port: Option<SerialStream>,
    /// Port name for logging
    port_name: String,
}

impl SerialTransport {
    /// Open a serial port with the given baud rate and default settings.
    ///
    /// # Arguments
    ///
    /// * `port` - Serial port path (e.g., "/dev/ttyUSB2" on Linux, "COM5" on Windows)
    /// * `baud_rate` - Baud rate
    pub async fn open(port: &str, baud_rate: u32) -> Result<Self> {
        let config = SerialConfig {
            baud_rate,
            ..Default::default()
        };
        Self::open_with_config(port, config).await
    }

    /// Open a serial port with full configuration control.
    pub async fn open_with_config(port: &str, config: SerialConfig) -> Result<Self> {
        tracing::debug!(
            port = %port,
            baud_rate = config.baud_rate,
            flow_control = ?config.flow_control,
            "Opening modem port"
        );

        let mut serial_stream = tokio_serial::new(port, config.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .flow_control(config.flow_control.into())
            .open_native_async()
            .map_err(|e| {
                tracing::error!(port = %port, error = %e, "Failed to open modem port");
                Error::Transport(format!("Failed to open serial port {}: {}", port, e))
            })?;

        if config.assert_dtr {
            if let Err(e) = serial_stream.write_data_terminal_ready(true) {
                tracing::warn!(port = %port, error = %e, "Failed to assert DTR");
            }
        }

        tracing::info!(port = %port, baud_rate = config.baud_rate, "Modem port opened");

        Ok(Self {
            port: Some(serial_stream),
            port_name: port.to_string(),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

fn map_io_error(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::UnexpectedEof => Error::ConnectionLost,
        _ => Error::Io(e),
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;

        tracing::trace!(
            port = %self.port_name,
            data = %String::from_utf8_lossy(data).escape_debug(),
            "TX"
        );

        port.write_all(data).await.map_err(|e| {
            tracing::error!(port = %self.port_name, error = %e, "Failed to send data");
            map_io_error(e)
        })?;
        port.flush().await.map_err(map_io_error)?;

        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;

        match tokio::time::timeout(timeout, port.read(buf)).await {
            Ok(Ok(0)) => {
                tracing::error!(port = %self.port_name, "Modem port closed by peer");
                Err(Error::ConnectionLost)
            }
            Ok(Ok(n)) => {
                tracing::trace!(
                    port = %self.port_name,
                    data = %String::from_utf8_lossy(&buf[..n]).escape_debug(),
                    "RX"
                );
                Ok(n)
            }
            Ok(Err(e)) => {
                tracing::error!(port = %self.port_name, error = %e, "Failed to receive data");
                Err(map_io_error(e))
            }
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut port) = self.port.take() {
            if let Err(e) = port.flush().await {
                tracing::warn!(
                    port = %self.port_name,
                    error = %e,
                    "Failed to flush before closing (continuing anyway)"
                );
            }
            tracing::info!(port = %self.port_name, "Modem port closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }
}
