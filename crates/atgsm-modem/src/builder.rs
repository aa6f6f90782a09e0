//! GsmModemBuilder -- fluent builder for constructing [`GsmModem`] instances.
//!
//! Separates configuration from construction so that callers can set up the
//! serial port, driver, codec, and timeouts before the modem tasks start.
//!
//! # Example
//!
//! ```no_run
//! use atgsm_modem::builder::GsmModemBuilder;
//! use std::time::Duration;
//!
//! # async fn example() -> atgsm_core::Result<()> {
//! let modem = GsmModemBuilder::new()
//!     .name("modem-1")
//!     .serial_port("/dev/ttyUSB2")
//!     .baud_rate(115_200)
//!     .country_code("62")
//!     .ussd_timeout(Duration::from_secs(20))
//!     .build()
//!     .await?;
//! modem.initialize().await?;
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use atgsm_core::codec::{NoCodec, SmsCodec};
use atgsm_core::driver::{Driver, DriverSet};
use atgsm_core::error::{Error, Result};
use atgsm_core::transport::Transport;
use atgsm_io::io::{IoConfig, spawn_io_task};
use atgsm_transport::{FlowControl, SerialConfig, SerialTransport};

use crate::modem::{GsmModem, ModemConfig, ModemOptions, identify};
use crate::msgref::MessageReferences;

/// Fluent builder for [`GsmModem`].
///
/// Every setting has a default, so the simplest usage is:
///
/// ```ignore
/// let modem = GsmModemBuilder::new()
///     .serial_port("/dev/ttyUSB2")
///     .build()
///     .await?;
/// ```
#[derive(Clone)]
pub struct GsmModemBuilder {
    name: String,
    driver: Driver,
    drivers: Option<DriverSet>,
    codec: Arc<dyn SmsCodec>,
    serial_port: Option<String>,
    baud_rate: u32,
    flow_control: FlowControl,
    command_timeout: Duration,
    send_timeout: Duration,
    ussd_timeout: Duration,
    monitor_interval: Duration,
    options: ModemOptions,
    country_code: Option<String>,
    msgref_file: Option<PathBuf>,
}

impl GsmModemBuilder {
    /// A builder using the generic driver and no PDU codec.
    pub fn new() -> Self {
        GsmModemBuilder {
            name: "modem".to_string(),
            driver: Driver::generic(),
            drivers: None,
            codec: Arc::new(NoCodec),
            serial_port: None,
            baud_rate: 115_200,
            flow_control: FlowControl::None,
            command_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(60),
            ussd_timeout: Duration::from_secs(30),
            monitor_interval: Duration::from_secs(600),
            options: ModemOptions::default(),
            country_code: None,
            msgref_file: None,
        }
    }

    /// Name used in logs.
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Use `driver` for command templates and response markers.
    pub fn driver(mut self, driver: Driver) -> Self {
        self.driver = driver;
        self
    }

    /// Identify the modem before starting and pick its driver from
    /// `drivers`. The configured driver is kept when nothing matches.
    pub fn detect_driver(mut self, drivers: DriverSet) -> Self {
        self.drivers = Some(drivers);
        self
    }

    /// Set the PDU codec. Without one, sending and reading messages fails
    /// with [`Error::Unsupported`].
    pub fn codec(mut self, codec: Arc<dyn SmsCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Set the serial port path (e.g. `/dev/ttyUSB2` or `COM3`).
    pub fn serial_port(mut self, port: &str) -> Self {
        self.serial_port = Some(port.to_string());
        self
    }

    /// Override the baud rate (default: 115200).
    pub fn baud_rate(mut self, baud: u32) -> Self {
        self.baud_rate = baud;
        self
    }

    /// Serial flow control (default: none). Some embedded modules need
    /// RTS/CTS.
    pub fn flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }

    /// Rolling timeout for a single AT command (default: 5s).
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Timeout for the PDU body of a message send and for operator scans
    /// (default: 60s).
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// How long each USSD step waits for its reply (default: 30s).
    pub fn ussd_timeout(mut self, timeout: Duration) -> Self {
        self.ussd_timeout = timeout;
        self
    }

    /// Period of the signal and storage polls (default: 10 minutes).
    pub fn monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn options(mut self, options: ModemOptions) -> Self {
        self.options = options;
        self
    }

    /// Country calling code used to normalize local numbers, e.g. `"62"`.
    pub fn country_code(mut self, code: &str) -> Self {
        self.country_code = Some(code.to_string());
        self
    }

    /// Persist concatenation references in `path`.
    pub fn message_reference_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.msgref_file = Some(path.into());
        self
    }

    /// Build a [`GsmModem`] with a caller-provided transport.
    ///
    /// This is the entry point for testing (pass a `MockTransport` from
    /// `atgsm-test-harness`) and for callers that manage the transport
    /// themselves.
    pub async fn build_with_transport(self, transport: Box<dyn Transport>) -> Result<GsmModem> {
        if self.monitor_interval.is_zero() {
            return Err(Error::InvalidParameter(
                "monitor_interval must be greater than zero".into(),
            ));
        }

        let (transport, driver) = match &self.drivers {
            Some(drivers) => self.detect(transport, drivers).await?,
            None => (transport, self.driver.clone()),
        };

        let io = IoConfig {
            command_timeout: self.command_timeout,
            ..IoConfig::from_driver(&driver)
        };
        let references = match self.msgref_file {
            Some(path) => MessageReferences::with_file(path),
            None => MessageReferences::in_memory(),
        };

        Ok(GsmModem::start(
            transport,
            ModemConfig {
                name: self.name,
                driver,
                codec: self.codec,
                io,
                send_timeout: self.send_timeout,
                ussd_timeout: self.ussd_timeout,
                monitor_interval: self.monitor_interval,
                options: self.options,
                country_code: self.country_code,
                references,
            },
        ))
    }

    /// Build a [`GsmModem`] using a serial transport.
    ///
    /// Requires that [`serial_port()`](Self::serial_port) has been called.
    pub async fn build(self) -> Result<GsmModem> {
        let port = self
            .serial_port
            .as_ref()
            .ok_or_else(|| Error::InvalidParameter("serial_port is required for build()".into()))?;

        let config = SerialConfig {
            baud_rate: self.baud_rate,
            flow_control: self.flow_control,
            ..Default::default()
        };
        let transport = SerialTransport::open_with_config(port, config).await?;
        self.build_with_transport(Box::new(transport)).await
    }

    /// Run identification on a short-lived IO task and hand the transport
    /// back.
    async fn detect(
        &self,
        transport: Box<dyn Transport>,
        drivers: &DriverSet,
    ) -> Result<(Box<dyn Transport>, Driver)> {
        let (notify_tx, _notify_rx) = mpsc::unbounded_channel();
        let io = spawn_io_task(
            transport,
            IoConfig {
                command_timeout: self.command_timeout,
                ..IoConfig::from_driver(&self.driver)
            },
            notify_tx,
        );
        let detected = identify(&io, &self.driver, drivers).await;
        let transport = io.shutdown().await?;
        Ok((transport, detected?))
    }
}

impl Default for GsmModemBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atgsm_test_harness::MockTransport;

    #[tokio::test]
    async fn builder_defaults() {
        let mock = MockTransport::new();
        let modem = GsmModemBuilder::new()
            .build_with_transport(Box::new(mock))
            .await
            .unwrap();

        assert_eq!(modem.name(), "modem");
        assert_eq!(GsmModemBuilder::new().flow_control, FlowControl::None);
        assert_eq!(modem.driver().name(), "Generic");
        assert!(modem.is_idle());
        modem.disconnect().await.unwrap();
    }

    #[test]
    fn builder_flow_control_setter() {
        let builder = GsmModemBuilder::new().flow_control(FlowControl::Hardware);
        assert_eq!(builder.flow_control, FlowControl::Hardware);
        assert_eq!(builder.baud_rate, 115_200);
    }

    #[tokio::test]
    async fn builder_serial_port_required_for_build() {
        let result = GsmModemBuilder::new().build().await;
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn builder_rejects_zero_monitor_interval() {
        let result = GsmModemBuilder::new()
            .monitor_interval(Duration::ZERO)
            .build_with_transport(Box::new(MockTransport::new()))
            .await;
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn builder_detects_driver_before_start() {
        let mut mock = MockTransport::new();
        mock.expect(b"AT\r\n", b"\r\nOK\r\n");
        mock.expect(b"ATI\r\n", b"\r\nWavecom Fastrack\r\n\r\nOK\r\n");
        let handle = mock.handle();

        let mut drivers = DriverSet::new();
        drivers
            .add(Driver::derive("Wavecom", &Driver::generic()).with("CMD_CSQ", "AT+CSQ?"))
            .unwrap();

        let modem = GsmModemBuilder::new()
            .name("fastrack")
            .detect_driver(drivers)
            .build_with_transport(Box::new(mock))
            .await
            .unwrap();

        assert_eq!(modem.name(), "fastrack");
        assert_eq!(modem.driver().name(), "Wavecom");
        assert_eq!(handle.remaining_expectations(), 0);

        // The transport survives detection and serves the started modem.
        handle.expect(b"AT+CSQ?\r\n", b"\r\n+CSQ: 12,99\r\n\r\nOK\r\n");
        assert_eq!(modem.signal().await.unwrap(), Some(12));
        modem.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn builder_keeps_driver_when_nothing_matches() {
        let mut mock = MockTransport::new();
        mock.expect(b"AT\r\n", b"\r\nOK\r\n");
        mock.expect(b"ATI\r\n", b"\r\nUnknown Modem 1.0\r\n\r\nOK\r\n");

        let mut drivers = DriverSet::new();
        drivers
            .add(Driver::derive("huawei", &Driver::generic()))
            .unwrap();

        let modem = GsmModemBuilder::new()
            .detect_driver(drivers)
            .build_with_transport(Box::new(mock))
            .await
            .unwrap();
        assert_eq!(modem.driver().name(), "Generic");
        modem.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn builder_fails_when_modem_silent() {
        let mut mock = MockTransport::new();
        mock.expect(b"AT\r\n", b"");

        let result = GsmModemBuilder::new()
            .detect_driver(DriverSet::new())
            .build_with_transport(Box::new(mock))
            .await;
        assert!(result.is_err_and(|e| e.is_timeout()));
    }
}
