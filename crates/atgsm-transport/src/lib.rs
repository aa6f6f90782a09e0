//! Transport implementations for atgsm.
//!
//! This crate provides [`SerialTransport`], the concrete implementation of
//! the [`Transport`](atgsm_core::Transport) trait for USB modems, GSM
//! dongles, and RS-232 modem boards.
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
//! transport.send(b"AT\r\n").await?;
//!
//! let mut buf = [0u8; 256];
//! let n = transport.receive(&mut buf, Duration::from_secs(1)).await?;
//! # Ok(())
//! # }
//! ```

pub mod serial;

pub use serial::{FlowControl, SerialConfig, SerialTransport};
