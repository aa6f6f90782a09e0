//! # atgsm -- Asynchronous GSM Modem Control
//!
//! `atgsm` drives GSM modems over the Hayes AT command set: USB dongles,
//! RS-232 modem boards, and anything else that speaks 3GPP TS 27.005/27.007
//! on a serial line. It is built for SMS gateways and other unattended
//! services where one process keeps several modems busy around the clock.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! atgsm = "0.1"
//! tokio = { version = "1", features = ["full"] }
//! ```
//!
//! Connect, initialize, and check the signal:
//!
//! ```no_run
//! use atgsm::modem::GsmModemBuilder;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let modem = GsmModemBuilder::new()
//!         .serial_port("/dev/ttyUSB2")
//!         .baud_rate(115_200)
//!         .build()
//!         .await?;
//!
//!     modem.initialize().await?;
//!     println!("signal: {:?}", modem.signal().await?);
//!     modem.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! | Crate                | Purpose                                           |
//! |----------------------|---------------------------------------------------|
//! | `atgsm-core`         | [`Transport`] and [`SmsCodec`] traits, drivers, types, errors |
//! | `atgsm-transport`    | Serial transport                                  |
//! | `atgsm-io`           | AT engine: framing, matching, notifications, queue |
//! | `atgsm-modem`        | [`GsmModem`](modem::GsmModem): SMS, USSD, calls, storage |
//! | **`atgsm`**          | This facade crate -- re-exports everything        |
//!
//! Command templates and response markers come from a [`Driver`]. The
//! generic driver fits most modems; vendor drivers derive from it and
//! override single entries.
//!
//! ## Feature Flags
//!
//! | Feature | Enables                              | Default |
//! |---------|--------------------------------------|---------|
//! | `modem` | [`modem`] module (`atgsm-modem`)     | yes     |
//!
//! Without `modem` only the AT engine is available, for callers that build
//! their own command sequences.
//!
//! ## Events
//!
//! Received messages, status reports, rings, and USSD replies arrive as
//! [`ModemEvent`]s on a broadcast channel:
//!
//! ```no_run
//! use atgsm::ModemEvent;
//! # async fn example(modem: &atgsm::modem::GsmModem) {
//! let mut events = modem.subscribe();
//! while let Ok(event) = events.recv().await {
//!     match event {
//!         ModemEvent::Message(m) => println!("{}: {}", m.address, m.text),
//!         ModemEvent::Ring { caller } => println!("call from {caller}"),
//!         other => println!("{other:?}"),
//!     }
//! }
//! # }
//! ```

pub use atgsm_core::*;

/// The AT command engine.
///
/// Useful on its own for tools that send raw commands; [`modem`] builds on
/// it.
pub mod io {
    pub use atgsm_io::*;
}

/// Serial transport.
pub mod transport {
    pub use atgsm_transport::*;
}

/// GSM modem layer.
///
/// Provides [`GsmModem`](modem::GsmModem) and
/// [`GsmModemBuilder`](modem::GsmModemBuilder).
#[cfg(feature = "modem")]
pub mod modem {
    pub use atgsm_modem::*;
}

