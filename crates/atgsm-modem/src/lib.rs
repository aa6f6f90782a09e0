//! GSM modem layer for atgsm.
//!
//! This crate drives a 3GPP TS 27.005/27.007 modem on top of the AT engine
//! in `atgsm-io`. It provides:
//!
//! - **Modem handle** ([`modem`]) -- [`GsmModem`] with initialization,
//!   PDU message sending, storage read/delete/list, calls, USSD sessions,
//!   and the signal and storage monitors.
//! - **Builder** ([`builder`]) -- [`GsmModemBuilder`] with defaults for every
//!   timeout and optional driver detection.
//! - **Signatures** ([`signatures`]) -- the response prefixes the modem
//!   understands, resolved from the driver.
//! - **Decoding** ([`decoder`]) -- turns matched lines into
//!   [`StateUpdate`]s.
//! - **Device state** ([`state`]) -- [`DeviceState`] and its update rules.
//! - **Pool** ([`pool`]) -- [`ModemPool`], one modem per port, opened and
//!   initialized on first use.
//! - **Dispatcher** -- the task that owns device state, the state flags, and
//!   storage maintenance.
//! - **Reassembly** ([`reassembly`]) -- joins multi-part messages.
//! - **Identity** ([`hash`], [`msgref`]) -- message hashes, international
//!   numbers, and concatenation references.
//!
//! # Example
//!
//! ```no_run
//! use atgsm_modem::GsmModemBuilder;
//! use atgsm_core::ModemEvent;
//!
//! # async fn example() -> atgsm_core::Result<()> {
//! let modem = GsmModemBuilder::new()
//!     .serial_port("/dev/ttyUSB2")
//!     .country_code("62")
//!     .build()
//!     .await?;
//! modem.initialize().await?;
//!
//! let mut events = modem.subscribe();
//! while let Ok(event) = events.recv().await {
//!     if let ModemEvent::Message(message) = event {
//!         println!("{}: {}", message.address, message.text);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod decoder;
mod dispatcher;
pub mod hash;
pub mod modem;
pub mod msgref;
pub mod pool;
pub mod reassembly;
pub mod signatures;
pub mod state;

pub use builder::GsmModemBuilder;
pub use decoder::{QueryContext, StateUpdate};
pub use hash::{intl_number, message_hash};
pub use modem::{GsmModem, ModemOptions};
pub use msgref::MessageReferences;
pub use pool::{ModemPool, TransportFactory};
pub use signatures::SignatureKind;
pub use state::DeviceState;
