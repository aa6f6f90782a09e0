//! atgsm-core: Core traits, types, and error definitions for atgsm.
//!
//! This crate defines the modem-agnostic abstractions shared by the AT
//! engine, the GSM layer, and applications.
//!
//! # Key types
//!
//! - [`Transport`] -- byte-level communication channel
//! - [`Driver`] -- per-modem command and response templates
//! - [`SmsCodec`] -- PDU encode/decode seam
//! - [`ModemEvent`] / [`StateChange`] -- asynchronous notifications
//! - [`Error`] / [`Result`] -- error handling

pub mod codec;
pub mod driver;
pub mod error;
pub mod events;
pub mod transport;
pub mod types;

pub use codec::{DecodedPdu, EncodeOptions, EncodedPdu, NoCodec, OutgoingSegment, SmsCodec};
pub use driver::{Driver, DriverSet, keys};
pub use error::{Error, Result};
pub use events::{ModemEvent, Property, StateChange, StateFlag};
pub use transport::Transport;
pub use types::*;
