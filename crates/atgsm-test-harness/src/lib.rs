//! atgsm-test-harness: Test utilities, mock transports, and a fake PDU
//! codec for atgsm.
//!
//! This crate provides [`MockTransport`] for deterministic unit testing of
//! the AT engine and GSM layer without a real modem, and [`MockCodec`], a
//! readable stand-in for a real SMS PDU codec.

pub mod mock_codec;
pub mod mock_serial;

pub use mock_codec::MockCodec;
pub use mock_serial::{MockHandle, MockTransport};
