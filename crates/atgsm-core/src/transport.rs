//! Transport trait for modem communication.
//!
//! The [`Transport`] trait abstracts over the byte stream to a modem. The
//! AT engine in `atgsm-io` operates on a `Transport` rather than directly on
//! a serial port, so the same engine drives real hardware through
//! `SerialTransport` and deterministic unit tests through `MockTransport`
//! from the `atgsm-test-harness` crate.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Asynchronous byte-level transport to a modem.
///
/// A transport makes no promise about chunk boundaries: a single AT reply
/// may arrive split across several `receive()` calls, and one call may carry
/// the tail of a reply plus an unsolicited notification.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send raw bytes to the modem.
    ///
    /// Implementations should block until all bytes have been written to
    /// the underlying stream.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive bytes from the modem into the provided buffer.
    ///
    /// Returns the number of bytes actually read. Will wait up to `timeout`
    /// for data to arrive; returns [`Error::Timeout`](crate::error::Error::Timeout)
    /// if nothing is received within the deadline.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Close the transport connection.
    ///
    /// After calling `close()`, subsequent `send()` and `receive()` calls
    /// should return [`Error::NotConnected`](crate::error::Error::NotConnected).
    async fn close(&mut self) -> Result<()>;

    /// Check whether the transport is currently connected.
    fn is_connected(&self) -> bool;
}
