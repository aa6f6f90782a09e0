//! Mock transport for deterministic testing of the AT engine.
//!
//! [`MockTransport`] implements the [`Transport`] trait with pre-loaded
//! request/response pairs. This lets you test command framing, response
//! matching, and notification handling without a real modem.
//!
//! Modems answer in arbitrary chunks and also talk on their own, so the
//! mock can split a reply across several reads ([`MockTransport::expect_chunks`])
//! and accept unsolicited data at any time through a [`MockHandle`].
//!
//! # Example
//!
//! ```
//! use atgsm_test_harness::MockTransport;
//!
//! let mut mock = MockTransport::new();
//! // Pre-load: when the engine sends this request, return this response.
//! mock.expect(b"AT+CSQ\r\n", b"\r\n+CSQ: 20,99\r\n\r\nOK\r\n");
//!
//! // Keep a handle to push a notification after the mock is moved.
//! let handle = mock.handle();
//! handle.push_unsolicited(b"\r\nRING\r\n");
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use atgsm_core::error::{Error, Result};
use atgsm_core::transport::Transport;

/// A pre-loaded request/response pair for the mock transport.
#[derive(Debug, Clone)]
struct Expectation {
    /// The exact bytes we expect to be sent.
    request: Vec<u8>,
    /// Chunks returned by successive `receive()` calls after the match.
    response: Vec<Vec<u8>>,
}

#[derive(Debug)]
struct MockState {
    /// Ordered queue of expected request/response pairs.
    expectations: VecDeque<Expectation>,
    /// Chunks pending for the next `receive()` calls.
    pending: VecDeque<Vec<u8>>,
    /// Whether the transport is "connected".
    connected: bool,
    /// Log of all bytes sent through this transport.
    sent_log: Vec<Vec<u8>>,
}

/// A mock [`Transport`] for testing the AT engine without hardware.
///
/// Expectations are consumed in order. When `send()` is called, the sent
/// data is recorded and matched against the next expectation. The
/// corresponding response chunks are then returned by the following
/// `receive()` calls, one chunk per call.
///
/// If no expectation matches or the queue is exhausted, an error is returned.
#[derive(Debug)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

/// A cloneable handle onto a [`MockTransport`] that stays usable after the
/// transport has been moved into an IO task.
#[derive(Debug, Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockTransport {
    /// Create a new mock transport in the connected state.
    pub fn new() -> Self {
        MockTransport {
            state: Arc::new(Mutex::new(MockState {
                expectations: VecDeque::new(),
                pending: VecDeque::new(),
                connected: true,
                sent_log: Vec::new(),
            })),
        }
    }

    /// Add an expected request/response pair.
    ///
    /// When `send()` is called with data matching `request`, the subsequent
    /// `receive()` call will return `response`. An empty response makes the
    /// request go unanswered.
    pub fn expect(&mut self, request: &[u8], response: &[u8]) {
        let response = if response.is_empty() {
            Vec::new()
        } else {
            vec![response.to_vec()]
        };
        lock(&self.state).expectations.push_back(Expectation {
            request: request.to_vec(),
            response,
        });
    }

    /// Add an expected request whose response arrives split across several
    /// reads.
    pub fn expect_chunks(&mut self, request: &[u8], chunks: &[&[u8]]) {
        lock(&self.state).expectations.push_back(Expectation {
            request: request.to_vec(),
            response: chunks.iter().map(|c| c.to_vec()).collect(),
        });
    }

    /// Return a handle for inspecting and feeding the transport later.
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Return all data that has been sent through this transport.
    ///
    /// Each element is the byte slice from one `send()` call.
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        lock(&self.state).sent_log.clone()
    }

    /// Return the number of expectations that have not yet been consumed.
    pub fn remaining_expectations(&self) -> usize {
        lock(&self.state).expectations.len()
    }

    /// Set the connected state of the mock transport.
    ///
    /// When set to `false`, subsequent `send()` and `receive()` calls will
    /// return [`Error::NotConnected`].
    pub fn set_connected(&mut self, connected: bool) {
        lock(&self.state).connected = connected;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHandle {
    /// Queue bytes the modem sends on its own, such as `RING` or `+CMTI:`.
    pub fn push_unsolicited(&self, data: &[u8]) {
        lock(&self.state).pending.push_back(data.to_vec());
    }

    /// Add an expectation after the transport has been moved.
    pub fn expect(&self, request: &[u8], response: &[u8]) {
        let response = if response.is_empty() {
            Vec::new()
        } else {
            vec![response.to_vec()]
        };
        lock(&self.state).expectations.push_back(Expectation {
            request: request.to_vec(),
            response,
        });
    }

    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        lock(&self.state).sent_log.clone()
    }

    /// Sent data decoded as text, one entry per `send()` call.
    pub fn sent_text(&self) -> Vec<String> {
        lock(&self.state)
            .sent_log
            .iter()
            .map(|d| String::from_utf8_lossy(d).into_owned())
            .collect()
    }

    pub fn remaining_expectations(&self) -> usize {
        lock(&self.state).expectations.len()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(Error::NotConnected);
        }

        // Record what was sent.
        state.sent_log.push(data.to_vec());

        // Match against the next expectation.
        if let Some(expectation) = state.expectations.pop_front() {
            if data != expectation.request.as_slice() {
                return Err(Error::Protocol(format!(
                    "unexpected send data: expected {:?}, got {:?}",
                    String::from_utf8_lossy(&expectation.request),
                    String::from_utf8_lossy(data)
                )));
            }
            state.pending.extend(expectation.response);
            Ok(())
        } else {
            Err(Error::Protocol(
                "no more expectations in mock transport".into(),
            ))
        }
    }

    async fn receive(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(Error::NotConnected);
        }

        match state.pending.pop_front() {
            Some(chunk) if !chunk.is_empty() => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    // Leave the unread remainder for the next call.
                    state.pending.push_front(chunk[n..].to_vec());
                }
                Ok(n)
            }
            _ => Err(Error::Timeout),
        }
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        state.connected = false;
        state.pending.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atgsm_core::transport::Transport;

    #[tokio::test]
    async fn mock_transport_basic_send_receive() {
        let mut mock = MockTransport::new();
        let request = b"AT\r\n";
        let response = b"\r\nOK\r\n";

        mock.expect(request, response);

        // Send the expected request.
        mock.send(request).await.unwrap();

        // Receive the pre-loaded response.
        let mut buf = [0u8; 64];
        let n = mock
            .receive(&mut buf, Duration::from_millis(100))
            .await
            .unwrap();

        assert_eq!(n, response.len());
        assert_eq!(&buf[..n], response);
    }

    #[tokio::test]
    async fn mock_transport_tracks_sent_data() {
        let mut mock = MockTransport::new();
        mock.expect(b"ATZ\r\n", b"OK\r\n");
        mock.expect(b"ATE0\r\n", b"OK\r\n");

        mock.send(b"ATZ\r\n").await.unwrap();
        mock.send(b"ATE0\r\n").await.unwrap();

        let sent = mock.sent_data();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], b"ATZ\r\n");
        assert_eq!(sent[1], b"ATE0\r\n");
    }

    #[tokio::test]
    async fn mock_transport_wrong_data_errors() {
        let mut mock = MockTransport::new();
        mock.expect(b"AT\r\n", b"OK\r\n");

        let result = mock.send(b"ATI\r\n").await;
        assert!(matches!(result.unwrap_err(), Error::Protocol(_)));
    }

    #[tokio::test]
    async fn mock_transport_no_expectations_errors() {
        let mut mock = MockTransport::new();

        let result = mock.send(b"AT\r\n").await;
        assert!(matches!(result.unwrap_err(), Error::Protocol(_)));
    }

    #[tokio::test]
    async fn mock_transport_receive_without_send_times_out() {
        let mut mock = MockTransport::new();
        let mut buf = [0u8; 64];

        let result = mock.receive(&mut buf, Duration::from_millis(10)).await;
        assert!(matches!(result.unwrap_err(), Error::Timeout));
    }

    #[tokio::test]
    async fn mock_transport_disconnect() {
        let mut mock = MockTransport::new();
        let handle = mock.handle();
        assert!(mock.is_connected());

        mock.close().await.unwrap();
        assert!(!mock.is_connected());
        assert!(!handle.is_connected());

        // Operations after close should fail.
        let result = mock.send(b"AT\r\n").await;
        assert!(matches!(result.unwrap_err(), Error::NotConnected));
    }

    #[tokio::test]
    async fn mock_transport_set_connected() {
        let mut mock = MockTransport::new();
        mock.set_connected(false);

        let mut buf = [0u8; 8];
        let result = mock.receive(&mut buf, Duration::from_millis(10)).await;
        assert!(matches!(result.unwrap_err(), Error::NotConnected));
    }

    #[tokio::test]
    async fn mock_transport_remaining_expectations() {
        let mut mock = MockTransport::new();
        let handle = mock.handle();
        mock.expect(b"AT\r\n", b"OK\r\n");
        handle.expect(b"ATI\r\n", b"SIM800\r\nOK\r\n");
        assert_eq!(mock.remaining_expectations(), 2);

        mock.send(b"AT\r\n").await.unwrap();
        assert_eq!(handle.remaining_expectations(), 1);
    }

    #[tokio::test]
    async fn mock_transport_partial_receive() {
        let mut mock = MockTransport::new();
        mock.expect(b"AT\r\n", b"OK\r\n");
        mock.send(b"AT\r\n").await.unwrap();

        // Read with a buffer smaller than the response.
        let mut buf = [0u8; 2];
        let n = mock.receive(&mut buf, Duration::from_millis(100)).await.unwrap();
        assert_eq!(&buf[..n], b"OK");

        let n = mock.receive(&mut buf, Duration::from_millis(100)).await.unwrap();
        assert_eq!(&buf[..n], b"\r\n");
    }

    #[tokio::test]
    async fn mock_transport_chunked_response() {
        let mut mock = MockTransport::new();
        mock.expect_chunks(b"AT+CSQ\r\n", &[b"+CSQ: ", b"20,99\r\n", b"OK\r\n"]);
        mock.send(b"AT+CSQ\r\n").await.unwrap();

        let mut buf = [0u8; 64];
        let mut reads = Vec::new();
        while let Ok(n) = mock.receive(&mut buf, Duration::from_millis(10)).await {
            reads.push(buf[..n].to_vec());
        }
        assert_eq!(reads.len(), 3);
        assert_eq!(reads[1], b"20,99\r\n");
    }

    #[tokio::test]
    async fn mock_transport_unsolicited_through_handle() {
        let mut mock = MockTransport::new();
        let handle = mock.handle();
        handle.push_unsolicited(b"RING\r\n");

        let mut buf = [0u8; 64];
        let n = mock.receive(&mut buf, Duration::from_millis(10)).await.unwrap();
        assert_eq!(&buf[..n], b"RING\r\n");
        assert_eq!(handle.sent_text(), Vec::<String>::new());
    }
}
