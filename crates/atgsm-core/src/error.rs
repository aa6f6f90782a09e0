//! Error types for atgsm.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Transport failures, AT protocol
//! rejections, and codec failures are all captured here.

/// The error type for all atgsm operations.
///
/// Variants cover the failure modes encountered when driving a modem over
/// an AT command channel: physical transport failures, timeouts, error
/// sentinels returned by the modem, and PDU codec failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport-level error (serial port, socket).
    #[error("transport error: {0}")]
    Transport(String),

    /// A protocol-level error (unexpected or unusable response).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Timed out waiting for data from the transport.
    #[error("timeout waiting for response")]
    Timeout,

    /// An AT command received no conclusive response within its
    /// rolling timeout window.
    #[error("{command}: operation timeout")]
    CommandTimeout {
        /// The command text that was sent.
        command: String,
    },

    /// The modem answered an AT command with an error sentinel.
    ///
    /// `response` holds the captured lines. For `+CME ERROR:` and
    /// `+CMS ERROR:` replies the structured error line is retained so
    /// the code can be reported with [`Error::error_code`].
    #[error("{command}: {}", format_response(.response))]
    CommandFailed {
        /// The command text that was sent.
        command: String,
        /// Captured response lines.
        response: Vec<String>,
    },

    /// A message could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The requested operation is not supported by the modem driver.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// An invalid parameter was passed to a modem operation.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// No connection to the modem has been established.
    #[error("not connected")]
    NotConnected,

    /// The connection to the modem was lost unexpectedly.
    #[error("connection lost")]
    ConnectionLost,

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_response(response: &[String]) -> String {
    if response.is_empty() {
        "operation failed".to_string()
    } else {
        response.join(" ")
    }
}

impl Error {
    /// Return the structured error code carried by a `+CME ERROR:` or
    /// `+CMS ERROR:` line, if this error has one.
    ///
    /// ```
    /// use atgsm_core::Error;
    ///
    /// let err = Error::CommandFailed {
    ///     command: "AT+CMGS=23".into(),
    ///     response: vec!["+CMS ERROR: 500".into()],
    /// };
    /// assert_eq!(err.error_code(), Some("500"));
    /// ```
    pub fn error_code(&self) -> Option<&str> {
        let Error::CommandFailed { response, .. } = self else {
            return None;
        };
        response.iter().find_map(|line| {
            ["+CME ERROR:", "+CMS ERROR:"].iter().find_map(|marker| {
                let head = line.get(..marker.len())?;
                head.eq_ignore_ascii_case(marker)
                    .then(|| line[marker.len()..].trim())
            })
        })
    }

    /// Whether this error means the command produced no conclusive reply.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout | Error::CommandTimeout { .. })
    }
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
