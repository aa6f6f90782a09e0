//! Line framing for the AT byte stream.
//!
//! [`LineBuffer`] accumulates raw bytes until the buffered text ends with
//! the configured terminator, then hands out the non-blank lines in order.
//! Modems often wrap replies in blank lines (`\r\nOK\r\n`); those are
//! dropped here so the matcher only ever sees content.
//!
//! The buffer itself is unbounded; callers bound it with their own size
//! check and the command timeout.

use bytes::BytesMut;

use atgsm_core::driver::DEFAULT_TERMINATOR;

/// Accumulates bytes into terminator-delimited lines.
#[derive(Debug)]
pub struct LineBuffer {
    buf: BytesMut,
    terminator: String,
}

impl LineBuffer {
    /// Create an empty buffer. An empty `terminator` falls back to CR LF.
    pub fn new(terminator: &str) -> Self {
        let terminator = if terminator.is_empty() {
            DEFAULT_TERMINATOR
        } else {
            terminator
        };
        LineBuffer {
            buf: BytesMut::with_capacity(256),
            terminator: terminator.to_string(),
        }
    }

    pub fn add(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Whether the buffered text ends with the terminator.
    pub fn is_complete(&self) -> bool {
        !self.buf.is_empty() && self.buf.ends_with(self.terminator.as_bytes())
    }

    /// Split the buffered text into non-blank lines and clear the buffer.
    ///
    /// Lines are returned as received; only blank entries are filtered.
    /// An unterminated tail, if any, is returned as the last line.
    pub fn drain(&mut self) -> Vec<String> {
        let data = self.buf.split();
        String::from_utf8_lossy(&data)
            .split(self.terminator.as_str())
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect()
    }

    /// The text after the last terminator, when it is not blank.
    ///
    /// Used to spot prompts such as `> ` that modems send without a
    /// terminator.
    pub fn pending_tail(&self) -> Option<String> {
        let text = String::from_utf8_lossy(&self.buf);
        let tail = match text.rfind(self.terminator.as_str()) {
            Some(pos) => &text[pos + self.terminator.len()..],
            None => &text[..],
        };
        (!tail.trim().is_empty()).then(|| tail.to_string())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
