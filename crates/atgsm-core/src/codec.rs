//! The SMS PDU codec seam.
//!
//! Encoding and decoding of protocol data units (7-bit packing, UCS2,
//! user data headers) lives outside this workspace. The modem layer only
//! needs the operations of [`SmsCodec`]; tests use `MockCodec` from
//! `atgsm-test-harness`.

use crate::error::{Error, Result};
use crate::types::{ConcatInfo, ReceivedPdu};

/// Submission flags applied to every outgoing segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    /// Ask the network for a delivery status report.
    pub request_status: bool,
    /// Set the reply-path bit.
    pub request_reply: bool,
    /// Send as a class 0 (flash) message.
    pub flash: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        EncodeOptions {
            request_status: true,
            request_reply: false,
            flash: false,
        }
    }
}

/// One segment of an outgoing message, ready to be encoded.
#[derive(Debug, Clone)]
pub struct OutgoingSegment<'a> {
    pub address: &'a str,
    pub text: &'a str,
    /// Concatenation header when the message has more than one segment.
    pub concat: Option<ConcatInfo>,
    pub options: EncodeOptions,
}

/// An encoded submission PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPdu {
    /// Hex encoded PDU including the SMSC prefix.
    pub pdu: String,
    /// TPDU length in octets, as passed to `AT+CMGS=<len>`.
    pub tp_length: usize,
}

/// A decoded received PDU.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPdu {
    /// TPDU length in octets, compared with the length in the header line.
    pub tp_length: usize,
    pub pdu: ReceivedPdu,
}

/// Converts between message text and hex encoded PDUs.
pub trait SmsCodec: Send + Sync {
    /// Split `text` into segments that each fit one PDU.
    fn split(&self, text: &str) -> Vec<String>;

    /// Encode one outgoing segment.
    fn encode(&self, segment: &OutgoingSegment<'_>) -> Result<EncodedPdu>;

    /// Decode a hex encoded PDU read from the modem.
    fn decode(&self, pdu: &str) -> Result<DecodedPdu>;

    /// Encode a USSD service string for coding scheme `dcs`.
    fn encode_ussd(&self, dcs: u8, text: &str) -> Result<String>;

    /// Decode a USSD payload sent with coding scheme `dcs`.
    fn decode_ussd(&self, dcs: u8, payload: &str) -> Result<String>;
}

/// Codec used when none is configured. Splitting keeps the text whole;
/// every PDU operation fails with [`Error::Unsupported`]. USSD strings pass
/// through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCodec;

impl SmsCodec for NoCodec {
    fn split(&self, text: &str) -> Vec<String> {
        vec![text.to_string()]
    }

    fn encode(&self, _segment: &OutgoingSegment<'_>) -> Result<EncodedPdu> {
        Err(Error::Unsupported("no SMS codec configured".into()))
    }

    fn decode(&self, _pdu: &str) -> Result<DecodedPdu> {
        Err(Error::Unsupported("no SMS codec configured".into()))
    }

    fn encode_ussd(&self, _dcs: u8, text: &str) -> Result<String> {
        Ok(text.to_string())
    }

    fn decode_ussd(&self, _dcs: u8, payload: &str) -> Result<String> {
        Ok(payload.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_codec_rejects_pdus() {
        let segment = OutgoingSegment {
            address: "+6281234567890",
            text: "hi",
            concat: None,
            options: EncodeOptions::default(),
        };
        assert!(matches!(NoCodec.encode(&segment), Err(Error::Unsupported(_))));
        assert!(matches!(NoCodec.decode("00"), Err(Error::Unsupported(_))));
        assert_eq!(NoCodec.split("hello"), vec!["hello".to_string()]);
        assert_eq!(NoCodec.decode_ussd(15, "Saldo").unwrap(), "Saldo");
    }

    #[test]
    fn encode_options_request_status_by_default() {
        let options = EncodeOptions::default();
        assert!(options.request_status);
        assert!(!options.request_reply);
        assert!(!options.flash);
    }
}
