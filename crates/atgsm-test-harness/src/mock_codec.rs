//! A readable fake PDU codec.
//!
//! [`MockCodec`] implements [`SmsCodec`] by hex encoding a pipe separated
//! record instead of a real TPDU. PDUs built with [`MockCodec::message_pdu`]
//! and [`MockCodec::report_pdu`] decode back to the same values, so tests can
//! script `+CMGL:`/`+CMGR:` replies without a real 7-bit/UCS2 encoder.
//!
//! Record layouts before hex encoding:
//!
//! - received message: `M|address|unix_ms|reference|total|index|text`
//! - status report: `R|address|reference|status|unix_ms`
//! - outgoing segment: `S|address|reference|total|index|flags|text`

use chrono::{DateTime, Utc};

use atgsm_core::codec::{DecodedPdu, EncodedPdu, OutgoingSegment, SmsCodec};
use atgsm_core::error::{Error, Result};
use atgsm_core::types::{ConcatInfo, ReceivedPdu, SmsMessage, StatusReport};

/// Fake [`SmsCodec`] for tests.
#[derive(Debug, Clone)]
pub struct MockCodec {
    segment_len: usize,
}

impl MockCodec {
    /// A codec that splits messages every 160 characters.
    pub fn new() -> Self {
        MockCodec { segment_len: 160 }
    }

    /// A codec that splits messages every `segment_len` characters.
    pub fn with_segment_len(segment_len: usize) -> Self {
        MockCodec {
            segment_len: segment_len.max(1),
        }
    }

    /// Build a received-message PDU and its TPDU length.
    pub fn message_pdu(message: &SmsMessage) -> (String, usize) {
        let (reference, total, index) = message
            .concat
            .map(|c| (c.reference, c.total, c.index))
            .unwrap_or((0, 0, 0));
        let record = format!(
            "M|{}|{}|{}|{}|{}|{}",
            message.address,
            message.time.timestamp_millis(),
            reference,
            total,
            index,
            message.text
        );
        (hex::encode_upper(&record), record.len())
    }

    /// Build a status-report PDU and its TPDU length.
    pub fn report_pdu(report: &StatusReport) -> (String, usize) {
        let record = format!(
            "R|{}|{}|{}|{}",
            report.address,
            report.reference,
            report.status,
            report.time.timestamp_millis()
        );
        (hex::encode_upper(&record), record.len())
    }

    /// Decode an outgoing PDU produced by [`SmsCodec::encode`] back into
    /// `(address, concat, text)`.
    pub fn decode_outgoing(pdu: &str) -> Result<(String, Option<ConcatInfo>, String)> {
        let record = decode_record(pdu)?;
        let fields: Vec<&str> = record.splitn(7, '|').collect();
        match fields.as_slice() {
            ["S", address, reference, total, index, _flags, text] => Ok((
                address.to_string(),
                concat(reference, total, index)?,
                text.to_string(),
            )),
            _ => Err(Error::Codec(format!("not an outgoing record: {record}"))),
        }
    }
}

impl Default for MockCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_record(pdu: &str) -> Result<String> {
    let bytes = hex::decode(pdu.trim()).map_err(|e| Error::Codec(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| Error::Codec(e.to_string()))
}

fn number<T: std::str::FromStr>(value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Codec(format!("bad number: {value}")))
}

fn timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(number(value)?)
        .ok_or_else(|| Error::Codec(format!("bad timestamp: {value}")))
}

fn concat(reference: &str, total: &str, index: &str) -> Result<Option<ConcatInfo>> {
    let total: u8 = number(total)?;
    if total == 0 {
        return Ok(None);
    }
    Ok(Some(ConcatInfo {
        reference: number(reference)?,
        total,
        index: number(index)?,
    }))
}

impl SmsCodec for MockCodec {
    fn split(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        if chars.is_empty() {
            return vec![String::new()];
        }
        chars
            .chunks(self.segment_len)
            .map(|c| c.iter().collect())
            .collect()
    }

    fn encode(&self, segment: &OutgoingSegment<'_>) -> Result<EncodedPdu> {
        if segment.address.is_empty() {
            return Err(Error::Codec("empty destination address".into()));
        }
        let (reference, total, index) = segment
            .concat
            .map(|c| (c.reference, c.total, c.index))
            .unwrap_or((0, 0, 0));
        let flags = format!(
            "{}{}{}",
            u8::from(segment.options.request_status),
            u8::from(segment.options.request_reply),
            u8::from(segment.options.flash)
        );
        let record = format!(
            "S|{}|{}|{}|{}|{}|{}",
            segment.address, reference, total, index, flags, segment.text
        );
        Ok(EncodedPdu {
            pdu: hex::encode_upper(&record),
            tp_length: record.len(),
        })
    }

    fn decode(&self, pdu: &str) -> Result<DecodedPdu> {
        let record = decode_record(pdu)?;
        let tp_length = record.len();
        let fields: Vec<&str> = record.splitn(7, '|').collect();
        let pdu = match fields.as_slice() {
            ["M", address, time, reference, total, index, text] => {
                ReceivedPdu::Message(SmsMessage {
                    address: address.to_string(),
                    time: timestamp(time)?,
                    text: text.to_string(),
                    concat: concat(reference, total, index)?,
                    hash: None,
                })
            }
            ["R", address, reference, status, time] => {
                let time = timestamp(time)?;
                ReceivedPdu::StatusReport(StatusReport {
                    address: address.to_string(),
                    reference: number(reference)?,
                    status: number(status)?,
                    time,
                    discharge_time: Some(time),
                })
            }
            _ => return Err(Error::Codec(format!("unknown record: {record}"))),
        };
        Ok(DecodedPdu { tp_length, pdu })
    }

    fn encode_ussd(&self, _dcs: u8, text: &str) -> Result<String> {
        Ok(hex::encode_upper(text))
    }

    fn decode_ussd(&self, _dcs: u8, payload: &str) -> Result<String> {
        decode_record(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atgsm_core::codec::EncodeOptions;

    fn sample(concat: Option<ConcatInfo>) -> SmsMessage {
        SmsMessage {
            address: "+6281234567890".into(),
            time: DateTime::from_timestamp_millis(1_700_000_000_123).unwrap(),
            text: "a|b".into(),
            concat,
            hash: None,
        }
    }

    #[test]
    fn message_pdu_decodes_to_same_message() {
        let codec = MockCodec::new();
        let msg = sample(Some(ConcatInfo {
            reference: 7,
            total: 2,
            index: 1,
        }));
        let (pdu, len) = MockCodec::message_pdu(&msg);
        let decoded = codec.decode(&pdu).unwrap();
        assert_eq!(decoded.tp_length, len);
        assert_eq!(decoded.pdu, ReceivedPdu::Message(msg));
    }

    #[test]
    fn report_pdu_decodes() {
        let codec = MockCodec::new();
        let report = StatusReport {
            address: "+6281234567890".into(),
            reference: 12,
            status: 0,
            time: DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
            discharge_time: None,
        };
        let (pdu, _) = MockCodec::report_pdu(&report);
        match codec.decode(&pdu).unwrap().pdu {
            ReceivedPdu::StatusReport(r) => assert_eq!(r.reference, 12),
            other => panic!("expected report, got {other:?}"),
        }
    }

    #[test]
    fn split_by_segment_len() {
        let codec = MockCodec::with_segment_len(4);
        assert_eq!(codec.split("abcdefghij"), vec!["abcd", "efgh", "ij"]);
        assert_eq!(codec.split(""), vec![""]);
    }

    #[test]
    fn encode_round_trips_through_decode_outgoing() {
        let codec = MockCodec::new();
        let info = ConcatInfo {
            reference: 3,
            total: 2,
            index: 2,
        };
        let encoded = codec
            .encode(&OutgoingSegment {
                address: "+628123",
                text: "world",
                concat: Some(info),
                options: EncodeOptions::default(),
            })
            .unwrap();
        let (address, concat, text) = MockCodec::decode_outgoing(&encoded.pdu).unwrap();
        assert_eq!(address, "+628123");
        assert_eq!(concat, Some(info));
        assert_eq!(text, "world");
        assert_eq!(encoded.tp_length * 2, encoded.pdu.len());
    }

    #[test]
    fn garbage_is_codec_error() {
        let codec = MockCodec::new();
        assert!(matches!(codec.decode("ZZ"), Err(Error::Codec(_))));
        assert!(matches!(
            codec.decode(&hex::encode("X|1")),
            Err(Error::Codec(_))
        ));
    }
}
