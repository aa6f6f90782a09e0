//! Shared domain types.

use std::fmt;

use chrono::{DateTime, Utc};

/// SMS transfer mode selected with `AT+CMGF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmsMode {
    Pdu,
    Text,
}

impl SmsMode {
    /// The numeric value used in `AT+CMGF=<mode>`.
    pub fn code(self) -> u8 {
        match self {
            SmsMode::Pdu => 0,
            SmsMode::Text => 1,
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "0" => Some(SmsMode::Pdu),
            "1" => Some(SmsMode::Text),
            _ => None,
        }
    }
}

/// Message status filter for `AT+CMGL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    ReceivedUnread,
    ReceivedRead,
    StoredUnsent,
    StoredSent,
    All,
}

impl MessageStatus {
    pub fn code(self) -> u8 {
        match self {
            MessageStatus::ReceivedUnread => 0,
            MessageStatus::ReceivedRead => 1,
            MessageStatus::StoredUnsent => 2,
            MessageStatus::StoredSent => 3,
            MessageStatus::All => 4,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Concatenation header of one part of a multi-part message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConcatInfo {
    /// Reference shared by every part of the message.
    pub reference: u16,
    /// Declared number of parts.
    pub total: u8,
    /// 1-based position of this part.
    pub index: u8,
}

/// A received (or outgoing) short message.
#[derive(Debug, Clone, PartialEq)]
pub struct SmsMessage {
    /// Originating (or destination) address as encoded in the PDU.
    pub address: String,
    /// Service centre timestamp.
    pub time: DateTime<Utc>,
    /// Decoded message body.
    pub text: String,
    /// Concatenation header, if this is one part of a longer message.
    pub concat: Option<ConcatInfo>,
    /// Deterministic content hash, stamped on dispatch.
    pub hash: Option<String>,
}

impl SmsMessage {
    /// The concatenation reference, only for genuinely multi-part messages.
    pub fn reference(&self) -> Option<u16> {
        self.concat.filter(|c| c.total > 1).map(|c| c.reference)
    }
}

/// A delivery status report for a previously sent message.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    /// Recipient address of the original message.
    pub address: String,
    /// Message reference returned by `+CMGS` when the message was sent.
    pub reference: u8,
    /// TP-Status value.
    pub status: u8,
    /// Service centre timestamp of the original submission.
    pub time: DateTime<Utc>,
    /// Time the final status was reached.
    pub discharge_time: Option<DateTime<Utc>>,
}

/// Anything a PDU may decode into.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceivedPdu {
    Message(SmsMessage),
    StatusReport(StatusReport),
}

/// A received PDU together with where it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub pdu: ReceivedPdu,
    /// Storage the PDU was read from (`SM`, `ME`, `SR`, ...).
    pub storage: Option<String>,
    /// 1-based index within `storage`.
    pub index: Option<u32>,
    /// Storage status column from `+CMGL`/`+CMGR`.
    pub status: Option<String>,
}

impl Envelope {
    pub fn new(pdu: ReceivedPdu) -> Self {
        Envelope {
            pdu,
            storage: None,
            index: None,
            status: None,
        }
    }

    /// The storage slot this envelope occupies, when known.
    pub fn slot(&self) -> Option<(String, u32)> {
        Some((self.storage.clone()?, self.index?))
    }
}

/// A multi-part message with every part present.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedMessage {
    pub address: String,
    pub time: DateTime<Utc>,
    /// Part texts joined in part-index order.
    pub text: String,
    /// Hash shared by every part.
    pub hash: String,
    /// Parts sorted by part index, each stamped with `hash`.
    pub parts: Vec<SmsMessage>,
}

/// Occupancy of one message storage, from `+CPMS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageInfo {
    pub storage: String,
    pub used: u32,
    pub total: u32,
}

impl StorageInfo {
    pub fn is_full(&self) -> bool {
        self.total > 0 && self.used >= self.total
    }
}

/// Decoded `+CPMS` reply: the first storage listed is the primary one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageReport {
    pub primary: StorageInfo,
    /// Every distinct storage in reply order.
    pub storages: Vec<StorageInfo>,
}

impl StorageReport {
    pub fn get(&self, storage: &str) -> Option<&StorageInfo> {
        self.storages.iter().find(|s| s.storage == storage)
    }
}

/// The currently selected operator, from `+COPS?`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Network {
    pub mode: Option<String>,
    pub format: Option<String>,
    /// Operator name or numeric code, depending on `format`.
    pub operator: Option<String>,
    /// Access technology.
    pub act: Option<String>,
}

/// One operator from an `AT+COPS=?` scan.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkEntry {
    /// 0 unknown, 1 available, 2 current, 3 forbidden.
    pub status: Option<String>,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub numeric: Option<String>,
    pub act: Option<String>,
}

/// A `+CUSD` notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UssdResponse {
    /// 0 no further action, 1 further action required, 2 terminated.
    pub code: String,
    pub message: Option<String>,
    /// Data coding scheme of `message`.
    pub dcs: Option<u8>,
}

/// Identification gathered during initialization.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModemInfo {
    pub friendly_name: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub version: Option<String>,
    pub serial: Option<String>,
    pub imsi: Option<String>,
    pub has_call: bool,
    pub has_sms: bool,
    pub has_ussd: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(concat: Option<ConcatInfo>) -> SmsMessage {
        SmsMessage {
            address: "+6281234567890".into(),
            time: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            text: "hello".into(),
            concat,
            hash: None,
        }
    }

    #[test]
    fn reference_ignores_single_part_headers() {
        let single = message(Some(ConcatInfo {
            reference: 9,
            total: 1,
            index: 1,
        }));
        assert_eq!(single.reference(), None);

        let part = message(Some(ConcatInfo {
            reference: 9,
            total: 2,
            index: 1,
        }));
        assert_eq!(part.reference(), Some(9));
        assert_eq!(message(None).reference(), None);
    }

    #[test]
    fn sms_mode_codes() {
        assert_eq!(SmsMode::Pdu.code(), 0);
        assert_eq!(SmsMode::from_code(" 1"), Some(SmsMode::Text));
        assert_eq!(SmsMode::from_code("x"), None);
        assert_eq!(MessageStatus::ReceivedRead.to_string(), "1");
    }

    #[test]
    fn storage_full_detection() {
        let full = StorageInfo {
            storage: "SM".into(),
            used: 40,
            total: 40,
        };
        let empty = StorageInfo {
            storage: "SR".into(),
            used: 0,
            total: 0,
        };
        assert!(full.is_full());
        assert!(!empty.is_full());
    }

    #[test]
    fn envelope_slot_requires_storage_and_index() {
        let mut env = Envelope::new(ReceivedPdu::Message(message(None)));
        assert_eq!(env.slot(), None);
        env.storage = Some("SM".into());
        env.index = Some(3);
        assert_eq!(env.slot(), Some(("SM".to_string(), 3)));
    }
}
