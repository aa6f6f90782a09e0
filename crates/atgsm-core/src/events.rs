//! Asynchronous modem event types.
//!
//! Two separate broadcast channels carry notifications out of a modem:
//! [`ModemEvent`] for decoded properties, messages, and session outcomes,
//! and [`StateChange`] for busy/idle transitions of the device itself.
//! Events are delivered on a best-effort basis; slow consumers of a
//! bounded broadcast channel may miss events.

use std::fmt;

use crate::types::{
    JoinedMessage, Network, NetworkEntry, SmsMessage, SmsMode, StatusReport, StorageReport,
    UssdResponse,
};

/// A decoded device property.
#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    /// Service centre address (`+CSCA`).
    Smsc(String),
    /// Currently registered operator (`+COPS?`).
    Network(Network),
    /// Operator scan result (`+COPS=?`).
    Networks(Vec<NetworkEntry>),
    /// Selected TE character set (`+CSCS?`).
    Charset(String),
    /// Supported character sets (`+CSCS=?`).
    Charsets(Vec<String>),
    /// Keypad lock state (`+CLCK`).
    KeyLock(bool),
    /// Supported facility locks (`+CLCK=?`).
    Locks(Vec<String>),
    /// Received signal strength indication, 0..=31 or 99 when unknown.
    Signal(u8),
    /// SMS transfer mode (`+CMGF`).
    SmsMode(SmsMode),
    /// Message storage occupancy (`+CPMS`).
    Storage(StorageReport),
    /// Reference assigned to the last submitted message (`+CMGS`).
    MessageReference(u8),
    /// Vendor unsolicited indicator (for example `+WIND`).
    Indicator(String),
    /// A storage reported as full by the modem.
    MemoryFull(String),
    /// Structured mobile equipment error (`+CME ERROR`).
    CmeError(String),
    /// Structured message service error (`+CMS ERROR`).
    CmsError(String),
}

/// An event emitted by a modem.
///
/// Subscribe via `GsmModem::subscribe()`.
#[derive(Debug, Clone, PartialEq)]
pub enum ModemEvent {
    /// A device property was decoded from a reply or notification.
    PropertyChanged(Property),

    /// A single-part message, or an unrelated message released while a
    /// multi-part set is still incomplete.
    Message(SmsMessage),

    /// All parts of a multi-part message arrived.
    MultipartMessage(JoinedMessage),

    /// A delivery status report arrived.
    StatusReport(StatusReport),

    /// Incoming call with caller identification.
    Ring {
        /// Caller number from `+CLIP`.
        caller: String,
    },

    /// A USSD reply arrived.
    Ussd(UssdResponse),

    /// A send-message operation finished.
    PduSent {
        /// Whether every segment was accepted by the modem.
        success: bool,
        /// Destination address.
        address: String,
        /// Hash identifying the whole message.
        hash: String,
        /// Message references returned for each accepted segment.
        references: Vec<u8>,
    },

    /// A dial operation finished.
    Dialed {
        success: bool,
        address: String,
        hash: String,
    },

    /// A USSD session finished.
    UssdSession {
        success: bool,
        code: String,
        hash: String,
    },
}

/// A device state flag. The device is idle when none is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateFlag {
    /// An AT transaction is in flight.
    Busy,
    /// The notification processor is running.
    Processing,
    /// A multi-step message send is in progress.
    Sending,
}

impl fmt::Display for StateFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StateFlag::Busy => "busy",
            StateFlag::Processing => "processing",
            StateFlag::Sending => "sending",
        };
        f.write_str(name)
    }
}

/// Emitted on the state channel whenever the device flips between idle
/// and not idle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub idle: bool,
    /// Flags set at the time of the transition.
    pub active: Vec<StateFlag>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modem_event_is_clone_and_debug() {
        let event = ModemEvent::Ring {
            caller: "+6281357909840".into(),
        };
        let cloned = event.clone();
        assert!(format!("{cloned:?}").contains("6281357909840"));
    }

    #[test]
    fn state_flag_display() {
        assert_eq!(StateFlag::Busy.to_string(), "busy");
    }

    #[test]
    fn events_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ModemEvent>();
        assert_send_sync::<StateChange>();
    }
}
