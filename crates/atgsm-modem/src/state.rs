//! Device state: the properties decoded so far and the rules that turn
//! state updates into events and follow-up work.

use std::collections::BTreeMap;

use tracing::{debug, info};

use atgsm_core::events::{ModemEvent, Property};
use atgsm_core::types::{
    Envelope, Network, NetworkEntry, SmsMode, StorageInfo, StorageReport, UssdResponse,
};

use crate::decoder::StateUpdate;

/// Everything known about the device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceState {
    pub smsc: Option<String>,
    pub network: Option<Network>,
    pub networks: Vec<NetworkEntry>,
    pub charset: Option<String>,
    pub charsets: Vec<String>,
    pub keylock: Option<bool>,
    pub locks: Vec<String>,
    pub signal: Option<u8>,
    pub sms_mode: Option<SmsMode>,
    /// Currently selected message storage.
    pub storage: Option<String>,
    /// Last known occupancy of every storage seen.
    pub storages: BTreeMap<String, StorageInfo>,
    pub message_reference: Option<u8>,
    pub indicator: Option<String>,
    pub ring_count: u32,
    pub caller: Option<String>,
    /// Storages reported full and not yet cleaned.
    pub memfull: Vec<String>,
    /// Status reports are waiting in the report storage.
    pub has_report: bool,
    /// Storage the driver keeps status reports in.
    pub report_storage: Option<String>,
    pub last_error: Option<String>,
}

/// Work produced by an update, beyond the state change itself.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Event(ModemEvent),
    Messages(Vec<Envelope>),
    Read { storage: String, index: u32 },
    Ussd(UssdResponse),
}

impl DeviceState {
    pub fn new(report_storage: Option<String>) -> Self {
        DeviceState {
            report_storage,
            ..Default::default()
        }
    }

    /// Occupancy of `storage`, when known.
    pub fn storage_info(&self, storage: &str) -> Option<&StorageInfo> {
        self.storages.get(storage)
    }

    /// Whether the device is ringing.
    pub fn is_ringing(&self) -> bool {
        self.ring_count > 0
    }

    /// Apply one update.
    pub fn apply(&mut self, update: StateUpdate) -> Vec<Action> {
        match update {
            StateUpdate::Property(property) => {
                self.apply_property(&property);
                vec![Action::Event(ModemEvent::PropertyChanged(property))]
            }
            StateUpdate::Messages(envelopes) => vec![Action::Messages(envelopes)],
            StateUpdate::ReadMessage { storage, index } => vec![Action::Read { storage, index }],
            StateUpdate::Ringing(true) => {
                self.ring_count += 1;
                Vec::new()
            }
            StateUpdate::Ringing(false) => {
                self.ring_count = 0;
                self.caller = None;
                Vec::new()
            }
            StateUpdate::Caller(caller) => {
                if self.caller.as_deref() == Some(caller.as_str()) {
                    return Vec::new();
                }
                self.caller = Some(caller.clone());
                if self.ring_count > 0 {
                    vec![Action::Event(ModemEvent::Ring { caller })]
                } else {
                    Vec::new()
                }
            }
            StateUpdate::Ussd(response) => vec![Action::Ussd(response)],
        }
    }

    fn apply_property(&mut self, property: &Property) {
        match property {
            Property::Smsc(v) => self.smsc = Some(v.clone()),
            Property::Network(v) => self.network = Some(v.clone()),
            Property::Networks(v) => self.networks = v.clone(),
            Property::Charset(v) => self.charset = Some(v.clone()),
            Property::Charsets(v) => self.charsets = v.clone(),
            Property::KeyLock(v) => self.keylock = Some(*v),
            Property::Locks(v) => self.locks = v.clone(),
            Property::Signal(v) => self.signal = Some(*v),
            Property::SmsMode(v) => self.sms_mode = Some(*v),
            Property::Storage(report) => self.merge_storage(report),
            Property::MessageReference(v) => self.message_reference = Some(*v),
            Property::Indicator(v) => self.indicator = Some(v.clone()),
            Property::MemoryFull(storage) => self.mark_full(storage),
            Property::CmeError(code) => self.last_error = Some(format!("CME {code}")),
            Property::CmsError(code) => self.last_error = Some(format!("CMS {code}")),
        }
    }

    fn merge_storage(&mut self, report: &StorageReport) {
        self.storage = Some(report.primary.storage.clone());
        for info in &report.storages {
            self.storages.insert(info.storage.clone(), info.clone());
            if info.is_full() {
                self.mark_full(&info.storage);
            }
            if self.report_storage.as_deref() == Some(info.storage.as_str()) && info.used > 0 {
                debug!(storage = %info.storage, used = info.used, "status reports pending");
                self.has_report = true;
            }
        }
    }

    fn mark_full(&mut self, storage: &str) {
        if !self.memfull.iter().any(|s| s == storage) {
            info!(storage = %storage, "message storage full");
            self.memfull.push(storage.to_string());
        }
    }

    /// Record that `storage` was selected.
    pub fn select_storage(&mut self, storage: &str) {
        self.storage = Some(storage.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(storages: &[(&str, u32, u32)]) -> StateUpdate {
        let storages: Vec<StorageInfo> = storages
            .iter()
            .map(|(s, used, total)| StorageInfo {
                storage: s.to_string(),
                used: *used,
                total: *total,
            })
            .collect();
        StateUpdate::Property(Property::Storage(StorageReport {
            primary: storages[0].clone(),
            storages,
        }))
    }

    // =======================================================================
    // Storage
    // =======================================================================

    #[test]
    fn storage_report_updates_selection_and_map() {
        let mut state = DeviceState::new(Some("SR".into()));
        let actions = state.apply(report(&[("SM", 6, 40), ("SR", 0, 20)]));
        assert_eq!(actions.len(), 1);
        assert_eq!(state.storage.as_deref(), Some("SM"));
        assert_eq!(state.storage_info("SM").map(|s| s.used), Some(6));
        assert!(state.memfull.is_empty());
        assert!(!state.has_report);
    }

    #[test]
    fn full_storage_is_marked_once() {
        let mut state = DeviceState::new(None);
        state.apply(report(&[("SM", 40, 40)]));
        state.apply(StateUpdate::Property(Property::MemoryFull("SM".into())));
        assert_eq!(state.memfull, vec!["SM".to_string()]);
    }

    #[test]
    fn empty_storage_with_zero_total_is_not_full() {
        let mut state = DeviceState::new(None);
        state.apply(report(&[("SR", 0, 0)]));
        assert!(state.memfull.is_empty());
    }

    #[test]
    fn pending_reports_detected() {
        let mut state = DeviceState::new(Some("SR".into()));
        state.apply(report(&[("SM", 1, 40), ("SR", 2, 20)]));
        assert!(state.has_report);
    }

    // =======================================================================
    // Calls
    // =======================================================================

    #[test]
    fn ring_emitted_once_per_caller() {
        let mut state = DeviceState::new(None);
        assert!(state.apply(StateUpdate::Ringing(true)).is_empty());
        let actions = state.apply(StateUpdate::Caller("+6281357909840".into()));
        assert_eq!(
            actions,
            vec![Action::Event(ModemEvent::Ring {
                caller: "+6281357909840".into()
            })]
        );

        state.apply(StateUpdate::Ringing(true));
        assert!(state.apply(StateUpdate::Caller("+6281357909840".into())).is_empty());
        assert_eq!(state.ring_count, 2);

        state.apply(StateUpdate::Ringing(false));
        assert_eq!(state.ring_count, 0);
        assert_eq!(state.caller, None);
    }

    #[test]
    fn caller_without_ring_is_only_recorded() {
        let mut state = DeviceState::new(None);
        assert!(state.apply(StateUpdate::Caller("123".into())).is_empty());
        assert_eq!(state.caller.as_deref(), Some("123"));
    }

    #[test]
    fn errors_are_recorded() {
        let mut state = DeviceState::new(None);
        state.apply(StateUpdate::Property(Property::CmsError("321".into())));
        assert_eq!(state.last_error.as_deref(), Some("CMS 321"));
    }
}
