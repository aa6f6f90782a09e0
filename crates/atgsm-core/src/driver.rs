//! Driver tables: per-modem mappings from symbolic keys to AT templates.
//!
//! A [`Driver`] is a flat map from keys such as [`keys::CMD_SMS_READ`] to
//! literal command templates (`AT+CMGR=%SMS_ID%`) or response prefixes
//! (`+CMGR:`). The engine treats the values as opaque text: it only
//! substitutes placeholders and compares prefixes.
//!
//! Placeholders use the `%NAME%` form. `NONE`, `CR`, and `LF` are always
//! available; `$XX` inserts the character with hex code `XX`. A template
//! that resolves to an empty string means the feature is not supported by
//! the modem, and [`Driver::get`] reports it as `None`.
//!
//! Variant drivers derive from a parent and override individual keys.
//! Loading drivers from files is left to the application.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Symbolic driver keys.
pub mod keys {
    pub const PARAM_TERMINATOR: &str = "PARAM_TERMINATOR";
    pub const PARAM_DEVICE_NAME: &str = "PARAM_DEVICE_NAME";
    pub const PARAM_KEYPAD_CHARSET: &str = "PARAM_KEYPAD_CHARSET";
    pub const PARAM_SMS_MODE: &str = "PARAM_SMS_MODE";
    pub const PARAM_SMS_COMMIT: &str = "PARAM_SMS_COMMIT";
    pub const PARAM_SMS_CANCEL: &str = "PARAM_SMS_CANCEL";
    pub const PARAM_SMS_STORAGE: &str = "PARAM_SMS_STORAGE";
    pub const PARAM_SMS_WAIT_PROMPT: &str = "PARAM_SMS_WAIT_PROMPT";
    pub const PARAM_REPORT_STORAGE: &str = "PARAM_REPORT_STORAGE";
    pub const PARAM_USSD_ENCODED: &str = "PARAM_USSD_ENCODED";
    pub const PARAM_USSD_ENCODING: &str = "PARAM_USSD_ENCODING";
    pub const PARAM_USSD_RESPONSE_ENCODED: &str = "PARAM_USSD_RESPONSE_ENCODED";

    pub const CMD_INIT: &str = "CMD_INIT";
    pub const CMD_QUERY_FRIENDLY_NAME: &str = "CMD_QUERY_FRIENDLY_NAME";
    pub const CMD_QUERY_MANUFACTURER: &str = "CMD_QUERY_MANUFACTURER";
    pub const CMD_QUERY_MODEL: &str = "CMD_QUERY_MODEL";
    pub const CMD_QUERY_VERSION: &str = "CMD_QUERY_VERSION";
    pub const CMD_QUERY_IMEI: &str = "CMD_QUERY_IMEI";
    pub const CMD_QUERY_IMSI: &str = "CMD_QUERY_IMSI";
    pub const CMD_QUERY_SMSC: &str = "CMD_QUERY_SMSC";
    pub const CMD_DIAL: &str = "CMD_DIAL";
    pub const CMD_ANSWER: &str = "CMD_ANSWER";
    pub const CMD_HANGUP: &str = "CMD_HANGUP";
    pub const CMD_CALL_MONITOR: &str = "CMD_CALL_MONITOR";
    pub const CMD_SMS_MONITOR: &str = "CMD_SMS_MONITOR";
    pub const CMD_SMS_STORAGE_GET: &str = "CMD_SMS_STORAGE_GET";
    pub const CMD_SMS_STORAGE_SET: &str = "CMD_SMS_STORAGE_SET";
    pub const CMD_SMS_READ: &str = "CMD_SMS_READ";
    pub const CMD_SMS_DELETE: &str = "CMD_SMS_DELETE";
    pub const CMD_SMS_LIST: &str = "CMD_SMS_LIST";
    pub const CMD_SMS_MODE_SET: &str = "CMD_SMS_MODE_SET";
    pub const CMD_SMS_MODE_GET: &str = "CMD_SMS_MODE_GET";
    pub const CMD_SMS_SEND_PDU: &str = "CMD_SMS_SEND_PDU";
    pub const CMD_SMS_SEND_TEXT: &str = "CMD_SMS_SEND_TEXT";
    pub const CMD_SMS_SEND_COMMIT: &str = "CMD_SMS_SEND_COMMIT";
    pub const CMD_USSD_SET: &str = "CMD_USSD_SET";
    pub const CMD_USSD_CANCEL: &str = "CMD_USSD_CANCEL";
    pub const CMD_USSD_SEND: &str = "CMD_USSD_SEND";
    pub const CMD_KEYPAD: &str = "CMD_KEYPAD";
    pub const CMD_KEYPAD_ACCESS: &str = "CMD_KEYPAD_ACCESS";
    pub const CMD_KEYPAD_LOCK: &str = "CMD_KEYPAD_LOCK";
    pub const CMD_CSQ: &str = "CMD_CSQ";
    pub const CMD_CHARSET_LIST: &str = "CMD_CHARSET_LIST";
    pub const CMD_CHARSET_GET: &str = "CMD_CHARSET_GET";
    pub const CMD_CHARSET_SET: &str = "CMD_CHARSET_SET";
    pub const CMD_NETWORK_LIST: &str = "CMD_NETWORK_LIST";
    pub const CMD_NETWORK_GET: &str = "CMD_NETWORK_GET";

    pub const RESPONSE_OK: &str = "RESPONSE_OK";
    pub const RESPONSE_ERROR: &str = "RESPONSE_ERROR";
    pub const RESPONSE_RING: &str = "RESPONSE_RING";
    pub const RESPONSE_NO_CARRIER: &str = "RESPONSE_NO_CARRIER";
    pub const RESPONSE_NOT_SUPPORTED: &str = "RESPONSE_NOT_SUPPORTED";
    pub const RESPONSE_SMSC: &str = "RESPONSE_SMSC";
    pub const RESPONSE_SMS_PROMPT: &str = "RESPONSE_SMS_PROMPT";
    pub const RESPONSE_NEW_MESSAGE: &str = "RESPONSE_NEW_MESSAGE";
    pub const RESPONSE_NEW_MESSAGE_DIRECT: &str = "RESPONSE_NEW_MESSAGE_DIRECT";
    pub const RESPONSE_DELIVERY_REPORT: &str = "RESPONSE_DELIVERY_REPORT";
    pub const RESPONSE_DELIVERY_REPORT_DIRECT: &str = "RESPONSE_DELIVERY_REPORT_DIRECT";
    pub const RESPONSE_CPMS: &str = "RESPONSE_CPMS";
    pub const RESPONSE_CMGF: &str = "RESPONSE_CMGF";
    pub const RESPONSE_CMGR: &str = "RESPONSE_CMGR";
    pub const RESPONSE_CMGL: &str = "RESPONSE_CMGL";
    pub const RESPONSE_CMGS: &str = "RESPONSE_CMGS";
    pub const RESPONSE_CLIP: &str = "RESPONSE_CLIP";
    pub const RESPONSE_CUSD: &str = "RESPONSE_CUSD";
    pub const RESPONSE_CSCS: &str = "RESPONSE_CSCS";
    pub const RESPONSE_CLCK: &str = "RESPONSE_CLCK";
    pub const RESPONSE_CSQ: &str = "RESPONSE_CSQ";
    pub const RESPONSE_RSSI: &str = "RESPONSE_RSSI";
    pub const RESPONSE_CALL_END: &str = "RESPONSE_CALL_END";
    pub const RESPONSE_COPS: &str = "RESPONSE_COPS";
    pub const RESPONSE_MEM_FULL: &str = "RESPONSE_MEM_FULL";
    pub const RESPONSE_UNSOLICITED_IND: &str = "RESPONSE_UNSOLICITED_IND";
    pub const RESPONSE_CME_ERROR: &str = "RESPONSE_CME_ERROR";
    pub const RESPONSE_CMS_ERROR: &str = "RESPONSE_CMS_ERROR";
}

/// Name of the built-in driver every other driver ultimately derives from.
pub const GENERIC_DRIVER: &str = "Generic";

/// Default terminator used when a driver leaves it empty.
pub const DEFAULT_TERMINATOR: &str = "\r\n";

const GENERIC_COMMANDS: &[(&str, &str)] = &[
    (keys::PARAM_TERMINATOR, "%CR%%LF%"),
    (keys::PARAM_DEVICE_NAME, "%MANUF% %MODEL%"),
    (keys::PARAM_KEYPAD_CHARSET, "%NONE%"),
    (keys::PARAM_SMS_MODE, "0"),
    (keys::PARAM_SMS_COMMIT, "$1A"),
    (keys::PARAM_SMS_CANCEL, "$1B"),
    (keys::PARAM_SMS_STORAGE, "%NONE%"),
    (keys::PARAM_SMS_WAIT_PROMPT, "1"),
    (keys::PARAM_REPORT_STORAGE, "%NONE%"),
    (keys::PARAM_USSD_ENCODED, "0"),
    (keys::PARAM_USSD_ENCODING, "15"),
    (keys::PARAM_USSD_RESPONSE_ENCODED, "0"),
    (keys::CMD_INIT, "ATZ"),
    ("CMD_INIT1", "ATE0"),
    (keys::CMD_QUERY_FRIENDLY_NAME, "ATI"),
    (keys::CMD_QUERY_MANUFACTURER, "AT+CGMI"),
    (keys::CMD_QUERY_MODEL, "AT+CGMM"),
    (keys::CMD_QUERY_VERSION, "AT+CGMR"),
    (keys::CMD_QUERY_IMEI, "AT+CGSN"),
    (keys::CMD_QUERY_IMSI, "AT+CIMI"),
    (keys::CMD_QUERY_SMSC, "AT+CSCA?"),
    (keys::CMD_CALL_MONITOR, "AT+CLIP=1"),
    (keys::CMD_SMS_MONITOR, "AT+CNMI=2,1,,2"),
    (keys::CMD_DIAL, "ATD%PHONE_NUMBER%;"),
    (keys::CMD_ANSWER, "ATA"),
    (keys::CMD_HANGUP, "ATH"),
    (keys::CMD_SMS_STORAGE_GET, "AT+CPMS?"),
    (keys::CMD_SMS_STORAGE_SET, "AT+CPMS=\"%STORAGE%\""),
    (keys::CMD_SMS_READ, "AT+CMGR=%SMS_ID%"),
    (keys::CMD_SMS_DELETE, "AT+CMGD=%SMS_ID%"),
    (keys::CMD_SMS_LIST, "AT+CMGL=%SMS_STAT%"),
    (keys::CMD_SMS_MODE_GET, "AT+CMGF?"),
    (keys::CMD_SMS_MODE_SET, "AT+CMGF=%SMS_MODE%"),
    (keys::CMD_SMS_SEND_PDU, "AT+CMGS=%SMS_LEN%"),
    (keys::CMD_SMS_SEND_TEXT, "AT+CMGS=\"%PHONE_NUMBER%\""),
    (keys::CMD_SMS_SEND_COMMIT, "%MESSAGE%%COMMIT%"),
    (keys::CMD_USSD_SET, "AT+CUSD=1"),
    (keys::CMD_USSD_CANCEL, "AT+CUSD=2"),
    (keys::CMD_USSD_SEND, "AT+CUSD=1,%SERVICE_NUMBER%,%ENC%"),
    (keys::CMD_KEYPAD, "AT+CKPD=\"%KEYS%\""),
    (keys::CMD_KEYPAD_ACCESS, "AT+CMEC=2"),
    (keys::CMD_KEYPAD_LOCK, "AT+CLCK=\"CS\",%VALUE%"),
    (keys::CMD_CSQ, "AT+CSQ"),
    (keys::CMD_CHARSET_LIST, "AT+CSCS=?"),
    (keys::CMD_CHARSET_GET, "AT+CSCS?"),
    (keys::CMD_CHARSET_SET, "AT+CSCS=\"%CHARSET%\""),
    (keys::CMD_NETWORK_LIST, "AT+COPS=?"),
    (keys::CMD_NETWORK_GET, "AT+COPS?"),
    (keys::RESPONSE_OK, "OK"),
    (keys::RESPONSE_ERROR, "ERROR"),
    (keys::RESPONSE_RING, "RING"),
    (keys::RESPONSE_NO_CARRIER, "NO CARRIER"),
    (keys::RESPONSE_NOT_SUPPORTED, "COMMAND NOT SUPPORT"),
    (keys::RESPONSE_SMSC, "+CSCA:"),
    (keys::RESPONSE_SMS_PROMPT, "> "),
    (keys::RESPONSE_NEW_MESSAGE, "+CMTI:"),
    (keys::RESPONSE_NEW_MESSAGE_DIRECT, "+CMT:"),
    (keys::RESPONSE_DELIVERY_REPORT, "+CDSI:"),
    (keys::RESPONSE_DELIVERY_REPORT_DIRECT, "+CDS:"),
    (keys::RESPONSE_CPMS, "+CPMS:"),
    (keys::RESPONSE_CMGF, "+CMGF:"),
    (keys::RESPONSE_CMGR, "+CMGR:"),
    (keys::RESPONSE_CMGL, "+CMGL:"),
    (keys::RESPONSE_CMGS, "+CMGS:"),
    (keys::RESPONSE_CLIP, "+CLIP:"),
    (keys::RESPONSE_CUSD, "+CUSD:"),
    (keys::RESPONSE_CSCS, "+CSCS:"),
    (keys::RESPONSE_CLCK, "+CLCK:"),
    (keys::RESPONSE_CSQ, "+CSQ:"),
    (keys::RESPONSE_RSSI, "%NONE%"),
    (keys::RESPONSE_CALL_END, "%NONE%"),
    (keys::RESPONSE_COPS, "+COPS:"),
    (keys::RESPONSE_MEM_FULL, "%NONE%"),
    (keys::RESPONSE_UNSOLICITED_IND, "%NONE%"),
    (keys::RESPONSE_CME_ERROR, "+CME ERROR:"),
    (keys::RESPONSE_CMS_ERROR, "+CMS ERROR:"),
];

/// A modem driver: a named table of command and response templates.
#[derive(Debug, Clone)]
pub struct Driver {
    name: String,
    description: String,
    parent: Option<String>,
    commands: HashMap<String, String>,
}

impl Driver {
    /// The built-in generic driver, suitable for most 3GPP TS 27.005/27.007
    /// compliant modems.
    pub fn generic() -> Self {
        Driver {
            name: GENERIC_DRIVER.to_string(),
            description: GENERIC_DRIVER.to_string(),
            parent: None,
            commands: GENERIC_COMMANDS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// Create a driver named `name` that starts with every entry of `parent`.
    pub fn derive(name: &str, parent: &Driver) -> Self {
        Driver {
            name: name.to_string(),
            description: name.to_string(),
            parent: Some(parent.name.clone()),
            commands: parent.commands.clone(),
        }
    }

    /// Set a human readable description.
    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Override or add a single entry.
    pub fn set(&mut self, key: &str, value: &str) {
        self.commands.insert(key.to_string(), value.to_string());
    }

    /// Builder-style variant of [`set`](Self::set).
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.set(key, value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Name of the driver this one was derived from.
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// Whether `key` is defined at all, even if it resolves to nothing.
    pub fn has(&self, key: &str) -> bool {
        self.commands.contains_key(key)
    }

    /// The raw, unsubstituted template for `key`.
    pub fn template(&self, key: &str) -> Option<&str> {
        self.commands.get(key).map(String::as_str)
    }

    /// Resolve `key` with only the built-in placeholders.
    pub fn get(&self, key: &str) -> Option<String> {
        self.get_with(key, &[])
    }

    /// Resolve `key`, substituting `vars` and the built-in placeholders.
    ///
    /// Returns `None` when the key is missing or resolves to an empty
    /// string.
    pub fn get_with(&self, key: &str, vars: &[(&str, &str)]) -> Option<String> {
        let template = self.commands.get(key)?;
        let value = substitute(template, vars);
        (!value.is_empty()).then_some(value)
    }

    /// Resolve `key` and interpret it as a flag (`"1"` is true).
    pub fn flag(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| v.trim() == "1")
    }

    /// Resolve `key` and parse it as a number.
    pub fn number(&self, key: &str) -> Option<u32> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    /// The line terminator, falling back to CR LF.
    pub fn terminator(&self) -> String {
        self.get(keys::PARAM_TERMINATOR)
            .unwrap_or_else(|| DEFAULT_TERMINATOR.to_string())
    }
}

impl Default for Driver {
    fn default() -> Self {
        Self::generic()
    }
}

/// Substitute `$XX` hex escapes and `%NAME%` placeholders in `template`.
///
/// Unknown placeholders are left untouched.
pub fn substitute(template: &str, vars: &[(&str, &str)]) -> String {
    let escaped = substitute_hex(template);
    let lookup = |name: &str| -> Option<&str> {
        vars.iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| *v)
            .or(match name {
                "NONE" => Some(""),
                "CR" => Some("\r"),
                "LF" => Some("\n"),
                _ => None,
            })
    };

    let mut out = String::with_capacity(escaped.len());
    let mut rest = escaped.as_str();
    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('%') {
            Some(end) if is_placeholder(&after[..end]) => match lookup(&after[..end]) {
                Some(value) => {
                    out.push_str(value);
                    rest = &after[end + 1..];
                }
                None => {
                    out.push('%');
                    out.push_str(&after[..end]);
                    rest = &after[end..];
                }
            },
            _ => {
                out.push('%');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_placeholder(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
}

fn substitute_hex(template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '$' {
            let code = template
                .get(i + 1..i + 3)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(code) = code {
                out.push(char::from(code));
                chars.next();
                chars.next();
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// A registry of named drivers.
#[derive(Debug, Clone)]
pub struct DriverSet {
    drivers: Vec<Driver>,
}

impl DriverSet {
    /// A set holding only the generic driver.
    pub fn new() -> Self {
        DriverSet {
            drivers: vec![Driver::generic()],
        }
    }

    /// Register a driver. Names must be unique.
    pub fn add(&mut self, driver: Driver) -> Result<()> {
        if self.get(driver.name()).is_some() {
            return Err(Error::InvalidParameter(format!(
                "driver {} already registered",
                driver.name()
            )));
        }
        self.drivers.push(driver);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Driver> {
        self.drivers.iter().find(|d| d.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.drivers.iter().map(|d| d.name.as_str()).collect()
    }

    /// Find the driver for a modem identification string (the `ATI` reply).
    ///
    /// An exact name match wins; otherwise the longest driver name
    /// contained in `identification` is chosen. The generic driver never
    /// matches by substring.
    pub fn find_match(&self, identification: &str) -> Option<&Driver> {
        if let Some(exact) = self.drivers.iter().find(|d| d.name == identification) {
            return Some(exact);
        }
        self.drivers
            .iter()
            .filter(|d| d.name != GENERIC_DRIVER && identification.contains(d.name.as_str()))
            .max_by_key(|d| d.name.len())
    }
}

impl Default for DriverSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_terminator_is_crlf() {
        assert_eq!(Driver::generic().terminator(), "\r\n");
    }

    #[test]
    fn get_substitutes_vars() {
        let drv = Driver::generic();
        assert_eq!(
            drv.get_with(keys::CMD_SMS_READ, &[("SMS_ID", "7")]).as_deref(),
            Some("AT+CMGR=7")
        );
        assert_eq!(
            drv.get_with(keys::CMD_SMS_STORAGE_SET, &[("STORAGE", "SR")])
                .as_deref(),
            Some("AT+CPMS=\"SR\"")
        );
    }

    #[test]
    fn none_placeholder_means_unsupported() {
        let drv = Driver::generic();
        assert!(drv.has(keys::RESPONSE_RSSI));
        assert_eq!(drv.get(keys::RESPONSE_RSSI), None);
        assert_eq!(drv.get("NO_SUCH_KEY"), None);
    }

    #[test]
    fn hex_escape_resolves_commit_char() {
        let drv = Driver::generic();
        assert_eq!(drv.get(keys::PARAM_SMS_COMMIT).as_deref(), Some("\x1a"));
        let commit = drv.get(keys::PARAM_SMS_COMMIT).unwrap();
        assert_eq!(
            drv.get_with(
                keys::CMD_SMS_SEND_COMMIT,
                &[("MESSAGE", "0011AB"), ("COMMIT", commit.as_str())]
            )
            .as_deref(),
            Some("0011AB\x1a")
        );
    }

    #[test]
    fn unknown_placeholder_left_intact() {
        assert_eq!(substitute("AT%FOO%%LF%", &[]), "AT%FOO%\n");
        assert_eq!(substitute("50% %LF%", &[]), "50% \n");
        assert_eq!(substitute("100%", &[]), "100%");
    }

    #[test]
    fn invalid_hex_escape_left_intact() {
        assert_eq!(substitute("$ZZ$41", &[]), "$ZZA");
        assert_eq!(substitute("cost $", &[]), "cost $");
    }

    #[test]
    fn flag_and_number() {
        let drv = Driver::generic();
        assert!(drv.flag(keys::PARAM_SMS_WAIT_PROMPT));
        assert!(!drv.flag(keys::PARAM_USSD_ENCODED));
        assert_eq!(drv.number(keys::PARAM_USSD_ENCODING), Some(15));
    }

    #[test]
    fn derived_driver_inherits_and_overrides() {
        let base = Driver::generic();
        let wavecom = Driver::derive("WAVECOM", &base)
            .with_description("Wavecom modems")
            .with(keys::RESPONSE_UNSOLICITED_IND, "+WIND:");
        assert_eq!(wavecom.parent(), Some(GENERIC_DRIVER));
        assert_eq!(wavecom.get(keys::CMD_ANSWER).as_deref(), Some("ATA"));
        assert_eq!(
            wavecom.get(keys::RESPONSE_UNSOLICITED_IND).as_deref(),
            Some("+WIND:")
        );
        assert_eq!(base.get(keys::RESPONSE_UNSOLICITED_IND), None);
    }

    #[test]
    fn driver_set_rejects_duplicates() {
        let mut set = DriverSet::new();
        assert!(set.add(Driver::generic()).is_err());
        assert!(set.add(Driver::derive("SIMCOM", &Driver::generic())).is_ok());
        assert_eq!(set.names(), vec!["Generic", "SIMCOM"]);
    }

    #[test]
    fn find_match_prefers_exact_then_longest() {
        let mut set = DriverSet::new();
        let base = Driver::generic();
        set.add(Driver::derive("Huawei", &base)).unwrap();
        set.add(Driver::derive("Huawei E1750", &base)).unwrap();
        set.add(Driver::derive("SIM800", &base)).unwrap();

        assert_eq!(set.find_match("SIM800").unwrap().name(), "SIM800");
        assert_eq!(
            set.find_match("Manufacturer: Huawei E1750 Revision 11").unwrap().name(),
            "Huawei E1750"
        );
        assert_eq!(
            set.find_match("Huawei E3131").unwrap().name(),
            "Huawei"
        );
        assert!(set.find_match("Quectel EC25").is_none());
    }
}
