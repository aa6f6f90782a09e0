//! Message identity: content hashes and international number form.

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Deterministic hash over the SMSC, a timestamp, and `parts`.
///
/// Equal inputs always give the same hex digest, so a message re-read from
/// storage hashes like the first delivery. The digest is SHA-256; gateways
/// that keyed messages by SHA-1 digests of the same fields will not find
/// matches among these.
pub fn message_hash(smsc: Option<&str>, time: DateTime<Utc>, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(smsc.unwrap_or_default().as_bytes());
    hasher.update(time.to_rfc3339_opts(SecondsFormat::Millis, true).as_bytes());
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Country calling codes two digits long. `1` and `7` are the only
/// one-digit codes; every other code is three digits.
const TWO_DIGIT_CODES: &[&str] = &[
    "20", "27", "30", "31", "32", "33", "34", "36", "39", "40", "41", "43", "44", "45", "46",
    "47", "48", "49", "51", "52", "53", "54", "55", "56", "57", "58", "60", "61", "62", "63",
    "64", "65", "66", "81", "82", "84", "86", "90", "91", "92", "93", "94", "95", "98",
];

/// Country calling code of an international number, e.g. `"62"` for
/// `+62816124`. `None` unless `number` is `+` followed by digits.
pub fn calling_code(number: &str) -> Option<&str> {
    let digits = number.trim().strip_prefix('+')?;
    if digits.len() < 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let len = match digits.as_bytes()[0] {
        b'0' => return None,
        b'1' | b'7' => 1,
        _ if TWO_DIGIT_CODES.contains(&&digits[..2]) => 2,
        _ => 3,
    };
    Some(&digits[..len])
}

/// Normalize `number` to international form.
///
/// A leading `0` is replaced by `country_code`, or when none is configured
/// by the calling code of `smsc`; with neither the number is returned
/// unchanged. Numeric addresses longer than five digits get a leading `+`,
/// so short codes and alphanumeric senders are left alone.
pub fn intl_number(number: &str, country_code: Option<&str>, smsc: Option<&str>) -> String {
    let mut number = number.trim().to_string();
    if let Some(rest) = number.strip_prefix('0') {
        let code = country_code
            .map(|cc| cc.trim_start_matches('+'))
            .or_else(|| smsc.and_then(calling_code));
        match code {
            Some(cc) => number = format!("{cc}{rest}"),
            None => {
                debug!(number = %number, "no country code, keeping local number");
                return number;
            }
        }
    }
    if number.len() > 5 && number.bytes().all(|b| b.is_ascii_digit()) {
        number.insert(0, '+');
    }
    number
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn hash_is_deterministic() {
        let a = message_hash(Some("+62816124"), at(1_700_000_000), &["+628123", "hi"]);
        let b = message_hash(Some("+62816124"), at(1_700_000_000), &["+628123", "hi"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn hash_covers_every_input() {
        let base = message_hash(Some("+62816124"), at(1_700_000_000), &["+628123", "hi"]);
        assert_ne!(base, message_hash(None, at(1_700_000_000), &["+628123", "hi"]));
        assert_ne!(base, message_hash(Some("+62816124"), at(1_700_000_001), &["+628123", "hi"]));
        assert_ne!(base, message_hash(Some("+62816124"), at(1_700_000_000), &["+628123", "ho"]));
    }

    #[test]
    fn local_numbers_get_country_code() {
        assert_eq!(intl_number("081234567890", Some("62"), None), "+6281234567890");
        assert_eq!(intl_number("081234567890", Some("+62"), None), "+6281234567890");
        assert_eq!(intl_number("081234567890", None, None), "081234567890");
    }

    #[test]
    fn local_numbers_take_code_from_smsc() {
        let smsc = Some("+62816124");
        assert_eq!(intl_number("081234567890", None, smsc), "+6281234567890");
        assert_eq!(
            intl_number("081234567890", None, smsc),
            intl_number("+6281234567890", None, smsc)
        );
        // A configured code wins over the SMSC.
        assert_eq!(intl_number("0201234567", Some("44"), smsc), "+44201234567");
    }

    #[test]
    fn calling_code_lengths() {
        assert_eq!(calling_code("+62816124"), Some("62"));
        assert_eq!(calling_code("+14155550100"), Some("1"));
        assert_eq!(calling_code("+79161234567"), Some("7"));
        assert_eq!(calling_code("+358401234567"), Some("358"));
        assert_eq!(calling_code("+447700900123"), Some("44"));
        assert_eq!(calling_code("62816124"), None);
        assert_eq!(calling_code("+62"), None);
        assert_eq!(calling_code("+TELKOM"), None);
    }

    #[test]
    fn short_and_alphanumeric_addresses_untouched() {
        assert_eq!(intl_number("6281234567890", None, None), "+6281234567890");
        assert_eq!(intl_number("+6281234567890", None, None), "+6281234567890");
        assert_eq!(intl_number("3636", None, None), "3636");
        assert_eq!(intl_number("TELKOMSEL", None, None), "TELKOMSEL");
    }
}
