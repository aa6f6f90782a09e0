//! The GSM response signature table.
//!
//! Each entry names the driver key holding the response prefix, the
//! minimum parameter count, and how the match continues. Registration
//! order is significant: signatures matching the same line position keep
//! this order.

use atgsm_core::driver::{Driver, keys};
use atgsm_io::matcher::Markers;
use atgsm_io::processor::{Processor, Signature};
use tracing::debug;

/// What a matched line means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureKind {
    CmeError,
    CmsError,
    Smsc,
    Cops,
    Cscs,
    Clck,
    Csq,
    Rssi,
    Ring,
    Clip,
    CallEnd,
    /// Message delivered directly, PDU in the following lines.
    Cmt,
    /// Message stored at (storage, index).
    Cmti,
    /// Status report delivered directly.
    Cds,
    /// Status report stored at (storage, index).
    Cdsi,
    Cpms,
    Cmgf,
    Cmgl,
    Cmgr,
    Cmgs,
    Cusd,
    UnsolicitedIndication,
    MemoryFull,
}

struct Descriptor {
    kind: SignatureKind,
    key: &'static str,
    min_tokens: usize,
    separator: Option<&'static str>,
    body: bool,
}

const fn sig(kind: SignatureKind, key: &'static str, min_tokens: usize) -> Descriptor {
    Descriptor {
        kind,
        key,
        min_tokens,
        separator: None,
        body: false,
    }
}

const fn pdu(kind: SignatureKind, key: &'static str, min_tokens: usize) -> Descriptor {
    Descriptor {
        kind,
        key,
        min_tokens,
        separator: None,
        body: true,
    }
}

const SIGNATURES: &[Descriptor] = &[
    sig(SignatureKind::CmeError, keys::RESPONSE_CME_ERROR, 1),
    sig(SignatureKind::CmsError, keys::RESPONSE_CMS_ERROR, 1),
    sig(SignatureKind::Smsc, keys::RESPONSE_SMSC, 2),
    sig(SignatureKind::Cops, keys::RESPONSE_COPS, 1),
    sig(SignatureKind::Cscs, keys::RESPONSE_CSCS, 1),
    sig(SignatureKind::Clck, keys::RESPONSE_CLCK, 1),
    sig(SignatureKind::Csq, keys::RESPONSE_CSQ, 2),
    sig(SignatureKind::Rssi, keys::RESPONSE_RSSI, 1),
    sig(SignatureKind::Ring, keys::RESPONSE_RING, 0),
    sig(SignatureKind::Clip, keys::RESPONSE_CLIP, 1),
    sig(SignatureKind::CallEnd, keys::RESPONSE_CALL_END, 1),
    pdu(SignatureKind::Cmt, keys::RESPONSE_NEW_MESSAGE_DIRECT, 2),
    sig(SignatureKind::Cmti, keys::RESPONSE_NEW_MESSAGE, 2),
    pdu(SignatureKind::Cds, keys::RESPONSE_DELIVERY_REPORT_DIRECT, 1),
    sig(SignatureKind::Cdsi, keys::RESPONSE_DELIVERY_REPORT, 2),
    sig(SignatureKind::Cpms, keys::RESPONSE_CPMS, 3),
    sig(SignatureKind::Cmgf, keys::RESPONSE_CMGF, 1),
    pdu(SignatureKind::Cmgl, keys::RESPONSE_CMGL, 4),
    pdu(SignatureKind::Cmgr, keys::RESPONSE_CMGR, 3),
    sig(SignatureKind::Cmgs, keys::RESPONSE_CMGS, 1),
    Descriptor {
        kind: SignatureKind::Cusd,
        key: keys::RESPONSE_CUSD,
        min_tokens: 1,
        separator: Some("\n"),
        body: false,
    },
    sig(SignatureKind::UnsolicitedIndication, keys::RESPONSE_UNSOLICITED_IND, 1),
    sig(SignatureKind::MemoryFull, keys::RESPONSE_MEM_FULL, 1),
];

/// Build the processor for `driver`. Signatures whose prefix the driver
/// leaves empty are not registered.
pub fn build_processor(driver: &Driver) -> Processor<SignatureKind> {
    let markers = Markers::from_driver(driver);
    let mut boundaries = vec![markers.success.clone()];
    boundaries.extend(markers.errors.iter().map(|m| m.pattern.clone()));

    let mut processor = Processor::new().with_boundaries(boundaries);
    for d in SIGNATURES {
        let Some(prefix) = driver.get(d.key) else {
            debug!(key = d.key, "signature not supported by driver");
            continue;
        };
        let mut signature = Signature::new(d.kind, prefix, d.min_tokens);
        if let Some(sep) = d.separator {
            signature = signature.with_separator(sep);
        }
        if d.body {
            signature = signature.with_body();
        }
        processor.register(signature);
    }
    processor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_driver_skips_empty_prefixes() {
        let processor = build_processor(&Driver::generic());
        let kinds: Vec<_> = processor.signatures().iter().map(|s| s.kind).collect();
        assert!(!kinds.contains(&SignatureKind::Rssi));
        assert!(!kinds.contains(&SignatureKind::CallEnd));
        assert!(!kinds.contains(&SignatureKind::MemoryFull));
        assert!(!kinds.contains(&SignatureKind::UnsolicitedIndication));
        assert_eq!(processor.len(), SIGNATURES.len() - 4);
    }

    #[test]
    fn registration_order_is_kept() {
        let processor = build_processor(&Driver::generic());
        let kinds: Vec<_> = processor.signatures().iter().map(|s| s.kind).collect();
        assert_eq!(kinds[0], SignatureKind::CmeError);
        assert_eq!(kinds[1], SignatureKind::CmsError);
        assert_eq!(kinds.last(), Some(&SignatureKind::Cusd));
    }

    #[test]
    fn vendor_prefixes_are_registered() {
        let driver = Driver::derive("Huawei", &Driver::generic())
            .with(keys::RESPONSE_RSSI, "^RSSI:")
            .with(keys::RESPONSE_CALL_END, "^CEND:");
        let processor = build_processor(&driver);
        let rssi = processor
            .signatures()
            .iter()
            .find(|s| s.kind == SignatureKind::Rssi)
            .unwrap();
        assert_eq!(rssi.prefix, "^RSSI:");
    }

    #[test]
    fn pdu_signatures_carry_body() {
        let processor = build_processor(&Driver::generic());
        for s in processor.signatures() {
            let expected = matches!(
                s.kind,
                SignatureKind::Cmt | SignatureKind::Cds | SignatureKind::Cmgl | SignatureKind::Cmgr
            );
            assert_eq!(s.body, expected, "{:?}", s.kind);
        }
    }
}
