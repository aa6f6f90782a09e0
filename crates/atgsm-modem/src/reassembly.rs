//! Multi-part message reassembly.
//!
//! Received PDUs wait here until they can be dispatched. Status reports and
//! single-part messages go out at once; parts of a multi-part message wait
//! until every declared part is present. An incomplete set never holds back
//! the entries behind it.

use tracing::debug;

use atgsm_core::events::ModemEvent;
use atgsm_core::types::{Envelope, JoinedMessage, ReceivedPdu, SmsMessage};

use crate::hash::{intl_number, message_hash};

/// Inputs to message hashing.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashContext<'a> {
    pub smsc: Option<&'a str>,
    pub country_code: Option<&'a str>,
}

/// Result of one dispatch pass.
#[derive(Debug, Default)]
pub struct Dispatch {
    pub events: Vec<ModemEvent>,
    /// Storage slots to delete, in dispatch order.
    pub delete: Vec<(String, u32)>,
}

/// Pending received PDUs.
#[derive(Debug, Default)]
pub struct Reassembler {
    pending: Vec<Envelope>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue envelopes for dispatch. A PDU already pending from the same
    /// storage slot is not queued twice.
    pub fn push(&mut self, envelopes: impl IntoIterator<Item = Envelope>) {
        for env in envelopes {
            let duplicate = env.slot().is_some()
                && self
                    .pending
                    .iter()
                    .any(|p| p.slot() == env.slot() && p.pdu == env.pdu);
            if duplicate {
                debug!(slot = ?env.slot(), "PDU already pending");
                continue;
            }
            self.pending.push(env);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Dispatch everything that is ready.
    ///
    /// Slots of status reports are always scheduled for deletion; message
    /// slots only with `delete_on_read`.
    pub fn dispatch(&mut self, ctx: &HashContext<'_>, delete_on_read: bool) -> Dispatch {
        let mut out = Dispatch::default();
        let mut i = 0;
        while i < self.pending.len() {
            let Some(positions) = self.ready_at(i) else {
                i += 1;
                continue;
            };

            let mut taken: Vec<Envelope> = Vec::with_capacity(positions.len());
            for pos in positions.iter().rev() {
                taken.push(self.pending.remove(*pos));
            }
            taken.reverse();

            for env in &taken {
                let report = matches!(env.pdu, ReceivedPdu::StatusReport(_));
                if report || delete_on_read {
                    if let Some(slot) = env.slot() {
                        out.delete.push(slot);
                    }
                }
            }
            out.events.push(build_event(taken, ctx));
        }
        out
    }

    /// Positions that make up a dispatchable unit starting at `i`.
    fn ready_at(&self, i: usize) -> Option<Vec<usize>> {
        let ReceivedPdu::Message(first) = &self.pending[i].pdu else {
            return Some(vec![i]);
        };
        let (Some(reference), Some(concat)) = (first.reference(), first.concat) else {
            return Some(vec![i]);
        };
        let total = usize::from(concat.total);

        let mut seen_parts = Vec::with_capacity(total);
        let positions: Vec<usize> = self
            .pending
            .iter()
            .enumerate()
            .skip(i)
            .filter_map(|(pos, env)| match &env.pdu {
                ReceivedPdu::Message(m) if m.reference() == Some(reference) => {
                    let part = m.concat.map(|c| c.index)?;
                    if seen_parts.contains(&part) {
                        None
                    } else {
                        seen_parts.push(part);
                        Some(pos)
                    }
                }
                _ => None,
            })
            .take(total)
            .collect();

        if positions.len() == total {
            Some(positions)
        } else {
            debug!(reference, have = positions.len(), total, "multi-part message incomplete");
            None
        }
    }
}

fn build_event(taken: Vec<Envelope>, ctx: &HashContext<'_>) -> ModemEvent {
    let mut parts: Vec<SmsMessage> = Vec::with_capacity(taken.len());
    for env in taken {
        match env.pdu {
            ReceivedPdu::StatusReport(report) => return ModemEvent::StatusReport(report),
            ReceivedPdu::Message(message) => parts.push(message),
        }
    }

    if parts.len() == 1 && parts[0].reference().is_none() {
        let mut message = parts.remove(0);
        let address = intl_number(&message.address, ctx.country_code, ctx.smsc);
        message.hash = Some(message_hash(
            ctx.smsc,
            message.time,
            &[&address, &message.text],
        ));
        return ModemEvent::Message(message);
    }

    parts.sort_by_key(|m| m.concat.map(|c| c.index).unwrap_or_default());
    let text: String = parts.iter().map(|m| m.text.as_str()).collect();
    let address = parts[0].address.clone();
    let time = parts[0].time;
    let hash = message_hash(
        ctx.smsc,
        time,
        &[&intl_number(&address, ctx.country_code, ctx.smsc), &text],
    );
    for part in &mut parts {
        part.hash = Some(hash.clone());
    }
    ModemEvent::MultipartMessage(JoinedMessage {
        address,
        time,
        text,
        hash,
        parts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use atgsm_core::types::{ConcatInfo, StatusReport};
    use chrono::DateTime;

    const CTX: HashContext<'static> = HashContext {
        smsc: Some("+62816124"),
        country_code: Some("62"),
    };

    fn part(reference: u16, total: u8, index: u8, text: &str) -> Envelope {
        let mut env = Envelope::new(ReceivedPdu::Message(SmsMessage {
            address: "081234567890".into(),
            time: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            text: text.into(),
            concat: (total > 0).then_some(ConcatInfo {
                reference,
                total,
                index,
            }),
            hash: None,
        }));
        env.storage = Some("SM".into());
        env.index = Some(u32::from(index) + u32::from(reference) * 10);
        env
    }

    fn single(text: &str, index: u32) -> Envelope {
        let mut env = part(0, 0, 0, text);
        env.index = Some(index);
        env
    }

    fn joined(dispatch: &Dispatch) -> &JoinedMessage {
        dispatch
            .events
            .iter()
            .find_map(|e| match e {
                ModemEvent::MultipartMessage(m) => Some(m),
                _ => None,
            })
            .expect("no multipart message dispatched")
    }

    // =======================================================================
    // Single messages and reports
    // =======================================================================

    #[test]
    fn single_message_dispatched_with_hash() {
        let mut r = Reassembler::new();
        r.push([single("hello", 1)]);
        let out = r.dispatch(&CTX, false);
        assert!(r.is_empty());
        let [ModemEvent::Message(m)] = out.events.as_slice() else {
            panic!("expected one message, got {:?}", out.events);
        };
        assert_eq!(
            m.hash.as_deref(),
            Some(message_hash(CTX.smsc, m.time, &["+6281234567890", "hello"]).as_str())
        );
        assert!(out.delete.is_empty());
    }

    #[test]
    fn local_sender_hashes_like_international_without_country_code() {
        let ctx = HashContext {
            smsc: Some("+62816124"),
            country_code: None,
        };
        let mut local = Reassembler::new();
        local.push([single("hello", 1)]);
        let mut intl = Reassembler::new();
        let mut env = single("hello", 1);
        if let ReceivedPdu::Message(m) = &mut env.pdu {
            m.address = "+6281234567890".into();
        }
        intl.push([env]);

        let hash = |out: Dispatch| match out.events.as_slice() {
            [ModemEvent::Message(m)] => m.hash.clone(),
            other => panic!("expected one message, got {other:?}"),
        };
        let a = hash(local.dispatch(&ctx, false));
        assert!(a.is_some());
        assert_eq!(a, hash(intl.dispatch(&ctx, false)));
    }

    #[test]
    fn delete_on_read_schedules_message_slots() {
        let mut r = Reassembler::new();
        r.push([single("hello", 4)]);
        let out = r.dispatch(&CTX, true);
        assert_eq!(out.delete, vec![("SM".to_string(), 4)]);
    }

    #[test]
    fn reports_are_always_deleted() {
        let mut env = Envelope::new(ReceivedPdu::StatusReport(StatusReport {
            address: "+6281234567890".into(),
            reference: 7,
            status: 0,
            time: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            discharge_time: None,
        }));
        env.storage = Some("SR".into());
        env.index = Some(2);

        let mut r = Reassembler::new();
        r.push([env]);
        let out = r.dispatch(&CTX, false);
        assert!(matches!(out.events.as_slice(), [ModemEvent::StatusReport(s)] if s.reference == 7));
        assert_eq!(out.delete, vec![("SR".to_string(), 2)]);
    }

    // =======================================================================
    // Multi-part
    // =======================================================================

    #[test]
    fn parts_joined_in_index_order_regardless_of_arrival() {
        let mut forward = Reassembler::new();
        forward.push([part(5, 3, 1, "Hel"), part(5, 3, 2, "lo "), part(5, 3, 3, "world")]);
        let a = forward.dispatch(&CTX, false);

        let mut shuffled = Reassembler::new();
        shuffled.push([part(5, 3, 3, "world")]);
        assert!(shuffled.dispatch(&CTX, false).events.is_empty());
        shuffled.push([part(5, 3, 1, "Hel")]);
        assert!(shuffled.dispatch(&CTX, false).events.is_empty());
        shuffled.push([part(5, 3, 2, "lo ")]);
        let b = shuffled.dispatch(&CTX, false);

        let (a, b) = (joined(&a), joined(&b));
        assert_eq!(a.text, "Hello world");
        assert_eq!(b.text, "Hello world");
        assert_eq!(a.hash, b.hash);
        assert_eq!(b.parts.len(), 3);
        assert!(b.parts.iter().all(|p| p.hash.as_deref() == Some(b.hash.as_str())));
        assert_eq!(b.parts[0].concat.map(|c| c.index), Some(1));
        assert!(shuffled.is_empty());
    }

    #[test]
    fn incomplete_set_does_not_block_others() {
        let mut r = Reassembler::new();
        r.push([part(9, 2, 1, "first half"), single("standalone", 1)]);
        let out = r.dispatch(&CTX, false);
        assert!(matches!(out.events.as_slice(), [ModemEvent::Message(m)] if m.text == "standalone"));
        assert_eq!(r.len(), 1);

        r.push([part(9, 2, 2, " second half")]);
        let out = r.dispatch(&CTX, false);
        assert_eq!(joined(&out).text, "first half second half");
        assert!(r.is_empty());
    }

    #[test]
    fn interleaved_sets_dispatch_independently() {
        let mut r = Reassembler::new();
        r.push([
            part(1, 2, 1, "a1"),
            part(2, 2, 1, "b1"),
            part(2, 2, 2, "b2"),
            part(1, 2, 2, "a2"),
        ]);
        let out = r.dispatch(&CTX, true);
        assert_eq!(out.events.len(), 2);
        assert_eq!(out.delete.len(), 4);
        assert!(r.is_empty());
    }

    #[test]
    fn duplicate_slot_not_queued_twice() {
        let mut r = Reassembler::new();
        r.push([part(3, 2, 1, "x")]);
        r.push([part(3, 2, 1, "x")]);
        assert_eq!(r.len(), 1);
    }
}
