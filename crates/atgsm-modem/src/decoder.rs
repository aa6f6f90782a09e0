//! Decoding of matched response lines into state updates.

use tracing::debug;

use atgsm_core::codec::SmsCodec;
use atgsm_core::driver::{Driver, keys};
use atgsm_core::events::Property;
use atgsm_core::types::{
    Envelope, Network, NetworkEntry, SmsMode, StorageInfo, StorageReport, UssdResponse,
};
use atgsm_io::processor::{Decoder, Match};
use atgsm_io::tokens::Token;

use crate::signatures::SignatureKind;

/// Storage and index a query already knows, for replies that do not
/// repeat them (`+CMGR`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryContext {
    pub storage: Option<String>,
    pub index: Option<u32>,
}

impl QueryContext {
    pub fn slot(storage: &str, index: u32) -> Self {
        QueryContext {
            storage: Some(storage.to_string()),
            index: Some(index),
        }
    }
}

/// A change produced by one match.
#[derive(Debug, Clone, PartialEq)]
pub enum StateUpdate {
    Property(Property),
    /// Received PDUs, to be queued for dispatch.
    Messages(Vec<Envelope>),
    /// A message was stored and should be read.
    ReadMessage { storage: String, index: u32 },
    Ringing(bool),
    Caller(String),
    Ussd(UssdResponse),
}

/// [`Decoder`] for the GSM signature table.
pub struct GsmDecoder<'a> {
    pub codec: &'a dyn SmsCodec,
    pub driver: &'a Driver,
    /// Currently selected storage.
    pub storage: Option<&'a str>,
    pub context: &'a QueryContext,
}

impl Decoder<SignatureKind> for GsmDecoder<'_> {
    type Update = StateUpdate;

    fn decode(&self, m: &Match<SignatureKind>) -> Vec<StateUpdate> {
        let update = match m.kind {
            SignatureKind::CmeError => first(m).map(|c| property(Property::CmeError(c))),
            SignatureKind::CmsError => first(m).map(|c| property(Property::CmsError(c))),
            SignatureKind::Smsc => first(m).map(|s| property(Property::Smsc(s))),
            SignatureKind::Cops => self.cops(m),
            SignatureKind::Cscs => match m.tokens.first() {
                Some(Token::List(items)) => Some(property(Property::Charsets(values(items)))),
                Some(Token::Value(v)) => Some(property(Property::Charset(v.clone()))),
                None => None,
            },
            SignatureKind::Clck => match m.tokens.first() {
                Some(t) if t.is_numeric() => Some(property(Property::KeyLock(t.as_u32() == Some(1)))),
                Some(t) => Some(property(Property::Locks(t.values()))),
                None => None,
            },
            SignatureKind::Csq => {
                // Some modems prefix the value with a mode word.
                let mut tokens = m.tokens.iter();
                let mut rssi = tokens.next();
                if rssi.is_some_and(|t| !t.is_numeric()) {
                    rssi = tokens.next();
                }
                rssi.and_then(Token::as_u32).map(signal)
            }
            SignatureKind::Rssi => m.tokens.first().and_then(Token::as_u32).map(signal),
            SignatureKind::Ring => Some(StateUpdate::Ringing(true)),
            SignatureKind::Clip => first(m).map(StateUpdate::Caller),
            SignatureKind::CallEnd => Some(StateUpdate::Ringing(false)),
            SignatureKind::Cmt | SignatureKind::Cds => self
                .pdu(m)
                .map(|env| StateUpdate::Messages(vec![env])),
            SignatureKind::Cmgl => self.pdu(m).map(|mut env| {
                env.storage = self.storage.map(str::to_string);
                env.index = m.tokens.first().and_then(Token::as_u32);
                env.status = m.token(1).map(str::to_string);
                StateUpdate::Messages(vec![env])
            }),
            SignatureKind::Cmgr => self.pdu(m).map(|mut env| {
                env.storage = self
                    .context
                    .storage
                    .clone()
                    .or_else(|| self.storage.map(str::to_string));
                env.index = self.context.index;
                env.status = m.token(0).map(str::to_string);
                StateUpdate::Messages(vec![env])
            }),
            SignatureKind::Cmti | SignatureKind::Cdsi => {
                match (m.token(0), m.tokens.get(1).and_then(Token::as_u32)) {
                    (Some(storage), Some(index)) => Some(StateUpdate::ReadMessage {
                        storage: storage.to_string(),
                        index,
                    }),
                    _ => None,
                }
            }
            SignatureKind::Cpms => storage_report(&m.tokens).map(|r| property(Property::Storage(r))),
            SignatureKind::Cmgf => m
                .token(0)
                .and_then(SmsMode::from_code)
                .map(|mode| property(Property::SmsMode(mode))),
            SignatureKind::Cmgs => m
                .tokens
                .first()
                .and_then(Token::as_u32)
                .and_then(|r| u8::try_from(r).ok())
                .map(|r| property(Property::MessageReference(r))),
            SignatureKind::Cusd => self.cusd(m).map(StateUpdate::Ussd),
            SignatureKind::UnsolicitedIndication => {
                Some(property(Property::Indicator(m.value.trim().to_string())))
            }
            SignatureKind::MemoryFull => first(m).map(|s| property(Property::MemoryFull(s))),
        };
        update.into_iter().collect()
    }
}

impl GsmDecoder<'_> {
    fn cops(&self, m: &Match<SignatureKind>) -> Option<StateUpdate> {
        match m.tokens.first()? {
            Token::List(_) => {
                let networks = m
                    .tokens
                    .iter()
                    .filter_map(Token::as_list)
                    .filter(|entry| entry.len() >= 4)
                    .map(|entry| {
                        let field = |i: usize| {
                            entry
                                .get(i)
                                .and_then(Token::as_str)
                                .filter(|v| !v.is_empty())
                                .map(str::to_string)
                        };
                        NetworkEntry {
                            status: field(0),
                            long_name: field(1),
                            short_name: field(2),
                            numeric: field(3),
                            act: field(4),
                        }
                    })
                    .collect();
                Some(property(Property::Networks(networks)))
            }
            Token::Value(_) => {
                let field = |i: usize| m.token(i).filter(|v| !v.is_empty()).map(str::to_string);
                Some(property(Property::Network(Network {
                    mode: field(0),
                    format: field(1),
                    operator: field(2),
                    act: field(3),
                })))
            }
        }
    }

    /// Decode the PDU body. The header's last parameter is the TPDU length,
    /// which must agree with the decoded PDU.
    fn pdu(&self, m: &Match<SignatureKind>) -> Option<Envelope> {
        let body = m.body_text();
        let body = body.trim();
        if body.is_empty() {
            debug!(kind = ?m.kind, "PDU body missing");
            return None;
        }
        let declared = m.tokens.last().and_then(Token::as_u32);
        match self.codec.decode(body) {
            Ok(decoded) if declared == Some(decoded.tp_length as u32) => {
                Some(Envelope::new(decoded.pdu))
            }
            Ok(decoded) => {
                debug!(
                    kind = ?m.kind,
                    declared = ?declared,
                    decoded = decoded.tp_length,
                    "PDU length mismatch, ignoring"
                );
                None
            }
            Err(e) => {
                debug!(kind = ?m.kind, error = %e, "PDU decode failed");
                None
            }
        }
    }

    fn cusd(&self, m: &Match<SignatureKind>) -> Option<UssdResponse> {
        if m.tokens.len() >= 3 {
            let code = m.token(0)?.to_string();
            let raw = m.token(1).unwrap_or_default();
            let dcs = m.tokens.get(2).and_then(Token::as_u32);
            let dcs_u8 = dcs.and_then(|d| u8::try_from(d).ok());
            let default_dcs = self.driver.number(keys::PARAM_USSD_ENCODING);
            let encoded = dcs != default_dcs
                || self.driver.flag(keys::PARAM_USSD_ENCODED)
                || self.driver.flag(keys::PARAM_USSD_RESPONSE_ENCODED);
            let message = match (encoded, dcs_u8) {
                (true, Some(d)) => match self.codec.decode_ussd(d, raw) {
                    Ok(text) => text,
                    Err(e) => {
                        debug!(error = %e, "USSD payload decode failed, keeping raw text");
                        raw.to_string()
                    }
                },
                _ => raw.to_string(),
            };
            return Some(UssdResponse {
                code,
                message: Some(message),
                dcs: dcs_u8,
            });
        }
        let first = m.tokens.first()?;
        first.is_numeric().then(|| UssdResponse {
            code: first.as_str().unwrap_or_default().trim().to_string(),
            message: None,
            dcs: None,
        })
    }
}

fn property(p: Property) -> StateUpdate {
    StateUpdate::Property(p)
}

fn signal(rssi: u32) -> StateUpdate {
    property(Property::Signal(u8::try_from(rssi).unwrap_or(99)))
}

fn first(m: &Match<SignatureKind>) -> Option<String> {
    m.token(0).map(|v| v.trim().to_string())
}

fn values(items: &[Token]) -> Vec<String> {
    items.iter().flat_map(Token::values).collect()
}

/// Parse `+CPMS:` storage triplets. Replies to `AT+CPMS?` name each
/// storage; replies to `AT+CPMS="XX"` carry bare counts and yield nothing.
fn storage_report(tokens: &[Token]) -> Option<StorageReport> {
    let mut storages: Vec<StorageInfo> = Vec::new();
    let mut chunks = tokens.chunks_exact(3);
    for chunk in chunks.by_ref() {
        let Some(name) = chunk[0].as_str().filter(|_| !chunk[0].is_numeric()) else {
            break;
        };
        let (Some(used), Some(total)) = (chunk[1].as_u32(), chunk[2].as_u32()) else {
            break;
        };
        if storages.iter().any(|s| s.storage == name) {
            continue;
        }
        storages.push(StorageInfo {
            storage: name.to_string(),
            used,
            total,
        });
    }
    let primary = storages.first()?.clone();
    Some(StorageReport { primary, storages })
}
