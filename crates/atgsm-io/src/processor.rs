//! Notification processor: signature matching over groups of lines.
//!
//! A [`Processor`] holds a static table of [`Signature`]s, each a response
//! prefix plus the minimum number of parameters the line must carry. Every
//! signature is tried at every line position, so a notification in the
//! middle of a reply is still found. Matches are handed to a [`Decoder`],
//! which turns them into typed updates; lines no signature claims come
//! back as `unprocessed`.
//!
//! Modems write in arbitrary chunks, so a line with too few parameters is
//! extended with the following lines until it tokenizes with enough of
//! them. Whatever still slips through goes to [`Recovery`], which keeps a
//! bounded backlog and retries joins across processing cycles.

use std::fmt::Debug;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::matcher::{Markers, starts_with_ignore_case};
use crate::tokens::{Token, tokenize};

/// A registered response signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature<K> {
    pub kind: K,
    /// Response prefix, matched case-insensitively.
    pub prefix: String,
    /// Minimum parameter count after the prefix. Zero matches the bare
    /// prefix.
    pub min_tokens: usize,
    /// Inserted between joined lines when extending a match.
    pub separator: Option<String>,
    /// The lines following the header carry a body (a PDU).
    pub body: bool,
}

impl<K> Signature<K> {
    pub fn new(kind: K, prefix: impl Into<String>, min_tokens: usize) -> Self {
        Signature {
            kind,
            prefix: prefix.into(),
            min_tokens,
            separator: None,
            body: false,
        }
    }

    pub fn with_separator(mut self, separator: &str) -> Self {
        self.separator = Some(separator.to_string());
        self
    }

    pub fn with_body(mut self) -> Self {
        self.body = true;
        self
    }
}

/// One signature matched at one line position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match<K> {
    pub kind: K,
    /// Position of the header line.
    pub index: usize,
    /// One past the last line joined into the header.
    pub end: usize,
    /// Header text after the prefix, with any joined lines.
    pub value: String,
    pub tokens: Vec<Token>,
    /// Body lines following the header, for body signatures.
    pub body: Vec<String>,
}

impl<K> Match<K> {
    /// Plain token at `index`.
    pub fn token(&self, index: usize) -> Option<&str> {
        self.tokens.get(index).and_then(Token::as_str)
    }

    /// The body lines joined.
    pub fn body_text(&self) -> String {
        self.body.concat()
    }

    fn body_end(&self) -> usize {
        self.end + self.body.len()
    }
}

/// Turns matches into typed updates.
pub trait Decoder<K> {
    type Update;

    fn decode(&self, matched: &Match<K>) -> Vec<Self::Update>;
}

/// Outcome of one processing pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorResult<U> {
    pub updates: Vec<U>,
    /// Lines no signature claimed, in order.
    pub unprocessed: Vec<String>,
    /// Number of matches handed to the decoder.
    pub matched: usize,
}

impl<U> ProcessorResult<U> {
    pub fn is_empty(&self) -> bool {
        self.matched == 0
    }
}

/// Signature table and matcher.
#[derive(Debug, Clone)]
pub struct Processor<K> {
    signatures: Vec<Signature<K>>,
    boundaries: Vec<String>,
}

impl<K: Copy + Debug> Processor<K> {
    pub fn new() -> Self {
        Processor {
            signatures: Vec::new(),
            boundaries: Vec::new(),
        }
    }

    /// Lines starting with one of `patterns` end a body, in addition to
    /// lines starting with a signature prefix.
    pub fn with_boundaries(mut self, patterns: Vec<String>) -> Self {
        self.boundaries = patterns;
        self
    }

    /// Register a signature. A signature with an empty prefix is not
    /// supported by the modem and is skipped; returns whether it was added.
    pub fn register(&mut self, signature: Signature<K>) -> bool {
        if signature.prefix.trim().is_empty() {
            return false;
        }
        self.signatures.push(signature);
        true
    }

    pub fn signatures(&self) -> &[Signature<K>] {
        &self.signatures
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    fn is_body_boundary(&self, line: &str) -> bool {
        self.signatures
            .iter()
            .any(|s| starts_with_ignore_case(line, &s.prefix))
            || self
                .boundaries
                .iter()
                .any(|b| starts_with_ignore_case(line, b))
    }

    /// Try `signature` at `index`.
    pub fn match_at(
        &self,
        signature: &Signature<K>,
        lines: &[String],
        index: usize,
    ) -> Option<Match<K>> {
        let line = lines.get(index)?;
        if !starts_with_ignore_case(line, &signature.prefix) {
            return None;
        }

        let (value, tokens, end) = if signature.min_tokens == 0 {
            (String::new(), Vec::new(), index + 1)
        } else {
            let mut value = line[signature.prefix.len()..].trim_start().to_string();
            if value.is_empty() {
                return None;
            }
            let mut next = index;
            loop {
                if next > index {
                    if let Some(sep) = &signature.separator {
                        value.push_str(sep);
                    }
                    value.push_str(&lines[next]);
                }
                if let Ok(tokens) = tokenize(&value) {
                    if tokens.len() >= signature.min_tokens {
                        break (value, tokens, next + 1);
                    }
                }
                next += 1;
                if next >= lines.len() {
                    return None;
                }
            }
        };

        let body = if signature.body {
            lines[end..]
                .iter()
                .take_while(|l| !self.is_body_boundary(l))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        Some(Match {
            kind: signature.kind,
            index,
            end,
            value,
            tokens,
            body,
        })
    }

    /// Every signature at every position, ordered by position. Signatures
    /// matching the same position keep registration order.
    pub fn match_all(&self, lines: &[String]) -> Vec<Match<K>> {
        let mut matches = Vec::new();
        for signature in &self.signatures {
            for index in 0..lines.len() {
                if let Some(m) = self.match_at(signature, lines, index) {
                    matches.push(m);
                }
            }
        }
        matches.sort_by_key(|m| m.index);
        matches
    }

    /// Run one processing pass over `lines`.
    ///
    /// A match whose lines were already claimed by an earlier match is
    /// skipped.
    pub fn process<D: Decoder<K>>(
        &self,
        lines: Vec<String>,
        decoder: &D,
    ) -> ProcessorResult<D::Update> {
        let mut claimed = vec![false; lines.len()];
        let mut updates = Vec::new();
        let mut matched = 0;

        for m in self.match_all(&lines) {
            let span = m.index..m.body_end();
            if claimed[span.clone()].iter().any(|c| *c) {
                debug!(kind = ?m.kind, index = m.index, "skipping overlapping match");
                continue;
            }
            claimed[span].iter_mut().for_each(|c| *c = true);
            updates.extend(decoder.decode(&m));
            matched += 1;
        }

        let unprocessed = lines
            .into_iter()
            .zip(claimed)
            .filter(|(_, c)| !c)
            .map(|(l, _)| l)
            .collect();

        ProcessorResult {
            updates,
            unprocessed,
            matched,
        }
    }
}

impl<K: Copy + Debug> Default for Processor<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Default cap on backlog lines kept for recovery.
pub const MAX_BACKLOG_LINES: usize = 32;

/// Default age after which an unresolved backlog line is dropped.
pub const MAX_BACKLOG_AGE: Duration = Duration::from_secs(300);

/// Best-effort recovery of notifications split beyond what a single pass
/// can join.
///
/// Unprocessed lines are kept across cycles. Each cycle tries every window
/// `i..=j` of the backlog, joined, against the signature table; the first
/// window that matches is collapsed into one line and the backlog is
/// processed again. Bare `OK`/`ERROR` sentinels are discarded. Lines beyond
/// the size cap or older than the age cap are dropped with a warning.
#[derive(Debug)]
pub struct Recovery {
    backlog: Vec<(String, Instant)>,
    max_lines: usize,
    max_age: Duration,
}

impl Recovery {
    pub fn new() -> Self {
        Self::with_limits(MAX_BACKLOG_LINES, MAX_BACKLOG_AGE)
    }

    pub fn with_limits(max_lines: usize, max_age: Duration) -> Self {
        Recovery {
            backlog: Vec::new(),
            max_lines: max_lines.max(1),
            max_age,
        }
    }

    /// Lines currently held, oldest first.
    pub fn backlog(&self) -> Vec<String> {
        self.backlog.iter().map(|(l, _)| l.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.backlog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backlog.is_empty()
    }

    pub fn clear(&mut self) {
        self.backlog.clear();
    }

    /// Add `unprocessed` to the backlog and try to resolve it.
    ///
    /// Returns the result of the reprocessing pass when a window matched.
    /// Never fails; unresolved lines stay in the backlog.
    pub fn resolve<K, D>(
        &mut self,
        processor: &Processor<K>,
        decoder: &D,
        markers: &Markers,
        unprocessed: Vec<String>,
    ) -> Option<ProcessorResult<D::Update>>
    where
        K: Copy + Debug,
        D: Decoder<K>,
    {
        let now = Instant::now();

        let before = self.backlog.len();
        let max_age = self.max_age;
        self.backlog
            .retain(|(_, at)| now.saturating_duration_since(*at) <= max_age);
        if self.backlog.len() < before {
            warn!(
                dropped = before - self.backlog.len(),
                "dropping stale unprocessed lines"
            );
        }

        self.backlog.extend(
            unprocessed
                .into_iter()
                .filter(|l| !markers.is_sentinel(l))
                .map(|l| (l, now)),
        );

        if self.backlog.len() > self.max_lines {
            let excess = self.backlog.len() - self.max_lines;
            for (line, _) in self.backlog.drain(..excess) {
                warn!(line = %line, "unprocessed backlog full, dropping line");
            }
        }

        let Some((i, j)) = self.find_window(processor) else {
            for (line, _) in &self.backlog {
                debug!(line = %line, "unprocessed");
            }
            return None;
        };

        let old = std::mem::take(&mut self.backlog);
        let mut lines: Vec<String> = old.iter().map(|(l, _)| l.clone()).collect();
        let joined = lines[i..=j].concat();
        lines.splice(i..=j, std::iter::once(joined));

        let result = processor.process(lines, decoder);
        debug!(
            matched = result.matched,
            remaining = result.unprocessed.len(),
            "unprocessed lines resolved"
        );

        self.backlog = result
            .unprocessed
            .iter()
            .map(|line| {
                let at = old
                    .iter()
                    .find(|(l, _)| l == line)
                    .map(|(_, at)| *at)
                    .unwrap_or(now);
                (line.clone(), at)
            })
            .collect();

        Some(result)
    }

    fn find_window<K: Copy + Debug>(&self, processor: &Processor<K>) -> Option<(usize, usize)> {
        let n = self.backlog.len();
        for i in 0..n {
            let mut joined = self.backlog[i].0.clone();
            for j in i + 1..n {
                joined.push_str(&self.backlog[j].0);
                if !processor.match_all(std::slice::from_ref(&joined)).is_empty() {
                    return Some((i, j));
                }
            }
        }
        None
    }
}

impl Default for Recovery {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Kind {
        Csq,
        Ring,
        Cpms,
        Cmgl,
        Cusd,
    }

    fn processor() -> Processor<Kind> {
        let mut p = Processor::new().with_boundaries(vec!["OK".into(), "ERROR".into()]);
        p.register(Signature::new(Kind::Csq, "+CSQ:", 2));
        p.register(Signature::new(Kind::Ring, "RING", 0));
        p.register(Signature::new(Kind::Cpms, "+CPMS:", 3));
        p.register(Signature::new(Kind::Cmgl, "+CMGL:", 4).with_body());
        p.register(Signature::new(Kind::Cusd, "+CUSD:", 1).with_separator("\n"));
        p
    }

    /// Records (kind, tokens, body) for each match.
    struct Echo;

    impl Decoder<Kind> for Echo {
        type Update = (Kind, Vec<String>, String);

        fn decode(&self, m: &Match<Kind>) -> Vec<Self::Update> {
            vec![(m.kind, crate::tokens::strings(&m.tokens), m.body_text())]
        }
    }

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_prefix_is_not_registered() {
        let mut p: Processor<Kind> = Processor::new();
        assert!(!p.register(Signature::new(Kind::Csq, "", 1)));
        assert!(p.is_empty());
    }

    #[test]
    fn matches_anywhere_in_order_of_position() {
        let p = processor();
        let result = p.process(lines(&["+CSQ: 20,99", "junk", "RING"]), &Echo);
        assert_eq!(result.matched, 2);
        assert_eq!(result.updates[0].0, Kind::Csq);
        assert_eq!(result.updates[1].0, Kind::Ring);
        assert_eq!(result.unprocessed, vec!["junk"]);
    }

    #[test]
    fn earlier_position_wins_over_registration_order() {
        let p = processor();
        // RING is registered after CSQ but appears first.
        let result = p.process(lines(&["RING", "+CSQ: 5,99"]), &Echo);
        assert_eq!(result.updates[0].0, Kind::Ring);
        assert_eq!(result.updates[1].0, Kind::Csq);
    }

    #[test]
    fn short_line_is_extended() {
        let p = processor();
        let result = p.process(lines(&["+CSQ: 20", ",99"]), &Echo);
        assert_eq!(result.matched, 1);
        assert_eq!(result.updates[0].1, vec!["20", "99"]);
        assert!(result.unprocessed.is_empty());
    }

    #[test]
    fn separator_joins_multiline_ussd() {
        let p = processor();
        let result = p.process(lines(&["+CUSD: 0,\"Balance", "Rp 1000\",15"]), &Echo);
        assert_eq!(result.updates[0].1, vec!["0", "Balance\nRp 1000", "15"]);
    }

    #[test]
    fn too_few_tokens_is_unprocessed() {
        let p = processor();
        let result = p.process(lines(&["+CPMS: \"SM\",6"]), &Echo);
        assert_eq!(result.matched, 0);
        assert_eq!(result.unprocessed, vec!["+CPMS: \"SM\",6"]);
    }

    #[test]
    fn body_runs_to_next_signature_line() {
        let p = processor();
        let result = p.process(
            lines(&["+CMGL: 1,0,,20", "AABB", "CC", "+CMGL: 2,0,,10", "DDEE", "OK"]),
            &Echo,
        );
        assert_eq!(result.matched, 2);
        assert_eq!(result.updates[0].2, "AABBCC");
        assert_eq!(result.updates[1].2, "DDEE");
        assert_eq!(result.unprocessed, vec!["OK"]);
    }

    #[test]
    fn recovery_joins_split_notification() {
        let p = processor();
        let markers = Markers::default();
        let mut recovery = Recovery::new();

        let first = p.process(lines(&["+CP"]), &Echo);
        assert!(recovery.resolve(&p, &Echo, &markers, first.unprocessed).is_none());
        assert_eq!(recovery.backlog(), vec!["+CP"]);

        let second = p.process(lines(&["OK", "MS: \"SM\",6,40"]), &Echo);
        let resolved = recovery
            .resolve(&p, &Echo, &markers, second.unprocessed)
            .expect("window should match");
        assert_eq!(resolved.updates[0].0, Kind::Cpms);
        assert_eq!(resolved.updates[0].1, vec!["SM", "6", "40"]);
        assert!(recovery.is_empty());
    }

    #[test]
    fn recovery_drops_sentinels_and_keeps_unresolved() {
        let p = processor();
        let markers = Markers::default();
        let mut recovery = Recovery::new();
        let out = recovery.resolve(&p, &Echo, &markers, lines(&["OK", "garbage", "ERROR", "more"]));
        assert!(out.is_none());
        assert_eq!(recovery.backlog(), vec!["garbage", "more"]);
    }

    #[test]
    fn recovery_caps_backlog_size() {
        let p = processor();
        let markers = Markers::default();
        let mut recovery = Recovery::with_limits(3, MAX_BACKLOG_AGE);
        recovery.resolve(&p, &Echo, &markers, lines(&["a", "b", "c", "d", "e"]));
        assert_eq!(recovery.backlog(), vec!["c", "d", "e"]);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_expires_old_lines() {
        let p = processor();
        let markers = Markers::default();
        let mut recovery = Recovery::with_limits(32, Duration::from_secs(60));
        recovery.resolve(&p, &Echo, &markers, lines(&["stale"]));
        tokio::time::advance(Duration::from_secs(61)).await;
        recovery.resolve(&p, &Echo, &markers, lines(&["fresh"]));
        assert_eq!(recovery.backlog(), vec!["fresh"]);
    }
}
