//! Transaction matching: deciding when a command's reply is complete.
//!
//! A [`Transaction`] is fed the lines received for one command. It looks
//! for a conclusive line in priority order:
//!
//! 1. one of the command's explicit `expect` patterns (success),
//! 2. the success marker (`OK`),
//! 3. one of the error markers (`ERROR`, `NO CARRIER`, ..., `+CME ERROR:`,
//!    `+CMS ERROR:`).
//!
//! Patterns are case-insensitive prefixes. Lines before the conclusive line
//! form the response (minus `ignore` patterns); lines after it are extras
//! that belong to the notification path. Structured error markers keep
//! their line in the response since it carries the error code.

use atgsm_core::driver::{Driver, keys};

/// Case-insensitive ASCII prefix test. An empty pattern never matches.
pub fn starts_with_ignore_case(line: &str, pattern: &str) -> bool {
    !pattern.is_empty()
        && line
            .get(..pattern.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(pattern))
}

/// An error sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMarker {
    pub pattern: String,
    /// Keep the matched line in the captured response.
    pub retain: bool,
}

/// Response sentinels shared by every transaction on one modem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Markers {
    pub success: String,
    pub errors: Vec<ErrorMarker>,
}

impl Markers {
    /// Build the sentinel set from a driver. Markers the driver leaves
    /// empty are skipped.
    pub fn from_driver(driver: &Driver) -> Self {
        let plain = [
            keys::RESPONSE_ERROR,
            keys::RESPONSE_NO_CARRIER,
            keys::RESPONSE_NOT_SUPPORTED,
        ];
        let structured = [keys::RESPONSE_CME_ERROR, keys::RESPONSE_CMS_ERROR];

        let mut errors = Vec::new();
        for key in plain {
            if let Some(pattern) = driver.get(key) {
                errors.push(ErrorMarker {
                    pattern,
                    retain: false,
                });
            }
        }
        for key in structured {
            if let Some(pattern) = driver.get(key) {
                errors.push(ErrorMarker {
                    pattern,
                    retain: true,
                });
            }
        }

        Markers {
            success: driver
                .get(keys::RESPONSE_OK)
                .unwrap_or_else(|| "OK".to_string()),
            errors,
        }
    }

    /// Whether `line` is a bare success or error sentinel.
    pub fn is_sentinel(&self, line: &str) -> bool {
        let line = line.trim();
        line.eq_ignore_ascii_case(&self.success)
            || self
                .errors
                .iter()
                .any(|m| !m.retain && line.eq_ignore_ascii_case(m.pattern.trim()))
    }

    /// Whether `line` starts with any success or error marker.
    pub fn is_marker(&self, line: &str) -> bool {
        starts_with_ignore_case(line, &self.success)
            || self
                .errors
                .iter()
                .any(|m| starts_with_ignore_case(line, &m.pattern))
    }
}

impl Default for Markers {
    fn default() -> Self {
        Markers::from_driver(&Driver::generic())
    }
}

/// How a transaction concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    Success,
    Error,
}

/// Runtime state of one outstanding command.
#[derive(Debug, Clone)]
pub struct Transaction {
    expect: Vec<String>,
    ignore: Vec<String>,
    markers: Markers,
    outcome: Outcome,
    responses: Vec<String>,
    extras: Vec<String>,
}

impl Transaction {
    pub fn new(expect: &[String], ignore: &[String], markers: &Markers) -> Self {
        Transaction {
            expect: expect.to_vec(),
            ignore: ignore.to_vec(),
            markers: markers.clone(),
            outcome: Outcome::Pending,
            responses: Vec::new(),
            extras: Vec::new(),
        }
    }

    /// Feed newly framed lines. Returns `true` once the transaction has
    /// concluded.
    ///
    /// After conclusion further calls are ignored, so the matched window
    /// and its extras are consumed exactly once.
    pub fn check(&mut self, lines: Vec<String>) -> bool {
        if self.outcome != Outcome::Pending {
            return true;
        }

        let mut candidates = std::mem::take(&mut self.responses);
        candidates.extend(lines);

        let found = if self.expect.is_empty() {
            None
        } else {
            find_match(&mut candidates, &self.expect).map(|(pos, _)| (pos, Outcome::Success, false))
        };
        let found = found
            .or_else(|| {
                find_match(&mut candidates, std::slice::from_ref(&self.markers.success))
                    .map(|(pos, _)| (pos, Outcome::Success, false))
            })
            .or_else(|| {
                let patterns: Vec<String> =
                    self.markers.errors.iter().map(|m| m.pattern.clone()).collect();
                find_match(&mut candidates, &patterns)
                    .map(|(pos, idx)| (pos, Outcome::Error, self.markers.errors[idx].retain))
            });

        match found {
            Some((pos, outcome, retain)) => {
                let extras = candidates.split_off(pos + 1);
                let matched = candidates.pop();
                self.responses = self.collect(candidates);
                if retain {
                    if let Some(line) = matched.filter(|l| !self.is_ignored(l)) {
                        self.responses.push(line);
                    }
                }
                self.extras = extras;
                self.outcome = outcome;
                true
            }
            None => {
                self.responses = self.collect(candidates);
                false
            }
        }
    }

    fn collect(&self, lines: Vec<String>) -> Vec<String> {
        lines.into_iter().filter(|l| !self.is_ignored(l)).collect()
    }

    fn is_ignored(&self, line: &str) -> bool {
        self.ignore.iter().any(|p| starts_with_ignore_case(line, p))
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn is_concluded(&self) -> bool {
        self.outcome != Outcome::Pending
    }

    /// Lines captured so far.
    pub fn responses(&self) -> &[String] {
        &self.responses
    }

    /// Lines received after the conclusive line.
    pub fn extras(&self) -> &[String] {
        &self.extras
    }

    /// Take the extras, leaving none behind.
    pub fn take_extras(&mut self) -> Vec<String> {
        std::mem::take(&mut self.extras)
    }

    pub fn into_responses(self) -> Vec<String> {
        self.responses
    }
}

/// Scan `lines` position by position for the first line matching any of
/// `patterns`. Returns the position and the index of the matched pattern.
///
/// When a line is itself a leading fragment of a pattern, following lines
/// are joined onto it until the pattern matches; on success the joined
/// lines are collapsed into one entry at that position.
fn find_match(lines: &mut Vec<String>, patterns: &[String]) -> Option<(usize, usize)> {
    for pos in 0..lines.len() {
        for (idx, pattern) in patterns.iter().enumerate() {
            if try_match(lines, pos, pattern) {
                return Some((pos, idx));
            }
        }
    }
    None
}

fn try_match(lines: &mut Vec<String>, pos: usize, pattern: &str) -> bool {
    let Some(first) = lines.get(pos) else {
        return false;
    };
    if starts_with_ignore_case(first, pattern) {
        return true;
    }
    if !starts_with_ignore_case(pattern, first) {
        return false;
    }

    let mut joined = first.clone();
    for next in pos + 1..lines.len() {
        joined.push_str(&lines[next]);
        if starts_with_ignore_case(&joined, pattern) {
            lines[pos] = joined;
            lines.drain(pos + 1..=next);
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn plain() -> Transaction {
        Transaction::new(&[], &[], &Markers::default())
    }

    #[test]
    fn prefix_is_case_insensitive() {
        assert!(starts_with_ignore_case("ok", "OK"));
        assert!(starts_with_ignore_case("+cms error: 500", "+CMS ERROR:"));
        assert!(!starts_with_ignore_case("O", "OK"));
        assert!(!starts_with_ignore_case("OK", ""));
    }

    #[test]
    fn ok_alone_is_success_with_empty_response() {
        let mut tx = plain();
        assert!(tx.check(lines(&["OK"])));
        assert_eq!(tx.outcome(), Outcome::Success);
        assert!(tx.responses().is_empty());
        assert!(tx.extras().is_empty());
    }

    #[test]
    fn lines_before_ok_form_response() {
        let mut tx = plain();
        assert!(tx.check(lines(&["+CSQ: 20,99", "OK"])));
        assert_eq!(tx.responses(), ["+CSQ: 20,99"]);
    }

    #[test]
    fn waits_for_more_lines() {
        let mut tx = plain();
        assert!(!tx.check(lines(&["+CSQ: 20,99"])));
        assert_eq!(tx.outcome(), Outcome::Pending);
        assert!(tx.check(lines(&["OK"])));
        assert_eq!(tx.responses(), ["+CSQ: 20,99"]);
    }

    #[test]
    fn plain_error_is_dropped_from_response() {
        let mut tx = plain();
        assert!(tx.check(lines(&["ERROR"])));
        assert_eq!(tx.outcome(), Outcome::Error);
        assert!(tx.responses().is_empty());
    }

    #[test]
    fn structured_error_is_retained() {
        let mut tx = plain();
        assert!(tx.check(lines(&["+CMS ERROR: 500"])));
        assert_eq!(tx.outcome(), Outcome::Error);
        assert_eq!(tx.responses(), ["+CMS ERROR: 500"]);
    }

    #[test]
    fn expect_takes_priority_over_ok() {
        let expect = vec!["> ".to_string()];
        let mut tx = Transaction::new(&expect, &[], &Markers::default());
        assert!(tx.check(lines(&["> ", "OK"])));
        assert_eq!(tx.outcome(), Outcome::Success);
        assert!(tx.responses().is_empty());
        assert_eq!(tx.extras(), ["OK"]);
    }

    #[test]
    fn ignore_drops_echo_lines() {
        let ignore = vec!["> ".to_string()];
        let mut tx = Transaction::new(&[], &ignore, &Markers::default());
        assert!(tx.check(lines(&["> ", "+CMGS: 12", "OK"])));
        assert_eq!(tx.responses(), ["+CMGS: 12"]);
    }

    #[test]
    fn lines_after_match_become_extras() {
        let mut tx = plain();
        assert!(tx.check(lines(&["+CSQ: 20,99", "OK", "RING", "+CLIP: \"+62811\",145"])));
        assert_eq!(tx.responses(), ["+CSQ: 20,99"]);
        assert_eq!(tx.extras(), ["RING", "+CLIP: \"+62811\",145"]);
    }

    #[test]
    fn feeding_twice_does_not_double_extras() {
        let mut tx = plain();
        let frame = lines(&["OK", "RING"]);
        assert!(tx.check(frame.clone()));
        assert!(tx.check(frame));
        assert_eq!(tx.extras(), ["RING"]);
        assert_eq!(tx.take_extras(), vec!["RING".to_string()]);
        assert!(tx.extras().is_empty());
    }

    #[test]
    fn split_marker_is_joined() {
        let mut tx = plain();
        assert!(tx.check(lines(&["+CME ERR", "OR: 10"])));
        assert_eq!(tx.outcome(), Outcome::Error);
        assert_eq!(tx.responses(), ["+CME ERROR: 10"]);
    }

    #[test]
    fn earliest_position_wins_within_markers() {
        let mut tx = plain();
        assert!(tx.check(lines(&["NO CARRIER", "ERROR"])));
        assert_eq!(tx.outcome(), Outcome::Error);
        assert_eq!(tx.extras(), ["ERROR"]);
    }

    #[test]
    fn sentinel_detection() {
        let markers = Markers::default();
        assert!(markers.is_sentinel("OK"));
        assert!(markers.is_sentinel(" error "));
        assert!(!markers.is_sentinel("+CMS ERROR: 500"));
        assert!(markers.is_marker("+CMS ERROR: 500"));
        assert!(!markers.is_marker("+CSQ: 1,1"));
    }

    #[test]
    fn markers_from_driver_skip_empty_entries() {
        let driver = Driver::generic().with(keys::RESPONSE_NOT_SUPPORTED, "%NONE%");
        let markers = Markers::from_driver(&driver);
        assert_eq!(markers.success, "OK");
        assert_eq!(markers.errors.len(), 4);
        assert!(markers.errors.iter().filter(|m| m.retain).count() == 2);
    }
}
