//! Literal + regex rule matching.
//!
//! Grounded on the original prototype's `matcher.py` (`MatcherEngine`): a pyahocorasick
//! automaton for literals plus a list of compiled regexes, built once and then queried
//! per packet. The mutable-then-frozen lifecycle (`Mutable` -> `build()` -> `Frozen`)
//! follows `retina-core::conntrack::ConnTracker`'s "configure once, run many" shape, and
//! the `Result`-returning fallible builder follows the `thiserror`/`anyhow` idiom used
//! throughout `retina-core` (e.g. `protocols::packet::ipv4::Ipv4::parse_from`).
//!
//! The original swapped `rule_id`/`pattern` arguments when calling `ac_automaton.add_word`
//! (using the id as the needle and the pattern as the payload) — a bug fixed here. The
//! needle is always the pattern and the payload is always the rule id.

use aho_corasick::AhoCorasick;
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};

use crate::config::RuleConfig;

#[derive(thiserror::Error, Debug)]
pub enum MatcherError {
    #[error("rule {id}: invalid regex pattern `{pattern}`: {source}")]
    InvalidRegex {
        id: u32,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("rule {id}: invalid literal pattern: {source}")]
    InvalidAutomaton {
        id: u32,
        #[source]
        source: aho_corasick::BuildError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Any,
    Tcp,
    Udp,
    Icmp,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Any
    }
}

impl Protocol {
    #[inline]
    fn matches(self, other: Protocol) -> bool {
        self == Protocol::Any || self == other
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Protocol::Any => "any",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Drop,
    Accept,
    Alert,
}

impl Default for Action {
    fn default() -> Self {
        Action::Drop
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::Drop => "drop",
            Action::Accept => "accept",
            Action::Alert => "alert",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Literal,
    Regex,
}

impl std::fmt::Display for RuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RuleKind::Literal => "literal",
            RuleKind::Regex => "regex",
        };
        write!(f, "{s}")
    }
}

/// A single match against `data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hit {
    pub rule_id: u32,
    pub action: Action,
    pub kind: RuleKind,
    /// Offset of the first match of this rule within the scanned data.
    pub offset: Option<usize>,
}

struct RegexRule {
    id: u32,
    regex: Regex,
    protocol: Protocol,
    action: Action,
}

struct LiteralMeta {
    protocol: Protocol,
    action: Action,
}

/// Builds a rule set, then freezes it into a queryable [`CompiledMatcher`].
///
/// `add_literal`/`add_regex` are only valid before `build()`; `match_data` is only valid
/// after.
pub struct Matcher {
    literal_patterns: Vec<Vec<u8>>,
    literal_meta: Vec<LiteralMeta>,
    literal_ids: Vec<u32>,
    regex_rules: Vec<RegexRule>,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Matcher {
    pub fn new() -> Self {
        Matcher {
            literal_patterns: Vec::new(),
            literal_meta: Vec::new(),
            literal_ids: Vec::new(),
            regex_rules: Vec::new(),
        }
    }

    /// Registers a byte-string rule to detect anywhere in scan input.
    pub fn add_literal(&mut self, id: u32, pattern: impl Into<Vec<u8>>, protocol: Protocol, action: Action) {
        self.literal_patterns.push(pattern.into());
        self.literal_meta.push(LiteralMeta { protocol, action });
        self.literal_ids.push(id);
    }

    /// Registers a case-insensitive regular expression rule (the original prototype forces
    /// case-insensitivity for all regex rules; preserved here as the default) and compiles
    /// it immediately, rather than deferring validation to
    /// `build()`: a bad pattern is reported at the call site that introduced it, not at
    /// some later, unrelated `build()` call.
    pub fn add_regex(
        &mut self,
        id: u32,
        pattern: impl Into<String>,
        protocol: Protocol,
        action: Action,
    ) -> Result<(), MatcherError> {
        let pattern = pattern.into();
        let regex = Regex::new(&format!("(?i){pattern}")).map_err(|source| MatcherError::InvalidRegex {
            id,
            pattern: pattern.clone(),
            source,
        })?;
        self.regex_rules.push(RegexRule {
            id,
            regex,
            protocol,
            action,
        });
        Ok(())
    }

    /// Loads every rule from a parsed configuration document.
    pub fn add_rules(&mut self, rules: &[RuleConfig]) -> Result<(), MatcherError> {
        for rule in rules {
            match rule.kind {
                RuleKind::Literal => {
                    self.add_literal(rule.id, rule.pattern.as_bytes().to_vec(), rule.protocol, rule.action)
                }
                RuleKind::Regex => self.add_regex(rule.id, rule.pattern.clone(), rule.protocol, rule.action)?,
            }
        }
        Ok(())
    }

    /// Freezes the rule set, precompiling the literal automaton. Every regex was already
    /// validated and compiled by `add_regex`, so there's nothing left to fail on here
    /// except the automaton itself.
    ///
    /// Consuming `self` is how the Mutable -> Frozen transition is enforced: once
    /// `build()` runs there is no longer a `Matcher` value to call `add_literal`/
    /// `add_regex` on, so further adds being rejected is a compile-time property rather
    /// than a runtime flag check. `build()` itself has nothing left to do a second time
    /// for the same rule set -- there is no handle left to call it again on -- which is
    /// the strongest form of idempotence available here.
    pub fn build(self) -> Result<CompiledMatcher, MatcherError> {
        let automaton = if self.literal_patterns.is_empty() {
            None
        } else {
            Some(
                AhoCorasick::new(&self.literal_patterns).map_err(|source| MatcherError::InvalidAutomaton {
                    id: *self.literal_ids.first().unwrap_or(&0),
                    source,
                })?,
            )
        };

        Ok(CompiledMatcher {
            automaton,
            literal_ids: self.literal_ids,
            literal_meta: self
                .literal_meta
                .into_iter()
                .map(|m| (m.protocol, m.action))
                .collect(),
            regex_rules: self.regex_rules,
        })
    }
}

/// An immutable, thread-shareable compiled rule set.
///
/// Queries are only valid in this state; there is no path back to
/// `Matcher` short of building a new one, which matches the original's one-shot
/// `build()`/`self.built = True` flag.
#[derive(Clone)]
pub struct CompiledMatcher {
    automaton: Option<AhoCorasick>,
    literal_ids: Vec<u32>,
    literal_meta: Vec<(Protocol, Action)>,
    regex_rules: Vec<RegexRule>,
}

impl Clone for RegexRule {
    fn clone(&self) -> Self {
        RegexRule {
            id: self.id,
            regex: self.regex.clone(),
            protocol: self.protocol,
            action: self.action,
        }
    }
}

impl CompiledMatcher {
    /// Returns every rule whose protocol filter is `any` or equals `protocol` and whose
    /// pattern occurs in `data`.
    ///
    /// Protocol filtering short-circuits before pattern evaluation. Never panics: a
    /// malformed or partial `data` slice is scanned as-is.
    pub fn match_data(&self, data: &[u8], protocol: Protocol) -> Vec<Hit> {
        let mut hits = Vec::new();

        if let Some(automaton) = &self.automaton {
            for mat in automaton.find_iter(data) {
                let pattern_idx = mat.pattern().as_usize();
                let (rule_protocol, action) = self.literal_meta[pattern_idx];
                if rule_protocol.matches(protocol) {
                    hits.push(Hit {
                        rule_id: self.literal_ids[pattern_idx],
                        action,
                        kind: RuleKind::Literal,
                        offset: Some(mat.start()),
                    });
                }
            }
        }

        for rule in &self.regex_rules {
            if !rule.protocol.matches(protocol) {
                continue;
            }
            if let Some(mat) = rule.regex.find(data) {
                hits.push(Hit {
                    rule_id: rule.id,
                    action: rule.action,
                    kind: RuleKind::Regex,
                    offset: Some(mat.start()),
                });
            }
        }

        hits
    }

    /// Scans UTF-8 text by first encoding it to bytes.
    pub fn match_text(&self, text: &str, protocol: Protocol) -> Vec<Hit> {
        self.match_data(text.as_bytes(), protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_sample() -> CompiledMatcher {
        let mut m = Matcher::new();
        m.add_literal(1, b"malware".to_vec(), Protocol::Any, Action::Drop);
        m.add_regex(2, r"union\s+select", Protocol::Any, Action::Drop).unwrap();
        m.build().unwrap()
    }

    #[test]
    fn unbuilt_matcher_reports_no_hits_until_frozen() {
        // A Matcher has no query surface before build(); this documents that the only
        // way to query is through the CompiledMatcher build() returns.
        let matcher = Matcher::new();
        let compiled = matcher.build().unwrap();
        assert!(compiled.match_data(b"anything", Protocol::Tcp).is_empty());
    }

    #[test]
    fn literal_hit_reports_offset_and_kind() {
        let compiled = build_sample();
        let hits = compiled.match_data(b"contains malware payload", Protocol::Tcp);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].rule_id, 1);
        assert_eq!(hits[0].kind, RuleKind::Literal);
        assert_eq!(hits[0].offset, Some(9));
        assert_eq!(hits[0].action, Action::Drop);
    }

    #[test]
    fn regex_hit_is_case_insensitive() {
        let compiled = build_sample();
        let hits = compiled.match_data(b"id=1 UNION SELECT * FROM users", Protocol::Udp);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].rule_id, 2);
        assert_eq!(hits[0].kind, RuleKind::Regex);
    }

    #[test]
    fn protocol_filter_short_circuits() {
        let mut m = Matcher::new();
        m.add_literal(1, b"malware".to_vec(), Protocol::Udp, Action::Drop);
        let compiled = m.build().unwrap();
        assert!(compiled.match_data(b"malware", Protocol::Tcp).is_empty());
        assert_eq!(compiled.match_data(b"malware", Protocol::Udp).len(), 1);
    }

    #[test]
    fn duplicate_literal_under_distinct_ids_yields_two_hits() {
        let mut m = Matcher::new();
        m.add_literal(1, b"bad".to_vec(), Protocol::Any, Action::Drop);
        m.add_literal(2, b"bad".to_vec(), Protocol::Any, Action::Alert);
        let compiled = m.build().unwrap();
        let hits = compiled.match_data(b"this is bad", Protocol::Tcp);
        assert_eq!(hits.len(), 2);
        let mut ids: Vec<u32> = hits.iter().map(|h| h.rule_id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn invalid_regex_is_rejected_at_add_time() {
        let mut m = Matcher::new();
        let result = m.add_regex(1, "(unterminated", Protocol::Any, Action::Drop);
        assert!(matches!(result, Err(MatcherError::InvalidRegex { id: 1, .. })));
    }

    #[test]
    fn no_match_on_empty_input() {
        let compiled = build_sample();
        assert!(compiled.match_data(b"", Protocol::Tcp).is_empty());
    }
}
