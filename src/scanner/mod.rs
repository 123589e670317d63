//! Secret and sensitive-data detection for outbound requests.
//!
//! A request is scanned as one or more texts: its headers (rendered as
//! `name: value` lines) and its body. Each text is searched in its plain
//! form, its percent-decoded form, and each decodable base64 segment. No
//! decoded form is decoded again.
//!
//! Detections come from three sources:
//!
//! - built-in credential signatures plus explicit policy patterns
//! - high-entropy tokens shaped like keys
//! - references to sensitive file paths
//!
//! Inputs larger than the configured limit are not scanned; the caller gets
//! [`ScanOutcome::Inconclusive`] and must fail closed.

mod decode;
mod entropy;
mod signatures;

pub use decode::{decode_base64_segment, url_decode};
pub use entropy::{looks_like_secret_token, shannon_entropy};

use crate::policy::{PolicyAction, PolicyEngine, SecretRules, SensitiveFileRules, matches_glob};
use decode::Base64Finder;
use regex::Regex;
use serde::Serialize;
use signatures::{BuiltinSignature, builtin_signatures};
use std::collections::HashSet;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Default cap on the bytes a single request may present for scanning.
pub const DEFAULT_MAX_SCAN_BYTES: usize = 4 * 1024 * 1024;

const ENTROPY_TYPE: &str = "High Entropy String";
pub const SENSITIVE_FILE_TYPE: &str = "Sensitive File Reference";

/// Scanner construction errors.
#[derive(Debug, Error)]
pub enum ScannerError {
    #[error("failed to compile built-in expression: {0}")]
    Expression(#[from] regex::Error),
}

/// Where a match was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchLocation {
    Headers,
    Body,
}

impl fmt::Display for MatchLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Headers => write!(f, "headers"),
            Self::Body => write!(f, "body"),
        }
    }
}

/// The form of the text a match was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchEncoding {
    Plain,
    Urlencoded,
    Base64,
}

/// One detected secret.
///
/// The raw value is never stored; only a redacted preview survives.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretMatch {
    /// Signature name, such as "AWS Access Key".
    #[serde(rename = "type")]
    pub secret_type: String,
    pub location: MatchLocation,
    /// Byte offsets within the scanned (possibly decoded) text.
    pub start: usize,
    pub end: usize,
    pub redacted: String,
    pub encoding: MatchEncoding,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entropy: Option<f64>,
    /// Action configured for the detector that produced this match.
    pub action: PolicyAction,
}

impl SecretMatch {
    /// Whether this match should stop the request.
    pub fn blocks(&self) -> bool {
        self.action == PolicyAction::Block
    }
}

/// Result of scanning a request.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    /// The whole input was scanned.
    Complete(Vec<SecretMatch>),
    /// The input exceeded the scan limit and was not scanned.
    Inconclusive { bytes: usize, limit: usize },
}

impl ScanOutcome {
    /// Matches, or an empty slice when inconclusive.
    pub fn matches(&self) -> &[SecretMatch] {
        match self {
            Self::Complete(matches) => matches,
            Self::Inconclusive { .. } => &[],
        }
    }

    pub fn is_inconclusive(&self) -> bool {
        matches!(self, Self::Inconclusive { .. })
    }
}

/// Detects credentials and sensitive references in request content.
pub struct SecretScanner {
    policy: Arc<PolicyEngine>,
    builtin: Vec<BuiltinSignature>,
    base64: Base64Finder,
    token: Regex,
    max_scan_bytes: usize,
}

impl SecretScanner {
    /// Compile the built-in expressions. Policy patterns are read from the
    /// engine's current snapshot on every scan.
    pub fn new(policy: Arc<PolicyEngine>) -> Result<Self, ScannerError> {
        Ok(Self {
            policy,
            builtin: builtin_signatures()?,
            base64: Base64Finder::new()?,
            token: Regex::new(r"[A-Za-z0-9+/_-]+={0,2}")?,
            max_scan_bytes: DEFAULT_MAX_SCAN_BYTES,
        })
    }

    /// Override the scan size limit.
    pub fn with_max_scan_bytes(mut self, limit: usize) -> Self {
        self.max_scan_bytes = limit;
        self
    }

    pub fn max_scan_bytes(&self) -> usize {
        self.max_scan_bytes
    }

    /// Scan a request's headers and body.
    pub fn scan_request(&self, headers: &[(String, String)], body: &[u8]) -> ScanOutcome {
        let header_bytes: usize = headers.iter().map(|(k, v)| k.len() + v.len() + 3).sum();
        let total = header_bytes + body.len();
        if total > self.max_scan_bytes {
            debug!(bytes = total, limit = self.max_scan_bytes, "Request exceeds scan limit");
            return ScanOutcome::Inconclusive {
                bytes: total,
                limit: self.max_scan_bytes,
            };
        }

        let snapshot = self.policy.snapshot();
        let rules = Rules {
            secrets: &snapshot.policy.secrets,
            files: &snapshot.policy.sensitive_files,
        };

        let mut sink = MatchSink::default();

        if !headers.is_empty() {
            let rendered = headers
                .iter()
                .map(|(k, v)| format!("{k}: {v}"))
                .collect::<Vec<_>>()
                .join("\n");
            self.scan_all_forms(&rendered, MatchLocation::Headers, &rules, &mut sink);
        }

        if !body.is_empty() {
            let text = String::from_utf8_lossy(body);
            self.scan_all_forms(&text, MatchLocation::Body, &rules, &mut sink);
        }

        ScanOutcome::Complete(sink.matches)
    }

    fn scan_all_forms(
        &self,
        text: &str,
        location: MatchLocation,
        rules: &Rules<'_>,
        sink: &mut MatchSink,
    ) {
        self.scan_form(text, location, MatchEncoding::Plain, rules, sink);

        if let Some(decoded) = url_decode(text) {
            self.scan_form(&decoded, location, MatchEncoding::Urlencoded, rules, sink);
        }

        for decoded in self.base64.decode_all(text) {
            self.scan_form(&decoded, location, MatchEncoding::Base64, rules, sink);
        }
    }

    fn scan_form(
        &self,
        text: &str,
        location: MatchLocation,
        encoding: MatchEncoding,
        rules: &Rules<'_>,
        sink: &mut MatchSink,
    ) {
        let mut covered: Vec<Range<usize>> = Vec::new();
        let make = |secret_type: &str,
                    m: regex::Match<'_>,
                    action: PolicyAction,
                    entropy: Option<f64>| SecretMatch {
            secret_type: secret_type.to_string(),
            location,
            start: m.start(),
            end: m.end(),
            redacted: redact(m.as_str()),
            encoding,
            entropy,
            action,
        };

        if rules.secrets.enabled {
            for sig in &self.builtin {
                for m in sig.regex.find_iter(text) {
                    covered.push(m.range());
                    sink.push(make(sig.name, m, rules.secrets.action, None));
                }
            }
            for sig in &rules.secrets.patterns {
                for m in sig.regex.find_iter(text) {
                    covered.push(m.range());
                    sink.push(make(&sig.name, m, sig.action, None));
                }
            }

            let entropy = rules.secrets.entropy;
            if entropy.enabled {
                for m in self.token.find_iter(text) {
                    let token = m.as_str();
                    if token.len() < entropy.min_length
                        || !looks_like_secret_token(token)
                        || overlaps(&covered, &m.range())
                    {
                        continue;
                    }
                    let score = shannon_entropy(token);
                    if score >= entropy.min_entropy {
                        sink.push(make(ENTROPY_TYPE, m, entropy.action, Some(score)));
                    }
                }
            }
        }

        if rules.files.enabled && location == MatchLocation::Body {
            for (range, matched) in sensitive_references(text, &rules.files.paths) {
                sink.push(SecretMatch {
                    secret_type: SENSITIVE_FILE_TYPE.to_string(),
                    location,
                    start: range.start,
                    end: range.end,
                    redacted: matched,
                    encoding,
                    entropy: None,
                    action: rules.files.action,
                });
            }
        }
    }
}

impl fmt::Debug for SecretScanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretScanner")
            .field("builtin", &self.builtin.len())
            .field("max_scan_bytes", &self.max_scan_bytes)
            .finish()
    }
}

struct Rules<'a> {
    secrets: &'a SecretRules,
    files: &'a SensitiveFileRules,
}

/// Collects matches, dropping exact duplicates.
#[derive(Default)]
struct MatchSink {
    seen: HashSet<(String, MatchLocation, usize, usize, String, MatchEncoding)>,
    matches: Vec<SecretMatch>,
}

impl MatchSink {
    fn push(&mut self, m: SecretMatch) {
        let key = (
            m.secret_type.clone(),
            m.location,
            m.start,
            m.end,
            m.redacted.clone(),
            m.encoding,
        );
        if self.seen.insert(key) {
            self.matches.push(m);
        }
    }
}

fn overlaps(ranges: &[Range<usize>], r: &Range<usize>) -> bool {
    ranges.iter().any(|c| c.start < r.end && r.start < c.end)
}

/// Shorten a secret to a preview that cannot be used to recover it.
pub fn redact(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    match chars.len() {
        0 => String::new(),
        n if n <= 8 => format!("{}***{}", chars[0], chars[n - 1]),
        n => {
            let head: String = chars[..4].iter().collect();
            let tail: String = chars[n - 4..].iter().collect();
            format!("{head}...{tail}")
        }
    }
}

/// Find references to configured sensitive paths.
///
/// Patterns without `*` match as substrings. Patterns with `*` are matched
/// against whitespace- and quote-delimited words.
fn sensitive_references(text: &str, patterns: &[String]) -> Vec<(Range<usize>, String)> {
    let mut found = Vec::new();
    for pattern in patterns.iter().filter(|p| !p.is_empty()) {
        if pattern.contains('*') {
            for (start, word) in words(text) {
                if matches_glob(pattern, word) {
                    found.push((start..start + word.len(), word.to_string()));
                }
            }
        } else {
            for (start, matched) in text.match_indices(pattern.as_str()) {
                found.push((start..start + matched.len(), matched.to_string()));
            }
        }
    }
    found
}

fn words(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let is_sep = |c: char| c.is_whitespace() || matches!(c, '"' | '\'' | '`' | ',' | '(' | ')');
    let mut out = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
        match (is_sep(c), start) {
            (true, Some(s)) => {
                out.push((s, &text[s..i]));
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(s) = start {
        out.push((s, &text[s..]));
    }
    out.into_iter()
}
