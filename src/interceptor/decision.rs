//! Request and decision types.

use crate::intent::IntentResult;
use crate::scanner::SecretMatch;
use bytes::Bytes;
use serde::Serialize;
use serde_json::json;
use std::fmt;

/// Outcome of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Allow,
    Block,
    Throttle,
    RequireApproval,
}

impl DecisionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Block => "block",
            Self::Throttle => "throttle",
            Self::RequireApproval => "require_approval",
        }
    }

    /// HTTP status returned to the agent.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Allow => 200,
            Self::Block => 403,
            Self::Throttle => 429,
            Self::RequireApproval => 409,
        }
    }
}

impl fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport the request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// A decoded request awaiting a decision.
#[derive(Debug, Clone)]
pub struct InterceptRequest {
    pub method: String,
    /// Absolute URL.
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub protocol: Protocol,
    /// Client port of the proxied connection, for process lookup.
    pub source_port: Option<u16>,
    /// Set instead of `body` when the body was abandoned for exceeding the
    /// read limit; the size it is known to exceed.
    pub body_overflow: Option<u64>,
}

impl InterceptRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            body: Bytes::new(),
            protocol: Protocol::Https,
            source_port: None,
            body_overflow: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn source_port(mut self, port: u16) -> Self {
        self.source_port = Some(port);
        self
    }

    pub fn body_overflow(mut self, bytes: u64) -> Self {
        self.body_overflow = Some(bytes);
        self
    }

    /// Size of the body for limit checks.
    pub fn body_size(&self) -> u64 {
        self.body_overflow.unwrap_or(self.body.len() as u64)
    }

    /// First value of a header, matched case-insensitively.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.trim().is_empty())
    }
}

/// The verdict for one request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptDecision {
    pub request_id: String,
    pub action: DecisionAction,
    pub status_code: u16,
    pub reason: String,
    /// Policy rule, glob, or exceeded rate key behind the decision.
    pub matched_rule: Option<String>,
    pub agent_id: String,
    pub agent_name: String,
    pub domain: String,
    pub threat_score: u8,
    pub secrets: Vec<SecretMatch>,
    /// Allowed, but something at `alert` level was found.
    pub flagged: bool,
    pub intent: Option<IntentResult>,
    /// Receipt of the audit entry; absent only if the audit write failed.
    pub receipt_hash: Option<String>,
}

impl InterceptDecision {
    pub fn is_allowed(&self) -> bool {
        self.action == DecisionAction::Allow
    }

    /// JSON body sent to the agent for non-allow decisions.
    pub fn response_body(&self) -> Option<String> {
        if self.is_allowed() {
            return None;
        }
        Some(
            json!({
                "error": self.action.as_str(),
                "reason": self.reason,
                "rule": self.matched_rule,
                "requestId": self.request_id,
                "receiptHash": self.receipt_hash,
            })
            .to_string(),
        )
    }
}

/// Inputs to the threat score.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ThreatFactors {
    pub secrets: usize,
    pub first_contact: bool,
    pub body_size: u64,
    pub rate_limited: bool,
    pub intent_mismatch: Option<u8>,
    pub denied_domain: bool,
    pub pending_domain: bool,
}

/// Bodies above this size add to the threat score.
pub(crate) const LARGE_BODY_BYTES: u64 = 1_000_000;

impl ThreatFactors {
    /// Score in `0..=100`.
    pub fn score(&self) -> u8 {
        let mut score = 35.0 * self.secrets as f64;
        if self.first_contact {
            score += 20.0;
        }
        if self.body_size > LARGE_BODY_BYTES {
            score += 20.0;
        }
        if self.rate_limited {
            score += 25.0;
        }
        if let Some(mismatch) = self.intent_mismatch {
            score += 0.5 * f64::from(mismatch);
        }
        if self.denied_domain {
            score += 50.0;
        }
        if self.pending_domain {
            score += 25.0;
        }
        score.clamp(0.0, 100.0) as u8
    }
}
