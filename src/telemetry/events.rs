//! Fleet telemetry events.
//!
//! Events describe what the proxy decided, never what the agent sent. The
//! free-form `metadata` map is stripped of credential-shaped keys before an
//! event is buffered.

use serde::Serialize;
use serde_json::{Map, Value};

/// Metadata keys that may carry request content and are never transmitted.
pub const SENSITIVE_METADATA_KEYS: &[&str] = &[
    "requestBody",
    "requestHeaders",
    "credentials",
    "apiKey",
    "password",
    "token",
    "fileContents",
    "secretValue",
];

/// Kind of security signal being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TelemetryEventType {
    SecretDetected,
    NewDomainBlocked,
    NewDomainApproved,
    RateLimitHit,
    VolumeAnomaly,
    PromptInjection,
    ExfiltrationAttempt,
    PolicyViolation,
    IntentMismatch,
    SensitiveFileRead,
}

/// One telemetry record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    /// Filled in by the reporter.
    pub installation_id: String,
    pub event_type: TelemetryEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_type: Option<String>,
    pub decision: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_rule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threat_score: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entropy_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl TelemetryEvent {
    pub fn new(event_type: TelemetryEventType, decision: impl Into<String>) -> Self {
        Self {
            installation_id: String::new(),
            event_type,
            domain: None,
            agent_name: None,
            secret_type: None,
            decision: decision.into(),
            policy_rule_id: None,
            threat_score: None,
            request_method: None,
            body_size: None,
            entropy_score: None,
            metadata: None,
        }
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn agent_name(mut self, name: impl Into<String>) -> Self {
        self.agent_name = Some(name.into());
        self
    }

    pub fn secret_type(mut self, secret_type: impl Into<String>) -> Self {
        self.secret_type = Some(secret_type.into());
        self
    }

    pub fn policy_rule(mut self, rule: impl Into<String>) -> Self {
        self.policy_rule_id = Some(rule.into());
        self
    }

    pub fn threat_score(mut self, score: u8) -> Self {
        self.threat_score = Some(score);
        self
    }

    pub fn request(mut self, method: impl Into<String>, body_size: u64) -> Self {
        self.request_method = Some(method.into());
        self.body_size = Some(body_size);
        self
    }

    pub fn entropy(mut self, score: Option<f64>) -> Self {
        self.entropy_score = score;
        self
    }

    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Drop sensitive keys. An empty result becomes `None`.
pub fn sanitize_metadata(metadata: Option<Map<String, Value>>) -> Option<Map<String, Value>> {
    let sanitized: Map<String, Value> = metadata?
        .into_iter()
        .filter(|(key, _)| !SENSITIVE_METADATA_KEYS.contains(&key.as_str()))
        .collect();
    (!sanitized.is_empty()).then_some(sanitized)
}
