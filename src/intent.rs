//! Intent analysis capability.
//!
//! An external model scores how far a request strays from the agent's
//! declared purpose. Backends are injected; this module only selects one,
//! bounds how often and how long it runs, and interprets its answer.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Pre-intent threat score above which analysis runs.
pub const DEFAULT_THRESHOLD: u8 = 30;
/// Mismatch score at which a request needs approval.
pub const MISMATCH_APPROVAL_SCORE: u8 = 60;
/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_CALLS_PER_MINUTE: usize = 10;
const BODY_PREVIEW_CHARS: usize = 500;

#[derive(Debug, Error)]
pub enum IntentError {
    #[error("Intent backend failed: {0}")]
    Backend(String),

    #[error("Intent analysis timed out after {0:?}")]
    Timeout(Duration),

    #[error("Intent analysis rate limit exceeded")]
    RateLimited,
}

/// What the analyzer sees of a request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentRequest {
    pub agent_name: String,
    pub declared_purpose: Option<String>,
    pub method: String,
    pub url: String,
    pub domain: String,
    pub body_size: u64,
    pub body_preview: String,
    pub secret_types: Vec<String>,
    pub is_first_contact: bool,
    pub threat_score: u8,
}

impl IntentRequest {
    /// Truncate a body to the preview length on a char boundary.
    pub fn preview(body: &[u8]) -> String {
        String::from_utf8_lossy(body)
            .chars()
            .take(BODY_PREVIEW_CHARS)
            .collect()
    }
}

/// A backend's verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentResult {
    pub provider: String,
    pub model: String,
    /// 0 (consistent with purpose) to 100 (clearly unrelated).
    pub mismatch_score: u8,
    pub reasoning: String,
}

impl IntentResult {
    pub fn is_mismatch(&self) -> bool {
        self.mismatch_score >= MISMATCH_APPROVAL_SCORE
    }
}

/// A pluggable analysis backend.
#[async_trait]
pub trait IntentAnalyzer: Send + Sync {
    /// Model identifier reported in results.
    fn model(&self) -> &str;

    async fn analyze(&self, request: &IntentRequest) -> Result<IntentResult, IntentError>;
}

/// Interpret raw model output: JSON `{mismatchScore, reasoning}` when
/// possible, otherwise the first number in the text. Scores clamp to 0..=100
/// and default to 50.
pub fn parse_intent_response(raw: &str, provider: &str, model: &str) -> IntentResult {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Reply {
        mismatch_score: Option<f64>,
        reasoning: Option<String>,
    }

    let clamp = |score: f64| score.clamp(0.0, 100.0).round() as u8;
    let (mismatch_score, reasoning) = match serde_json::from_str::<Reply>(raw.trim()) {
        Ok(reply) => (
            clamp(reply.mismatch_score.unwrap_or(50.0)),
            reply
                .reasoning
                .unwrap_or_else(|| "Model returned no reasoning.".to_string()),
        ),
        Err(_) => {
            let digits: String = raw
                .chars()
                .skip_while(|c| !c.is_ascii_digit())
                .take_while(char::is_ascii_digit)
                .take(3)
                .collect();
            let trimmed: String = raw.trim().chars().take(240).collect();
            (
                clamp(digits.parse().unwrap_or(50.0)),
                if trimmed.is_empty() {
                    "Model returned an unparsable response.".to_string()
                } else {
                    trimmed
                },
            )
        }
    };

    IntentResult {
        provider: provider.to_string(),
        model: model.to_string(),
        mismatch_score,
        reasoning,
    }
}

/// Configured analysis provider.
#[derive(Clone, Default)]
pub enum IntentProvider {
    #[default]
    Disabled,
    RemoteApi(Arc<dyn IntentAnalyzer>),
    LocalModel(Arc<dyn IntentAnalyzer>),
}

impl IntentProvider {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::RemoteApi(_) => "remote_api",
            Self::LocalModel(_) => "local_model",
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    fn backend(&self) -> Option<&Arc<dyn IntentAnalyzer>> {
        match self {
            Self::Disabled => None,
            Self::RemoteApi(backend) | Self::LocalModel(backend) => Some(backend),
        }
    }
}

impl std::fmt::Debug for IntentProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Runs the configured provider under a threshold, timeout, and call budget.
#[derive(Debug)]
pub struct IntentService {
    provider: IntentProvider,
    threshold: u8,
    timeout: Duration,
    recent_calls: Mutex<VecDeque<Instant>>,
}

impl IntentService {
    pub fn new(provider: IntentProvider, threshold: u8, timeout: Duration) -> Self {
        Self {
            provider,
            threshold,
            timeout,
            recent_calls: Mutex::new(VecDeque::new()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(IntentProvider::Disabled, DEFAULT_THRESHOLD, DEFAULT_TIMEOUT)
    }

    pub fn provider(&self) -> &IntentProvider {
        &self.provider
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    /// Analyze `request` if a provider is configured and its pre-intent
    /// score exceeds the threshold. Failures are logged and yield `None`.
    pub async fn maybe_analyze(&self, request: &IntentRequest) -> Option<IntentResult> {
        let backend = self.provider.backend()?;
        if request.threat_score <= self.threshold {
            return None;
        }

        match self.run(backend.as_ref(), request).await {
            Ok(result) => {
                debug!(
                    provider = self.provider.name(),
                    score = result.mismatch_score,
                    "Intent analysis complete"
                );
                Some(result)
            }
            Err(e) => {
                warn!(provider = self.provider.name(), error = %e, "Intent analysis skipped");
                None
            }
        }
    }

    async fn run(
        &self,
        backend: &dyn IntentAnalyzer,
        request: &IntentRequest,
    ) -> Result<IntentResult, IntentError> {
        self.take_call_slot()?;
        tokio::time::timeout(self.timeout, backend.analyze(request))
            .await
            .map_err(|_| IntentError::Timeout(self.timeout))?
    }

    fn take_call_slot(&self) -> Result<(), IntentError> {
        let now = Instant::now();
        let mut calls = self.recent_calls.lock();
        while calls
            .front()
            .is_some_and(|t| now.duration_since(*t) > Duration::from_secs(60))
        {
            calls.pop_front();
        }
        if calls.len() >= MAX_CALLS_PER_MINUTE {
            return Err(IntentError::RateLimited);
        }
        calls.push_back(now);
        Ok(())
    }
}

/// Default endpoint of a local generate-style model server.
pub const DEFAULT_LOCAL_ENDPOINT: &str = "http://127.0.0.1:11434";
const LOCAL_MAX_TOKENS: u32 = 250;

/// Backend for a local model server exposing `POST /api/generate` over
/// plain HTTP.
pub struct LocalModelAnalyzer {
    endpoint: String,
    model: String,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl LocalModelAnalyzer {
    /// Only `http://` endpoints are accepted.
    pub fn new(endpoint: &str, model: impl Into<String>) -> Result<Self, IntentError> {
        let endpoint = endpoint.trim_end_matches('/');
        if !endpoint.starts_with("http://") {
            return Err(IntentError::Backend(format!(
                "Local model endpoint must be http://, got '{endpoint}'"
            )));
        }
        Ok(Self {
            endpoint: endpoint.to_string(),
            model: model.into(),
            client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
        })
    }

    fn prompt(request: &IntentRequest) -> Result<String, IntentError> {
        let manifest = serde_json::to_string_pretty(request)
            .map_err(|e| IntentError::Backend(e.to_string()))?;
        Ok(format!(
            "You are a security gate reviewing an AI agent's outbound request.\n\
             Decide whether the request is consistent with the agent's declared purpose.\n\
             Return JSON with keys mismatchScore (0-100) and reasoning (one sentence).\n\n{manifest}"
        ))
    }
}

#[async_trait]
impl IntentAnalyzer for LocalModelAnalyzer {
    fn model(&self) -> &str {
        &self.model
    }

    async fn analyze(&self, request: &IntentRequest) -> Result<IntentResult, IntentError> {
        #[derive(Deserialize)]
        struct GenerateReply {
            response: Option<String>,
        }

        let payload = serde_json::json!({
            "model": self.model,
            "prompt": Self::prompt(request)?,
            "stream": false,
            "options": {"num_predict": LOCAL_MAX_TOKENS},
        });
        let http_request = hyper::Request::post(format!("{}/api/generate", self.endpoint))
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(payload.to_string())))
            .map_err(|e| IntentError::Backend(e.to_string()))?;

        let response = self
            .client
            .request(http_request)
            .await
            .map_err(|e| IntentError::Backend(e.to_string()))?;
        if !response.status().is_success() {
            return Err(IntentError::Backend(format!(
                "Local model answered with status {}",
                response.status()
            )));
        }
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| IntentError::Backend(e.to_string()))?
            .to_bytes();
        let reply: GenerateReply =
            serde_json::from_slice(&body).map_err(|e| IntentError::Backend(e.to_string()))?;

        Ok(parse_intent_response(
            reply.response.as_deref().unwrap_or("{}"),
            "local_model",
            &self.model,
        ))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend returning a fixed score.
    pub(crate) struct FixedAnalyzer {
        pub score: u8,
        pub calls: AtomicUsize,
        pub delay: Duration,
    }

    impl FixedAnalyzer {
        pub(crate) fn new(score: u8) -> Self {
            Self {
                score,
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl IntentAnalyzer for FixedAnalyzer {
        fn model(&self) -> &str {
            "fixed"
        }

        async fn analyze(&self, _request: &IntentRequest) -> Result<IntentResult, IntentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(IntentResult {
                provider: "test".into(),
                model: self.model().into(),
                mismatch_score: self.score,
                reasoning: "fixed".into(),
            })
        }
    }

    fn request(threat_score: u8) -> IntentRequest {
        IntentRequest {
            agent_name: "cursor".into(),
            declared_purpose: Some("code completion".into()),
            method: "POST".into(),
            url: "https://paste.example.test/upload".into(),
            domain: "paste.example.test".into(),
            body_size: 10,
            body_preview: "hello".into(),
            secret_types: vec![],
            is_first_contact: true,
            threat_score,
        }
    }

    #[test]
    fn test_parse_json_reply() {
        let result = parse_intent_response(
            r#"{"mismatchScore": 140, "reasoning": "Uploads source to a paste site."}"#,
            "remote_api",
            "m",
        );
        assert_eq!(result.mismatch_score, 100);
        assert_eq!(result.reasoning, "Uploads source to a paste site.");
    }

    #[test]
    fn test_parse_free_text_reply() {
        let result = parse_intent_response("Score: 72 - suspicious", "local_model", "m");
        assert_eq!(result.mismatch_score, 72);
        assert!(result.is_mismatch());

        let result = parse_intent_response("no idea", "local_model", "m");
        assert_eq!(result.mismatch_score, 50);
        assert_eq!(result.reasoning, "no idea");
    }

    #[tokio::test]
    async fn test_disabled_never_analyzes() {
        let service = IntentService::disabled();
        assert!(service.maybe_analyze(&request(99)).await.is_none());
    }

    #[tokio::test]
    async fn test_threshold_gates_analysis() {
        let backend = Arc::new(FixedAnalyzer::new(80));
        let service = IntentService::new(
            IntentProvider::RemoteApi(backend.clone()),
            DEFAULT_THRESHOLD,
            DEFAULT_TIMEOUT,
        );

        assert!(service.maybe_analyze(&request(30)).await.is_none());
        let result = service.maybe_analyze(&request(31)).await.unwrap();
        assert!(result.is_mismatch());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_passes_through() {
        let mut backend = FixedAnalyzer::new(90);
        backend.delay = Duration::from_millis(200);
        let service = IntentService::new(
            IntentProvider::LocalModel(Arc::new(backend)),
            0,
            Duration::from_millis(20),
        );
        assert!(service.maybe_analyze(&request(50)).await.is_none());
    }

    #[tokio::test]
    async fn test_call_budget() {
        let service = IntentService::new(
            IntentProvider::RemoteApi(Arc::new(FixedAnalyzer::new(10))),
            0,
            DEFAULT_TIMEOUT,
        );
        for _ in 0..MAX_CALLS_PER_MINUTE {
            assert!(service.maybe_analyze(&request(50)).await.is_some());
        }
        assert!(service.maybe_analyze(&request(50)).await.is_none());
    }

    #[test]
    fn test_preview_truncates() {
        let body = "x".repeat(2000);
        assert_eq!(IntentRequest::preview(body.as_bytes()).len(), BODY_PREVIEW_CHARS);
    }

    #[test]
    fn test_local_model_requires_http_endpoint() {
        assert!(LocalModelAnalyzer::new("https://models.example.test", "m").is_err());
        let analyzer = LocalModelAnalyzer::new("http://127.0.0.1:11434/", "llama3.1:8b").unwrap();
        assert_eq!(analyzer.endpoint, "http://127.0.0.1:11434");
        assert_eq!(analyzer.model(), "llama3.1:8b");
    }

    #[test]
    fn test_local_model_prompt_carries_manifest() {
        let prompt = LocalModelAnalyzer::prompt(&request(40)).unwrap();
        assert!(prompt.contains("mismatchScore"));
        assert!(prompt.contains("\"declaredPurpose\": \"code completion\""));
    }
}
