use super::*;
use crate::audit::AuditQuery;
use crate::intent::tests::FixedAnalyzer;
use crate::intent::IntentProvider;
use crate::policy::{PolicyDocument, PolicyFormat};
use std::path::Path;

const BASE_POLICY: &str = r#"
name: test
global:
  default_action: allow
  new_domain_action: require_approval
domains:
  allowed: ["api.example.com", "*.trusted.test"]
  denied: ["*.pastebin.test"]
  require_approval: ["*.webhook.test"]
secrets:
  entropy_detection:
    enabled: false
"#;

fn services(yaml: &str) -> Services {
    let doc = PolicyDocument::parse(yaml, PolicyFormat::Yaml, Path::new("test.yaml")).unwrap();
    let policy = Arc::new(PolicyEngine::from_documents(vec![("test".into(), doc)]));
    let db = Arc::new(Database::open_in_memory().unwrap());
    Services::new(db, policy).unwrap()
}

fn interceptor(yaml: &str) -> RequestInterceptor {
    RequestInterceptor::new(services(yaml))
}

fn from_agent(method: &str, url: &str) -> InterceptRequest {
    InterceptRequest::new(method, url)
        .header(HEADER_AGENT_ID, "agent-1")
        .header(HEADER_AGENT_NAME, "builder")
        .header(HEADER_AGENT_PURPOSE, "dependency updates")
}

fn events(interceptor: &RequestInterceptor, event_type: AuditEventType) -> usize {
    interceptor
        .services()
        .audit
        .query(&AuditQuery {
            event_type: Some(event_type),
            ..Default::default()
        })
        .unwrap()
        .len()
}

#[tokio::test]
async fn test_allowed_request_is_audited_and_finalized() {
    let interceptor = interceptor(BASE_POLICY);

    let decision = interceptor
        .intercept(&from_agent("GET", "https://api.example.com/v1/items"))
        .await;

    assert_eq!(decision.action, DecisionAction::Allow);
    assert_eq!(decision.status_code, 200);
    assert_eq!(decision.agent_id, "agent-1");
    assert_eq!(decision.domain, "api.example.com");
    assert!(decision.receipt_hash.is_some());
    assert_eq!(events(&interceptor, AuditEventType::AgentDetected), 1);
    assert_eq!(events(&interceptor, AuditEventType::RequestAllowed), 1);

    assert_eq!(interceptor.in_flight(), 1);
    interceptor.finalize(&decision.request_id, 200, 512);
    assert_eq!(interceptor.in_flight(), 0);
    assert_eq!(
        interceptor.services().limiter.get_usage("agent-1").concurrent,
        0
    );

    let record = interceptor.services().registry.get("agent-1").unwrap().unwrap();
    assert_eq!(record.total_requests, 1);
    assert_eq!(record.blocked_requests, 0);
}

#[tokio::test]
async fn test_secret_in_body_blocks() {
    let interceptor = interceptor(BASE_POLICY);

    let decision = interceptor
        .intercept(
            &from_agent("POST", "https://api.example.com/upload")
                .body("config: sk_test_abcdefghijklmnop1234"),
        )
        .await;

    assert_eq!(decision.action, DecisionAction::Block);
    assert_eq!(decision.status_code, 403);
    assert_eq!(decision.reason, "Secret detected: Stripe Secret Key");
    assert_eq!(decision.matched_rule.as_deref(), Some("secrets:Stripe Secret Key"));
    assert!(!decision.secrets.is_empty());
    assert!(decision.threat_score >= 35);
    assert_eq!(events(&interceptor, AuditEventType::RequestBlocked), 1);
    // Blocked requests give their concurrency slot back immediately.
    assert_eq!(interceptor.in_flight(), 0);
    assert_eq!(
        interceptor.services().limiter.get_usage("agent-1").concurrent,
        0
    );
}

#[tokio::test]
async fn test_blocking_secret_to_new_domain_is_blocked_not_held() {
    let interceptor = interceptor("name: t\nglobal:\n  default_action: allow\n");

    let decision = interceptor
        .intercept(
            &from_agent("POST", "https://evil.example.com/upload")
                .body("OPENAI_API_KEY=sk_test_1234567890abcdefghijklmnop"),
        )
        .await;

    assert_eq!(decision.action, DecisionAction::Block);
    assert_eq!(decision.status_code, 403);
    assert_eq!(decision.matched_rule.as_deref(), Some("secrets:Stripe Secret Key"));
    assert_eq!(events(&interceptor, AuditEventType::RequestBlocked), 1);
    assert_eq!(events(&interceptor, AuditEventType::ApprovalRequested), 0);

    // Without a secret the same request is held for approval.
    let held = interceptor
        .intercept(&from_agent("POST", "https://evil.example.com/upload").body("hello"))
        .await;
    assert_eq!(held.action, DecisionAction::RequireApproval);
    assert_eq!(held.status_code, 409);
}

#[tokio::test]
async fn test_new_domain_allowed_on_first_contact() {
    let interceptor =
        interceptor(&BASE_POLICY.replace("new_domain_action: require_approval", "new_domain_action: allow"));
    let domains = &interceptor.services().domains;

    let check = domains.check_domain("fresh.example.org").unwrap();
    assert_eq!(check.status, DomainStatus::Unknown);
    assert!(check.is_first_contact);

    let decision = interceptor
        .intercept(&from_agent("GET", "https://fresh.example.org/"))
        .await;
    assert!(decision.is_allowed());
    assert_eq!(decision.status_code, 200);
    assert!(!decision.flagged);

    // The decision recorded the contact.
    assert!(!domains.check_domain("fresh.example.org").unwrap().is_first_contact);
    let again = interceptor
        .intercept(&from_agent("GET", "https://fresh.example.org/"))
        .await;
    assert!(again.is_allowed());
}

#[tokio::test]
async fn test_sweep_forgets_requests_whose_slot_was_reclaimed() {
    let base = services(BASE_POLICY);
    let services = Services {
        limiter: Arc::new(RateLimiter::with_slot_timeout(base.policy.clone(), Duration::ZERO)),
        ..base
    };
    let interceptor = RequestInterceptor::new(services);

    let decision = interceptor
        .intercept(&from_agent("GET", "https://api.example.com/"))
        .await;
    assert!(decision.is_allowed());
    assert_eq!(interceptor.in_flight(), 1);

    interceptor.sweep();
    assert_eq!(interceptor.in_flight(), 0);
    // A late finalize is a no-op.
    interceptor.finalize(&decision.request_id, 200, 0);
    assert_eq!(interceptor.services().limiter.get_usage("agent-1").concurrent, 0);
}

#[tokio::test]
async fn test_log_all_requests_off_trims_allowed_detail() {
    let interceptor = interceptor(&BASE_POLICY.replace(
        "default_action: allow",
        "default_action: allow\n  log_all_requests: false",
    ));
    let detail_url = |event_type| {
        interceptor
            .services()
            .audit
            .query(&AuditQuery {
                event_type: Some(event_type),
                ..Default::default()
            })
            .unwrap()[0]
            .details["url"]
            .clone()
    };

    let allowed = interceptor
        .intercept(&from_agent("GET", "https://api.example.com/v1/items?page=2"))
        .await;
    assert!(allowed.is_allowed());
    assert_eq!(detail_url(AuditEventType::RequestAllowed), "https://api.example.com");

    let blocked = interceptor
        .intercept(&from_agent("GET", "https://dump.pastebin.test/raw?id=7"))
        .await;
    assert_eq!(blocked.action, DecisionAction::Block);
    assert_eq!(detail_url(AuditEventType::RequestBlocked), "https://dump.pastebin.test/raw?id=7");
}

#[tokio::test]
async fn test_domain_classification() {
    let interceptor = interceptor(BASE_POLICY);

    let denied = interceptor
        .intercept(&from_agent("GET", "https://dump.pastebin.test/raw"))
        .await;
    assert_eq!(denied.action, DecisionAction::Block);
    assert_eq!(denied.matched_rule.as_deref(), Some("*.pastebin.test"));

    let held = interceptor
        .intercept(&from_agent("POST", "https://hooks.webhook.test/x"))
        .await;
    assert_eq!(held.action, DecisionAction::RequireApproval);
    assert_eq!(held.status_code, 409);
    assert_eq!(held.matched_rule.as_deref(), Some("*.webhook.test"));

    let unlisted = interceptor
        .intercept(&from_agent("GET", "https://new.example.org/"))
        .await;
    assert_eq!(unlisted.action, DecisionAction::RequireApproval);
    assert_eq!(unlisted.matched_rule.as_deref(), Some("global:new_domain_action"));
    assert_eq!(events(&interceptor, AuditEventType::ApprovalRequested), 2);
}

#[tokio::test]
async fn test_new_domain_alert_allows_flagged() {
    let interceptor =
        interceptor(&BASE_POLICY.replace("new_domain_action: require_approval", "new_domain_action: alert"));

    let decision = interceptor
        .intercept(&from_agent("GET", "https://new.example.org/"))
        .await;

    assert!(decision.is_allowed());
    assert!(decision.flagged);
}

#[tokio::test]
async fn test_approved_domain_is_allowed() {
    let interceptor = interceptor(BASE_POLICY);
    interceptor
        .approve_domain("new.example.org")
        .unwrap();

    let decision = interceptor
        .intercept(&from_agent("GET", "https://new.example.org/"))
        .await;

    assert!(decision.is_allowed());
    assert_eq!(events(&interceptor, AuditEventType::DomainApproved), 1);
}

#[tokio::test]
async fn test_concurrency_limit_throttles() {
    let policy = format!("{BASE_POLICY}rate_limits:\n  per_agent:\n    max_concurrent: 1\n");
    let interceptor = interceptor(&policy);
    let url = "https://api.example.com/v1/items";

    let first = interceptor.intercept(&from_agent("GET", url)).await;
    assert!(first.is_allowed());

    let second = interceptor.intercept(&from_agent("GET", url)).await;
    assert_eq!(second.action, DecisionAction::Throttle);
    assert_eq!(second.status_code, 429);
    assert_eq!(
        second.matched_rule.as_deref(),
        Some("agent:agent-1:concurrent")
    );
    assert_eq!(events(&interceptor, AuditEventType::RequestThrottled), 1);

    interceptor.finalize(&first.request_id, 200, 0);
    let third = interceptor.intercept(&from_agent("GET", url)).await;
    assert!(third.is_allowed());
}

#[tokio::test]
async fn test_killed_agent_is_blocked_until_resumed() {
    let interceptor = interceptor(BASE_POLICY);
    let url = "https://api.example.com/v1/items";

    let first = interceptor.intercept(&from_agent("GET", url)).await;
    interceptor.finalize(&first.request_id, 200, 0);
    assert!(interceptor.kill_agent("agent-1").unwrap().is_some());

    let blocked = interceptor.intercept(&from_agent("GET", url)).await;
    assert_eq!(blocked.action, DecisionAction::Block);
    assert_eq!(blocked.matched_rule.as_deref(), Some("agent:killed"));

    interceptor.resume_agent("agent-1").unwrap();
    let resumed = interceptor.intercept(&from_agent("GET", url)).await;
    assert!(resumed.is_allowed());
    assert_eq!(events(&interceptor, AuditEventType::AgentKilled), 1);
    assert_eq!(events(&interceptor, AuditEventType::AgentResumed), 1);
}

#[tokio::test]
async fn test_unknown_agent_on_first_contact() {
    let interceptor = interceptor(&BASE_POLICY.replace("new_domain_action: require_approval", "new_domain_action: allow"));

    let decision = interceptor
        .intercept(&InterceptRequest::new("GET", "https://new.example.org/"))
        .await;

    assert_eq!(decision.action, DecisionAction::RequireApproval);
    assert_eq!(decision.matched_rule.as_deref(), Some("agents:unknown_agent"));
    assert_eq!(decision.agent_name, crate::agents::UNKNOWN_AGENT_NAME);

    // Known, policy-allowed domains are not affected.
    let allowed = interceptor
        .intercept(&InterceptRequest::new("GET", "https://api.example.com/"))
        .await;
    assert!(allowed.is_allowed());
}

#[tokio::test]
async fn test_body_limit() {
    let policy = BASE_POLICY.replace(
        "default_action: allow",
        "default_action: allow\n  max_request_body_bytes: 16",
    );
    let interceptor = interceptor(&policy);

    let decision = interceptor
        .intercept(&from_agent("POST", "https://api.example.com/").body(vec![b'a'; 17]))
        .await;

    assert_eq!(decision.action, DecisionAction::Block);
    assert_eq!(decision.matched_rule.as_deref(), Some("body:max_bytes"));
}

#[tokio::test]
async fn test_default_action_applies_to_unlisted_domains() {
    let interceptor = interceptor(
        &BASE_POLICY
            .replace("default_action: allow", "default_action: block")
            .replace("new_domain_action: require_approval", "new_domain_action: allow"),
    );

    let unlisted = interceptor
        .intercept(&from_agent("GET", "https://unlisted.test/"))
        .await;
    assert_eq!(unlisted.action, DecisionAction::Block);
    assert_eq!(unlisted.matched_rule.as_deref(), Some("policy:default_action"));

    let listed = interceptor
        .intercept(&from_agent("GET", "https://api.example.com/"))
        .await;
    assert_eq!(listed.action, DecisionAction::Allow);
}

#[tokio::test]
async fn test_abandoned_body_is_blocked_on_size() {
    let interceptor = interceptor(BASE_POLICY);

    let decision = interceptor
        .intercept(&from_agent("POST", "https://api.example.com/").body_overflow(64 * 1024 * 1024))
        .await;

    assert_eq!(decision.action, DecisionAction::Block);
    assert_eq!(decision.matched_rule.as_deref(), Some("body:max_bytes"));
    assert!(decision.secrets.is_empty());
    assert_eq!(interceptor.body_limit(), 10 * 1024 * 1024);
}

#[tokio::test]
async fn test_invalid_url_blocks() {
    let interceptor = interceptor(BASE_POLICY);

    let decision = interceptor.intercept(&from_agent("GET", "not a url")).await;

    assert_eq!(decision.action, DecisionAction::Block);
    assert_eq!(decision.matched_rule.as_deref(), Some("request:invalid_url"));
    assert!(decision.receipt_hash.is_some());
}

#[tokio::test]
async fn test_intent_mismatch_requires_approval() {
    let policy = BASE_POLICY.replace(
        "default_action: allow",
        "default_action: allow\n  intent_analysis: true",
    );
    let backend = Arc::new(FixedAnalyzer::new(90));
    let services = Services {
        intent: Arc::new(IntentService::new(
            IntentProvider::RemoteApi(backend.clone()),
            0,
            Duration::from_secs(1),
        )),
        ..services(&policy)
    };
    let interceptor = RequestInterceptor::new(services);

    // First contact with the domain puts the pre-intent score above zero.
    let decision = interceptor
        .intercept(&from_agent("POST", "https://api.example.com/upload").body("hello"))
        .await;

    assert_eq!(decision.action, DecisionAction::RequireApproval);
    assert_eq!(decision.matched_rule.as_deref(), Some("intent:mismatch"));
    assert_eq!(decision.intent.as_ref().map(|i| i.mismatch_score), Some(90));
    assert_eq!(events(&interceptor, AuditEventType::IntentMismatch), 1);
}

#[tokio::test]
async fn test_intent_skipped_when_disabled_in_policy() {
    let backend = Arc::new(FixedAnalyzer::new(90));
    let services = Services {
        intent: Arc::new(IntentService::new(
            IntentProvider::RemoteApi(backend.clone()),
            0,
            Duration::from_secs(1),
        )),
        ..services(BASE_POLICY)
    };
    let interceptor = RequestInterceptor::new(services);

    let decision = interceptor
        .intercept(&from_agent("GET", "https://api.example.com/"))
        .await;

    assert!(decision.is_allowed());
    assert!(decision.intent.is_none());
    assert_eq!(
        backend.calls.load(std::sync::atomic::Ordering::SeqCst),
        0
    );
}

#[tokio::test]
async fn test_every_decision_extends_a_valid_chain() {
    let interceptor = interceptor(BASE_POLICY);

    for url in [
        "https://api.example.com/",
        "https://dump.pastebin.test/",
        "https://hooks.webhook.test/",
        "not a url",
    ] {
        let decision = interceptor.intercept(&from_agent("GET", url)).await;
        interceptor.finalize(&decision.request_id, 200, 0);
    }

    let verification = interceptor.services().audit.verify().unwrap();
    assert!(verification.is_valid());
    // One agent_detected entry plus one decision per request.
    assert_eq!(verification.total_entries, 5);
}

#[test]
fn test_declared_identity_falls_back_to_name() {
    let request = InterceptRequest::new("GET", "https://a.test/")
        .header(HEADER_AGENT_NAME, "cursor")
        .header(HEADER_AGENT_PID, "4242");

    let declared = declared_identity(&request).unwrap();
    assert_eq!(declared.id, "cursor");
    assert_eq!(declared.pid, Some(4242));

    assert!(declared_identity(&InterceptRequest::new("GET", "https://a.test/")).is_none());
}

#[test]
fn test_request_host() {
    assert_eq!(
        request_host("https://API.Example.com.:8443/x").as_deref(),
        Some("api.example.com")
    );
    assert_eq!(request_host("http://[::1]:8080/").as_deref(), Some("::1"));
    assert_eq!(request_host("/relative"), None);
}
