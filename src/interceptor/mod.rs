//! Per-request decision pipeline.
//!
//! [`RequestInterceptor::intercept`] runs the stages in a fixed order and
//! stops at the first one that triggers:
//!
//! 1. identify the agent (declared headers, else the connection's process)
//! 2. killed agents and oversized bodies
//! 3. domain classification; a domain held for approval is still scanned so
//!    that a blocking secret turns the hold into a block
//! 4. rate limits
//! 5. secret scan
//! 6. intent analysis, when enabled
//! 7. the policy's default action
//!
//! Whatever the outcome, exactly one decision entry is appended to the audit
//! ledger before the decision is returned. An audit failure is reported on
//! the `rashomon::ops` target and does not hold up the decision.

mod admin;
mod decision;

pub use decision::{DecisionAction, InterceptDecision, InterceptRequest, Protocol};

use crate::agents::{AgentDetector, AgentRegistry, DeclaredIdentity, DetectedAgent};
use crate::audit::{AuditEventType, AuditLog, NewAuditEntry};
use crate::domains::{DomainCheck, DomainManager, DomainStatus};
use crate::intent::{IntentRequest, IntentResult, IntentService};
use crate::policy::{PolicyAction, PolicyEngine, PolicySnapshot};
use crate::ratelimit::{RateLimiter, SlotId};
use crate::scanner::{ScanOutcome, ScannerError, SecretMatch, SecretScanner};
use crate::storage::Database;
use crate::telemetry::{TelemetryEvent, TelemetryEventType, TelemetryReporter};
use decision::{LARGE_BODY_BYTES, ThreatFactors};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Identification headers set by the agent SDK.
pub const HEADER_AGENT_ID: &str = "x-rashomon-agent-id";
pub const HEADER_AGENT_NAME: &str = "x-rashomon-agent-name";
pub const HEADER_PROCESS_NAME: &str = "x-rashomon-process-name";
pub const HEADER_AGENT_PID: &str = "x-rashomon-agent-pid";
pub const HEADER_AGENT_PURPOSE: &str = "x-rashomon-agent-purpose";

/// Default bound on a process lookup.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_millis(500);

/// Components the pipeline consults.
#[derive(Clone)]
pub struct Services {
    pub policy: Arc<PolicyEngine>,
    pub detector: Arc<AgentDetector>,
    pub registry: Arc<AgentRegistry>,
    pub domains: Arc<DomainManager>,
    pub limiter: Arc<RateLimiter>,
    pub scanner: Arc<SecretScanner>,
    pub intent: Arc<IntentService>,
    pub audit: Arc<AuditLog>,
    pub telemetry: Arc<TelemetryReporter>,
}

impl Services {
    /// Default components over one database and policy engine: host process
    /// lookup, intent analysis and telemetry disabled.
    pub fn new(db: Arc<Database>, policy: Arc<PolicyEngine>) -> Result<Self, ScannerError> {
        Ok(Self {
            detector: Arc::new(AgentDetector::new(policy.clone())),
            registry: Arc::new(AgentRegistry::new(db.clone())),
            domains: Arc::new(DomainManager::new(db.clone(), policy.clone())),
            limiter: Arc::new(RateLimiter::new(policy.clone())),
            scanner: Arc::new(SecretScanner::new(policy.clone())?),
            intent: Arc::new(IntentService::disabled()),
            audit: Arc::new(AuditLog::new(db)),
            telemetry: Arc::new(TelemetryReporter::disabled()),
            policy,
        })
    }
}

/// An allowed request whose concurrency slot is still held.
struct PendingRequest {
    agent_id: String,
    slot: Option<SlotId>,
    started: Instant,
}

/// The stage that produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Request,
    Agent,
    BodySize,
    Domain,
    RateLimit,
    Secrets,
    Intent,
    Default,
}

impl Stage {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Agent => "agent",
            Self::BodySize => "body_size",
            Self::Domain => "domain",
            Self::RateLimit => "rate_limit",
            Self::Secrets => "secrets",
            Self::Intent => "intent",
            Self::Default => "default",
        }
    }
}

/// A stage's verdict.
struct Verdict {
    action: DecisionAction,
    stage: Stage,
    reason: String,
    rule: Option<String>,
}

impl Verdict {
    fn new(action: DecisionAction, stage: Stage, reason: impl Into<String>, rule: Option<String>) -> Self {
        Self {
            action,
            stage,
            reason: reason.into(),
            rule,
        }
    }
}

/// Everything learned about a request on its way through the stages.
struct Evaluation {
    agent: DetectedAgent,
    domain: String,
    body_size: u64,
    domain_check: Option<DomainCheck>,
    slot_reserved: bool,
    slot: Option<SlotId>,
    rate_limited: bool,
    secrets: Vec<SecretMatch>,
    flagged: bool,
    intent: Option<IntentResult>,
    /// Keep the full URL of plain allowed requests.
    log_all_requests: bool,
}

impl Evaluation {
    /// An allowed request nothing flagged.
    fn is_routine(&self, action: DecisionAction) -> bool {
        action == DecisionAction::Allow && !self.flagged
    }

    fn factors(&self) -> ThreatFactors {
        let status = self.domain_check.as_ref().map(|c| c.status);
        ThreatFactors {
            secrets: self.secrets.len(),
            first_contact: self.domain_check.as_ref().is_some_and(|c| c.is_first_contact),
            body_size: self.body_size,
            rate_limited: self.rate_limited,
            intent_mismatch: self.intent.as_ref().map(|i| i.mismatch_score),
            denied_domain: status == Some(DomainStatus::Denied),
            pending_domain: status == Some(DomainStatus::PendingApproval),
        }
    }
}

/// Runs every proxied request through policy.
pub struct RequestInterceptor {
    services: Services,
    pending: Mutex<HashMap<String, PendingRequest>>,
    lookup_timeout: Duration,
}

impl RequestInterceptor {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            pending: Mutex::new(HashMap::new()),
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Largest request body any agent may send under the current policy.
    pub fn body_limit(&self) -> u64 {
        self.services.policy.snapshot().policy.global.max_request_body_bytes
    }

    /// Decide one request.
    pub async fn intercept(&self, request: &InterceptRequest) -> InterceptDecision {
        let snapshot = self.services.policy.snapshot();
        let agent = self.identify(request).await;

        let Some(domain) = request_host(&request.url) else {
            let eval = self.evaluation(&snapshot, agent, String::new(), request);
            let verdict = Verdict::new(
                DecisionAction::Block,
                Stage::Request,
                format!("Invalid request URL '{}'", request.url),
                Some("request:invalid_url".into()),
            );
            return self.conclude(request, eval, verdict);
        };

        let mut eval = self.evaluation(&snapshot, agent, domain, request);
        let verdict = self.evaluate(request, &snapshot, &mut eval).await;
        self.conclude(request, eval, verdict)
    }

    /// Release the concurrency slot of an allowed request once its response
    /// has been relayed. Unknown ids are ignored.
    pub fn finalize(&self, request_id: &str, response_status: u16, response_bytes: u64) {
        let Some(pending) = self.pending.lock().remove(request_id) else {
            return;
        };
        self.release_slot(&pending.agent_id, pending.slot);
        debug!(
            request_id,
            status = response_status,
            bytes = response_bytes,
            elapsed_ms = pending.started.elapsed().as_millis() as u64,
            "Request finalized"
        );
    }

    /// Allowed requests not yet finalized.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    /// Periodic housekeeping: sweep idle rate-limit keys and forget pending
    /// requests whose slot the limiter has already reclaimed.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.services.limiter.sweep(now);
        let max_age = self.services.limiter.slot_timeout();
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, p| now.duration_since(p.started) < max_age);
        let dropped = before - pending.len();
        if dropped > 0 {
            debug!(dropped, "Dropped abandoned pending requests");
        }
    }

    fn release_slot(&self, agent_id: &str, slot: Option<SlotId>) {
        if let Some(slot) = slot {
            self.services.limiter.release(agent_id, slot);
        }
    }

    fn evaluation(
        &self,
        snapshot: &PolicySnapshot,
        agent: DetectedAgent,
        domain: String,
        request: &InterceptRequest,
    ) -> Evaluation {
        Evaluation {
            agent,
            domain,
            body_size: request.body_size(),
            domain_check: None,
            slot_reserved: false,
            slot: None,
            rate_limited: false,
            secrets: Vec::new(),
            flagged: false,
            intent: None,
            log_all_requests: snapshot.policy.global.log_all_requests,
        }
    }

    async fn evaluate(
        &self,
        request: &InterceptRequest,
        snapshot: &PolicySnapshot,
        eval: &mut Evaluation,
    ) -> Verdict {
        let policy = &snapshot.policy;

        match self.services.registry.is_killed(&eval.agent.id) {
            Ok(true) => {
                return Verdict::new(
                    DecisionAction::Block,
                    Stage::Agent,
                    format!("Agent '{}' has been killed", eval.agent.name),
                    Some("agent:killed".into()),
                );
            }
            Ok(false) => {}
            Err(e) => {
                error!(target: "rashomon::ops", agent = %eval.agent.id, error = %e, "Agent status lookup failed");
                return Verdict::new(
                    DecisionAction::Block,
                    Stage::Agent,
                    "Agent status unavailable",
                    Some("agent:lookup_failed".into()),
                );
            }
        }

        let max_body = policy
            .global
            .max_request_body_bytes
            .min(eval.agent.max_body_bytes);
        if eval.body_size > max_body {
            return Verdict::new(
                DecisionAction::Block,
                Stage::BodySize,
                format!("Request body of {} bytes exceeds limit of {max_body}", eval.body_size),
                Some("body:max_bytes".into()),
            );
        }

        match self.check_domain(snapshot, eval) {
            Some(verdict) if verdict.action == DecisionAction::RequireApproval => {
                // A blocking secret outranks a pending approval.
                return match self.scan_secrets(request, eval) {
                    Some(blocked) if blocked.action == DecisionAction::Block => blocked,
                    _ => verdict,
                };
            }
            Some(verdict) => return verdict,
            None => {}
        }

        let rate = self
            .services
            .limiter
            .check_limit(&eval.agent.id, &eval.domain);
        if !rate.allowed {
            eval.rate_limited = true;
            return Verdict::new(DecisionAction::Throttle, Stage::RateLimit, rate.reason, rate.exceeded_key);
        }
        eval.slot_reserved = true;
        eval.slot = rate.slot;

        if let Some(verdict) = self.scan_secrets(request, eval) {
            return verdict;
        }

        if policy.global.intent_analysis
            && let Some(verdict) = self.analyze_intent(request, eval).await
        {
            return verdict;
        }

        let explicitly_allowed = eval
            .domain_check
            .as_ref()
            .is_some_and(|check| check.status == DomainStatus::Allowed);
        if explicitly_allowed {
            return Verdict::new(
                DecisionAction::Allow,
                Stage::Default,
                "Request complies with active policy",
                None,
            );
        }

        // Domains no rule or decision names fall to the default action.
        match policy.global.default_action {
            PolicyAction::Allow | PolicyAction::Alert => Verdict::new(
                DecisionAction::Allow,
                Stage::Default,
                "Request complies with active policy",
                None,
            ),
            PolicyAction::Block => Verdict::new(
                DecisionAction::Block,
                Stage::Default,
                "Blocked by default policy action",
                Some("policy:default_action".into()),
            ),
            PolicyAction::RequireApproval => Verdict::new(
                DecisionAction::RequireApproval,
                Stage::Default,
                "Default policy action requires approval",
                Some("policy:default_action".into()),
            ),
        }
    }

    fn check_domain(&self, snapshot: &PolicySnapshot, eval: &mut Evaluation) -> Option<Verdict> {
        let check = match self
            .services
            .domains
            .check_domain_for(&eval.domain, Some(&eval.agent.allowed_domains_extra))
        {
            Ok(check) => check,
            Err(e) => {
                error!(target: "rashomon::ops", domain = %eval.domain, error = %e, "Domain lookup failed");
                return Some(Verdict::new(
                    DecisionAction::Block,
                    Stage::Domain,
                    "Domain status unavailable",
                    Some("domain:lookup_failed".into()),
                ));
            }
        };
        let rule = check.matched_rule.clone();
        let first_contact = check.is_first_contact;
        let status = check.status;
        eval.domain_check = Some(check);

        let domain = &eval.domain;
        match status {
            DomainStatus::Allowed => None,
            DomainStatus::Denied => Some(Verdict::new(
                DecisionAction::Block,
                Stage::Domain,
                format!("Domain {domain} is denied"),
                rule,
            )),
            DomainStatus::PendingApproval => Some(Verdict::new(
                DecisionAction::RequireApproval,
                Stage::Domain,
                format!("Domain {domain} requires approval"),
                rule,
            )),
            DomainStatus::Unknown => {
                let policy = &snapshot.policy;
                if eval.agent.is_unknown() && first_contact {
                    match policy.agents.unknown_agent.action {
                        PolicyAction::Block => {
                            return Some(Verdict::new(
                                DecisionAction::Block,
                                Stage::Domain,
                                format!("Unidentified agent contacting new domain {domain}"),
                                Some("agents:unknown_agent".into()),
                            ));
                        }
                        PolicyAction::RequireApproval => {
                            return Some(Verdict::new(
                                DecisionAction::RequireApproval,
                                Stage::Domain,
                                format!("Unidentified agent contacting new domain {domain} requires approval"),
                                Some("agents:unknown_agent".into()),
                            ));
                        }
                        PolicyAction::Allow | PolicyAction::Alert => {}
                    }
                }
                match policy.global.new_domain_action {
                    PolicyAction::Allow => None,
                    PolicyAction::Alert => {
                        eval.flagged = true;
                        None
                    }
                    PolicyAction::Block => Some(Verdict::new(
                        DecisionAction::Block,
                        Stage::Domain,
                        format!("Unlisted domain {domain} is blocked"),
                        Some("global:new_domain_action".into()),
                    )),
                    PolicyAction::RequireApproval => Some(Verdict::new(
                        DecisionAction::RequireApproval,
                        Stage::Domain,
                        format!("New domain {domain} requires approval"),
                        Some("global:new_domain_action".into()),
                    )),
                }
            }
        }
    }

    fn scan_secrets(&self, request: &InterceptRequest, eval: &mut Evaluation) -> Option<Verdict> {
        let matches = match self.services.scanner.scan_request(&request.headers, &request.body) {
            ScanOutcome::Complete(matches) => matches,
            ScanOutcome::Inconclusive { bytes, limit } => {
                return Some(Verdict::new(
                    DecisionAction::Block,
                    Stage::Secrets,
                    format!("Inconclusive scan: {bytes} bytes exceeds scan limit of {limit}"),
                    Some("secrets:inconclusive".into()),
                ));
            }
        };
        eval.secrets = matches;

        let types_with = |action: PolicyAction| -> Vec<&str> {
            let mut types: Vec<&str> = Vec::new();
            for m in eval.secrets.iter().filter(|m| m.action == action) {
                if !types.contains(&m.secret_type.as_str()) {
                    types.push(m.secret_type.as_str());
                }
            }
            types
        };

        let blocking = types_with(PolicyAction::Block);
        if let Some(first) = blocking.first() {
            return Some(Verdict::new(
                DecisionAction::Block,
                Stage::Secrets,
                format!("Secret detected: {}", blocking.join(", ")),
                Some(format!("secrets:{first}")),
            ));
        }
        let held = types_with(PolicyAction::RequireApproval);
        if let Some(first) = held.first() {
            return Some(Verdict::new(
                DecisionAction::RequireApproval,
                Stage::Secrets,
                format!("Secret requires approval: {}", held.join(", ")),
                Some(format!("secrets:{first}")),
            ));
        }
        if !eval.secrets.is_empty() {
            eval.flagged = true;
        }
        None
    }

    async fn analyze_intent(&self, request: &InterceptRequest, eval: &mut Evaluation) -> Option<Verdict> {
        let intent_request = IntentRequest {
            agent_name: eval.agent.name.clone(),
            declared_purpose: eval.agent.declared_purpose.clone(),
            method: request.method.clone(),
            url: request.url.clone(),
            domain: eval.domain.clone(),
            body_size: eval.body_size,
            body_preview: IntentRequest::preview(&request.body),
            secret_types: eval.secrets.iter().map(|m| m.secret_type.clone()).collect(),
            is_first_contact: eval.domain_check.as_ref().is_some_and(|c| c.is_first_contact),
            threat_score: eval.factors().score(),
        };

        let result = self.services.intent.maybe_analyze(&intent_request).await?;
        let verdict = result.is_mismatch().then(|| {
            Verdict::new(
                DecisionAction::RequireApproval,
                Stage::Intent,
                format!("Intent mismatch: {}", result.reasoning),
                Some("intent:mismatch".into()),
            )
        });
        eval.intent = Some(result);
        verdict
    }

    /// Record the decision everywhere it needs to go and build the reply.
    fn conclude(&self, request: &InterceptRequest, eval: Evaluation, verdict: Verdict) -> InterceptDecision {
        let request_id = Uuid::new_v4().to_string();
        let threat_score = eval.factors().score();
        let action = verdict.action;

        if action != DecisionAction::Allow {
            self.release_slot(&eval.agent.id, eval.slot);
        }

        let receipt_hash = self.record_audit(request, &eval, &verdict, &request_id, threat_score);

        if let Err(e) = self.services.registry.record_request(
            &eval.agent.id,
            action != DecisionAction::Allow,
            threat_score,
        ) {
            warn!(target: "rashomon::ops", agent = %eval.agent.id, error = %e, "Failed to update agent counters");
        }

        if !eval.domain.is_empty() {
            let status = eval.domain_check.as_ref().map(|c| c.status);
            if let Err(e) = self.services.domains.record_domain_contact(&eval.domain, status) {
                warn!(target: "rashomon::ops", domain = %eval.domain, error = %e, "Failed to record domain contact");
            }
        }

        self.report_telemetry(request, &eval, &verdict, threat_score);

        if action == DecisionAction::Allow && eval.slot_reserved {
            self.track_pending(&request_id, &eval);
        }

        if eval.log_all_requests || !eval.is_routine(action) {
            info!(
                request_id = %request_id,
                agent = %eval.agent.name,
                domain = %eval.domain,
                action = %action,
                stage = verdict.stage.as_str(),
                threat_score,
                "Request decided"
            );
        } else {
            debug!(request_id = %request_id, domain = %eval.domain, "Request allowed");
        }

        InterceptDecision {
            request_id,
            action,
            status_code: action.status_code(),
            reason: verdict.reason,
            matched_rule: verdict.rule,
            agent_id: eval.agent.id,
            agent_name: eval.agent.name,
            domain: eval.domain,
            threat_score,
            secrets: eval.secrets,
            flagged: eval.flagged,
            intent: eval.intent,
            receipt_hash,
        }
    }

    fn record_audit(
        &self,
        request: &InterceptRequest,
        eval: &Evaluation,
        verdict: &Verdict,
        request_id: &str,
        threat_score: u8,
    ) -> Option<String> {
        let event_type = match verdict.action {
            DecisionAction::Allow if eval.flagged && !eval.secrets.is_empty() => AuditEventType::SecretDetected,
            DecisionAction::Allow => AuditEventType::RequestAllowed,
            DecisionAction::Block => AuditEventType::RequestBlocked,
            DecisionAction::Throttle => AuditEventType::RequestThrottled,
            DecisionAction::RequireApproval if verdict.stage == Stage::Intent => AuditEventType::IntentMismatch,
            DecisionAction::RequireApproval => AuditEventType::ApprovalRequested,
        };
        let secrets: Vec<_> = eval
            .secrets
            .iter()
            .map(|m| json!({"type": m.secret_type, "location": m.location, "encoding": m.encoding, "redacted": m.redacted}))
            .collect();
        let url = if eval.log_all_requests || !eval.is_routine(verdict.action) {
            request.url.clone()
        } else {
            url_origin(&request.url)
        };
        let details = json!({
            "method": request.method,
            "url": url,
            "protocol": request.protocol.as_str(),
            "domain": eval.domain,
            "agentName": eval.agent.name,
            "stage": verdict.stage.as_str(),
            "reason": verdict.reason,
            "rule": verdict.rule,
            "threatScore": threat_score,
            "bodySize": eval.body_size,
            "secrets": secrets,
            "flagged": eval.flagged,
            "intentScore": eval.intent.as_ref().map(|i| i.mismatch_score),
        });

        let entry = NewAuditEntry::new(event_type, details)
            .agent(eval.agent.id.clone())
            .request(request_id)
            .decision(verdict.action.as_str());
        match self.services.audit.append(entry) {
            Ok(entry) => Some(entry.receipt_hash),
            Err(e) => {
                error!(target: "rashomon::ops", request_id, error = %e, "Audit write failed");
                None
            }
        }
    }

    fn report_telemetry(&self, request: &InterceptRequest, eval: &Evaluation, verdict: &Verdict, threat_score: u8) {
        let telemetry = &self.services.telemetry;
        if !telemetry.is_enabled() {
            return;
        }
        let decision = verdict.action.as_str();
        let base = |event_type| {
            let mut event = TelemetryEvent::new(event_type, decision)
                .domain(eval.domain.clone())
                .agent_name(eval.agent.name.clone())
                .threat_score(threat_score)
                .request(request.method.clone(), eval.body_size);
            if let Some(rule) = &verdict.rule {
                event = event.policy_rule(rule.clone());
            }
            event
        };

        for secret in &eval.secrets {
            let event_type = if secret.secret_type == crate::scanner::SENSITIVE_FILE_TYPE {
                TelemetryEventType::SensitiveFileRead
            } else {
                TelemetryEventType::SecretDetected
            };
            telemetry.report(
                base(event_type)
                    .secret_type(secret.secret_type.clone())
                    .entropy(secret.entropy),
            );
        }

        let first_contact = eval.domain_check.as_ref().is_some_and(|c| c.is_first_contact);
        let event_type = match verdict.stage {
            Stage::RateLimit => Some(TelemetryEventType::RateLimitHit),
            Stage::Intent => Some(TelemetryEventType::IntentMismatch),
            Stage::Domain if first_contact => Some(TelemetryEventType::NewDomainBlocked),
            Stage::Secrets => None,
            _ if verdict.action != DecisionAction::Allow => Some(TelemetryEventType::PolicyViolation),
            _ if eval.body_size > LARGE_BODY_BYTES => Some(TelemetryEventType::VolumeAnomaly),
            _ => None,
        };
        if let Some(event_type) = event_type {
            telemetry.report(base(event_type));
        }
    }

    fn track_pending(&self, request_id: &str, eval: &Evaluation) {
        self.pending.lock().insert(
            request_id.to_string(),
            PendingRequest {
                agent_id: eval.agent.id.clone(),
                slot: eval.slot,
                started: Instant::now(),
            },
        );
    }

    /// Resolve who sent the request. Never fails: anything unresolved is the
    /// unknown agent.
    async fn identify(&self, request: &InterceptRequest) -> DetectedAgent {
        let detector = &self.services.detector;
        let agent = if let Some(declared) = declared_identity(request) {
            detector.declared_agent(&declared)
        } else if let Some(port) = request.source_port {
            let lookup = {
                let detector = Arc::clone(detector);
                tokio::task::spawn_blocking(move || detector.get_process_for_connection(port))
            };
            match tokio::time::timeout(self.lookup_timeout, lookup).await {
                Ok(Ok(Some(process))) => detector.agent_for_process(&process),
                Ok(Ok(None)) => detector.unknown_agent(),
                Ok(Err(e)) => {
                    warn!(port, error = %e, "Process lookup task failed");
                    detector.unknown_agent()
                }
                Err(_) => {
                    warn!(port, timeout_ms = self.lookup_timeout.as_millis() as u64, "Process lookup timed out");
                    detector.unknown_agent()
                }
            }
        } else {
            detector.unknown_agent()
        };

        match self.services.registry.register(&agent) {
            Ok(registration) if registration.is_new => {
                let details = json!({
                    "name": agent.name,
                    "processName": agent.process_name,
                    "processPath": agent.process_path,
                    "pid": agent.pid,
                    "matchedProfile": agent.matched_profile,
                    "source": agent.source,
                });
                if let Err(e) = self.services.audit.append(
                    NewAuditEntry::new(AuditEventType::AgentDetected, details).agent(agent.id.clone()),
                ) {
                    error!(target: "rashomon::ops", agent = %agent.id, error = %e, "Audit write failed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(target: "rashomon::ops", agent = %agent.id, error = %e, "Failed to register agent"),
        }
        agent
    }
}

impl std::fmt::Debug for RequestInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestInterceptor")
            .field("in_flight", &self.in_flight())
            .field("lookup_timeout", &self.lookup_timeout)
            .finish()
    }
}

/// Identity from SDK headers. An id or a name is enough; the id falls back
/// to the name.
fn declared_identity(request: &InterceptRequest) -> Option<DeclaredIdentity> {
    let id = request.header_value(HEADER_AGENT_ID);
    let name = request.header_value(HEADER_AGENT_NAME);
    let id = id.or(name)?.trim().to_string();

    Some(DeclaredIdentity {
        id,
        name: name.map(|n| n.trim().to_string()),
        process_name: request
            .header_value(HEADER_PROCESS_NAME)
            .map(|n| n.trim().to_string()),
        pid: request
            .header_value(HEADER_AGENT_PID)
            .and_then(|p| p.trim().parse().ok())
            .filter(|pid| *pid > 0),
        purpose: request
            .header_value(HEADER_AGENT_PURPOSE)
            .map(|p| p.trim().to_string()),
    })
}

/// Scheme, host and port of a URL, without path or query.
fn url_origin(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(url) => url.origin().ascii_serialization(),
        Err(_) => String::new(),
    }
}

/// Lowercase host of an absolute URL.
fn request_host(raw: &str) -> Option<String> {
    let url = url::Url::parse(raw).ok()?;
    let host = url.host_str()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Some(host.trim_end_matches('.').to_ascii_lowercase())
}

#[cfg(test)]
mod tests;
