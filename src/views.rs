//! Read models for display surfaces.

use crate::agents::{AgentRecord, AgentStatus};
use crate::audit::{AuditEntry, AuditEventType};
use crate::policy::LoadedPolicy;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentView {
    pub id: String,
    pub name: String,
    pub process_name: String,
    pub pid: Option<u32>,
    pub status: AgentStatus,
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub threat_score: u8,
}

impl From<AgentRecord> for AgentView {
    fn from(record: AgentRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            process_name: record.process_name,
            pid: record.pid,
            status: record.status,
            total_requests: record.total_requests,
            blocked_requests: record.blocked_requests,
            threat_score: record.threat_score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyView {
    pub id: String,
    pub name: String,
    pub yaml_content: String,
    /// Loaded documents are always in effect.
    pub enabled: bool,
    pub priority: u32,
    pub rule_count: usize,
}

impl From<&LoadedPolicy> for PolicyView {
    fn from(policy: &LoadedPolicy) -> Self {
        Self {
            id: policy.id.clone(),
            name: policy
                .document
                .name
                .clone()
                .unwrap_or_else(|| policy.id.clone()),
            yaml_content: policy.content.clone(),
            enabled: true,
            priority: policy.priority,
            rule_count: policy.document.rule_count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntryView {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub agent_id: Option<String>,
    pub request_id: Option<String>,
    pub receipt_hash: String,
    pub previous_hash: String,
}

impl From<AuditEntry> for AuditEntryView {
    fn from(entry: AuditEntry) -> Self {
        Self {
            id: entry.id,
            timestamp: entry.timestamp,
            event_type: entry.event_type,
            agent_id: entry.agent_id,
            request_id: entry.request_id,
            receipt_hash: entry.receipt_hash,
            previous_hash: entry.previous_hash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyDocument, PolicyEngine};
    use serde_json::json;

    #[test]
    fn test_policy_view() {
        let source = "name: corporate\nglobal:\n  default_action: allow\ndomains:\n  allowed: [\"a.test\", \"b.test\"]\n  denied: [\"*.c.test\"]\n";
        let doc = PolicyEngine::validate_source(source, crate::policy::PolicyFormat::Yaml).unwrap();
        let engine = PolicyEngine::from_documents(vec![("corp".into(), doc)]);

        let views: Vec<PolicyView> = engine.policies().iter().map(PolicyView::from).collect();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].id, "corp");
        assert_eq!(views[0].name, "corporate");
        assert_eq!(views[0].rule_count, 3);
        assert!(views[0].enabled);

        let value = serde_json::to_value(&views[0]).unwrap();
        assert!(value.get("yamlContent").is_some());
        assert_eq!(value["ruleCount"], 3);
    }

    #[test]
    fn test_policy_view_name_falls_back_to_id() {
        let policy = LoadedPolicy {
            id: "local".into(),
            path: "local.yaml".into(),
            priority: 100,
            content: String::new(),
            document: PolicyDocument::default(),
        };
        assert_eq!(PolicyView::from(&policy).name, "local");
    }

    #[test]
    fn test_agent_view_serializes_camel_case() {
        let view = AgentView {
            id: "agent-1".into(),
            name: "cursor".into(),
            process_name: "Cursor Helper".into(),
            pid: Some(42),
            status: AgentStatus::Killed,
            total_requests: 10,
            blocked_requests: 3,
            threat_score: 55,
        };
        let value = serde_json::to_value(&view).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "agent-1",
                "name": "cursor",
                "processName": "Cursor Helper",
                "pid": 42,
                "status": "killed",
                "totalRequests": 10,
                "blockedRequests": 3,
                "threatScore": 55,
            })
        );
    }
}
