//! Operator actions on domains and agents.
//!
//! Each action is recorded in the audit ledger alongside the decisions it
//! affects.

use super::RequestInterceptor;
use crate::agents::AgentRecord;
use crate::audit::{AuditEventType, NewAuditEntry};
use crate::domains::DomainRecord;
use crate::storage::StorageResult;
use crate::telemetry::{TelemetryEvent, TelemetryEventType};
use serde_json::{Value, json};
use tracing::{error, info};

impl RequestInterceptor {
    /// Allow a domain from now on, overriding policy.
    pub fn approve_domain(&self, domain: &str) -> StorageResult<DomainRecord> {
        let record = self.services.domains.approve_domain(domain)?;
        info!(domain = %record.domain, "Domain approved");
        self.audit_admin(
            AuditEventType::DomainApproved,
            None,
            json!({"domain": record.domain}),
        );
        self.services.telemetry.report(
            TelemetryEvent::new(TelemetryEventType::NewDomainApproved, "allow")
                .domain(record.domain.clone()),
        );
        Ok(record)
    }

    /// Deny a domain from now on, overriding policy.
    pub fn deny_domain(&self, domain: &str) -> StorageResult<DomainRecord> {
        let record = self.services.domains.deny_domain(domain)?;
        info!(domain = %record.domain, "Domain denied");
        self.audit_admin(
            AuditEventType::DomainDenied,
            None,
            json!({"domain": record.domain}),
        );
        Ok(record)
    }

    /// Block every further request from an agent. `None` if the agent has
    /// never been seen.
    pub fn kill_agent(&self, id: &str) -> StorageResult<Option<AgentRecord>> {
        let record = self.services.registry.kill(id)?;
        if let Some(agent) = &record {
            info!(agent = %agent.id, "Agent killed");
            self.audit_admin(
                AuditEventType::AgentKilled,
                Some(&agent.id),
                json!({"name": agent.name}),
            );
        }
        Ok(record)
    }

    pub fn resume_agent(&self, id: &str) -> StorageResult<Option<AgentRecord>> {
        let record = self.services.registry.resume(id)?;
        if let Some(agent) = &record {
            info!(agent = %agent.id, "Agent resumed");
            self.audit_admin(
                AuditEventType::AgentResumed,
                Some(&agent.id),
                json!({"name": agent.name}),
            );
        }
        Ok(record)
    }

    fn audit_admin(&self, event_type: AuditEventType, agent_id: Option<&str>, details: Value) {
        let mut entry = NewAuditEntry::new(event_type, details).decision("user");
        if let Some(id) = agent_id {
            entry = entry.agent(id);
        }
        if let Err(e) = self.services.audit.append(entry) {
            error!(target: "rashomon::ops", event = %event_type, error = %e, "Audit write failed");
        }
    }
}
