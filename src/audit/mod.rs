//! Tamper-evident audit ledger.
//!
//! Every decision and lifecycle event is appended as one [`AuditEntry`]
//! whose `receipt_hash` covers its content and the previous entry's hash.
//! Appends read the chain tail and insert the new entry while holding the
//! database connection, so concurrent callers can never fork the chain.

mod chain;
mod export;

pub use chain::GENESIS_HASH;
pub use export::ExportFormat;

use crate::domains::parse_time;
use crate::storage::{Database, StorageError};
use crate::views::AuditEntryView;
use chain::{HashedFields, receipt_hash};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{OptionalExtension, Row, params, params_from_iter};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Errors raised by the audit ledger.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The ledger could not be read or written.
    #[error("Audit storage error: {0}")]
    Storage(#[from] StorageError),

    /// Entry details could not be encoded.
    #[error("Failed to encode audit details: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for AuditError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(StorageError::Query(err))
    }
}

/// Result type for audit operations.
pub type AuditResult<T> = Result<T, AuditError>;

/// Kinds of ledger entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    RequestAllowed,
    RequestBlocked,
    RequestThrottled,
    ApprovalRequested,
    AgentDetected,
    AgentKilled,
    AgentResumed,
    PolicyLoaded,
    PolicyReloaded,
    SecretDetected,
    IntentMismatch,
    DomainApproved,
    DomainDenied,
    SystemStarted,
    SystemStopped,
}

impl AuditEventType {
    pub const ALL: [AuditEventType; 15] = [
        Self::RequestAllowed,
        Self::RequestBlocked,
        Self::RequestThrottled,
        Self::ApprovalRequested,
        Self::AgentDetected,
        Self::AgentKilled,
        Self::AgentResumed,
        Self::PolicyLoaded,
        Self::PolicyReloaded,
        Self::SecretDetected,
        Self::IntentMismatch,
        Self::DomainApproved,
        Self::DomainDenied,
        Self::SystemStarted,
        Self::SystemStopped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestAllowed => "request_allowed",
            Self::RequestBlocked => "request_blocked",
            Self::RequestThrottled => "request_throttled",
            Self::ApprovalRequested => "approval_requested",
            Self::AgentDetected => "agent_detected",
            Self::AgentKilled => "agent_killed",
            Self::AgentResumed => "agent_resumed",
            Self::PolicyLoaded => "policy_loaded",
            Self::PolicyReloaded => "policy_reloaded",
            Self::SecretDetected => "secret_detected",
            Self::IntentMismatch => "intent_mismatch",
            Self::DomainApproved => "domain_approved",
            Self::DomainDenied => "domain_denied",
            Self::SystemStarted => "system_started",
            Self::SystemStopped => "system_stopped",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown audit event type '{s}'"))
    }
}

/// An entry about to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEntry {
    pub event_type: AuditEventType,
    pub agent_id: Option<String>,
    pub request_id: Option<String>,
    pub decision: Option<String>,
    pub details: Value,
}

impl NewAuditEntry {
    pub fn new(event_type: AuditEventType, details: Value) -> Self {
        Self {
            event_type,
            agent_id: None,
            request_id: None,
            decision: None,
            details,
        }
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn decision(mut self, decision: impl Into<String>) -> Self {
        self.decision = Some(decision.into());
        self
    }
}

/// A stored, immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub agent_id: Option<String>,
    pub request_id: Option<String>,
    pub decision: Option<String>,
    pub details: Value,
    pub previous_hash: String,
    pub receipt_hash: String,
}

/// Filters for [`AuditLog::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub event_type: Option<AuditEventType>,
    pub agent_id: Option<String>,
    pub decision: Option<String>,
    /// Inclusive lower bound.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Result of an end-to-end chain check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainVerification {
    pub total_entries: usize,
    /// First entry whose hash does not verify.
    pub first_broken: Option<String>,
    /// Every entry that does not verify, in chain order.
    pub broken: Vec<String>,
}

impl ChainVerification {
    pub fn is_valid(&self) -> bool {
        self.broken.is_empty()
    }
}

/// Append-only, hash-chained ledger.
#[derive(Debug)]
pub struct AuditLog {
    db: Arc<Database>,
}

const COLUMNS: &str =
    "id, timestamp, event_type, agent_id, request_id, decision, details, previous_hash, receipt_hash";

impl AuditLog {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append an entry to the chain tail.
    pub fn append(&self, entry: NewAuditEntry) -> AuditResult<AuditEntry> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let timestamp = format_time(now);
        let details = serde_json::to_string(&entry.details)?;

        let (previous_hash, receipt) = self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let previous_hash: String = tx
                .query_row(
                    "SELECT receipt_hash FROM audit_log ORDER BY seq DESC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or_else(|| GENESIS_HASH.to_string());

            let receipt = receipt_hash(
                &previous_hash,
                &HashedFields {
                    id: &id,
                    timestamp: &timestamp,
                    event_type: entry.event_type.as_str(),
                    agent_id: entry.agent_id.as_deref(),
                    request_id: entry.request_id.as_deref(),
                    decision: entry.decision.as_deref(),
                    details: &details,
                },
            );

            tx.execute(
                "INSERT INTO audit_log (id, timestamp, event_type, agent_id, request_id, decision, details, previous_hash, receipt_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id,
                    timestamp,
                    entry.event_type.as_str(),
                    entry.agent_id,
                    entry.request_id,
                    entry.decision,
                    details,
                    previous_hash,
                    receipt,
                ],
            )?;
            tx.commit()?;
            Ok((previous_hash, receipt))
        })?;

        debug!(id = %id, event = %entry.event_type, "Appended audit entry");
        Ok(AuditEntry {
            id,
            timestamp: now,
            event_type: entry.event_type,
            agent_id: entry.agent_id,
            request_id: entry.request_id,
            decision: entry.decision,
            details: entry.details,
            previous_hash,
            receipt_hash: receipt,
        })
    }

    /// Recompute the whole chain from genesis.
    ///
    /// Each entry is checked against the hash recomputed for its predecessor,
    /// not the stored one, so a modified entry also fails every entry after it.
    pub fn verify(&self) -> AuditResult<ChainVerification> {
        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM audit_log ORDER BY seq ASC"
            ))?;
            let rows = stmt
                .query_map([], RawEntry::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let mut expected_previous = GENESIS_HASH.to_string();
        let mut broken = Vec::new();
        for row in &rows {
            let recomputed = receipt_hash(&expected_previous, &row.hashed_fields());
            if row.previous_hash != expected_previous || row.receipt_hash != recomputed {
                broken.push(row.id.clone());
            }
            expected_previous = recomputed;
        }

        if let Some(first) = broken.first() {
            warn!(first_broken = %first, count = broken.len(), "Audit chain verification failed");
        }
        Ok(ChainVerification {
            total_entries: rows.len(),
            first_broken: broken.first().cloned(),
            broken,
        })
    }

    /// Entries matching `filter`, ordered by timestamp.
    pub fn query(&self, filter: &AuditQuery) -> AuditResult<Vec<AuditEntry>> {
        let mut clauses = Vec::new();
        let mut values: Vec<String> = Vec::new();
        let mut push = |clause: &str, value: String| {
            values.push(value);
            clauses.push(format!("{clause} ?{}", values.len()));
        };

        if let Some(event_type) = filter.event_type {
            push("event_type =", event_type.as_str().to_string());
        }
        if let Some(agent_id) = &filter.agent_id {
            push("agent_id =", agent_id.clone());
        }
        if let Some(decision) = &filter.decision {
            push("decision =", decision.clone());
        }
        if let Some(since) = filter.since {
            push("timestamp >=", format_time(since));
        }
        if let Some(until) = filter.until {
            push("timestamp <", format_time(until));
        }

        let mut sql = format!("SELECT {COLUMNS} FROM audit_log");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY timestamp ASC, seq ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), RawEntry::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(RawEntry::decode).collect()
    }

    /// The most recent `limit` entries, newest first.
    pub fn recent(&self, limit: usize) -> AuditResult<Vec<AuditEntryView>> {
        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM audit_log ORDER BY seq DESC LIMIT ?1"
            ))?;
            let rows = stmt
                .query_map(params![limit as i64], RawEntry::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter()
            .map(|raw| raw.decode().map(AuditEntryView::from))
            .collect()
    }

    /// Render every entry, ordered by timestamp.
    pub fn export(&self, format: ExportFormat) -> AuditResult<String> {
        let entries = self.query(&AuditQuery::default())?;
        export::render(&entries, format)
    }

    pub fn len(&self) -> AuditResult<usize> {
        let count: i64 = self.db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?)
        })?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    pub fn is_empty(&self) -> AuditResult<bool> {
        Ok(self.len()? == 0)
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Row as stored.
struct RawEntry {
    id: String,
    timestamp: String,
    event_type: String,
    agent_id: Option<String>,
    request_id: Option<String>,
    decision: Option<String>,
    details: String,
    previous_hash: String,
    receipt_hash: String,
}

impl RawEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            event_type: row.get(2)?,
            agent_id: row.get(3)?,
            request_id: row.get(4)?,
            decision: row.get(5)?,
            details: row.get(6)?,
            previous_hash: row.get(7)?,
            receipt_hash: row.get(8)?,
        })
    }

    fn hashed_fields(&self) -> HashedFields<'_> {
        HashedFields {
            id: &self.id,
            timestamp: &self.timestamp,
            event_type: &self.event_type,
            agent_id: self.agent_id.as_deref(),
            request_id: self.request_id.as_deref(),
            decision: self.decision.as_deref(),
            details: &self.details,
        }
    }

    fn decode(self) -> AuditResult<AuditEntry> {
        let corrupt = |column, message| StorageError::Corrupt { column, message };
        Ok(AuditEntry {
            timestamp: parse_time(&self.timestamp).map_err(|m| corrupt("timestamp", m))?,
            event_type: self
                .event_type
                .parse()
                .map_err(|m| corrupt("event_type", m))?,
            details: serde_json::from_str(&self.details)
                .map_err(|e| corrupt("details", e.to_string()))?,
            id: self.id,
            agent_id: self.agent_id,
            request_id: self.request_id,
            decision: self.decision,
            previous_hash: self.previous_hash,
            receipt_hash: self.receipt_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn log() -> (Arc<Database>, AuditLog) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        (db.clone(), AuditLog::new(db))
    }

    fn append_n(log: &AuditLog, n: usize) -> Vec<AuditEntry> {
        (0..n)
            .map(|i| {
                log.append(
                    NewAuditEntry::new(AuditEventType::RequestAllowed, json!({"n": i}))
                        .agent("agent-1")
                        .decision("allow"),
                )
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_chain_links_entries() {
        let (_db, log) = log();
        let entries = append_n(&log, 3);

        assert_eq!(entries[0].previous_hash, GENESIS_HASH);
        assert_eq!(entries[1].previous_hash, entries[0].receipt_hash);
        assert_eq!(entries[2].previous_hash, entries[1].receipt_hash);

        let report = log.verify().unwrap();
        assert!(report.is_valid());
        assert_eq!(report.total_entries, 3);
    }

    #[test]
    fn test_tampering_breaks_entry_and_all_later() {
        let (db, log) = log();
        let entries = append_n(&log, 4);

        db.with_conn(|c| {
            c.execute(
                "UPDATE audit_log SET details = '{\"n\":99}' WHERE id = ?1",
                params![entries[1].id],
            )?;
            Ok(())
        })
        .unwrap();

        let report = log.verify().unwrap();
        assert!(!report.is_valid());
        assert_eq!(report.first_broken.as_deref(), Some(entries[1].id.as_str()));
        assert_eq!(
            report.broken,
            entries[1..].iter().map(|e| e.id.clone()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_empty_chain_is_valid() {
        let (_db, log) = log();
        let report = log.verify().unwrap();
        assert!(report.is_valid());
        assert_eq!(report.total_entries, 0);
        assert!(log.is_empty().unwrap());
    }

    #[test]
    fn test_concurrent_appends_keep_chain_linear() {
        let (_db, log) = log();
        let log = Arc::new(log);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || append_n(&log, 10))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let report = log.verify().unwrap();
        assert_eq!(report.total_entries, 80);
        assert!(report.is_valid());
    }

    #[test]
    fn test_query_filters() {
        let (_db, log) = log();
        append_n(&log, 2);
        log.append(
            NewAuditEntry::new(AuditEventType::RequestBlocked, json!({"reason": "secret"}))
                .agent("agent-2")
                .request("req-1")
                .decision("block"),
        )
        .unwrap();

        let blocked = log
            .query(&AuditQuery {
                decision: Some("block".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].request_id.as_deref(), Some("req-1"));
        assert_eq!(blocked[0].details["reason"], "secret");

        let by_agent = log
            .query(&AuditQuery {
                agent_id: Some("agent-1".into()),
                event_type: Some(AuditEventType::RequestAllowed),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_agent.len(), 2);

        let future = log
            .query(&AuditQuery {
                since: Some(Utc::now() + chrono::Duration::hours(1)),
                ..Default::default()
            })
            .unwrap();
        assert!(future.is_empty());

        let limited = log
            .query(&AuditQuery {
                limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_recent_is_newest_first() {
        let (_db, log) = log();
        let entries = append_n(&log, 3);
        let recent = log.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, entries[2].id);
        assert_eq!(recent[1].id, entries[1].id);
    }

    #[test]
    fn test_event_type_round_trip() {
        for t in AuditEventType::ALL {
            assert_eq!(t.as_str().parse::<AuditEventType>().unwrap(), t);
        }
        assert!("bogus".parse::<AuditEventType>().is_err());
    }
}
