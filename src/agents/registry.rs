//! Persistent agent records with kill/resume control.

use super::detector::{AgentStatus, DetectedAgent};
use crate::domains::parse_time;
use crate::storage::{Database, StorageError, StorageResult};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// An agent as stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub process_name: String,
    pub process_path: Option<String>,
    pub pid: Option<u32>,
    pub declared_purpose: Option<String>,
    pub status: AgentStatus,
    pub matched_profile: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub threat_score: u8,
}

/// Outcome of [`AgentRegistry::register`].
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub record: AgentRecord,
    /// True the first time this id is seen.
    pub is_new: bool,
}

/// Stores agents and their kill state.
#[derive(Debug)]
pub struct AgentRegistry {
    db: Arc<Database>,
}

const COLUMNS: &str = "id, name, process_name, process_path, pid, declared_purpose, status,
    matched_profile, detected_at, total_requests, blocked_requests, threat_score";

impl AgentRegistry {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a newly seen agent or refresh an existing one's descriptive
    /// fields. A stored status (notably `killed`) is preserved.
    pub fn register(&self, agent: &DetectedAgent) -> StorageResult<Registration> {
        let inserted = self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO agents (id, name, process_name, process_path, pid, declared_purpose,
                                     status, matched_profile, detected_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    agent.id,
                    agent.name,
                    agent.process_name,
                    agent.process_path,
                    agent.pid,
                    agent.declared_purpose,
                    AgentStatus::Active.as_str(),
                    agent.matched_profile,
                    agent.detected_at.to_rfc3339(),
                ],
            )?;
            if inserted == 0 {
                conn.execute(
                    "UPDATE agents SET name = ?2, process_name = ?3,
                        process_path = COALESCE(?4, process_path), pid = COALESCE(?5, pid),
                        declared_purpose = COALESCE(?6, declared_purpose), matched_profile = ?7
                     WHERE id = ?1",
                    params![
                        agent.id,
                        agent.name,
                        agent.process_name,
                        agent.process_path,
                        agent.pid,
                        agent.declared_purpose,
                        agent.matched_profile,
                    ],
                )?;
            }
            Ok(inserted > 0)
        })?;

        if inserted {
            info!(agent = %agent.id, name = %agent.name, "New agent detected");
        }
        Ok(Registration {
            record: self.require(&agent.id)?,
            is_new: inserted,
        })
    }

    /// Count one request and store the latest threat score.
    pub fn record_request(&self, id: &str, blocked: bool, threat_score: u8) -> StorageResult<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE agents SET total_requests = total_requests + 1,
                    blocked_requests = blocked_requests + ?2, threat_score = ?3
                 WHERE id = ?1",
                params![id, i64::from(blocked), threat_score],
            )?;
            Ok(())
        })
    }

    /// Block all further requests from an agent. `None` if it is unknown.
    pub fn kill(&self, id: &str) -> StorageResult<Option<AgentRecord>> {
        self.set_status(id, AgentStatus::Killed)
    }

    /// Lift a kill. `None` if the agent is unknown.
    pub fn resume(&self, id: &str) -> StorageResult<Option<AgentRecord>> {
        self.set_status(id, AgentStatus::Active)
    }

    pub fn get(&self, id: &str) -> StorageResult<Option<AgentRecord>> {
        self.db.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {COLUMNS} FROM agents WHERE id = ?1"),
                    params![id],
                    RawAgent::from_row,
                )
                .optional()?;
            raw.map(RawAgent::decode).transpose()
        })
    }

    /// Whether the agent has been killed.
    pub fn is_killed(&self, id: &str) -> StorageResult<bool> {
        Ok(self
            .get(id)?
            .is_some_and(|a| a.status == AgentStatus::Killed))
    }

    /// All agents, most recently detected first.
    pub fn list(&self) -> StorageResult<Vec<AgentRecord>> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {COLUMNS} FROM agents ORDER BY detected_at DESC"))?;
            let agents = stmt
                .query_map([], RawAgent::from_row)?
                .map(|raw| raw?.decode())
                .collect::<StorageResult<Vec<_>>>()?;
            Ok(agents)
        })
    }

    fn set_status(&self, id: &str, status: AgentStatus) -> StorageResult<Option<AgentRecord>> {
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE agents SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )?)
        })?;
        if changed == 0 {
            return Ok(None);
        }
        info!(agent = %id, status = %status, "Agent status changed");
        self.get(id)
    }

    fn require(&self, id: &str) -> StorageResult<AgentRecord> {
        self.get(id)?.ok_or_else(|| StorageError::Corrupt {
            column: "id",
            message: format!("agent {id} vanished after write"),
        })
    }
}

struct RawAgent {
    id: String,
    name: String,
    process_name: String,
    process_path: Option<String>,
    pid: Option<u32>,
    declared_purpose: Option<String>,
    status: String,
    matched_profile: Option<String>,
    detected_at: String,
    total_requests: i64,
    blocked_requests: i64,
    threat_score: i64,
}

impl RawAgent {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            process_name: row.get(2)?,
            process_path: row.get(3)?,
            pid: row.get(4)?,
            declared_purpose: row.get(5)?,
            status: row.get(6)?,
            matched_profile: row.get(7)?,
            detected_at: row.get(8)?,
            total_requests: row.get(9)?,
            blocked_requests: row.get(10)?,
            threat_score: row.get(11)?,
        })
    }

    fn decode(self) -> StorageResult<AgentRecord> {
        let corrupt = |column, message| StorageError::Corrupt { column, message };
        Ok(AgentRecord {
            status: self.status.parse().map_err(|m| corrupt("status", m))?,
            detected_at: parse_time(&self.detected_at).map_err(|m| corrupt("detected_at", m))?,
            total_requests: u64::try_from(self.total_requests).unwrap_or(0),
            blocked_requests: u64::try_from(self.blocked_requests).unwrap_or(0),
            threat_score: u8::try_from(self.threat_score.clamp(0, 100)).unwrap_or(100),
            id: self.id,
            name: self.name,
            process_name: self.process_name,
            process_path: self.process_path,
            pid: self.pid,
            declared_purpose: self.declared_purpose,
            matched_profile: self.matched_profile,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::detector::IdentitySource;
    use crate::policy::DomainGlobs;

    fn agent(id: &str) -> DetectedAgent {
        DetectedAgent {
            id: id.into(),
            name: "claude-code".into(),
            process_name: "claude".into(),
            process_path: Some("/usr/local/bin/claude".into()),
            pid: Some(4242),
            declared_purpose: None,
            status: AgentStatus::Active,
            matched_profile: Some("claude-code".into()),
            allowed_domains_extra: DomainGlobs::default(),
            max_body_bytes: 1024,
            detected_at: Utc::now(),
            source: IdentitySource::Process,
        }
    }

    fn registry() -> AgentRegistry {
        AgentRegistry::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    #[test]
    fn test_register_is_new_once() {
        let r = registry();
        assert!(r.register(&agent("a1")).unwrap().is_new);
        let again = r.register(&agent("a1")).unwrap();
        assert!(!again.is_new);
        assert_eq!(again.record.pid, Some(4242));
        assert_eq!(r.list().unwrap().len(), 1);
    }

    #[test]
    fn test_kill_survives_reregistration() {
        let r = registry();
        r.register(&agent("a1")).unwrap();

        let killed = r.kill("a1").unwrap().unwrap();
        assert_eq!(killed.status, AgentStatus::Killed);
        assert!(r.is_killed("a1").unwrap());

        let again = r.register(&agent("a1")).unwrap();
        assert_eq!(again.record.status, AgentStatus::Killed);

        r.resume("a1").unwrap();
        assert!(!r.is_killed("a1").unwrap());
    }

    #[test]
    fn test_kill_unknown_agent() {
        let r = registry();
        assert!(r.kill("nope").unwrap().is_none());
        assert!(!r.is_killed("nope").unwrap());
    }

    #[test]
    fn test_request_counters() {
        let r = registry();
        r.register(&agent("a1")).unwrap();
        r.record_request("a1", false, 10).unwrap();
        r.record_request("a1", true, 55).unwrap();

        let record = r.get("a1").unwrap().unwrap();
        assert_eq!(record.total_requests, 2);
        assert_eq!(record.blocked_requests, 1);
        assert_eq!(record.threat_score, 55);
    }
}
