//! Domain classification and first-contact tracking.
//!
//! Policy globs decide a domain's status until a user approves or denies it;
//! from then on the stored decision wins. A domain counts as a first contact
//! until [`DomainManager::record_domain_contact`] has been called for it.

use crate::policy::{DomainClass, DomainGlobs, PolicyEngine};
use crate::storage::{Database, StorageError, StorageResult};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Classification of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainStatus {
    Allowed,
    Denied,
    PendingApproval,
    Unknown,
}

impl DomainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Denied => "denied",
            Self::PendingApproval => "pending_approval",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DomainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DomainStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allowed" => Ok(Self::Allowed),
            "denied" => Ok(Self::Denied),
            "pending_approval" => Ok(Self::PendingApproval),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown domain status '{other}'")),
        }
    }
}

/// Who established a domain's stored status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddedBy {
    /// A policy glob classified it.
    Policy,
    /// Seen without any matching glob.
    Auto,
    /// Explicit user approval or denial.
    User,
}

impl AddedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Policy => "policy",
            Self::Auto => "auto",
            Self::User => "user",
        }
    }
}

impl FromStr for AddedBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "policy" => Ok(Self::Policy),
            "auto" => Ok(Self::Auto),
            "user" => Ok(Self::User),
            other => Err(format!("unknown domain source '{other}'")),
        }
    }
}

/// A tracked domain.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainRecord {
    pub domain: String,
    pub status: DomainStatus,
    pub added_by: AddedBy,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub total_contacts: u64,
}

/// Result of [`DomainManager::check_domain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainCheck {
    pub status: DomainStatus,
    /// Glob or user decision responsible for the status.
    pub matched_rule: Option<String>,
    pub is_first_contact: bool,
}

/// Classifies domains against policy and persists what has been seen.
#[derive(Debug)]
pub struct DomainManager {
    db: Arc<Database>,
    policy: Arc<PolicyEngine>,
}

impl DomainManager {
    pub fn new(db: Arc<Database>, policy: Arc<PolicyEngine>) -> Self {
        Self { db, policy }
    }

    /// Classify a domain.
    pub fn check_domain(&self, domain: &str) -> StorageResult<DomainCheck> {
        self.check_domain_for(domain, None)
    }

    /// Classify a domain for an agent whose profile grants extra domains.
    ///
    /// Extra domains only promote a domain no policy glob classifies.
    pub fn check_domain_for(
        &self,
        domain: &str,
        extra: Option<&DomainGlobs>,
    ) -> StorageResult<DomainCheck> {
        let domain = normalize(domain);
        let existing = self.get_domain(&domain)?;

        if let Some(record) = &existing
            && record.added_by == AddedBy::User
        {
            return Ok(DomainCheck {
                status: record.status,
                matched_rule: Some(format!("user:{}", record.domain)),
                is_first_contact: false,
            });
        }

        let (mut status, mut matched_rule) = self.policy_rule(&domain);
        if status == DomainStatus::Unknown
            && let Some(glob) = extra.and_then(|globs| globs.find(&domain))
        {
            status = DomainStatus::Allowed;
            matched_rule = Some(format!("profile:{glob}"));
        }

        Ok(DomainCheck {
            status,
            matched_rule,
            is_first_contact: existing.is_none(),
        })
    }

    /// Record one contact with a domain. The stored status follows `status`
    /// when given, otherwise the policy classification; user decisions are
    /// never overwritten.
    pub fn record_domain_contact(
        &self,
        domain: &str,
        status: Option<DomainStatus>,
    ) -> StorageResult<DomainRecord> {
        let domain = normalize(domain);
        let resolved = status.unwrap_or_else(|| self.policy_rule(&domain).0);
        let added_by = if resolved == DomainStatus::Unknown {
            AddedBy::Auto
        } else {
            AddedBy::Policy
        };
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO domains (domain, status, added_by, first_seen, last_seen, total_contacts)
                 VALUES (?1, ?2, ?3, ?4, ?4, 1)
                 ON CONFLICT(domain) DO UPDATE SET
                    last_seen = excluded.last_seen,
                    total_contacts = total_contacts + 1,
                    status = CASE WHEN added_by = 'user' THEN status ELSE excluded.status END,
                    added_by = CASE WHEN added_by = 'user' THEN added_by ELSE excluded.added_by END",
                params![domain, resolved.as_str(), added_by.as_str(), now],
            )?;
            Ok(())
        })?;

        debug!(domain = %domain, status = %resolved, "Recorded domain contact");
        self.require(&domain)
    }

    /// Mark a domain allowed by user decision.
    pub fn approve_domain(&self, domain: &str) -> StorageResult<DomainRecord> {
        self.set_user_status(domain, DomainStatus::Allowed)
    }

    /// Mark a domain denied by user decision.
    pub fn deny_domain(&self, domain: &str) -> StorageResult<DomainRecord> {
        self.set_user_status(domain, DomainStatus::Denied)
    }

    /// Domains seen without any classification, most recent first.
    pub fn get_unknown_domains(&self) -> StorageResult<Vec<DomainRecord>> {
        self.query_records(
            "SELECT domain, status, added_by, first_seen, last_seen, total_contacts
             FROM domains WHERE status = 'unknown' ORDER BY last_seen DESC",
        )
    }

    /// Every tracked domain, most recent first.
    pub fn get_domain_stats(&self) -> StorageResult<Vec<DomainRecord>> {
        self.query_records(
            "SELECT domain, status, added_by, first_seen, last_seen, total_contacts
             FROM domains ORDER BY last_seen DESC",
        )
    }

    /// Stored record for one domain.
    pub fn get_domain(&self, domain: &str) -> StorageResult<Option<DomainRecord>> {
        let domain = normalize(domain);
        self.db.with_conn(|conn| {
            let raw = conn
                .query_row(
                    "SELECT domain, status, added_by, first_seen, last_seen, total_contacts
                     FROM domains WHERE domain = ?1",
                    params![domain],
                    RawRecord::from_row,
                )
                .optional()?;
            raw.map(RawRecord::decode).transpose()
        })
    }

    fn require(&self, domain: &str) -> StorageResult<DomainRecord> {
        self.get_domain(domain)?
            .ok_or_else(|| StorageError::Corrupt {
                column: "domain",
                message: format!("record for {domain} vanished after write"),
            })
    }

    fn set_user_status(&self, domain: &str, status: DomainStatus) -> StorageResult<DomainRecord> {
        let domain = normalize(domain);
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO domains (domain, status, added_by, first_seen, last_seen, total_contacts)
                 VALUES (?1, ?2, 'user', ?3, ?3, 0)
                 ON CONFLICT(domain) DO UPDATE SET
                    status = excluded.status,
                    added_by = 'user',
                    last_seen = excluded.last_seen",
                params![domain, status.as_str(), now],
            )?;
            Ok(())
        })?;
        info!(domain = %domain, status = %status, "Domain decision recorded");
        self.require(&domain)
    }

    fn policy_rule(&self, domain: &str) -> (DomainStatus, Option<String>) {
        match self.policy.snapshot().policy.domains.classify(domain) {
            DomainClass::Denied(rule) => (DomainStatus::Denied, Some(rule)),
            DomainClass::RequiresApproval(rule) => (DomainStatus::PendingApproval, Some(rule)),
            DomainClass::Allowed(rule) => (DomainStatus::Allowed, Some(rule)),
            DomainClass::Unlisted => (DomainStatus::Unknown, None),
        }
    }

    fn query_records(&self, sql: &str) -> StorageResult<Vec<DomainRecord>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let records = stmt
                .query_map([], RawRecord::from_row)?
                .map(|raw| raw?.decode())
                .collect::<StorageResult<Vec<_>>>()?;
            Ok(records)
        })
    }
}

fn normalize(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Row as stored, before enum and timestamp decoding.
struct RawRecord {
    domain: String,
    status: String,
    added_by: String,
    first_seen: String,
    last_seen: String,
    total_contacts: i64,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            domain: row.get(0)?,
            status: row.get(1)?,
            added_by: row.get(2)?,
            first_seen: row.get(3)?,
            last_seen: row.get(4)?,
            total_contacts: row.get(5)?,
        })
    }

    fn decode(self) -> StorageResult<DomainRecord> {
        let corrupt = |column, message| StorageError::Corrupt { column, message };
        Ok(DomainRecord {
            status: self.status.parse().map_err(|m| corrupt("status", m))?,
            added_by: self.added_by.parse().map_err(|m| corrupt("added_by", m))?,
            first_seen: parse_time(&self.first_seen).map_err(|m| corrupt("first_seen", m))?,
            last_seen: parse_time(&self.last_seen).map_err(|m| corrupt("last_seen", m))?,
            total_contacts: u64::try_from(self.total_contacts).unwrap_or(0),
            domain: self.domain,
        })
    }
}

pub(crate) fn parse_time(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp '{value}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyAction, PolicyDocument};

    fn manager() -> DomainManager {
        let mut doc = PolicyDocument::default();
        doc.global.new_domain_action = Some(PolicyAction::Allow);
        doc.domains.allowed = vec!["api.github.com".into(), "*.openai.com".into()];
        doc.domains.denied = vec!["*.pastebin.com".into()];
        doc.domains.require_approval = vec!["*.webhook.site".into(), "api.openai.com".into()];

        let engine = Arc::new(PolicyEngine::from_documents(vec![("base".into(), doc)]));
        let db = Arc::new(Database::open_in_memory().unwrap());
        DomainManager::new(db, engine)
    }

    #[test]
    fn test_first_contact_lifecycle() {
        let m = manager();

        let first = m.check_domain("api.github.com").unwrap();
        assert_eq!(first.status, DomainStatus::Allowed);
        assert!(first.is_first_contact);

        m.record_domain_contact("api.github.com", None).unwrap();
        let second = m.check_domain("api.github.com").unwrap();
        assert!(!second.is_first_contact);
        assert_eq!(second.status, DomainStatus::Allowed);
    }

    #[test]
    fn test_precedence_deny_then_approval_then_allow() {
        let m = manager();
        assert_eq!(
            m.check_domain("demo.webhook.site").unwrap().status,
            DomainStatus::PendingApproval
        );
        // Both an allow and an approval glob match; approval wins.
        let check = m.check_domain("api.openai.com").unwrap();
        assert_eq!(check.status, DomainStatus::PendingApproval);
        assert_eq!(check.matched_rule.as_deref(), Some("api.openai.com"));
        assert_eq!(
            m.check_domain("x.pastebin.com").unwrap().status,
            DomainStatus::Denied
        );
    }

    #[test]
    fn test_unknown_domains_and_user_approval() {
        let m = manager();
        let record = m.record_domain_contact("Unknown.Example.com", None).unwrap();
        assert_eq!(record.domain, "unknown.example.com");
        assert_eq!(record.added_by, AddedBy::Auto);
        assert_eq!(record.total_contacts, 1);

        let unknown = m.get_unknown_domains().unwrap();
        assert!(unknown.iter().any(|d| d.domain == "unknown.example.com"));

        m.approve_domain("unknown.example.com").unwrap();
        let stats = m.get_domain_stats().unwrap();
        let entry = stats
            .iter()
            .find(|d| d.domain == "unknown.example.com")
            .unwrap();
        assert_eq!(entry.status, DomainStatus::Allowed);
        assert_eq!(entry.added_by, AddedBy::User);
        assert!(m.get_unknown_domains().unwrap().is_empty());
    }

    #[test]
    fn test_user_decision_overrides_policy() {
        let m = manager();
        m.deny_domain("api.github.com").unwrap();

        let check = m.check_domain("api.github.com").unwrap();
        assert_eq!(check.status, DomainStatus::Denied);
        assert_eq!(check.matched_rule.as_deref(), Some("user:api.github.com"));

        // Later contacts keep the user's decision.
        let record = m.record_domain_contact("api.github.com", None).unwrap();
        assert_eq!(record.status, DomainStatus::Denied);
        assert_eq!(record.total_contacts, 1);
    }

    #[test]
    fn test_profile_extras_only_promote_unlisted_domains() {
        let m = manager();
        let extra = DomainGlobs::new(&["*.cursor.sh", "*.pastebin.com"]);

        let check = m.check_domain_for("api2.cursor.sh", Some(&extra)).unwrap();
        assert_eq!(check.status, DomainStatus::Allowed);
        assert_eq!(check.matched_rule.as_deref(), Some("profile:*.cursor.sh"));

        let denied = m.check_domain_for("x.pastebin.com", Some(&extra)).unwrap();
        assert_eq!(denied.status, DomainStatus::Denied);
    }

    #[test]
    fn test_contact_counts_accumulate() {
        let m = manager();
        for _ in 0..3 {
            m.record_domain_contact("api.github.com", None).unwrap();
        }
        let record = m.get_domain("api.github.com").unwrap().unwrap();
        assert_eq!(record.total_contacts, 3);
        assert_eq!(record.added_by, AddedBy::Policy);
    }
}
