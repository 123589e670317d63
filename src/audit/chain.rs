//! Receipt hashing.
//!
//! `receipt_hash = sha256(previous_hash || canonical(entry))`, where the
//! canonical form is compact JSON with keys in sorted order. The first entry
//! chains from [`GENESIS_HASH`].

use serde_json::json;
use sha2::{Digest, Sha256};

/// `previous_hash` of the first entry.
pub const GENESIS_HASH: &str = "genesis";

/// The hashed fields of an entry, as stored.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HashedFields<'a> {
    pub id: &'a str,
    pub timestamp: &'a str,
    pub event_type: &'a str,
    pub agent_id: Option<&'a str>,
    pub request_id: Option<&'a str>,
    pub decision: Option<&'a str>,
    pub details: &'a str,
}

impl HashedFields<'_> {
    /// Compact JSON with sorted keys.
    pub fn canonical(&self) -> String {
        // serde_json's default map is ordered, so keys serialize sorted.
        json!({
            "id": self.id,
            "timestamp": self.timestamp,
            "eventType": self.event_type,
            "agentId": self.agent_id,
            "requestId": self.request_id,
            "decision": self.decision,
            "details": self.details,
        })
        .to_string()
    }
}

/// Hash of an entry chained onto `previous_hash`.
pub(crate) fn receipt_hash(previous_hash: &str, fields: &HashedFields<'_>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(previous_hash.as_bytes());
    hasher.update(fields.canonical().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(details: &str) -> HashedFields<'_> {
        HashedFields {
            id: "e1",
            timestamp: "2026-01-07T14:32:01.000Z",
            event_type: "request_allowed",
            agent_id: Some("agent-1"),
            request_id: None,
            decision: Some("allow"),
            details,
        }
    }

    #[test]
    fn test_canonical_keys_are_sorted() {
        let canonical = fields("{}").canonical();
        let agent = canonical.find("\"agentId\"").unwrap();
        let decision = canonical.find("\"decision\"").unwrap();
        let timestamp = canonical.find("\"timestamp\"").unwrap();
        assert!(agent < decision && decision < timestamp);
        assert!(canonical.contains("\"requestId\":null"));
    }

    #[test]
    fn test_hash_depends_on_previous_and_content() {
        let a = receipt_hash(GENESIS_HASH, &fields("{}"));
        assert_eq!(a.len(), 64);
        assert_eq!(a, receipt_hash(GENESIS_HASH, &fields("{}")));
        assert_ne!(a, receipt_hash("other", &fields("{}")));
        assert_ne!(a, receipt_hash(GENESIS_HASH, &fields("{\"x\":1}")));
    }
}
