//! Ledger export.

use super::{AuditEntry, AuditResult};
use chrono::SecondsFormat;

/// Output format for [`super::AuditLog::export`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    Json,
    Csv,
}

const CSV_HEADER: &str =
    "id,timestamp,event_type,agent_id,request_id,decision,details,previous_hash,receipt_hash";

pub(super) fn render(entries: &[AuditEntry], format: ExportFormat) -> AuditResult<String> {
    match format {
        ExportFormat::Json => Ok(serde_json::to_string_pretty(entries)?),
        ExportFormat::Csv => {
            let mut out = String::from(CSV_HEADER);
            out.push('\n');
            for entry in entries {
                let details = serde_json::to_string(&entry.details)?;
                let fields: [&str; 9] = [
                    entry.id.as_str(),
                    &entry.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
                    entry.event_type.as_str(),
                    entry.agent_id.as_deref().unwrap_or(""),
                    entry.request_id.as_deref().unwrap_or(""),
                    entry.decision.as_deref().unwrap_or(""),
                    &details,
                    &entry.previous_hash,
                    &entry.receipt_hash,
                ];
                let row: Vec<String> = fields.into_iter().map(csv_field).collect();
                out.push_str(&row.join(","));
                out.push('\n');
            }
            Ok(out)
        }
    }
}

/// Quote a field when it contains a delimiter, quote, or line break.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::super::{AuditEventType, AuditLog, NewAuditEntry};
    use super::*;
    use crate::storage::Database;
    use serde_json::json;
    use std::sync::Arc;

    fn log_with_entries() -> AuditLog {
        let log = AuditLog::new(Arc::new(Database::open_in_memory().unwrap()));
        log.append(NewAuditEntry::new(AuditEventType::SystemStarted, json!({})))
            .unwrap();
        log.append(
            NewAuditEntry::new(
                AuditEventType::RequestBlocked,
                json!({"reason": "Secret detected: AWS Access Key", "domain": "a.test"}),
            )
            .agent("agent-1")
            .decision("block"),
        )
        .unwrap();
        log
    }

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_csv_export() {
        let csv = log_with_entries().export(ExportFormat::Csv).unwrap();
        let lines: Vec<&str> = csv.lines().collect();

        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains(",system_started,"));
        assert!(lines[2].contains(",request_blocked,agent-1,,block,"));
        assert!(lines[2].contains("\"{\"\"domain\"\":\"\"a.test\"\""));
    }

    #[test]
    fn test_json_export() {
        let exported = log_with_entries().export(ExportFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&exported).unwrap();
        let entries = value.as_array().unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["eventType"], "system_started");
        assert_eq!(entries[1]["previousHash"], entries[0]["receiptHash"]);
    }
}
