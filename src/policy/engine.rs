//! Policy engine: loads documents and serves an immutable effective policy.
//!
//! # Snapshot Model
//!
//! The engine owns an `Arc<PolicySnapshot>` behind a lock. Readers clone the
//! `Arc` and evaluate against that value for the rest of their decision;
//! [`PolicyEngine::reload`] builds a complete new snapshot and swaps the
//! reference in one step, so an in-flight decision never observes a
//! half-updated policy.
//!
//! # Domain Precedence
//!
//! When a host matches several categories the order is:
//! denied > require_approval > allowed > (unlisted, decided by
//! `new_domain_action`).

use super::document::{PolicyAction, PolicyDocument, PolicyFormat};
use super::error::{PolicyError, PolicyValidationError};
use super::glob::DomainGlobs;
use parking_lot::RwLock;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const DEFAULT_PRIORITY: u32 = 100;
const DEFAULT_MAX_BODY_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_PROFILE_MAX_BODY_BYTES: u64 = 1024 * 1024;

/// Global settings after defaults are applied.
#[derive(Debug, Clone)]
pub struct GlobalPolicy {
    /// Action when nothing else triggers.
    pub default_action: PolicyAction,
    /// Keep full request detail for allowed requests. When off, a plain
    /// allowed request is still audited, with its URL reduced to the origin.
    pub log_all_requests: bool,
    /// Run the intent analyzer.
    pub intent_analysis: bool,
    /// Hard cap on request body size.
    pub max_request_body_bytes: u64,
    /// What to do with unlisted domains.
    pub new_domain_action: PolicyAction,
}

/// Compiled domain globs.
#[derive(Debug, Clone, Default)]
pub struct DomainRules {
    /// Allowed globs.
    pub allowed: DomainGlobs,
    /// Denied globs.
    pub denied: DomainGlobs,
    /// Approval-required globs.
    pub require_approval: DomainGlobs,
}

/// Policy classification of a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainClass {
    /// Matches a denied glob.
    Denied(String),
    /// Matches a require_approval glob (and no denied glob).
    RequiresApproval(String),
    /// Matches an allowed glob only.
    Allowed(String),
    /// Matches nothing.
    Unlisted,
}

impl DomainRules {
    /// Classify a host with deny > approval > allow precedence.
    pub fn classify(&self, host: &str) -> DomainClass {
        if let Some(rule) = self.denied.find(host) {
            return DomainClass::Denied(rule.to_string());
        }
        if let Some(rule) = self.require_approval.find(host) {
            return DomainClass::RequiresApproval(rule.to_string());
        }
        if let Some(rule) = self.allowed.find(host) {
            return DomainClass::Allowed(rule.to_string());
        }
        DomainClass::Unlisted
    }
}

/// A compiled secret signature.
#[derive(Debug, Clone)]
pub struct SecretSignature {
    /// Type name reported on match.
    pub name: String,
    /// Compiled expression.
    pub regex: Regex,
    /// Action on match.
    pub action: PolicyAction,
}

/// Entropy scanner settings.
#[derive(Debug, Clone, Copy)]
pub struct EntropyRules {
    /// Enabled.
    pub enabled: bool,
    /// Shortest token considered.
    pub min_length: usize,
    /// Bits-per-character threshold.
    pub min_entropy: f64,
    /// Action on match.
    pub action: PolicyAction,
}

/// Secret detection settings.
#[derive(Debug, Clone)]
pub struct SecretRules {
    /// Enabled.
    pub enabled: bool,
    /// Action for fixed and explicit signatures without their own action.
    pub action: PolicyAction,
    /// Explicit signatures from policy documents.
    pub patterns: Vec<SecretSignature>,
    /// Entropy scanner.
    pub entropy: EntropyRules,
}

/// Sensitive file reference settings.
#[derive(Debug, Clone)]
pub struct SensitiveFileRules {
    /// Enabled.
    pub enabled: bool,
    /// Action on match.
    pub action: PolicyAction,
    /// Path globs.
    pub paths: Vec<String>,
}

/// Agent-keyed rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentLimits {
    /// Requests per rolling minute.
    pub requests_per_minute: u32,
    /// Requests per rolling hour.
    pub requests_per_hour: u32,
    /// Simultaneous requests.
    pub max_concurrent: u32,
}

/// Domain-keyed rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainLimits {
    /// Requests per rolling minute.
    pub requests_per_minute: u32,
    /// Requests per rolling hour.
    pub requests_per_hour: u32,
}

/// Effective rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    /// Enabled.
    pub enabled: bool,
    /// Per agent.
    pub per_agent: AgentLimits,
    /// Per destination domain.
    pub per_domain: DomainLimits,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            enabled: true,
            per_agent: AgentLimits {
                requests_per_minute: 120,
                requests_per_hour: 3000,
                max_concurrent: 20,
            },
            per_domain: DomainLimits {
                requests_per_minute: 60,
                requests_per_hour: 1000,
            },
        }
    }
}

/// A known agent profile.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    /// Profile name.
    pub name: String,
    /// Lowercased substrings matched against process name and path.
    pub process_patterns: Vec<String>,
    /// Extra domains this agent may reach.
    pub allowed_domains_extra: DomainGlobs,
    /// Body size cap.
    pub max_body_bytes: u64,
}

impl AgentProfile {
    fn builtin(name: &str, patterns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            process_patterns: patterns.iter().map(|p| p.to_string()).collect(),
            allowed_domains_extra: DomainGlobs::default(),
            max_body_bytes: DEFAULT_PROFILE_MAX_BODY_BYTES,
        }
    }

    /// Whether the process name or executable path matches this profile.
    pub fn matches(&self, process_name: &str, process_path: &str) -> bool {
        let haystack = format!("{} {}", process_name, process_path).to_lowercase();
        self.process_patterns.iter().any(|p| haystack.contains(p.as_str()))
    }
}

/// Profiles recognized even when no policy document defines them.
pub fn builtin_profiles() -> Vec<AgentProfile> {
    vec![
        AgentProfile::builtin("cursor", &["cursor"]),
        AgentProfile::builtin("claude-code", &["claude", "claude-code"]),
        AgentProfile::builtin("aider", &["aider"]),
        AgentProfile::builtin("github-copilot", &["copilot"]),
        AgentProfile::builtin("codex", &["codex"]),
    ]
}

/// Settings for agents that could not be identified.
#[derive(Debug, Clone, Copy)]
pub struct UnknownAgentRules {
    /// Action on first contact.
    pub action: PolicyAction,
    /// Body size cap.
    pub max_body_bytes: u64,
}

/// Agent settings.
#[derive(Debug, Clone)]
pub struct AgentRules {
    /// Profiles from documents, then built-ins.
    pub profiles: Vec<AgentProfile>,
    /// Unknown agent fallback.
    pub unknown_agent: UnknownAgentRules,
}

/// The merged policy with every default applied.
#[derive(Debug, Clone)]
pub struct EffectivePolicy {
    /// Version of the highest-precedence document.
    pub version: String,
    /// Name of the highest-precedence document.
    pub name: String,
    /// Global settings.
    pub global: GlobalPolicy,
    /// Domain globs.
    pub domains: DomainRules,
    /// Secret detection.
    pub secrets: SecretRules,
    /// Sensitive file references.
    pub sensitive_files: SensitiveFileRules,
    /// Rate limits.
    pub rate_limits: RateLimits,
    /// Agent profiles.
    pub agents: AgentRules,
}

impl Default for EffectivePolicy {
    fn default() -> Self {
        Self::from_document(&PolicyDocument::default())
    }
}

impl EffectivePolicy {
    /// Apply defaults to an already-merged document.
    pub fn from_document(doc: &PolicyDocument) -> Self {
        let secrets_action = doc.secrets.action.unwrap_or(PolicyAction::Block);
        let patterns = doc
            .secrets
            .patterns
            .iter()
            .filter_map(|spec| match Regex::new(&spec.pattern) {
                Ok(regex) => Some(SecretSignature {
                    name: spec.name.clone(),
                    regex,
                    action: spec.action.unwrap_or(secrets_action),
                }),
                Err(e) => {
                    warn!(pattern = %spec.name, error = %e, "Dropping uncompilable secret pattern");
                    None
                }
            })
            .collect();

        let mut profiles: Vec<AgentProfile> = doc
            .agents
            .profiles
            .iter()
            .map(|spec| AgentProfile {
                name: spec.name.clone(),
                process_patterns: spec
                    .process_patterns
                    .iter()
                    .map(|p| p.to_lowercase())
                    .collect(),
                allowed_domains_extra: DomainGlobs::new(&spec.allowed_domains_extra),
                max_body_bytes: spec.max_body_bytes.unwrap_or(DEFAULT_PROFILE_MAX_BODY_BYTES),
            })
            .collect();
        profiles.extend(builtin_profiles());

        let defaults = RateLimits::default();
        let ra = &doc.rate_limits.per_agent;
        let rd = &doc.rate_limits.per_domain;

        Self {
            version: doc.version.clone().unwrap_or_else(|| "1.0".to_string()),
            name: doc.name.clone().unwrap_or_else(|| "Unnamed Policy".to_string()),
            global: GlobalPolicy {
                default_action: doc.global.default_action.unwrap_or(PolicyAction::Allow),
                log_all_requests: doc.global.log_all_requests.unwrap_or(true),
                intent_analysis: doc.global.intent_analysis.unwrap_or(false),
                max_request_body_bytes: doc
                    .global
                    .max_request_body_bytes
                    .unwrap_or(DEFAULT_MAX_BODY_BYTES),
                new_domain_action: doc
                    .global
                    .new_domain_action
                    .unwrap_or(PolicyAction::RequireApproval),
            },
            domains: DomainRules {
                allowed: DomainGlobs::new(&doc.domains.allowed),
                denied: DomainGlobs::new(&doc.domains.denied),
                require_approval: DomainGlobs::new(&doc.domains.require_approval),
            },
            secrets: SecretRules {
                enabled: doc.secrets.enabled.unwrap_or(true),
                action: secrets_action,
                patterns,
                entropy: EntropyRules {
                    enabled: doc.secrets.entropy_detection.enabled.unwrap_or(true),
                    min_length: doc.secrets.entropy_detection.min_length.unwrap_or(20),
                    min_entropy: doc.secrets.entropy_detection.min_entropy.unwrap_or(4.5),
                    action: doc
                        .secrets
                        .entropy_detection
                        .action
                        .unwrap_or(PolicyAction::Alert),
                },
            },
            sensitive_files: SensitiveFileRules {
                enabled: doc.sensitive_files.enabled.unwrap_or(true),
                action: doc.sensitive_files.action.unwrap_or(PolicyAction::Alert),
                paths: doc.sensitive_files.paths.clone(),
            },
            rate_limits: RateLimits {
                enabled: doc.rate_limits.enabled.unwrap_or(true),
                per_agent: AgentLimits {
                    requests_per_minute: ra
                        .requests_per_minute
                        .unwrap_or(defaults.per_agent.requests_per_minute),
                    requests_per_hour: ra
                        .requests_per_hour
                        .unwrap_or(defaults.per_agent.requests_per_hour),
                    max_concurrent: ra
                        .max_concurrent
                        .unwrap_or(defaults.per_agent.max_concurrent),
                },
                per_domain: DomainLimits {
                    requests_per_minute: rd
                        .requests_per_minute
                        .unwrap_or(defaults.per_domain.requests_per_minute),
                    requests_per_hour: rd
                        .requests_per_hour
                        .unwrap_or(defaults.per_domain.requests_per_hour),
                },
            },
            agents: AgentRules {
                profiles,
                unknown_agent: UnknownAgentRules {
                    action: doc
                        .agents
                        .unknown_agent
                        .action
                        .unwrap_or(PolicyAction::RequireApproval),
                    max_body_bytes: doc
                        .agents
                        .unknown_agent
                        .max_body_bytes
                        .unwrap_or(DEFAULT_PROFILE_MAX_BODY_BYTES),
                },
            },
        }
    }

    /// First profile whose patterns match the process name or path.
    pub fn agent_profile_for(&self, name: &str, path: &str) -> Option<&AgentProfile> {
        self.agents.profiles.iter().find(|p| p.matches(name, path))
    }

    /// Look up a profile by its name.
    pub fn profile_named(&self, name: &str) -> Option<&AgentProfile> {
        self.agents.profiles.iter().find(|p| p.name == name)
    }
}

/// A document that passed validation.
#[derive(Debug, Clone)]
pub struct LoadedPolicy {
    /// Stable id (file stem).
    pub id: String,
    /// Source file.
    pub path: PathBuf,
    /// Effective priority.
    pub priority: u32,
    /// Raw file content.
    pub content: String,
    /// Parsed document.
    pub document: PolicyDocument,
}

/// One immutable view of loaded policy.
#[derive(Debug, Clone, Default)]
pub struct PolicySnapshot {
    /// Merged policy.
    pub policy: EffectivePolicy,
    /// Documents in precedence order.
    pub documents: Vec<LoadedPolicy>,
    /// Documents rejected by the last load.
    pub rejected: Vec<PolicyValidationError>,
}

impl PolicySnapshot {
    /// Build a snapshot from validated documents.
    ///
    /// Orders by ascending priority, ties by file name, and merges.
    pub fn build(mut documents: Vec<LoadedPolicy>, rejected: Vec<PolicyValidationError>) -> Self {
        documents.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.path.file_name().cmp(&b.path.file_name()))
        });

        let mut merged = PolicyDocument::default();
        for loaded in &documents {
            merged.absorb(&loaded.document);
        }

        Self {
            policy: EffectivePolicy::from_document(&merged),
            documents,
            rejected,
        }
    }
}

/// Outcome of a load: how many documents were accepted and which were not.
#[derive(Debug, Clone)]
pub struct LoadReport {
    /// Number of accepted documents.
    pub loaded: usize,
    /// Rejected documents.
    pub rejected: Vec<PolicyValidationError>,
}

/// Loads policy documents and hands out immutable snapshots.
pub struct PolicyEngine {
    /// Directory scanned by [`PolicyEngine::load_policies`].
    dir: Option<PathBuf>,
    /// Current snapshot.
    snapshot: RwLock<Arc<PolicySnapshot>>,
}

impl PolicyEngine {
    /// Create an engine bound to a policy directory. Nothing is loaded yet;
    /// the default policy is in effect until [`Self::load_policies`] runs.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            snapshot: RwLock::new(Arc::new(PolicySnapshot::default())),
        }
    }

    /// Create an engine from in-memory documents (no directory).
    pub fn from_documents(documents: Vec<(String, PolicyDocument)>) -> Self {
        let loaded = documents
            .into_iter()
            .map(|(id, document)| LoadedPolicy {
                path: PathBuf::from(format!("{id}.yaml")),
                priority: document.priority.unwrap_or(DEFAULT_PRIORITY),
                content: serde_yaml::to_string(&document).unwrap_or_default(),
                id,
                document,
            })
            .collect();
        Self {
            dir: None,
            snapshot: RwLock::new(Arc::new(PolicySnapshot::build(loaded, Vec::new()))),
        }
    }

    /// Policy directory, if any.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Read, validate, and merge every document in the directory, then swap
    /// the snapshot. Invalid documents are skipped and reported.
    pub fn load_policies(&self) -> Result<LoadReport, PolicyError> {
        let Some(dir) = self.dir.as_deref() else {
            let snapshot = self.snapshot();
            return Ok(LoadReport {
                loaded: snapshot.documents.len(),
                rejected: Vec::new(),
            });
        };

        let mut documents = Vec::new();
        let mut rejected = Vec::new();

        for path in policy_files(dir)? {
            let Some(format) = PolicyFormat::from_path(&path) else {
                continue;
            };
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Skipping unreadable policy");
                    rejected.push(PolicyValidationError::new(
                        path.clone(),
                        "<document>",
                        format!("unreadable: {e}"),
                    ));
                    continue;
                }
            };

            match PolicyDocument::parse(&content, format, &path) {
                Ok(document) => {
                    debug!(path = %path.display(), "Loaded policy document");
                    documents.push(LoadedPolicy {
                        id: path
                            .file_stem()
                            .map(|s| s.to_string_lossy().into_owned())
                            .unwrap_or_default(),
                        priority: document.priority.unwrap_or(DEFAULT_PRIORITY),
                        path,
                        content,
                        document,
                    });
                }
                Err(e) => {
                    warn!(file = %e.file.display(), field = %e.field, "Skipping invalid policy: {}", e.message);
                    rejected.push(e);
                }
            }
        }

        let report = LoadReport {
            loaded: documents.len(),
            rejected: rejected.clone(),
        };
        let next = Arc::new(PolicySnapshot::build(documents, rejected));
        *self.snapshot.write() = next;

        info!(
            loaded = report.loaded,
            rejected = report.rejected.len(),
            "Policy snapshot updated"
        );
        Ok(report)
    }

    /// Reload from disk, atomically replacing the snapshot.
    pub fn reload(&self) -> Result<LoadReport, PolicyError> {
        self.load_policies()
    }

    /// Validate a document without loading it.
    pub fn validate_source(
        source: &str,
        format: PolicyFormat,
    ) -> Result<PolicyDocument, PolicyValidationError> {
        PolicyDocument::parse(source, format, Path::new("<source>"))
    }

    /// Loaded documents in precedence order.
    pub fn policies(&self) -> Vec<LoadedPolicy> {
        self.snapshot().documents.clone()
    }

    /// Current snapshot. Hold on to it for the duration of a decision.
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.snapshot.read().clone()
    }

    /// Whether the host is classified as allowed (and not denied or held).
    pub fn is_domain_allowed(&self, host: &str) -> bool {
        matches!(
            self.snapshot().policy.domains.classify(host),
            DomainClass::Allowed(_)
        )
    }

    /// Whether the host matches a denied glob.
    pub fn is_domain_denied(&self, host: &str) -> bool {
        matches!(
            self.snapshot().policy.domains.classify(host),
            DomainClass::Denied(_)
        )
    }

    /// Whether the host requires approval (and is not denied).
    pub fn domain_requires_approval(&self, host: &str) -> bool {
        matches!(
            self.snapshot().policy.domains.classify(host),
            DomainClass::RequiresApproval(_)
        )
    }

    /// Effective rate limits.
    pub fn effective_rate_limits(&self) -> RateLimits {
        self.snapshot().policy.rate_limits
    }

    /// Explicit secret signatures from policy documents.
    pub fn secret_patterns(&self) -> Vec<SecretSignature> {
        self.snapshot().policy.secrets.patterns.clone()
    }

    /// Matching agent profile for a process.
    pub fn agent_profile_for(&self, name: &str, path: &str) -> Option<AgentProfile> {
        self.snapshot().policy.agent_profile_for(name, path).cloned()
    }
}

impl std::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("dir", &self.dir)
            .field("documents", &self.snapshot().documents.len())
            .finish()
    }
}

/// List candidate policy files in name order. A missing directory is empty.
fn policy_files(dir: &Path) -> Result<Vec<PathBuf>, PolicyError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "Policy directory does not exist");
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(PolicyError::ReadDir {
                path: dir.to_path_buf(),
                source,
            });
        }
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && PolicyFormat::from_path(p).is_some())
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_defaults_without_documents() {
        let engine = PolicyEngine::new("/nonexistent/rashomon/policies");
        let report = engine.load_policies().unwrap();
        assert_eq!(report.loaded, 0);

        let snapshot = engine.snapshot();
        let policy = &snapshot.policy;
        assert_eq!(policy.global.default_action, PolicyAction::Allow);
        assert_eq!(policy.global.new_domain_action, PolicyAction::RequireApproval);
        assert_eq!(policy.global.max_request_body_bytes, 10 * 1024 * 1024);
        assert_eq!(policy.secrets.action, PolicyAction::Block);
        assert_eq!(policy.secrets.entropy.min_length, 20);
        assert_eq!(policy.rate_limits, RateLimits::default());
        assert_eq!(policy.agents.unknown_agent.max_body_bytes, 1024 * 1024);
    }

    #[test]
    fn test_invalid_document_is_skipped() {
        let dir = tempdir().unwrap();
        write(
            dir.path(),
            "good.yaml",
            "name: good\nglobal:\n  default_action: allow\ndomains:\n  denied: [evil.com]\n",
        );
        write(dir.path(), "bad.yaml", "global:\n  default_action: allow\n");
        write(dir.path(), "notes.txt", "ignored");

        let engine = PolicyEngine::new(dir.path());
        let report = engine.load_policies().unwrap();

        assert_eq!(report.loaded, 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].field, "name");
        assert!(report.rejected[0].file.ends_with("bad.yaml"));
        assert!(engine.is_domain_denied("evil.com"));
    }

    #[test]
    fn test_unreadable_document_is_skipped() {
        let dir = tempdir().unwrap();
        write(
            dir.path(),
            "good.yaml",
            "name: good\nglobal:\n  default_action: allow\ndomains:\n  denied: [evil.com]\n",
        );
        fs::write(dir.path().join("bad.yaml"), b"name: \xff\xfe\n").unwrap();

        let engine = PolicyEngine::new(dir.path());
        let report = engine.load_policies().unwrap();

        assert_eq!(report.loaded, 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].field, "<document>");
        assert!(report.rejected[0].file.ends_with("bad.yaml"));
        assert!(engine.is_domain_denied("evil.com"));
    }

    #[test]
    fn test_merge_by_priority() {
        let dir = tempdir().unwrap();
        write(
            dir.path(),
            "base.yaml",
            "name: base\npriority: 100\nglobal:\n  default_action: allow\n  max_request_body_bytes: 2048\nrate_limits:\n  per_agent:\n    requests_per_minute: 10\n",
        );
        write(
            dir.path(),
            "override.yaml",
            "name: override\npriority: 1\nglobal:\n  default_action: block\nrate_limits:\n  per_agent:\n    max_concurrent: 3\n",
        );

        let engine = PolicyEngine::new(dir.path());
        engine.load_policies().unwrap();
        let snapshot = engine.snapshot();

        assert_eq!(snapshot.policy.name, "override");
        assert_eq!(snapshot.policy.global.default_action, PolicyAction::Block);
        assert_eq!(snapshot.policy.global.max_request_body_bytes, 2048);
        let limits = snapshot.policy.rate_limits.per_agent;
        assert_eq!(limits.requests_per_minute, 10);
        assert_eq!(limits.max_concurrent, 3);
        assert_eq!(snapshot.documents[0].id, "override");
    }

    #[test]
    fn test_equal_priority_orders_by_file_name() {
        let dir = tempdir().unwrap();
        write(dir.path(), "b.yaml", "name: b\nglobal:\n  default_action: block\n");
        write(dir.path(), "a.yaml", "name: a\nglobal:\n  default_action: allow\n");

        let engine = PolicyEngine::new(dir.path());
        engine.load_policies().unwrap();
        assert_eq!(engine.snapshot().policy.global.default_action, PolicyAction::Allow);
    }

    #[test]
    fn test_deny_precedence_over_allow() {
        let doc = PolicyDocument::parse(
            "name: p\nglobal:\n  default_action: allow\ndomains:\n  allowed: [\"*.example.com\", \"api.example.com\"]\n  denied: [\"api.example.com\"]\n  require_approval: [\"*.example.com\"]\n",
            PolicyFormat::Yaml,
            Path::new("p.yaml"),
        )
        .unwrap();
        let engine = PolicyEngine::from_documents(vec![("p".into(), doc)]);

        assert!(engine.is_domain_denied("api.example.com"));
        assert!(!engine.is_domain_allowed("api.example.com"));
        assert!(engine.domain_requires_approval("www.example.com"));
        assert!(!engine.is_domain_allowed("www.example.com"));
    }

    #[test]
    fn test_deny_in_any_document_applies() {
        let high = PolicyDocument::parse(
            "name: high\npriority: 1\nglobal:\n  default_action: allow\ndomains:\n  allowed: [\"*.corp.example\"]\n",
            PolicyFormat::Yaml,
            Path::new("high.yaml"),
        )
        .unwrap();
        let low = PolicyDocument::parse(
            "name: low\npriority: 50\nglobal:\n  default_action: allow\ndomains:\n  denied: [\"leak.corp.example\"]\n",
            PolicyFormat::Yaml,
            Path::new("low.yaml"),
        )
        .unwrap();
        let engine = PolicyEngine::from_documents(vec![("high".into(), high), ("low".into(), low)]);

        assert!(engine.is_domain_denied("leak.corp.example"));
        assert!(engine.is_domain_allowed("build.corp.example"));
    }

    #[test]
    fn test_reload_swaps_snapshot() {
        let dir = tempdir().unwrap();
        write(dir.path(), "p.yaml", "name: p\nglobal:\n  default_action: allow\n");
        let engine = PolicyEngine::new(dir.path());
        engine.load_policies().unwrap();

        let before = engine.snapshot();
        write(
            dir.path(),
            "p.yaml",
            "name: p\nglobal:\n  default_action: allow\ndomains:\n  denied: [evil.com]\n",
        );
        engine.reload().unwrap();

        assert!(!before.policy.domains.denied.matches("evil.com"));
        assert!(engine.is_domain_denied("evil.com"));
    }

    #[test]
    fn test_agent_profile_lookup() {
        let doc = PolicyDocument::parse(
            "name: p\nglobal:\n  default_action: allow\nagents:\n  profiles:\n    - name: my-bot\n      process_patterns: [mybot]\n      max_body_bytes: 4096\n",
            PolicyFormat::Yaml,
            Path::new("p.yaml"),
        )
        .unwrap();
        let engine = PolicyEngine::from_documents(vec![("p".into(), doc)]);

        let profile = engine.agent_profile_for("MyBot", "/opt/mybot/bin/run").unwrap();
        assert_eq!(profile.name, "my-bot");
        assert_eq!(profile.max_body_bytes, 4096);

        let builtin = engine.agent_profile_for("claude", "/usr/local/bin/claude").unwrap();
        assert_eq!(builtin.name, "claude-code");
        assert!(engine.agent_profile_for("bash", "/bin/bash").is_none());
    }

    #[test]
    fn test_explicit_secret_patterns_compiled() {
        let doc = PolicyDocument::parse(
            "name: p\nglobal:\n  default_action: allow\nsecrets:\n  action: alert\n  patterns:\n    - name: Internal Token\n      pattern: \"itk_[a-z0-9]{8}\"\n    - name: Deploy Key\n      pattern: \"dk-[0-9]{6}\"\n      action: block\n",
            PolicyFormat::Yaml,
            Path::new("p.yaml"),
        )
        .unwrap();
        let engine = PolicyEngine::from_documents(vec![("p".into(), doc)]);
        let patterns = engine.secret_patterns();

        assert_eq!(patterns.len(), 2);
        assert_eq!(patterns[0].action, PolicyAction::Alert);
        assert_eq!(patterns[1].action, PolicyAction::Block);
        assert!(patterns[0].regex.is_match("token=itk_abcd1234"));
    }
}
