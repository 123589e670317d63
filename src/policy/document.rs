//! Policy document schema, validation, and merging.
//!
//! A policy document is a YAML (or TOML) file. Every field is optional in the
//! file so that documents can be layered: the engine merges documents by
//! ascending `priority` (lower number wins), the highest-precedence explicit
//! value of each scalar field wins, and list fields are concatenated in
//! precedence order. Defaults fill whatever no document sets.
//!
//! ```yaml
//! version: "1.0"
//! name: corporate
//! priority: 10
//! global:
//!   default_action: allow
//!   new_domain_action: require_approval
//! domains:
//!   allowed: ["api.github.com", "*.anthropic.com"]
//!   denied: ["*.pastebin.com"]
//!   require_approval: ["*.webhook.site"]
//! secrets:
//!   action: block
//!   patterns:
//!     - name: Internal Token
//!       pattern: "itk_[a-z0-9]{32}"
//! ```

use super::error::PolicyValidationError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Action a policy rule can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    /// Let the request through.
    Allow,
    /// Refuse the request.
    Block,
    /// Let the request through but flag it.
    Alert,
    /// Hold the request for a human decision.
    RequireApproval,
}

impl PolicyAction {
    /// Snake-case name, as written in policy files.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Block => "block",
            Self::Alert => "alert",
            Self::RequireApproval => "require_approval",
        }
    }
}

impl std::fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// On-disk policy document. Unset fields are `None` / empty.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct PolicyDocument {
    /// Schema version.
    #[serde(default)]
    pub version: Option<String>,
    /// Human-readable policy name. Required.
    #[serde(default)]
    pub name: Option<String>,
    /// Merge priority; lower means higher precedence.
    #[serde(default)]
    pub priority: Option<u32>,
    /// Global settings.
    #[serde(default)]
    pub global: GlobalSection,
    /// Domain classification globs.
    #[serde(default)]
    pub domains: DomainsSection,
    /// Secret detection settings.
    #[serde(default)]
    pub secrets: SecretsSection,
    /// Sensitive file reference detection.
    #[serde(default)]
    pub sensitive_files: SensitiveFilesSection,
    /// Rate limit settings.
    #[serde(default)]
    pub rate_limits: RateLimitsSection,
    /// Agent profiles.
    #[serde(default)]
    pub agents: AgentsSection,
}

/// `global` section.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct GlobalSection {
    /// Action when nothing else triggers. Required.
    pub default_action: Option<PolicyAction>,
    /// Audit allowed requests too.
    pub log_all_requests: Option<bool>,
    /// Run the intent analyzer.
    pub intent_analysis: Option<bool>,
    /// Hard cap on request body size.
    pub max_request_body_bytes: Option<u64>,
    /// What to do with a domain no glob matches.
    pub new_domain_action: Option<PolicyAction>,
}

/// `domains` section.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct DomainsSection {
    /// Always-allowed globs.
    #[serde(default)]
    pub allowed: Vec<String>,
    /// Always-denied globs.
    #[serde(default)]
    pub denied: Vec<String>,
    /// Globs that require a human decision.
    #[serde(default)]
    pub require_approval: Vec<String>,
}

/// An explicit secret signature.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SecretPatternSpec {
    /// Type name reported on match.
    pub name: String,
    /// Regular expression.
    pub pattern: String,
    /// Overrides `secrets.action` for this pattern.
    #[serde(default)]
    pub action: Option<PolicyAction>,
}

/// `secrets.entropy_detection` section.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct EntropySection {
    /// Enable the entropy scanner.
    pub enabled: Option<bool>,
    /// Shortest token considered.
    pub min_length: Option<usize>,
    /// Shannon entropy threshold in bits per character.
    pub min_entropy: Option<f64>,
    /// Action on match.
    pub action: Option<PolicyAction>,
}

/// `secrets` section.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SecretsSection {
    /// Enable secret scanning.
    pub enabled: Option<bool>,
    /// Action for signature matches.
    pub action: Option<PolicyAction>,
    /// Extra signatures.
    #[serde(default)]
    pub patterns: Vec<SecretPatternSpec>,
    /// Entropy scanner.
    #[serde(default)]
    pub entropy_detection: EntropySection,
}

/// `sensitive_files` section.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SensitiveFilesSection {
    /// Enable the check.
    pub enabled: Option<bool>,
    /// Action on match.
    pub action: Option<PolicyAction>,
    /// Path globs.
    #[serde(default)]
    pub paths: Vec<String>,
}

/// Per-agent limits.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AgentLimitsSection {
    /// Requests per rolling minute.
    pub requests_per_minute: Option<u32>,
    /// Requests per rolling hour.
    pub requests_per_hour: Option<u32>,
    /// Simultaneous in-flight requests.
    pub max_concurrent: Option<u32>,
}

/// Per-domain limits.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct DomainLimitsSection {
    /// Requests per rolling minute.
    pub requests_per_minute: Option<u32>,
    /// Requests per rolling hour.
    pub requests_per_hour: Option<u32>,
}

/// `rate_limits` section.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RateLimitsSection {
    /// Enable rate limiting.
    pub enabled: Option<bool>,
    /// Agent-keyed limits.
    #[serde(default)]
    pub per_agent: AgentLimitsSection,
    /// Domain-keyed limits.
    #[serde(default)]
    pub per_domain: DomainLimitsSection,
}

/// An agent profile as written in a document.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AgentProfileSpec {
    /// Profile name.
    pub name: String,
    /// Case-insensitive substrings of process name or path.
    #[serde(default, alias = "processPatterns")]
    pub process_patterns: Vec<String>,
    /// Domains this agent may reach beyond the global allow list.
    #[serde(default, alias = "allowedDomainsExtra")]
    pub allowed_domains_extra: Vec<String>,
    /// Body size cap for this agent.
    #[serde(default, alias = "maxBodyBytes")]
    pub max_body_bytes: Option<u64>,
}

/// `agents.unknown_agent` section.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct UnknownAgentSection {
    /// Action for unidentified agents on first contact.
    pub action: Option<PolicyAction>,
    /// Body size cap for unidentified agents.
    pub max_body_bytes: Option<u64>,
}

/// `agents` section.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AgentsSection {
    /// Known agent profiles.
    #[serde(default)]
    pub profiles: Vec<AgentProfileSpec>,
    /// Fallback for unidentified agents.
    #[serde(default)]
    pub unknown_agent: UnknownAgentSection,
}

/// Serialization format of a policy file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyFormat {
    /// `.yaml` / `.yml`
    Yaml,
    /// `.toml`
    Toml,
}

impl PolicyFormat {
    /// Infer the format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Some(Self::Yaml),
            Some("toml") => Some(Self::Toml),
            _ => None,
        }
    }
}

impl PolicyDocument {
    /// Parse and validate a document.
    pub fn parse(
        source: &str,
        format: PolicyFormat,
        file: &Path,
    ) -> Result<Self, PolicyValidationError> {
        let document: PolicyDocument = match format {
            PolicyFormat::Yaml => serde_yaml::from_str(source)
                .map_err(|e| PolicyValidationError::new(file, "<document>", e.to_string()))?,
            PolicyFormat::Toml => toml::from_str(source)
                .map_err(|e| PolicyValidationError::new(file, "<document>", e.to_string()))?,
        };
        document.validate(file)?;
        Ok(document)
    }

    /// Check required fields and value ranges.
    pub fn validate(&self, file: &Path) -> Result<(), PolicyValidationError> {
        let fail = |field: &str, message: &str| -> Result<(), PolicyValidationError> {
            Err(PolicyValidationError::new(file, field, message))
        };

        match self.name.as_deref() {
            None => return fail("name", "is required"),
            Some(name) if name.trim().is_empty() => return fail("name", "must not be empty"),
            Some(_) => {}
        }

        match self.global.default_action {
            None => return fail("global.default_action", "is required"),
            Some(PolicyAction::Alert) => {
                return fail("global.default_action", "must be allow, block, or require_approval");
            }
            Some(_) => {}
        }

        if self.global.new_domain_action == Some(PolicyAction::Alert) {
            return fail("global.new_domain_action", "must be allow, block, or require_approval");
        }
        if self.global.max_request_body_bytes == Some(0) {
            return fail("global.max_request_body_bytes", "must be greater than zero");
        }

        let agent = &self.rate_limits.per_agent;
        let domain = &self.rate_limits.per_domain;
        for (field, value) in [
            ("rate_limits.per_agent.requests_per_minute", agent.requests_per_minute),
            ("rate_limits.per_agent.requests_per_hour", agent.requests_per_hour),
            ("rate_limits.per_agent.max_concurrent", agent.max_concurrent),
            ("rate_limits.per_domain.requests_per_minute", domain.requests_per_minute),
            ("rate_limits.per_domain.requests_per_hour", domain.requests_per_hour),
        ] {
            if value == Some(0) {
                return fail(field, "must be greater than zero");
            }
        }

        if let Some(min_entropy) = self.secrets.entropy_detection.min_entropy
            && !(min_entropy > 0.0 && min_entropy <= 8.0)
        {
            return fail(
                "secrets.entropy_detection.min_entropy",
                "must be in the range (0, 8]",
            );
        }

        for (i, spec) in self.secrets.patterns.iter().enumerate() {
            if spec.name.trim().is_empty() {
                return fail(&format!("secrets.patterns[{i}].name"), "must not be empty");
            }
            if let Err(e) = Regex::new(&spec.pattern) {
                return fail(&format!("secrets.patterns[{i}].pattern"), &e.to_string());
            }
        }

        for (i, profile) in self.agents.profiles.iter().enumerate() {
            if profile.process_patterns.is_empty() {
                return fail(
                    &format!("agents.profiles[{i}].process_patterns"),
                    "must list at least one pattern",
                );
            }
        }

        Ok(())
    }

    /// Fill unset fields of `self` from a lower-precedence document.
    ///
    /// Scalars already set in `self` are kept; list fields are appended.
    pub fn absorb(&mut self, lower: &PolicyDocument) {
        fill(&mut self.version, &lower.version);
        fill(&mut self.name, &lower.name);
        fill(&mut self.priority, &lower.priority);

        let (g, lg) = (&mut self.global, &lower.global);
        fill(&mut g.default_action, &lg.default_action);
        fill(&mut g.log_all_requests, &lg.log_all_requests);
        fill(&mut g.intent_analysis, &lg.intent_analysis);
        fill(&mut g.max_request_body_bytes, &lg.max_request_body_bytes);
        fill(&mut g.new_domain_action, &lg.new_domain_action);

        self.domains.allowed.extend_from_slice(&lower.domains.allowed);
        self.domains.denied.extend_from_slice(&lower.domains.denied);
        self.domains
            .require_approval
            .extend_from_slice(&lower.domains.require_approval);

        let (s, ls) = (&mut self.secrets, &lower.secrets);
        fill(&mut s.enabled, &ls.enabled);
        fill(&mut s.action, &ls.action);
        s.patterns.extend_from_slice(&ls.patterns);
        let (e, le) = (&mut s.entropy_detection, &ls.entropy_detection);
        fill(&mut e.enabled, &le.enabled);
        fill(&mut e.min_length, &le.min_length);
        fill(&mut e.min_entropy, &le.min_entropy);
        fill(&mut e.action, &le.action);

        let (f, lf) = (&mut self.sensitive_files, &lower.sensitive_files);
        fill(&mut f.enabled, &lf.enabled);
        fill(&mut f.action, &lf.action);
        f.paths.extend_from_slice(&lf.paths);

        let (r, lr) = (&mut self.rate_limits, &lower.rate_limits);
        fill(&mut r.enabled, &lr.enabled);
        fill(&mut r.per_agent.requests_per_minute, &lr.per_agent.requests_per_minute);
        fill(&mut r.per_agent.requests_per_hour, &lr.per_agent.requests_per_hour);
        fill(&mut r.per_agent.max_concurrent, &lr.per_agent.max_concurrent);
        fill(&mut r.per_domain.requests_per_minute, &lr.per_domain.requests_per_minute);
        fill(&mut r.per_domain.requests_per_hour, &lr.per_domain.requests_per_hour);

        self.agents.profiles.extend_from_slice(&lower.agents.profiles);
        fill(&mut self.agents.unknown_agent.action, &lower.agents.unknown_agent.action);
        fill(
            &mut self.agents.unknown_agent.max_body_bytes,
            &lower.agents.unknown_agent.max_body_bytes,
        );
    }

    /// Number of rules this document contributes (for dashboards).
    pub fn rule_count(&self) -> usize {
        self.domains.allowed.len()
            + self.domains.denied.len()
            + self.domains.require_approval.len()
            + self.secrets.patterns.len()
            + self.sensitive_files.paths.len()
            + self.agents.profiles.len()
    }
}

fn fill<T: Clone>(slot: &mut Option<T>, lower: &Option<T>) {
    if slot.is_none() {
        slot.clone_from(lower);
    }
}
