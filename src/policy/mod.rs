//! Declarative security policy.
//!
//! Policy documents live in a directory and are merged into one
//! [`EffectivePolicy`]. Components never hold a reference to the engine's
//! internals; they ask for a [`PolicySnapshot`] and evaluate against it.

mod document;
mod engine;
mod error;
pub mod glob;

pub use document::{
    AgentProfileSpec, DomainsSection, GlobalSection, PolicyAction, PolicyDocument, PolicyFormat,
    RateLimitsSection, SecretPatternSpec, SecretsSection,
};
pub use engine::{
    AgentLimits, AgentProfile, AgentRules, DomainClass, DomainLimits, DomainRules,
    EffectivePolicy, EntropyRules, GlobalPolicy, LoadReport, LoadedPolicy, PolicyEngine,
    PolicySnapshot, RateLimits, SecretRules, SecretSignature, SensitiveFileRules,
    UnknownAgentRules, builtin_profiles,
};
pub use error::{PolicyError, PolicyValidationError};
pub use glob::{DomainGlobs, matches_glob};
