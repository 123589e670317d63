//! Built-in credential signatures.
//!
//! These are always active while secret scanning is enabled. Policy
//! documents add to them through `secrets.patterns`; they cannot remove them.

use regex::Regex;

/// Name and expression of every built-in signature.
const BUILTIN: &[(&str, &str)] = &[
    ("AWS Access Key", r"\b(?:AKIA|ASIA)[0-9A-Z]{16}\b"),
    ("Stripe Secret Key", r"\b(?:sk|rk)_(?:live|test)_[0-9A-Za-z]{16,}"),
    ("GitHub Token", r"\bgh[pousr]_[A-Za-z0-9]{36,}"),
    ("GitHub Token", r"\bgithub_pat_[A-Za-z0-9_]{22,}"),
    (
        "JWT Token",
        r"\beyJ[A-Za-z0-9_-]{5,}\.[A-Za-z0-9_-]{5,}\.[A-Za-z0-9_-]{5,}",
    ),
    (
        "Database Connection String",
        r"\b(?:postgres(?:ql)?|mysql|mariadb|mongodb(?:\+srv)?|rediss?|amqps?|mssql)://[^\s:/@]+:[^\s@]+@[^\s/:]+",
    ),
    (
        "Private Key",
        r"-----BEGIN (?:[A-Z]+ )*PRIVATE KEY-----",
    ),
];

/// A compiled built-in signature.
#[derive(Debug, Clone)]
pub struct BuiltinSignature {
    pub name: &'static str,
    pub regex: Regex,
}

/// Compile the built-in signature set.
pub fn builtin_signatures() -> Result<Vec<BuiltinSignature>, regex::Error> {
    BUILTIN
        .iter()
        .map(|&(name, pattern)| {
            Ok(BuiltinSignature {
                name,
                regex: Regex::new(pattern)?,
            })
        })
        .collect()
}
