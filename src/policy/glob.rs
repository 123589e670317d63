//! Case-insensitive domain glob matching.
//!
//! - Exact match: `github.com`
//! - Wildcard match: `*.github.com` matches `api.github.com` and
//!   `a.b.github.com` but NOT `github.com` itself
//! - `*` may appear anywhere and matches any run of characters, so
//!   `api-*.example.com` and `*` are valid too

use std::collections::HashSet;

/// A compiled list of domain globs, split into exact names and wildcards.
#[derive(Debug, Clone, Default)]
pub struct DomainGlobs {
    exact: HashSet<String>,
    wildcards: Vec<String>,
}

impl DomainGlobs {
    /// Compile a list of patterns. Patterns are lowercased.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let mut exact = HashSet::new();
        let mut wildcards = Vec::new();

        for pattern in patterns {
            let pattern_lower = pattern.as_ref().trim().to_lowercase();
            if pattern_lower.is_empty() {
                continue;
            }
            if pattern_lower.contains('*') {
                wildcards.push(pattern_lower);
            } else {
                exact.insert(pattern_lower);
            }
        }

        Self { exact, wildcards }
    }

    /// Return the first pattern matching `domain`, if any.
    pub fn find(&self, domain: &str) -> Option<&str> {
        let domain_lower = domain.to_lowercase();
        if let Some(hit) = self.exact.get(&domain_lower) {
            return Some(hit.as_str());
        }
        self.wildcards
            .iter()
            .find(|p| matches_glob(p, &domain_lower))
            .map(String::as_str)
    }

    /// Whether any pattern matches `domain`.
    pub fn matches(&self, domain: &str) -> bool {
        self.find(domain).is_some()
    }

    /// Number of patterns.
    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcards.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Match `value` against a glob where `*` matches any (possibly empty) run.
///
/// Comparison is ASCII case-insensitive. Runs in O(pattern * value) worst
/// case with no recursion.
pub fn matches_glob(pattern: &str, value: &str) -> bool {
    let p = pattern.as_bytes();
    let v = value.as_bytes();
    let (mut pi, mut vi) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut resume = 0usize;

    while vi < v.len() {
        if pi < p.len() && p[pi] != b'*' && p[pi].eq_ignore_ascii_case(&v[vi]) {
            pi += 1;
            vi += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some(pi);
            pi += 1;
            resume = vi;
        } else if let Some(s) = star {
            pi = s + 1;
            resume += 1;
            vi = resume;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}
