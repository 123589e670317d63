//! Shannon entropy scoring for tokens without a known signature.

use std::collections::HashMap;

/// Shannon entropy of `value` in bits per character.
pub fn shannon_entropy(value: &str) -> f64 {
    let mut counts: HashMap<char, usize> = HashMap::new();
    let mut total = 0usize;
    for c in value.chars() {
        *counts.entry(c).or_insert(0) += 1;
        total += 1;
    }
    if total == 0 {
        return 0.0;
    }

    let total = total as f64;
    counts
        .values()
        .map(|&n| {
            let p = n as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// Whether a token is shaped like a credential: mixed case plus digits and
/// only characters that appear in keys and base64.
///
/// Identifiers, prose, and punctuation-heavy code fail this check, which keeps
/// ordinary source text from being flagged.
pub fn looks_like_secret_token(token: &str) -> bool {
    let mut upper = false;
    let mut lower = false;
    let mut digit = false;
    for c in token.chars() {
        match c {
            'A'..='Z' => upper = true,
            'a'..='z' => lower = true,
            '0'..='9' => digit = true,
            '+' | '/' | '_' | '=' | '-' => {}
            _ => return false,
        }
    }
    upper && lower && digit
}
