//! Subject syntax and matching.
//!
//! Subjects are dot-separated tokens such as `busrpc.User.GetById`.
//! Subscriptions may use `*` to match exactly one token and a trailing `>` to
//! match one or more remaining tokens. Published subjects are always literal.

use crate::error::{Result, RpcError};

/// Check a subscription pattern.
pub fn validate_pattern(subject: &str) -> Result<()> {
    validate(subject, true).map_err(|reason| RpcError::Subscribe {
        subject: subject.to_string(),
        reason: reason.to_string(),
    })
}

/// Check a publish subject; wildcards are not allowed.
pub fn validate_literal(subject: &str) -> Result<()> {
    validate(subject, false)
        .map_err(|reason| RpcError::Transport(format!("invalid subject '{subject}': {reason}")))
}

fn validate(subject: &str, allow_wildcards: bool) -> std::result::Result<(), &'static str> {
    if subject.is_empty() {
        return Err("subject is empty");
    }
    let tokens: Vec<&str> = subject.split('.').collect();
    let last = tokens.len() - 1;
    for (i, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            return Err("empty token");
        }
        if token.chars().any(char::is_whitespace) {
            return Err("whitespace in subject");
        }
        let is_wildcard = *token == "*" || *token == ">";
        if !is_wildcard && (token.contains('*') || token.contains('>')) {
            return Err("wildcard must be a whole token");
        }
        if is_wildcard && !allow_wildcards {
            return Err("wildcards are not allowed here");
        }
        if *token == ">" && i != last {
            return Err("'>' must be the last token");
        }
    }
    Ok(())
}

/// Does `subject` (literal) match `pattern` (possibly wildcarded)?
#[must_use]
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
