//! Subject names and patterns.
//!
//! Subjects are dot-separated tokens (`books.delete`). Patterns may use two
//! wildcards: `*` stands for exactly one token, and `>` stands for one or
//! more trailing tokens and may only appear last.

use crate::error::{ErrorKind, Result};

const SINGLE: &str = "*";
const TAIL: &str = ">";

fn check_tokens(subject: &str, allow_wildcards: bool) -> Result<()> {
    if subject.is_empty() || subject.chars().any(char::is_whitespace) {
        exn::bail!(ErrorKind::InvalidSubject(subject.to_string()));
    }
    let tokens: Vec<&str> = subject.split('.').collect();
    for (i, token) in tokens.iter().enumerate() {
        let valid = match *token {
            "" => false,
            SINGLE => allow_wildcards,
            TAIL => allow_wildcards && i == tokens.len() - 1,
            other => !other.contains(['*', '>']),
        };
        if !valid {
            exn::bail!(ErrorKind::InvalidSubject(subject.to_string()));
        }
    }
    Ok(())
}

/// Validate a concrete subject that messages can be published to.
pub fn validate_subject(subject: &str) -> Result<()> {
    check_tokens(subject, false)
}

/// Validate a subject pattern used by streams and consumer filters.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    check_tokens(pattern, true)
}

/// Does the concrete `subject` fall under `pattern`?
///
/// Both are assumed valid; an invalid input simply fails to match.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern = pattern.split('.');
    let mut subject = subject.split('.');
    loop {
        match (pattern.next(), subject.next()) {
            (Some(TAIL), Some(_)) => return true,
            (Some(SINGLE), Some(_)) => {},
            (Some(p), Some(s)) if p == s => {},
            (None, None) => return true,
            _ => return false,
        }
    }
}
