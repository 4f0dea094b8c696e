//! Rule DSL parser.
//!
//! Grammar:
//!
//! ```text
//! rule     := "*" | tool | tool "(" inner ")"
//! inner    := "" | "*" | prefix ":*" | literal | glob
//! tool     := ident   (first char alphabetic or '_', then [A-Za-z0-9_-])
//! ```
//!
//! `inner` containing any of `* ? { } [ ]` (and not ending in `:*`) is a
//! glob; otherwise it is an exact literal. The prefix form is checked first
//! so `npm install:*` never parses as a glob.

use thiserror::Error;

use super::{ArgPattern, PermissionRule, RuleAction, RuleSource};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleParseError {
    #[error("empty rule")]
    Empty,
    #[error("mismatched parentheses in rule '{0}'")]
    MismatchedParens(String),
    #[error("rule must start with a tool name or '*': '{0}'")]
    BadToolName(String),
    #[error("empty command prefix in rule '{0}'")]
    EmptyPrefix(String),
}

/// Parse a single rule string.
pub fn parse_rule(
    input: &str,
    action: RuleAction,
    source: RuleSource,
) -> Result<PermissionRule, RuleParseError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(RuleParseError::Empty);
    }

    // Bare `*` is the tool wildcard.
    if s == "*" {
        return Ok(PermissionRule {
            tool: "*".to_string(),
            pattern: ArgPattern::Any,
            action,
            source,
        });
    }

    let Some(open) = s.find('(') else {
        // No parameter part: the whole string must be a tool identifier.
        if s.contains(')') {
            return Err(RuleParseError::MismatchedParens(s.to_string()));
        }
        validate_tool(s)?;
        return Ok(PermissionRule {
            tool: s.to_string(),
            pattern: ArgPattern::Any,
            action,
            source,
        });
    };

    if !s.ends_with(')') {
        return Err(RuleParseError::MismatchedParens(s.to_string()));
    }

    let tool = &s[..open];
    let inner = &s[open + 1..s.len() - 1];
    if inner.contains('(') || inner.contains(')') {
        return Err(RuleParseError::MismatchedParens(s.to_string()));
    }
    validate_tool(tool)?;

    let pattern = if inner.is_empty() || inner == "*" {
        ArgPattern::Any
    } else if let Some(prefix) = inner.strip_suffix(":*") {
        if prefix.is_empty() {
            return Err(RuleParseError::EmptyPrefix(s.to_string()));
        }
        ArgPattern::Prefix(prefix.to_string())
    } else if inner
        .chars()
        .any(|c| matches!(c, '*' | '?' | '{' | '}' | '[' | ']'))
    {
        ArgPattern::Glob(inner.to_string())
    } else {
        ArgPattern::Exact(inner.to_string())
    };

    Ok(PermissionRule {
        tool: tool.to_string(),
        pattern,
        action,
        source,
    })
}

/// Parse a comma- or newline-separated rule list (the CLI flag format).
///
/// Empty segments are skipped; the first malformed rule fails the whole list.
pub fn parse_rule_list(
    input: &str,
    action: RuleAction,
    source: RuleSource,
) -> Result<Vec<PermissionRule>, RuleParseError> {
    input
        .split(|c| c == ',' || c == '\n')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_rule(s, action, source))
        .collect()
}

fn validate_tool(tool: &str) -> Result<(), RuleParseError> {
    let mut chars = tool.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return Err(RuleParseError::BadToolName(tool.to_string())),
    }
    if chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        Ok(())
    } else {
        Err(RuleParseError::BadToolName(tool.to_string()))
    }
}
