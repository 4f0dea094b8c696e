//! Rule matching against concrete tool invocations.
//!
//! Prefix matching is word-boundary: `npm install:*` matches `npm install x`
//! and `npm install`, never `npm installer`. Globs use standard shell
//! semantics (`*` stays inside a path segment, `**` crosses separators,
//! `{a,b}` alternates) and apply to `params.file_path`.

use globset::GlobBuilder;

use super::{ArgPattern, PermissionRule, ToolInvocation};

impl PermissionRule {
    /// Does this rule match the invocation?
    pub fn matches(&self, inv: &ToolInvocation) -> bool {
        if self.tool != "*" && self.tool != inv.tool {
            return false;
        }
        match &self.pattern {
            ArgPattern::Any => true,
            ArgPattern::Prefix(prefix) => param_str(inv, "command")
                .map(|command| prefix_matches(prefix, command))
                .unwrap_or(false),
            ArgPattern::Exact(lit) => relevant_param(inv).map(|p| p == lit).unwrap_or(false),
            ArgPattern::Glob(pattern) => param_str(inv, "file_path")
                .map(|path| glob_matches(pattern, path))
                .unwrap_or(false),
        }
    }
}

fn param_str<'a>(inv: &'a ToolInvocation, key: &str) -> Option<&'a str> {
    inv.params.get(key).and_then(|v| v.as_str())
}

/// The parameter an exact pattern compares against: `command` for shell
/// tools, `file_path` for file tools.
fn relevant_param<'a>(inv: &'a ToolInvocation) -> Option<&'a str> {
    param_str(inv, "command").or_else(|| param_str(inv, "file_path"))
}

fn prefix_matches(prefix: &str, command: &str) -> bool {
    match command.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with(char::is_whitespace),
        None => false,
    }
}

fn glob_matches(pattern: &str, path: &str) -> bool {
    match GlobBuilder::new(pattern).literal_separator(true).build() {
        Ok(glob) => glob.compile_matcher().is_match(path),
        Err(e) => {
            tracing::warn!(pattern, err = %e, "invalid glob in permission rule — treating as non-match");
            false
        }
    }
}
