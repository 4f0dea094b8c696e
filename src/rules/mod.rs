//! `rules` — permission rule DSL and rule-set evaluation.
//!
//! A rule names a tool and optionally constrains its arguments:
//!
//! - `Bash` / `Bash()` / `Bash(*)` — any invocation of the tool.
//! - `Bash(npm install:*)` — word-boundary command prefix.
//! - `Bash(npm test)` — exact command string.
//! - `Read(src/**/*.rs)` — path glob (standard shell globbing, `**` crosses
//!   directory boundaries).
//! - `*` — every tool.
//!
//! Evaluation is strict: any matching deny rule wins over any matching allow
//! rule, independent of rule order; with no match the caller's default
//! applies.

pub mod matcher;
pub mod parse;

pub use parse::{parse_rule, parse_rule_list, RuleParseError};

use serde::{Deserialize, Serialize};

// ─── Rule model ───────────────────────────────────────────────────────────────

/// Whether a matching rule permits or refuses the invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
}

/// Where a rule was loaded from. Used for audit records and UI display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSource {
    Cli,
    Settings,
    Project,
    Session,
}

/// Argument constraint attached to a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgPattern {
    /// Any arguments match.
    Any,
    /// Word-boundary prefix of `params.command` (written `Tool(prefix:*)`).
    Prefix(String),
    /// Literal equality of the relevant parameter.
    Exact(String),
    /// Path glob over `params.file_path`.
    Glob(String),
}

/// One parsed permission rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRule {
    /// Tool name, or `"*"` for every tool.
    pub tool: String,
    pub pattern: ArgPattern,
    pub action: RuleAction,
    pub source: RuleSource,
}

impl PermissionRule {
    /// Serialize back to the canonical DSL string.
    ///
    /// `Tool()` and `Tool(*)` both canonicalize to the bare tool name, so
    /// parse → canonical → parse is a fixed point.
    pub fn canonical(&self) -> String {
        match &self.pattern {
            ArgPattern::Any => self.tool.clone(),
            ArgPattern::Prefix(p) => format!("{}({}:*)", self.tool, p),
            ArgPattern::Exact(lit) => format!("{}({})", self.tool, lit),
            ArgPattern::Glob(pat) => format!("{}({})", self.tool, pat),
        }
    }
}

/// A tool invocation to be checked against the rule set.
#[derive(Debug, Clone, Copy)]
pub struct ToolInvocation<'a> {
    pub tool: &'a str,
    pub params: &'a serde_json::Value,
}

// ─── Rule set ─────────────────────────────────────────────────────────────────

/// Outcome of evaluating an invocation against a rule set.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleDecision {
    /// A deny rule matched. Deny always wins, regardless of order.
    Deny { rule: PermissionRule },
    /// No deny rule matched but an allow rule did.
    Allow { rule: PermissionRule },
    /// No rule matched; the caller-provided default applies.
    Default { action: RuleAction },
}

impl RuleDecision {
    pub fn action(&self) -> RuleAction {
        match self {
            RuleDecision::Deny { .. } => RuleAction::Deny,
            RuleDecision::Allow { .. } => RuleAction::Allow,
            RuleDecision::Default { action } => *action,
        }
    }

    /// The rule that produced this decision, if any.
    pub fn matched_rule(&self) -> Option<&PermissionRule> {
        match self {
            RuleDecision::Deny { rule } | RuleDecision::Allow { rule } => Some(rule),
            RuleDecision::Default { .. } => None,
        }
    }
}

/// An ordered collection of rules with strict deny-over-allow evaluation.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<PermissionRule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn from_rules(rules: Vec<PermissionRule>) -> Self {
        Self { rules }
    }

    pub fn push(&mut self, rule: PermissionRule) {
        self.rules.push(rule);
    }

    pub fn extend(&mut self, rules: impl IntoIterator<Item = PermissionRule>) {
        self.rules.extend(rules);
    }

    pub fn rules(&self) -> &[PermissionRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate an invocation.
    ///
    /// Deny rules are scanned first so that a deny anywhere in the set wins
    /// over every allow, making the decision independent of rule order.
    pub fn evaluate(&self, inv: &ToolInvocation, default: RuleAction) -> RuleDecision {
        if let Some(rule) = self
            .rules
            .iter()
            .find(|r| r.action == RuleAction::Deny && r.matches(inv))
        {
            return RuleDecision::Deny { rule: rule.clone() };
        }
        if let Some(rule) = self
            .rules
            .iter()
            .find(|r| r.action == RuleAction::Allow && r.matches(inv))
        {
            return RuleDecision::Allow { rule: rule.clone() };
        }
        RuleDecision::Default { action: default }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(s: &str, action: RuleAction) -> PermissionRule {
        parse_rule(s, action, RuleSource::Cli).unwrap()
    }

    fn bash(command: &str) -> serde_json::Value {
        json!({ "command": command })
    }

    #[test]
    fn deny_wins_over_allow() {
        // allow Bash(npm:*), deny Bash(npm install:*)
        let set = RuleSet::from_rules(vec![
            rule("Bash(npm:*)", RuleAction::Allow),
            rule("Bash(npm install:*)", RuleAction::Deny),
        ]);

        let params = bash("npm install lodash");
        let inv = ToolInvocation { tool: "Bash", params: &params };
        assert_eq!(set.evaluate(&inv, RuleAction::Allow).action(), RuleAction::Deny);

        let params = bash("npm test");
        let inv = ToolInvocation { tool: "Bash", params: &params };
        assert_eq!(set.evaluate(&inv, RuleAction::Deny).action(), RuleAction::Allow);

        // Unmatched tool falls back to the default.
        let params = bash("yarn add lodash");
        let inv = ToolInvocation { tool: "Bash", params: &params };
        assert_eq!(set.evaluate(&inv, RuleAction::Allow).action(), RuleAction::Allow);
    }

    #[test]
    fn decision_is_order_independent() {
        let forward = RuleSet::from_rules(vec![
            rule("Bash(npm:*)", RuleAction::Allow),
            rule("Bash(npm install:*)", RuleAction::Deny),
        ]);
        let reverse = RuleSet::from_rules(vec![
            rule("Bash(npm install:*)", RuleAction::Deny),
            rule("Bash(npm:*)", RuleAction::Allow),
        ]);

        let params = bash("npm install x");
        let inv = ToolInvocation { tool: "Bash", params: &params };
        assert_eq!(
            forward.evaluate(&inv, RuleAction::Allow).action(),
            reverse.evaluate(&inv, RuleAction::Allow).action(),
        );
    }

    #[test]
    fn wildcard_tool_matches_everything() {
        let set = RuleSet::from_rules(vec![rule("*", RuleAction::Deny)]);
        let params = json!({});
        for tool in ["Bash", "Read", "Write"] {
            let inv = ToolInvocation { tool, params: &params };
            assert_eq!(set.evaluate(&inv, RuleAction::Allow).action(), RuleAction::Deny);
        }
    }

    #[test]
    fn empty_set_uses_default() {
        let set = RuleSet::new();
        let params = bash("ls");
        let inv = ToolInvocation { tool: "Bash", params: &params };
        assert_eq!(set.evaluate(&inv, RuleAction::Deny).action(), RuleAction::Deny);
        assert_eq!(set.evaluate(&inv, RuleAction::Allow).action(), RuleAction::Allow);
    }

    #[test]
    fn matched_rule_is_reported() {
        let set = RuleSet::from_rules(vec![rule("Bash(npm install:*)", RuleAction::Deny)]);
        let params = bash("npm install left-pad");
        let inv = ToolInvocation { tool: "Bash", params: &params };
        let decision = set.evaluate(&inv, RuleAction::Allow);
        assert_eq!(
            decision.matched_rule().map(|r| r.canonical()),
            Some("Bash(npm install:*)".to_string())
        );
    }
}
