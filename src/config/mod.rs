//! Runtime configuration.
//!
//! Two layers, kept separate on purpose:
//!
//! - the core's own knobs load from `{data_dir}/config.toml` with
//!   CLI / env > TOML > built-in default precedence;
//! - user-facing surfaces (`.claude/settings.json` with its `permissions`
//!   and `hooks` blocks) are JSON, discovered in the project directory
//!   first and the home directory second.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{error, warn};

use crate::rules::{parse_rule, PermissionRule, RuleAction, RuleSource, RuleSet};

const DEFAULT_LOG: &str = "info";

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// Log level filter string, e.g. "debug", "info,agentd=trace" (default: "info").
    log: Option<String>,
    /// Checkpoint storage cap in megabytes.
    checkpoint_max_storage_mb: Option<u64>,
    /// Edits on a file before an automatic checkpoint.
    auto_checkpoint_edits: Option<u32>,
    /// Chain length cap per file.
    max_checkpoints_per_file: Option<usize>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(config) => Some(config),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── CoreConfig ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Root for everything the core persists: audit logs, agents/,
    /// checkpoints/, the advisory lock.
    pub data_dir: PathBuf,
    /// The working copy this core instance serves.
    pub working_dir: PathBuf,
    pub log: String,
    pub checkpoint_max_storage_mb: u64,
    pub auto_checkpoint_edits: u32,
    pub max_checkpoints_per_file: usize,
}

impl CoreConfig {
    /// Build config from CLI/env args + the optional TOML file.
    pub fn new(
        data_dir: Option<PathBuf>,
        working_dir: Option<PathBuf>,
        log: Option<String>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let working_dir = working_dir
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        let toml = load_toml(&data_dir).unwrap_or_default();
        let log = log.or(toml.log).unwrap_or_else(|| DEFAULT_LOG.to_string());

        Self {
            data_dir,
            working_dir,
            log,
            checkpoint_max_storage_mb: toml
                .checkpoint_max_storage_mb
                .unwrap_or(crate::checkpoint::MAX_STORAGE_MB),
            auto_checkpoint_edits: toml
                .auto_checkpoint_edits
                .unwrap_or(crate::checkpoint::DEFAULT_AUTO_CHECKPOINT_EDITS),
            max_checkpoints_per_file: toml
                .max_checkpoints_per_file
                .unwrap_or(crate::checkpoint::MAX_CHECKPOINTS_PER_FILE),
        }
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.data_dir.join("agents")
    }

    pub fn checkpoint_root(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    pub fn checkpoint_config(&self) -> crate::checkpoint::CheckpointConfig {
        crate::checkpoint::CheckpointConfig {
            root: self.checkpoint_root(),
            max_checkpoints_per_file: self.max_checkpoints_per_file,
            max_storage_mb: self.checkpoint_max_storage_mb,
            auto_checkpoint_edits: self.auto_checkpoint_edits,
        }
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("agentd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("agentd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("agentd");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("agentd");
        }
    }
    // Fallback
    PathBuf::from(".agentd")
}

// ─── settings.json ────────────────────────────────────────────────────────────

/// The `permissions` block of `.claude/settings.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PermissionSettings {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// The parts of `.claude/settings.json` the core consumes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub permissions: PermissionSettings,
    /// Raw hooks value, handed to the hook config loader.
    #[serde(default)]
    pub hooks: Option<serde_json::Value>,
}

impl Settings {
    /// Load settings: `{project}/.claude/settings.json` first, then
    /// `$HOME/.claude/settings.json`. The first existing file wins.
    pub fn load(project_dir: &Path) -> (Self, RuleSource) {
        let home = std::env::var("HOME").ok().map(PathBuf::from);
        Self::load_with_home(project_dir, home)
    }

    fn load_with_home(project_dir: &Path, home: Option<PathBuf>) -> (Self, RuleSource) {
        let mut candidates = vec![(
            project_dir.join(".claude").join("settings.json"),
            RuleSource::Project,
        )];
        if let Some(home) = home {
            candidates.push((
                home.join(".claude").join("settings.json"),
                RuleSource::Settings,
            ));
        }

        for (path, source) in candidates {
            if !path.is_file() {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(contents) => match serde_json::from_str::<Settings>(&contents) {
                    Ok(settings) => {
                        tracing::info!(path = %path.display(), "settings loaded");
                        return (settings, source);
                    }
                    Err(e) => {
                        warn!(path = %path.display(), err = %e, "invalid settings.json — ignored");
                        return (Settings::default(), source);
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), err = %e, "could not read settings.json");
                    return (Settings::default(), source);
                }
            }
        }
        (Settings::default(), RuleSource::Settings)
    }

    /// Parse the permissions block into rules. Malformed rules are skipped
    /// with a warning, matching how the rest of the config surface degrades.
    pub fn permission_rules(&self, source: RuleSource) -> Vec<PermissionRule> {
        let mut rules = Vec::new();
        for (list, action) in [
            (&self.permissions.allow, RuleAction::Allow),
            (&self.permissions.deny, RuleAction::Deny),
        ] {
            for raw in list {
                match parse_rule(raw, action, source) {
                    Ok(rule) => rules.push(rule),
                    Err(e) => warn!(rule = %raw, err = %e, "invalid permission rule — skipped"),
                }
            }
        }
        rules
    }
}

/// Assemble the effective rule set: CLI rules first, then settings rules.
pub fn build_rule_set(cli_rules: Vec<PermissionRule>, settings: &Settings, source: RuleSource) -> RuleSet {
    let mut set = RuleSet::new();
    set.extend(cli_rules);
    set.extend(settings.permission_rules(source));
    set
}
