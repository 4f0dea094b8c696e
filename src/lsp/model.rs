//! LSP configuration and shared data model.
//!
//! Server specs come from `.lsp.json` (working directory, then
//! `.claude/lsp.json`, then `$HOME/.claude/lsp.json` — first file wins) or
//! from the built-in defaults. Launch specs are environment-expanded once,
//! at start: `${VAR}` and `${VAR:-default}` resolve against the process
//! environment plus `WORKSPACE_ROOT` and `HOME`; an unset variable without
//! a default is preserved verbatim and logged.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Lifecycle state of one language server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Stopped,
    Initializing,
    Ready,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Stdio,
    Socket,
}

/// One server entry of `.lsp.json`, keyed by server name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LspServerConfig {
    /// Injected from the config map key; not part of the entry body.
    #[serde(skip)]
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Extensions this server claims (e.g. `[".rs"]`). When absent,
    /// `extensionToLanguage` keys are used instead.
    #[serde(default)]
    pub file_extensions: Option<Vec<String>>,
    #[serde(default)]
    pub extension_to_language: Option<HashMap<String, String>>,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default)]
    pub initialization_options: Option<serde_json::Value>,
    /// Pushed via `workspace/didChangeConfiguration` once the server is
    /// ready.
    #[serde(default)]
    pub settings: Option<serde_json::Value>,
    #[serde(default)]
    pub workspace_folder: Option<String>,
    /// Milliseconds to wait for the `initialize` reply (default 30 000).
    #[serde(default)]
    pub startup_timeout: Option<u64>,
    /// Milliseconds to wait for a clean exit on stop (default 2 000).
    #[serde(default)]
    pub shutdown_timeout: Option<u64>,
    #[serde(default)]
    pub restart_on_crash: Option<bool>,
    #[serde(default)]
    pub max_restarts: Option<u32>,
    #[serde(default)]
    pub npm_package: Option<String>,
    #[serde(default)]
    pub npm_dependencies: Option<Vec<String>>,
}

impl LspServerConfig {
    /// The extensions this server handles. `fileExtensions` wins; otherwise
    /// the keys of `extensionToLanguage`.
    pub fn extensions(&self) -> Vec<String> {
        if let Some(exts) = &self.file_extensions {
            return exts.clone();
        }
        if let Some(map) = &self.extension_to_language {
            let mut exts: Vec<String> = map.keys().cloned().collect();
            exts.sort();
            return exts;
        }
        Vec::new()
    }

    /// Does this server claim files with the given extension (with or
    /// without the leading dot)?
    pub fn handles_extension(&self, ext: &str) -> bool {
        let bare = ext.trim_start_matches('.');
        self.extensions()
            .iter()
            .any(|e| e.trim_start_matches('.') == bare)
    }

    /// The LSP `languageId` for a path, from `extensionToLanguage` when
    /// configured, else the bare extension.
    pub fn language_id_for(&self, path: &Path) -> String {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        if let Some(map) = &self.extension_to_language {
            for key in [format!(".{ext}"), ext.to_string()] {
                if let Some(lang) = map.get(&key) {
                    return lang.clone();
                }
            }
        }
        ext.to_string()
    }

    /// Expand `${VAR}` / `${VAR:-default}` in the launch spec. Runs once at
    /// start.
    pub fn expanded(&self, workspace_root: &Path) -> Self {
        let mut extra = HashMap::new();
        extra.insert(
            "WORKSPACE_ROOT".to_string(),
            workspace_root.to_string_lossy().to_string(),
        );
        if let Ok(home) = std::env::var("HOME") {
            extra.insert("HOME".to_string(), home);
        }

        let mut expanded = self.clone();
        expanded.command = expand_vars(&self.command, &extra);
        expanded.args = self.args.iter().map(|a| expand_vars(a, &extra)).collect();
        expanded.env = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), expand_vars(v, &extra)))
            .collect();
        expanded.workspace_folder = self
            .workspace_folder
            .as_ref()
            .map(|w| expand_vars(w, &extra));
        expanded
    }

    /// Built-in specs for common language servers; `.lsp.json` entries
    /// override these by name.
    pub fn builtin_defaults() -> Vec<LspServerConfig> {
        fn entry(name: &str, command: &str, args: &[&str], exts: &[&str]) -> LspServerConfig {
            LspServerConfig {
                name: name.to_string(),
                command: command.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
                env: HashMap::new(),
                file_extensions: Some(exts.iter().map(|s| s.to_string()).collect()),
                extension_to_language: None,
                transport: Transport::Stdio,
                initialization_options: None,
                settings: None,
                workspace_folder: None,
                startup_timeout: None,
                shutdown_timeout: None,
                restart_on_crash: Some(true),
                max_restarts: None,
                npm_package: None,
                npm_dependencies: None,
            }
        }

        vec![
            entry("rust", "rust-analyzer", &[], &[".rs"]),
            entry(
                "typescript",
                "typescript-language-server",
                &["--stdio"],
                &[".ts", ".tsx", ".js", ".jsx", ".mjs"],
            ),
            entry("go", "gopls", &[], &[".go"]),
            entry("python", "pylsp", &[], &[".py"]),
        ]
    }
}

static VAR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("static pattern")
});

/// Expand `${VAR}` / `${VAR:-default}` against the process environment plus
/// `extra`. Unset variables without defaults stay verbatim.
pub fn expand_vars(input: &str, extra: &HashMap<String, String>) -> String {
    VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures| {
            let var = &caps[1];
            if let Some(value) = extra.get(var).cloned().or_else(|| std::env::var(var).ok()) {
                value
            } else if let Some(default) = caps.get(2) {
                default.as_str().to_string()
            } else {
                tracing::warn!(var, "undefined variable in launch spec — left unexpanded");
                caps[0].to_string()
            }
        })
        .to_string()
}

// ─── Config file discovery ────────────────────────────────────────────────────

/// Load `.lsp.json`: working directory, then `.claude/lsp.json`, then
/// `$HOME/.claude/lsp.json`; the first existing file wins.
pub fn load_lsp_config(workspace_root: &Path) -> Vec<LspServerConfig> {
    let mut candidates = vec![
        workspace_root.join(".lsp.json"),
        workspace_root.join(".claude").join("lsp.json"),
    ];
    if let Ok(home) = std::env::var("HOME") {
        candidates.push(PathBuf::from(home).join(".claude").join("lsp.json"));
    }

    for path in candidates {
        if !path.is_file() {
            continue;
        }
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                match serde_json::from_str::<HashMap<String, LspServerConfig>>(&contents) {
                    Ok(map) => {
                        let mut configs: Vec<LspServerConfig> = map
                            .into_iter()
                            .map(|(name, mut config)| {
                                config.name = name;
                                config
                            })
                            .collect();
                        configs.sort_by(|a, b| a.name.cmp(&b.name));
                        tracing::info!(
                            path = %path.display(),
                            servers = configs.len(),
                            "LSP config loaded"
                        );
                        return configs;
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), err = %e, "invalid .lsp.json — ignored");
                        return Vec::new();
                    }
                }
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), err = %e, "could not read .lsp.json");
                return Vec::new();
            }
        }
    }
    Vec::new()
}

// ─── Documents & events ───────────────────────────────────────────────────────

/// Client-side state of one document opened against a server.
#[derive(Debug, Clone)]
pub struct OpenDocument {
    pub uri: String,
    pub language_id: String,
    /// Monotonic, starting at 1 on open.
    pub version: i64,
    pub content: String,
}

/// `file://` URI for a local path.
pub fn file_uri(path: &Path) -> String {
    format!("file://{}", path.to_string_lossy())
}

/// Lifecycle notifications emitted by a server, in underlying IO order.
#[derive(Debug, Clone)]
pub enum LspEvent {
    Ready { name: String },
    Exit { name: String, code: Option<i32> },
    ServerError { name: String, message: String },
    Diagnostics { uri: String, diagnostics: serde_json::Value },
    Notification { method: String, params: serde_json::Value },
}
