pub mod agents;
pub mod checkpoint;
pub mod config;
pub mod hooks;
pub mod lockdir;
pub mod lsp;
pub mod permissions;
pub mod rules;
pub mod shell;

use std::sync::Arc;

use anyhow::{Context as _, Result};

use agents::{AgentScheduler, EchoRunner};
use checkpoint::CheckpointSession;
use config::{CoreConfig, Settings};
use hooks::HookDispatcher;
use lockdir::DirLock;
use lsp::LspSupervisor;
use permissions::PermissionGate;
use rules::{PermissionRule, RuleSet};
use shell::ShellEngine;

/// Shared core state handed to every caller.
///
/// All registries are constructor-created component instances — nothing is
/// process-global, so several cores can coexist in one process and tests
/// build fresh state per case.
pub struct CoreContext {
    pub config: CoreConfig,
    pub gate: Arc<PermissionGate>,
    pub hooks: Arc<HookDispatcher>,
    pub shell: Arc<ShellEngine>,
    pub lsp: Arc<LspSupervisor>,
    pub agents: Arc<AgentScheduler>,
    pub checkpoints: Arc<CheckpointSession>,
    /// Advisory lock on `data_dir`; held for the context's lifetime.
    _lock: DirLock,
}

impl std::fmt::Debug for CoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CoreContext {
    /// Wire the engines together: lock the data root, load settings, build
    /// the rule set, register hooks, open a checkpoint session, and recover
    /// persisted agent records.
    pub async fn initialize(config: CoreConfig, cli_rules: Vec<PermissionRule>) -> Result<Self> {
        let lock = DirLock::acquire(&config.data_dir)
            .with_context(|| format!("locking data dir {}", config.data_dir.display()))?;

        let (settings, source) = Settings::load(&config.working_dir);
        let rule_set: RuleSet = config::build_rule_set(cli_rules, &settings, source);
        let gate = Arc::new(PermissionGate::new(&config.data_dir, rule_set));

        let hooks = Arc::new(HookDispatcher::default());
        if let Some(hooks_value) = &settings.hooks {
            let n = hooks::load_hooks_value(hooks.registry(), hooks_value).await;
            tracing::info!(count = n, "hooks loaded from settings");
        }
        hooks::load_hooks_dir(hooks.registry(), &config.working_dir).await;

        let checkpoints = CheckpointSession::init(config.checkpoint_config(), &config.working_dir)
            .await
            .context("opening checkpoint session")?;

        let agents = Arc::new(AgentScheduler::new(config.agents_dir(), Arc::new(EchoRunner)));
        let recovered = agents.recover().await.context("recovering agent records")?;
        if recovered > 0 {
            tracing::info!(count = recovered, "agent records recovered");
        }

        let lsp = Arc::new(LspSupervisor::new(&config.working_dir));
        lsp.load_configs().await;

        Ok(Self {
            config,
            gate,
            hooks,
            shell: Arc::new(ShellEngine::new()),
            lsp,
            agents,
            checkpoints: Arc::new(checkpoints),
            _lock: lock,
        })
    }
}
