use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use agentd::config::CoreConfig;
use agentd::rules::{parse_rule_list, RuleAction, RuleSource};
use agentd::CoreContext;

#[derive(Parser)]
#[command(name = "agentd", about = "Agentic coding assistant core runtime", version)]
struct Args {
    /// Rules for tools that may run without prompting
    /// (comma- or newline-separated, e.g. "Bash(npm:*),Read").
    #[arg(long = "allow-tools", env = "AGENTD_ALLOW_TOOLS")]
    allow_tools: Option<String>,

    /// Rules for tools that are always refused.
    #[arg(long = "disallow-tools", env = "AGENTD_DISALLOW_TOOLS")]
    disallow_tools: Option<String>,

    /// Resume a paused sub-agent by id.
    #[arg(long)]
    resume: Option<String>,

    /// Prompt to hand to the session once the core is up.
    #[arg(short = 'p', long)]
    prompt: Option<String>,

    /// Model override passed through to sub-agents.
    #[arg(short = 'm', long)]
    model: Option<String>,

    /// Enable debug logging.
    #[arg(short = 'd', long)]
    debug: bool,

    /// Working directory to serve (defaults to the current directory).
    #[arg(long)]
    directory: Option<std::path::PathBuf>,

    /// Data directory for audit logs, agents, and checkpoints.
    #[arg(long, env = "AGENTD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log = if args.debug { Some("debug".to_string()) } else { None };
    let config = CoreConfig::new(args.data_dir, args.directory, log);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log.clone())),
        )
        .init();

    let mut cli_rules = Vec::new();
    if let Some(allow) = &args.allow_tools {
        cli_rules.extend(parse_rule_list(allow, RuleAction::Allow, RuleSource::Cli)?);
    }
    if let Some(deny) = &args.disallow_tools {
        cli_rules.extend(parse_rule_list(deny, RuleAction::Deny, RuleSource::Cli)?);
    }

    let context = CoreContext::initialize(config, cli_rules).await?;
    info!(
        data_dir = %context.config.data_dir.display(),
        working_dir = %context.config.working_dir.display(),
        "core initialized"
    );

    let ready = context.lsp.start_all().await;
    info!(ready, "language servers started");

    if let Some(id) = &args.resume {
        let result = context
            .agents
            .task(agentd::agents::TaskRequest {
                resume: Some(id.clone()),
                background: true,
                ..Default::default()
            })
            .await?;
        info!(agent_id = %result.agent_id, "agent resumed");
    }

    if let Some(prompt) = &args.prompt {
        // The interactive session loop is a collaborator; headless mode runs
        // the prompt through a sub-agent and prints its transcript.
        let result = context
            .agents
            .task(agentd::agents::TaskRequest {
                description: "headless prompt".to_string(),
                prompt: prompt.clone(),
                subagent_type: "general-purpose".to_string(),
                model: args.model.clone(),
                ..Default::default()
            })
            .await?;
        if let Some(output) = result.output {
            print!("{output}");
        }
        context.lsp.stop_all().await;
        return Ok(());
    }

    info!("core running — press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    context.lsp.stop_all().await;
    if let Err(e) = context.checkpoints.enforce_storage_limits().await {
        warn!(err = %e, "checkpoint storage enforcement at shutdown failed");
    }
    Ok(())
}
