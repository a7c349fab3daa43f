//! magic-agent - command line entry point.
//!
//! Runs a single agent to completion, chats with one turn by turn, or serves
//! the MCP control surface.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use magic_agent::agents::{AgentSupervisor, RunReport};
use magic_agent::config::{Config, DEFAULT_CONFIG_PATH};
use magic_agent::mcp::{self, McpServer};
use magic_agent::state::{FileStateStore, SessionIndex, StateStore};
use magic_agent::tools::discover_registry;
use magic_agent::{logging, AgentStatus};

/// Autonomous tool-using LLM agent.
#[derive(Parser, Debug)]
#[command(name = "magic-agent", version, about)]
struct Cli {
    /// Config file path.
    #[arg(short, long, env = "MAGIC_AGENT_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log at debug level.
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an agent on a task until it finishes.
    Run {
        #[arg(short, long)]
        task: String,

        /// Session to start, or to resume if it already exists.
        #[arg(short, long)]
        session: Option<String>,
    },
    /// Talk to an agent turn by turn; each line read from stdin is one
    /// message. `exit` or `quit` ends the conversation.
    Chat {
        /// Session to continue; a new one is created when omitted.
        #[arg(short, long)]
        session: Option<String>,
    },
    /// Serve the MCP control surface until Ctrl-C.
    Serve,
    /// List persisted sessions.
    Sessions,
    /// Print a persisted agent state as JSON.
    Inspect { id: String },
    /// List the tools discovered for this configuration.
    Tools,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading configuration {}", cli.config.display()))?;
    logging::init(&config.logging, cli.debug || config.system.debug)?;

    match cli.command {
        Command::Run { task, session } => run(&config, task, session).await,
        Command::Chat { session } => chat(&config, session).await,
        Command::Serve => serve(&config).await,
        Command::Sessions => sessions(&config).await,
        Command::Inspect { id } => inspect(&config, &id).await,
        Command::Tools => tools(&config).await,
    }
}

async fn run(config: &Config, task: String, session: Option<String>) -> anyhow::Result<()> {
    let supervisor = AgentSupervisor::from_config(config).await?;
    let id = match session {
        Some(id) => {
            supervisor.start_or_resume(&task, &id).await?;
            id
        }
        None => supervisor.start(task, None).await?,
    };
    info!(agent = %id, "Agent running");

    let report = tokio::select! {
        report = supervisor.wait(&id) => report?,
        _ = shutdown_signal() => {
            warn!(agent = %id, "Interrupted; stopping agent");
            supervisor
                .shutdown()
                .await
                .into_iter()
                .next()
                .context("agent exited without a report")?
        }
    };
    print_report(&report);

    if report.status == AgentStatus::Failed {
        anyhow::bail!(
            "agent failed: {}",
            report.error.as_deref().unwrap_or(report.reason.as_str())
        );
    }
    Ok(())
}

async fn chat(config: &Config, session: Option<String>) -> anyhow::Result<()> {
    let supervisor = AgentSupervisor::from_config(config).await?;
    let id = session.unwrap_or_else(SessionIndex::new_id);
    SessionIndex::check_id(&id)?;
    println!("Session {} (type exit or quit to leave)", id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        if matches!(message, "exit" | "quit") {
            break;
        }

        supervisor.send_message(&id, message).await?;
        let report = tokio::select! {
            report = supervisor.wait(&id) => report?,
            _ = shutdown_signal() => {
                warn!(agent = %id, "Interrupted; stopping agent");
                if let Some(report) = supervisor.shutdown().await.into_iter().next() {
                    print_report(&report);
                }
                return Ok(());
            }
        };
        print_report(&report);
        println!();
    }

    supervisor.shutdown().await;
    Ok(())
}

fn print_report(report: &RunReport) {
    println!("Session: {}", report.id);
    println!("Status:  {} ({})", report.status, report.reason);
    println!("Steps:   {}", report.steps);
    if let Some(answer) = &report.final_answer {
        println!("\n{}", answer);
    }
    if let Some(error) = &report.error {
        eprintln!("Error: {}", error);
    }
}

async fn serve(config: &Config) -> anyhow::Result<()> {
    if !config.mcp.enabled {
        anyhow::bail!("control surface is disabled ([mcp].enabled = false)");
    }
    let supervisor = AgentSupervisor::from_config(config).await?;
    let server = Arc::new(McpServer::new(
        supervisor.clone(),
        config.mcp.server_reference.clone(),
    ));

    mcp::serve(&config.mcp, server, shutdown_signal()).await?;

    let reports = supervisor.shutdown().await;
    info!("Stopped {} agent(s)", reports.len());
    Ok(())
}

async fn sessions(config: &Config) -> anyhow::Result<()> {
    let sessions = SessionIndex::new(&config.agent.sessions_dir).list().await?;
    if sessions.is_empty() {
        println!("No sessions in {}", config.agent.sessions_dir.display());
        return Ok(());
    }
    println!("{:<38} {:<16} {:>6}  LAST ACTIVE", "ID", "STATUS", "STEPS");
    for session in sessions {
        println!(
            "{:<38} {:<16} {:>6}  {}",
            session.id,
            session.status.as_str(),
            session.steps,
            session.last_active.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn inspect(config: &Config, id: &str) -> anyhow::Result<()> {
    let store = FileStateStore::new(&config.agent.data_dir);
    let state = store.load(id).await?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

async fn tools(config: &Config) -> anyhow::Result<()> {
    // Discovery only checks prerequisites; it never starts containers.
    let sandbox = config
        .sandbox
        .use_sandbox
        .then(|| magic_agent::sandbox::Sandbox::docker(config.sandbox.clone()));
    let registry = discover_registry(config, sandbox).await?;
    for descriptor in registry.descriptors() {
        let caps = descriptor.capabilities;
        let mut flags = Vec::new();
        if caps.requires_network {
            flags.push("network");
        }
        if caps.requires_sandbox {
            flags.push("sandbox");
        }
        if caps.idempotent {
            flags.push("idempotent");
        }
        println!(
            "{:<18} [{}] {}",
            descriptor.name,
            flags.join(","),
            descriptor.description.lines().next().unwrap_or_default()
        );
    }
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping agents...");
}
