use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mcproxy::{BridgeSet, BridgeSetConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mcproxy", version, about = "Bridges stdio MCP servers to HTTP/SSE clients")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every enabled child from a config file and serve until interrupted.
    Run {
        /// Path to a TOML config file. Defaults to `./mcproxy.toml`, then
        /// `~/.config/mcproxy/mcproxy.toml`.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run the initialize/tools-list handshake against one child and print
    /// its tool list, without starting a bridge.
    Validate {
        /// Path to a TOML config file, as in `run`.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Id of the child to validate.
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run(config).await,
        Commands::Validate { config, id } => validate(config, &id).await,
    }
}

async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let path = resolve_config(config_path)?;
    let config = load_config(&path)?;

    info!(path = %path.display(), children = config.children.len(), "loaded config");

    let set = BridgeSet::from_config(config)
        .await
        .context("failed to start bridge set")?;

    for id in set.child_ids() {
        let status = set.status(&id).await;
        let port = set.port(&id).await;
        info!(child = %id, ?status, ?port, "bridge status");
    }

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            ctrl_c_cancel.cancel();
        }
    });

    cancel.cancelled().await;
    set.shutdown().await;
    Ok(())
}

async fn validate(config_path: Option<PathBuf>, id: &str) -> Result<()> {
    let path = resolve_config(config_path)?;
    let config = load_config(&path)?;

    let child = config
        .children
        .into_iter()
        .find(|c| c.id == id)
        .with_context(|| format!("no child with id '{id}' in config"))?;

    match mcproxy::discovery::validate(&child).await {
        Ok(tools) => {
            println!("{id}: {} tool(s)", tools.len());
            for tool in tools {
                println!("  {} — {}", tool.name, tool.description);
            }
            Ok(())
        }
        Err(e) => {
            error!(child = %id, error = %e, "validate failed");
            Err(e.into())
        }
    }
}

fn resolve_config(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }

    let cwd_candidate = Path::new("mcproxy.toml");
    if cwd_candidate.is_file() {
        return Ok(cwd_candidate.to_path_buf());
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push("mcproxy");
        dir.push("mcproxy.toml");
        if dir.is_file() {
            return Ok(dir);
        }
    }

    anyhow::bail!("no config file found: pass --config or create ./mcproxy.toml")
}

fn load_config(path: &Path) -> Result<BridgeSetConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: BridgeSetConfig = toml::from_str(&text)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    config.validate().context("invalid config")?;
    Ok(config)
}
