use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use duxnet_config::DuxNetConfig;
use duxnet_core::{EscrowId, ProposalId};

#[derive(Parser)]
#[command(name = "duxnet", version, about = "DuxNet node operator CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an example config file
    Init {
        #[arg(long, default_value = "config/duxnet.toml")]
        config: PathBuf,
    },
    /// Run or query a node process
    Node {
        #[command(subcommand)]
        cmd: NodeCmd,
    },
    /// Query the node registry
    Registry {
        #[command(subcommand)]
        cmd: RegistryCmd,
    },
    /// Act on an escrow
    Escrow {
        #[command(subcommand)]
        cmd: EscrowCmd,
    },
    /// Inspect governance proposals
    Governance {
        #[command(subcommand)]
        cmd: GovernanceCmd,
    },
}

#[derive(Subcommand)]
enum NodeCmd {
    /// Start the node in this process, blocking until it exits
    Start {
        #[arg(long, default_value = "config/duxnet.toml")]
        config: PathBuf,
    },
    /// Fetch /status from a running node's REST surface
    Status {
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        api: String,
    },
}

#[derive(Subcommand)]
enum RegistryCmd {
    /// List registered nodes, optionally filtered by status
    List {
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        api: String,
        #[arg(long)]
        status: Option<String>,
    },
    /// List nodes offering a set of capabilities
    Capability {
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        api: String,
        /// Comma-separated capabilities a node must advertise ALL of
        #[arg(long, value_delimiter = ',')]
        match_all: Vec<String>,
        /// Comma-separated capabilities a node must advertise ANY of
        #[arg(long, value_delimiter = ',')]
        match_any: Vec<String>,
    },
}

#[derive(Subcommand)]
enum EscrowCmd {
    Get {
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        api: String,
        escrow_id: EscrowId,
    },
    Release {
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        api: String,
        escrow_id: EscrowId,
        #[arg(long)]
        result_hash: String,
        #[arg(long)]
        provider_signature: String,
        #[arg(long)]
        timestamp: i64,
    },
    Refund {
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        api: String,
        escrow_id: EscrowId,
        #[arg(long)]
        reason: String,
    },
}

#[derive(Subcommand)]
enum GovernanceCmd {
    Get {
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        api: String,
        proposal_id: ProposalId,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    duxnet_node::init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Init { config } => init_config(config)?,
        Commands::Node { cmd } => match cmd {
            NodeCmd::Start { config } => duxnet_node::run_node(config).await?,
            NodeCmd::Status { api } => print_json(reqwest::get(format!("{api}/status")).await?).await?,
        },
        Commands::Registry { cmd } => match cmd {
            RegistryCmd::List { api, status } => list_nodes(&api, status.as_deref(), &[], &[]).await?,
            RegistryCmd::Capability { api, match_all, match_any } => {
                if match_all.is_empty() && match_any.is_empty() {
                    bail!("provide --match-all and/or --match-any");
                }
                list_nodes(&api, None, &match_all, &match_any).await?
            }
        },
        Commands::Escrow { cmd } => match cmd {
            EscrowCmd::Get { api, escrow_id } => {
                print_json(reqwest::get(format!("{api}/escrows/{escrow_id}")).await?).await?
            }
            EscrowCmd::Release { api, escrow_id, result_hash, provider_signature, timestamp } => {
                let client = reqwest::Client::new();
                let resp = client
                    .post(format!("{api}/escrows/{escrow_id}/release"))
                    .json(&serde_json::json!({
                        "result_hash": result_hash,
                        "provider_signature": provider_signature,
                        "timestamp": timestamp,
                    }))
                    .send()
                    .await?;
                print_json(resp).await?
            }
            EscrowCmd::Refund { api, escrow_id, reason } => {
                let client = reqwest::Client::new();
                let resp = client
                    .post(format!("{api}/escrows/{escrow_id}/refund"))
                    .json(&serde_json::json!({ "reason": reason }))
                    .send()
                    .await?;
                print_json(resp).await?
            }
        },
        Commands::Governance { cmd } => match cmd {
            GovernanceCmd::Get { api, proposal_id } => {
                print_json(reqwest::get(format!("{api}/governance/proposals/{proposal_id}")).await?).await?
            }
        },
    }
    Ok(())
}

fn init_config(path: PathBuf) -> Result<()> {
    if path.exists() {
        println!("config already exists at {path:?}");
        return Ok(());
    }
    let cfg = DuxNetConfig::example();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, toml::to_string_pretty(&cfg)?)?;
    println!("wrote config to {path:?}");
    Ok(())
}

async fn print_json(resp: reqwest::Response) -> Result<()> {
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.context("decoding response body")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    if !status.is_success() {
        bail!("request failed: {status}");
    }
    Ok(())
}

/// Fetches the full node list and filters it client-side; the REST
/// surface exposes no dedicated capability-query route (§1 Non-goal:
/// no wire-schema specification beyond a best-effort ambient surface).
async fn list_nodes(api: &str, status: Option<&str>, match_all: &[String], match_any: &[String]) -> Result<()> {
    let resp: serde_json::Value = reqwest::get(format!("{api}/nodes")).await?.json().await?;
    let nodes = resp.get("nodes").and_then(|v| v.as_array()).cloned().unwrap_or_default();

    let filtered: Vec<&serde_json::Value> = nodes
        .iter()
        .filter(|n| match status {
            Some(want) => n.get("status").and_then(|s| s.as_str()).map(|s| s.eq_ignore_ascii_case(want)).unwrap_or(false),
            None => true,
        })
        .filter(|n| {
            let caps = n
                .get("capabilities")
                .and_then(|c| c.as_array())
                .map(|a| a.iter().filter_map(|v| v.as_str()).collect::<Vec<_>>())
                .unwrap_or_default();
            let all_ok = match_all.is_empty() || match_all.iter().all(|c| caps.contains(&c.as_str()));
            let any_ok = match_any.is_empty() || match_any.iter().any(|c| caps.contains(&c.as_str()));
            all_ok && any_ok
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&filtered)?);
    Ok(())
}
