// quakemesh-cli — command-line node for the quake-alert overlay
//
// Joins the peer mesh through a rendezvous server, prints incoming
// broadcasts, and can originate signed quake reports.

mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use quakemesh_core::keys::format_wire_time;
use quakemesh_core::{Node, NodeEvent};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "quakemesh")]
#[command(about = "Quakemesh — P2P earthquake-alert relay node", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the network and relay broadcasts until interrupted
    Start {
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Join, send one signed quake report, and leave
    Broadcast {
        /// Area code to report (defaults to the configured one)
        #[arg(short, long)]
        area: Option<u32>,
    },
    /// Inspect the stored key material
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum KeysAction {
    Show,
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { port } => cmd_start(port).await,
        Commands::Broadcast { area } => cmd_broadcast(area).await,
        Commands::Keys { action } => cmd_keys(action).await,
        Commands::Config { action } => cmd_config(action).await,
    }
}

fn join_network_checked(config: &config::Config) -> Result<()> {
    if config.bootstrap_servers.is_empty() {
        bail!(
            "No rendezvous servers configured. Add one with: {}",
            "quakemesh config set bootstrap_servers <host:port>".bright_green()
        );
    }
    Ok(())
}

async fn cmd_start(port: Option<u16>) -> Result<()> {
    let config = config::Config::load()?;
    join_network_checked(&config)?;

    println!("{}", "Quakemesh — Starting...".bold());
    let (node, mut events) = Node::new(config.to_node_config(port)?)
        .context("Failed to initialize the node")?;

    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                NodeEvent::BroadcastReceived(msg) => {
                    println!(
                        "{} [{}] {}",
                        "←".bright_blue(),
                        msg.code.to_string().bright_cyan(),
                        msg.raw_body()
                    );
                }
                NodeEvent::BroadcastSent(msg) => {
                    println!("{} [{}] {}", "→".bright_green(), msg.code, msg.raw_body());
                }
                NodeEvent::PeerConnected { peer_id, role } => {
                    println!("{} Peer {} connected ({:?})", "✓".green(), peer_id, role);
                }
                NodeEvent::PeerCandidates { peer_ids } => {
                    let ids: Vec<String> = peer_ids.iter().map(|id| id.to_string()).collect();
                    println!("{} Discovered peers: {}", "+".yellow(), ids.join(", "));
                }
                NodeEvent::PeerDisconnected { peer_id } => {
                    println!("{} Peer {} disconnected", "✗".red(), peer_id);
                }
                NodeEvent::Error(message) => {
                    println!("{} {}", "!".bright_red(), message.dimmed());
                }
            }
        }
    });

    if !node.connect().await {
        event_task.abort();
        bail!("Could not join the network");
    }
    let status = node.status();
    println!(
        "{} Joined as peer {} ({} outbound, network size {})",
        "✓".green(),
        status.peer_id.to_string().bright_cyan(),
        status.outbound_peers,
        status.network_peer_count
    );
    if node.listener_port() != 0 {
        println!("{} Listening on port {}", "✓".green(), node.listener_port());
    }
    println!("Press Ctrl-C to leave the network.");

    let echo_node = Arc::clone(&node);
    let echo_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.echo_interval());
        ticker.tick().await; // immediate first tick
        loop {
            ticker.tick().await;
            if !echo_node.echo().await {
                println!("{} Echo to the rendezvous server failed", "!".bright_red());
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    println!();
    println!("{}", "Leaving the network...".bold());
    echo_task.abort();
    node.disconnect().await;
    event_task.abort();
    Ok(())
}

async fn cmd_broadcast(area: Option<u32>) -> Result<()> {
    let config = config::Config::load()?;
    join_network_checked(&config)?;
    let area = area.unwrap_or(config.area_code);

    let (node, _events) = Node::new(config.to_node_config(None)?)
        .context("Failed to initialize the node")?;
    if !node.connect().await {
        bail!("Could not join the network");
    }

    match node.create_user_broadcast(area).await {
        Ok(msg) => {
            println!("{} Broadcast sent for area {}", "✓".green(), area);
            println!("  {}", msg.to_line().dimmed());
        }
        Err(e) => {
            node.disconnect().await;
            bail!("Broadcast failed: {e}");
        }
    }

    // Let the peer sockets flush before tearing them down.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    node.disconnect().await;
    Ok(())
}

async fn cmd_keys(action: KeysAction) -> Result<()> {
    let config = config::Config::load()?;
    let node_config = config.to_node_config(None)?;
    let (node, _events) = Node::new(node_config).context("Failed to initialize the node")?;

    match action {
        KeysAction::Show => match node.key_manager().current() {
            Some(keys) => {
                println!("{}", "Key Material".bold());
                println!(
                    "  Public key:   {}…",
                    keys.public_key_b64.chars().take(40).collect::<String>().bright_yellow()
                );
                println!(
                    "  Valid until:  {}",
                    format_wire_time(&keys.invalidation_date).bright_cyan()
                );
                println!("  Stored in:    {}", config.key_path()?.display());
            }
            None => {
                println!("{}", "No key material stored yet.".dimmed());
                println!("Keys are issued by the network during {}.", "quakemesh start".bright_green());
            }
        },
    }
    Ok(())
}

async fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} {} = {}", "✓".green(), key, value.bright_cyan());
        }
        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{value}"),
            None => bail!("Unknown config key: {}", key),
        },
        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            for (key, value) in config.list() {
                println!("  {:<18} {}", key, value.bright_cyan());
            }
            println!();
            println!("File: {}", config::Config::config_file()?.display());
        }
    }
    Ok(())
}
