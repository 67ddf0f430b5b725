//! Peerlink CLI Application
//!
//! Runs a standalone P2P node backed by an in-memory ledger.

use clap::{Parser, Subcommand};
use peerlink::network::Command;
use peerlink::transport::registry;
use peerlink::{ChannelSink, ConsensusType, MemoryLedger, NetConfig, NetServer};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "peerlink")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Peer-to-peer networking node for a blockchain", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node
    Run {
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Data port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Transport to use (tcp or quic)
        #[arg(short, long)]
        transport: Option<String>,

        /// Consensus mode (solo, dbft or vbft)
        #[arg(long)]
        consensus: Option<String>,

        /// Peers to connect to (comma-separated host:port)
        #[arg(long)]
        connect: Option<String>,
    },

    /// Print the default configuration as JSON
    Config,
}

fn parse_consensus(name: &str) -> Result<ConsensusType, Box<dyn std::error::Error>> {
    match name.to_ascii_lowercase().as_str() {
        "solo" => Ok(ConsensusType::Solo),
        "dbft" => Ok(ConsensusType::Dbft),
        "vbft" => Ok(ConsensusType::Vbft),
        other => Err(format!("unknown consensus type: {}", other).into()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&NetConfig::default())?);
        }

        Commands::Run {
            config,
            port,
            transport,
            consensus,
            connect,
        } => {
            let mut net_config = match config {
                Some(path) => NetConfig::load(&path)?,
                None => NetConfig::default(),
            };
            if let Some(port) = port {
                net_config.node_port = port;
            }
            if let Some(transport) = transport {
                net_config.transport = transport;
            }
            if let Some(consensus) = consensus {
                net_config.consensus_type = parse_consensus(&consensus)?;
            }
            net_config.validate()?;

            let registry = registry::init_global(&net_config);
            let (sink, mut frames) = ChannelSink::new();
            let server = NetServer::new(
                net_config,
                registry,
                Arc::new(MemoryLedger::new()),
                Arc::new(sink),
            )?;
            server.start().await?;

            println!(
                "Node {} listening on {:?} ({})",
                server.id(),
                server.data_addr(),
                server.transport().protocol_name()
            );

            for peer in connect
                .iter()
                .flat_map(|p| p.split(','))
                .map(str::trim)
                .filter(|p| !p.is_empty())
            {
                if let Err(e) = server.connect(peer).await {
                    log::warn!("Could not connect to {}: {}", peer, e);
                }
            }

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    frame = frames.recv() => match frame {
                        Some(frame) => {
                            let known = Command::parse(&frame.command).is_some();
                            log::info!(
                                "{} from peer {} on {:?} ({} bytes{})",
                                frame.command,
                                frame.peer_id,
                                frame.channel,
                                frame.payload.len(),
                                if known { "" } else { ", unknown command" }
                            );
                        }
                        None => break,
                    },
                }
            }

            println!("Shutting down node...");
            server.halt().await;
        }
    }

    Ok(())
}
