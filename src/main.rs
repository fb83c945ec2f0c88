use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::{info, warn};

use lep::election::{ElectionKind, ElectionManager};
use lep::network::{PeerConnection, GREETING};
use lep::NodeConfig;

#[derive(Parser)]
#[command(name = "lep")]
#[command(about = "Leader election for message-broker clusters")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one cluster member until Ctrl-C
    Node {
        /// JSON config file; flags below override its values
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Election id of this node
        #[arg(short, long)]
        id: Option<i32>,

        /// Election protocol: none, ring, bully or raft
        #[arg(long)]
        protocol: Option<ElectionKind>,

        /// Host to listen on for peer traffic
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on for peer traffic
        #[arg(short, long)]
        port: Option<u16>,

        /// Comma-separated list of peers (id=host:port)
        #[arg(long)]
        peers: Option<String>,

        /// Missing-heartbeat window in milliseconds
        #[arg(long)]
        heartbeat_timeout_ms: Option<u64>,

        /// Bound on a single peer RPC in milliseconds
        #[arg(long)]
        response_timeout_ms: Option<u64>,

        /// Leader ping period in milliseconds
        #[arg(long)]
        ping_interval_ms: Option<u64>,
    },

    /// Send one protocol line to a node and print its reply
    Send {
        /// Peer address of the node, e.g. 127.0.0.1:7000
        #[arg(short, long)]
        address: String,

        /// How long to wait for the reply in milliseconds
        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,

        /// The command, e.g. `ping` or `elect 3`
        #[arg(required = true, num_args = 1..)]
        command: Vec<String>,
    },
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

/// Parses `1=127.0.0.1:7001,2=127.0.0.1:7002` into the parallel peer arrays.
fn apply_peers(config: &mut NodeConfig, peers: &str) -> anyhow::Result<()> {
    config.peer_ids.clear();
    config.peer_hosts.clear();
    config.peer_ports.clear();

    for peer in peers.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((id, address)) = peer.split_once('=') else {
            bail!("peer '{peer}' is not of the form id=host:port");
        };
        let Some((host, port)) = address.rsplit_once(':') else {
            bail!("peer address '{address}' is missing a port");
        };
        let id: i32 = id.trim().parse().with_context(|| format!("bad peer id in '{peer}'"))?;
        let port: u16 = port.parse().with_context(|| format!("bad peer port in '{peer}'"))?;

        config.peer_ids.push(id);
        config.peer_hosts.push(host.to_string());
        config.peer_ports.push(port);
    }
    Ok(())
}

async fn run_node(config: NodeConfig) -> anyhow::Result<()> {
    info!(
        "Starting node {} ({} election) at {}",
        config.id,
        config.protocol,
        config.listen_addr()
    );
    let manager = ElectionManager::bind(config).await?;

    let signals = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl-C, shutting down"),
                Err(e) => warn!("Cannot listen for Ctrl-C: {e}"),
            }
            manager.shutdown().await;
        })
    };

    let server = Arc::clone(&manager);
    manager
        .start(|| async move {
            info!("Node {} is serving as leader", server.id());
            server.wait_for_shutdown().await;
        })
        .await?;

    manager.shutdown().await;
    signals.abort();
    info!("Node {} stopped", manager.id());
    Ok(())
}

async fn send_command(address: &str, command: &str, timeout: Duration) -> anyhow::Result<String> {
    let mut conn = PeerConnection::connect(address)
        .await
        .with_context(|| format!("cannot connect to {address}"))?;
    let greeting = conn.wait_for_response(timeout).await?;
    if greeting != GREETING {
        warn!("{address} greeted with '{greeting}' instead of '{GREETING}'");
    }
    conn.send_message(command).await?;
    Ok(conn.wait_for_response(timeout).await?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Node {
            config,
            id,
            protocol,
            host,
            port,
            peers,
            heartbeat_timeout_ms,
            response_timeout_ms,
            ping_interval_ms,
        } => {
            let mut node_config = match config {
                Some(path) => NodeConfig::from_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => NodeConfig::default(),
            };

            if let Some(id) = id {
                node_config.id = id;
            }
            if let Some(protocol) = protocol {
                node_config.protocol = protocol;
            }
            if let Some(host) = host {
                node_config.host = host;
            }
            if let Some(port) = port {
                node_config.port = port;
            }
            if let Some(peers) = peers {
                apply_peers(&mut node_config, &peers)?;
            }
            if let Some(ms) = heartbeat_timeout_ms {
                node_config.heartbeat_timeout_ms = ms;
            }
            if let Some(ms) = response_timeout_ms {
                node_config.response_timeout_ms = ms;
            }
            if let Some(ms) = ping_interval_ms {
                node_config.ping_interval_ms = ms;
            }
            node_config.validate()?;

            run_node(node_config).await?;
        }
        Command::Send {
            address,
            timeout_ms,
            command,
        } => {
            let reply = send_command(&address, &command.join(" "), Duration::from_millis(timeout_ms)).await?;
            println!("{reply}");
        }
    }

    Ok(())
}
