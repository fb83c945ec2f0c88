use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::watch;

use super::heartbeat::HeartbeatService;
use super::strategies::count_responses;
use super::{ElectionContext, ElectionError, ElectionKind, ElectionNode, ElectionState};
use crate::config::NodeConfig;
use crate::network::{
    Command, NetworkError, Peer, PeerConnection, PeerConnectionHandler, PeerConnectionManager,
    Reply,
};

/// Routes the commands of one peer connection to the election node.
struct PeerDispatcher {
    node: Arc<ElectionNode>,
    heartbeat: Arc<HeartbeatService>,
}

#[async_trait]
impl PeerConnectionHandler for PeerDispatcher {
    async fn handle(&self, mut connection: PeerConnection) -> Result<(), NetworkError> {
        loop {
            let line = match connection.read_message().await {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(()),
                Err(e @ NetworkError::Protocol(_)) => {
                    warn!("Closing connection from peer {}: {e}", connection.peer_addr());
                    let _ = connection.send_reply(&Reply::protocol_error()).await;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            if line.trim().is_empty() {
                continue;
            }

            let reply = match line.parse::<Command>() {
                Ok(Command::Ping) => {
                    self.heartbeat.heartbeat_received();
                    Some(Reply::Pong)
                }
                Ok(Command::Elect { candidate_id }) => {
                    self.node.on_elect(candidate_id, &self.heartbeat).await
                }
                Ok(Command::Declare { leader_id }) => {
                    self.node.on_declare(leader_id, &self.heartbeat).await
                }
                Err(e) => {
                    warn!(
                        "Rejected '{}' from peer {}: {e}",
                        line.trim(),
                        connection.peer_addr()
                    );
                    Some(e.reply())
                }
            };

            if let Some(reply) = reply {
                connection.send_reply(&reply).await?;
            }
        }
    }
}

/// Runs one cluster member: serves peer traffic, watches the leader and
/// holds [`start`](Self::start) until this node has been elected.
pub struct ElectionManager {
    config: NodeConfig,
    node: Arc<ElectionNode>,
    heartbeat: Arc<HeartbeatService>,
    peers: PeerConnectionManager,
    leader_gate: Arc<watch::Sender<bool>>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
}

impl ElectionManager {
    /// Opens the peer listener on the configured address.
    pub async fn bind(config: NodeConfig) -> Result<Arc<Self>, ElectionError> {
        config.validate()?;
        let addr = config.listen_addr();
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Node {} cannot listen for peers on {addr}: {e}", config.id);
                return Err(ElectionError::bind(addr, e));
            }
        };
        Self::with_listener(config, listener)
    }

    /// Uses an already bound listener instead of `host:port` from the config.
    pub fn with_listener(config: NodeConfig, listener: TcpListener) -> Result<Arc<Self>, ElectionError> {
        config.validate()?;

        let (leader_gate, _) = watch::channel(false);
        let leader_gate = Arc::new(leader_gate);
        let on_become_leader = {
            let gate = Arc::clone(&leader_gate);
            move || {
                gate.send_replace(true);
            }
        };
        let context = ElectionContext::new(
            config.id,
            config.peers(),
            config.response_timeout(),
            on_become_leader,
        )
        .with_term_timeout(config.heartbeat_timeout());

        let node = ElectionNode::new(config.protocol, context);
        let heartbeat = Arc::new(HeartbeatService::new(config.protocol.uses_heartbeat()));
        let dispatcher = Arc::new(PeerDispatcher {
            node: Arc::clone(&node),
            heartbeat: Arc::clone(&heartbeat),
        });
        let peers = PeerConnectionManager::new(listener, dispatcher)?;
        let (shutdown, _) = watch::channel(false);

        info!(
            "Node {} running {} election, listening for peers on {}",
            config.id,
            config.protocol,
            peers.local_addr()
        );

        Ok(Arc::new(Self {
            config,
            node,
            heartbeat,
            peers,
            leader_gate,
            shutdown,
            started: AtomicBool::new(false),
        }))
    }

    /// Joins the cluster and waits until this node is elected, then keeps
    /// pinging the followers and runs `server`.
    ///
    /// Returns without running `server` if [`shutdown`](Self::shutdown) is
    /// called first. May only be called once.
    pub async fn start<F, Fut>(&self, server: F) -> Result<(), ElectionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ElectionError::AlreadyStarted);
        }
        if self.is_shut_down() {
            debug!("Node {} shut down before start", self.id());
            return Ok(());
        }

        self.peers.join_cluster();
        let node = Arc::clone(&self.node);
        self.heartbeat
            .start_monitoring(
                move || {
                    let node = Arc::clone(&node);
                    async move { node.initiate().await }
                },
                self.config.heartbeat_timeout(),
            )
            .await;

        let mut gate = self.leader_gate.subscribe();
        let _ = gate.wait_for(|&released| released).await;
        if self.is_shut_down() {
            self.heartbeat.stop().await;
            info!("Node {} shut down while waiting for leadership", self.id());
            return Ok(());
        }

        info!("Node {} is leader, starting server", self.id());
        self.start_pinging().await;
        if self.is_shut_down() {
            self.heartbeat.stop().await;
            return Ok(());
        }

        server().await;
        Ok(())
    }

    async fn start_pinging(&self) {
        let peers: Arc<[Peer]> = self.node.context().peers().into();
        let timeout = self.config.response_timeout();
        self.heartbeat
            .start_scheduling(
                move || {
                    let peers = Arc::clone(&peers);
                    async move {
                        count_responses(&peers, move |peer| async move {
                            peer.send_ping(timeout).await
                        })
                        .await;
                    }
                },
                self.config.ping_interval(),
                Duration::ZERO,
            )
            .await;
    }

    pub async fn initiate_election(&self) {
        self.node.initiate().await;
    }

    /// The leader as currently believed by this node.
    pub fn leader(&self) -> Option<i32> {
        self.node.leader()
    }

    pub fn id(&self) -> i32 {
        self.node.id()
    }

    pub fn state(&self) -> ElectionState {
        self.node.state()
    }

    pub fn protocol(&self) -> ElectionKind {
        self.node.kind()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.peers.local_addr()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once [`shutdown`](Self::shutdown) has been called.
    pub async fn wait_for_shutdown(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let _ = shutdown.wait_for(|&down| down).await;
    }

    /// Stops serving peers and all timers, and releases a pending
    /// [`start`](Self::start). Safe to call any number of times.
    pub async fn shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            info!("Shutting down election node {}", self.id());
        }
        self.leader_gate.send_replace(true);
        self.peers.shutdown().await;
        self.heartbeat.stop().await;
    }
}

impl fmt::Debug for ElectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElectionManager")
            .field("id", &self.id())
            .field("protocol", &self.protocol())
            .field("state", &self.state())
            .field("leader", &self.leader())
            .field("local_addr", &self.local_addr())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    async fn local_listener() -> TcpListener {
        TcpListener::bind("127.0.0.1:0").await.unwrap()
    }

    async fn closed_port() -> u16 {
        local_listener().await.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn single_node_runs_server_immediately() {
        let config = NodeConfig {
            id: 4,
            ..NodeConfig::default()
        };
        let manager = ElectionManager::with_listener(config, local_listener().await).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        manager
            .start(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(manager.leader(), Some(4));
        assert_eq!(manager.state(), ElectionState::Leader);
        assert!(matches!(
            manager.start(|| async {}).await,
            Err(ElectionError::AlreadyStarted)
        ));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_releases_pending_start() {
        let config = NodeConfig {
            id: 1,
            protocol: ElectionKind::Bully,
            peer_ids: vec![2],
            peer_hosts: vec!["127.0.0.1".to_string()],
            peer_ports: vec![closed_port().await],
            heartbeat_timeout_ms: 60_000,
            ..NodeConfig::default()
        };
        let manager = ElectionManager::with_listener(config, local_listener().await).unwrap();
        let ran = Arc::new(AtomicBool::new(false));

        let waiting = {
            let manager = Arc::clone(&manager);
            let ran = Arc::clone(&ran);
            tokio::spawn(async move {
                manager
                    .start(|| async move { ran.store(true, Ordering::SeqCst) })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiting.is_finished());

        manager.shutdown().await;
        manager.shutdown().await;
        let result = tokio::time::timeout(Duration::from_secs(2), waiting)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(!ran.load(Ordering::SeqCst));
        assert!(manager.is_shut_down());
    }

    #[tokio::test]
    async fn shutdown_before_start_is_harmless() {
        let manager =
            ElectionManager::with_listener(NodeConfig::default(), local_listener().await).unwrap();
        manager.shutdown().await;
        manager.wait_for_shutdown().await;

        let ran = AtomicBool::new(false);
        manager
            .start(|| async { ran.store(true, Ordering::SeqCst) })
            .await
            .unwrap();
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn bind_fails_on_taken_port() {
        let taken = local_listener().await;
        let config = NodeConfig {
            port: taken.local_addr().unwrap().port(),
            ..NodeConfig::default()
        };
        let err = ElectionManager::bind(config).await.unwrap_err();
        assert!(matches!(err, ElectionError::Bind { .. }));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = NodeConfig {
            peer_ids: vec![1],
            ..NodeConfig::default()
        };
        let err = ElectionManager::with_listener(config, local_listener().await).unwrap_err();
        assert!(matches!(err, ElectionError::Config(_)));
    }

    #[tokio::test]
    async fn debug_output_shows_identity_and_leader() {
        let config = NodeConfig {
            id: 6,
            ..NodeConfig::default()
        };
        let manager = ElectionManager::with_listener(config, local_listener().await).unwrap();
        let debug = format!("{manager:?}");
        assert!(debug.starts_with("ElectionManager"));
        assert!(debug.contains("id: 6"));
        assert!(debug.contains("leader: Some(6)"));
        assert!(debug.contains("shut_down: false"));
    }
}
