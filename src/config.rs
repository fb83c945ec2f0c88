use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::election::{ElectionKind, NO_LEADER};
use crate::network::Peer;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Peer arrays differ in length: {ids} ids, {hosts} hosts, {ports} ports")]
    MismatchedPeers {
        ids: usize,
        hosts: usize,
        ports: usize,
    },

    #[error("Peer id {0} is listed more than once")]
    DuplicatePeer(i32),

    #[error("Node id {0} is listed as its own peer")]
    SelfInPeers(i32),

    #[error("Id {0} is reserved to mean \"no leader\"")]
    ReservedId(i32),

    #[error("Invalid timeout: {0}")]
    InvalidTimeout(String),

    #[error("Unknown election protocol '{0}'")]
    UnknownProtocol(String),
}

/// Settings of one cluster member.
///
/// Peers are given as three parallel arrays, one entry per peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub id: i32,
    pub protocol: ElectionKind,
    pub host: String,
    pub port: u16,
    pub peer_ids: Vec<i32>,
    pub peer_hosts: Vec<String>,
    pub peer_ports: Vec<u16>,
    pub heartbeat_timeout_ms: u64,
    pub response_timeout_ms: u64,
    pub ping_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 0,
            protocol: ElectionKind::None,
            host: "127.0.0.1".to_string(),
            port: 7000,
            peer_ids: vec![],
            peer_hosts: vec![],
            peer_ports: vec![],
            heartbeat_timeout_ms: 1000,
            response_timeout_ms: 50,
            ping_interval_ms: 20,
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Parses and validates a JSON document. Missing fields take their
    /// defaults.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let (ids, hosts, ports) = (
            self.peer_ids.len(),
            self.peer_hosts.len(),
            self.peer_ports.len(),
        );
        if ids != hosts || ids != ports {
            return Err(ConfigError::MismatchedPeers { ids, hosts, ports });
        }

        if self.id == NO_LEADER {
            return Err(ConfigError::ReservedId(self.id));
        }
        let mut seen = HashSet::new();
        for &peer_id in &self.peer_ids {
            if peer_id == NO_LEADER {
                return Err(ConfigError::ReservedId(peer_id));
            }
            if peer_id == self.id {
                return Err(ConfigError::SelfInPeers(peer_id));
            }
            if !seen.insert(peer_id) {
                return Err(ConfigError::DuplicatePeer(peer_id));
            }
        }

        for (name, value) in [
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("response_timeout_ms", self.response_timeout_ms),
            ("ping_interval_ms", self.ping_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidTimeout(format!("{name} must be positive")));
            }
        }
        if self.response_timeout_ms >= self.heartbeat_timeout_ms {
            return Err(ConfigError::InvalidTimeout(format!(
                "response_timeout_ms ({}) must be below heartbeat_timeout_ms ({})",
                self.response_timeout_ms, self.heartbeat_timeout_ms
            )));
        }
        Ok(())
    }

    /// Every other cluster member, sorted by id.
    pub fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .peer_ids
            .iter()
            .zip(&self.peer_hosts)
            .zip(&self.peer_ports)
            .map(|((&id, host), &port)| Peer::new(id, host.clone(), port))
            .collect();
        peers.sort();
        peers
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}
