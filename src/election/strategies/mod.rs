//! Election protocols. Each protocol only supplies the hooks of
//! [`ElectionStrategy`]; the state transitions around them live in
//! [`ElectionNode`].

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use super::{ElectionContext, ElectionNode};
use crate::config::ConfigError;
use crate::network::{Peer, Reply};

mod bully;
mod none;
mod raft;
mod ring;

pub use bully::BullyElection;
pub use none::NoElection;
pub use raft::RaftElection;
pub use ring::RingElection;

/// Protocol-specific part of an election.
///
/// Hooks run after the node has already performed the shared transition
/// (see [`ElectionNode`]). Replies returned from `elect_hook` and
/// `declare_hook` are sent back to the peer that delivered the message;
/// `None` means nothing is written.
#[async_trait]
pub trait ElectionStrategy: Send + Sync {
    /// Called once, right after the node has been built.
    fn on_created(&self, _node: &ElectionNode) {}

    async fn initiate_hook(&self, node: &Arc<ElectionNode>);

    async fn elect_hook(&self, node: &Arc<ElectionNode>, candidate_id: i32) -> Option<Reply>;

    async fn declare_hook(&self, node: &Arc<ElectionNode>, leader_id: i32) -> Option<Reply>;
}

/// Which election protocol a node runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElectionKind {
    #[default]
    None,
    Ring,
    Bully,
    Raft,
}

impl ElectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElectionKind::None => "none",
            ElectionKind::Ring => "ring",
            ElectionKind::Bully => "bully",
            ElectionKind::Raft => "raft",
        }
    }

    /// Whether nodes running this protocol watch for missing heartbeats.
    pub fn uses_heartbeat(&self) -> bool {
        !matches!(self, ElectionKind::None)
    }

    pub(crate) fn build(&self, context: &ElectionContext) -> Box<dyn ElectionStrategy> {
        match self {
            ElectionKind::None => Box::new(NoElection),
            ElectionKind::Ring => Box::new(RingElection::new(context)),
            ElectionKind::Bully => Box::new(BullyElection),
            ElectionKind::Raft => Box::new(RaftElection::new(context.term_timeout())),
        }
    }
}

impl fmt::Display for ElectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ElectionKind {
    type Err = ConfigError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(ElectionKind::None),
            "ring" => Ok(ElectionKind::Ring),
            "bully" => Ok(ElectionKind::Bully),
            "raft" => Ok(ElectionKind::Raft),
            _ => Err(ConfigError::UnknownProtocol(name.to_string())),
        }
    }
}

/// Peers with a strictly higher id than `self_id`, followed by the lower
/// ones, both ascending. `sorted_peers` must be sorted by id.
pub fn successors_in_ring(sorted_peers: &[Peer], self_id: i32) -> Vec<Peer> {
    let split = sorted_peers.partition_point(|peer| peer.id <= self_id);
    let mut successors = sorted_peers.to_vec();
    successors.rotate_left(split);
    successors.retain(|peer| peer.id != self_id);
    successors
}

/// The tail of `sorted_peers` whose ids are greater than `self_id`.
pub fn higher_id_peers(sorted_peers: &[Peer], self_id: i32) -> &[Peer] {
    let split = sorted_peers.partition_point(|peer| peer.id <= self_id);
    &sorted_peers[split..]
}

/// Sends one RPC to every peer concurrently and counts the positive
/// answers. A failed or panicked call counts as no answer.
pub(crate) async fn count_responses<F, Fut>(peers: &[Peer], rpc: F) -> usize
where
    F: Fn(Peer) -> Fut,
    Fut: Future<Output = bool> + Send + 'static,
{
    let mut calls = JoinSet::new();
    for peer in peers {
        calls.spawn(rpc(peer.clone()));
    }

    let mut responses = 0;
    while let Some(result) = calls.join_next().await {
        match result {
            Ok(true) => responses += 1,
            Ok(false) => {}
            Err(e) => warn!("Peer RPC task failed: {e}"),
        }
    }
    responses
}

/// Announces `leader_id` to every peer and returns how many acknowledged.
pub(crate) async fn declare_to_all(context: &ElectionContext, leader_id: i32) -> usize {
    let timeout = context.response_timeout();
    count_responses(context.peers(), move |peer| async move {
        peer.send_declare_expect_ack(leader_id, timeout).await
    })
    .await
}

#[cfg(test)]
pub(crate) mod test_support {
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    use crate::network::{Peer, PeerConnection, GREETING};

    /// A fake cluster member that greets every connection, answers every
    /// line with `reply` and reports the lines it received.
    pub(crate) async fn answering_peer(id: i32, reply: &'static str) -> (Peer, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local_addr").port();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut conn = PeerConnection::new(stream).expect("conn");
                    conn.send_message(GREETING).await.expect("greet");
                    while let Ok(Some(line)) = conn.read_message().await {
                        let _ = tx.send(line);
                        if conn.send_message(reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        (Peer::new(id, "127.0.0.1", port), rx)
    }

    pub(crate) async fn next_line(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("peer received nothing")
            .expect("peer gone")
    }
}
