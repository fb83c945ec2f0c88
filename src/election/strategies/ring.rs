use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};

use super::{successors_in_ring, ElectionStrategy};
use crate::election::{ElectionContext, ElectionNode};
use crate::network::{Peer, Reply};

/// Max-id propagation around the ring of peers ordered by id.
///
/// An `elect` message carries the largest id it has seen. The node whose
/// own id comes back to it has won, and announces itself with a `declare`
/// that circulates once. Every hop is delivered to the first successor that
/// answers, so dead nodes are skipped.
///
/// A node that cannot reach any successor assumes it is alone and takes
/// leadership. If the ring splits into disjoint reachable arcs this yields
/// one leader per arc.
#[derive(Debug, Clone)]
pub struct RingElection {
    successors: Arc<[Peer]>,
    timeout: Duration,
}

impl RingElection {
    pub fn new(context: &ElectionContext) -> Self {
        Self {
            successors: successors_in_ring(context.peers(), context.self_id()).into(),
            timeout: context.response_timeout(),
        }
    }

    /// Successors of this node, in forwarding order.
    pub fn successors(&self) -> &[Peer] {
        &self.successors
    }

    /// Hands `elect candidate_id` to the first successor that accepts it.
    async fn forward_elect(&self, candidate_id: i32) -> Option<&Peer> {
        for peer in self.successors.iter() {
            if peer.send_elect_expect_ok(candidate_id, self.timeout).await {
                return Some(peer);
            }
            debug!("Successor {peer} did not take elect {candidate_id}, trying the next one");
        }
        None
    }

    /// Hands `declare leader_id` to the first successor that acknowledges it.
    async fn forward_declare(&self, leader_id: i32) -> Option<&Peer> {
        for peer in self.successors.iter() {
            if peer.send_declare_expect_ack(leader_id, self.timeout).await {
                return Some(peer);
            }
            debug!("Successor {peer} did not take declare {leader_id}, trying the next one");
        }
        None
    }

    async fn win(&self, node: &ElectionNode) {
        if self.forward_declare(node.id()).await.is_none() && !self.successors.is_empty() {
            warn!("Node {} could not announce itself to any successor", node.id());
        }
        node.become_leader();
    }

    async fn relay_elect(&self, node: &ElectionNode, received_id: i32) {
        if received_id == node.id() {
            info!("Elect {received_id} went around the ring, node {received_id} wins");
            self.win(node).await;
            return;
        }

        let candidate_id = received_id.max(node.id());
        match self.forward_elect(candidate_id).await {
            Some(peer) => debug!("Node {} forwarded elect {candidate_id} to {peer}", node.id()),
            None => {
                warn!(
                    "Node {} cannot reach any successor, taking leadership",
                    node.id()
                );
                self.win(node).await;
            }
        }
    }
}

#[async_trait]
impl ElectionStrategy for RingElection {
    async fn initiate_hook(&self, node: &Arc<ElectionNode>) {
        match self.forward_elect(node.id()).await {
            Some(peer) => debug!("Node {} sent elect {} to {peer}", node.id(), node.id()),
            None => {
                info!("Node {} has no reachable successor, leading alone", node.id());
                node.become_leader();
            }
        }
    }

    async fn elect_hook(&self, node: &Arc<ElectionNode>, candidate_id: i32) -> Option<Reply> {
        let ring = self.clone();
        let node = Arc::clone(node);
        tokio::spawn(async move { ring.relay_elect(&node, candidate_id).await });
        Some(Reply::Ok)
    }

    async fn declare_hook(&self, node: &Arc<ElectionNode>, leader_id: i32) -> Option<Reply> {
        if leader_id != node.id() {
            let ring = self.clone();
            tokio::spawn(async move {
                if ring.forward_declare(leader_id).await.is_none() {
                    debug!("Declare {leader_id} stopped: no successor reachable");
                }
            });
        }
        Some(Reply::Ack {
            sender_id: node.id(),
        })
    }
}
