use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};

use super::{count_responses, declare_to_all, higher_id_peers, ElectionStrategy};
use crate::election::ElectionNode;
use crate::network::Reply;

/// The highest reachable id wins.
///
/// A candidate sends `elect` to every peer with a higher id. If none of them
/// answers it declares itself to the whole cluster; otherwise it waits for
/// the winner's `declare`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BullyElection;

#[async_trait]
impl ElectionStrategy for BullyElection {
    async fn initiate_hook(&self, node: &Arc<ElectionNode>) {
        let context = node.context();
        let self_id = context.self_id();
        let timeout = context.response_timeout();

        let higher = higher_id_peers(context.peers(), self_id);
        let alive = count_responses(higher, move |peer| async move {
            peer.send_elect_expect_ok(self_id, timeout).await
        })
        .await;
        if alive > 0 {
            debug!("Node {self_id}: {alive} higher node(s) answered, standing down");
            return;
        }

        let acks = declare_to_all(context, self_id).await;
        info!(
            "Node {self_id} declared itself leader ({acks}/{} acknowledged)",
            context.peers().len()
        );
        node.become_leader();
    }

    async fn elect_hook(&self, node: &Arc<ElectionNode>, candidate_id: i32) -> Option<Reply> {
        if node.id() > candidate_id {
            debug!(
                "Node {} outranks candidate {candidate_id}, starting its own election",
                node.id()
            );
            let node = Arc::clone(node);
            tokio::spawn(async move { node.initiate().await });
        }
        Some(Reply::Ok)
    }

    async fn declare_hook(&self, node: &Arc<ElectionNode>, _leader_id: i32) -> Option<Reply> {
        Some(Reply::Ack {
            sender_id: node.id(),
        })
    }
}
