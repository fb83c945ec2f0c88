use std::sync::Arc;

use async_trait::async_trait;

use super::ElectionStrategy;
use crate::election::ElectionNode;
use crate::network::Reply;

/// Single-node mode: the node leads from the moment it is created and never
/// answers election traffic. Every hook is a no-op, so a round started by
/// hand leaves the node a candidate without a leader.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoElection;

#[async_trait]
impl ElectionStrategy for NoElection {
    fn on_created(&self, node: &ElectionNode) {
        node.become_leader();
    }

    async fn initiate_hook(&self, _node: &Arc<ElectionNode>) {}

    async fn elect_hook(&self, _node: &Arc<ElectionNode>, _candidate_id: i32) -> Option<Reply> {
        None
    }

    async fn declare_hook(&self, _node: &Arc<ElectionNode>, _leader_id: i32) -> Option<Reply> {
        None
    }
}
