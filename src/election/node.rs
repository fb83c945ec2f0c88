use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;

use log::{debug, info};

use super::heartbeat::HeartbeatService;
use super::strategies::{ElectionKind, ElectionStrategy};
use super::{ElectionContext, ElectionState, NO_LEADER};
use crate::network::Reply;

/// The election state machine shared by every strategy.
///
/// The public operations perform the transitions common to all protocols
/// and then hand over to the strategy hooks:
///
/// * [`initiate`](Self::initiate): forget the leader, become candidate, run
///   `initiate_hook`.
/// * [`on_elect`](Self::on_elect): record a heartbeat, forget the leader,
///   become candidate, answer with `elect_hook`.
/// * [`on_declare`](Self::on_declare): record a heartbeat, follow the
///   declared leader unless it is this node, answer with `declare_hook`.
pub struct ElectionNode {
    kind: ElectionKind,
    context: ElectionContext,
    state: AtomicU8,
    leader_id: AtomicI32,
    strategy: Box<dyn ElectionStrategy>,
}

impl ElectionNode {
    /// Every node starts as a follower with no known leader.
    pub fn new(kind: ElectionKind, context: ElectionContext) -> Arc<Self> {
        let strategy = kind.build(&context);
        let node = Arc::new(Self {
            kind,
            context,
            state: AtomicU8::new(ElectionState::Follower as u8),
            leader_id: AtomicI32::new(NO_LEADER),
            strategy,
        });
        node.strategy.on_created(&node);
        node
    }

    pub fn id(&self) -> i32 {
        self.context.self_id()
    }

    pub fn kind(&self) -> ElectionKind {
        self.kind
    }

    pub fn context(&self) -> &ElectionContext {
        &self.context
    }

    pub fn state(&self) -> ElectionState {
        ElectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// This node's current belief about the leader.
    pub fn leader(&self) -> Option<i32> {
        match self.leader_id.load(Ordering::Acquire) {
            NO_LEADER => None,
            id => Some(id),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.state() == ElectionState::Leader
    }

    pub async fn initiate(self: &Arc<Self>) {
        info!("Node {} initiating {} election", self.id(), self.kind);
        self.reset_leader();
        self.become_candidate();
        self.strategy.initiate_hook(self).await;
    }

    pub async fn on_elect(
        self: &Arc<Self>,
        candidate_id: i32,
        heartbeat: &HeartbeatService,
    ) -> Option<Reply> {
        debug!("Node {} received elect {candidate_id}", self.id());
        heartbeat.heartbeat_received();
        self.reset_leader();
        self.become_candidate();
        self.strategy.elect_hook(self, candidate_id).await
    }

    pub async fn on_declare(
        self: &Arc<Self>,
        leader_id: i32,
        heartbeat: &HeartbeatService,
    ) -> Option<Reply> {
        debug!("Node {} received declare {leader_id}", self.id());
        heartbeat.heartbeat_received();
        if leader_id != self.id() {
            self.update_leader(leader_id);
            self.become_follower();
        }
        self.strategy.declare_hook(self, leader_id).await
    }

    /// Takes leadership and fires the leader callback. The callback must be
    /// idempotent: strategies may win the same round more than once.
    pub(crate) fn become_leader(&self) {
        self.update_leader(self.id());
        self.set_state(ElectionState::Leader);
        info!("Node {} is now the leader", self.id());
        self.context.notify_leader();
    }

    fn become_candidate(&self) {
        self.set_state(ElectionState::Candidate);
    }

    fn become_follower(&self) {
        self.set_state(ElectionState::Follower);
    }

    fn reset_leader(&self) {
        self.leader_id.store(NO_LEADER, Ordering::Release);
    }

    fn update_leader(&self, leader_id: i32) {
        self.leader_id.store(leader_id, Ordering::Release);
    }

    fn set_state(&self, state: ElectionState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl fmt::Debug for ElectionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElectionNode")
            .field("kind", &self.kind)
            .field("id", &self.id())
            .field("state", &self.state())
            .field("leader", &self.leader())
            .finish()
    }
}
