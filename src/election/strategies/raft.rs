use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info};
use rand::Rng;

use super::{count_responses, declare_to_all, ElectionStrategy};
use crate::election::{ElectionNode, NO_LEADER};
use crate::network::Reply;

/// Votes needed to win: a strict majority of the cluster, self included.
///
/// For an odd cluster this equals `votes > peer_count / 2`. For an even
/// cluster (odd `peer_count`) it needs one vote more than that, otherwise
/// two disjoint halves could each elect a leader in the same term. A
/// two-node cluster therefore cannot elect on its own vote alone.
pub fn quorum(peer_count: usize) -> usize {
    (peer_count + 1) / 2 + 1
}

/// Per-term voting record. A term ends when a `declare` arrives or when the
/// cast vote has been held for longer than the term timeout.
#[derive(Debug, Default)]
struct VoteState {
    term: u64,
    voted_for: Option<i32>,
    votes_received: usize,
    voted_at: Option<Instant>,
}

impl VoteState {
    fn expire(&mut self, term_timeout: Duration) {
        if self.voted_at.is_some_and(|at| at.elapsed() >= term_timeout) {
            self.new_term();
        }
    }

    fn new_term(&mut self) {
        self.term += 1;
        self.voted_for = None;
        self.votes_received = 0;
        self.voted_at = None;
    }

    /// Casts this term's single vote. Returns false if it was already cast.
    fn vote(&mut self, candidate_id: i32) -> bool {
        if self.voted_for.is_some() {
            return false;
        }
        self.voted_for = Some(candidate_id);
        self.voted_at = Some(Instant::now());
        true
    }
}

/// Election-only Raft: one vote per node per term, a candidate needs a
/// quorum of them. No log is replicated.
#[derive(Debug)]
pub struct RaftElection {
    term_timeout: Duration,
    votes: Mutex<VoteState>,
}

impl RaftElection {
    pub fn new(term_timeout: Duration) -> Self {
        Self {
            term_timeout,
            votes: Mutex::new(VoteState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VoteState> {
        self.votes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Votes for `self_id` and returns the term, or `None` if this term's
    /// vote is already taken.
    fn vote_for_self(&self, self_id: i32) -> Option<u64> {
        let mut votes = self.lock();
        votes.expire(self.term_timeout);
        if !votes.vote(self_id) {
            debug!(
                "Node {self_id} already voted for {:?} in term {}",
                votes.voted_for, votes.term
            );
            return None;
        }
        votes.votes_received = 1;
        Some(votes.term)
    }

    /// Adds the votes granted by peers to `term`'s tally. Returns `None` if
    /// the term ended while the votes were being collected.
    fn tally(&self, term: u64, granted: usize) -> Option<usize> {
        let mut votes = self.lock();
        if votes.term != term {
            return None;
        }
        votes.votes_received += granted;
        Some(votes.votes_received)
    }
}

/// Random pause before canvassing so nodes whose detectors fire together do
/// not split the vote every time.
fn canvass_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

#[async_trait]
impl ElectionStrategy for RaftElection {
    async fn initiate_hook(&self, node: &Arc<ElectionNode>) {
        let context = node.context();
        let self_id = context.self_id();
        let timeout = context.response_timeout();
        let peers = context.peers();

        if !peers.is_empty() {
            tokio::time::sleep(canvass_jitter(timeout)).await;
        }
        let Some(term) = self.vote_for_self(self_id) else {
            return;
        };

        let granted = count_responses(peers, move |peer| async move {
            peer.send_elect_expect_vote(self_id, timeout).await
        })
        .await;
        let Some(votes) = self.tally(term, granted) else {
            debug!("Node {self_id}: term {term} ended during the canvass, dropping its votes");
            return;
        };

        let needed = quorum(peers.len());
        info!(
            "Node {self_id} received {votes}/{} votes in term {term} (quorum {needed})",
            peers.len() + 1
        );
        if votes >= needed {
            declare_to_all(context, self_id).await;
            node.become_leader();
        }
    }

    async fn elect_hook(&self, node: &Arc<ElectionNode>, candidate_id: i32) -> Option<Reply> {
        let mut votes = self.lock();
        votes.expire(self.term_timeout);
        if votes.vote(candidate_id) {
            debug!("Node {} votes for {candidate_id} in term {}", node.id(), votes.term);
        }
        Some(Reply::Vote {
            sender_id: node.id(),
            candidate_id: votes.voted_for.unwrap_or(NO_LEADER),
        })
    }

    async fn declare_hook(&self, node: &Arc<ElectionNode>, leader_id: i32) -> Option<Reply> {
        let mut votes = self.lock();
        votes.new_term();
        debug!(
            "Node {} starts term {} after declare {leader_id}",
            node.id(),
            votes.term
        );
        Some(Reply::Ack {
            sender_id: node.id(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{answering_peer, next_line};
    use super::*;
    use crate::election::{ElectionContext, ElectionKind, ElectionState, HeartbeatService};
    use crate::network::Peer;

    fn raft(self_id: i32, peers: Vec<Peer>, term_timeout: Duration) -> Arc<ElectionNode> {
        let context = ElectionContext::new(self_id, peers, Duration::from_millis(200), || {})
            .with_term_timeout(term_timeout);
        ElectionNode::new(ElectionKind::Raft, context)
    }

    #[test]
    fn quorum_is_strict_majority_of_cluster() {
        assert_eq!(quorum(0), 1);
        assert_eq!(quorum(1), 2);
        assert_eq!(quorum(2), 2);
        assert_eq!(quorum(3), 3);
        assert_eq!(quorum(4), 3);
    }

    #[test]
    fn jitter_stays_within_bound() {
        for _ in 0..100 {
            assert!(canvass_jitter(Duration::from_millis(5)) <= Duration::from_millis(5));
        }
        assert_eq!(canvass_jitter(Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test]
    async fn grants_one_vote_per_term() {
        let node = raft(20, Vec::new(), Duration::from_secs(10));
        let heartbeat = HeartbeatService::new(true);

        let first = node.on_elect(10, &heartbeat).await;
        assert_eq!(
            first,
            Some(Reply::Vote {
                sender_id: 20,
                candidate_id: 10
            })
        );
        let second = node.on_elect(30, &heartbeat).await;
        assert_eq!(
            second,
            Some(Reply::Vote {
                sender_id: 20,
                candidate_id: 10
            })
        );
    }

    #[tokio::test]
    async fn vote_expires_with_the_term() {
        let node = raft(20, Vec::new(), Duration::from_millis(50));
        let heartbeat = HeartbeatService::new(true);

        node.on_elect(10, &heartbeat).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        let reply = node.on_elect(30, &heartbeat).await;
        assert_eq!(
            reply,
            Some(Reply::Vote {
                sender_id: 20,
                candidate_id: 30
            })
        );
    }

    #[tokio::test]
    async fn declare_starts_a_fresh_term() {
        let node = raft(20, Vec::new(), Duration::from_secs(10));
        let heartbeat = HeartbeatService::new(true);

        node.on_elect(10, &heartbeat).await;
        let ack = node.on_declare(10, &heartbeat).await;
        assert_eq!(ack, Some(Reply::Ack { sender_id: 20 }));
        assert_eq!(node.leader(), Some(10));

        let reply = node.on_elect(30, &heartbeat).await;
        assert_eq!(
            reply,
            Some(Reply::Vote {
                sender_id: 20,
                candidate_id: 30
            })
        );
    }

    #[tokio::test]
    async fn initiate_is_a_no_op_once_voted_this_term() {
        let node = raft(10, Vec::new(), Duration::from_secs(10));
        let heartbeat = HeartbeatService::new(true);

        node.on_elect(30, &heartbeat).await;
        node.initiate().await;

        assert_eq!(node.state(), ElectionState::Candidate);
        assert_eq!(node.leader(), None);
    }

    #[tokio::test]
    async fn wins_with_majority_and_declares() {
        let (granting, mut granting_lines) = answering_peer(20, "vote 20 10").await;
        let (withholding, _) = answering_peer(30, "vote 30 30").await;
        let node = raft(10, vec![granting, withholding], Duration::from_secs(10));

        node.initiate().await;

        assert_eq!(next_line(&mut granting_lines).await, "elect 10");
        assert_eq!(next_line(&mut granting_lines).await, "declare 10");
        assert!(node.is_leader());
    }

    #[tokio::test]
    async fn concurrent_initiates_canvass_once() {
        let (first, mut first_lines) = answering_peer(20, "vote 20 10").await;
        let (second, mut second_lines) = answering_peer(30, "vote 30 10").await;
        let node = raft(10, vec![first, second], Duration::from_secs(10));

        tokio::join!(node.initiate(), node.initiate());
        assert!(node.is_leader());

        for lines in [&mut first_lines, &mut second_lines] {
            assert_eq!(next_line(lines).await, "elect 10");
            assert_eq!(next_line(lines).await, "declare 10");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(first_lines.try_recv().is_err());
        assert!(second_lines.try_recv().is_err());
    }

    #[tokio::test]
    async fn loses_without_majority() {
        let (withholding, _) = answering_peer(20, "vote 20 30").await;
        let (other, _) = answering_peer(30, "vote 30 30").await;
        let node = raft(10, vec![withholding, other], Duration::from_secs(10));

        node.initiate().await;

        assert!(!node.is_leader());
        assert_eq!(node.state(), ElectionState::Candidate);
    }
}
