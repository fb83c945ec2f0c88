use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::network::Peer;

/// How long a raft-style vote stays valid unless a `declare` resets it first.
pub const DEFAULT_TERM_TIMEOUT: Duration = Duration::from_secs(1);

pub type LeaderCallback = Arc<dyn Fn() + Send + Sync>;

/// Read-only configuration shared with the active election strategy.
#[derive(Clone)]
pub struct ElectionContext {
    self_id: i32,
    peers: Vec<Peer>,
    response_timeout: Duration,
    term_timeout: Duration,
    on_become_leader: LeaderCallback,
}

impl ElectionContext {
    /// `peers` is sorted by id here; it must not contain this node itself.
    pub fn new<F>(self_id: i32, mut peers: Vec<Peer>, response_timeout: Duration, on_become_leader: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        peers.sort();
        Self {
            self_id,
            peers,
            response_timeout,
            term_timeout: DEFAULT_TERM_TIMEOUT,
            on_become_leader: Arc::new(on_become_leader),
        }
    }

    pub fn with_term_timeout(mut self, term_timeout: Duration) -> Self {
        self.term_timeout = term_timeout;
        self
    }

    pub fn self_id(&self) -> i32 {
        self.self_id
    }

    /// All other cluster members, ascending by id.
    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    pub fn term_timeout(&self) -> Duration {
        self.term_timeout
    }

    pub(crate) fn notify_leader(&self) {
        (self.on_become_leader)();
    }
}

impl fmt::Debug for ElectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElectionContext")
            .field("self_id", &self.self_id)
            .field("peers", &self.peers)
            .field("response_timeout", &self.response_timeout)
            .field("term_timeout", &self.term_timeout)
            .finish_non_exhaustive()
    }
}
