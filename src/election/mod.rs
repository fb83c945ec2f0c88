//! Leader election: the shared state machine, the pluggable protocols, the
//! failure detector and the manager that ties them to the peer transport.

mod context;
mod error;
mod heartbeat;
mod manager;
mod node;
mod state;

pub mod strategies;

pub use context::{ElectionContext, LeaderCallback, DEFAULT_TERM_TIMEOUT};
pub use error::ElectionError;
pub use heartbeat::HeartbeatService;
pub use manager::ElectionManager;
pub use node::ElectionNode;
pub use state::{ElectionState, NO_LEADER};
pub use strategies::{ElectionKind, ElectionStrategy};
