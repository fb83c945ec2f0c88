pub mod config;
pub mod election;
pub mod network;

// Public exports
pub use config::{ConfigError, NodeConfig};
pub use election::{ElectionError, ElectionKind, ElectionManager, ElectionState};
pub use network::Peer;
