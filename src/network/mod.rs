//! Peer-to-peer transport for election messages: a line protocol over TCP.

mod error;

pub mod client;
pub mod connection;
pub mod protocol;
pub mod server;

pub use client::Peer;
pub use connection::PeerConnection;
pub use error::NetworkError;
pub use protocol::{Command, CommandError, Reply, GREETING};
pub use server::{PeerConnectionHandler, PeerConnectionManager};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_error_kind() {
        let timeout = NetworkError::Timeout;
        assert!(format!("{timeout}").contains("Timeout"));

        let protocol = NetworkError::Protocol("bad".to_string());
        assert!(format!("{protocol}").contains("Protocol error"));

        let io: NetworkError = std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into();
        assert!(format!("{io}").contains("IO error"));
    }
}
