use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use log::{debug, warn};

use super::connection::PeerConnection;
use super::protocol::{Command, Reply, ACK, GREETING, OK, VOTE_USAGE};
use super::NetworkError;

/// Another member of the cluster and the RPCs that can be sent to it.
///
/// Peers are ordered by id. Every RPC opens a fresh connection, is bounded
/// by the given timeout and reports failure (refused, reset, timed out,
/// unexpected reply) as "no response" rather than as an error.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    pub id: i32,
    pub host: String,
    pub port: u16,
}

impl Peer {
    pub fn new(id: i32, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Sends `elect <candidate_id>` and expects a reply starting with `ok`.
    pub async fn send_elect_expect_ok(&self, candidate_id: i32, timeout: Duration) -> bool {
        self.send_expect_prefix(Command::Elect { candidate_id }, OK, timeout)
            .await
    }

    /// Sends `declare <leader_id>` and expects a reply starting with `ack`.
    pub async fn send_declare_expect_ack(&self, leader_id: i32, timeout: Duration) -> bool {
        self.send_expect_prefix(Command::Declare { leader_id }, ACK, timeout)
            .await
    }

    /// Sends `elect <candidate_id>` and expects `vote <sender> <candidate_id>`.
    ///
    /// A vote naming a different candidate counts as withheld. A malformed
    /// reply is answered with a usage error and also counts as withheld.
    pub async fn send_elect_expect_vote(&self, candidate_id: i32, timeout: Duration) -> bool {
        let (mut conn, response) = match self.request(Command::Elect { candidate_id }, timeout).await {
            Ok(exchange) => exchange,
            Err(e) => {
                debug!("Vote request to peer {} failed: {e}", self.id);
                return false;
            }
        };

        match response.parse::<Reply>() {
            Ok(Reply::Vote {
                candidate_id: voted_for,
                ..
            }) => voted_for == candidate_id,
            _ => {
                warn!(
                    "Peer {} answered vote request with unexpected reply '{response}'",
                    self.id
                );
                if let Err(e) = conn.print_usage(VOTE_USAGE).await {
                    debug!("Failed to send usage error to peer {}: {e}", self.id);
                }
                false
            }
        }
    }

    /// Sends a single `ping` without waiting for `pong`.
    pub async fn send_ping(&self, timeout: Duration) -> bool {
        let delivered = tokio::time::timeout(timeout, async {
            let mut conn = PeerConnection::connect((self.host.as_str(), self.port)).await?;
            conn.send_message(&Command::Ping.to_string()).await
        })
        .await;

        match delivered {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("Failed to ping peer {}: {e}", self.id);
                false
            }
            Err(_) => {
                debug!("Ping to peer {} timed out", self.id);
                false
            }
        }
    }

    async fn send_expect_prefix(&self, command: Command, prefix: &str, timeout: Duration) -> bool {
        match self.request(command, timeout).await {
            Ok((_, response)) => response.starts_with(prefix),
            Err(e) => {
                debug!("'{command}' to peer {} got no response: {e}", self.id);
                false
            }
        }
    }

    /// Connects, checks the greeting, sends `command` and reads one reply,
    /// all within `timeout`.
    async fn request(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<(PeerConnection, String), NetworkError> {
        tokio::time::timeout(timeout, async {
            let mut conn = PeerConnection::connect((self.host.as_str(), self.port)).await?;
            let greeting = conn
                .read_message()
                .await?
                .ok_or(NetworkError::ConnectionClosed)?;
            if greeting != GREETING {
                warn!("Peer {} failed to respond with greeting", self.id);
            }

            conn.send_message(&command.to_string()).await?;
            let response = conn
                .read_message()
                .await?
                .ok_or(NetworkError::ConnectionClosed)?;
            Ok::<_, NetworkError>((conn, response))
        })
        .await?
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.host, self.port)
    }
}

impl PartialOrd for Peer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Peer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id
            .cmp(&other.id)
            .then_with(|| self.host.cmp(&other.host))
            .then_with(|| self.port.cmp(&other.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Accepts one connection, greets, answers the first line with `reply`
    /// and hands back whatever the client sends afterwards.
    async fn scripted_peer(id: i32, reply: &'static str) -> (Peer, oneshot::Receiver<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local_addr").port();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut conn = PeerConnection::new(stream).expect("conn");
            conn.send_message(GREETING).await.expect("greet");
            let mut received = Vec::new();
            if let Ok(Some(line)) = conn.read_message().await {
                received.push(line);
                conn.send_message(reply).await.expect("reply");
            }
            while let Ok(Some(line)) = conn.read_message().await {
                received.push(line);
            }
            let _ = tx.send(received);
        });

        (Peer::new(id, "127.0.0.1", port), rx)
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("local_addr").port()
    }

    const TIMEOUT: Duration = Duration::from_millis(500);

    #[test]
    fn peers_sort_by_id() {
        let mut peers = vec![
            Peer::new(25, "c", 1),
            Peer::new(5, "a", 3),
            Peer::new(15, "b", 2),
        ];
        peers.sort();
        let ids: Vec<i32> = peers.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![5, 15, 25]);
        assert_eq!(peers[0].address(), "a:3");
    }

    #[tokio::test]
    async fn elect_expect_ok_sends_candidate_id() {
        let (peer, received) = scripted_peer(2, "ok").await;
        assert!(peer.send_elect_expect_ok(1, TIMEOUT).await);
        assert_eq!(received.await.unwrap(), vec!["elect 1".to_string()]);
    }

    #[tokio::test]
    async fn declare_expects_ack() {
        let (peer, _) = scripted_peer(2, "ack 2").await;
        assert!(peer.send_declare_expect_ack(3, TIMEOUT).await);

        let (peer, _) = scripted_peer(2, "error protocol error").await;
        assert!(!peer.send_declare_expect_ack(3, TIMEOUT).await);
    }

    #[tokio::test]
    async fn vote_for_another_candidate_is_withheld() {
        let (peer, _) = scripted_peer(20, "vote 20 10").await;
        assert!(peer.send_elect_expect_vote(10, TIMEOUT).await);

        let (peer, _) = scripted_peer(20, "vote 20 30").await;
        assert!(!peer.send_elect_expect_vote(10, TIMEOUT).await);
    }

    #[tokio::test]
    async fn malformed_vote_is_answered_with_usage() {
        let (peer, received) = scripted_peer(20, "ok").await;
        assert!(!peer.send_elect_expect_vote(10, TIMEOUT).await);
        assert_eq!(
            received.await.unwrap(),
            vec![
                "elect 10".to_string(),
                "error usage: vote <sender-id> <candidate-id>".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn unreachable_peer_counts_as_no_response() {
        let peer = Peer::new(9, "127.0.0.1", closed_port().await);
        assert!(!peer.send_elect_expect_ok(1, TIMEOUT).await);
        assert!(!peer.send_declare_expect_ack(1, TIMEOUT).await);
        assert!(!peer.send_elect_expect_vote(1, TIMEOUT).await);
        assert!(!peer.send_ping(TIMEOUT).await);
    }

    #[tokio::test]
    async fn silent_peer_is_bounded_by_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local_addr").port();
        let _hold = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let peer = Peer::new(3, "127.0.0.1", port);
        let started = std::time::Instant::now();
        assert!(!peer.send_elect_expect_ok(1, Duration::from_millis(100)).await);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
