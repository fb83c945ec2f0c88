use std::net::SocketAddr;
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use super::protocol::Reply;
use super::NetworkError;

/// Longest line accepted from a peer, excluding the terminator.
pub const MAX_LINE_LEN: usize = 1024;

/// A line-oriented connection to another cluster member.
///
/// Used on both ends: the acceptor reads commands and writes replies, the
/// connecting side writes commands and waits for replies.
pub struct PeerConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer_addr: SocketAddr,
}

impl PeerConnection {
    pub fn new(stream: TcpStream) -> Result<Self, NetworkError> {
        let peer_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            peer_addr,
        })
    }

    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, NetworkError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Self::new(stream)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Reads the next line. `None` means the peer closed the connection.
    ///
    /// Bytes that are not UTF-8 are replaced rather than rejected, so a
    /// garbled command still gets an error reply.
    pub async fn read_message(&mut self) -> Result<Option<String>, NetworkError> {
        let mut line = Vec::new();
        let read = (&mut self.reader)
            .take(MAX_LINE_LEN as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if read == 0 {
            return Ok(None);
        }

        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        } else if line.len() > MAX_LINE_LEN {
            return Err(NetworkError::Protocol(format!(
                "line from {} exceeds {MAX_LINE_LEN} bytes",
                self.peer_addr
            )));
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }

    pub async fn send_message(&mut self, message: &str) -> Result<(), NetworkError> {
        self.writer.write_all(message.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn send_reply(&mut self, reply: &Reply) -> Result<(), NetworkError> {
        self.send_message(&reply.to_string()).await
    }

    pub async fn print_usage(&mut self, usage: &str) -> Result<(), NetworkError> {
        self.send_reply(&Reply::usage(usage)).await
    }

    /// Waits at most `timeout` for the next line.
    pub async fn wait_for_response(&mut self, timeout: Duration) -> Result<String, NetworkError> {
        match tokio::time::timeout(timeout, self.read_message()).await? {
            Ok(Some(line)) => Ok(line),
            Ok(None) => Err(NetworkError::ConnectionClosed),
            Err(e) => {
                debug!("Error while waiting for response from {}: {e}", self.peer_addr);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn exchanges_lines_in_both_directions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local_addr");

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut conn = PeerConnection::new(stream).expect("conn");
            let line = conn.read_message().await.expect("read").expect("line");
            conn.send_message(&format!("echo {line}")).await.expect("send");
            conn.print_usage("elect <id>").await.expect("usage");
        });

        let mut client = PeerConnection::connect(addr).await.expect("connect");
        client.send_message("hello").await.expect("send");
        let timeout = Duration::from_secs(1);
        assert_eq!(client.wait_for_response(timeout).await.unwrap(), "echo hello");
        assert_eq!(
            client.wait_for_response(timeout).await.unwrap(),
            "error usage: elect <id>"
        );

        server.await.expect("server task");
        assert!(matches!(
            client.wait_for_response(timeout).await,
            Err(NetworkError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local_addr");
        let _hold = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let mut client = PeerConnection::connect(addr).await.expect("connect");
        let res = client.wait_for_response(Duration::from_millis(50)).await;
        assert!(matches!(res, Err(NetworkError::Timeout)));
    }

    async fn raw_pair() -> (TcpStream, PeerConnection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local_addr");
        let raw = TcpStream::connect(addr).await.expect("connect");
        let (stream, _) = listener.accept().await.expect("accept");
        (raw, PeerConnection::new(stream).expect("conn"))
    }

    #[tokio::test]
    async fn invalid_utf8_is_decoded_lossily() {
        let (mut raw, mut conn) = raw_pair().await;
        raw.write_all(b"elect \xff\xfe\r\nping\n").await.unwrap();

        let garbled = conn.read_message().await.unwrap().unwrap();
        assert_eq!(garbled, "elect \u{fffd}\u{fffd}");
        assert_eq!(conn.read_message().await.unwrap().unwrap(), "ping");
    }

    #[tokio::test]
    async fn overlong_line_is_a_protocol_error() {
        let (mut raw, mut conn) = raw_pair().await;
        let mut exact = vec![b'a'; MAX_LINE_LEN];
        exact.push(b'\n');
        raw.write_all(&exact).await.unwrap();
        raw.write_all(&vec![b'b'; MAX_LINE_LEN * 2]).await.unwrap();

        assert_eq!(conn.read_message().await.unwrap().unwrap().len(), MAX_LINE_LEN);
        assert!(matches!(
            conn.read_message().await,
            Err(NetworkError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn unterminated_last_line_is_returned() {
        let (mut raw, mut conn) = raw_pair().await;
        raw.write_all(b"declare 3").await.unwrap();
        drop(raw);

        assert_eq!(conn.read_message().await.unwrap().unwrap(), "declare 3");
        assert!(conn.read_message().await.unwrap().is_none());
    }
}
