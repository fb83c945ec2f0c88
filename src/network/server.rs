use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use super::connection::PeerConnection;
use super::protocol::GREETING;
use super::NetworkError;

/// How long in-flight peer connections may keep running after shutdown
/// before they are cancelled.
const CONNECTION_GRACE: Duration = Duration::from_millis(200);

/// Serves the messages of one accepted peer connection.
#[async_trait]
pub trait PeerConnectionHandler: Send + Sync + 'static {
    /// Runs until the peer closes the connection. The greeting has already
    /// been sent.
    async fn handle(&self, connection: PeerConnection) -> Result<(), NetworkError>;
}

/// Accepts inbound peer connections and serves each one on its own task.
pub struct PeerConnectionManager {
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    handler: Arc<dyn PeerConnectionHandler>,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PeerConnectionManager {
    pub fn new(
        listener: TcpListener,
        handler: Arc<dyn PeerConnectionHandler>,
    ) -> Result<Self, NetworkError> {
        let local_addr = listener.local_addr()?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            local_addr,
            listener: Mutex::new(Some(listener)),
            handler,
            shutdown,
            accept_task: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts accepting peer connections in the background. Only the first
    /// call has an effect.
    pub fn join_cluster(&self) {
        // Subscribed before the listener leaves the mutex, so a concurrent
        // shutdown is always observed by the accept loop.
        let shutdown = self.shutdown.subscribe();
        let mut accept_task = lock(&self.accept_task);
        let Some(listener) = lock(&self.listener).take() else {
            debug!("Peer listener on {} already started or closed", self.local_addr);
            return;
        };

        *accept_task = Some(tokio::spawn(accept_peer_connections(
            listener,
            Arc::clone(&self.handler),
            shutdown,
        )));
    }

    /// Closes the listening socket and waits for the accept loop to finish.
    /// Safe to call repeatedly and before [`join_cluster`](Self::join_cluster).
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        lock(&self.listener).take();

        let task = lock(&self.accept_task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Peer accept loop on {} ended abnormally: {e}", self.local_addr);
                }
            }
        }
    }
}

async fn accept_peer_connections(
    listener: TcpListener,
    handler: Arc<dyn PeerConnectionHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    let local_addr = listener.local_addr().ok();
    let mut connections = JoinSet::new();

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    connections.spawn(serve_connection(stream, Arc::clone(&handler)));
                }
                Err(e) => warn!("Failed to accept a peer connection: {e}"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    if let Some(addr) = local_addr {
        info!("Peer listener on {addr} is closed. Stopping to accept peer connections.");
    }

    let drained = tokio::time::timeout(CONNECTION_GRACE, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        debug!(
            "Cancelling {} peer connection(s) still open after shutdown",
            connections.len()
        );
        connections.abort_all();
    }
}

async fn serve_connection(stream: TcpStream, handler: Arc<dyn PeerConnectionHandler>) {
    let mut connection = match PeerConnection::new(stream) {
        Ok(connection) => connection,
        Err(e) => {
            debug!("Dropping peer connection: {e}");
            return;
        }
    };
    let addr = connection.peer_addr();

    if let Err(e) = connection.send_message(GREETING).await {
        debug!("Failed to greet peer at {addr}: {e}");
        return;
    }
    if let Err(e) = handler.handle(connection).await {
        debug!("Failed while handling messages from peer at {addr}: {e}");
    }
}
