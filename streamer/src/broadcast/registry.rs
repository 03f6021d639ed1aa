use std::io;
use std::net::{Shutdown, SocketAddr};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub type ClientId = u64;

/// Upper bound on reads per liveness check, so a chatty viewer cannot stall `push`.
const MAX_LIVENESS_READS: usize = 8;

/// A viewer socket that finished its handshake.
///
/// Only the [`ClientRegistry`] ever writes to or closes one of these; everyone
/// else refers to a viewer by its [`ClientId`].
pub struct ClientConnection {
    id: ClientId,
    peer: SocketAddr,
    stream: TcpStream,
    registered_at: Instant,
    send_timeout: Option<Duration>,
}

impl ClientConnection {
    pub fn new(stream: TcpStream, peer: SocketAddr, send_timeout: Option<Duration>) -> Self {
        Self {
            id: 0,
            peer,
            stream,
            registered_at: Instant::now(),
            send_timeout,
        }
    }

    /// Non-blocking check for a viewer that already closed its end.
    /// Anything the viewer sends after the handshake is discarded.
    fn peer_hung_up(&self) -> bool {
        let mut scratch = [0u8; 512];
        for _ in 0..MAX_LIVENESS_READS {
            match self.stream.try_read(&mut scratch) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(_) => return true,
            }
        }
        false
    }

    async fn send(&mut self, part: &[u8]) -> io::Result<()> {
        if self.peer_hung_up() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "viewer closed the connection",
            ));
        }
        match self.send_timeout {
            Some(limit) => tokio::time::timeout(limit, self.stream.write_all(part))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "send timed out"))?,
            None => self.stream.write_all(part).await,
        }
    }

    /// Shut down both directions and release the descriptor.
    fn close(self) {
        if let Ok(stream) = self.stream.into_std() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Snapshot of one registered viewer.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub id: ClientId,
    pub peer: SocketAddr,
    pub connected_ms: u64,
}

/// Outcome of one fan-out pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub evicted: usize,
}

struct Inner {
    clients: Vec<ClientConnection>,
    accepting: bool,
    next_id: ClientId,
}

/// The set of live viewer connections.
///
/// Every mutation and every socket write happens while `inner` is locked, so a
/// concurrent [`close_all`](Self::close_all) can never close a descriptor that
/// a fan-out is still writing to.
pub struct ClientRegistry {
    inner: Mutex<Inner>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                clients: Vec::new(),
                accepting: false,
                next_id: 1,
            }),
        }
    }

    /// Allow registrations again after a [`close_all`](Self::close_all).
    pub async fn open(&self) {
        self.inner.lock().await.accepting = true;
    }

    /// Add a connection. Hands it back if the registry is draining.
    pub async fn register(&self, mut conn: ClientConnection) -> Result<ClientId, ClientConnection> {
        let mut inner = self.inner.lock().await;
        if !inner.accepting {
            return Err(conn);
        }
        conn.id = inner.next_id;
        inner.next_id += 1;
        let id = conn.id;
        debug!(client = id, peer = %conn.peer, total = inner.clients.len() + 1, "viewer registered");
        inner.clients.push(conn);
        Ok(id)
    }

    /// Write `part` to every viewer, evicting any whose write fails.
    pub async fn broadcast(&self, part: &[u8]) -> Delivery {
        let mut inner = self.inner.lock().await;
        let mut delivery = Delivery::default();
        let mut i = 0;
        while i < inner.clients.len() {
            match inner.clients[i].send(part).await {
                Ok(()) => {
                    delivery.delivered += 1;
                    i += 1;
                }
                Err(e) => {
                    let conn = inner.clients.remove(i);
                    warn!(
                        client = conn.id,
                        peer = %conn.peer,
                        error = %e,
                        remaining = inner.clients.len(),
                        "evicting viewer"
                    );
                    conn.close();
                    delivery.evicted += 1;
                }
            }
        }
        delivery
    }

    /// Stop accepting registrations, then shut down and drop every connection.
    pub async fn close_all(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.accepting = false;
        let closed = inner.clients.len();
        for conn in inner.clients.drain(..) {
            conn.close();
        }
        closed
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.clients.len()
    }

    pub async fn clients(&self) -> Vec<ClientInfo> {
        let inner = self.inner.lock().await;
        inner
            .clients
            .iter()
            .map(|c| ClientInfo {
                id: c.id,
                peer: c.peer,
                connected_ms: c.registered_at.elapsed().as_millis() as u64,
            })
            .collect()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
