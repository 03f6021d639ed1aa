use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use framecast_common::config::ServerConfig;
use framecast_common::frame::Frame;
use framecast_common::multipart::{self, RESPONSE_PREAMBLE};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::{ClientConnection, ClientInfo, ClientRegistry, Delivery};
use crate::sink::FrameSink;

const LISTEN_BACKLOG: u32 = 64;
/// Requests larger than this are cut off; the rest is never read.
const MAX_REQUEST_LEN: usize = 8 * 1024;
const REQUEST_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Starting => 1,
            Self::Running => 2,
            Self::Stopping => 3,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: io::Error,
    },
    #[error("broadcast server already running on {0}")]
    AlreadyRunning(SocketAddr),
}

#[derive(Debug, thiserror::Error)]
enum HandshakeError {
    #[error("no request within {0:?}")]
    Timeout(Duration),
    #[error("viewer closed before sending a request")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub state: ServerState,
    pub local_addr: Option<SocketAddr>,
    pub clients: Vec<ClientInfo>,
    pub frames_pushed: u64,
}

/// State shared between the server handle and its accept task.
struct Shared {
    state: AtomicU8,
    registry: ClientRegistry,
    local_addr: RwLock<Option<SocketAddr>>,
    frames_pushed: AtomicU64,
    handshake_timeout: Duration,
    send_timeout: Duration,
    accept_poll: Duration,
}

impl Shared {
    fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ServerState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn set_local_addr(&self, addr: Option<SocketAddr>) {
        if let Ok(mut slot) = self.local_addr.write() {
            *slot = addr;
        }
    }
}

struct AcceptWorker {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Fans each pushed frame out to every connected MJPEG viewer.
///
/// Viewers connect over plain TCP, send any HTTP request, and receive a
/// `multipart/x-mixed-replace` stream until they disconnect, fall behind past
/// the send timeout, or the server stops.
pub struct BroadcastServer {
    shared: Arc<Shared>,
    /// Serialises `start`/`stop`; holds the accept task while running.
    lifecycle: Mutex<Option<AcceptWorker>>,
}

impl BroadcastServer {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(ServerState::Stopped.as_u8()),
                registry: ClientRegistry::new(),
                local_addr: RwLock::new(None),
                frames_pushed: AtomicU64::new(0),
                handshake_timeout: config.handshake_timeout(),
                send_timeout: config.send_timeout(),
                accept_poll: config.accept_poll(),
            }),
            lifecycle: Mutex::new(None),
        }
    }

    /// Bind `0.0.0.0:port` and spawn the accept loop. Returns the bound address
    /// (useful with port 0). Does not wait for viewers.
    pub async fn start(&self, port: u16) -> Result<SocketAddr, BroadcastError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(worker) = lifecycle.as_ref() {
            return Err(BroadcastError::AlreadyRunning(worker.local_addr));
        }

        self.shared.set_state(ServerState::Starting);
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let (listener, local_addr) = match bind_listener(addr) {
            Ok(bound) => bound,
            Err(source) => {
                self.shared.set_state(ServerState::Stopped);
                return Err(BroadcastError::Bind { addr, source });
            }
        };

        self.shared.registry.open().await;
        self.shared.set_local_addr(Some(local_addr));
        self.shared.set_state(ServerState::Running);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.shared),
            cancel.clone(),
        ));
        *lifecycle = Some(AcceptWorker {
            local_addr,
            cancel,
            task,
        });

        info!(addr = %local_addr, "broadcast server listening");
        Ok(local_addr)
    }

    /// Tear the server down. Safe to call concurrently with `broadcast` and
    /// with itself; a no-op when already stopped.
    ///
    /// Order matters: viewers are closed under the registry lock before the
    /// listener goes away, and the accept task is joined last.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(worker) = lifecycle.take() else {
            return;
        };

        self.shared.set_state(ServerState::Stopping);
        let closed = self.shared.registry.close_all().await;

        // The accept task owns the listener and drops it on cancellation.
        worker.cancel.cancel();
        if let Err(e) = worker.task.await {
            warn!(error = %e, "accept task ended abnormally");
        }

        self.shared.set_local_addr(None);
        self.shared.set_state(ServerState::Stopped);
        info!(addr = %worker.local_addr, closed, "broadcast server stopped");
    }

    /// Send one frame to every registered viewer. Viewers whose write fails are
    /// evicted before this returns.
    pub async fn broadcast(&self, frame: &Frame) -> Delivery {
        if self.shared.state() != ServerState::Running {
            return Delivery::default();
        }
        let part = multipart::encode_part(&frame.data);
        let delivery = self.shared.registry.broadcast(&part).await;
        self.shared.frames_pushed.fetch_add(1, Ordering::Relaxed);
        debug!(
            seq = frame.seq,
            bytes = frame.len(),
            delivered = delivery.delivered,
            evicted = delivery.evicted,
            "frame broadcast"
        );
        delivery
    }

    pub fn state(&self) -> ServerState {
        self.shared.state()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr.read().map(|addr| *addr).unwrap_or(None)
    }

    pub async fn client_count(&self) -> usize {
        self.shared.registry.len().await
    }

    pub async fn status(&self) -> ServerStatus {
        ServerStatus {
            state: self.state(),
            local_addr: self.local_addr(),
            clients: self.shared.registry.clients().await,
            frames_pushed: self.shared.frames_pushed.load(Ordering::Relaxed),
        }
    }
}

impl Drop for BroadcastServer {
    fn drop(&mut self) {
        if let Some(worker) = self.lifecycle.get_mut().take() {
            self.shared.set_state(ServerState::Stopping);
            worker.cancel.cancel();
        }
    }
}

#[async_trait]
impl FrameSink for BroadcastServer {
    async fn push(&self, frame: &Frame) {
        self.broadcast(frame).await;
    }

    fn name(&self) -> &str {
        "broadcast"
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<(TcpListener, SocketAddr)> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(LISTEN_BACKLOG)?;
    let local_addr = listener.local_addr()?;
    Ok((listener, local_addr))
}

/// Accept viewers until the server leaves `Running` or is cancelled.
///
/// Each accept waits at most `accept_poll`, so a state change is noticed
/// even without cancellation. Handshakes run inline on this task.
async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, cancel: CancellationToken) {
    while shared.state() == ServerState::Running {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            res = tokio::time::timeout(shared.accept_poll, listener.accept()) => res,
        };
        let (mut stream, peer) = match accepted {
            Err(_) => continue,
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(shared.accept_poll).await;
                continue;
            }
        };

        let handshake = tokio::select! {
            _ = cancel.cancelled() => break,
            res = handshake(&mut stream, shared.handshake_timeout) => res,
        };
        if let Err(e) = handshake {
            debug!(peer = %peer, error = %e, "viewer handshake rejected");
            continue;
        }

        let conn = ClientConnection::new(stream, peer, Some(shared.send_timeout));
        match shared.registry.register(conn).await {
            Ok(id) => info!(client = id, peer = %peer, "viewer connected"),
            Err(_) => debug!(peer = %peer, "server stopping, dropping viewer"),
        }
    }
    drop(listener);
    debug!("accept loop exited");
}

/// Drain the viewer's request and answer with the multipart preamble.
///
/// The request is never parsed. Reading stops at the blank line ending the
/// headers, at `MAX_REQUEST_LEN`, or at the deadline; a viewer that sent
/// nothing at all by then is rejected.
async fn handshake(stream: &mut TcpStream, limit: Duration) -> Result<(), HandshakeError> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "failed to set TCP_NODELAY on viewer socket");
    }
    let deadline = Instant::now() + limit;
    let mut request = Vec::with_capacity(1024);
    let mut buf = [0u8; 1024];

    loop {
        match tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
            Err(_) if request.is_empty() => return Err(HandshakeError::Timeout(limit)),
            Err(_) => break,
            Ok(Ok(0)) if request.is_empty() => return Err(HandshakeError::Closed),
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                request.extend_from_slice(&buf[..n]);
                if request.len() >= MAX_REQUEST_LEN
                    || request.windows(REQUEST_END.len()).any(|w| w == REQUEST_END)
                {
                    break;
                }
            }
            Ok(Err(e)) => return Err(e.into()),
        }
    }

    tokio::time::timeout(limit, stream.write_all(RESPONSE_PREAMBLE))
        .await
        .map_err(|_| HandshakeError::Timeout(limit))??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use framecast_common::multipart::MultipartDecoder;
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> ServerConfig {
        ServerConfig {
            port: 0,
            handshake_timeout_ms: 300,
            send_timeout_ms: 300,
            accept_poll_ms: 20,
        }
    }

    fn loopback(addr: SocketAddr) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], addr.port()))
    }

    /// Connect, send a bare request and consume the preamble.
    async fn connect_viewer(addr: SocketAddr) -> TcpStream {
        let mut stream = TcpStream::connect(loopback(addr)).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut preamble = vec![0u8; RESPONSE_PREAMBLE.len()];
        stream.read_exact(&mut preamble).await.unwrap();
        assert_eq!(preamble, RESPONSE_PREAMBLE);
        stream
    }

    /// Descriptors held by this process for sockets whose local port is `port`:
    /// the listener plus every accepted viewer, but not the viewers' own ends.
    #[cfg(target_os = "linux")]
    fn open_sockets_on_port(port: u16) -> usize {
        let mut inodes = std::collections::HashSet::new();
        for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
            let Ok(text) = std::fs::read_to_string(table) else {
                continue;
            };
            for line in text.lines().skip(1) {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() < 10 || fields[9] == "0" {
                    continue;
                }
                let local_port = fields[1]
                    .rsplit(':')
                    .next()
                    .and_then(|p| u16::from_str_radix(p, 16).ok());
                if local_port == Some(port) {
                    inodes.insert(format!("socket:[{}]", fields[9]));
                }
            }
        }
        std::fs::read_dir("/proc/self/fd")
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| std::fs::read_link(entry.path()).ok())
            .filter(|target| inodes.contains(target.to_string_lossy().as_ref()))
            .count()
    }

    async fn wait_for_clients(server: &BroadcastServer, expected: usize) {
        for _ in 0..200 {
            if server.client_count().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {expected} clients, have {}",
            server.client_count().await
        );
    }

    #[tokio::test]
    async fn two_viewers_then_one_disconnects() {
        let server = BroadcastServer::new(&test_config());
        let addr = server.start(0).await.unwrap();
        assert_eq!(server.state(), ServerState::Running);

        let mut first = connect_viewer(addr).await;
        let mut second = connect_viewer(addr).await;
        wait_for_clients(&server, 2).await;

        let delivery = server.broadcast(&Frame::new(&b"JPEGDATA12"[..], 0, 1)).await;
        assert_eq!(delivery.delivered, 2);

        let expected: &[u8] =
            b"\r\n--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 10\r\n\r\nJPEGDATA12\r\n";
        for viewer in [&mut first, &mut second] {
            let mut got = vec![0u8; expected.len()];
            viewer.read_exact(&mut got).await.unwrap();
            assert_eq!(got, expected);
        }

        drop(first);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let delivery = server.broadcast(&Frame::new(&b"SECONDJPEG"[..], 0, 2)).await;
        assert_eq!(delivery.delivered, 1);
        assert_eq!(delivery.evicted, 1);
        assert_eq!(server.client_count().await, 1);

        let mut decoder = MultipartDecoder::new("frame");
        let mut buf = [0u8; 256];
        let part = loop {
            if let Some(part) = decoder.next_part().unwrap() {
                break part;
            }
            let n = second.read(&mut buf).await.unwrap();
            assert!(n > 0);
            decoder.push(&buf[..n]);
        };
        assert_eq!(&part[..], b"SECONDJPEG");

        server.stop().await;
    }

    #[tokio::test]
    async fn frames_arrive_in_push_order() {
        let server = BroadcastServer::new(&test_config());
        let addr = server.start(0).await.unwrap();
        let mut viewer = connect_viewer(addr).await;
        wait_for_clients(&server, 1).await;

        for seq in 0..5u64 {
            let payload = format!("frame-{seq}").into_bytes();
            server.broadcast(&Frame::new(payload, 0, seq)).await;
        }

        let mut decoder = MultipartDecoder::new("frame");
        let mut parts = Vec::new();
        let mut buf = [0u8; 1024];
        while parts.len() < 5 {
            while let Some(part) = decoder.next_part().unwrap() {
                parts.push(String::from_utf8(part.to_vec()).unwrap());
            }
            if parts.len() == 5 {
                break;
            }
            let n = viewer.read(&mut buf).await.unwrap();
            assert!(n > 0);
            decoder.push(&buf[..n]);
        }
        assert_eq!(parts, vec!["frame-0", "frame-1", "frame-2", "frame-3", "frame-4"]);
        assert_eq!(server.status().await.frames_pushed, 5);

        server.stop().await;
    }

    #[tokio::test]
    async fn silent_viewer_is_never_registered() {
        let server = BroadcastServer::new(&test_config());
        let addr = server.start(0).await.unwrap();

        let mut silent = TcpStream::connect(loopback(addr)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(server.client_count().await, 0);

        // The server closed the socket without sending anything.
        let mut buf = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(2), silent.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        // A slow handshake does not wedge the accept loop.
        let _viewer = connect_viewer(addr).await;
        wait_for_clients(&server, 1).await;

        server.stop().await;
    }

    #[tokio::test]
    async fn push_without_viewers_is_a_no_op() {
        let server = BroadcastServer::new(&test_config());
        let stopped = server.broadcast(&Frame::new(vec![1, 2, 3], 0, 0)).await;
        assert_eq!(stopped, Delivery::default());

        server.start(0).await.unwrap();
        let running = server.broadcast(&Frame::new(vec![1, 2, 3], 0, 0)).await;
        assert_eq!(running, Delivery::default());
        server.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_start_twice_fails() {
        let server = BroadcastServer::new(&test_config());
        server.stop().await;
        assert_eq!(server.state(), ServerState::Stopped);

        let addr = server.start(0).await.unwrap();
        assert!(matches!(
            server.start(0).await,
            Err(BroadcastError::AlreadyRunning(a)) if a == addr
        ));

        server.stop().await;
        server.stop().await;
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn bind_conflict_reports_error_and_stays_stopped() {
        let first = BroadcastServer::new(&test_config());
        let addr = first.start(0).await.unwrap();

        let second = BroadcastServer::new(&test_config());
        let result = second.start(addr.port()).await;
        assert!(matches!(result, Err(BroadcastError::Bind { .. })));
        assert_eq!(second.state(), ServerState::Stopped);

        first.stop().await;
    }

    #[tokio::test]
    async fn restart_on_same_port() {
        let server = BroadcastServer::new(&test_config());
        let addr = server.start(0).await.unwrap();
        let _viewer = connect_viewer(addr).await;
        wait_for_clients(&server, 1).await;
        server.stop().await;

        let again = server.start(addr.port()).await.unwrap();
        assert_eq!(again.port(), addr.port());
        let _viewer = connect_viewer(again).await;
        wait_for_clients(&server, 1).await;
        server.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_during_push_closes_everything() {
        let server = Arc::new(BroadcastServer::new(&test_config()));
        let addr = server.start(0).await.unwrap();

        // A viewer that never reads keeps pushes parked in the send path.
        let mut stalled = connect_viewer(addr).await;
        let mut healthy = connect_viewer(addr).await;
        wait_for_clients(&server, 2).await;
        #[cfg(target_os = "linux")]
        assert_eq!(open_sockets_on_port(addr.port()), 3);

        let pusher = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                let payload = vec![0xAB; 256 * 1024];
                for seq in 0..64 {
                    server.broadcast(&Frame::new(payload.clone(), 0, seq)).await;
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        server.stop().await;
        pusher.await.unwrap();

        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.client_count().await, 0);

        // Listener and both accepted sockets are released.
        #[cfg(target_os = "linux")]
        assert_eq!(open_sockets_on_port(addr.port()), 0);
        assert!(TcpStream::connect(loopback(addr)).await.is_err());

        // Both viewer sockets reach end of stream; a reset counts too.
        for viewer in [&mut stalled, &mut healthy] {
            let mut sink = Vec::new();
            tokio::time::timeout(Duration::from_secs(5), viewer.read_to_end(&mut sink))
                .await
                .expect("viewer socket left open");
        }

        // Pushing after stop does nothing.
        let after = server.broadcast(&Frame::new(vec![1], 0, 99)).await;
        assert_eq!(after, Delivery::default());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_reader_is_evicted_without_starving_healthy_viewer() {
        let server = Arc::new(BroadcastServer::new(&test_config()));
        let addr = server.start(0).await.unwrap();

        let socket = TcpSocket::new_v4().unwrap();
        socket.set_recv_buffer_size(4096).unwrap();
        let mut slow = socket.connect(loopback(addr)).await.unwrap();
        slow.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut preamble = vec![0u8; RESPONSE_PREAMBLE.len()];
        slow.read_exact(&mut preamble).await.unwrap();
        wait_for_clients(&server, 1).await;

        let mut healthy = connect_viewer(addr).await;
        wait_for_clients(&server, 2).await;

        let received = Arc::new(AtomicUsize::new(0));
        let reader = {
            let received = Arc::clone(&received);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    match healthy.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            received.fetch_add(n, Ordering::Relaxed);
                        }
                    }
                }
            })
        };

        let limit = Duration::from_millis(300) + Duration::from_secs(1);
        let payload = vec![0x55; 256 * 1024];
        let mut evicted = false;
        for seq in 0..400 {
            let started = Instant::now();
            server.broadcast(&Frame::new(payload.clone(), 0, seq)).await;
            assert!(started.elapsed() < limit, "push blocked for {:?}", started.elapsed());
            if server.client_count().await == 1 {
                evicted = true;
                break;
            }
        }
        assert!(evicted, "slow reader was never evicted");

        let remaining = server.status().await.clients;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, 2);

        // The healthy viewer keeps getting frames afterwards.
        let before = received.load(Ordering::Relaxed);
        let delivery = server.broadcast(&Frame::new(payload.clone(), 0, 1000)).await;
        assert_eq!(delivery.delivered, 1);
        for _ in 0..200 {
            if received.load(Ordering::Relaxed) > before {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(received.load(Ordering::Relaxed) > before);

        server.stop().await;
        reader.await.unwrap();
        drop(slow);
    }
}
