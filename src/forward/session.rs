//! Relay Session
//!
//! One session bridges one accepted local connection to one logical
//! connection opened through the transport:
//!
//! `Created -> Opening -> Relaying -> Closed`, or `Opening -> Closed` when
//! the transport refuses the open.
//!
//! When either copy direction stops (end of stream, I/O error, idle timeout
//! or engine shutdown) both endpoints are shut down and dropped, so the
//! other direction cannot linger on a half-open connection.

use bytes::BytesMut;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::ForwardAddr;
use crate::transport::{Transport, TransportStream};

/// Lifecycle of a relay session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Opening,
    Relaying,
    Closed,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The transport could not open the logical connection
    OpenFailed,
    /// Local peer sent end of stream
    LocalClosed,
    /// Remote end sent end of stream
    RemoteClosed,
    /// I/O error copying local -> remote
    UpstreamError,
    /// I/O error copying remote -> local
    DownstreamError,
    IdleTimeout,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::OpenFailed => "open failed",
            CloseReason::LocalClosed => "local closed",
            CloseReason::RemoteClosed => "remote closed",
            CloseReason::UpstreamError => "upstream error",
            CloseReason::DownstreamError => "downstream error",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Per-session relay tuning
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub buffer_size: usize,
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            buffer_size: 16 * 1024,
            idle_timeout: None,
        }
    }
}

/// Summary of a finished session
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub session_id: String,
    pub rule: String,
    pub peer_addr: SocketAddr,
    pub remote: ForwardAddr,
    pub duration: Duration,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub reason: CloseReason,
}

/// A relay session between one local connection and one logical connection
#[derive(Debug)]
pub struct RelaySession {
    pub session_id: String,
    pub rule: String,
    pub peer_addr: SocketAddr,
    pub remote: ForwardAddr,
    options: SessionOptions,
    state: SessionState,
    start_time: Instant,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    /// Milliseconds after `start_time` when bytes last moved
    last_activity_ms: AtomicU64,
}

impl RelaySession {
    pub fn new(
        rule: impl Into<String>,
        peer_addr: SocketAddr,
        remote: ForwardAddr,
        options: SessionOptions,
    ) -> Self {
        let session_id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        Self {
            session_id,
            rule: rule.into(),
            peer_addr,
            remote,
            options,
            state: SessionState::Created,
            start_time: Instant::now(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Bytes copied local -> remote
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Bytes copied remote -> local
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    fn transition(&mut self, next: SessionState) {
        debug!(
            session_id = %self.session_id,
            from = ?self.state,
            to = ?next,
            "Session state change"
        );
        self.state = next;
    }

    /// Open the logical connection and relay until either side stops.
    ///
    /// Every path through this function closes the local connection and, if
    /// it was opened, the logical connection before returning.
    pub async fn run(
        mut self,
        local: TcpStream,
        transport: Arc<dyn Transport>,
        mut close_rx: broadcast::Receiver<()>,
    ) -> SessionStats {
        self.transition(SessionState::Opening);

        let opened = tokio::select! {
            result = transport.open(&self.remote, self.peer_addr) => Some(result),
            _ = close_rx.recv() => None,
        };

        let remote = match opened {
            Some(Ok(remote)) => remote,
            Some(Err(e)) => {
                warn!(
                    session_id = %self.session_id,
                    rule = %self.rule,
                    peer = %self.peer_addr,
                    remote = %self.remote,
                    "Failed to open remote connection: {:#}",
                    e
                );
                drop(local);
                return self.finish(CloseReason::OpenFailed);
            }
            None => {
                drop(local);
                return self.finish(CloseReason::Shutdown);
            }
        };

        self.transition(SessionState::Relaying);
        debug!(
            session_id = %self.session_id,
            peer = %self.peer_addr,
            remote = %self.remote,
            "Relaying"
        );

        let reason = self.relay(local, remote, &mut close_rx).await;
        self.finish(reason)
    }

    async fn relay(
        &self,
        local: TcpStream,
        remote: TransportStream,
        close_rx: &mut broadcast::Receiver<()>,
    ) -> CloseReason {
        let (mut local_read, mut local_write) = local.into_split();
        let (mut remote_read, mut remote_write) = tokio::io::split(remote);

        let reason = {
            let upstream = self.pump(&mut local_read, &mut remote_write, &self.bytes_up);
            let downstream = self.pump(&mut remote_read, &mut local_write, &self.bytes_down);
            let idle = self.idle_watch();
            tokio::pin!(upstream, downstream, idle);

            tokio::select! {
                result = &mut upstream => match result {
                    Ok(()) => CloseReason::LocalClosed,
                    Err(e) => {
                        debug!(session_id = %self.session_id, "Upstream copy failed: {}", e);
                        CloseReason::UpstreamError
                    }
                },
                result = &mut downstream => match result {
                    Ok(()) => CloseReason::RemoteClosed,
                    Err(e) => {
                        debug!(session_id = %self.session_id, "Downstream copy failed: {}", e);
                        CloseReason::DownstreamError
                    }
                },
                _ = &mut idle => CloseReason::IdleTimeout,
                _ = close_rx.recv() => CloseReason::Shutdown,
            }
        };

        // The surviving direction was cancelled when its future dropped above;
        // shutting down both writers propagates EOF before the halves drop.
        let _ = remote_write.shutdown().await;
        let _ = local_write.shutdown().await;
        reason
    }

    /// Copy one direction until end of stream or error
    async fn pump<R, W>(&self, reader: &mut R, writer: &mut W, counter: &AtomicU64) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(self.options.buffer_size);
        loop {
            buf.clear();
            let n = reader.read_buf(&mut buf).await?;
            if n == 0 {
                writer.flush().await?;
                return Ok(());
            }
            writer.write_all(&buf).await?;
            writer.flush().await?;
            counter.fetch_add(n as u64, Ordering::Relaxed);
            self.touch();
        }
    }

    fn touch(&self) {
        let now = self.start_time.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.start_time.elapsed().saturating_sub(last)
    }

    /// Resolves once no bytes have moved for `idle_timeout`; never without one
    async fn idle_watch(&self) {
        let Some(limit) = self.options.idle_timeout else {
            return std::future::pending().await;
        };

        loop {
            let idle = self.idle_for();
            if idle >= limit {
                return;
            }
            tokio::time::sleep(limit - idle).await;
        }
    }

    fn finish(mut self, reason: CloseReason) -> SessionStats {
        self.transition(SessionState::Closed);
        let stats = SessionStats {
            session_id: self.session_id.clone(),
            rule: self.rule.clone(),
            peer_addr: self.peer_addr,
            remote: self.remote.clone(),
            duration: self.duration(),
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
            reason,
        };

        info!(
            session_id = %stats.session_id,
            rule = %stats.rule,
            peer = %stats.peer_addr,
            remote = %stats.remote,
            duration_ms = stats.duration.as_millis() as u64,
            bytes_up = stats.bytes_up,
            bytes_down = stats.bytes_down,
            reason = %stats.reason,
            "Relay session closed"
        );

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Result;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use tokio::io::DuplexStream;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    /// Hands out pre-made in-memory streams; fails once they run out
    struct DuplexTransport {
        streams: Mutex<Vec<DuplexStream>>,
    }

    #[async_trait]
    impl Transport for DuplexTransport {
        async fn open(&self, _target: &ForwardAddr, _origin: SocketAddr) -> Result<TransportStream> {
            match self.streams.lock().await.pop() {
                Some(stream) => Ok(Box::new(stream)),
                None => Err(anyhow!("no route to host")),
            }
        }
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn session(options: SessionOptions) -> RelaySession {
        RelaySession::new(
            "test",
            "127.0.0.1:40000".parse().unwrap(),
            ForwardAddr::new("10.0.0.5", 80),
            options,
        )
    }

    #[test]
    fn test_new_session_state() {
        let s = session(SessionOptions::default());
        assert_eq!(s.state(), SessionState::Created);
        assert_eq!(s.bytes_up(), 0);
        assert_eq!(s.bytes_down(), 0);
        assert_eq!(s.session_id.len(), 12);
    }

    #[tokio::test]
    async fn test_open_failure_closes_local() {
        let transport: Arc<dyn Transport> = Arc::new(DuplexTransport {
            streams: Mutex::new(Vec::new()),
        });
        let (mut peer, local) = tcp_pair().await;
        let (_close_tx, close_rx) = broadcast::channel(1);

        let stats = session(SessionOptions::default())
            .run(local, transport, close_rx)
            .await;
        assert_eq!(stats.reason, CloseReason::OpenFailed);

        let mut buf = [0u8; 8];
        let n = peer.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_remote_eof_tears_down_both_sides() {
        let (session_side, mut remote_side) = tokio::io::duplex(1024);
        let transport: Arc<dyn Transport> = Arc::new(DuplexTransport {
            streams: Mutex::new(vec![session_side]),
        });
        let (mut peer, local) = tcp_pair().await;
        let (_close_tx, close_rx) = broadcast::channel(1);

        let task = tokio::spawn(session(SessionOptions::default()).run(local, transport, close_rx));

        peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        remote_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        remote_side.write_all(b"pong").await.unwrap();
        drop(remote_side);

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"pong");

        let stats = task.await.unwrap();
        assert_eq!(stats.reason, CloseReason::RemoteClosed);
        assert_eq!(stats.bytes_up, 4);
        assert_eq!(stats.bytes_down, 4);
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_session() {
        let (session_side, mut remote_side) = tokio::io::duplex(1024);
        let transport: Arc<dyn Transport> = Arc::new(DuplexTransport {
            streams: Mutex::new(vec![session_side]),
        });
        let (mut peer, local) = tcp_pair().await;
        let (_close_tx, close_rx) = broadcast::channel(1);
        let options = SessionOptions {
            idle_timeout: Some(Duration::from_millis(200)),
            ..Default::default()
        };

        let stats = tokio::time::timeout(
            Duration::from_secs(5),
            session(options).run(local, transport, close_rx),
        )
        .await
        .expect("idle session should close");
        assert_eq!(stats.reason, CloseReason::IdleTimeout);

        let mut buf = Vec::new();
        assert_eq!(peer.read_to_end(&mut buf).await.unwrap_or(0), 0);
        assert_eq!(remote_side.read_to_end(&mut buf).await.unwrap_or(0), 0);
    }

    #[tokio::test]
    async fn test_close_signal_ends_session() {
        let (session_side, _remote_side) = tokio::io::duplex(1024);
        let transport: Arc<dyn Transport> = Arc::new(DuplexTransport {
            streams: Mutex::new(vec![session_side]),
        });
        let (_peer, local) = tcp_pair().await;
        let (close_tx, close_rx) = broadcast::channel(1);

        let task = tokio::spawn(session(SessionOptions::default()).run(local, transport, close_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        close_tx.send(()).unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("session should close on signal")
            .unwrap();
        assert_eq!(stats.reason, CloseReason::Shutdown);
    }
}
