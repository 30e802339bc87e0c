//! Shared helpers for integration tests

#![allow(dead_code)]

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use sshfwd::forward::{EngineHandle, EngineSettings, ForwardAddr, ForwardRule};
use sshfwd::transport::{Transport, TransportStream};
use sshfwd::{Engine, ShutdownCoordinator};

/// Dials the target directly over TCP, standing in for the far end of a tunnel
#[derive(Default)]
pub struct LoopbackTransport {
    opens: AtomicUsize,
}

impl LoopbackTransport {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn open(&self, target: &ForwardAddr, _origin: SocketAddr) -> sshfwd::Result<TransportStream> {
        let stream = TcpStream::connect(target.to_string())
            .await
            .with_context(|| format!("connect to {} failed", target))?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(stream))
    }
}

/// A transport whose session is unusable
pub struct FailingTransport;

#[async_trait]
impl Transport for FailingTransport {
    async fn open(&self, target: &ForwardAddr, _origin: SocketAddr) -> sshfwd::Result<TransportStream> {
        Err(anyhow!("channel open to {} rejected: administratively prohibited", target))
    }
}

pub fn rule_to(remote: SocketAddr) -> ForwardRule {
    ForwardRule::new(
        ForwardAddr::new("127.0.0.1", 0),
        ForwardAddr::new(remote.ip().to_string(), remote.port()),
    )
}

pub fn test_settings() -> EngineSettings {
    EngineSettings {
        shutdown_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

pub async fn start_engine(
    transport: Arc<dyn Transport>,
    rules: Vec<ForwardRule>,
    settings: EngineSettings,
) -> (EngineHandle, ShutdownCoordinator) {
    let coordinator = ShutdownCoordinator::new();
    let handle = Engine::new(transport, rules, settings)
        .start(&coordinator)
        .await
        .expect("engine should start");
    (handle, coordinator)
}

/// Echo server; a chunk containing `KILL` makes it drop that connection
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    let n = match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if buf[..n].windows(4).any(|w| w == b"KILL") {
                        break;
                    }
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// Server that reports everything each connection sent once it closes
pub async fn spawn_recording_server() -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut received = Vec::new();
                let _ = stream.read_to_end(&mut received).await;
                let _ = tx.send(received);
            });
        }
    });
    (addr, rx)
}

/// Server that never writes and reports when the peer side goes away
pub async fn spawn_silent_server() -> (SocketAddr, mpsc::UnboundedReceiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
                let _ = tx.send(());
            });
        }
    });
    (addr, rx)
}

/// Server that closes every connection right after accepting it
pub async fn spawn_closing_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });
    addr
}

/// Read until EOF or error, bounded by a timeout
pub async fn read_until_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut received = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut received))
        .await
        .expect("connection should close");
    received
}
