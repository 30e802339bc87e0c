//! Transport Module
//!
//! The forwarding engine only needs one capability from the tunnel: open a
//! new logical byte stream to an address reachable from the far side.

pub mod ssh;

pub use ssh::SshTransport;

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::forward::ForwardAddr;
use crate::Result;

/// Byte stream usable as the remote half of a relay
pub trait TransportIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TransportIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Logical connection opened through a transport
pub type TransportStream = Box<dyn TransportIo>;

/// An established tunnel that can open logical connections.
///
/// Implementations must allow `open` to be called concurrently from many
/// relay sessions. The engine never closes or reconfigures a transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a logical connection to `target`. `origin` is the local peer
    /// that triggered the request.
    async fn open(&self, target: &ForwardAddr, origin: SocketAddr) -> Result<TransportStream>;
}
