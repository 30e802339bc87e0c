//! Listener Loop
//!
//! Owns the bound socket of one forward rule and spawns a relay session for
//! every accepted connection.

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::session::{CloseReason, RelaySession, SessionOptions};
use super::stats::ForwardStats;
use super::ForwardRule;
use crate::resource::AdmissionGate;
use crate::transport::Transport;
use crate::Result;

/// Pause after a failed accept so resource exhaustion does not spin the loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Everything a listener hands to the sessions it spawns
#[derive(Clone)]
pub(crate) struct ListenerContext {
    pub transport: Arc<dyn Transport>,
    pub options: SessionOptions,
    pub nodelay: bool,
    pub gate: Option<Arc<AdmissionGate>>,
    pub close_tx: broadcast::Sender<()>,
}

/// A bound listening socket for one forward rule
pub struct ListenerLoop {
    rule: ForwardRule,
    listener: TcpListener,
    local_addr: SocketAddr,
    stats: Arc<ForwardStats>,
}

impl ListenerLoop {
    /// Bind the rule's local address
    pub async fn bind(rule: ForwardRule) -> Result<Self> {
        let bind_addr = rule.local.to_string();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("Failed to bind local address {}", bind_addr))?;
        let local_addr = listener
            .local_addr()
            .with_context(|| format!("Failed to read bound address for {}", bind_addr))?;

        info!("Port forward: {} -> {}", local_addr, rule.remote);
        let stats = Arc::new(ForwardStats::new(rule.label()));

        Ok(Self {
            rule,
            listener,
            local_addr,
            stats,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn rule(&self) -> &ForwardRule {
        &self.rule
    }

    pub fn stats(&self) -> Arc<ForwardStats> {
        Arc::clone(&self.stats)
    }

    /// Accept until shutdown. The socket is closed when this returns.
    pub(crate) async fn run(self, ctx: ListenerContext, mut shutdown_rx: broadcast::Receiver<()>) {
        let label = self.rule.label();
        debug!(rule = %label, "Starting accept loop on {}", self.local_addr);

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            self.stats.record_accepted();
                            debug!(rule = %label, peer = %peer, "Accepted connection");

                            let permit = match &ctx.gate {
                                Some(gate) => match gate.try_admit() {
                                    Some(permit) => Some(permit),
                                    None => {
                                        self.stats.record_rejected();
                                        warn!(rule = %label, peer = %peer, "Rejecting connection, session limit reached");
                                        continue;
                                    }
                                },
                                None => None,
                            };

                            if ctx.nodelay {
                                if let Err(e) = stream.set_nodelay(true) {
                                    debug!(peer = %peer, "Failed to set TCP_NODELAY: {}", e);
                                }
                            }

                            let session = RelaySession::new(
                                label.clone(),
                                peer,
                                self.rule.remote.clone(),
                                ctx.options.clone(),
                            );
                            let transport = Arc::clone(&ctx.transport);
                            let close_rx = ctx.close_tx.subscribe();
                            let active = self.stats.session_started();
                            let stats = Arc::clone(&self.stats);

                            tokio::spawn(async move {
                                let _permit = permit;
                                let _active = active;
                                let summary = session.run(stream, transport, close_rx).await;
                                if summary.reason == CloseReason::OpenFailed {
                                    stats.record_open_failure();
                                }
                                stats.record_transfer(summary.bytes_up, summary.bytes_down);
                            });
                        }
                        Err(e) => {
                            error!(rule = %label, "Error accepting connection: {}", e);
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!(rule = %label, "Stopping accept loop on {}", self.local_addr);
                    break;
                }
            }
        }
    }
}
