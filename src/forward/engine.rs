//! Forwarding Engine
//!
//! Composition root: binds one listener loop per forward rule, shares the
//! transport with all of them and drives graceful shutdown.

use anyhow::{anyhow, bail};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::listener::{ListenerContext, ListenerLoop};
use super::session::SessionOptions;
use super::stats::{ForwardStats, ForwardStatsSnapshot};
use super::ForwardRule;
use crate::config::EngineConfig;
use crate::resource::AdmissionGate;
use crate::shutdown::ShutdownCoordinator;
use crate::transport::Transport;
use crate::Result;

/// How long sessions get to react to the close signal after draining
const FORCE_CLOSE_GRACE: Duration = Duration::from_secs(5);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What to do when a rule's local address cannot be bound
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BindFailurePolicy {
    /// Fail startup; no listener is started
    #[default]
    Abort,
    /// Log the failure and start the remaining rules
    Skip,
}

impl FromStr for BindFailurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "skip" => Ok(Self::Skip),
            other => Err(anyhow!("unknown bind failure policy '{}' (expected abort or skip)", other)),
        }
    }
}

impl fmt::Display for BindFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abort => f.write_str("abort"),
            Self::Skip => f.write_str("skip"),
        }
    }
}

/// Runtime settings for the engine
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub on_bind_failure: BindFailurePolicy,
    pub max_sessions: Option<usize>,
    pub idle_timeout: Option<Duration>,
    pub shutdown_timeout: Duration,
    pub buffer_size: usize,
    pub nodelay: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            on_bind_failure: cfg.on_bind_failure,
            max_sessions: cfg.max_sessions,
            idle_timeout: cfg.idle_timeout,
            shutdown_timeout: cfg.shutdown_timeout,
            buffer_size: cfg.buffer_size,
            nodelay: cfg.nodelay,
        }
    }
}

/// Forwarding engine before start
pub struct Engine {
    transport: Arc<dyn Transport>,
    rules: Vec<ForwardRule>,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(transport: Arc<dyn Transport>, rules: Vec<ForwardRule>, settings: EngineSettings) -> Self {
        Self {
            transport,
            rules,
            settings,
        }
    }

    /// Bind every rule and spawn its listener loop.
    ///
    /// Under [`BindFailurePolicy::Abort`] the first bind failure is returned
    /// and nothing is started. Under [`BindFailurePolicy::Skip`] failed rules
    /// are logged and left out; starting still fails if no rule could bind.
    pub async fn start(self, shutdown: &ShutdownCoordinator) -> Result<EngineHandle> {
        if self.rules.is_empty() {
            bail!("no forward rules configured");
        }

        let mut bound = Vec::with_capacity(self.rules.len());
        for rule in self.rules {
            let label = rule.label();
            match ListenerLoop::bind(rule).await {
                Ok(listener) => bound.push(listener),
                Err(e) => match self.settings.on_bind_failure {
                    BindFailurePolicy::Abort => {
                        return Err(e.context(format!("Forward rule '{}' could not start", label)));
                    }
                    BindFailurePolicy::Skip => {
                        error!(rule = %label, "Skipping forward rule: {:#}", e);
                    }
                },
            }
        }

        if bound.is_empty() {
            bail!("none of the forward rules could bind a local address");
        }

        let gate = self.settings.max_sessions.map(|limit| {
            info!("Limiting concurrent sessions to {}", limit);
            Arc::new(AdmissionGate::new(limit))
        });
        let (close_tx, _) = broadcast::channel(1);
        let ctx = ListenerContext {
            transport: self.transport,
            options: SessionOptions {
                buffer_size: self.settings.buffer_size,
                idle_timeout: self.settings.idle_timeout,
            },
            nodelay: self.settings.nodelay,
            gate,
            close_tx: close_tx.clone(),
        };

        let mut listeners = Vec::with_capacity(bound.len());
        let mut tasks = Vec::with_capacity(bound.len());
        for listener in bound {
            listeners.push(BoundListener {
                rule: listener.rule().clone(),
                local_addr: listener.local_addr(),
                stats: listener.stats(),
            });
            let shutdown_rx = shutdown.subscribe();
            tasks.push(tokio::spawn(listener.run(ctx.clone(), shutdown_rx)));
        }

        info!("Forwarding engine started with {} listener(s)", listeners.len());

        Ok(EngineHandle {
            listeners,
            tasks,
            shutdown: shutdown.clone(),
            close_tx,
            shutdown_timeout: self.settings.shutdown_timeout,
        })
    }
}

/// A rule whose listener is running
#[derive(Debug, Clone)]
pub struct BoundListener {
    pub rule: ForwardRule,
    pub local_addr: SocketAddr,
    pub stats: Arc<ForwardStats>,
}

/// Running engine. Dropping it without calling [`EngineHandle::wait`] or
/// [`EngineHandle::shutdown`] stops the listeners and closes all live
/// sessions without draining.
pub struct EngineHandle {
    listeners: Vec<BoundListener>,
    tasks: Vec<JoinHandle<()>>,
    shutdown: ShutdownCoordinator,
    close_tx: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl EngineHandle {
    pub fn listeners(&self) -> &[BoundListener] {
        &self.listeners
    }

    /// Bound local addresses in rule order
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|l| l.local_addr).collect()
    }

    pub fn active_sessions(&self) -> usize {
        self.listeners.iter().map(|l| l.stats.active()).sum()
    }

    pub fn stats(&self) -> Vec<ForwardStatsSnapshot> {
        self.listeners.iter().map(|l| l.stats.snapshot()).collect()
    }

    /// Request shutdown and wait for it to complete
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.trigger();
        self.wait().await
    }

    /// Run until the shutdown coordinator fires, then stop accepting, drain
    /// in-flight sessions for `shutdown_timeout` and close the rest.
    pub async fn wait(mut self) -> Result<()> {
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("Listener task failed: {}", e);
                }
            }
        }
        info!("All listeners stopped");

        self.drain_sessions(self.shutdown_timeout).await;

        let remaining = self.active_sessions();
        if remaining > 0 {
            warn!("Closing {} session(s) still active after drain", remaining);
            let _ = self.close_tx.send(());
            self.drain_sessions(FORCE_CLOSE_GRACE).await;
        }

        for listener in &self.listeners {
            listener.stats.log_summary();
        }

        let leftover = self.active_sessions();
        if leftover > 0 {
            bail!("{} session(s) did not close during shutdown", leftover);
        }

        info!("Forwarding engine stopped");
        Ok(())
    }

    async fn drain_sessions(&self, limit: Duration) {
        let start_time = Instant::now();
        let mut last_count = self.active_sessions();
        if last_count > 0 {
            info!("Waiting for {} active session(s) to close (timeout: {:?})", last_count, limit);
        }

        while last_count > 0 && start_time.elapsed() < limit {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            let current = self.active_sessions();
            if current != last_count {
                debug!("Active sessions: {} -> {}", last_count, current);
                last_count = current;
            }
        }

        if last_count == 0 {
            debug!("All sessions closed after {:?}", start_time.elapsed());
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        // Listener tasks own the remaining close senders; once they are gone
        // sessions observe the closed channel and tear down.
        for task in &self.tasks {
            task.abort();
        }
    }
}
