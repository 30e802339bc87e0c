//! Configuration Types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::forward::{BindFailurePolicy, ForwardRuleConfig};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub ssh: SshConfig,
    #[serde(default)]
    pub forwards: Vec<ForwardRuleConfig>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// SSH server the tunnel is established with
#[derive(Clone, Deserialize, Serialize)]
pub struct SshConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    #[serde(default)]
    pub identity_passphrase: Option<String>,
    /// Pinned server key: `SHA256:...` fingerprint or OpenSSH public key line
    #[serde(default)]
    pub host_key: Option<String>,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(default = "default_keepalive_interval", with = "humantime_serde")]
    pub keepalive_interval: Option<Duration>,
    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: usize,
}

// Keeps secrets out of log lines
impl fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("identity_file", &self.identity_file)
            .field(
                "identity_passphrase",
                &self.identity_passphrase.as_ref().map(|_| "<redacted>"),
            )
            .field("host_key", &self.host_key)
            .field("connect_timeout", &self.connect_timeout)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("keepalive_max", &self.keepalive_max)
            .finish()
    }
}

/// Forwarding engine tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub on_bind_failure: BindFailurePolicy,
    /// Upper bound on concurrent relay sessions; unbounded when absent
    #[serde(default)]
    pub max_sessions: Option<usize>,
    /// Tear down sessions with no traffic in either direction for this long
    #[serde(default, with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_ansi")]
    pub ansi: bool,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_keepalive_interval() -> Option<Duration> {
    Some(Duration::from_secs(30))
}

fn default_keepalive_max() -> usize {
    3
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_buffer_size() -> usize {
    16 * 1024
}

fn default_nodelay() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ansi() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            on_bind_failure: BindFailurePolicy::default(),
            max_sessions: None,
            idle_timeout: None,
            shutdown_timeout: default_shutdown_timeout(),
            buffer_size: default_buffer_size(),
            nodelay: default_nodelay(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            ansi: default_ansi(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_ssh_port(),
            user: String::new(),
            password: None,
            identity_file: None,
            identity_passphrase: None,
            host_key: None,
            connect_timeout: default_connect_timeout(),
            keepalive_interval: default_keepalive_interval(),
            keepalive_max: default_keepalive_max(),
        }
    }
}
