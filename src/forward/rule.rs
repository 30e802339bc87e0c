//! Forward Rules
//!
//! A rule pairs a local bind address with a target that only the far end
//! of the transport can reach.

use anyhow::{anyhow, bail, Context};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Result;

/// A `host:port` pair as written in configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardAddr {
    pub host: String,
    pub port: u16,
}

impl ForwardAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`, `ip:port` or `[ipv6]:port`
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            bail!("address is empty");
        }

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| anyhow!("missing ']' in address '{}'", s))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| anyhow!("missing port in address '{}'", s))?;
            (host, port)
        } else {
            let (host, port) = s
                .rsplit_once(':')
                .ok_or_else(|| anyhow!("missing port in address '{}'", s))?;
            if host.contains(':') {
                bail!("IPv6 address '{}' must be written as [addr]:port", s);
            }
            (host, port)
        };

        if host.is_empty() {
            bail!("missing host in address '{}'", s);
        }

        let port = port
            .parse::<u16>()
            .with_context(|| format!("invalid port in address '{}'", s))?;

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for ForwardAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ForwardAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Forward rule as it appears in the configuration file
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ForwardRuleConfig {
    pub local: String,
    pub remote: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A validated, immutable forward rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRule {
    pub name: Option<String>,
    pub local: ForwardAddr,
    pub remote: ForwardAddr,
}

impl ForwardRule {
    pub fn new(local: ForwardAddr, remote: ForwardAddr) -> Self {
        Self {
            name: None,
            local,
            remote,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Human readable label used in log lines
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{} -> {}", self.local, self.remote),
        }
    }
}

impl TryFrom<&ForwardRuleConfig> for ForwardRule {
    type Error = anyhow::Error;

    fn try_from(cfg: &ForwardRuleConfig) -> Result<Self> {
        let local = ForwardAddr::parse(&cfg.local)
            .with_context(|| format!("invalid local address '{}'", cfg.local))?;
        let remote = ForwardAddr::parse(&cfg.remote)
            .with_context(|| format!("invalid remote address '{}'", cfg.remote))?;

        if remote.port == 0 {
            bail!("remote address '{}' must have a non-zero port", cfg.remote);
        }

        Ok(Self {
            name: cfg.name.clone().filter(|n| !n.trim().is_empty()),
            local,
            remote,
        })
    }
}
