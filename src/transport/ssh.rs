//! SSH Transport
//!
//! Opens `direct-tcpip` channels over one authenticated SSH session.

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use russh::client::{self, AuthResult};
use russh::keys::{self, HashAlg, PublicKey};
use russh::Disconnect;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{Transport, TransportStream};
use crate::config::SshConfig;
use crate::forward::ForwardAddr;
use crate::Result;

/// Authenticated SSH session used as the tunnel
pub struct SshTransport {
    handle: client::Handle<HostKeyChecker>,
    authority: String,
}

impl SshTransport {
    /// Connect, verify the host key and authenticate
    pub async fn connect(cfg: &SshConfig) -> Result<Self> {
        let authority = format!("{}:{}", cfg.host, cfg.port);
        let client_config = Arc::new(client::Config {
            nodelay: true,
            keepalive_interval: cfg.keepalive_interval,
            keepalive_max: cfg.keepalive_max,
            ..Default::default()
        });

        let checker = HostKeyChecker {
            authority: authority.clone(),
            expected: cfg.host_key.clone(),
        };

        info!("Connecting to SSH server {} as '{}'", authority, cfg.user);
        let mut handle = timeout(
            cfg.connect_timeout,
            client::connect(client_config, (cfg.host.as_str(), cfg.port), checker),
        )
        .await
        .map_err(|_| {
            anyhow!(
                "SSH handshake with {} timed out after {:?}",
                authority,
                cfg.connect_timeout
            )
        })?
        .with_context(|| format!("SSH handshake with {} failed", authority))?;

        authenticate(&mut handle, cfg)
            .await
            .with_context(|| format!("SSH authentication with {} failed", authority))?;

        info!("SSH session established with {}", authority);
        Ok(Self { handle, authority })
    }

    /// Address of the SSH server this session is connected to
    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Politely end the SSH session
    pub async fn disconnect(&self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .with_context(|| format!("Failed to disconnect from {}", self.authority))?;
        info!("Disconnected from SSH server {}", self.authority);
        Ok(())
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn open(&self, target: &ForwardAddr, origin: SocketAddr) -> Result<TransportStream> {
        debug!(remote = %target, peer = %origin, "Opening direct-tcpip channel");
        let channel = self
            .handle
            .channel_open_direct_tcpip(
                target.host.clone(),
                u32::from(target.port),
                origin.ip().to_string(),
                u32::from(origin.port()),
            )
            .await
            .with_context(|| {
                format!("direct-tcpip channel to {} via {} failed", target, self.authority)
            })?;
        Ok(Box::new(channel.into_stream()))
    }
}

async fn authenticate(handle: &mut client::Handle<HostKeyChecker>, cfg: &SshConfig) -> Result<()> {
    if let Some(path) = &cfg.identity_file {
        let key = load_identity(path, cfg.identity_passphrase.as_deref())?;
        let hash_alg = if key.algorithm().is_rsa() {
            handle.best_supported_rsa_hash().await.unwrap_or(None).flatten()
        } else {
            None
        };
        let key = keys::PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg);
        match handle.authenticate_publickey(cfg.user.clone(), key).await? {
            AuthResult::Success => {
                info!(method = "publickey", "SSH authentication succeeded");
                return Ok(());
            }
            AuthResult::Failure { .. } => {
                warn!(method = "publickey", "SSH server rejected public key");
            }
        }
    }

    if let Some(password) = &cfg.password {
        match handle
            .authenticate_password(cfg.user.clone(), password.clone())
            .await?
        {
            AuthResult::Success => {
                info!(method = "password", "SSH authentication succeeded");
                return Ok(());
            }
            AuthResult::Failure { .. } => {
                warn!(method = "password", "SSH server rejected password");
            }
        }
    }

    bail!("all authentication methods for user '{}' were rejected", cfg.user)
}

fn load_identity(path: &Path, passphrase: Option<&str>) -> Result<keys::PrivateKey> {
    let path = expand_home(path);
    keys::load_secret_key(&path, passphrase)
        .with_context(|| format!("Failed to load identity file {}", path.display()))
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Server key verification. Without a pinned key every key is accepted,
/// but its fingerprint is logged so it can be pinned later.
#[derive(Clone)]
struct HostKeyChecker {
    authority: String,
    expected: Option<String>,
}

impl HostKeyChecker {
    fn verify(&self, key: &PublicKey) -> bool {
        let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();
        let Some(expected) = self.expected.as_deref() else {
            warn!(
                server = %self.authority,
                fingerprint = %fingerprint,
                "No host key pinned; accepting server key"
            );
            return true;
        };

        let openssh = key.to_openssh().unwrap_or_default();
        if host_key_matches(expected, &fingerprint, &openssh) {
            debug!(server = %self.authority, "Host key matches pinned key");
            true
        } else {
            warn!(
                server = %self.authority,
                fingerprint = %fingerprint,
                "Host key does not match pinned key; rejecting"
            );
            false
        }
    }
}

impl client::Handler for HostKeyChecker {
    type Error = anyhow::Error;

    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl std::future::Future<Output = std::result::Result<bool, Self::Error>> + Send {
        let accepted = self.verify(server_public_key);
        async move { Ok(accepted) }
    }
}

/// Compare a pinned key (`SHA256:` fingerprint or OpenSSH public key line)
/// against the presented key. Comments on OpenSSH lines are ignored.
fn host_key_matches(expected: &str, fingerprint: &str, openssh: &str) -> bool {
    let expected = expected.trim();
    if expected.starts_with("SHA256:") {
        return expected == fingerprint;
    }

    let mut want = expected.split_whitespace();
    let mut got = openssh.split_whitespace();
    match (want.next(), want.next(), got.next(), got.next()) {
        (Some(want_algo), Some(want_blob), Some(got_algo), Some(got_blob)) => {
            want_algo == got_algo && want_blob == got_blob
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPENSSH: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIHVzZWQtb25seS1pbi10ZXN0cw== server";

    #[test]
    fn test_fingerprint_pin() {
        assert!(host_key_matches("SHA256:abc", "SHA256:abc", OPENSSH));
        assert!(host_key_matches("  SHA256:abc\n", "SHA256:abc", OPENSSH));
        assert!(!host_key_matches("SHA256:abd", "SHA256:abc", OPENSSH));
    }

    #[test]
    fn test_openssh_pin_ignores_comment() {
        let pinned = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIHVzZWQtb25seS1pbi10ZXN0cw== ops@laptop";
        assert!(host_key_matches(pinned, "SHA256:x", OPENSSH));

        let bare = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIHVzZWQtb25seS1pbi10ZXN0cw==";
        assert!(host_key_matches(bare, "SHA256:x", OPENSSH));
    }

    #[test]
    fn test_openssh_pin_mismatch() {
        let other_blob = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIG90aGVyLWtleS1lbnRpcmVseQ==";
        assert!(!host_key_matches(other_blob, "SHA256:x", OPENSSH));

        let other_algo = "ssh-rsa AAAAC3NzaC1lZDI1NTE5AAAAIHVzZWQtb25seS1pbi10ZXN0cw==";
        assert!(!host_key_matches(other_algo, "SHA256:x", OPENSSH));

        assert!(!host_key_matches("garbage", "SHA256:x", OPENSSH));
        assert!(!host_key_matches("ssh-ed25519 AAAA", "SHA256:x", ""));
    }

    #[test]
    fn test_expand_home() {
        let plain = Path::new("/etc/ssh/id_ed25519");
        assert_eq!(expand_home(plain), plain.to_path_buf());

        if let Some(home) = std::env::var_os("HOME") {
            let expanded = expand_home(Path::new("~/.ssh/id_ed25519"));
            assert_eq!(expanded, PathBuf::from(home).join(".ssh/id_ed25519"));
        }
    }
}
