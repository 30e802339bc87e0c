//! sshfwd Library
//!
//! TCP port forwarding through a single authenticated SSH session.
//!
//! Local listeners accept connections and relay each one over its own
//! logical channel to an address reachable from the far side of the tunnel.

pub mod config;
pub mod forward;
pub mod resource;
pub mod shutdown;
pub mod transport;

pub use config::Config;
pub use forward::{Engine, EngineHandle, EngineSettings, ForwardRule};
pub use shutdown::ShutdownCoordinator;
pub use transport::{SshTransport, Transport};

/// Common error type for the forwarder
pub type Result<T> = anyhow::Result<T>;
