//! Forwarding Module
//!
//! Listener loops, relay sessions and the engine that composes them.

pub mod engine;
pub mod listener;
pub mod rule;
pub mod session;
pub mod stats;

pub use engine::{BindFailurePolicy, BoundListener, Engine, EngineHandle, EngineSettings};
pub use listener::ListenerLoop;
pub use rule::{ForwardAddr, ForwardRule, ForwardRuleConfig};
pub use session::{CloseReason, RelaySession, SessionOptions, SessionState, SessionStats};
pub use stats::{ForwardStats, ForwardStatsSnapshot};
