//! Connection resilience: state, backoff and heartbeat.
//!
//! [`state::ConnectionStateMachine`] holds every transition rule and never
//! touches a clock or a socket. [`manager::ConnectionManager`] owns the
//! transport channel and the two timers and turns the machine's effects into
//! real calls.
//!
//! ```text
//! Disconnected --start--> Connecting --subscribed--> Connected
//!                            |  ^                       |
//!                  error/timeout |              error/timeout/heartbeat
//!                            v  | reconnect due         v
//!                         Reconnecting <----------------+
//!                            |
//!                  attempts exhausted --> Failed (until restart)
//! ```

pub mod manager;
pub mod policy;
pub mod state;

use serde::Serialize;

pub use manager::{ConnectionManager, Driven, Incoming};
pub use policy::{
    BASE_RECONNECT_DELAY, HEARTBEAT_INTERVAL, MAX_RECONNECT_ATTEMPTS, ReconnectPolicy,
};
pub use state::{ConnectionEvent, ConnectionStateMachine, Effect};

/// Where the session's channel stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal until an explicit restart.
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
