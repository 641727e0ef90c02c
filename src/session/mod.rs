//! Per-session connection lifecycle.
//!
//! ```text
//!   connecting ──open──▶ open ──close──▶ closed ──backoff──▶ connecting
//!       │                                  │
//!       └──────── logout / exhausted ──────┴──────▶ terminated
//! ```
//!
//! [`SessionManager`] owns one state machine per session, fed by the
//! provider's lifecycle channel and consumed by exactly one driver task.

pub mod manager;

use serde::{Deserialize, Serialize};

use crate::types::SessionId;

pub use manager::SessionManager;

/// Lifecycle state of a session's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Connection attempt in progress (initial state).
    Connecting,
    /// Authenticated; sends are possible.
    Open,
    /// Dropped; a reconnect may follow.
    Closed,
    /// Torn down; auth material erased and the entry removed.
    Terminated,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Terminated => "terminated",
        })
    }
}

/// Point-in-time view of one session, as returned by [`SessionManager::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    /// Session identifier.
    pub id: SessionId,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Consecutive recoverable disconnects since the last successful open.
    pub reconnect_attempts: u32,
    /// Whether a pairing QR is waiting to be scanned.
    pub has_qr: bool,
}
