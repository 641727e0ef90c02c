//! Gateway-level error taxonomy.
//!
//! A skipped duplicate is not an error: it is a successful
//! [`SendOutcome`](crate::queue::SendOutcome).

use crate::provider::ProviderError;
use crate::store::StoreError;

/// Errors surfaced to callers of the gateway components.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Malformed input (bad session id, missing field). Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown session or campaign. Sessions torn down after exhausting
    /// their reconnect attempts also end up here.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What was looked up ("session", "campaign").
        kind: &'static str,
        /// The identifier that did not resolve.
        id: String,
    },

    /// Send failed at the transport or provider level, after retries.
    #[error("transport error: {0}")]
    Transport(#[from] ProviderError),

    /// Snapshot persistence failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl GatewayError {
    /// Shorthand for an unknown session.
    pub fn session_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "session",
            id: id.into(),
        }
    }

    /// Shorthand for an unknown campaign.
    pub fn campaign_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "campaign",
            id: id.into(),
        }
    }
}
