//! Connection provider boundary.
//!
//! The chat protocol itself (connect, authenticate, frame encoding) lives
//! outside the gateway. The gateway only sees a [`ConnectionProvider`] that
//! opens a [`Transport`] per session and streams [`LifecycleEvent`]s for it
//! over a bounded channel. [`bridge`] implements this against the HTTP bridge
//! sidecar.

pub mod bridge;
pub mod events;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{DeliveryReceipt, MessagePayload, SessionId};

/// Close code the chat network uses for "logged out".
pub const LOGGED_OUT_CODE: u16 = 401;

/// Errors from a connection provider or transport.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP request to the bridge failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The bridge answered with an error envelope or unexpected status.
    #[error("bridge error: {0}")]
    Bridge(String),

    /// The session has no open connection to send on.
    #[error("not connected")]
    NotConnected,
}

/// Why a connection closed, as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectReason {
    /// Protocol-level close code, if one was given.
    #[serde(default)]
    pub code: Option<u16>,
    /// Human-readable description.
    #[serde(default)]
    pub message: String,
}

impl DisconnectReason {
    /// Build a reason with only a message.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// The "logged out" reason.
    pub fn logged_out() -> Self {
        Self {
            code: Some(LOGGED_OUT_CODE),
            message: "logged out".to_owned(),
        }
    }

    /// Whether the code marks a remote logout.
    pub fn is_logged_out(&self) -> bool {
        self.code == Some(LOGGED_OUT_CODE)
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Lifecycle event emitted by a provider for one session.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// Connection attempt in progress.
    Connecting,
    /// Pairing artifact (QR payload) to show the account owner.
    Qr(String),
    /// Connection is authenticated and ready to send.
    Open,
    /// Connection closed.
    Close(DisconnectReason),
}

/// A live connection for one session.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one message.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on any transport-level failure.
    async fn send(
        &self,
        recipient: &str,
        payload: &MessagePayload,
    ) -> Result<DeliveryReceipt, ProviderError>;

    /// Log the account out remotely. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the request failed; callers log and move on.
    async fn logout(&self) -> Result<(), ProviderError>;

    /// Close the connection without logging out. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the request failed; callers log and move on.
    async fn end(&self) -> Result<(), ProviderError>;
}

/// Shared handle to a session's transport.
pub type TransportHandle = Arc<dyn Transport>;

/// Result of [`ConnectionProvider::connect`].
pub struct Connection {
    /// Handle used for sends, logout and teardown.
    pub transport: TransportHandle,
    /// Lifecycle events for this connection. The stream ending counts as a
    /// recoverable close.
    pub events: mpsc::Receiver<LifecycleEvent>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Opens connections and owns per-session auth material.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Start connecting a session.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the connection could not be initiated.
    async fn connect(&self, session: &SessionId) -> Result<Connection, ProviderError>;

    /// Classify a close reason: `false` for a logout, `true` otherwise.
    fn is_recoverable(&self, reason: &DisconnectReason) -> bool {
        !reason.is_logged_out()
    }

    /// Erase stored auth material for a session.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if removal failed; callers log and move on.
    async fn remove_auth(&self, session: &SessionId) -> Result<(), ProviderError>;
}
