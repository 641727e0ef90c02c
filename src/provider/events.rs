//! Lifecycle event listener for bridge sessions.
//!
//! Long-polls `/sessions/{id}/events/poll` and forwards lifecycle events to
//! the session's bounded channel. The listener ends after forwarding a close,
//! when the receiver is dropped, or when the bridge becomes unreachable (which
//! it reports as a recoverable close so the lifecycle manager's backoff takes
//! over).

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::bridge::BridgeClient;
use super::{DisconnectReason, LifecycleEvent};
use crate::types::SessionId;

/// Delay before re-polling after a non-success status.
const NON_OK_RETRY_SECS: u64 = 5;

/// An event as serialized by the bridge.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// Connection attempt started.
    Connecting,
    /// New pairing QR payload.
    Qr {
        /// Raw QR string.
        qr: String,
    },
    /// Connection authenticated.
    Open,
    /// Connection closed.
    Close {
        /// Protocol close code.
        #[serde(default)]
        code: Option<u16>,
        /// Human-readable reason.
        #[serde(default)]
        reason: String,
    },
    /// Message traffic and anything else the gateway does not track.
    #[serde(other)]
    Other,
}

impl BridgeEvent {
    /// Map to a lifecycle event, dropping untracked event types.
    pub fn into_lifecycle(self) -> Option<LifecycleEvent> {
        match self {
            Self::Connecting => Some(LifecycleEvent::Connecting),
            Self::Qr { qr } => Some(LifecycleEvent::Qr(qr)),
            Self::Open => Some(LifecycleEvent::Open),
            Self::Close { code, reason } => Some(LifecycleEvent::Close(DisconnectReason {
                code,
                message: reason,
            })),
            Self::Other => None,
        }
    }
}

/// Spawn a listener that forwards one session's events to `event_tx`.
///
/// Returns immediately; the listener runs as a background Tokio task.
pub fn spawn_event_listener(
    client: Arc<BridgeClient>,
    session: SessionId,
    event_tx: mpsc::Sender<LifecycleEvent>,
    poll_timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let poll_url = client.session_url(&session, "events/poll");
        info!(%session, url = %poll_url, "listening for bridge events");

        if let Err(e) = poll_events(&client, &poll_url, &event_tx, poll_timeout).await {
            warn!(%session, error = %e, "bridge event stream failed");
            let reason = DisconnectReason::message(format!("event stream error: {e}"));
            let _ = event_tx.send(LifecycleEvent::Close(reason)).await;
        }
        debug!(%session, "bridge event listener stopped");
    })
}

/// Poll until a close is forwarded or the receiver goes away. Returns `Err`
/// on non-timeout network errors.
async fn poll_events(
    client: &BridgeClient,
    poll_url: &str,
    event_tx: &mpsc::Sender<LifecycleEvent>,
    poll_timeout: Duration,
) -> Result<(), reqwest::Error> {
    let http = reqwest::Client::builder().timeout(poll_timeout).build()?;

    loop {
        match client.authorize(http.get(poll_url)).send().await {
            Ok(resp) if resp.status().is_success() => {
                let events = match resp.json::<Vec<BridgeEvent>>().await {
                    Ok(events) => events,
                    Err(e) => {
                        debug!(error = %e, "undecodable event batch, skipping");
                        continue;
                    }
                };
                for event in events.into_iter().filter_map(BridgeEvent::into_lifecycle) {
                    let closing = matches!(event, LifecycleEvent::Close(_));
                    debug!(?event, "received bridge event");
                    if event_tx.send(event).await.is_err() || closing {
                        return Ok(());
                    }
                }
            }
            Ok(resp) => {
                debug!(status = %resp.status(), "event poll returned non-200");
                tokio::time::sleep(Duration::from_secs(NON_OK_RETRY_SECS)).await;
            }
            Err(e) if e.is_timeout() => continue,
            Err(e) => return Err(e),
        }
    }
}
