//! Session registry and reconnection driver.
//!
//! Shared state sits behind a `std::sync::RwLock` that is never held across an
//! `.await`, so [`SessionManager::get_if_ready`] never blocks on I/O. Each
//! session's state is also published on a `watch` channel so waiters (the
//! queue loop) can park until the connection opens.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{SessionState, SessionSummary};
use crate::config::ReconnectConfig;
use crate::error::GatewayError;
use crate::provider::{
    Connection, ConnectionProvider, DisconnectReason, LifecycleEvent, TransportHandle,
};
use crate::types::SessionId;

/// Registry entry for one live session.
struct SessionEntry {
    state: watch::Sender<SessionState>,
    attempts: u32,
    qr: Option<String>,
    transport: TransportHandle,
    driver: Option<JoinHandle<()>>,
}

/// What the driver does after a close.
enum CloseAction {
    Reconnect(Duration),
    Terminate,
    Gone,
}

struct Inner {
    provider: Arc<dyn ConnectionProvider>,
    policy: ReconnectConfig,
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    connect_lock: tokio::sync::Mutex<()>,
}

/// Owns every session's connection and its lifecycle state machine.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.inner.read().len())
            .field("policy", &self.inner.policy)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager over a connection provider.
    pub fn new(provider: Arc<dyn ConnectionProvider>, policy: ReconnectConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                policy,
                sessions: RwLock::new(HashMap::new()),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Connect a session, or return the handle of the one already registered.
    ///
    /// The new session starts in [`SessionState::Connecting`]; a driver task
    /// takes over the provider's lifecycle events from here on.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the provider cannot start the
    /// connection. No session is registered in that case.
    pub async fn connect(&self, id: &SessionId) -> Result<TransportHandle, GatewayError> {
        let _serialized = self.inner.connect_lock.lock().await;

        if let Some(entry) = self.inner.read().get(id) {
            debug!(session = %id, "session already registered");
            return Ok(Arc::clone(&entry.transport));
        }

        let Connection { transport, events } = self.inner.provider.connect(id).await?;
        let (state, _) = watch::channel(SessionState::Connecting);

        let mut sessions = self.inner.write();
        let driver = tokio::spawn(drive(Arc::clone(&self.inner), id.clone(), events));
        sessions.insert(
            id.clone(),
            SessionEntry {
                state,
                attempts: 0,
                qr: None,
                transport: Arc::clone(&transport),
                driver: Some(driver),
            },
        );
        info!(session = %id, "session registered");
        Ok(transport)
    }

    /// The session's transport if, and only if, it is open right now.
    pub fn get_if_ready(&self, id: &SessionId) -> Option<TransportHandle> {
        self.inner
            .read()
            .get(id)
            .filter(|entry| *entry.state.borrow() == SessionState::Open)
            .map(|entry| Arc::clone(&entry.transport))
    }

    /// Wait until the session is open. `None` once the session is gone.
    pub async fn wait_ready(&self, id: &SessionId) -> Option<TransportHandle> {
        loop {
            let mut rx = {
                let sessions = self.inner.read();
                let entry = sessions.get(id)?;
                if *entry.state.borrow() == SessionState::Open {
                    return Some(Arc::clone(&entry.transport));
                }
                entry.state.subscribe()
            };

            loop {
                if rx.changed().await.is_err() {
                    return None;
                }
                match *rx.borrow_and_update() {
                    SessionState::Open => break,
                    SessionState::Terminated => return None,
                    SessionState::Connecting | SessionState::Closed => {}
                }
            }
        }
    }

    /// Current state, or `None` for unknown (including terminated) sessions.
    pub fn state(&self, id: &SessionId) -> Option<SessionState> {
        self.inner.read().get(id).map(|entry| *entry.state.borrow())
    }

    /// Latest pairing QR for a session still waiting to be linked.
    pub fn qr(&self, id: &SessionId) -> Option<String> {
        self.inner.read().get(id).and_then(|entry| entry.qr.clone())
    }

    /// All registered sessions, ordered by id.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .inner
            .read()
            .iter()
            .map(|(id, entry)| SessionSummary {
                id: id.clone(),
                state: *entry.state.borrow(),
                reconnect_attempts: entry.attempts,
                has_qr: entry.qr.is_some(),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    /// Log a session out and forget it.
    ///
    /// Logout and teardown failures are logged, never returned. Returns
    /// `false` when the session is unknown.
    pub async fn disconnect(&self, id: &SessionId) -> bool {
        let Some(entry) = self.inner.write().remove(id) else {
            return false;
        };
        if let Some(driver) = &entry.driver {
            driver.abort();
        }
        entry.state.send_replace(SessionState::Terminated);

        if let Err(e) = entry.transport.logout().await {
            warn!(session = %id, error = %e, "logout failed, continuing teardown");
        }
        if let Err(e) = entry.transport.end().await {
            warn!(session = %id, error = %e, "failed to end transport");
        }
        if let Err(e) = self.inner.provider.remove_auth(id).await {
            warn!(session = %id, error = %e, "failed to erase auth material");
        }
        info!(session = %id, "session logged out");
        true
    }

    /// End every connection without logging out, keeping auth material so
    /// sessions resume on the next start.
    pub async fn shutdown(&self) {
        let drained: Vec<(SessionId, SessionEntry)> = self.inner.write().drain().collect();
        for (id, entry) in drained {
            if let Some(driver) = &entry.driver {
                driver.abort();
            }
            entry.state.send_replace(SessionState::Terminated);
            if let Err(e) = entry.transport.end().await {
                warn!(session = %id, error = %e, "failed to end transport on shutdown");
            }
        }
    }
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish a state. `false` if the session is gone.
    fn set_state(&self, id: &SessionId, state: SessionState) -> bool {
        match self.read().get(id) {
            Some(entry) => {
                entry.state.send_replace(state);
                true
            }
            None => false,
        }
    }

    fn store_qr(&self, id: &SessionId, qr: String) {
        if let Some(entry) = self.write().get_mut(id) {
            entry.qr = Some(qr);
            info!(session = %id, "pairing QR available");
        }
    }

    fn mark_open(&self, id: &SessionId) {
        if let Some(entry) = self.write().get_mut(id) {
            entry.attempts = 0;
            entry.qr = None;
            entry.state.send_replace(SessionState::Open);
            info!(session = %id, "session open");
        }
    }

    fn replace_transport(&self, id: &SessionId, transport: TransportHandle) -> bool {
        match self.write().get_mut(id) {
            Some(entry) => {
                entry.transport = transport;
                true
            }
            None => false,
        }
    }

    /// Move to `closed` and decide between reconnecting and tearing down.
    fn on_close(&self, id: &SessionId, reason: &DisconnectReason) -> CloseAction {
        let mut sessions = self.write();
        let Some(entry) = sessions.get_mut(id) else {
            return CloseAction::Gone;
        };
        entry.state.send_replace(SessionState::Closed);

        if !self.provider.is_recoverable(reason) {
            entry.attempts = 0;
            info!(session = %id, %reason, "session logged out remotely");
            return CloseAction::Terminate;
        }

        entry.attempts = entry.attempts.saturating_add(1);
        if entry.attempts > self.policy.max_attempts {
            warn!(
                session = %id,
                attempts = entry.attempts,
                %reason,
                "reconnect attempts exhausted, tearing session down"
            );
            return CloseAction::Terminate;
        }

        let delay = self.policy.delay_for(entry.attempts);
        info!(
            session = %id,
            attempt = entry.attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            %reason,
            "connection closed, scheduling reconnect"
        );
        CloseAction::Reconnect(delay)
    }

    /// Remove the session, end its transport and erase its auth material.
    async fn terminate(&self, id: &SessionId) {
        let Some(entry) = self.write().remove(id) else {
            return;
        };
        entry.state.send_replace(SessionState::Terminated);
        if let Err(e) = entry.transport.end().await {
            warn!(session = %id, error = %e, "failed to end transport");
        }
        if let Err(e) = self.provider.remove_auth(id).await {
            warn!(session = %id, error = %e, "failed to erase auth material");
        }
        info!(session = %id, "session terminated");
    }
}

/// Wait for the next close on the lifecycle channel, applying the
/// non-terminal events on the way.
async fn next_close(
    inner: &Inner,
    id: &SessionId,
    events: &mut mpsc::Receiver<LifecycleEvent>,
) -> DisconnectReason {
    loop {
        match events.recv().await {
            Some(LifecycleEvent::Connecting) => {
                inner.set_state(id, SessionState::Connecting);
            }
            Some(LifecycleEvent::Qr(qr)) => inner.store_qr(id, qr),
            Some(LifecycleEvent::Open) => inner.mark_open(id),
            Some(LifecycleEvent::Close(reason)) => return reason,
            None => return DisconnectReason::message("lifecycle stream ended"),
        }
    }
}

/// Single consumer of a session's lifecycle events, across reconnects.
async fn drive(inner: Arc<Inner>, id: SessionId, mut events: mpsc::Receiver<LifecycleEvent>) {
    let mut pending: Option<DisconnectReason> = None;

    loop {
        let reason = match pending.take() {
            Some(reason) => reason,
            None => next_close(&inner, &id, &mut events).await,
        };

        match inner.on_close(&id, &reason) {
            CloseAction::Gone => return,
            CloseAction::Terminate => {
                inner.terminate(&id).await;
                return;
            }
            CloseAction::Reconnect(delay) => {
                tokio::time::sleep(delay).await;
                if !inner.set_state(&id, SessionState::Connecting) {
                    return;
                }
                match inner.provider.connect(&id).await {
                    Ok(connection) => {
                        let transport = Arc::clone(&connection.transport);
                        if !inner.replace_transport(&id, connection.transport) {
                            if let Err(e) = transport.end().await {
                                warn!(session = %id, error = %e, "failed to end orphaned transport");
                            }
                            return;
                        }
                        events = connection.events;
                    }
                    Err(e) => {
                        warn!(session = %id, error = %e, "reconnect failed");
                        pending = Some(DisconnectReason::message(format!(
                            "reconnect failed: {e}"
                        )));
                    }
                }
            }
        }
    }
}
