//! Scripted connection provider and helpers shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;

use courier::config::Config;
use courier::provider::{
    Connection, ConnectionProvider, LifecycleEvent, ProviderError, Transport,
};
use courier::session::{SessionManager, SessionState};
use courier::types::{DeliveryReceipt, MessagePayload, SessionId};
use courier::Gateway;

#[derive(Default)]
struct MockState {
    on_connect: Mutex<Vec<LifecycleEvent>>,
    senders: Mutex<HashMap<SessionId, mpsc::Sender<LifecycleEvent>>>,
    connects: Mutex<Vec<Instant>>,
    fail_connect: AtomicBool,
    fail_recipients: Mutex<HashSet<String>>,
    attempts: Mutex<Vec<String>>,
    sent: Mutex<Vec<(String, MessagePayload)>>,
    auth_removed: Mutex<Vec<SessionId>>,
    logouts: AtomicUsize,
    ends: AtomicUsize,
}

/// Provider whose connections are driven by the test.
#[derive(Clone, Default)]
pub struct MockProvider {
    state: Arc<MockState>,
}

impl MockProvider {
    /// Connections stay in `connecting` until the test emits events.
    pub fn manual() -> Self {
        Self::default()
    }

    /// Every connection opens immediately.
    pub fn auto_open() -> Self {
        Self::scripted(vec![LifecycleEvent::Open])
    }

    /// Every connection receives `events` as soon as it is created.
    pub fn scripted(events: Vec<LifecycleEvent>) -> Self {
        let provider = Self::default();
        *provider.state.on_connect.lock().expect("test lock") = events;
        provider
    }

    /// Make the next `connect` calls fail.
    pub fn set_fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Sends to `recipient` (normalized form) fail from now on.
    pub fn fail_recipient(&self, recipient: &str) {
        self.state
            .fail_recipients
            .lock()
            .expect("test lock")
            .insert(recipient.to_owned());
    }

    /// Push an event on the session's latest connection.
    pub async fn emit(&self, session: &SessionId, event: LifecycleEvent) {
        let sender = self.state.senders.lock().expect("test lock").get(session).cloned();
        let sender = sender.expect("session should have a live connection");
        sender.send(event).await.expect("driver should be listening");
    }

    /// Close the session's current event stream without a close event.
    pub fn drop_events(&self, session: &SessionId) {
        self.state.senders.lock().expect("test lock").remove(session);
    }

    /// Times of every `connect` call, oldest first.
    pub fn connect_times(&self) -> Vec<Instant> {
        self.state.connects.lock().expect("test lock").clone()
    }

    /// Number of `connect` calls so far.
    pub fn connect_count(&self) -> usize {
        self.state.connects.lock().expect("test lock").len()
    }

    /// Recipients of every send attempt, failures included.
    pub fn attempts(&self) -> Vec<String> {
        self.state.attempts.lock().expect("test lock").clone()
    }

    /// Successful sends.
    pub fn sent(&self) -> Vec<(String, MessagePayload)> {
        self.state.sent.lock().expect("test lock").clone()
    }

    /// Sessions whose auth material was erased.
    pub fn auth_removed(&self) -> Vec<SessionId> {
        self.state.auth_removed.lock().expect("test lock").clone()
    }

    /// Number of logout calls.
    pub fn logouts(&self) -> usize {
        self.state.logouts.load(Ordering::SeqCst)
    }

    /// Number of end calls.
    pub fn ends(&self) -> usize {
        self.state.ends.load(Ordering::SeqCst)
    }
}

struct MockTransport {
    state: Arc<MockState>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        recipient: &str,
        payload: &MessagePayload,
    ) -> Result<DeliveryReceipt, ProviderError> {
        self.state.attempts.lock().expect("test lock").push(recipient.to_owned());
        if self.state.fail_recipients.lock().expect("test lock").contains(recipient) {
            return Err(ProviderError::Bridge("scripted failure".to_owned()));
        }
        let mut sent = self.state.sent.lock().expect("test lock");
        sent.push((recipient.to_owned(), payload.clone()));
        Ok(DeliveryReceipt {
            message_id: format!("msg-{}", sent.len()),
            recipient: recipient.to_owned(),
            sent_at: Utc::now(),
        })
    }

    async fn logout(&self) -> Result<(), ProviderError> {
        self.state.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn end(&self) -> Result<(), ProviderError> {
        self.state.ends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ConnectionProvider for MockProvider {
    async fn connect(&self, session: &SessionId) -> Result<Connection, ProviderError> {
        self.state.connects.lock().expect("test lock").push(Instant::now());
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(ProviderError::Bridge("connect refused".to_owned()));
        }

        let (tx, rx) = mpsc::channel(16);
        for event in self.state.on_connect.lock().expect("test lock").iter() {
            tx.try_send(event.clone()).expect("buffer should hold scripted events");
        }
        self.state
            .senders
            .lock()
            .expect("test lock")
            .insert(session.clone(), tx);

        Ok(Connection {
            transport: Arc::new(MockTransport {
                state: Arc::clone(&self.state),
            }),
            events: rx,
        })
    }

    async fn remove_auth(&self, session: &SessionId) -> Result<(), ProviderError> {
        self.state
            .auth_removed
            .lock()
            .expect("test lock")
            .push(session.clone());
        Ok(())
    }
}

/// Parse a session id known to be valid.
pub fn sid(raw: &str) -> SessionId {
    SessionId::parse(raw).expect("test session id should be valid")
}

/// Config tuned for fast tests: 10 ms queue ticks, no campaign delay.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.queue.poll_interval_ms = 10;
    config.campaign.delay_between_ms = 0;
    config.dedup.sweep_probability = 0.0;
    config
}

/// Build a gateway over `dir` with the given provider.
pub async fn gateway(dir: &Path, provider: &MockProvider) -> Gateway {
    Gateway::open(&fast_config(), dir, Arc::new(provider.clone()))
        .await
        .expect("gateway should open")
}

/// Wait until the session reaches `state`.
pub async fn wait_for_state(manager: &SessionManager, id: &SessionId, state: SessionState) {
    let reached = tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            if manager.state(id) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "session {id} never reached {state}");
}

/// Wait until the session is no longer registered.
pub async fn wait_for_removal(manager: &SessionManager, id: &SessionId) {
    let removed = tokio::time::timeout(Duration::from_secs(120), async {
        while manager.state(id).is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(removed.is_ok(), "session {id} was never removed");
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let held = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(held.is_ok(), "condition never held");
}
