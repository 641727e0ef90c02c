//! Queue state, persistence and the per-session processing loop.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{QueueItem, QueueSnapshot, QueueStats, QueueStatus};
use crate::config::QueueConfig;
use crate::dedup::DedupCache;
use crate::error::GatewayError;
use crate::session::SessionManager;
use crate::store::{Store, StoreError};
use crate::types::SessionId;

/// In-memory queue. `processing` is the mutual-exclusion flag: it is only
/// flipped while holding the queue's lock, so at most one loop runs. The flag
/// is published on a watch channel for [`QueueEngine::wait_idle`].
#[derive(Debug)]
struct QueueState {
    items: VecDeque<QueueItem>,
    processing: watch::Sender<bool>,
    in_flight: bool,
    stats: QueueStats,
    last_processed: Option<DateTime<Utc>>,
    next_seq: u64,
}

impl QueueState {
    fn from_snapshot(snapshot: QueueSnapshot) -> Self {
        // Never hand out a sequence number already present in the queue.
        let max_seq = snapshot.items.iter().map(|item| item.seq).max();
        let next_seq = max_seq.map_or(snapshot.next_seq, |max| {
            snapshot.next_seq.max(max.saturating_add(1))
        });
        Self {
            items: snapshot.items.into(),
            processing: watch::channel(false).0,
            in_flight: false,
            stats: snapshot.stats,
            last_processed: snapshot.last_processed,
            next_seq,
        }
    }

    fn is_processing(&self) -> bool {
        *self.processing.borrow()
    }

    fn set_processing(&self, active: bool) {
        self.processing.send_replace(active);
    }

    fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            items: self.items.iter().cloned().collect(),
            stats: self.stats,
            last_processed: self.last_processed,
            next_seq: self.next_seq,
        }
    }
}

type SharedQueue = Arc<tokio::sync::Mutex<QueueState>>;

pub(super) struct EngineInner {
    pub(super) sessions: SessionManager,
    pub(super) dedup: Arc<DedupCache>,
    pub(super) store: Store,
    pub(super) config: QueueConfig,
    queues: Mutex<HashMap<SessionId, SharedQueue>>,
    loops: Mutex<HashMap<SessionId, JoinHandle<()>>>,
    running: AtomicUsize,
}

/// Owns every session's outbound queue and processing loop.
///
/// Cheap to clone; clones share the same queues.
#[derive(Clone)]
pub struct QueueEngine {
    pub(super) inner: Arc<EngineInner>,
}

impl std::fmt::Debug for QueueEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEngine")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl QueueEngine {
    /// Create an engine. Queues load lazily from `store`.
    pub fn new(
        sessions: SessionManager,
        dedup: Arc<DedupCache>,
        store: Store,
        config: QueueConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                sessions,
                dedup,
                store,
                config,
                queues: Mutex::new(HashMap::new()),
                loops: Mutex::new(HashMap::new()),
                running: AtomicUsize::new(0),
            }),
        }
    }

    /// The session manager this engine sends through.
    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    /// The dedup cache guarding the send paths.
    pub fn dedup(&self) -> &DedupCache {
        &self.inner.dedup
    }

    /// Append an item and start the processing loop if none is active.
    ///
    /// Returns the queue length after the append.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Store`] if the snapshot cannot be written; the
    /// item is not queued in that case.
    pub async fn enqueue(&self, session: &SessionId, item: QueueItem) -> Result<usize, GatewayError> {
        self.push(session, item, true).await
    }

    /// Append an item, optionally arming the loop.
    pub(super) async fn push(
        &self,
        session: &SessionId,
        mut item: QueueItem,
        arm: bool,
    ) -> Result<usize, GatewayError> {
        let queue = self.queue(session).await;
        let mut state = queue.lock().await;

        item.seq = state.next_seq;
        state.next_seq = state.next_seq.saturating_add(1);
        state.stats.total = state.stats.total.saturating_add(1);
        debug!(%session, seq = item.seq, kind = %item.kind(), "enqueueing message");
        state.items.push_back(item);

        if let Err(e) = self.inner.store.save_queue(session, &state.snapshot()).await {
            state.items.pop_back();
            state.next_seq = state.next_seq.saturating_sub(1);
            state.stats.total = state.stats.total.saturating_sub(1);
            return Err(e.into());
        }

        let length = state.items.len();
        if arm {
            self.arm(session, &queue, &mut state);
        }
        Ok(length)
    }

    /// Current queue state.
    pub async fn status(&self, session: &SessionId) -> QueueStatus {
        let queue = self.queue(session).await;
        let state = queue.lock().await;
        QueueStatus {
            session_id: session.clone(),
            items_in_queue: state.items.len(),
            processing: state.is_processing(),
            last_processed: state.last_processed,
            stats: state.stats,
        }
    }

    /// Pending items, head first.
    pub async fn items(&self, session: &SessionId) -> Vec<QueueItem> {
        let queue = self.queue(session).await;
        let state = queue.lock().await;
        state.items.iter().cloned().collect()
    }

    /// Discard every pending item. Returns how many were removed.
    ///
    /// An active loop notices the empty queue on its next tick and stops.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Store`] if the snapshot cannot be written.
    pub async fn clear(&self, session: &SessionId) -> Result<usize, GatewayError> {
        let queue = self.queue(session).await;
        let mut state = queue.lock().await;
        let removed = state.items.len();
        state.items.clear();
        self.inner.store.save_queue(session, &state.snapshot()).await?;
        info!(%session, removed, "queue cleared");
        Ok(removed)
    }

    /// Start the loop if the queue has items and no loop is active.
    ///
    /// Returns `true` if a loop was started.
    pub async fn start_processing_if_idle(&self, session: &SessionId) -> bool {
        let queue = self.queue(session).await;
        let mut state = queue.lock().await;
        self.arm(session, &queue, &mut state)
    }

    /// Stop an active loop if the queue is empty and nothing is in flight.
    ///
    /// Returns `true` if a loop was stopped.
    pub async fn stop_if_empty(&self, session: &SessionId) -> bool {
        let queue = self.queue(session).await;
        let state = queue.lock().await;
        if !state.is_processing() || !state.items.is_empty() || state.in_flight {
            return false;
        }
        if let Some(handle) = self.loops().remove(session) {
            handle.abort();
        }
        state.set_processing(false);
        debug!(%session, "idle queue loop stopped");
        true
    }

    /// Wait until the session's queue has no active loop.
    ///
    /// The loop handle stays registered while waiting, so a concurrent
    /// [`stop_if_empty`](Self::stop_if_empty) can still abort it.
    pub async fn wait_idle(&self, session: &SessionId) {
        let queue = self.queue(session).await;
        let mut idle = queue.lock().await.processing.subscribe();
        if idle.wait_for(|active| !*active).await.is_err() {
            warn!(%session, "queue dropped while waiting for idle");
        }
    }

    /// Number of processing loops currently alive, across all sessions.
    pub fn running_loops(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Abort every loop. Items stay in their snapshots for the next start.
    pub async fn shutdown(&self) {
        let handles: Vec<(SessionId, JoinHandle<()>)> = self.loops().drain().collect();
        for (session, handle) in handles {
            handle.abort();
            let queue = self.queue(&session).await;
            queue.lock().await.set_processing(false);
        }
    }

    /// Set the flag and spawn the loop. Caller holds the queue lock.
    fn arm(&self, session: &SessionId, queue: &SharedQueue, state: &mut QueueState) -> bool {
        if state.is_processing() || state.items.is_empty() {
            return false;
        }
        state.set_processing(true);
        let slot = LoopSlot::claim(&self.inner);
        let handle = tokio::spawn(run_loop(slot, session.clone(), Arc::clone(queue)));
        self.loops().insert(session.clone(), handle);
        debug!(%session, "queue loop started");
        true
    }

    /// Get or lazily load a session's queue.
    async fn queue(&self, session: &SessionId) -> SharedQueue {
        let loaded = self.queues().get(session).cloned();
        if let Some(queue) = loaded {
            return queue;
        }

        let state = match self.inner.store.load_queue(session).await {
            Some(snapshot) => {
                debug!(%session, items = snapshot.items.len(), "queue restored from snapshot");
                QueueState::from_snapshot(snapshot)
            }
            None => QueueState::from_snapshot(QueueSnapshot::default()),
        };

        let mut queues = self.queues();
        Arc::clone(
            queues
                .entry(session.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(state))),
        )
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<SessionId, SharedQueue>> {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn loops(&self) -> MutexGuard<'_, HashMap<SessionId, JoinHandle<()>>> {
        self.inner
            .loops
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn persist(store: &Store, session: &SessionId, state: &QueueState) {
    if let Err(e) = store.save_queue(session, &state.snapshot()).await {
        log_persist_failure(session, &e);
    }
}

fn log_persist_failure(session: &SessionId, error: &StoreError) {
    warn!(%session, error = %error, "failed to persist queue snapshot");
}

/// Counts one live loop in `EngineInner::running` until dropped, which
/// also covers loops aborted before their first poll.
struct LoopSlot(Arc<EngineInner>);

impl LoopSlot {
    fn claim(inner: &Arc<EngineInner>) -> Self {
        inner.running.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(inner))
    }
}

impl Drop for LoopSlot {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Drain one session's queue. Exits when the queue is empty or the session
/// is gone; while the session is not open it parks instead of polling.
async fn run_loop(slot: LoopSlot, session: SessionId, queue: SharedQueue) {
    let inner = &slot.0;
    let mut ticker = tokio::time::interval(inner.config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        {
            let state = queue.lock().await;
            if state.items.is_empty() {
                state.set_processing(false);
                debug!(%session, "queue drained, loop stopping");
                return;
            }
        }

        let Some(transport) = inner.sessions.wait_ready(&session).await else {
            queue.lock().await.set_processing(false);
            info!(%session, "session unavailable, queue loop idle until re-armed");
            return;
        };

        let item = {
            let mut state = queue.lock().await;
            match state.items.pop_front() {
                Some(item) => {
                    state.in_flight = true;
                    item
                }
                None => {
                    state.set_processing(false);
                    return;
                }
            }
        };

        let result = transport.send(&item.recipient, &item.payload).await;

        let mut state = queue.lock().await;
        state.in_flight = false;
        match result {
            Ok(receipt) => {
                state.stats.success = state.stats.success.saturating_add(1);
                state.last_processed = Some(Utc::now());
                inner.dedup.record(
                    &session,
                    &item.recipient,
                    item.kind(),
                    &item.payload.dedup_content(),
                );
                debug!(
                    %session,
                    seq = item.seq,
                    message_id = %receipt.message_id,
                    "queued message delivered"
                );
            }
            Err(e) => {
                state.stats.failed = state.stats.failed.saturating_add(1);
                if item.retries_left > 0 {
                    let mut retry = item;
                    retry.retries_left = retry.retries_left.saturating_sub(1);
                    warn!(
                        %session,
                        seq = retry.seq,
                        retries_left = retry.retries_left,
                        error = %e,
                        "send failed, requeued at tail"
                    );
                    state.items.push_back(retry);
                } else {
                    warn!(%session, seq = item.seq, error = %e, "send failed, retries exhausted");
                }
            }
        }
        persist(&inner.store, &session, &state).await;

        if state.items.is_empty() {
            state.set_processing(false);
            debug!(%session, "queue drained, loop stopping");
            return;
        }
    }
}
