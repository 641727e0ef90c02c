//! Durable per-session outbound queue and send paths.
//!
//! Every session gets one FIFO, created lazily from its snapshot on first use
//! and rewritten to disk after each mutation. A single background loop per
//! queue drains it once the session's transport is open:
//!
//! ```text
//!  send_*() ──▶ dedup check ──▶ enqueue ──▶ [loop] wait_ready ──▶ pop head ──▶ transport.send
//!                                               ▲                                  │
//!                                               └── failed, retries left: push tail┘
//! ```

mod engine;
mod send;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{DeliveryReceipt, MessageKind, MessagePayload, SessionId};

pub use engine::QueueEngine;
pub use send::SendOptions;

/// One pending outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Position assigned at enqueue; strictly increasing per queue.
    pub seq: u64,
    /// Normalized recipient.
    pub recipient: String,
    /// Message content.
    pub payload: MessagePayload,
    /// Retries left after the next failure.
    pub retries_left: u32,
    /// When the item first entered the queue.
    pub enqueued_at: DateTime<Utc>,
}

impl QueueItem {
    /// Build an item; `seq` is assigned when it is enqueued.
    pub fn new(recipient: impl Into<String>, payload: MessagePayload, retries: u32) -> Self {
        Self {
            seq: 0,
            recipient: recipient.into(),
            payload,
            retries_left: retries,
            enqueued_at: Utc::now(),
        }
    }

    /// Kind of the carried message.
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }
}

/// Cumulative counters for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Items accepted by `enqueue` (requeues not counted).
    pub total: u64,
    /// Successful dispatches.
    pub success: u64,
    /// Failed dispatch attempts.
    pub failed: u64,
}

/// On-disk form of a queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Pending items, head first.
    pub items: Vec<QueueItem>,
    /// Cumulative counters.
    pub stats: QueueStats,
    /// Time of the last successful dispatch.
    pub last_processed: Option<DateTime<Utc>>,
    /// Next sequence number to hand out.
    pub next_seq: u64,
}

/// Point-in-time view of a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Owning session.
    pub session_id: SessionId,
    /// Pending items.
    pub items_in_queue: usize,
    /// Whether a processing loop is active.
    pub processing: bool,
    /// Time of the last successful dispatch.
    pub last_processed: Option<DateTime<Utc>>,
    /// Cumulative counters.
    pub stats: QueueStats,
}

/// Result of a send-path call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Delivered immediately, bypassing the queue.
    Sent(DeliveryReceipt),
    /// Appended to the session queue.
    Queued {
        /// Queue length after the append.
        queue_length: usize,
    },
    /// Identical message already sent within the dedup window; nothing done.
    DuplicateSkipped,
}
