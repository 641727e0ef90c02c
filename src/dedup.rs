//! Time-windowed duplicate suppression.
//!
//! Keys are `(session, recipient, kind, fingerprint)` tuples. Content longer
//! than the configured prefix is fingerprinted as `prefix…#<char count>`
//! instead of a hash, so two long payloads sharing both prefix and length
//! collide. That is an accepted approximation.
//!
//! Expired entries are not swept on a timer: each [`DedupCache::is_duplicate`]
//! call sweeps with a small probability, which keeps the map bounded by the
//! send rate over one TTL window.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::DedupConfig;
use crate::types::{MessageKind, SessionId};

/// Identity of one send for duplicate detection.
type DedupKey = (SessionId, String, MessageKind, String);

/// Recently sent messages, keyed by fingerprint.
#[derive(Debug)]
pub struct DedupCache {
    entries: Mutex<HashMap<DedupKey, Instant>>,
    ttl: Duration,
    sweep_probability: f64,
    prefix_len: usize,
}

impl DedupCache {
    /// Create a cache from configuration.
    pub fn new(config: &DedupConfig) -> Self {
        Self::with_settings(
            Duration::from_secs(config.ttl_secs),
            config.sweep_probability,
            config.fingerprint_prefix,
        )
    }

    /// Create a cache with explicit settings. Out-of-range probabilities
    /// disable the opportunistic sweep.
    pub fn with_settings(ttl: Duration, sweep_probability: f64, prefix_len: usize) -> Self {
        let sweep_probability = if (0.0..=1.0).contains(&sweep_probability) {
            sweep_probability
        } else {
            0.0
        };
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            sweep_probability,
            prefix_len: prefix_len.max(1),
        }
    }

    /// Fingerprint message content.
    pub fn fingerprint(&self, content: &str) -> String {
        let len = content.chars().count();
        if len <= self.prefix_len {
            return content.to_owned();
        }
        let prefix: String = content.chars().take(self.prefix_len).collect();
        format!("{prefix}…#{len}")
    }

    /// Check-and-set: `true` if an identical message was seen within the TTL.
    ///
    /// A hit leaves the original timestamp untouched, so a steady stream of
    /// duplicates does not extend the window. A miss records the attempt.
    pub fn is_duplicate(
        &self,
        session: &SessionId,
        recipient: &str,
        kind: MessageKind,
        content: &str,
    ) -> bool {
        if self.sweep_probability > 0.0 && rand::thread_rng().gen_bool(self.sweep_probability) {
            self.sweep();
        }

        let key = self.key(session, recipient, kind, content);
        let now = Instant::now();
        let mut entries = self.lock();

        if let Some(seen) = entries.get(&key) {
            if now.saturating_duration_since(*seen) < self.ttl {
                debug!(%session, recipient, %kind, "duplicate message suppressed");
                return true;
            }
        }
        entries.insert(key, now);
        false
    }

    /// Record a send unconditionally, refreshing the timestamp.
    pub fn record(&self, session: &SessionId, recipient: &str, kind: MessageKind, content: &str) {
        let key = self.key(session, recipient, kind, content);
        self.lock().insert(key, Instant::now());
    }

    /// Drop an entry so the same message may be attempted again.
    pub fn forget(&self, session: &SessionId, recipient: &str, kind: MessageKind, content: &str) {
        let key = self.key(session, recipient, kind, content);
        self.lock().remove(&key);
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, seen| now.saturating_duration_since(*seen) < self.ttl);
        let removed = before.saturating_sub(entries.len());
        if removed > 0 {
            trace!(removed, remaining = entries.len(), "dedup sweep");
        }
        removed
    }

    /// Number of tracked entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no entries are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn key(&self, session: &SessionId, recipient: &str, kind: MessageKind, content: &str) -> DedupKey {
        (
            session.clone(),
            recipient.to_owned(),
            kind,
            self.fingerprint(content),
        )
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DedupKey, Instant>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
