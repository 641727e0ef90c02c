//! Campaign registry and the sequential per-campaign send loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::personalize::render_payload;
use super::{
    Campaign, CampaignCounts, CampaignRecipient, CampaignStatus, PersonalizedRecipient,
    RecipientStatus,
};
use crate::error::GatewayError;
use crate::queue::{QueueEngine, SendOptions, SendOutcome};
use crate::store::{Store, StoreError};
use crate::types::{MessagePayload, SessionId};

/// Options for starting a campaign.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOptions {
    /// Pause between recipients; `None` uses the configured default.
    pub delay_between: Option<Duration>,
    /// Send even if an identical message went out within the dedup window.
    pub skip_duplicate_check: bool,
}

/// Returned when a campaign is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignTicket {
    /// Id to poll with [`CampaignOrchestrator::get_campaign`].
    pub campaign_id: String,
    /// Number of recipients queued for the campaign.
    pub total_recipients: usize,
}

struct Inner {
    engine: QueueEngine,
    store: Store,
    default_delay: Duration,
    campaigns: Mutex<HashMap<String, Campaign>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    /// Orders snapshot writes so the newest record always lands last.
    persist_lock: tokio::sync::Mutex<()>,
}

/// Starts, tracks and cancels campaigns.
#[derive(Clone)]
pub struct CampaignOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CampaignOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CampaignOrchestrator")
            .field("default_delay", &self.inner.default_delay)
            .field("campaigns", &self.inner.campaigns().len())
            .finish_non_exhaustive()
    }
}

impl CampaignOrchestrator {
    /// Create an orchestrator sending through `engine`.
    pub fn new(engine: QueueEngine, store: Store, default_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                store,
                default_delay,
                campaigns: Mutex::new(HashMap::new()),
                tasks: Mutex::new(HashMap::new()),
                persist_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Send one message to many recipients in the background.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::Validation`] for an empty recipient list or payload.
    /// - [`GatewayError::NotFound`] when the session is not registered.
    /// - [`GatewayError::Store`] when the initial snapshot cannot be written.
    pub async fn start_bulk(
        &self,
        session: &SessionId,
        recipients: Vec<String>,
        message: MessagePayload,
        options: BulkOptions,
    ) -> Result<CampaignTicket, GatewayError> {
        let recipients = recipients
            .into_iter()
            .map(|recipient| PersonalizedRecipient {
                recipient,
                variables: HashMap::new(),
            })
            .collect();
        self.start(session, recipients, message, false, options).await
    }

    /// Like [`start_bulk`](Self::start_bulk), rendering `{{name}}` tokens in
    /// the message from each recipient's variables.
    ///
    /// # Errors
    ///
    /// Same as [`start_bulk`](Self::start_bulk).
    pub async fn start_personalized_bulk(
        &self,
        session: &SessionId,
        recipients: Vec<PersonalizedRecipient>,
        message: MessagePayload,
        options: BulkOptions,
    ) -> Result<CampaignTicket, GatewayError> {
        self.start(session, recipients, message, true, options).await
    }

    /// Look a campaign up in memory, then on disk.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotFound`] for unknown ids.
    pub async fn get_campaign(&self, id: &str) -> Result<Campaign, GatewayError> {
        let cached = self.inner.campaigns().get(id).cloned();
        if let Some(campaign) = cached {
            return Ok(campaign);
        }
        self.inner
            .store
            .load_campaign(id)
            .await
            .ok_or_else(|| GatewayError::campaign_not_found(id))
    }

    /// Every known campaign for a session, newest first.
    pub async fn list_campaigns(&self, session: &SessionId) -> Vec<Campaign> {
        let mut by_id: HashMap<String, Campaign> = self
            .inner
            .store
            .list_campaigns()
            .await
            .into_iter()
            .filter(|c| &c.session_id == session)
            .map(|c| (c.id.clone(), c))
            .collect();

        // In-memory records are fresher than their snapshots.
        for campaign in self.inner.campaigns().values() {
            if &campaign.session_id == session {
                by_id.insert(campaign.id.clone(), campaign.clone());
            }
        }

        let mut campaigns: Vec<Campaign> = by_id.into_values().collect();
        campaigns.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        campaigns
    }

    /// Mark a campaign cancelled. The running loop stops before its next
    /// recipient; a send already in flight is not interrupted.
    ///
    /// Returns `false` if the campaign already finished.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::NotFound`] for unknown ids.
    /// - [`GatewayError::Store`] when the snapshot cannot be written.
    pub async fn cancel(&self, id: &str) -> Result<bool, GatewayError> {
        let in_memory = self
            .inner
            .campaigns()
            .get_mut(id)
            .map(|campaign| campaign.finish(CampaignStatus::Cancelled));

        match in_memory {
            Some(true) => {
                self.inner.persist(id).await?;
                info!(campaign = %id, "campaign cancelled");
                Ok(true)
            }
            Some(false) => Ok(false),
            None => {
                // A snapshot left in `processing` by a previous run has no loop.
                let mut campaign = self
                    .inner
                    .store
                    .load_campaign(id)
                    .await
                    .ok_or_else(|| GatewayError::campaign_not_found(id))?;
                if !campaign.finish(CampaignStatus::Cancelled) {
                    return Ok(false);
                }
                let _ordered = self.inner.persist_lock.lock().await;
                self.inner.store.save_campaign(&campaign).await?;
                info!(campaign = %id, "orphaned campaign cancelled");
                Ok(true)
            }
        }
    }

    /// Wait for a campaign's background task to finish.
    pub async fn wait(&self, id: &str) {
        let handle = self.inner.tasks().remove(id);
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(campaign = %id, error = %e, "campaign task panicked");
                }
            }
        }
    }

    /// Whether the orchestrator still holds the campaign's record or task.
    /// Finished campaigns are served from their snapshots.
    pub fn is_tracking(&self, id: &str) -> bool {
        self.inner.campaigns().contains_key(id) || self.inner.tasks().contains_key(id)
    }

    /// Abort every running campaign task. Records keep their last snapshot.
    pub fn shutdown(&self) {
        for (id, handle) in self.inner.tasks().drain() {
            debug!(campaign = %id, "aborting campaign task");
            handle.abort();
        }
    }

    async fn start(
        &self,
        session: &SessionId,
        recipients: Vec<PersonalizedRecipient>,
        message: MessagePayload,
        personalized: bool,
        options: BulkOptions,
    ) -> Result<CampaignTicket, GatewayError> {
        if recipients.is_empty() {
            return Err(GatewayError::Validation(
                "campaign needs at least one recipient".to_owned(),
            ));
        }
        message.validate()?;
        if self.inner.engine.sessions().state(session).is_none() {
            return Err(GatewayError::session_not_found(session.as_str()));
        }

        let total = recipients.len();
        let campaign = Campaign {
            id: Uuid::new_v4().to_string(),
            session_id: session.clone(),
            kind: message.kind(),
            message,
            personalized,
            recipients: recipients
                .into_iter()
                .map(|r| CampaignRecipient::pending(r.recipient, r.variables))
                .collect(),
            counts: CampaignCounts {
                total,
                ..CampaignCounts::default()
            },
            status: CampaignStatus::Processing,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        };
        let id = campaign.id.clone();

        self.inner.campaigns().insert(id.clone(), campaign);
        if let Err(e) = self.inner.persist(&id).await {
            self.inner.campaigns().remove(&id);
            return Err(e.into());
        }

        {
            // Held across the spawn so a fast run cannot retire before its handle lands.
            let mut tasks = self.inner.tasks();
            let handle = tokio::spawn(run(Arc::clone(&self.inner), id.clone(), options));
            tasks.insert(id.clone(), handle);
        }
        info!(campaign = %id, %session, total, personalized, "campaign started");

        Ok(CampaignTicket {
            campaign_id: id,
            total_recipients: total,
        })
    }
}

impl Inner {
    fn campaigns(&self) -> MutexGuard<'_, HashMap<String, Campaign>> {
        self.campaigns
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply `f` to a record. `None` if the id is unknown.
    fn update<R>(&self, id: &str, f: impl FnOnce(&mut Campaign) -> R) -> Option<R> {
        self.campaigns().get_mut(id).map(f)
    }

    /// Write the current in-memory record to its snapshot.
    async fn persist(&self, id: &str) -> Result<(), StoreError> {
        let _ordered = self.persist_lock.lock().await;
        let Some(campaign) = self.campaigns().get(id).cloned() else {
            return Ok(());
        };
        self.store.save_campaign(&campaign).await
    }

    /// Drop a finished campaign from memory once its final snapshot is written.
    async fn retire(&self, id: &str) {
        let finished = self
            .campaigns()
            .get(id)
            .filter(|campaign| !campaign.is_processing())
            .cloned();
        if let Some(campaign) = finished {
            let _ordered = self.persist_lock.lock().await;
            match self.store.save_campaign(&campaign).await {
                Ok(()) => {
                    self.campaigns().remove(id);
                }
                Err(e) => {
                    warn!(
                        campaign = %id,
                        error = %e,
                        "final snapshot failed, keeping record in memory"
                    );
                }
            }
        }
        self.tasks().remove(id);
    }
}

/// Background task body: process, mark `failed` if processing aborts, then
/// release the in-memory record.
async fn run(inner: Arc<Inner>, id: String, options: BulkOptions) {
    if let Err(e) = process(&inner, &id, &options).await {
        error!(campaign = %id, error = %e, "campaign aborted");
        let failed = inner
            .update(&id, |campaign| {
                let changed = campaign.finish(CampaignStatus::Failed);
                if changed {
                    campaign.error = Some(e.to_string());
                }
                changed
            })
            .unwrap_or(false);
        if failed {
            if let Err(e) = inner.persist(&id).await {
                warn!(campaign = %id, error = %e, "failed to persist failed campaign");
            }
        }
    }
    inner.retire(&id).await;
}

async fn process(inner: &Inner, id: &str, options: &BulkOptions) -> Result<(), StoreError> {
    let delay = options.delay_between.unwrap_or(inner.default_delay);
    let send_options = SendOptions {
        immediate: true,
        skip_duplicate_check: options.skip_duplicate_check,
        ..SendOptions::default()
    };
    let total = inner.update(id, |c| c.recipients.len()).unwrap_or(0);

    for index in 0..total {
        if index > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let next = inner
            .update(id, |c| {
                c.is_processing().then(|| {
                    let target = &c.recipients[index];
                    (
                        c.session_id.clone(),
                        target.recipient.clone(),
                        render_payload(&c.message, &target.variables),
                    )
                })
            })
            .flatten();
        let Some((session, recipient, payload)) = next else {
            info!(campaign = %id, processed = index, "campaign stopped before completion");
            return Ok(());
        };

        let result = inner
            .engine
            .send(&session, &recipient, payload, &send_options)
            .await;

        let recorded = inner
            .update(id, |c| {
                if !c.is_processing() {
                    return false;
                }
                let target = &mut c.recipients[index];
                target.completed_at = Some(Utc::now());
                match &result {
                    Ok(SendOutcome::Sent(receipt)) => {
                        target.status = RecipientStatus::Success;
                        target.message_id = Some(receipt.message_id.clone());
                        c.counts.success = c.counts.success.saturating_add(1);
                    }
                    Ok(SendOutcome::DuplicateSkipped | SendOutcome::Queued { .. }) => {
                        target.status = RecipientStatus::Success;
                        c.counts.success = c.counts.success.saturating_add(1);
                    }
                    Err(e) => {
                        target.status = RecipientStatus::Failed;
                        target.error = Some(e.to_string());
                        c.counts.failed = c.counts.failed.saturating_add(1);
                    }
                }
                c.counts.processed = c.counts.processed.saturating_add(1);
                true
            })
            .unwrap_or(false);

        if !recorded {
            debug!(campaign = %id, %recipient, "campaign cancelled during send, result dropped");
            return Ok(());
        }
        if let Err(e) = &result {
            warn!(campaign = %id, %recipient, error = %e, "campaign send failed");
        }
        inner.persist(id).await?;
    }

    let completed = inner
        .update(id, |c| c.finish(CampaignStatus::Completed))
        .unwrap_or(false);
    if completed {
        inner.persist(id).await?;
        info!(campaign = %id, total, "campaign completed");
    }
    Ok(())
}
