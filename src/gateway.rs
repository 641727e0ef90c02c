//! Process-lifetime wiring of the gateway components.
//!
//! One [`Store`] is opened at startup and handed to the queue engine and the
//! campaign orchestrator. Tests build a fresh `Gateway` over a temp dir and a
//! mock provider.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::campaign::CampaignOrchestrator;
use crate::config::{Config, SessionConfig};
use crate::dedup::DedupCache;
use crate::error::GatewayError;
use crate::provider::ConnectionProvider;
use crate::queue::QueueEngine;
use crate::session::SessionManager;
use crate::store::Store;
use crate::types::SessionId;

/// The assembled gateway: sessions, dedup, queues and campaigns.
#[derive(Debug, Clone)]
pub struct Gateway {
    store: Store,
    sessions: SessionManager,
    dedup: Arc<DedupCache>,
    queue: QueueEngine,
    campaigns: CampaignOrchestrator,
}

impl Gateway {
    /// Open the store under `data_dir` and build every component.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Store`] if the data directories cannot be created.
    pub async fn open(
        config: &Config,
        data_dir: &Path,
        provider: Arc<dyn ConnectionProvider>,
    ) -> Result<Self, GatewayError> {
        let store = Store::open(data_dir).await?;
        let sessions = SessionManager::new(provider, config.reconnect.clone());
        let dedup = Arc::new(DedupCache::new(&config.dedup));
        let queue = QueueEngine::new(
            sessions.clone(),
            Arc::clone(&dedup),
            store.clone(),
            config.queue.clone(),
        );
        let campaigns = CampaignOrchestrator::new(
            queue.clone(),
            store.clone(),
            config.campaign.delay_between(),
        );

        Ok(Self {
            store,
            sessions,
            dedup,
            queue,
            campaigns,
        })
    }

    /// Snapshot store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Session lifecycle manager.
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Duplicate-suppression cache.
    pub fn dedup(&self) -> &DedupCache {
        &self.dedup
    }

    /// Queue engine and send paths.
    pub fn queue(&self) -> &QueueEngine {
        &self.queue
    }

    /// Campaign orchestrator.
    pub fn campaigns(&self) -> &CampaignOrchestrator {
        &self.campaigns
    }

    /// Connect a session and re-arm any items left in its queue snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the provider refuses the connection.
    pub async fn connect(&self, id: &SessionId) -> Result<(), GatewayError> {
        self.sessions.connect(id).await?;
        if self.queue.start_processing_if_idle(id).await {
            let status = self.queue.status(id).await;
            info!(session = %id, pending = status.items_in_queue, "resumed persisted queue");
        }
        Ok(())
    }

    /// Connect every `autostart` session. Failures are logged and skipped.
    ///
    /// Returns the number of sessions connected.
    pub async fn start_sessions(&self, sessions: &[SessionConfig]) -> usize {
        let mut connected: usize = 0;
        for entry in sessions.iter().filter(|s| s.autostart) {
            let id = match SessionId::parse(&entry.id) {
                Ok(id) => id,
                Err(e) => {
                    warn!(session = %entry.id, error = %e, "skipping invalid session");
                    continue;
                }
            };
            match self.connect(&id).await {
                Ok(()) => connected = connected.saturating_add(1),
                Err(e) => warn!(session = %id, error = %e, "failed to connect session"),
            }
        }
        connected
    }

    /// Log a session out. Its queue loop notices and goes idle; pending items
    /// stay in the snapshot.
    pub async fn disconnect(&self, id: &SessionId) -> bool {
        self.sessions.disconnect(id).await
    }

    /// Stop campaigns and queue loops, then end every connection without
    /// logging out.
    pub async fn shutdown(&self) {
        self.campaigns.shutdown();
        self.queue.shutdown().await;
        self.sessions.shutdown().await;
        info!("gateway stopped");
    }
}
