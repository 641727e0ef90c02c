//! Snapshot persistence for queues and campaigns.
//!
//! One JSON document per queue (keyed by session id) and per campaign (keyed
//! by campaign id), each rewritten in full on every mutation. There is no log
//! and no cross-file consistency. A file that cannot be read or parsed is
//! reported and treated as absent so the owner reinitializes empty state.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::campaign::Campaign;
use crate::queue::QueueSnapshot;
use crate::types::SessionId;

/// Errors from snapshot persistence.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Snapshot could not be serialized.
    #[error("failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_owned(),
            source,
        }
    }
}

/// Snapshot store rooted at a data directory.
///
/// Created once at startup and shared by the queue engine and the campaign
/// orchestrator. Tests get isolation by opening a fresh store per temp dir.
#[derive(Debug, Clone)]
pub struct Store {
    queues_dir: PathBuf,
    campaigns_dir: PathBuf,
}

impl Store {
    /// Open (creating if needed) `queues/` and `campaigns/` under `data_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if a directory cannot be created.
    pub async fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let queues_dir = data_dir.join("queues");
        let campaigns_dir = data_dir.join("campaigns");
        for dir in [&queues_dir, &campaigns_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| StoreError::io(dir, e))?;
        }
        Ok(Self {
            queues_dir,
            campaigns_dir,
        })
    }

    /// Directory holding queue snapshots.
    pub fn queues_dir(&self) -> &Path {
        &self.queues_dir
    }

    /// Directory holding campaign snapshots.
    pub fn campaigns_dir(&self) -> &Path {
        &self.campaigns_dir
    }

    /// Load the queue snapshot for a session, if one exists and parses.
    pub async fn load_queue(&self, session: &SessionId) -> Option<QueueSnapshot> {
        read_snapshot(&self.queue_path(session)).await
    }

    /// Rewrite the queue snapshot for a session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if serialization or the write fails.
    pub async fn save_queue(
        &self,
        session: &SessionId,
        snapshot: &QueueSnapshot,
    ) -> Result<(), StoreError> {
        write_snapshot(&self.queue_path(session), snapshot).await
    }

    /// Load a campaign snapshot by id.
    ///
    /// Ids that are not plain UUID-style tokens never touch the filesystem.
    pub async fn load_campaign(&self, id: &str) -> Option<Campaign> {
        let path = self.campaign_path(id)?;
        read_snapshot(&path).await
    }

    /// Rewrite a campaign snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if serialization or the write fails.
    pub async fn save_campaign(&self, campaign: &Campaign) -> Result<(), StoreError> {
        let path = self.campaign_path(&campaign.id).ok_or_else(|| {
            StoreError::io(
                &self.campaigns_dir,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("unsafe campaign id: {:?}", campaign.id),
                ),
            )
        })?;
        write_snapshot(&path, campaign).await
    }

    /// Load every readable campaign snapshot.
    pub async fn list_campaigns(&self) -> Vec<Campaign> {
        let mut entries = match tokio::fs::read_dir(&self.campaigns_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.campaigns_dir.display(), error = %e, "cannot list campaigns");
                return Vec::new();
            }
        };

        let mut campaigns = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(campaign) = read_snapshot::<Campaign>(&path).await {
                campaigns.push(campaign);
            }
        }
        campaigns
    }

    fn queue_path(&self, session: &SessionId) -> PathBuf {
        self.queues_dir.join(format!("{session}.json"))
    }

    fn campaign_path(&self, id: &str) -> Option<PathBuf> {
        let safe = !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        safe.then(|| self.campaigns_dir.join(format!("{id}.json")))
    }
}

/// Read and parse a snapshot, treating any failure as "no snapshot".
async fn read_snapshot<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read snapshot, starting empty");
            return None;
        }
    };

    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt snapshot, starting empty");
            None
        }
    }
}

/// Serialize and rewrite a snapshot through a temp file and rename.
async fn write_snapshot<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value)?;

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, &json)
        .await
        .map_err(|e| StoreError::io(&tmp_path, e))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| StoreError::io(path, e))?;

    debug!(path = %path.display(), bytes = json.len(), "snapshot written");
    Ok(())
}
