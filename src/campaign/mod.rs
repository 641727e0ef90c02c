//! Bulk sends with per-recipient progress snapshots.
//!
//! A campaign walks its recipients one at a time through the immediate send
//! path, pausing between recipients so the provider is never burst. Progress
//! is rewritten to the campaign's snapshot after every attempt.

mod orchestrator;
pub mod personalize;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{MessageKind, MessagePayload, SessionId};

pub use orchestrator::{BulkOptions, CampaignOrchestrator, CampaignTicket};

/// Overall campaign status. Only `processing` is mutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    /// Recipients are still being worked through.
    Processing,
    /// Every recipient was attempted.
    Completed,
    /// The loop aborted on an internal error.
    Failed,
    /// Cancelled by the owner.
    Cancelled,
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        })
    }
}

/// Delivery status of one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientStatus {
    /// Not attempted yet.
    Pending,
    /// Sent, or skipped as a duplicate.
    Success,
    /// The send failed.
    Failed,
}

/// One recipient of a campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignRecipient {
    /// Recipient as given by the caller.
    pub recipient: String,
    /// Placeholder values for personalized campaigns.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, String>,
    /// Delivery status.
    pub status: RecipientStatus,
    /// When the attempt finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Provider message id on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CampaignRecipient {
    fn pending(recipient: String, variables: HashMap<String, String>) -> Self {
        Self {
            recipient,
            variables,
            status: RecipientStatus::Pending,
            completed_at: None,
            message_id: None,
            error: None,
        }
    }
}

/// Aggregate progress. `processed == success + failed <= total` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignCounts {
    /// Recipients in the campaign.
    pub total: usize,
    /// Recipients attempted.
    pub processed: usize,
    /// Successful attempts.
    pub success: usize,
    /// Failed attempts.
    pub failed: usize,
}

/// A bulk send and its progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    /// UUID v4.
    pub id: String,
    /// Sending session.
    pub session_id: SessionId,
    /// Message kind.
    pub kind: MessageKind,
    /// Message template; placeholders are rendered per recipient.
    pub message: MessagePayload,
    /// Whether recipients carry placeholder variables.
    pub personalized: bool,
    /// Per-recipient progress, in send order.
    pub recipients: Vec<CampaignRecipient>,
    /// Aggregate progress.
    pub counts: CampaignCounts,
    /// Overall status.
    pub status: CampaignStatus,
    /// When the campaign was accepted.
    pub started_at: DateTime<Utc>,
    /// When the status left `processing`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Reason for a `failed` status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Campaign {
    /// Whether the campaign is still running.
    pub fn is_processing(&self) -> bool {
        self.status == CampaignStatus::Processing
    }

    /// Move out of `processing`. No-op if already finished.
    fn finish(&mut self, status: CampaignStatus) -> bool {
        if !self.is_processing() {
            return false;
        }
        self.status = status;
        self.ended_at = Some(Utc::now());
        true
    }
}

/// A recipient with its placeholder values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonalizedRecipient {
    /// Recipient phone number or chat id.
    pub recipient: String,
    /// Values for `{{name}}` placeholders.
    #[serde(default)]
    pub variables: HashMap<String, String>,
}
