//! Send-path entry points shared by API callers and campaigns.

use std::time::Duration;

use tracing::{debug, warn};

use super::{QueueEngine, QueueItem, SendOutcome};
use crate::error::GatewayError;
use crate::provider::ProviderError;
use crate::types::{normalize_recipient, DeliveryReceipt, MessagePayload, SessionId};

/// First delay of the immediate-send retry wrapper; doubles per retry.
const IMMEDIATE_RETRY_BASE: Duration = Duration::from_secs(1);

/// Per-call send options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Skip the dedup check for this call.
    pub skip_duplicate_check: bool,
    /// Bypass the queue and send through the open transport now.
    pub immediate: bool,
    /// Enqueue without starting the processing loop.
    pub queue_only: bool,
    /// Sleep this long after the call returns a result.
    pub delay_after: Option<Duration>,
    /// Retries for immediate sends, or for the queued item when set.
    /// `None` uses the queue's configured default.
    pub retries: Option<u32>,
}

impl SendOptions {
    /// Options for a direct, unqueued send.
    pub fn immediate() -> Self {
        Self {
            immediate: true,
            ..Self::default()
        }
    }
}

impl QueueEngine {
    /// Send a payload to a recipient on a session.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::Validation`] for an empty payload or unusable recipient.
    /// - [`GatewayError::NotFound`] when the session is not registered.
    /// - [`GatewayError::Transport`] when an immediate send fails after its retries.
    /// - [`GatewayError::Store`] when the queue snapshot cannot be written.
    pub async fn send(
        &self,
        session: &SessionId,
        recipient: &str,
        payload: MessagePayload,
        options: &SendOptions,
    ) -> Result<SendOutcome, GatewayError> {
        payload.validate()?;
        let kind = payload.kind();
        let recipient = normalize_recipient(recipient, kind)?;
        if self.sessions().state(session).is_none() {
            return Err(GatewayError::session_not_found(session.as_str()));
        }

        let content = payload.dedup_content();
        if !options.skip_duplicate_check
            && self.dedup().is_duplicate(session, &recipient, kind, &content)
        {
            return Ok(SendOutcome::DuplicateSkipped);
        }

        let outcome = if options.immediate {
            let retries = options.retries.unwrap_or(0);
            match self.deliver_now(session, &recipient, &payload, retries).await {
                Ok(receipt) => {
                    self.dedup().record(session, &recipient, kind, &content);
                    SendOutcome::Sent(receipt)
                }
                Err(e) => {
                    // Nothing went out, so a later attempt must not be suppressed.
                    self.dedup().forget(session, &recipient, kind, &content);
                    return Err(e);
                }
            }
        } else {
            let retries = options.retries.unwrap_or(self.inner.config.max_retries);
            let item = QueueItem::new(recipient.clone(), payload, retries);
            match self.push(session, item, !options.queue_only).await {
                Ok(queue_length) => SendOutcome::Queued { queue_length },
                Err(e) => {
                    self.dedup().forget(session, &recipient, kind, &content);
                    return Err(e);
                }
            }
        };

        if let Some(delay) = options.delay_after.filter(|d| !d.is_zero()) {
            tokio::time::sleep(delay).await;
        }
        Ok(outcome)
    }

    /// Send a text message.
    ///
    /// # Errors
    ///
    /// See [`QueueEngine::send`].
    pub async fn send_text(
        &self,
        session: &SessionId,
        recipient: &str,
        text: impl Into<String>,
        options: &SendOptions,
    ) -> Result<SendOutcome, GatewayError> {
        let payload = MessagePayload::Text { text: text.into() };
        self.send(session, recipient, payload, options).await
    }

    /// Send an image by URL.
    ///
    /// # Errors
    ///
    /// See [`QueueEngine::send`].
    pub async fn send_image(
        &self,
        session: &SessionId,
        recipient: &str,
        url: impl Into<String>,
        caption: Option<String>,
        options: &SendOptions,
    ) -> Result<SendOutcome, GatewayError> {
        let payload = MessagePayload::Image {
            url: url.into(),
            caption,
        };
        self.send(session, recipient, payload, options).await
    }

    /// Send a document by URL.
    ///
    /// # Errors
    ///
    /// See [`QueueEngine::send`].
    #[allow(clippy::too_many_arguments)]
    pub async fn send_document(
        &self,
        session: &SessionId,
        recipient: &str,
        url: impl Into<String>,
        file_name: impl Into<String>,
        mimetype: Option<String>,
        caption: Option<String>,
        options: &SendOptions,
    ) -> Result<SendOutcome, GatewayError> {
        let payload = MessagePayload::Document {
            url: url.into(),
            file_name: file_name.into(),
            mimetype,
            caption,
        };
        self.send(session, recipient, payload, options).await
    }

    /// Send an audio clip or voice note by URL.
    ///
    /// # Errors
    ///
    /// See [`QueueEngine::send`].
    pub async fn send_audio(
        &self,
        session: &SessionId,
        recipient: &str,
        url: impl Into<String>,
        voice_note: bool,
        options: &SendOptions,
    ) -> Result<SendOutcome, GatewayError> {
        let payload = MessagePayload::Audio {
            url: url.into(),
            voice_note,
        };
        self.send(session, recipient, payload, options).await
    }

    /// Send a location pin.
    ///
    /// # Errors
    ///
    /// See [`QueueEngine::send`].
    #[allow(clippy::too_many_arguments)]
    pub async fn send_location(
        &self,
        session: &SessionId,
        recipient: &str,
        latitude: f64,
        longitude: f64,
        name: Option<String>,
        address: Option<String>,
        options: &SendOptions,
    ) -> Result<SendOutcome, GatewayError> {
        let payload = MessagePayload::Location {
            latitude,
            longitude,
            name,
            address,
        };
        self.send(session, recipient, payload, options).await
    }

    /// Send a text message to a group.
    ///
    /// # Errors
    ///
    /// See [`QueueEngine::send`].
    pub async fn send_group_message(
        &self,
        session: &SessionId,
        group: &str,
        text: impl Into<String>,
        options: &SendOptions,
    ) -> Result<SendOutcome, GatewayError> {
        let payload = MessagePayload::GroupMessage { text: text.into() };
        self.send(session, group, payload, options).await
    }

    /// Send through the open transport, retrying with exponential delay.
    async fn deliver_now(
        &self,
        session: &SessionId,
        recipient: &str,
        payload: &MessagePayload,
        retries: u32,
    ) -> Result<DeliveryReceipt, GatewayError> {
        let mut attempt: u32 = 0;
        loop {
            let result = match self.sessions().get_if_ready(session) {
                Some(transport) => transport.send(recipient, payload).await,
                None => Err(ProviderError::NotConnected),
            };
            match result {
                Ok(receipt) => {
                    debug!(%session, recipient, message_id = %receipt.message_id, "sent immediately");
                    return Ok(receipt);
                }
                Err(e) if attempt < retries => {
                    let delay = IMMEDIATE_RETRY_BASE
                        .saturating_mul(2u32.saturating_pow(attempt.min(16)));
                    attempt = attempt.saturating_add(1);
                    warn!(
                        %session,
                        recipient,
                        attempt,
                        error = %e,
                        "immediate send failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
