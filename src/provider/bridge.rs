//! HTTP client and provider for the chat bridge sidecar.
//!
//! The sidecar hosts one protocol connection per session and exposes it over
//! a small JSON API under `/sessions/{id}/...`. Every response uses the same
//! `{ success, data, error }` envelope.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::events::spawn_event_listener;
use super::{Connection, ConnectionProvider, ProviderError, Transport};
use crate::config::BridgeConfig;
use crate::types::{DeliveryReceipt, MessagePayload, SessionId};

/// Response envelope from the bridge HTTP API.
#[derive(Deserialize)]
struct BridgeResponse<T> {
    #[serde(default)]
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

/// Payload of a successful send.
#[derive(Debug, Deserialize)]
struct SendAck {
    message_id: String,
}

/// Client for the bridge HTTP API.
#[derive(Debug, Clone)]
pub struct BridgeClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl BridgeClient {
    /// Create a client for the given bridge configuration.
    ///
    /// `token`, when present, is sent as a bearer token on every request.
    pub fn new(config: &BridgeConfig, token: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeouts, using default");
                reqwest::Client::default()
            });
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            token,
        }
    }

    /// Returns the base URL of the bridge.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL of a per-session endpoint.
    pub fn session_url(&self, session: &SessionId, path: &str) -> String {
        format!("{}/sessions/{session}/{path}", self.base_url)
    }

    /// Attach the bearer token, if any.
    pub(crate) fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Ask the bridge to open (or resume) a session's connection.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the request fails or the bridge refuses.
    pub async fn connect_session(&self, session: &SessionId) -> Result<(), ProviderError> {
        let url = self.session_url(session, "connect");
        self.post_unit(&url, &serde_json::json!({})).await?;
        debug!(%session, "bridge connect requested");
        Ok(())
    }

    /// Send a message through a session.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on HTTP failure or a bridge-side rejection.
    pub async fn send(
        &self,
        session: &SessionId,
        recipient: &str,
        payload: &MessagePayload,
    ) -> Result<DeliveryReceipt, ProviderError> {
        let url = self.session_url(session, "send");
        let body = serde_json::json!({ "to": recipient, "message": payload });
        let ack: SendAck = self.post(&url, &body).await?;
        debug!(%session, recipient, kind = %payload.kind(), "message sent via bridge");
        Ok(DeliveryReceipt {
            message_id: ack.message_id,
            recipient: recipient.to_owned(),
            sent_at: Utc::now(),
        })
    }

    /// Log the session out on the chat network.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on HTTP failure or a bridge-side rejection.
    pub async fn logout(&self, session: &SessionId) -> Result<(), ProviderError> {
        let url = self.session_url(session, "logout");
        self.post_unit(&url, &serde_json::json!({})).await
    }

    /// Close the session's connection, keeping its auth material.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on HTTP failure or a bridge-side rejection.
    pub async fn end(&self, session: &SessionId) -> Result<(), ProviderError> {
        let url = self.session_url(session, "end");
        self.post_unit(&url, &serde_json::json!({})).await
    }

    /// Erase the session's stored auth material.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on HTTP failure or a bridge-side rejection.
    pub async fn remove_auth(&self, session: &SessionId) -> Result<(), ProviderError> {
        let url = self.session_url(session, "auth");
        let resp = self.authorize(self.client.delete(&url)).send().await?;
        Self::unwrap_unit(resp).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<T, ProviderError> {
        let resp = self.authorize(self.client.post(url)).json(body).send().await?;
        let status = resp.status();
        let envelope: BridgeResponse<T> = resp.json().await?;
        if !status.is_success() || !envelope.success {
            return Err(ProviderError::Bridge(
                envelope
                    .error
                    .unwrap_or_else(|| format!("bridge returned {status}")),
            ));
        }
        envelope
            .data
            .ok_or_else(|| ProviderError::Bridge("bridge response missing data".to_owned()))
    }

    async fn post_unit(&self, url: &str, body: &serde_json::Value) -> Result<(), ProviderError> {
        let resp = self.authorize(self.client.post(url)).json(body).send().await?;
        Self::unwrap_unit(resp).await
    }

    async fn unwrap_unit(resp: reqwest::Response) -> Result<(), ProviderError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body_text = resp.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<BridgeResponse<serde_json::Value>>(&body_text)
            .ok()
            .and_then(|envelope| envelope.error)
            .unwrap_or_else(|| format!("bridge returned {status}"));
        warn!(%status, "bridge request failed: {detail}");
        Err(ProviderError::Bridge(detail))
    }
}

/// Transport for one session on the bridge.
struct BridgeTransport {
    client: Arc<BridgeClient>,
    session: SessionId,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeTransport {
    fn stop_listener(&self) {
        let handle = match self.listener.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn send(
        &self,
        recipient: &str,
        payload: &MessagePayload,
    ) -> Result<DeliveryReceipt, ProviderError> {
        self.client.send(&self.session, recipient, payload).await
    }

    async fn logout(&self) -> Result<(), ProviderError> {
        self.client.logout(&self.session).await
    }

    async fn end(&self) -> Result<(), ProviderError> {
        self.stop_listener();
        self.client.end(&self.session).await
    }
}

impl Drop for BridgeTransport {
    fn drop(&mut self) {
        self.stop_listener();
    }
}

/// [`ConnectionProvider`] backed by the bridge sidecar.
#[derive(Debug, Clone)]
pub struct BridgeProvider {
    client: Arc<BridgeClient>,
    channel_buffer: usize,
    poll_timeout: Duration,
}

impl BridgeProvider {
    /// Create a provider from configuration and an optional API token.
    pub fn new(config: &BridgeConfig, token: Option<String>) -> Self {
        Self {
            client: Arc::new(BridgeClient::new(config, token)),
            channel_buffer: config.channel_buffer.max(1),
            poll_timeout: Duration::from_secs(config.poll_timeout_secs),
        }
    }

    /// The underlying HTTP client.
    pub fn client(&self) -> &BridgeClient {
        &self.client
    }
}

#[async_trait]
impl ConnectionProvider for BridgeProvider {
    async fn connect(&self, session: &SessionId) -> Result<Connection, ProviderError> {
        self.client.connect_session(session).await?;

        let (tx, rx) = mpsc::channel(self.channel_buffer);
        let listener = spawn_event_listener(
            Arc::clone(&self.client),
            session.clone(),
            tx,
            self.poll_timeout,
        );
        info!(%session, base_url = self.client.base_url(), "bridge session connecting");

        let transport = BridgeTransport {
            client: Arc::clone(&self.client),
            session: session.clone(),
            listener: Mutex::new(Some(listener)),
        };
        Ok(Connection {
            transport: Arc::new(transport),
            events: rx,
        })
    }

    async fn remove_auth(&self, session: &SessionId) -> Result<(), ProviderError> {
        self.client.remove_auth(session).await
    }
}
