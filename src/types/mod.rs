//! Core value types shared across the gateway: session identity, message
//! kinds and payloads, and recipient normalization.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Maximum length of a session identifier.
const MAX_SESSION_ID_LEN: usize = 64;

/// Suffix for individual (user) chat identifiers.
pub const USER_SUFFIX: &str = "@s.whatsapp.net";

/// Suffix for group chat identifiers.
pub const GROUP_SUFFIX: &str = "@g.us";

/// Validated tenant identifier: ASCII alphanumerics and underscore only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Validate and wrap a raw session identifier.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Validation`] when the id is empty, too long, or
    /// contains anything other than `[A-Za-z0-9_]`.
    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        if raw.is_empty() || raw.len() > MAX_SESSION_ID_LEN {
            return Err(GatewayError::Validation(format!(
                "session id must be 1..={MAX_SESSION_ID_LEN} characters"
            )));
        }
        if !raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(GatewayError::Validation(format!(
                "session id may only contain letters, digits and underscore: {raw:?}"
            )));
        }
        Ok(Self(raw.to_owned()))
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = GatewayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

/// Kind of outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Plain text.
    Text,
    /// Image by URL with optional caption.
    Image,
    /// Arbitrary file by URL.
    Document,
    /// Audio clip or voice note.
    Audio,
    /// Geographic pin.
    Location,
    /// Text addressed to a group chat.
    GroupMessage,
}

impl MessageKind {
    /// Stable lowercase name, used in dedup keys and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Document => "document",
            Self::Audio => "audio",
            Self::Location => "location",
            Self::GroupMessage => "group_message",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePayload {
    /// Plain text message.
    Text {
        /// Message body.
        text: String,
    },
    /// Image message.
    Image {
        /// Where the provider fetches the image from.
        url: String,
        /// Optional caption.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    /// Document message.
    Document {
        /// Where the provider fetches the file from.
        url: String,
        /// File name shown to the recipient.
        file_name: String,
        /// MIME type, if known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mimetype: Option<String>,
        /// Optional caption.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    /// Audio message.
    Audio {
        /// Where the provider fetches the audio from.
        url: String,
        /// Send as a push-to-talk voice note.
        #[serde(default)]
        voice_note: bool,
    },
    /// Location pin.
    Location {
        /// Latitude in degrees.
        latitude: f64,
        /// Longitude in degrees.
        longitude: f64,
        /// Place name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// Street address.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
    /// Text message to a group.
    GroupMessage {
        /// Message body.
        text: String,
    },
}

impl MessagePayload {
    /// The [`MessageKind`] this payload belongs to.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text { .. } => MessageKind::Text,
            Self::Image { .. } => MessageKind::Image,
            Self::Document { .. } => MessageKind::Document,
            Self::Audio { .. } => MessageKind::Audio,
            Self::Location { .. } => MessageKind::Location,
            Self::GroupMessage { .. } => MessageKind::GroupMessage,
        }
    }

    /// Content string used for duplicate fingerprinting.
    pub fn dedup_content(&self) -> String {
        match self {
            Self::Text { text } | Self::GroupMessage { text } => text.clone(),
            Self::Image { url, caption } => {
                format!("{url}|{}", caption.as_deref().unwrap_or_default())
            }
            Self::Document {
                url,
                file_name,
                caption,
                ..
            } => format!(
                "{url}|{file_name}|{}",
                caption.as_deref().unwrap_or_default()
            ),
            Self::Audio { url, voice_note } => format!("{url}|{voice_note}"),
            Self::Location {
                latitude,
                longitude,
                ..
            } => format!("{latitude},{longitude}"),
        }
    }

    /// Reject payloads missing their required content.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Validation`] naming the empty field.
    pub fn validate(&self) -> Result<(), GatewayError> {
        let missing = |field: &str| {
            Err(GatewayError::Validation(format!(
                "missing required field: {field}"
            )))
        };
        match self {
            Self::Text { text } | Self::GroupMessage { text } if text.trim().is_empty() => {
                missing("text")
            }
            Self::Image { url, .. } | Self::Audio { url, .. } if url.trim().is_empty() => {
                missing("url")
            }
            Self::Document { url, .. } if url.trim().is_empty() => missing("url"),
            Self::Document { file_name, .. } if file_name.trim().is_empty() => {
                missing("file_name")
            }
            Self::Location {
                latitude,
                longitude,
                ..
            } if !(-90.0..=90.0).contains(latitude) || !(-180.0..=180.0).contains(longitude) => {
                Err(GatewayError::Validation(format!(
                    "coordinates out of range: {latitude},{longitude}"
                )))
            }
            _ => Ok(()),
        }
    }

    /// Apply `f` to every human-readable text field (body, captions, place
    /// name and address), returning the rewritten payload.
    pub fn map_text(&self, f: impl Fn(&str) -> String) -> Self {
        let map_opt = |value: &Option<String>| value.as_deref().map(&f);
        match self {
            Self::Text { text } => Self::Text { text: f(text) },
            Self::GroupMessage { text } => Self::GroupMessage { text: f(text) },
            Self::Image { url, caption } => Self::Image {
                url: url.clone(),
                caption: map_opt(caption),
            },
            Self::Document {
                url,
                file_name,
                mimetype,
                caption,
            } => Self::Document {
                url: url.clone(),
                file_name: file_name.clone(),
                mimetype: mimetype.clone(),
                caption: map_opt(caption),
            },
            Self::Audio { .. } => self.clone(),
            Self::Location {
                latitude,
                longitude,
                name,
                address,
            } => Self::Location {
                latitude: *latitude,
                longitude: *longitude,
                name: map_opt(name),
                address: map_opt(address),
            },
        }
    }
}

/// Acknowledgement returned by a transport after a successful send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// Provider-assigned message identifier.
    pub message_id: String,
    /// Normalized recipient the message went to.
    pub recipient: String,
    /// When the provider accepted the message.
    pub sent_at: DateTime<Utc>,
}

/// Normalize a recipient into a chat identifier.
///
/// Identifiers already carrying a domain (`...@s.whatsapp.net`, `...@g.us`)
/// are kept as given. Group messages get the group suffix; everything else is
/// reduced to digits and gets the user suffix, so `+1 (555) 010-2000` becomes
/// `15550102000@s.whatsapp.net`.
///
/// # Errors
///
/// Returns [`GatewayError::Validation`] when nothing usable remains.
pub fn normalize_recipient(raw: &str, kind: MessageKind) -> Result<String, GatewayError> {
    let trimmed = raw.trim();
    if trimmed.contains('@') {
        return Ok(trimmed.to_owned());
    }

    if kind == MessageKind::GroupMessage {
        let id: String = trimmed
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect();
        if id.is_empty() {
            return Err(GatewayError::Validation(format!(
                "invalid group id: {raw:?}"
            )));
        }
        return Ok(format!("{id}{GROUP_SUFFIX}"));
    }

    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return Err(GatewayError::Validation(format!(
            "invalid recipient: {raw:?}"
        )));
    }
    Ok(format!("{digits}{USER_SUFFIX}"))
}
