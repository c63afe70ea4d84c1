//! Canonical conversation/message model shared by every adapter and the
//! persistence layer.
//!
//! Adapters normalize provider-native payloads into the transient DTOs here
//! (`InboundMessage`, `StatusUpdate`) before handing off to the ingestion
//! pipeline; the pipeline owns the persisted rows (`Conversation`,
//! `MessageRecord`).

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Direction of a persisted message. Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Received from the external correspondent
    Inbound,
    /// Sent by us through the provider
    Outbound,
}

impl Direction {
    /// Stable string form used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }

    /// Parses the database string form. Unknown values read as inbound.
    pub fn parse(s: &str) -> Self {
        match s {
            "outbound" => Direction::Outbound,
            _ => Direction::Inbound,
        }
    }
}

/// Canonical content kind of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// Plain text
    Text,
    /// Image (stickers normalize here too)
    Image,
    /// Video
    Video,
    /// Audio / voice note
    Audio,
    /// Document attachment
    Document,
    /// Shared location
    Location,
    /// Shared contact card
    Contact,
}

impl ContentKind {
    /// Stable string form used in the database and provider payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Text => "text",
            ContentKind::Image => "image",
            ContentKind::Video => "video",
            ContentKind::Audio => "audio",
            ContentKind::Document => "document",
            ContentKind::Location => "location",
            ContentKind::Contact => "contact",
        }
    }

    /// Parses a provider/database kind string. Unknown kinds read as text.
    pub fn parse(s: &str) -> Self {
        match s {
            "image" | "sticker" => ContentKind::Image,
            "video" => ContentKind::Video,
            "audio" | "voice" | "ptt" => ContentKind::Audio,
            "document" => ContentKind::Document,
            "location" => ContentKind::Location,
            "contact" | "vcard" | "contacts" => ContentKind::Contact,
            _ => ContentKind::Text,
        }
    }

    /// Bracketed human-readable summary used when a non-text message carries
    /// no caption.
    pub fn placeholder(&self) -> &'static str {
        match self {
            ContentKind::Text => "",
            ContentKind::Image => "[Image]",
            ContentKind::Video => "[Video]",
            ContentKind::Audio => "[Audio]",
            ContentKind::Document => "[Document]",
            ContentKind::Location => "[Location]",
            ContentKind::Contact => "[Contact]",
        }
    }
}

/// Lifecycle status of a conversation thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    /// Accepting traffic (default)
    Open,
    /// Resolved by an operator
    Closed,
    /// Hidden from the active inbox
    Archived,
}

impl ConversationStatus {
    /// Stable string form used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Open => "open",
            ConversationStatus::Closed => "closed",
            ConversationStatus::Archived => "archived",
        }
    }

    /// Parses the database string form. Unknown values read as open.
    pub fn parse(s: &str) -> Self {
        match s {
            "closed" => ConversationStatus::Closed,
            "archived" => ConversationStatus::Archived,
            _ => ConversationStatus::Open,
        }
    }
}

/// Delivery status of a message as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Accepted by the provider
    Sent,
    /// Delivered to the recipient device
    Delivered,
    /// Read by the recipient
    Read,
    /// Provider reported a delivery failure
    Failed,
}

impl DeliveryStatus {
    /// Stable string form used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
        }
    }

    /// Maps the Cloud API status vocabulary onto the canonical set.
    ///
    /// Unknown values map to `Sent` rather than erroring: the webhook
    /// contract is best-effort and must never reject a provider delivery.
    pub fn from_provider(s: &str) -> Self {
        match s {
            "sent" => DeliveryStatus::Sent,
            "delivered" => DeliveryStatus::Delivered,
            "read" => DeliveryStatus::Read,
            "failed" => DeliveryStatus::Failed,
            _ => DeliveryStatus::Sent,
        }
    }

    /// Maps session-bridge acknowledgment levels ordinally (higher = more
    /// delivered). Unknown levels map to `Sent`.
    pub fn from_ack(ack: i64) -> Self {
        match ack {
            2 => DeliveryStatus::Delivered,
            a if a >= 3 => DeliveryStatus::Read,
            _ => DeliveryStatus::Sent,
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted rows
// ---------------------------------------------------------------------------

/// One configured messaging provider integration.
///
/// Created by administrative setup; read by the channel manager to decide
/// which adapter implementation to instantiate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    /// Database ID
    pub id: i64,
    /// Unique channel name ("whatsapp", "whatsapp-cloud", ...)
    pub name: String,
    /// Type tag ("messaging", ...)
    pub kind: String,
    /// Free-form provider configuration
    pub config: Value,
    /// Whether the channel is administratively enabled
    pub active: bool,
    /// Row creation time
    pub created_at: DateTime<Utc>,
    /// Last row update time
    pub updated_at: DateTime<Utc>,
}

impl Channel {
    /// Reads a boolean flag from the channel's provider configuration.
    pub fn config_flag(&self, key: &str) -> bool {
        self.config.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

/// The persistent thread with one external correspondent on one channel.
///
/// Invariant: at most one conversation exists per `(channel_id, external_id)`
/// pair; the store enforces this with a uniqueness constraint and an atomic
/// resolve-or-create upsert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Database ID
    pub id: i64,
    /// Owning channel
    pub channel_id: i64,
    /// Provider-native correspondent identity (phone number, session peer id)
    pub external_id: String,
    /// Display name (defaults to the external id on lazy creation)
    pub contact_name: Option<String>,
    /// Additional contact info
    pub contact_info: Value,
    /// Thread lifecycle status
    pub status: ConversationStatus,
    /// Free-form metadata
    pub metadata: Value,
    /// Timestamp of the most recent message either direction
    pub last_message_at: Option<DateTime<Utc>>,
    /// Row creation time
    pub created_at: DateTime<Utc>,
    /// Last row update time
    pub updated_at: DateTime<Utc>,
}

/// One persisted inbound or outbound unit of communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Database ID
    pub id: i64,
    /// Owning conversation
    pub conversation_id: i64,
    /// Owning channel
    pub channel_id: i64,
    /// Provider-assigned message id, when known
    pub external_message_id: Option<String>,
    /// Inbound or outbound; immutable after creation
    pub direction: Direction,
    /// Canonical content kind
    pub kind: ContentKind,
    /// Textual content (caption or placeholder for media)
    pub content: String,
    /// Media reference (provider media id, data URL, or remote URL)
    pub media_url: Option<String>,
    /// Delivery status
    pub status: DeliveryStatus,
    /// Free-form metadata
    pub metadata: Value,
    /// Row creation time
    pub created_at: DateTime<Utc>,
    /// Last row update time
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Transient DTOs
// ---------------------------------------------------------------------------

/// A normalized inbound message, produced by an adapter from a
/// provider-native payload. Not persisted directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Provider-native sender identity
    pub external_id: String,
    /// Provider-assigned message id, when known
    pub external_message_id: Option<String>,
    /// Textual content (caption or placeholder for media)
    pub content: String,
    /// Canonical content kind
    pub kind: ContentKind,
    /// Provider timestamp
    pub timestamp: DateTime<Utc>,
    /// Media reference, when the message carries media
    pub media_url: Option<String>,
    /// Sender display name, when the provider supplies one
    pub sender_name: Option<String>,
    /// Additional provider metadata, persisted with the message
    pub metadata: Map<String, Value>,
}

impl InboundMessage {
    /// Creates a new inbound message DTO with the required fields.
    pub fn new(external_id: &str, content: &str, kind: ContentKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            external_id: external_id.to_string(),
            external_message_id: None,
            content: content.to_string(),
            kind,
            timestamp,
            media_url: None,
            sender_name: None,
            metadata: Map::new(),
        }
    }

    /// Sets the provider-assigned message id (builder pattern).
    pub fn with_external_message_id(mut self, id: &str) -> Self {
        self.external_message_id = Some(id.to_string());
        self
    }

    /// Sets the media reference (builder pattern).
    pub fn with_media_url(mut self, url: &str) -> Self {
        self.media_url = Some(url.to_string());
        self
    }

    /// Sets the sender display name (builder pattern).
    pub fn with_sender_name(mut self, name: &str) -> Self {
        self.sender_name = Some(name.to_string());
        self
    }

    /// Adds a metadata key-value pair (builder pattern).
    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Checks whether this message carries a media reference.
    pub fn has_media(&self) -> bool {
        self.media_url.is_some()
    }
}

/// A normalized delivery-status update, correlated to a message by its
/// provider-assigned id. Not persisted; fanned out to status observers only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// Provider-assigned id of the affected message
    pub external_message_id: String,
    /// New delivery status
    pub status: DeliveryStatus,
    /// Provider timestamp of the transition
    pub timestamp: DateTime<Utc>,
}

impl StatusUpdate {
    /// Creates a new status update DTO.
    pub fn new(external_message_id: &str, status: DeliveryStatus, timestamp: DateTime<Utc>) -> Self {
        Self {
            external_message_id: external_message_id.to_string(),
            status,
            timestamp,
        }
    }
}

/// Converts a provider epoch-seconds value to the canonical timestamp type.
///
/// Out-of-range values fall back to the current time rather than failing,
/// since inbound normalization must never reject a provider delivery.
pub fn timestamp_from_epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

// ===========================================================================
// Tests
// ===========================================================================
