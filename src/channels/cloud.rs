//! WhatsApp Cloud API adapter (hosted business messaging API).
//!
//! Stateless: inbound traffic arrives through Meta's webhook push (see
//! `channels::webhook` for the HTTP surface), outbound traffic goes through
//! the Graph API. There is no persistent connection; readiness is credential
//! presence.
//!
//! # Inbound
//!
//! - `GET <path>` - webhook verification (challenge echo)
//! - `POST <path>` - message and status notifications, batched under
//!   `entry[*].changes[*].value`

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::CloudApiConfig;
use crate::error::{OmniError, Result};
use crate::ingest::{IngestPipeline, OutboundRecord};
use crate::model::{timestamp_from_epoch, ContentKind, DeliveryStatus, InboundMessage, StatusUpdate};

use super::adapter::{ChannelAdapter, SendOptions};

const CLOUD_API_BASE: &str = "https://graph.facebook.com";

/// WhatsApp text message character limit.
const MAX_MESSAGE_LENGTH: usize = 4096;

// ---------------------------------------------------------------------------
// Webhook payload types
// ---------------------------------------------------------------------------

/// Top-level webhook notification from the provider.
#[derive(Debug, Deserialize)]
struct WebhookNotification {
    /// Should always be "whatsapp_business_account".
    #[serde(default)]
    object: String,
    #[serde(default)]
    entry: Vec<WebhookEntry>,
}

#[derive(Debug, Deserialize)]
struct WebhookEntry {
    #[serde(default)]
    changes: Vec<WebhookChange>,
}

#[derive(Debug, Deserialize)]
struct WebhookChange {
    #[serde(default)]
    value: Option<WebhookValue>,
}

/// The value payload containing messages, statuses, and contacts.
#[derive(Debug, Deserialize)]
struct WebhookValue {
    #[serde(default)]
    messages: Vec<WebhookMessage>,
    #[serde(default)]
    statuses: Vec<WebhookStatus>,
    #[serde(default)]
    contacts: Vec<WebhookContact>,
}

/// A single inbound message from the webhook.
#[derive(Debug, Deserialize)]
struct WebhookMessage {
    /// Sender phone number (e.g. "15551234567").
    #[serde(default)]
    from: String,
    /// Provider-assigned message id.
    #[serde(default)]
    id: String,
    /// Unix timestamp, seconds since epoch, as a string.
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    text: Option<TextContent>,
    #[serde(default)]
    image: Option<MediaContent>,
    #[serde(default)]
    video: Option<MediaContent>,
    #[serde(default)]
    audio: Option<MediaContent>,
    #[serde(default)]
    document: Option<MediaContent>,
    #[serde(default)]
    location: Option<LocationContent>,
    #[serde(default)]
    contacts: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct TextContent {
    #[serde(default)]
    body: String,
}

/// Media descriptor shared by image/video/audio/document payloads.
#[derive(Debug, Deserialize)]
struct MediaContent {
    /// Provider media id, exchangeable for a download URL.
    #[serde(default)]
    id: String,
    #[serde(default)]
    caption: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LocationContent {
    #[serde(default)]
    latitude: f64,
    #[serde(default)]
    longitude: f64,
}

/// A delivery status entry from the webhook.
#[derive(Debug, Deserialize)]
struct WebhookStatus {
    /// Provider-assigned id of the affected message.
    #[serde(default)]
    id: String,
    /// Provider status vocabulary ("sent", "delivered", "read", "failed", ...).
    #[serde(default)]
    status: String,
    /// Unix timestamp as a string.
    #[serde(default)]
    timestamp: String,
}

#[derive(Debug, Deserialize)]
struct WebhookContact {
    #[serde(default)]
    profile: Option<WebhookProfile>,
}

#[derive(Debug, Deserialize)]
struct WebhookProfile {
    #[serde(default)]
    name: String,
}

/// Graph API send response.
#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    #[serde(default)]
    id: String,
}

// ---------------------------------------------------------------------------
// Normalization helpers
// ---------------------------------------------------------------------------

/// Classify a webhook message by content kind, extracting a human-readable
/// summary (caption, bracketed placeholder, or location text) and the media
/// reference when one exists.
fn classify_message(msg: &WebhookMessage) -> (ContentKind, String, Option<String>) {
    if let Some(ref text) = msg.text {
        return (ContentKind::Text, text.body.clone(), None);
    }
    if let Some(ref image) = msg.image {
        let content = image.caption.clone().unwrap_or_else(|| "[Image]".to_string());
        return (ContentKind::Image, content, Some(image.id.clone()));
    }
    if let Some(ref video) = msg.video {
        let content = video.caption.clone().unwrap_or_else(|| "[Video]".to_string());
        return (ContentKind::Video, content, Some(video.id.clone()));
    }
    if let Some(ref audio) = msg.audio {
        return (ContentKind::Audio, "[Audio]".to_string(), Some(audio.id.clone()));
    }
    if let Some(ref document) = msg.document {
        let content = document
            .caption
            .clone()
            .unwrap_or_else(|| "[Document]".to_string());
        return (ContentKind::Document, content, Some(document.id.clone()));
    }
    if let Some(ref location) = msg.location {
        let content = format!("Location: {}, {}", location.latitude, location.longitude);
        return (ContentKind::Location, content, None);
    }
    if msg.contacts.is_some() {
        return (ContentKind::Contact, "[Contact]".to_string(), None);
    }
    // Unrecognized kinds still flow through as empty text; the webhook
    // contract never rejects a provider delivery.
    (ContentKind::Text, String::new(), None)
}

/// Normalize one webhook message entry into the canonical DTO.
fn normalize_message(msg: &WebhookMessage, sender_name: Option<&str>) -> Option<InboundMessage> {
    let from = msg.from.trim();
    if from.is_empty() {
        return None;
    }

    let (kind, content, media_url) = classify_message(msg);
    let timestamp = msg
        .timestamp
        .parse::<i64>()
        .map(timestamp_from_epoch)
        .unwrap_or_else(|_| chrono::Utc::now());

    let mut inbound = InboundMessage::new(from, &content, kind, timestamp);
    if !msg.id.is_empty() {
        inbound = inbound.with_external_message_id(&msg.id);
    }
    if let Some(url) = media_url {
        inbound = inbound.with_media_url(&url);
    }
    if let Some(name) = sender_name {
        if !name.is_empty() {
            inbound = inbound.with_sender_name(name);
        }
    }
    if !msg.timestamp.is_empty() {
        inbound = inbound.with_metadata("provider_timestamp", msg.timestamp.as_str());
    }
    Some(inbound)
}

/// Normalize one webhook status entry into the canonical DTO.
fn normalize_status(status: &WebhookStatus) -> Option<StatusUpdate> {
    if status.id.is_empty() {
        return None;
    }
    let timestamp = status
        .timestamp
        .parse::<i64>()
        .map(timestamp_from_epoch)
        .unwrap_or_else(|_| chrono::Utc::now());
    Some(StatusUpdate::new(
        &status.id,
        DeliveryStatus::from_provider(&status.status),
        timestamp,
    ))
}

/// Strip everything but digits from a recipient phone number, including a
/// leading `+`.
fn format_phone_number(phone: &str) -> String {
    phone.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Truncate a message to the provider character limit.
fn truncate_message(content: &str) -> String {
    if content.chars().count() <= MAX_MESSAGE_LENGTH {
        content.to_string()
    } else {
        let suffix = "...(truncated)";
        let cut_chars = MAX_MESSAGE_LENGTH.saturating_sub(suffix.len());
        let prefix: String = content.chars().take(cut_chars).collect();
        format!("{}{}", prefix, suffix)
    }
}

/// Outbound media must be a remote HTTP(S) URL the provider can fetch.
fn validate_media_source(media_url: &str) -> Result<()> {
    match url::Url::parse(media_url) {
        Ok(parsed) if parsed.scheme() == "http" || parsed.scheme() == "https" => Ok(()),
        _ => Err(OmniError::InvalidMediaSource(format!(
            "media URL must be a valid HTTP/HTTPS URL, got '{media_url}'"
        ))),
    }
}

// ---------------------------------------------------------------------------
// CloudApiAdapter
// ---------------------------------------------------------------------------

/// WhatsApp Cloud API adapter.
///
/// Receives inbound batches from the webhook surface (`handle_webhook`) and
/// sends outbound messages via the Graph API.
pub struct CloudApiAdapter {
    channel_id: i64,
    config: CloudApiConfig,
    pipeline: Arc<IngestPipeline>,
    client: Client,
    /// Set once `initialize` succeeds; gates sends.
    initialized: AtomicBool,
    /// Set by `disconnect`; forces `is_connected` false.
    closed: AtomicBool,
}

impl CloudApiAdapter {
    /// Creates a new Cloud API adapter for the given channel.
    pub fn new(channel_id: i64, config: CloudApiConfig, pipeline: Arc<IngestPipeline>) -> Self {
        if config.api_token.is_empty() || config.phone_number_id.is_empty() {
            warn!(
                channel_id,
                "Cloud API credentials missing; set WHATSAPP_API_TOKEN and WHATSAPP_PHONE_NUMBER_ID"
            );
        }
        Self {
            channel_id,
            config,
            pipeline,
            client: Client::new(),
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn has_credentials(&self) -> bool {
        !self.config.api_token.is_empty() && !self.config.phone_number_id.is_empty()
    }

    fn messages_endpoint(&self) -> String {
        format!(
            "{}/{}/{}/messages",
            CLOUD_API_BASE, self.config.api_version, self.config.phone_number_id
        )
    }

    fn require_ready(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) || !self.initialized.load(Ordering::SeqCst) {
            return Err(OmniError::NotConnected(
                "Cloud API adapter is not initialized".to_string(),
            ));
        }
        Ok(())
    }

    /// Webhook verification handshake.
    ///
    /// Echoes the challenge only for `hub.mode=subscribe` with a matching
    /// verify token.
    pub fn verify_webhook(&self, mode: &str, token: &str, challenge: &str) -> Option<String> {
        if mode == "subscribe" && token == self.config.verify_token {
            Some(challenge.to_string())
        } else {
            None
        }
    }

    /// Process a webhook delivery batch: normalize every message and status
    /// entry and push them through the ingestion pipeline.
    ///
    /// Malformed entries are skipped, never rejected; the provider retries
    /// unacknowledged deliveries, so this path is strictly best-effort.
    pub async fn handle_webhook(&self, body: &Value) {
        let notification: WebhookNotification = match serde_json::from_value(body.clone()) {
            Ok(n) => n,
            Err(e) => {
                debug!(channel_id = self.channel_id, error = %e, "unparseable webhook body");
                return;
            }
        };

        if !notification.object.is_empty() && notification.object != "whatsapp_business_account" {
            debug!(
                channel_id = self.channel_id,
                object = %notification.object,
                "ignoring non-whatsapp notification object"
            );
            return;
        }

        for entry in &notification.entry {
            for change in &entry.changes {
                let value = match &change.value {
                    Some(v) => v,
                    None => continue,
                };

                let sender_name = value
                    .contacts
                    .first()
                    .and_then(|c| c.profile.as_ref())
                    .map(|p| p.name.as_str());

                for msg in &value.messages {
                    if let Some(inbound) = normalize_message(msg, sender_name) {
                        self.pipeline.ingest_message(self.channel_id, inbound).await;
                    }
                }
                for status in &value.statuses {
                    if let Some(update) = normalize_status(status) {
                        self.pipeline.ingest_status(self.channel_id, update).await;
                    }
                }
            }
        }
    }

    /// Read call verifying the configured phone number against the provider.
    async fn verify_phone_number(&self) -> Result<()> {
        let url = format!(
            "{}/{}/{}",
            CLOUD_API_BASE, self.config.api_version, self.config.phone_number_id
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.api_token)
            .send()
            .await
            .map_err(|e| OmniError::Connectivity(format!("Cloud API unreachable: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(OmniError::Config(format!(
                "phone number verification failed ({status}): {body}"
            )));
        }

        let data: Value = response.json().await.unwrap_or_default();
        if let Some(display_number) = data.get("display_phone_number").and_then(Value::as_str) {
            info!(channel_id = self.channel_id, phone = display_number, "Cloud API phone number verified");
        }
        Ok(())
    }

    /// Exchange a remote media URL for a provider-internal media handle.
    async fn upload_media(&self, media_url: &str, kind: ContentKind) -> Result<String> {
        validate_media_source(media_url)?;

        let url = format!(
            "{}/{}/{}/media",
            CLOUD_API_BASE, self.config.api_version, self.config.phone_number_id
        );
        let payload = json!({
            "messaging_product": "whatsapp",
            "type": kind.as_str(),
            "url": media_url,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_token)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(OmniError::Send(format!(
                "media upload rejected ({status}): {body}"
            )));
        }

        let data: Value = response.json().await.unwrap_or_default();
        data.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| OmniError::Send("media upload response missing id".to_string()))
    }

    /// POST a message payload and extract the provider-assigned message id.
    async fn post_message(&self, payload: &Value) -> Result<String> {
        let response = self
            .client
            .post(self.messages_endpoint())
            .bearer_auth(&self.config.api_token)
            .json(payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(channel_id = self.channel_id, %status, "Cloud API rejected send");
            return Err(OmniError::Send(format!("Cloud API error ({status}): {body}")));
        }

        let data: SendResponse = response.json().await?;
        data.messages
            .first()
            .filter(|m| !m.id.is_empty())
            .map(|m| m.id.clone())
            .ok_or_else(|| OmniError::Send("send response missing message id".to_string()))
    }

    /// Record an outbound message, logging rather than failing the send when
    /// bookkeeping itself errors (the provider already accepted the message).
    async fn record_outbound(
        &self,
        to: &str,
        external_message_id: &str,
        kind: ContentKind,
        content: &str,
        media_url: Option<&str>,
        metadata: Value,
    ) {
        let result = self
            .pipeline
            .record_outbound(OutboundRecord {
                channel_id: self.channel_id,
                to,
                external_message_id,
                kind,
                content,
                media_url,
                metadata,
            })
            .await;
        if let Err(e) = result {
            error!(channel_id = self.channel_id, error = %e, "failed to record outbound message");
        }
    }
}

#[async_trait]
impl ChannelAdapter for CloudApiAdapter {
    fn name(&self) -> &str {
        "whatsapp-cloud"
    }

    fn channel_id(&self) -> i64 {
        self.channel_id
    }

    async fn initialize(&self) -> Result<()> {
        info!(channel_id = self.channel_id, "initializing Cloud API adapter");

        if !self.has_credentials() {
            return Err(OmniError::Config(
                "missing required Cloud API credentials (api_token, phone_number_id)".to_string(),
            ));
        }

        self.verify_phone_number().await?;

        if let Some(ref webhook_url) = self.config.webhook_url {
            // Subscription itself is an administrative step in the provider
            // console; surface what the operator needs to enter there.
            info!(
                channel_id = self.channel_id,
                webhook_url = %webhook_url,
                verify_token = %self.config.verify_token,
                "webhook subscription must be configured in the provider console"
            );
        }

        self.closed.store(false, Ordering::SeqCst);
        self.initialized.store(true, Ordering::SeqCst);
        info!(channel_id = self.channel_id, "Cloud API adapter initialized");
        Ok(())
    }

    async fn send_message(
        &self,
        to: &str,
        body: &str,
        options: Option<SendOptions>,
    ) -> Result<String> {
        self.require_ready()?;

        let to = format_phone_number(to);
        if to.is_empty() {
            return Err(OmniError::Send("recipient cannot be empty".to_string()));
        }

        let content = truncate_message(body);
        let payload = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": {
                "preview_url": false,
                "body": content,
            }
        });

        let message_id = self.post_message(&payload).await?;
        info!(channel_id = self.channel_id, %to, %message_id, "Cloud API message sent");

        let options = options.unwrap_or_default();
        self.record_outbound(
            &to,
            &message_id,
            options.kind.unwrap_or(ContentKind::Text),
            &content,
            options.media_url.as_deref(),
            options.metadata.unwrap_or(Value::Null),
        )
        .await;

        Ok(message_id)
    }

    async fn send_media(
        &self,
        to: &str,
        media: &str,
        caption: Option<&str>,
        kind: ContentKind,
    ) -> Result<String> {
        self.require_ready()?;

        let media_id = self.upload_media(media, kind).await?;

        let to = format_phone_number(to);
        let mut payload = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": kind.as_str(),
        });
        let body = match kind {
            ContentKind::Image | ContentKind::Video | ContentKind::Document => {
                json!({ "id": media_id, "caption": caption })
            }
            ContentKind::Audio => json!({ "id": media_id }),
            other => {
                return Err(OmniError::Unsupported(format!(
                    "cannot send '{}' as media",
                    other.as_str()
                )))
            }
        };
        payload[kind.as_str()] = body;

        let message_id = self.post_message(&payload).await?;
        info!(channel_id = self.channel_id, %to, %message_id, "Cloud API media sent");

        let content = caption
            .map(str::to_string)
            .unwrap_or_else(|| kind.placeholder().to_string());
        self.record_outbound(&to, &message_id, kind, &content, Some(media), Value::Null)
            .await;

        Ok(message_id)
    }

    async fn disconnect(&self) -> Result<()> {
        // No persistent connection to tear down for a REST integration.
        self.closed.store(true, Ordering::SeqCst);
        self.initialized.store(false, Ordering::SeqCst);
        info!(channel_id = self.channel_id, "Cloud API adapter disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.has_credentials() && !self.closed.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::IngestPipeline;
    use crate::store::Store;

    async fn test_fixture() -> (Arc<IngestPipeline>, i64) {
        let store = Store::open_in_memory().await.unwrap();
        let channel = store
            .create_channel("whatsapp-cloud", "messaging", &Value::Null, true)
            .await
            .unwrap();
        (Arc::new(IngestPipeline::new(store)), channel.id)
    }

    fn test_config() -> CloudApiConfig {
        CloudApiConfig {
            api_token: "test-token".to_string(),
            phone_number_id: "123456".to_string(),
            business_account_id: "78910".to_string(),
            api_version: "v21.0".to_string(),
            verify_token: "verify-secret".to_string(),
            webhook_url: None,
        }
    }

    async fn test_adapter() -> (CloudApiAdapter, Arc<IngestPipeline>) {
        let (pipeline, channel_id) = test_fixture().await;
        let adapter = CloudApiAdapter::new(channel_id, test_config(), Arc::clone(&pipeline));
        (adapter, pipeline)
    }

    // -----------------------------------------------------------------------
    // 1. Adapter identity and readiness
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_adapter_name() {
        let (adapter, _) = test_adapter().await;
        assert_eq!(adapter.name(), "whatsapp-cloud");
    }

    #[tokio::test]
    async fn test_is_connected_is_credential_presence() {
        let (adapter, _) = test_adapter().await;
        // Credentials present: connected even before initialize
        assert!(adapter.is_connected());
    }

    #[tokio::test]
    async fn test_is_connected_without_credentials() {
        let (pipeline, channel_id) = test_fixture().await;
        let mut config = test_config();
        config.api_token = String::new();
        let adapter = CloudApiAdapter::new(channel_id, config, pipeline);
        assert!(!adapter.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_clears_connected() {
        let (adapter, _) = test_adapter().await;
        adapter.disconnect().await.unwrap();
        assert!(!adapter.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_without_initialize_is_safe() {
        let (adapter, _) = test_adapter().await;
        assert!(adapter.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn test_initialize_missing_credentials() {
        let (pipeline, channel_id) = test_fixture().await;
        let mut config = test_config();
        config.phone_number_id = String::new();
        let adapter = CloudApiAdapter::new(channel_id, config, pipeline);
        let result = adapter.initialize().await;
        assert!(matches!(result, Err(OmniError::Config(_))));
    }

    #[tokio::test]
    async fn test_send_before_initialize_not_connected() {
        let (adapter, _) = test_adapter().await;
        let result = adapter.send_message("+1555", "hello", None).await;
        assert!(matches!(result, Err(OmniError::NotConnected(_))));
    }

    // -----------------------------------------------------------------------
    // 2. Webhook verification
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_verify_webhook_valid() {
        let (adapter, _) = test_adapter().await;
        let result = adapter.verify_webhook("subscribe", "verify-secret", "challenge123");
        assert_eq!(result, Some("challenge123".to_string()));
    }

    #[tokio::test]
    async fn test_verify_webhook_wrong_token() {
        let (adapter, _) = test_adapter().await;
        assert!(adapter.verify_webhook("subscribe", "wrong", "challenge123").is_none());
    }

    #[tokio::test]
    async fn test_verify_webhook_wrong_mode() {
        let (adapter, _) = test_adapter().await;
        assert!(adapter
            .verify_webhook("unsubscribe", "verify-secret", "challenge123")
            .is_none());
    }

    // -----------------------------------------------------------------------
    // 3. Content classification
    // -----------------------------------------------------------------------

    fn message_json(body: &str) -> WebhookMessage {
        serde_json::from_str(body).expect("message json")
    }

    #[test]
    fn test_classify_text() {
        let msg = message_json(r#"{"from":"1555","id":"m1","timestamp":"1","text":{"body":"hi"}}"#);
        let (kind, content, media) = classify_message(&msg);
        assert_eq!(kind, ContentKind::Text);
        assert_eq!(content, "hi");
        assert!(media.is_none());
    }

    #[test]
    fn test_classify_image_with_caption() {
        let msg = message_json(
            r#"{"from":"1555","id":"m1","timestamp":"1","image":{"id":"media1","caption":"look"}}"#,
        );
        let (kind, content, media) = classify_message(&msg);
        assert_eq!(kind, ContentKind::Image);
        assert_eq!(content, "look");
        assert_eq!(media.as_deref(), Some("media1"));
    }

    #[test]
    fn test_classify_image_without_caption() {
        let msg =
            message_json(r#"{"from":"1555","id":"m1","timestamp":"1","image":{"id":"media1"}}"#);
        let (kind, content, _) = classify_message(&msg);
        assert_eq!(kind, ContentKind::Image);
        assert_eq!(content, "[Image]");
    }

    #[test]
    fn test_classify_audio_placeholder() {
        let msg =
            message_json(r#"{"from":"1555","id":"m1","timestamp":"1","audio":{"id":"media2"}}"#);
        let (kind, content, media) = classify_message(&msg);
        assert_eq!(kind, ContentKind::Audio);
        assert_eq!(content, "[Audio]");
        assert_eq!(media.as_deref(), Some("media2"));
    }

    #[test]
    fn test_classify_document() {
        let msg = message_json(
            r#"{"from":"1555","id":"m1","timestamp":"1","document":{"id":"d1","caption":"report.pdf"}}"#,
        );
        let (kind, content, media) = classify_message(&msg);
        assert_eq!(kind, ContentKind::Document);
        assert_eq!(content, "report.pdf");
        assert_eq!(media.as_deref(), Some("d1"));
    }

    #[test]
    fn test_classify_location() {
        let msg = message_json(
            r#"{"from":"1555","id":"m1","timestamp":"1","location":{"latitude":3.14,"longitude":101.6}}"#,
        );
        let (kind, content, media) = classify_message(&msg);
        assert_eq!(kind, ContentKind::Location);
        assert_eq!(content, "Location: 3.14, 101.6");
        assert!(media.is_none());
    }

    #[test]
    fn test_classify_contact() {
        let msg = message_json(
            r#"{"from":"1555","id":"m1","timestamp":"1","contacts":[{"name":{"formatted_name":"Jo"}}]}"#,
        );
        let (kind, content, _) = classify_message(&msg);
        assert_eq!(kind, ContentKind::Contact);
        assert_eq!(content, "[Contact]");
    }

    #[test]
    fn test_classify_unknown_kind_is_empty_text() {
        let msg = message_json(r#"{"from":"1555","id":"m1","timestamp":"1"}"#);
        let (kind, content, media) = classify_message(&msg);
        assert_eq!(kind, ContentKind::Text);
        assert!(content.is_empty());
        assert!(media.is_none());
    }

    // -----------------------------------------------------------------------
    // 4. Normalization
    // -----------------------------------------------------------------------

    #[test]
    fn test_normalize_message_timestamp_and_metadata() {
        let msg = message_json(
            r#"{"from":"1555","id":"wamid.a","timestamp":"1707900000","text":{"body":"hi"}}"#,
        );
        let inbound = normalize_message(&msg, Some("John")).unwrap();
        assert_eq!(inbound.external_id, "1555");
        assert_eq!(inbound.external_message_id.as_deref(), Some("wamid.a"));
        assert_eq!(inbound.timestamp.timestamp(), 1_707_900_000);
        assert_eq!(inbound.sender_name.as_deref(), Some("John"));
        assert_eq!(
            inbound.metadata.get("provider_timestamp").and_then(Value::as_str),
            Some("1707900000")
        );
    }

    #[test]
    fn test_normalize_message_missing_from_skipped() {
        let msg = message_json(r#"{"id":"m1","timestamp":"1","text":{"body":"hi"}}"#);
        assert!(normalize_message(&msg, None).is_none());
    }

    #[test]
    fn test_normalize_status_unknown_maps_to_sent() {
        let status: WebhookStatus = serde_json::from_str(
            r#"{"id":"wamid.s","status":"queued","timestamp":"1707900000"}"#,
        )
        .unwrap();
        let update = normalize_status(&status).unwrap();
        assert_eq!(update.status, DeliveryStatus::Sent);
        assert_eq!(update.timestamp.timestamp(), 1_707_900_000);
    }

    #[test]
    fn test_normalize_status_missing_id_skipped() {
        let status: WebhookStatus =
            serde_json::from_str(r#"{"status":"read","timestamp":"1"}"#).unwrap();
        assert!(normalize_status(&status).is_none());
    }

    // -----------------------------------------------------------------------
    // 5. Webhook end-to-end through the pipeline
    // -----------------------------------------------------------------------

    fn sample_webhook_body() -> Value {
        json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "changes": [{
                    "value": {
                        "messages": [{
                            "from": "15551234567",
                            "id": "wamid.abc",
                            "timestamp": "1707900000",
                            "type": "text",
                            "text": { "body": "Hello there!" }
                        }],
                        "contacts": [{ "profile": { "name": "John Doe" } }],
                        "metadata": { "phone_number_id": "123456" }
                    }
                }]
            }]
        })
    }

    #[tokio::test]
    async fn test_handle_webhook_persists_and_fans_out() {
        let (adapter, pipeline) = test_adapter().await;
        let mut rx = pipeline.subscribe_messages(8).await;

        adapter.handle_webhook(&sample_webhook_body()).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.message.content, "Hello there!");

        let conv = pipeline
            .store()
            .conversation_by_external_id(adapter.channel_id(), "15551234567")
            .await
            .unwrap()
            .expect("conversation persisted");
        assert_eq!(conv.contact_name.as_deref(), Some("John Doe"));

        let messages = pipeline
            .store()
            .messages_by_conversation(conv.id, 10)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, DeliveryStatus::Delivered);
        assert_eq!(messages[0].external_message_id.as_deref(), Some("wamid.abc"));
    }

    #[tokio::test]
    async fn test_handle_webhook_statuses() {
        let (adapter, pipeline) = test_adapter().await;
        let mut rx = pipeline.subscribe_statuses(8).await;

        adapter
            .handle_webhook(&json!({
                "object": "whatsapp_business_account",
                "entry": [{"changes": [{"value": {
                    "statuses": [
                        {"id": "wamid.x", "status": "delivered", "timestamp": "1707900000"},
                        {"id": "wamid.x", "status": "read", "timestamp": "1707900050"}
                    ]
                }}]}]
            }))
            .await;

        assert_eq!(rx.recv().await.unwrap().update.status, DeliveryStatus::Delivered);
        assert_eq!(rx.recv().await.unwrap().update.status, DeliveryStatus::Read);
    }

    #[tokio::test]
    async fn test_handle_webhook_garbage_body() {
        let (adapter, _) = test_adapter().await;
        // Must not panic or error
        adapter.handle_webhook(&json!("not an object")).await;
        adapter.handle_webhook(&json!({"object": "something_else"})).await;
        adapter.handle_webhook(&json!({"entry": [{"changes": [{}]}]})).await;
    }

    // -----------------------------------------------------------------------
    // 6. Outbound helpers
    // -----------------------------------------------------------------------

    #[test]
    fn test_format_phone_number() {
        assert_eq!(format_phone_number("+1 (555) 123-4567"), "15551234567");
        assert_eq!(format_phone_number("15551234567"), "15551234567");
        assert_eq!(format_phone_number("abc"), "");
    }

    #[test]
    fn test_truncate_message_short() {
        assert_eq!(truncate_message("Hello!"), "Hello!");
    }

    #[test]
    fn test_truncate_message_over_limit() {
        let msg = "a".repeat(MAX_MESSAGE_LENGTH + 100);
        let result = truncate_message(&msg);
        assert!(result.chars().count() <= MAX_MESSAGE_LENGTH);
        assert!(result.ends_with("...(truncated)"));
    }

    #[test]
    fn test_validate_media_source() {
        assert!(validate_media_source("https://example.com/a.png").is_ok());
        assert!(validate_media_source("http://example.com/a.png").is_ok());
        assert!(matches!(
            validate_media_source("file:///etc/passwd"),
            Err(OmniError::InvalidMediaSource(_))
        ));
        assert!(matches!(
            validate_media_source("data:image/png;base64,AAAA"),
            Err(OmniError::InvalidMediaSource(_))
        ));
        assert!(matches!(
            validate_media_source("not a url"),
            Err(OmniError::InvalidMediaSource(_))
        ));
    }

    #[tokio::test]
    async fn test_send_media_rejects_non_http_source() {
        let (adapter, _) = test_adapter().await;
        // Bypass the initialize network call; send gating is what we test.
        adapter.initialized.store(true, Ordering::SeqCst);

        let result = adapter
            .send_media("+1555", "data:image/png;base64,AAAA", None, ContentKind::Image)
            .await;
        assert!(matches!(result, Err(OmniError::InvalidMediaSource(_))));
    }
}
