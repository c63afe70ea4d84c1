//! Session-based WhatsApp adapter (paired session via a local bridge).
//!
//! The bridge process owns the long-lived paired session: pairing happens by
//! scanning a code on first use and the credentials persist under the
//! configured storage path, so restarts do not re-pair. This adapter talks to
//! the bridge two ways:
//!
//! - Commands over HTTP (`/send`, `/send-media`, `/status`, `/media/{id}`)
//! - Events over a WebSocket stream (`/events`), JSON envelopes:
//!
//! ```json
//! {"type":"message","from":"15551234567@c.us","content":"Hello","message_id":"wamid.x","timestamp":1707900000,"sender_name":"John","from_me":false}
//! {"type":"ack","message_id":"wamid.x","ack":2}
//! {"type":"qr","data":"2@base64data"}
//! {"type":"ready"}
//! {"type":"disconnected","reason":"session expired"}
//! ```

use async_trait::async_trait;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::config::SessionBridgeConfig;
use crate::error::{OmniError, Result};
use crate::ingest::{IngestPipeline, OutboundRecord};
use crate::model::{timestamp_from_epoch, ContentKind, DeliveryStatus, InboundMessage, StatusUpdate};

use super::adapter::{ChannelAdapter, SendOptions};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum reconnect delay (in seconds) for exponential backoff.
const MAX_RECONNECT_DELAY_SECS: u64 = 120;
/// Base reconnect delay (in seconds).
const BASE_RECONNECT_DELAY_SECS: u64 = 2;
/// Cap on the backoff exponent.
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// HTTP connect timeout for the bridge command client.
const CONNECT_TIMEOUT_SECS: u64 = 5;
/// HTTP request timeout for bridge commands.
const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Number of bridge probe attempts during initialize.
const PROBE_RETRIES: u32 = 5;
/// Delay between bridge probe attempts in milliseconds.
const PROBE_DELAY_MS: u64 = 2000;

// ---------------------------------------------------------------------------
// Bridge protocol types
// ---------------------------------------------------------------------------

/// Event from the bridge WebSocket stream.
#[derive(Debug, Deserialize)]
struct BridgeEvent {
    /// Event type: "message", "ack", "qr", "ready", "disconnected", ...
    #[serde(rename = "type")]
    event_type: String,
    /// Sender JID (message events).
    #[serde(default)]
    from: Option<String>,
    /// Message text content.
    #[serde(default)]
    content: Option<String>,
    /// Bridge-assigned message id.
    #[serde(default)]
    message_id: Option<String>,
    /// Unix timestamp, seconds since epoch.
    #[serde(default)]
    timestamp: Option<i64>,
    /// Sender display name.
    #[serde(default)]
    sender_name: Option<String>,
    /// Whether this message is an echo of our own send.
    #[serde(default)]
    from_me: bool,
    /// Media descriptor (media-bearing message events).
    #[serde(default)]
    media: Option<BridgeMedia>,
    /// Acknowledgment level (ack events).
    #[serde(default)]
    ack: Option<i64>,
    /// Disconnect reason (disconnected events).
    #[serde(default)]
    reason: Option<String>,
    /// Pairing code payload (qr events).
    #[serde(default)]
    data: Option<String>,
}

/// Media descriptor attached to a bridge message event.
#[derive(Debug, Clone, Deserialize)]
struct BridgeMedia {
    /// Bridge media id, downloadable via `GET /media/{id}`.
    id: String,
    /// Provider media kind ("image", "video", "audio", "document", ...).
    #[serde(default)]
    kind: String,
    /// MIME type, when the bridge knows it.
    #[serde(default)]
    mime_type: String,
    /// Caption, when present.
    #[serde(default)]
    caption: Option<String>,
}

/// Response envelope from the bridge command API.
#[derive(Debug, Deserialize)]
struct BridgeResponse<T> {
    #[serde(default)]
    #[allow(dead_code)]
    success: bool,
    #[serde(default)]
    data: Option<T>,
    #[serde(default)]
    error: Option<String>,
}

/// Connection status from the bridge.
#[derive(Debug, Default, Deserialize)]
struct BridgeStatus {
    #[serde(default)]
    connected: bool,
    #[serde(default)]
    phone_number: Option<String>,
}

/// Send command response payload.
#[derive(Debug, Default, Deserialize)]
struct BridgeSendData {
    #[serde(default)]
    message_id: String,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Derive the WebSocket event stream URL from the bridge base URL.
fn events_url(base_url: &str) -> String {
    let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base_url.to_string()
    };
    format!("{}/events", ws_base.trim_end_matches('/'))
}

/// Normalize a recipient to a session JID.
fn to_jid(to: &str) -> String {
    let to = to.trim();
    if to.contains('@') {
        to.to_string()
    } else {
        let digits: String = to.chars().filter(|c| c.is_ascii_digit()).collect();
        format!("{digits}@c.us")
    }
}

/// Exponential backoff delay for a reconnect attempt.
fn backoff_delay(attempt: u32) -> Duration {
    let secs = BASE_RECONNECT_DELAY_SECS
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(MAX_RECONNECT_DELAY_SECS);
    Duration::from_secs(secs)
}

/// Normalize a bridge "message" event into the canonical DTO, without media
/// resolution. Returns `None` for self-echoes and events with nothing to say.
fn normalize_message_event(event: &BridgeEvent) -> Option<InboundMessage> {
    // Echoes of our own sends arrive on the same stream; drop them before
    // normalization.
    if event.from_me {
        return None;
    }

    let from = event.from.as_deref().unwrap_or("").trim().to_string();
    if from.is_empty() {
        return None;
    }

    let kind = event
        .media
        .as_ref()
        .map(|m| ContentKind::parse(&m.kind))
        .unwrap_or(ContentKind::Text);

    let body = event.content.as_deref().unwrap_or("").trim().to_string();
    let content = if !body.is_empty() {
        body
    } else if let Some(ref media) = event.media {
        media
            .caption
            .clone()
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| kind.placeholder().to_string())
    } else {
        return None;
    };

    let timestamp = event
        .timestamp
        .map(timestamp_from_epoch)
        .unwrap_or_else(chrono::Utc::now);

    let mut inbound = InboundMessage::new(&from, &content, kind, timestamp);
    if let Some(ref mid) = event.message_id {
        if !mid.is_empty() {
            inbound = inbound.with_external_message_id(mid);
        }
    }
    if let Some(ref name) = event.sender_name {
        if !name.is_empty() {
            inbound = inbound.with_sender_name(name);
        }
    }
    if let Some(ts) = event.timestamp {
        inbound = inbound.with_metadata("provider_timestamp", ts.to_string());
    }
    Some(inbound)
}

// ---------------------------------------------------------------------------
// Event handling
// ---------------------------------------------------------------------------

/// Per-event dispatch shared between the live WebSocket loop and tests.
#[derive(Clone)]
struct SessionEventHandler {
    channel_id: i64,
    pipeline: Arc<IngestPipeline>,
    client: Client,
    base_url: String,
    connected: Arc<AtomicBool>,
}

impl SessionEventHandler {
    /// Download a media payload from the bridge and encode it as a data URL.
    async fn fetch_media(&self, media: &BridgeMedia) -> Result<String> {
        let url = format!("{}/media/{}", self.base_url, media.id);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(OmniError::Channel(format!(
                "media download failed with HTTP {}",
                response.status()
            )));
        }
        let bytes = response.bytes().await?;
        let mime = if media.mime_type.is_empty() {
            "application/octet-stream"
        } else {
            &media.mime_type
        };
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        Ok(format!("data:{mime};base64,{encoded}"))
    }

    /// Resolve a message event's media synchronously before normalization
    /// hands off to the pipeline. A download failure must not drop the
    /// message: it is delivered with its original textual content.
    async fn attach_media(&self, inbound: &mut InboundMessage, media: &BridgeMedia) {
        match self.fetch_media(media).await {
            Ok(data_url) => inbound.media_url = Some(data_url),
            Err(e) => {
                warn!(
                    channel_id = self.channel_id,
                    media_id = %media.id,
                    error = %e,
                    "media download failed, delivering message without media"
                );
            }
        }
    }

    /// Dispatch one bridge event. Returns `false` when the event signals the
    /// session dropped and the stream should reconnect.
    async fn handle_event(&self, event: BridgeEvent) -> bool {
        match event.event_type.as_str() {
            "message" => {
                if let Some(mut inbound) = normalize_message_event(&event) {
                    if let Some(ref media) = event.media {
                        self.attach_media(&mut inbound, media).await;
                    }
                    self.pipeline.ingest_message(self.channel_id, inbound).await;
                }
                true
            }
            "ack" => {
                if let (Some(mid), Some(ack)) = (event.message_id.as_deref(), event.ack) {
                    let update =
                        StatusUpdate::new(mid, DeliveryStatus::from_ack(ack), chrono::Utc::now());
                    self.pipeline.ingest_status(self.channel_id, update).await;
                }
                true
            }
            "qr" => {
                info!(
                    channel_id = self.channel_id,
                    code = event.data.as_deref().unwrap_or(""),
                    "pairing code received, scan it with your phone"
                );
                true
            }
            "ready" | "connected" => {
                info!(channel_id = self.channel_id, "session is live");
                self.connected.store(true, Ordering::SeqCst);
                true
            }
            "disconnected" => {
                warn!(
                    channel_id = self.channel_id,
                    reason = event.reason.as_deref().unwrap_or("unknown"),
                    "session dropped"
                );
                self.connected.store(false, Ordering::SeqCst);
                false
            }
            other => {
                debug!(channel_id = self.channel_id, event = other, "unknown bridge event");
                true
            }
        }
    }
}

/// Event stream loop: subscribe to the bridge WebSocket, dispatch events,
/// reconnect with exponential backoff until shutdown.
async fn run_event_loop(
    ws_url: String,
    handler: SessionEventHandler,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut reconnect_attempt: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        let ws_stream = tokio::select! {
            _ = shutdown_rx.changed() => return,
            result = connect_async(&ws_url) => {
                match result {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!(error = %e, "bridge event stream connect failed");
                        let delay = backoff_delay(reconnect_attempt);
                        reconnect_attempt = (reconnect_attempt + 1).min(MAX_RECONNECT_ATTEMPTS);
                        tokio::select! {
                            _ = shutdown_rx.changed() => return,
                            _ = tokio::time::sleep(delay) => continue,
                        }
                    }
                }
            }
        };

        info!(url = %ws_url, "bridge event stream connected");
        reconnect_attempt = 0;

        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
                msg = ws_reader.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(raw))) => {
                            match serde_json::from_str::<BridgeEvent>(&raw) {
                                Ok(event) => {
                                    if !handler.handle_event(event).await {
                                        break; // session dropped, reconnect
                                    }
                                }
                                Err(e) => {
                                    debug!(error = %e, "unparseable bridge event");
                                }
                            }
                        }
                        Some(Ok(WsMessage::Ping(payload))) => {
                            if let Err(e) = ws_writer.send(WsMessage::Pong(payload)).await {
                                warn!(error = %e, "pong send failed");
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            info!(?frame, "bridge event stream closed");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "bridge event stream error");
                            break;
                        }
                        None => {
                            warn!("bridge event stream ended");
                            break;
                        }
                    }
                }
            }
        }

        handler.connected.store(false, Ordering::SeqCst);

        let delay = backoff_delay(reconnect_attempt);
        reconnect_attempt = (reconnect_attempt + 1).min(MAX_RECONNECT_ATTEMPTS);
        info!(delay_secs = delay.as_secs(), "reconnecting to bridge event stream");
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            _ = tokio::time::sleep(delay) => {},
        }
    }
}

// ---------------------------------------------------------------------------
// SessionAdapter
// ---------------------------------------------------------------------------

/// Session-based adapter backed by a paired bridge session.
pub struct SessionAdapter {
    channel_id: i64,
    config: SessionBridgeConfig,
    pipeline: Arc<IngestPipeline>,
    client: Client,
    /// Live session handle presence, driven by ready/disconnected events.
    connected: Arc<AtomicBool>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl SessionAdapter {
    /// Creates a new session adapter for the given channel.
    pub fn new(channel_id: i64, config: SessionBridgeConfig, pipeline: Arc<IngestPipeline>) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build bridge HTTP client with timeouts, using default");
                Client::new()
            });
        Self {
            channel_id,
            config,
            pipeline,
            client,
            connected: Arc::new(AtomicBool::new(false)),
            shutdown_tx: Mutex::new(None),
        }
    }

    fn base_url(&self) -> String {
        self.config.bridge_url.trim_end_matches('/').to_string()
    }

    fn require_connected(&self) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(OmniError::NotConnected(
                "session is not live (bridge not ready or pairing pending)".to_string(),
            ));
        }
        Ok(())
    }

    /// Probe the bridge command API, retrying with a fixed delay.
    async fn probe_bridge(&self) -> Result<()> {
        let url = format!("{}/status", self.base_url());
        for attempt in 0..PROBE_RETRIES {
            match self.client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let body: BridgeResponse<BridgeStatus> = resp.json().await.unwrap_or(
                        BridgeResponse {
                            success: false,
                            data: None,
                            error: None,
                        },
                    );
                    if let Some(status) = body.data {
                        if status.connected {
                            info!(
                                channel_id = self.channel_id,
                                phone = status.phone_number.as_deref().unwrap_or(""),
                                "bridge session already paired"
                            );
                            self.connected.store(true, Ordering::SeqCst);
                        } else {
                            info!(
                                channel_id = self.channel_id,
                                "bridge reachable, waiting for pairing"
                            );
                        }
                    }
                    return Ok(());
                }
                Ok(resp) => {
                    debug!(status = %resp.status(), "bridge probe returned an error status");
                }
                Err(e) => {
                    debug!(error = %e, attempt, "bridge probe failed");
                }
            }
            if attempt < PROBE_RETRIES.saturating_sub(1) {
                tokio::time::sleep(Duration::from_millis(PROBE_DELAY_MS)).await;
            }
        }
        Err(OmniError::Connectivity(format!(
            "session bridge unreachable at {}",
            self.base_url()
        )))
    }

    /// POST a bridge command and extract the send payload.
    async fn post_send(&self, path: &str, body: &Value) -> Result<String> {
        let url = format!("{}{path}", self.base_url());
        let response = self.client.post(&url).json(body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(OmniError::Send(format!("bridge rejected send ({status}): {body}")));
        }
        let envelope: BridgeResponse<BridgeSendData> = response.json().await?;
        match envelope.data {
            Some(data) if !data.message_id.is_empty() => Ok(data.message_id),
            _ => Err(OmniError::Send(
                envelope
                    .error
                    .unwrap_or_else(|| "bridge response missing message id".to_string()),
            )),
        }
    }
}

#[async_trait]
impl ChannelAdapter for SessionAdapter {
    fn name(&self) -> &str {
        "whatsapp"
    }

    fn channel_id(&self) -> i64 {
        self.channel_id
    }

    async fn initialize(&self) -> Result<()> {
        info!(channel_id = self.channel_id, "initializing session adapter");

        if self.config.session_path.trim().is_empty() {
            return Err(OmniError::Config(
                "session storage path is not configured".to_string(),
            ));
        }
        std::fs::create_dir_all(&self.config.session_path)?;

        self.probe_bridge().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown_tx.lock().await = Some(shutdown_tx);

        let handler = SessionEventHandler {
            channel_id: self.channel_id,
            pipeline: Arc::clone(&self.pipeline),
            client: self.client.clone(),
            base_url: self.base_url(),
            connected: Arc::clone(&self.connected),
        };
        tokio::spawn(run_event_loop(
            events_url(&self.config.bridge_url),
            handler,
            shutdown_rx,
        ));

        info!(channel_id = self.channel_id, "session adapter initialized");
        Ok(())
    }

    async fn send_message(
        &self,
        to: &str,
        body: &str,
        options: Option<SendOptions>,
    ) -> Result<String> {
        self.require_connected()?;

        let jid = to_jid(to);
        if jid == "@c.us" {
            return Err(OmniError::Send("recipient cannot be empty".to_string()));
        }

        let message_id = self
            .post_send("/send", &json!({ "to": jid, "body": body }))
            .await?;
        info!(channel_id = self.channel_id, to = %jid, %message_id, "session message sent");

        let options = options.unwrap_or_default();
        let result = self
            .pipeline
            .record_outbound(OutboundRecord {
                channel_id: self.channel_id,
                to: &jid,
                external_message_id: &message_id,
                kind: options.kind.unwrap_or(ContentKind::Text),
                content: body,
                media_url: options.media_url.as_deref(),
                metadata: options.metadata.unwrap_or(Value::Null),
            })
            .await;
        if let Err(e) = result {
            warn!(channel_id = self.channel_id, error = %e, "failed to record outbound message");
        }

        Ok(message_id)
    }

    async fn send_media(
        &self,
        to: &str,
        media: &str,
        caption: Option<&str>,
        kind: ContentKind,
    ) -> Result<String> {
        self.require_connected()?;

        // Remote URLs would require a fetch step this adapter does not have;
        // only a self-contained inline payload is accepted.
        if media.starts_with("http://") || media.starts_with("https://") {
            return Err(OmniError::Unsupported(
                "remote-URL media is not supported on the session channel; \
                 provide an inline data URL payload"
                    .to_string(),
            ));
        }
        if !media.starts_with("data:") {
            return Err(OmniError::InvalidMediaSource(
                "session media must be a data URL payload".to_string(),
            ));
        }

        let jid = to_jid(to);
        let message_id = self
            .post_send(
                "/send-media",
                &json!({
                    "to": jid,
                    "payload": media,
                    "caption": caption,
                    "kind": kind.as_str(),
                }),
            )
            .await?;
        info!(channel_id = self.channel_id, to = %jid, %message_id, "session media sent");

        let content = caption
            .map(str::to_string)
            .unwrap_or_else(|| kind.placeholder().to_string());
        let result = self
            .pipeline
            .record_outbound(OutboundRecord {
                channel_id: self.channel_id,
                to: &jid,
                external_message_id: &message_id,
                kind,
                content: &content,
                media_url: None,
                metadata: Value::Null,
            })
            .await;
        if let Err(e) = result {
            warn!(channel_id = self.channel_id, error = %e, "failed to record outbound media");
        }

        Ok(message_id)
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(true);
        }
        self.connected.store(false, Ordering::SeqCst);
        info!(channel_id = self.channel_id, "session adapter disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ===========================================================================
// Tests
// ===========================================================================
