//! Shared ingestion pipeline.
//!
//! Every adapter normalizes provider events into the canonical DTOs and
//! pushes them through this single entry point. The pipeline resolves the
//! conversation, persists the message, updates conversation recency, and fans
//! the event out to subscribers over bounded queues.
//!
//! Errors never propagate back to the adapter's event source: provider event
//! sources (webhook handlers, session streams) must always acknowledge
//! receipt, because providers retry unacknowledged deliveries and duplicate
//! retries are worse than a dropped log entry.

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{
    ContentKind, DeliveryStatus, Direction, InboundMessage, MessageRecord, StatusUpdate,
};
use crate::store::{NewMessage, Store};

/// Default queue capacity handed to subscribers.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 100;

/// A normalized inbound message tagged with its channel.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    /// Channel the message arrived on
    pub channel_id: i64,
    /// The normalized message
    pub message: InboundMessage,
}

/// A normalized status update tagged with its channel.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    /// Channel the update arrived on
    pub channel_id: i64,
    /// The normalized update
    pub update: StatusUpdate,
}

/// Parameters for recording a successful outbound send.
#[derive(Debug, Clone)]
pub struct OutboundRecord<'a> {
    /// Channel the message was sent on
    pub channel_id: i64,
    /// Recipient's provider-native identity
    pub to: &'a str,
    /// Provider-assigned message id
    pub external_message_id: &'a str,
    /// Canonical content kind
    pub kind: ContentKind,
    /// Textual content
    pub content: &'a str,
    /// Media reference, when present
    pub media_url: Option<&'a str>,
    /// Free-form metadata
    pub metadata: Value,
}

/// The shared ingestion pipeline.
///
/// Adapters compose this explicitly (no inheritance-style hooks): inbound
/// events call [`ingest_message`](Self::ingest_message) /
/// [`ingest_status`](Self::ingest_status), the outbound bookkeeping path
/// calls [`record_outbound`](Self::record_outbound).
///
/// Observers subscribe with [`subscribe_messages`](Self::subscribe_messages)
/// and receive events over a bounded queue; fan-out walks subscribers in
/// registration order, and a full or dropped subscriber queue is logged and
/// skipped so one misbehaving observer cannot block the others.
pub struct IngestPipeline {
    store: Store,
    message_taps: RwLock<Vec<mpsc::Sender<InboundEvent>>>,
    status_taps: RwLock<Vec<mpsc::Sender<StatusEvent>>>,
}

impl IngestPipeline {
    /// Creates a pipeline over the given store.
    pub fn new(store: Store) -> Self {
        Self {
            store,
            message_taps: RwLock::new(Vec::new()),
            status_taps: RwLock::new(Vec::new()),
        }
    }

    /// Returns the underlying store handle.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Register a message observer; returns its bounded event queue.
    pub async fn subscribe_messages(&self, capacity: usize) -> mpsc::Receiver<InboundEvent> {
        let (tx, rx) = mpsc::channel(capacity);
        self.message_taps.write().await.push(tx);
        rx
    }

    /// Register a status observer; returns its bounded event queue.
    pub async fn subscribe_statuses(&self, capacity: usize) -> mpsc::Receiver<StatusEvent> {
        let (tx, rx) = mpsc::channel(capacity);
        self.status_taps.write().await.push(tx);
        rx
    }

    /// Ingest a normalized inbound message: resolve-or-create the
    /// conversation, persist the message as delivered, update conversation
    /// recency, and fan out to message observers.
    ///
    /// Never returns an error; failures are logged at this boundary.
    pub async fn ingest_message(&self, channel_id: i64, message: InboundMessage) {
        info!(
            channel_id,
            from = %message.external_id,
            message_id = message.external_message_id.as_deref().unwrap_or(""),
            "inbound message"
        );

        if let Err(e) = self.persist_inbound(channel_id, &message).await {
            warn!(channel_id, error = %e, "failed to persist inbound message");
        }

        let event = InboundEvent { channel_id, message };
        fan_out(&self.message_taps, event, "message").await;
    }

    /// Ingest a normalized status update: fan out to status observers.
    ///
    /// Updates are not correlated back to stored messages by external
    /// message id; persisted status tracking is future work.
    pub async fn ingest_status(&self, channel_id: i64, update: StatusUpdate) {
        debug!(
            channel_id,
            message_id = %update.external_message_id,
            status = update.status.as_str(),
            "status update"
        );

        let event = StatusEvent { channel_id, update };
        fan_out(&self.status_taps, event, "status").await;
    }

    /// Record a successful outbound send as a durable message row, applying
    /// the identical resolve-or-create semantics as the inbound path so both
    /// directions land in the same conversation.
    pub async fn record_outbound(&self, rec: OutboundRecord<'_>) -> Result<MessageRecord> {
        let conversation = self
            .store
            .resolve_or_create_conversation(rec.channel_id, rec.to, Some(rec.to), &Value::Null)
            .await?;

        let record = self
            .store
            .insert_message(NewMessage {
                conversation_id: conversation.id,
                channel_id: rec.channel_id,
                external_message_id: Some(rec.external_message_id),
                direction: Direction::Outbound,
                kind: rec.kind,
                content: rec.content,
                media_url: rec.media_url,
                status: DeliveryStatus::Sent,
                metadata: rec.metadata,
            })
            .await?;

        self.store
            .touch_conversation(conversation.id, record.created_at)
            .await?;

        Ok(record)
    }

    /// The fallible inner half of [`ingest_message`](Self::ingest_message).
    async fn persist_inbound(&self, channel_id: i64, message: &InboundMessage) -> Result<()> {
        // The sender's external id doubles as the initial display name when
        // the provider supplied none.
        let contact_name = message.sender_name.as_deref().unwrap_or(&message.external_id);
        let metadata = Value::Object(message.metadata.clone());

        let conversation = self
            .store
            .resolve_or_create_conversation(
                channel_id,
                &message.external_id,
                Some(contact_name),
                &metadata,
            )
            .await?;

        // The inbound act itself constitutes delivery.
        self.store
            .insert_message(NewMessage {
                conversation_id: conversation.id,
                channel_id,
                external_message_id: message.external_message_id.as_deref(),
                direction: Direction::Inbound,
                kind: message.kind,
                content: &message.content,
                media_url: message.media_url.as_deref(),
                status: DeliveryStatus::Delivered,
                metadata,
            })
            .await?;

        self.store
            .touch_conversation(conversation.id, message.timestamp)
            .await?;

        Ok(())
    }
}

/// Walk subscriber queues in registration order; drop events for full queues
/// and unsubscribe closed ones.
async fn fan_out<T: Clone>(taps: &RwLock<Vec<mpsc::Sender<T>>>, event: T, label: &str) {
    let mut taps = taps.write().await;
    taps.retain(|tap| match tap.try_send(event.clone()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("{label} observer queue full, dropping event for that observer");
            true
        }
        Err(TrySendError::Closed(_)) => {
            debug!("{label} observer dropped, unsubscribing");
            false
        }
    });
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::timestamp_from_epoch;
    use chrono::Utc;

    async fn test_pipeline() -> (IngestPipeline, i64) {
        let store = Store::open_in_memory().await.unwrap();
        let channel = store
            .create_channel("whatsapp", "messaging", &Value::Null, true)
            .await
            .unwrap();
        (IngestPipeline::new(store), channel.id)
    }

    fn text_message(from: &str, content: &str) -> InboundMessage {
        InboundMessage::new(from, content, ContentKind::Text, Utc::now())
    }

    // -----------------------------------------------------------------------
    // 1. Inbound round-trip
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_ingest_round_trip() {
        let (pipeline, channel_id) = test_pipeline().await;
        let ts = timestamp_from_epoch(1_707_900_000);
        let msg = InboundMessage::new("+1555", "hello", ContentKind::Text, ts)
            .with_external_message_id("wamid.1");

        pipeline.ingest_message(channel_id, msg).await;

        let conv = pipeline
            .store()
            .conversation_by_external_id(channel_id, "+1555")
            .await
            .unwrap()
            .expect("conversation created");
        assert_eq!(conv.contact_name.as_deref(), Some("+1555"));
        assert_eq!(conv.last_message_at.map(|t| t.timestamp()), Some(ts.timestamp()));

        let messages = pipeline
            .store()
            .messages_by_conversation(conv.id, 10)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].direction, Direction::Inbound);
        assert_eq!(messages[0].kind, ContentKind::Text);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[0].status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn test_ingest_reuses_conversation() {
        let (pipeline, channel_id) = test_pipeline().await;
        pipeline.ingest_message(channel_id, text_message("+1555", "one")).await;
        pipeline.ingest_message(channel_id, text_message("+1555", "two")).await;

        let conv = pipeline
            .store()
            .conversation_by_external_id(channel_id, "+1555")
            .await
            .unwrap()
            .unwrap();
        let messages = pipeline
            .store()
            .messages_by_conversation(conv.id, 10)
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn test_ingest_uses_sender_name_when_present() {
        let (pipeline, channel_id) = test_pipeline().await;
        let msg = text_message("+1555", "hi").with_sender_name("John Doe");
        pipeline.ingest_message(channel_id, msg).await;

        let conv = pipeline
            .store()
            .conversation_by_external_id(channel_id, "+1555")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conv.contact_name.as_deref(), Some("John Doe"));
    }

    // -----------------------------------------------------------------------
    // 2. Concurrent resolve-or-create
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_concurrent_ingest_single_conversation() {
        let (pipeline, channel_id) = test_pipeline().await;
        let pipeline = std::sync::Arc::new(pipeline);

        let mut handles = Vec::new();
        for i in 0..16 {
            let p = std::sync::Arc::clone(&pipeline);
            handles.push(tokio::spawn(async move {
                p.ingest_message(channel_id, text_message("+1555", &format!("msg {i}")))
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let conv = pipeline
            .store()
            .conversation_by_external_id(channel_id, "+1555")
            .await
            .unwrap()
            .expect("exactly one conversation");
        let messages = pipeline
            .store()
            .messages_by_conversation(conv.id, 100)
            .await
            .unwrap();
        assert_eq!(messages.len(), 16);
    }

    // -----------------------------------------------------------------------
    // 3. Observer fan-out
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_message_fan_out() {
        let (pipeline, channel_id) = test_pipeline().await;
        let mut rx1 = pipeline.subscribe_messages(8).await;
        let mut rx2 = pipeline.subscribe_messages(8).await;

        pipeline.ingest_message(channel_id, text_message("+1555", "hello")).await;

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1.channel_id, channel_id);
        assert_eq!(e1.message.content, "hello");
        assert_eq!(e2.message.content, "hello");
    }

    #[tokio::test]
    async fn test_full_observer_does_not_block_others() {
        let (pipeline, channel_id) = test_pipeline().await;
        // First subscriber has room for a single event and never drains.
        let _rx_stuck = pipeline.subscribe_messages(1).await;
        let mut rx_ok = pipeline.subscribe_messages(8).await;

        pipeline.ingest_message(channel_id, text_message("+1555", "one")).await;
        pipeline.ingest_message(channel_id, text_message("+1555", "two")).await;

        // The healthy subscriber still sees both events.
        assert_eq!(rx_ok.recv().await.unwrap().message.content, "one");
        assert_eq!(rx_ok.recv().await.unwrap().message.content, "two");
    }

    #[tokio::test]
    async fn test_dropped_observer_unsubscribed() {
        let (pipeline, channel_id) = test_pipeline().await;
        let rx = pipeline.subscribe_messages(8).await;
        drop(rx);
        let mut rx_ok = pipeline.subscribe_messages(8).await;

        pipeline.ingest_message(channel_id, text_message("+1555", "still delivered")).await;
        assert_eq!(rx_ok.recv().await.unwrap().message.content, "still delivered");
        assert_eq!(pipeline.message_taps.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_status_fan_out_order_preserved() {
        let (pipeline, channel_id) = test_pipeline().await;
        let mut rx = pipeline.subscribe_statuses(8).await;

        for status in [
            DeliveryStatus::Sent,
            DeliveryStatus::Delivered,
            DeliveryStatus::Read,
            DeliveryStatus::Read,
        ] {
            pipeline
                .ingest_status(channel_id, StatusUpdate::new("wamid.1", status, Utc::now()))
                .await;
        }

        let seen: Vec<DeliveryStatus> = [
            rx.recv().await.unwrap().update.status,
            rx.recv().await.unwrap().update.status,
            rx.recv().await.unwrap().update.status,
            rx.recv().await.unwrap().update.status,
        ]
        .to_vec();
        assert_eq!(
            seen,
            vec![
                DeliveryStatus::Sent,
                DeliveryStatus::Delivered,
                DeliveryStatus::Read,
                DeliveryStatus::Read
            ]
        );
    }

    #[tokio::test]
    async fn test_status_not_correlated_to_rows() {
        let (pipeline, channel_id) = test_pipeline().await;
        pipeline
            .ingest_status(
                channel_id,
                StatusUpdate::new("wamid.unknown", DeliveryStatus::Read, Utc::now()),
            )
            .await;
        // No conversation or message row was created by a status update.
        let conv = pipeline
            .store()
            .conversation_by_external_id(channel_id, "wamid.unknown")
            .await
            .unwrap();
        assert!(conv.is_none());
    }

    // -----------------------------------------------------------------------
    // 4. Error swallowing at the pipeline boundary
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_persistence_failure_swallowed() {
        let (pipeline, channel_id) = test_pipeline().await;
        let mut rx = pipeline.subscribe_messages(8).await;
        pipeline.store().close().await;

        // Must not panic or propagate; observers are still notified.
        pipeline.ingest_message(channel_id, text_message("+1555", "lost write")).await;
        assert_eq!(rx.recv().await.unwrap().message.content, "lost write");
    }

    // -----------------------------------------------------------------------
    // 5. Outbound bookkeeping
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_record_outbound_creates_conversation() {
        let (pipeline, channel_id) = test_pipeline().await;
        let record = pipeline
            .record_outbound(OutboundRecord {
                channel_id,
                to: "+1555",
                external_message_id: "wamid.out",
                kind: ContentKind::Text,
                content: "hi there",
                media_url: None,
                metadata: Value::Null,
            })
            .await
            .unwrap();

        assert_eq!(record.direction, Direction::Outbound);
        assert_eq!(record.status, DeliveryStatus::Sent);

        let conv = pipeline
            .store()
            .conversation_by_external_id(channel_id, "+1555")
            .await
            .unwrap()
            .expect("conversation created by outbound bookkeeping");
        assert!(conv.last_message_at.is_some());
    }

    #[tokio::test]
    async fn test_outbound_and_inbound_share_conversation() {
        let (pipeline, channel_id) = test_pipeline().await;
        pipeline.ingest_message(channel_id, text_message("+1555", "question")).await;
        pipeline
            .record_outbound(OutboundRecord {
                channel_id,
                to: "+1555",
                external_message_id: "wamid.reply",
                kind: ContentKind::Text,
                content: "answer",
                media_url: None,
                metadata: Value::Null,
            })
            .await
            .unwrap();

        let conv = pipeline
            .store()
            .conversation_by_external_id(channel_id, "+1555")
            .await
            .unwrap()
            .unwrap();
        let messages = pipeline
            .store()
            .messages_by_conversation(conv.id, 10)
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
    }
}
