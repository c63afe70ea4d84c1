//! Omnibox - unified messaging inbox service
//!
//! Ingests messages from multiple messaging provider integrations,
//! normalizes them into a single canonical conversation/message model, and
//! exposes a uniform send/receive contract regardless of provider.

pub mod channels;
pub mod config;
pub mod error;
pub mod ingest;
pub mod model;
pub mod store;

pub use channels::{ChannelAdapter, ChannelManager, CloudApiAdapter, SendOptions, SessionAdapter, WebhookServer};
pub use config::Config;
pub use error::{OmniError, Result};
pub use ingest::{InboundEvent, IngestPipeline, OutboundRecord, StatusEvent};
pub use model::{
    Channel, ContentKind, Conversation, ConversationStatus, DeliveryStatus, Direction,
    InboundMessage, MessageRecord, StatusUpdate,
};
pub use store::Store;
