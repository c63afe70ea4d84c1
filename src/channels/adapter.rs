//! Channel adapter contract.
//!
//! Every provider integration implements [`ChannelAdapter`]. The contract
//! covers lifecycle (initialize/disconnect/is_connected) and outbound sends;
//! inbound delivery goes through the shared [`IngestPipeline`] each concrete
//! adapter composes, so observer registration lives on the pipeline rather
//! than on the adapter.
//!
//! [`IngestPipeline`]: crate::ingest::IngestPipeline

use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;

use crate::error::Result;
use crate::model::ContentKind;

/// The `ChannelAdapter` trait defines the shared capability set every
/// provider integration offers.
///
/// Adapters are shared as `Arc<dyn ChannelAdapter>` handles, so all methods
/// take `&self`; concrete adapters use interior mutability for their
/// connection state.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Returns the adapter's provider name (e.g. "whatsapp-cloud").
    fn name(&self) -> &str;

    /// Returns the channel id this adapter serves.
    fn channel_id(&self) -> i64;

    /// Establishes readiness to send and receive: credential check,
    /// connection handshake, or session restore.
    ///
    /// Called at most once per adapter lifetime; the channel manager
    /// enforces this.
    ///
    /// # Errors
    ///
    /// `OmniError::Config` when required credentials are absent;
    /// `OmniError::Connectivity` when the provider is unreachable.
    async fn initialize(&self) -> Result<()>;

    /// Dispatches a text message through the provider and returns the
    /// provider-assigned message id.
    ///
    /// Successful sends are durably recorded as outbound messages through
    /// the pipeline's bookkeeping path.
    ///
    /// # Errors
    ///
    /// `OmniError::Send` (carrying the provider's diagnostic payload) when
    /// the provider rejects the request; `OmniError::NotConnected` when
    /// invoked before `initialize` succeeds or after `disconnect`.
    async fn send_message(
        &self,
        to: &str,
        body: &str,
        options: Option<SendOptions>,
    ) -> Result<String>;

    /// Dispatches a media message through the provider and returns the
    /// provider-assigned message id.
    ///
    /// The accepted shape of `media` is adapter-specific: the cloud adapter
    /// takes an HTTP(S) URL, the session adapter takes an inline payload.
    ///
    /// # Errors
    ///
    /// As [`send_message`](Self::send_message), plus
    /// `OmniError::InvalidMediaSource` / `OmniError::Unsupported` for
    /// capability mismatches.
    async fn send_media(
        &self,
        to: &str,
        media: &str,
        caption: Option<&str>,
        kind: ContentKind,
    ) -> Result<String>;

    /// Releases provider resources. Safe to call even if `initialize` never
    /// completed; `is_connected()` reports false afterwards.
    ///
    /// Does not abort in-flight ingestion of events already received; it
    /// only stops accepting new ones.
    async fn disconnect(&self) -> Result<()>;

    /// Non-blocking readiness probe. Provider-specific: credential presence
    /// for the cloud adapter, live session handle for the session adapter.
    fn is_connected(&self) -> bool;

    /// Concrete-type access for provider-specific operations (e.g. the
    /// webhook surface reaching the cloud adapter's verification handler).
    fn as_any(&self) -> &dyn Any;
}

/// Optional parameters for [`ChannelAdapter::send_message`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Content kind override (defaults to text)
    pub kind: Option<ContentKind>,
    /// Media reference recorded with the outbound message
    pub media_url: Option<String>,
    /// Caption recorded with the outbound message
    pub caption: Option<String>,
    /// Free-form metadata recorded with the outbound message
    pub metadata: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContentKind;

    #[test]
    fn test_send_options_default() {
        let options = SendOptions::default();
        assert!(options.kind.is_none());
        assert!(options.media_url.is_none());
        assert!(options.caption.is_none());
        assert!(options.metadata.is_none());
    }

    #[test]
    fn test_send_options_kind_override() {
        let options = SendOptions {
            kind: Some(ContentKind::Image),
            media_url: Some("https://example.com/a.png".to_string()),
            ..Default::default()
        };
        assert_eq!(options.kind, Some(ContentKind::Image));
    }
}
