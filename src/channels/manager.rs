//! Channel manager.
//!
//! Owns the single authoritative mapping from channel id to at most one live
//! adapter instance, and mediates adapter construction, initialization, and
//! teardown. Constructed once at process start and shared as an `Arc`; there
//! is no global registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{OmniError, Result};
use crate::ingest::IngestPipeline;
use crate::store::Store;

use super::adapter::ChannelAdapter;
use super::cloud::CloudApiAdapter;
use super::session::SessionAdapter;

/// Registry mapping channel ids to live adapter instances.
///
/// Invariant: at most one adapter exists per channel id process-wide. The
/// claim set makes the no-op-if-present check atomic against concurrent
/// `initialize_channel` calls for the same id, so two callers can never
/// construct two adapters.
pub struct ChannelManager {
    store: Store,
    pipeline: Arc<IngestPipeline>,
    config: Config,
    /// Registered, initialized adapters.
    adapters: RwLock<HashMap<i64, Arc<dyn ChannelAdapter>>>,
    /// Channel ids that are registered or mid-initialization.
    claimed: Mutex<HashSet<i64>>,
}

impl ChannelManager {
    /// Creates a new manager over the given store, pipeline, and config.
    pub fn new(store: Store, pipeline: Arc<IngestPipeline>, config: Config) -> Self {
        Self {
            store,
            pipeline,
            config,
            adapters: RwLock::new(HashMap::new()),
            claimed: Mutex::new(HashSet::new()),
        }
    }

    /// Initialize the adapter for one channel and register it.
    ///
    /// A channel that is already registered (or mid-initialization) is a
    /// logged no-op. Construction and `initialize()` failures propagate to
    /// the caller and leave no partial registration behind.
    ///
    /// # Errors
    ///
    /// `OmniError::NotFound` when no channel row exists,
    /// `OmniError::InactiveChannel` when the channel is disabled, plus
    /// whatever the adapter's `initialize()` surfaces.
    pub async fn initialize_channel(&self, channel_id: i64) -> Result<()> {
        let channel = self
            .store
            .channel_by_id(channel_id)
            .await?
            .ok_or_else(|| OmniError::NotFound(format!("channel {channel_id} not found")))?;

        if !channel.active {
            return Err(OmniError::InactiveChannel(format!(
                "channel {} ({channel_id}) is not active",
                channel.name
            )));
        }

        // Atomic claim: the id enters the set before construction starts and
        // leaves it only on failure or removal.
        {
            let mut claimed = self.claimed.lock().await;
            if !claimed.insert(channel_id) {
                warn!(
                    channel = %channel.name,
                    channel_id,
                    "channel already initialized, skipping"
                );
                return Ok(());
            }
        }

        let result = self.construct_and_initialize(&channel).await;
        match result {
            Ok(adapter) => {
                self.adapters.write().await.insert(channel_id, adapter);
                info!(channel = %channel.name, channel_id, "channel initialized");
                Ok(())
            }
            Err(e) => {
                self.claimed.lock().await.remove(&channel_id);
                Err(e)
            }
        }
    }

    /// Select the concrete adapter for a channel, construct it, and run its
    /// `initialize()`.
    async fn construct_and_initialize(
        &self,
        channel: &crate::model::Channel,
    ) -> Result<Arc<dyn ChannelAdapter>> {
        let adapter: Arc<dyn ChannelAdapter> = match channel.name.to_lowercase().as_str() {
            "whatsapp" => {
                // Hosted Cloud API when configured, session bridge otherwise.
                let use_cloud =
                    channel.config_flag("use_cloud_api") || self.config.use_cloud_api_default();
                if use_cloud {
                    info!(channel_id = channel.id, "using hosted Cloud API for channel");
                    Arc::new(CloudApiAdapter::new(
                        channel.id,
                        self.config.cloud.clone(),
                        Arc::clone(&self.pipeline),
                    ))
                } else {
                    info!(channel_id = channel.id, "using session bridge for channel");
                    Arc::new(SessionAdapter::new(
                        channel.id,
                        self.config.session.clone(),
                        Arc::clone(&self.pipeline),
                    ))
                }
            }
            "whatsapp-cloud" => Arc::new(CloudApiAdapter::new(
                channel.id,
                self.config.cloud.clone(),
                Arc::clone(&self.pipeline),
            )),
            other => {
                return Err(OmniError::Channel(format!("unknown channel type: {other}")));
            }
        };

        adapter.initialize().await?;
        Ok(adapter)
    }

    /// Initialize every active channel, isolating failures per channel.
    pub async fn initialize_all_channels(&self) -> Result<()> {
        let channels = self.store.channels_all().await?;
        let active: Vec<_> = channels.into_iter().filter(|c| c.active).collect();
        info!(count = active.len(), "initializing active channels");

        for channel in active {
            if let Err(e) = self.initialize_channel(channel.id).await {
                error!(channel = %channel.name, channel_id = channel.id, error = %e,
                    "failed to initialize channel");
            }
        }
        Ok(())
    }

    /// Returns the registered adapter for a channel, or `None` when the
    /// channel is not ready. Absence is not an error.
    pub async fn get_adapter(&self, channel_id: i64) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.read().await.get(&channel_id).cloned()
    }

    /// Returns the ids of all registered channels.
    pub async fn channel_ids(&self) -> Vec<i64> {
        self.adapters.read().await.keys().copied().collect()
    }

    /// Disconnect and deregister one channel. Disconnect failures are logged
    /// and non-fatal.
    pub async fn remove_channel(&self, channel_id: i64) -> Result<()> {
        let adapter = self.adapters.write().await.remove(&channel_id);
        if let Some(adapter) = adapter {
            if let Err(e) = adapter.disconnect().await {
                warn!(channel_id, error = %e, "adapter disconnect failed");
            }
            self.claimed.lock().await.remove(&channel_id);
            info!(channel_id, "channel removed");
        }
        Ok(())
    }

    /// Pre-registers an adapter, as if `initialize_channel` succeeded.
    #[cfg(test)]
    pub(crate) async fn register_for_test(
        &self,
        channel_id: i64,
        adapter: Arc<dyn ChannelAdapter>,
    ) {
        self.claimed.lock().await.insert(channel_id);
        self.adapters.write().await.insert(channel_id, adapter);
    }

    /// Disconnect all adapters concurrently and clear the registry.
    pub async fn shutdown(&self) {
        info!("shutting down all channels");
        let adapters: Vec<(i64, Arc<dyn ChannelAdapter>)> =
            self.adapters.write().await.drain().collect();

        let disconnects = adapters.iter().map(|(channel_id, adapter)| {
            let channel_id = *channel_id;
            let adapter = Arc::clone(adapter);
            async move {
                if let Err(e) = adapter.disconnect().await {
                    warn!(channel_id, error = %e, "adapter disconnect failed during shutdown");
                }
            }
        });
        futures::future::join_all(disconnects).await;

        self.claimed.lock().await.clear();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
