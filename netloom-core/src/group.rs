//! Connection registry keyed by channel identity.

use crate::channel::{Channel, ChannelId};

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Live channels. Each channel removes itself when it closes.
#[derive(Clone, Default)]
pub struct ChannelGroup {
    channels: Arc<DashMap<ChannelId, Channel>>,
}

impl ChannelGroup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `channel` until it closes.
    pub fn add(&self, channel: &Channel) {
        if self.channels.insert(channel.id(), channel.clone()).is_some() {
            return;
        }
        let channels = Arc::downgrade(&self.channels);
        channel.on_close(move |closed| {
            if let Some(channels) = channels.upgrade() {
                channels.remove(&closed.id());
            }
        });
    }

    #[must_use]
    pub fn get(&self, id: ChannelId) -> Option<Channel> {
        self.channels.get(&id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: ChannelId) -> Option<Channel> {
        self.channels.remove(&id).map(|(_, channel)| channel)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<ChannelId> {
        self.channels.iter().map(|entry| *entry.key()).collect()
    }

    /// Snapshot of the tracked channels.
    #[must_use]
    pub fn channels(&self) -> Vec<Channel> {
        self.channels.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Close every tracked channel.
    pub fn close_all(&self) {
        // Snapshot first: closing removes entries from the map.
        let channels = self.channels();
        debug!(count = channels.len(), "closing channel group");
        for channel in channels {
            channel.close();
        }
    }
}

impl std::fmt::Debug for ChannelGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelGroup")
            .field("len", &self.len())
            .finish()
    }
}
