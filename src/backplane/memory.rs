//! In-process bus for tests and single-host demos.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use log::trace;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::{Backplane, BackplaneError};

#[derive(Debug, Default)]
struct Bus {
    next_client: AtomicU64,
    /// channel → (client id, sender)
    subscribers: DashMap<String, Vec<(u64, UnboundedSender<Bytes>)>>,
}

/// A bus shared by every [`InMemoryBackplaneClient`] created from it.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackplane {
    bus: Arc<Bus>,
}

impl InMemoryBackplane {
    /// Empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// A new subscriber identity, standing in for one server.
    pub fn client(&self) -> InMemoryBackplaneClient {
        InMemoryBackplaneClient {
            id: self.bus.next_client.fetch_add(1, Ordering::Relaxed),
            bus: Arc::clone(&self.bus),
        }
    }

    /// Subscriptions currently open on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.bus.subscribers.get(channel).map_or(0, |s| s.len())
    }
}

/// One server's view of an [`InMemoryBackplane`].
#[derive(Debug, Clone)]
pub struct InMemoryBackplaneClient {
    id: u64,
    bus: Arc<Bus>,
}

#[async_trait]
impl Backplane for InMemoryBackplaneClient {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BackplaneError> {
        if let Some(mut subscribers) = self.bus.subscribers.get_mut(channel) {
            subscribers.retain(|(_, tx)| tx.send(payload.clone()).is_ok());
            trace!(
                "[Backplane] {channel}: {} bytes to {} subscriber(s)",
                payload.len(),
                subscribers.len()
            );
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<UnboundedReceiver<Bytes>, BackplaneError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.bus.subscribers.entry(channel.to_string()).or_default();
        subscribers.retain(|(id, _)| *id != self.id);
        subscribers.push((self.id, tx));
        Ok(rx)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BackplaneError> {
        self.bus
            .subscribers
            .remove_if_mut(channel, |_, subscribers| {
                subscribers.retain(|(id, _)| *id != self.id);
                subscribers.is_empty()
            });
        Ok(())
    }
}
