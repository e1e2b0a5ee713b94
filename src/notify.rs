use crate::{lock::LockEvent, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

/// Fan-out of lock lifecycle events to live subscribers. Both publishes
/// are fire-and-forget: the caller logs failures and moves on, and a
/// topic with no subscribers swallows the event.
#[async_trait]
pub trait NotificationSink: Send + Sync + std::fmt::Debug {
    async fn publish_to_session(&self, session_id: &str, event: LockEvent) -> Result<()>;

    /// Direct delivery to one holder, e.g. telling a displaced holder its
    /// lease was forcibly taken.
    async fn publish_to_holder(&self, holder_id: &str, event: LockEvent) -> Result<()>;
}

const SUBSCRIBER_BUFFER: usize = 64;

/// Broadcast-channel notifier. One channel per session topic and one per
/// holder topic; a subscriber that lags past the buffer drops events
/// instead of blocking publishers.
#[derive(Debug, Default)]
pub struct ChannelNotifier {
    sessions: DashMap<String, broadcast::Sender<LockEvent>>,
    holders: DashMap<String, broadcast::Sender<LockEvent>>,
}

impl ChannelNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_session(&self, session_id: &str) -> broadcast::Receiver<LockEvent> {
        Self::subscribe(&self.sessions, session_id)
    }

    pub fn subscribe_holder(&self, holder_id: &str) -> broadcast::Receiver<LockEvent> {
        Self::subscribe(&self.holders, holder_id)
    }

    fn subscribe(
        topics: &DashMap<String, broadcast::Sender<LockEvent>>,
        key: &str,
    ) -> broadcast::Receiver<LockEvent> {
        topics
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_BUFFER).0)
            .subscribe()
    }

    fn publish(topics: &DashMap<String, broadcast::Sender<LockEvent>>, key: &str, event: LockEvent) {
        if let Some(sender) = topics.get(key) {
            // Err means no live receivers on this topic; that is fine.
            let _ = sender.send(event);
        }
    }
}

#[async_trait]
impl NotificationSink for ChannelNotifier {
    async fn publish_to_session(&self, session_id: &str, event: LockEvent) -> Result<()> {
        Self::publish(&self.sessions, session_id, event);
        Ok(())
    }

    async fn publish_to_holder(&self, holder_id: &str, event: LockEvent) -> Result<()> {
        Self::publish(&self.holders, holder_id, event);
        Ok(())
    }
}
