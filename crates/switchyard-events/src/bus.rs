//! Event bus for broadcasting events to subscribers.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::event::SwitchyardEvent;

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Event bus for broadcasting events to all subscribers.
///
/// Cloning the bus yields a handle onto the same channel. Events are
/// delivered to every receiver in publish order.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<SwitchyardEvent>>,
    capacity: usize,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with specified capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Publish an event to all subscribers.
    ///
    /// Returns the number of receivers that received the event.
    pub fn publish(&self, event: SwitchyardEvent) -> usize {
        let event = Arc::new(event);

        trace!(event_type = %event.event_type(), "Publishing event");

        if let Ok(c) = self.sender.send(Arc::clone(&event)) {
            debug!(
                event_type = %event.event_type(),
                receiver_count = c,
                "Event published"
            );
            c
        } else {
            trace!(event_type = %event.event_type(), "No receivers for event");
            0
        }
    }

    /// Subscribe to all events.
    #[must_use]
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver::new(self.sender.subscribe(), None)
    }

    /// Subscribe to plugin messages matching a topic pattern.
    ///
    /// The pattern is either an exact topic (`plugin:stats:report`) or a
    /// trailing wildcard (`plugin:stats:*`). Events without a topic are
    /// never delivered to a topic receiver.
    #[must_use]
    pub fn subscribe_topic(&self, topic_pattern: impl Into<String>) -> EventReceiver {
        EventReceiver::new(self.sender.subscribe(), Some(topic_pattern.into()))
    }

    /// Current number of receivers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Get the channel capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver for events from the event bus.
pub struct EventReceiver {
    receiver: broadcast::Receiver<Arc<SwitchyardEvent>>,
    topic_pattern: Option<String>,
}

impl EventReceiver {
    fn new(
        receiver: broadcast::Receiver<Arc<SwitchyardEvent>>,
        topic_pattern: Option<String>,
    ) -> Self {
        Self {
            receiver,
            topic_pattern,
        }
    }

    fn matches(&self, event: &SwitchyardEvent) -> bool {
        let Some(pattern) = &self.topic_pattern else {
            return true;
        };
        let Some(topic) = event.topic() else {
            return false;
        };
        match pattern.strip_suffix('*') {
            Some(prefix) => topic.starts_with(prefix),
            None => topic == pattern,
        }
    }

    /// Receive the next matching event.
    ///
    /// Returns `None` once the bus is closed. Lagged events are skipped.
    pub async fn recv(&mut self) -> Option<Arc<SwitchyardEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                },
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!(skipped = count, "Event receiver lagged, events dropped");
                },
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive the next matching event without blocking.
    pub fn try_recv(&mut self) -> Option<Arc<SwitchyardEvent>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                },
                Err(broadcast::error::TryRecvError::Lagged(count)) => {
                    warn!(skipped = count, "Event receiver lagged, events dropped");
                },
                Err(
                    broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed,
                ) => return None,
            }
        }
    }

    /// Drain every event currently buffered.
    pub fn drain(&mut self) -> Vec<Arc<SwitchyardEvent>> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventMetadata;
    use serde_json::json;

    fn message(plugin: &str, topic: &str) -> SwitchyardEvent {
        SwitchyardEvent::PluginMessage {
            metadata: EventMetadata::new("test"),
            plugin_id: plugin.into(),
            topic: topic.into(),
            payload: json!({}),
        }
    }

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        let count = bus.publish(SwitchyardEvent::PluginEnabled {
            metadata: EventMetadata::new("test"),
            plugin_id: "a".into(),
        });
        assert_eq!(count, 1);

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.event_type(), "plugin_enabled");
    }

    #[test]
    fn test_publish_without_receivers() {
        let bus = EventBus::with_capacity(8);
        assert_eq!(bus.capacity(), 8);
        assert_eq!(bus.publish(message("a", "plugin:a:x")), 0);
    }

    #[tokio::test]
    async fn test_topic_filter_exact_and_wildcard() {
        let bus = EventBus::new();
        let mut exact = bus.subscribe_topic("plugin:a:ping");
        let mut wildcard = bus.subscribe_topic("plugin:a:*");

        bus.publish(SwitchyardEvent::PluginEnabled {
            metadata: EventMetadata::new("test"),
            plugin_id: "a".into(),
        });
        bus.publish(message("b", "plugin:b:ping"));
        bus.publish(message("a", "plugin:a:pong"));
        bus.publish(message("a", "plugin:a:ping"));

        let got: Vec<_> = wildcard
            .drain()
            .iter()
            .filter_map(|e| e.topic().map(str::to_owned))
            .collect();
        assert_eq!(got, vec!["plugin:a:pong", "plugin:a:ping"]);

        let got = exact.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].topic(), Some("plugin:a:ping"));
    }

    #[test]
    fn test_clone_shares_channel() {
        let bus = EventBus::new();
        let clone = bus.clone();
        let mut receiver = bus.subscribe();
        assert_eq!(clone.subscriber_count(), 1);

        clone.publish(message("a", "plugin:a:x"));
        assert!(receiver.try_recv().is_some());
        assert!(receiver.try_recv().is_none());
    }
}
