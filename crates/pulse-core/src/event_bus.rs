//! In-process broadcast of "analytics changed" signals.
//!
//! Built on `tokio::broadcast`. Every mutating tracker or store operation
//! publishes one event after its writes land, so dashboards in the same
//! process can refresh without waiting for the next poll.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default capacity of the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// What changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticsEventType {
    SessionStarted,
    PageViewed,
    Heartbeat,
    SessionEnded,
    AnalyticsCleared,
}

/// A single event published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub id: Uuid,
    pub event_type: AnalyticsEventType,
    /// Session the change belongs to, if any.
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AnalyticsEvent {
    pub fn new(event_type: AnalyticsEventType, session_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            session_id,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AnalyticsEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new event bus with a custom channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers. Returns how many received it;
    /// publishing with no subscribers is not an error.
    pub fn publish(&self, event: AnalyticsEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Shorthand for publishing a change signal.
    pub fn notify(&self, event_type: AnalyticsEventType, session_id: Option<&str>) -> usize {
        self.publish(AnalyticsEvent::new(
            event_type,
            session_id.map(str::to_string),
        ))
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> broadcast::Receiver<AnalyticsEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_receive_roundtrip() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let event = AnalyticsEvent::new(AnalyticsEventType::SessionStarted, Some("s1".into()));
        let event_id = event.id;
        assert_eq!(bus.publish(event), 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, AnalyticsEventType::SessionStarted);
        assert_eq!(received.id, event_id);
        assert_eq!(received.session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.notify(AnalyticsEventType::AnalyticsCleared, None), 0);
    }

    #[tokio::test]
    async fn test_lagging_receiver_sees_lag_then_newest() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe();
        for _ in 0..3 {
            bus.notify(AnalyticsEventType::Heartbeat, Some("s1"));
        }
        bus.notify(AnalyticsEventType::SessionEnded, Some("s1"));

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
        assert_eq!(rx.recv().await.unwrap().event_type, AnalyticsEventType::Heartbeat);
        assert_eq!(rx.recv().await.unwrap().event_type, AnalyticsEventType::SessionEnded);
    }

    #[test]
    fn test_event_serialization() {
        let event = AnalyticsEvent::new(AnalyticsEventType::PageViewed, None);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("page_viewed"));
        let parsed: AnalyticsEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, event.id);
    }
}
