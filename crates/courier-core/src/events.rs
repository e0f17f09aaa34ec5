//! Typed registry events.
//!
//! Collaborators that care about connection lifecycle (presence services,
//! audit logs, the session layer) subscribe to an [`EventBus`] instead of
//! hooking into the registry directly.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Default event channel capacity.
const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Something that happened inside the connection registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RegistryEvent {
    Connected { client_id: String, user_id: String },
    Disconnected { client_id: String, user_id: String },
    /// First connection of a user in this process.
    UserOnline { user_id: String, user_name: String },
    /// Last connection of a user in this process went away.
    UserOffline { user_id: String, user_name: String },
    JoinedRoom { client_id: String, room: String },
    LeftRoom { client_id: String, room: String },
    /// A connection was dropped because its outbound queue was full.
    SlowConsumerDropped { client_id: String, user_id: String },
}

/// Discriminant of [`RegistryEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Connected,
    Disconnected,
    UserOnline,
    UserOffline,
    JoinedRoom,
    LeftRoom,
    SlowConsumerDropped,
}

impl RegistryEvent {
    /// The kind of this event.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            RegistryEvent::Connected { .. } => EventKind::Connected,
            RegistryEvent::Disconnected { .. } => EventKind::Disconnected,
            RegistryEvent::UserOnline { .. } => EventKind::UserOnline,
            RegistryEvent::UserOffline { .. } => EventKind::UserOffline,
            RegistryEvent::JoinedRoom { .. } => EventKind::JoinedRoom,
            RegistryEvent::LeftRoom { .. } => EventKind::LeftRoom,
            RegistryEvent::SlowConsumerDropped { .. } => EventKind::SlowConsumerDropped,
        }
    }
}

/// Fan-out of registry events to any number of subscribers.
///
/// Slow subscribers lag and lose events; the registry never waits on them.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RegistryEvent>,
}

impl EventBus {
    /// Create an event bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create an event bus with a specific capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to all future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.sender.subscribe()
    }

    /// Emit an event. Returns the number of subscribers that received it.
    pub fn emit(&self, event: RegistryEvent) -> usize {
        trace!(kind = ?event.kind(), "Registry event");
        self.sender.send(event).unwrap_or_default()
    }

    /// Number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
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

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        let sent = bus.emit(RegistryEvent::LeftRoom {
            client_id: "c1".into(),
            room: "r".into(),
        });
        assert_eq!(sent, 0);
    }

    #[tokio::test]
    async fn test_subscribe_receives_kind() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(RegistryEvent::UserOnline {
            user_id: "u1".into(),
            user_name: "Alice".into(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::UserOnline);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "user_online");
    }
}
