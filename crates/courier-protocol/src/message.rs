//! The wire message exchanged with clients.
//!
//! Every message is a single JSON object whose `type` field selects the
//! meaning of `content`. Optional routing fields (`from`, `to`, `room`) are
//! omitted from the encoded form when unset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::content::{DataUpdate, Notification, SystemNotice, UserStatus};

/// Message type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    System,
    Ping,
    Pong,
    Welcome,
    Error,
    Chat,
    Notification,
    Broadcast,
    JoinRoom,
    LeaveRoom,
    RoomMessage,
    UserOnline,
    UserOffline,
    UserStatus,
    DataUpdate,
    Refresh,
}

impl MessageType {
    /// All message types, in declaration order.
    pub const ALL: [MessageType; 16] = [
        MessageType::System,
        MessageType::Ping,
        MessageType::Pong,
        MessageType::Welcome,
        MessageType::Error,
        MessageType::Chat,
        MessageType::Notification,
        MessageType::Broadcast,
        MessageType::JoinRoom,
        MessageType::LeaveRoom,
        MessageType::RoomMessage,
        MessageType::UserOnline,
        MessageType::UserOffline,
        MessageType::UserStatus,
        MessageType::DataUpdate,
        MessageType::Refresh,
    ];

    /// The wire name of this type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::System => "system",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Welcome => "welcome",
            MessageType::Error => "error",
            MessageType::Chat => "chat",
            MessageType::Notification => "notification",
            MessageType::Broadcast => "broadcast",
            MessageType::JoinRoom => "join_room",
            MessageType::LeaveRoom => "leave_room",
            MessageType::RoomMessage => "room_message",
            MessageType::UserOnline => "user_online",
            MessageType::UserOffline => "user_offline",
            MessageType::UserStatus => "user_status",
            MessageType::DataUpdate => "data_update",
            MessageType::Refresh => "refresh",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for MessageType {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, <Self as TryFrom<&str>>::Error> {
        MessageType::ALL
            .into_iter()
            .find(|t| t.as_str() == value)
            .ok_or("Invalid message type")
    }
}

/// A message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message type.
    #[serde(rename = "type")]
    pub kind: MessageType,

    /// Optional message identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Sender user id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    /// Sender display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,

    /// Recipient user id for private messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,

    /// Room name for room traffic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,

    /// Type-specific content.
    #[serde(default)]
    pub content: Value,

    /// Free-form extra data.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,

    /// Unix timestamp in seconds.
    #[serde(default)]
    pub timestamp: i64,

    /// Creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Create a new message stamped with the current time.
    #[must_use]
    pub fn new(kind: MessageType, content: Value) -> Self {
        let now = Utc::now();
        Self {
            kind,
            id: None,
            from: None,
            from_name: None,
            to: None,
            room: None,
            content,
            data: Map::new(),
            timestamp: now.timestamp(),
            created_at: Some(now),
        }
    }

    /// Create a message whose content is any serializable value.
    ///
    /// # Errors
    ///
    /// Returns an error if the content cannot be represented as JSON.
    pub fn with_content<T: Serialize>(
        kind: MessageType,
        content: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind, serde_json::to_value(content)?))
    }

    /// A `welcome` message announcing the connection id to a new client.
    #[must_use]
    pub fn welcome(client_id: &str) -> Self {
        let notice = SystemNotice::info(0, "Connected to Courier");
        let mut msg = Self::new(MessageType::Welcome, notice.into_value());
        msg.set_data("client_id", client_id);
        msg.set_data("protocol", crate::PROTOCOL_VERSION);
        msg.set_data("server_time", Utc::now().to_rfc3339());
        msg
    }

    /// A heartbeat reply.
    #[must_use]
    pub fn pong() -> Self {
        Self::new(MessageType::Pong, Value::Null)
    }

    /// An `error` message carrying a code and description.
    #[must_use]
    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self::new(
            MessageType::Error,
            SystemNotice::error(code, message).into_value(),
        )
    }

    /// A `user_status` message.
    #[must_use]
    pub fn user_status(status: &UserStatus) -> Self {
        Self::new(MessageType::UserStatus, to_value_lossy(status))
    }

    /// A `user_offline` message.
    #[must_use]
    pub fn user_offline(status: &UserStatus) -> Self {
        Self::new(MessageType::UserOffline, to_value_lossy(status))
    }

    /// A `notification` message.
    #[must_use]
    pub fn notification(notification: &Notification) -> Self {
        Self::new(MessageType::Notification, to_value_lossy(notification))
    }

    /// A `data_update` message.
    #[must_use]
    pub fn data_update(update: &DataUpdate) -> Self {
        Self::new(MessageType::DataUpdate, to_value_lossy(update))
    }

    /// Set the message id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Assign a fresh random id if none is set.
    #[must_use]
    pub fn with_generated_id(mut self) -> Self {
        if self.id.is_none() {
            self.id = Some(uuid::Uuid::new_v4().to_string());
        }
        self
    }

    /// Set the sender.
    #[must_use]
    pub fn with_from(mut self, user_id: impl Into<String>, name: impl Into<String>) -> Self {
        self.from = Some(user_id.into());
        self.from_name = Some(name.into());
        self
    }

    /// Set the recipient.
    #[must_use]
    pub fn with_to(mut self, user_id: impl Into<String>) -> Self {
        self.to = Some(user_id.into());
        self
    }

    /// Set the room.
    #[must_use]
    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    /// Set an extra data entry.
    pub fn set_data(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Get an extra data entry.
    #[must_use]
    pub fn data(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// The room a `join_room` / `leave_room` request refers to.
    ///
    /// Clients may put the room name either in `content` or in `room`.
    #[must_use]
    pub fn target_room(&self) -> Option<&str> {
        match &self.content {
            Value::String(room) if !room.is_empty() => Some(room.as_str()),
            _ => self.room.as_deref().filter(|r| !r.is_empty()),
        }
    }
}

fn to_value_lossy<T: Serialize>(value: &T) -> Value {
    // Content types here are plain structs of strings and maps.
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::PresenceStatus;
    use serde_json::json;

    #[test]
    fn test_message_type_names() {
        assert_eq!(MessageType::JoinRoom.as_str(), "join_room");
        assert_eq!(
            serde_json::to_value(MessageType::UserOffline).unwrap(),
            json!("user_offline")
        );
        for kind in MessageType::ALL {
            assert_eq!(MessageType::try_from(kind.as_str()), Ok(kind));
        }
        assert!(MessageType::try_from("subscribe").is_err());
    }

    #[test]
    fn test_optional_fields_omitted() {
        let msg = Message::new(MessageType::Chat, json!("hi"));
        let value = serde_json::to_value(&msg).unwrap();
        let obj = value.as_object().unwrap();

        assert_eq!(obj["type"], json!("chat"));
        assert_eq!(obj["content"], json!("hi"));
        assert!(obj.contains_key("timestamp"));
        assert!(!obj.contains_key("from"));
        assert!(!obj.contains_key("to"));
        assert!(!obj.contains_key("data"));
    }

    #[test]
    fn test_minimal_message_parses() {
        let msg: Message = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg.kind, MessageType::Ping);
        assert_eq!(msg.content, Value::Null);
        assert_eq!(msg.timestamp, 0);
    }

    #[test]
    fn test_welcome_carries_client_id() {
        let msg = Message::welcome("client-1");
        assert_eq!(msg.kind, MessageType::Welcome);
        assert_eq!(msg.data("client_id"), Some(&json!("client-1")));
        assert_eq!(msg.content["code"], json!(0));
    }

    #[test]
    fn test_target_room() {
        let by_content = Message::new(MessageType::JoinRoom, json!("lobby"));
        assert_eq!(by_content.target_room(), Some("lobby"));

        let by_field = Message::new(MessageType::JoinRoom, Value::Null).with_room("den");
        assert_eq!(by_field.target_room(), Some("den"));

        let neither = Message::new(MessageType::JoinRoom, json!(""));
        assert_eq!(neither.target_room(), None);
    }

    #[test]
    fn test_user_status_content() {
        let status = UserStatus::new("u1", "Alice", PresenceStatus::Online);
        let msg = Message::user_status(&status);
        assert_eq!(msg.content["user_id"], json!("u1"));
        assert_eq!(msg.content["status"], json!("online"));
    }
}
