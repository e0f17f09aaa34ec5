//! Typed payloads carried in a message's `content` field.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Severity of a system notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Content of `system`, `welcome` and `error` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemNotice {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<NoticeLevel>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}

impl SystemNotice {
    #[must_use]
    pub fn info(code: i32, message: impl Into<String>) -> Self {
        Self::with_level(code, message, NoticeLevel::Info)
    }

    #[must_use]
    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self::with_level(code, message, NoticeLevel::Error)
    }

    fn with_level(code: i32, message: impl Into<String>, level: NoticeLevel) -> Self {
        Self {
            code,
            message: message.into(),
            level: Some(level),
            data: Map::new(),
        }
    }

    pub(crate) fn into_value(self) -> Value {
        let mut obj = Map::new();
        obj.insert("code".into(), self.code.into());
        obj.insert("message".into(), self.message.into());
        if let Some(level) = self.level {
            obj.insert("level".into(), serde_json::to_value(level).unwrap_or(Value::Null));
        }
        if !self.data.is_empty() {
            obj.insert("data".into(), Value::Object(self.data));
        }
        Value::Object(obj)
    }
}

/// Content of `notification` messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}

impl Notification {
    #[must_use]
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    /// Build a notification from loosely-typed content.
    ///
    /// Missing or non-string fields become empty, so a partially filled
    /// object still yields something deliverable.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        let text = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        Self {
            title: text("title").unwrap_or_default(),
            body: text("body").unwrap_or_default(),
            icon: text("icon"),
            link: text("link"),
            category: text("category"),
            data: value
                .get("data")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        }
    }
}

/// Content of `chat` and `room_message` messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatContent {
    pub text: String,
    /// One of `text`, `image`, `video`, `file`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<Box<ChatContent>>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}

/// Presence status of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
    Busy,
    Away,
}

/// Content of `user_status`, `user_online` and `user_offline` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserStatus {
    pub user_id: String,
    pub user_name: String,
    pub status: PresenceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl UserStatus {
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        status: PresenceStatus,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            status,
            avatar: None,
        }
    }
}

/// Content of `data_update` messages, announcing a change to some entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataUpdate {
    /// Entity kind, e.g. `user` or `article`.
    pub entity: String,
    /// One of `create`, `update`, `delete`.
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}
