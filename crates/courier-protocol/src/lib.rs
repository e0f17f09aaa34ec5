//! # courier-protocol
//!
//! Wire message definitions for the Courier realtime delivery engine.
//!
//! Clients and servers exchange [`Message`] values: a typed envelope with
//! optional routing fields and free-form content. The same structure travels
//! between processes inside the message bus and the delivery bridge.
//!
//! ## Message Types
//!
//! - `ping` / `pong` - Application-level heartbeat
//! - `welcome` / `system` / `error` - Server notices
//! - `chat` / `room_message` / `broadcast` - User traffic
//! - `join_room` / `leave_room` - Room membership
//! - `user_online` / `user_offline` / `user_status` - Presence
//! - `notification` / `data_update` / `refresh` - Application pushes
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{codec, Message, MessageType};
//!
//! let msg = Message::new(MessageType::Chat, serde_json::json!("Hello"))
//!     .with_to("user-42");
//!
//! let encoded = codec::encode(&msg).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded.to.as_deref(), Some("user-42"));
//! ```

pub mod codec;
pub mod content;
pub mod message;

pub use codec::{decode, encode, Encoding, ProtocolError};
pub use content::{
    ChatContent, DataUpdate, NoticeLevel, Notification, PresenceStatus, SystemNotice, UserStatus,
};
pub use message::{Message, MessageType};

/// Protocol version announced in `welcome` messages.
pub const PROTOCOL_VERSION: &str = "1.0";
