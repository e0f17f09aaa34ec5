//! # courier-core
//!
//! Connection registry, rooms and sessions for the Courier delivery engine.
//!
//! - **Registry** - Single-owner actor tracking live connections per user and
//!   room, with non-blocking per-connection delivery
//! - **Group** - Room membership, local or in the shared store
//! - **Session** - Per-connection key/value sessions, local or shared
//! - **Events** - Typed lifecycle events for collaborators
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  commands  ┌───────────────┐  bytes  ┌────────────┐
//! │  Registry  │───────────▶│ RegistryActor │────────▶│ Connection │
//! │  (handle)  │◀───────────│  (one task)   │         │   queue    │
//! └────────────┘   replies  └───────────────┘         └────────────┘
//!                              │         │
//!                              ▼         ▼
//!                       ┌──────────┐ ┌──────────┐
//!                       │ EventBus │ │  Groups  │
//!                       └──────────┘ └──────────┘
//! ```

pub mod connection;
pub mod events;
pub mod group;
pub mod registry;
pub mod session;

pub use connection::{ClientId, ClientInfo, Registration};
pub use events::{EventBus, EventKind, RegistryEvent};
pub use group::{
    GroupError, GroupManager, GroupStore, MemoryGroupStore, SharedGroupStore, DEFAULT_GROUP_TTL,
};
pub use registry::{
    notification_message, Registry, RegistryActor, RegistryConfig, RegistryError, RegistryStats,
};
pub use session::{
    MemorySessionStore, Session, SessionError, SessionManager, SessionStore, SharedSessionStore,
    DEFAULT_SESSION_TTL,
};
