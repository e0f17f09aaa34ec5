//! Connection records owned by the registry.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A connection identifier, unique per process.
pub type ClientId = String;

/// Handed to the transport layer when a connection is registered.
#[derive(Debug)]
pub struct Registration {
    /// Assigned connection id.
    pub client_id: ClientId,
    /// Encoded messages to write to the socket, in order.
    pub outbound: mpsc::Receiver<Bytes>,
    /// Cancelled when the registry drops the connection (kick, slow
    /// consumer, shutdown). The reader task should stop on it.
    pub closed: CancellationToken,
}

/// Snapshot of a connection for collaborators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientInfo {
    pub id: ClientId,
    pub user_id: String,
    pub user_name: String,
    pub rooms: Vec<String>,
    pub metadata: Map<String, Value>,
    pub connected_at: DateTime<Utc>,
}

/// Why a payload could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueFailure {
    /// Outbound queue at capacity.
    Full,
    /// The writer is gone.
    Closed,
}

#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) id: ClientId,
    pub(crate) user_id: String,
    pub(crate) user_name: String,
    pub(crate) rooms: HashSet<String>,
    pub(crate) metadata: Map<String, Value>,
    pub(crate) connected_at: DateTime<Utc>,
    sender: mpsc::Sender<Bytes>,
    closed: CancellationToken,
}

impl Connection {
    pub(crate) fn new(
        id: ClientId,
        user_id: String,
        user_name: String,
        metadata: Map<String, Value>,
        capacity: usize,
    ) -> (Self, Registration) {
        let (sender, outbound) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();
        let registration = Registration {
            client_id: id.clone(),
            outbound,
            closed: closed.clone(),
        };
        let conn = Self {
            id,
            user_id,
            user_name,
            rooms: HashSet::new(),
            metadata,
            connected_at: Utc::now(),
            sender,
            closed,
        };
        (conn, registration)
    }

    /// Queue a payload without waiting.
    pub(crate) fn try_deliver(&self, payload: Bytes) -> Result<(), QueueFailure> {
        self.sender.try_send(payload).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => QueueFailure::Full,
            mpsc::error::TrySendError::Closed(_) => QueueFailure::Closed,
        })
    }

    /// Signal the transport tasks to stop. Dropping the connection closes
    /// the outbound queue once it is drained.
    pub(crate) fn close(&self) {
        self.closed.cancel();
    }

    pub(crate) fn info(&self) -> ClientInfo {
        let mut rooms: Vec<String> = self.rooms.iter().cloned().collect();
        rooms.sort();
        ClientInfo {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            rooms,
            metadata: self.metadata.clone(),
            connected_at: self.connected_at,
        }
    }

    /// Info stored alongside the membership in the group store.
    pub(crate) fn member_info(&self) -> Value {
        serde_json::json!({
            "user_id": self.user_id,
            "user_name": self.user_name,
            "joined_at": Utc::now().timestamp(),
        })
    }
}
