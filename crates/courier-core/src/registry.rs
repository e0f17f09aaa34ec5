//! The connection registry.
//!
//! All connection, user and room maps are owned by a single
//! [`RegistryActor`] task. Everything else talks to it through a cloneable
//! [`Registry`] handle that sends commands over a bounded queue and awaits
//! a `oneshot` reply, so register/unregister/join/send never race each
//! other.
//!
//! Delivery never blocks on a client: each connection has a bounded
//! outbound queue and a full queue gets the connection dropped.

use bytes::Bytes;
use courier_protocol::{
    codec, DataUpdate, Message, MessageType, Notification, PresenceStatus, ProtocolError,
    SystemNotice, UserStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{ClientId, ClientInfo, Connection, QueueFailure, Registration};
use crate::events::{EventBus, RegistryEvent};
use crate::group::{GroupError, GroupManager};

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No such connection in this process.
    #[error("Client not found: {0}")]
    ClientNotFound(String),

    /// The user has no connection in this process.
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// No connection in this process is in the room.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// The client's outbound queue was full; it has been disconnected.
    #[error("Send buffer full for client: {0}")]
    BufferFull(String),

    /// Room membership limit reached.
    #[error("Client {client} already joined {limit} rooms")]
    TooManyRooms { client: String, limit: usize },

    /// Group store failure.
    #[error(transparent)]
    Store(#[from] GroupError),

    /// The group store did not answer in time.
    #[error("Group store timed out after {0:?}")]
    StoreTimeout(Duration),

    /// Message could not be encoded.
    #[error(transparent)]
    Encode(#[from] ProtocolError),

    /// The registry has shut down.
    #[error("Registry closed")]
    Closed,
}

impl RegistryError {
    /// Whether the error only says the target is absent from this process.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RegistryError::ClientNotFound(_)
                | RegistryError::UserNotFound(_)
                | RegistryError::RoomNotFound(_)
        )
    }
}

/// Registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Outbound queue capacity per connection.
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,

    /// Capacity of the command queue feeding the actor.
    #[serde(default = "default_command_queue_capacity")]
    pub command_queue_capacity: usize,

    /// Maximum rooms a single connection may join.
    #[serde(default = "default_max_rooms")]
    pub max_rooms_per_connection: usize,

    /// Bound on each group store call made by the actor.
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,
}

fn default_send_queue_capacity() -> usize {
    256
}

fn default_command_queue_capacity() -> usize {
    1024
}

fn default_max_rooms() -> usize {
    100
}

fn default_store_timeout() -> u64 {
    5000
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: default_send_queue_capacity(),
            command_queue_capacity: default_command_queue_capacity(),
            max_rooms_per_connection: default_max_rooms(),
            store_timeout_ms: default_store_timeout(),
        }
    }
}

impl RegistryConfig {
    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms.max(1))
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub connections: usize,
    pub online_users: usize,
    pub rooms: usize,
    pub uptime_secs: u64,
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Register {
        user_id: String,
        user_name: String,
        metadata: Map<String, Value>,
        reply: Reply<Registration>,
    },
    Unregister {
        client_id: ClientId,
        reply: Reply<bool>,
    },
    Kick {
        client_id: ClientId,
        farewell: Bytes,
        reply: Reply<Result<(), RegistryError>>,
    },
    SendToClient {
        client_id: ClientId,
        payload: Bytes,
        reply: Reply<Result<(), RegistryError>>,
    },
    SendToUser {
        user_id: String,
        payload: Bytes,
        reply: Reply<Result<usize, RegistryError>>,
    },
    SendToRoom {
        room: String,
        payload: Bytes,
        reply: Reply<Result<usize, RegistryError>>,
    },
    Broadcast {
        payload: Bytes,
        exclude: Option<ClientId>,
        reply: Reply<usize>,
    },
    JoinRoom {
        client_id: ClientId,
        room: String,
        reply: Reply<Result<(), RegistryError>>,
    },
    LeaveRoom {
        client_id: ClientId,
        room: String,
        reply: Reply<Result<(), RegistryError>>,
    },
    SetMetadata {
        client_id: ClientId,
        key: String,
        value: Value,
        reply: Reply<Result<(), RegistryError>>,
    },
    ClientInfo {
        client_id: ClientId,
        reply: Reply<Option<ClientInfo>>,
    },
    UserClients {
        user_id: String,
        reply: Reply<Vec<ClientInfo>>,
    },
    OnlineUsers {
        reply: Reply<Vec<String>>,
    },
    Stats {
        reply: Reply<RegistryStats>,
    },
}

/// Cloneable handle to the registry actor.
#[derive(Clone)]
pub struct Registry {
    commands: mpsc::Sender<Command>,
    groups: GroupManager,
    events: EventBus,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("closed", &self.commands.is_closed())
            .finish_non_exhaustive()
    }
}

fn encode(message: &Message) -> Result<Bytes, RegistryError> {
    Ok(codec::encode(message)?)
}

/// A `notification` message for `user_id`, tagged with a fresh
/// `notification_id` and `read = false`.
#[must_use]
pub fn notification_message(user_id: &str, notification: &Notification) -> Message {
    let mut message = Message::notification(notification).with_to(user_id);
    message
        .set_data("notification_id", uuid::Uuid::new_v4().to_string())
        .set_data("read", false);
    message
}

impl Registry {
    /// Create a handle and the actor that serves it. The actor does nothing
    /// until [`RegistryActor::run`] is awaited.
    #[must_use]
    pub fn new(config: RegistryConfig, groups: GroupManager, events: EventBus) -> (Self, RegistryActor) {
        let (commands, receiver) = mpsc::channel(config.command_queue_capacity.max(1));
        let actor = RegistryActor {
            config,
            commands: receiver,
            groups: groups.clone(),
            events: events.clone(),
            clients: HashMap::new(),
            users: HashMap::new(),
            rooms: HashMap::new(),
            dropped: Vec::new(),
            started: Instant::now(),
        };
        let registry = Self {
            commands,
            groups,
            events,
        };
        (registry, actor)
    }

    /// Create a registry and spawn its actor on the current runtime.
    #[must_use]
    pub fn spawn(
        config: RegistryConfig,
        groups: GroupManager,
        events: EventBus,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (registry, actor) = Self::new(config, groups, events);
        let handle = tokio::spawn(actor.run(cancel));
        (registry, handle)
    }

    /// Event bus this registry emits on.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Group manager backing room membership.
    #[must_use]
    pub fn groups(&self) -> &GroupManager {
        &self.groups
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, RegistryError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| RegistryError::Closed)?;
        response.await.map_err(|_| RegistryError::Closed)
    }

    /// Register a new connection for an authenticated user.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Closed`] if the registry has shut down.
    pub async fn register(
        &self,
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> Result<Registration, RegistryError> {
        let user_id = user_id.into();
        let user_name = user_name.into();
        self.request(|reply| Command::Register {
            user_id,
            user_name,
            metadata,
            reply,
        })
        .await
    }

    /// Remove a connection. Returns `false` if it was already gone.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Closed`] if the registry has shut down.
    pub async fn unregister(&self, client_id: &str) -> Result<bool, RegistryError> {
        let client_id = client_id.to_string();
        self.request(|reply| Command::Unregister { client_id, reply })
            .await
    }

    /// Disconnect a client after sending it a `system` notice.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ClientNotFound`] if the client is not here.
    pub async fn kick(&self, client_id: &str, reason: &str) -> Result<(), RegistryError> {
        let mut notice = SystemNotice::info(4001, "Disconnected by server");
        notice.data.insert("reason".into(), reason.into());
        let farewell = encode(&Message::with_content(MessageType::System, &notice).map_err(ProtocolError::from)?)?;
        let client_id = client_id.to_string();
        self.request(|reply| Command::Kick {
            client_id,
            farewell,
            reply,
        })
        .await?
    }

    /// Queue a message for one connection.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::BufferFull`] if the client's queue was full
    /// (the client is dropped) or [`RegistryError::ClientNotFound`].
    pub async fn send_to_client(&self, client_id: &str, message: &Message) -> Result<(), RegistryError> {
        let payload = encode(message)?;
        let client_id = client_id.to_string();
        self.request(|reply| Command::SendToClient {
            client_id,
            payload,
            reply,
        })
        .await?
    }

    /// Queue a message for every connection of a user. Returns how many
    /// connections accepted it.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UserNotFound`] if the user has no
    /// connection here.
    pub async fn send_to_user(&self, user_id: &str, message: &Message) -> Result<usize, RegistryError> {
        let payload = encode(message)?;
        let user_id = user_id.to_string();
        self.request(|reply| Command::SendToUser {
            user_id,
            payload,
            reply,
        })
        .await?
    }

    /// Queue a message for every connection in a room.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::RoomNotFound`] if no connection here is in
    /// the room.
    pub async fn send_to_room(&self, room: &str, message: &Message) -> Result<usize, RegistryError> {
        let payload = encode(message)?;
        let room = room.to_string();
        self.request(|reply| Command::SendToRoom {
            room,
            payload,
            reply,
        })
        .await?
    }

    /// Queue a message for every connection.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Closed`] if the registry has shut down.
    pub async fn broadcast(&self, message: &Message) -> Result<usize, RegistryError> {
        self.broadcast_except(message, None).await
    }

    /// Queue a message for every connection but `exclude`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Closed`] if the registry has shut down.
    pub async fn broadcast_except(
        &self,
        message: &Message,
        exclude: Option<&str>,
    ) -> Result<usize, RegistryError> {
        let payload = encode(message)?;
        let exclude = exclude.map(str::to_string);
        self.request(|reply| Command::Broadcast {
            payload,
            exclude,
            reply,
        })
        .await
    }

    /// # Errors
    ///
    /// Returns [`RegistryError::TooManyRooms`] past the per-connection
    /// limit, or a store error.
    pub async fn join_room(&self, client_id: &str, room: &str) -> Result<(), RegistryError> {
        let client_id = client_id.to_string();
        let room = room.to_string();
        self.request(|reply| Command::JoinRoom {
            client_id,
            room,
            reply,
        })
        .await?
    }

    /// # Errors
    ///
    /// Returns [`RegistryError::RoomNotFound`] if the client is not in the
    /// room.
    pub async fn leave_room(&self, client_id: &str, room: &str) -> Result<(), RegistryError> {
        let client_id = client_id.to_string();
        let room = room.to_string();
        self.request(|reply| Command::LeaveRoom {
            client_id,
            room,
            reply,
        })
        .await?
    }

    /// # Errors
    ///
    /// Returns [`RegistryError::ClientNotFound`] for unknown clients.
    pub async fn set_metadata(
        &self,
        client_id: &str,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<(), RegistryError> {
        let client_id = client_id.to_string();
        let key = key.into();
        let value = value.into();
        self.request(|reply| Command::SetMetadata {
            client_id,
            key,
            value,
            reply,
        })
        .await?
    }

    /// # Errors
    ///
    /// Returns [`RegistryError::ClientNotFound`] for unknown clients.
    pub async fn client_info(&self, client_id: &str) -> Result<ClientInfo, RegistryError> {
        let id = client_id.to_string();
        self.request(|reply| Command::ClientInfo {
            client_id: id,
            reply,
        })
        .await?
        .ok_or_else(|| RegistryError::ClientNotFound(client_id.to_string()))
    }

    /// Rooms a connection has joined, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ClientNotFound`] for unknown clients.
    pub async fn client_rooms(&self, client_id: &str) -> Result<Vec<String>, RegistryError> {
        Ok(self.client_info(client_id).await?.rooms)
    }

    /// Connections of a user in this process.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Closed`] if the registry has shut down.
    pub async fn user_clients(&self, user_id: &str) -> Result<Vec<ClientInfo>, RegistryError> {
        let user_id = user_id.to_string();
        self.request(|reply| Command::UserClients { user_id, reply })
            .await
    }

    /// # Errors
    ///
    /// Returns [`RegistryError::Closed`] if the registry has shut down.
    pub async fn is_user_online(&self, user_id: &str) -> Result<bool, RegistryError> {
        Ok(!self.user_clients(user_id).await?.is_empty())
    }

    /// Users with at least one connection here, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Closed`] if the registry has shut down.
    pub async fn online_users(&self) -> Result<Vec<String>, RegistryError> {
        self.request(|reply| Command::OnlineUsers { reply }).await
    }

    /// Members of a room as recorded in the group store, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::RoomNotFound`] if the local group store has
    /// no such room.
    pub async fn room_members(&self, room: &str) -> Result<Vec<String>, RegistryError> {
        match self.groups.members(room).await {
            Ok(members) => {
                let mut ids: Vec<String> = members.into_keys().collect();
                ids.sort();
                Ok(ids)
            }
            Err(GroupError::NotFound(_)) => Err(RegistryError::RoomNotFound(room.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    /// # Errors
    ///
    /// Returns a store error.
    pub async fn room_size(&self, room: &str) -> Result<usize, RegistryError> {
        Ok(self.groups.size(room).await?)
    }

    /// # Errors
    ///
    /// Returns [`RegistryError::Closed`] if the registry has shut down.
    pub async fn stats(&self) -> Result<RegistryStats, RegistryError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Send a notification to a user, tagging it with a fresh
    /// `notification_id` and `read = false`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UserNotFound`] if the user has no
    /// connection here.
    pub async fn send_notification(
        &self,
        user_id: &str,
        notification: &Notification,
    ) -> Result<usize, RegistryError> {
        self.send_to_user(user_id, &notification_message(user_id, notification))
            .await
    }

    /// # Errors
    ///
    /// Returns [`RegistryError::Closed`] if the registry has shut down.
    pub async fn broadcast_user_status(&self, status: &UserStatus) -> Result<usize, RegistryError> {
        self.broadcast(&Message::user_status(status)).await
    }

    /// # Errors
    ///
    /// Returns [`RegistryError::Closed`] if the registry has shut down.
    pub async fn broadcast_data_update(&self, update: &DataUpdate) -> Result<usize, RegistryError> {
        self.broadcast(&Message::data_update(update)).await
    }
}

/// The task owning all registry state.
pub struct RegistryActor {
    config: RegistryConfig,
    commands: mpsc::Receiver<Command>,
    groups: GroupManager,
    events: EventBus,
    clients: HashMap<ClientId, Connection>,
    users: HashMap<String, HashSet<ClientId>>,
    /// Local room index: connections of this process per room.
    rooms: HashMap<String, HashSet<ClientId>>,
    /// Connections removed during delivery, awaiting cleanup.
    dropped: Vec<(Connection, QueueFailure)>,
    started: Instant,
}

impl RegistryActor {
    /// Serve commands until cancelled or every handle is dropped, then
    /// close all connections.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            send_queue = self.config.send_queue_capacity,
            max_rooms = self.config.max_rooms_per_connection,
            "Connection registry started"
        );
        loop {
            let command = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                command = self.commands.recv() => command,
            };
            let Some(command) = command else { break };

            // Store calls inside a command must not hold up shutdown.
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = self.serve(command) => {}
            }
        }
        self.shutdown();
    }

    async fn serve(&mut self, command: Command) {
        self.handle(command).await;
        self.settle_dropped().await;
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Register {
                user_id,
                user_name,
                metadata,
                reply,
            } => {
                let registration = self.register(user_id, user_name, metadata);
                let _ = reply.send(registration);
            }
            Command::Unregister { client_id, reply } => {
                let removed = match self.clients.remove(&client_id) {
                    Some(conn) => {
                        conn.close();
                        self.cleanup(conn).await;
                        true
                    }
                    None => false,
                };
                let _ = reply.send(removed);
            }
            Command::Kick {
                client_id,
                farewell,
                reply,
            } => {
                let result = match self.clients.remove(&client_id) {
                    Some(conn) => {
                        let _ = conn.try_deliver(farewell);
                        conn.close();
                        info!(client = %client_id, user = %conn.user_id, "Client kicked");
                        self.cleanup(conn).await;
                        Ok(())
                    }
                    None => Err(RegistryError::ClientNotFound(client_id)),
                };
                let _ = reply.send(result);
            }
            Command::SendToClient {
                client_id,
                payload,
                reply,
            } => {
                let _ = reply.send(self.queue(&client_id, payload));
            }
            Command::SendToUser {
                user_id,
                payload,
                reply,
            } => {
                let result = match self.users.get(&user_id) {
                    Some(ids) => {
                        let ids: Vec<ClientId> = ids.iter().cloned().collect();
                        Ok(self.queue_many(ids, &payload))
                    }
                    None => Err(RegistryError::UserNotFound(user_id)),
                };
                let _ = reply.send(result);
            }
            Command::SendToRoom {
                room,
                payload,
                reply,
            } => {
                let result = match self.rooms.get(&room) {
                    Some(ids) => {
                        let ids: Vec<ClientId> = ids.iter().cloned().collect();
                        Ok(self.queue_many(ids, &payload))
                    }
                    None => Err(RegistryError::RoomNotFound(room)),
                };
                let _ = reply.send(result);
            }
            Command::Broadcast {
                payload,
                exclude,
                reply,
            } => {
                let ids: Vec<ClientId> = self
                    .clients
                    .keys()
                    .filter(|id| exclude.as_deref() != Some(id.as_str()))
                    .cloned()
                    .collect();
                let _ = reply.send(self.queue_many(ids, &payload));
            }
            Command::JoinRoom {
                client_id,
                room,
                reply,
            } => {
                let _ = reply.send(self.join(&client_id, &room).await);
            }
            Command::LeaveRoom {
                client_id,
                room,
                reply,
            } => {
                let _ = reply.send(self.leave(&client_id, &room).await);
            }
            Command::SetMetadata {
                client_id,
                key,
                value,
                reply,
            } => {
                let result = match self.clients.get_mut(&client_id) {
                    Some(conn) => {
                        conn.metadata.insert(key, value);
                        Ok(())
                    }
                    None => Err(RegistryError::ClientNotFound(client_id)),
                };
                let _ = reply.send(result);
            }
            Command::ClientInfo { client_id, reply } => {
                let _ = reply.send(self.clients.get(&client_id).map(Connection::info));
            }
            Command::UserClients { user_id, reply } => {
                let infos = self
                    .users
                    .get(&user_id)
                    .into_iter()
                    .flatten()
                    .filter_map(|id| self.clients.get(id).map(Connection::info))
                    .collect();
                let _ = reply.send(infos);
            }
            Command::OnlineUsers { reply } => {
                let mut users: Vec<String> = self.users.keys().cloned().collect();
                users.sort();
                let _ = reply.send(users);
            }
            Command::Stats { reply } => {
                let _ = reply.send(RegistryStats {
                    connections: self.clients.len(),
                    online_users: self.users.len(),
                    rooms: self.rooms.len(),
                    uptime_secs: self.started.elapsed().as_secs(),
                });
            }
        }
    }

    fn register(
        &mut self,
        user_id: String,
        user_name: String,
        metadata: Map<String, Value>,
    ) -> Registration {
        let client_id = uuid::Uuid::new_v4().to_string();
        let (conn, registration) = Connection::new(
            client_id.clone(),
            user_id.clone(),
            user_name.clone(),
            metadata,
            self.config.send_queue_capacity,
        );

        match encode(&Message::welcome(&client_id)) {
            Ok(welcome) => {
                let _ = conn.try_deliver(welcome);
            }
            Err(err) => warn!(error = %err, "Failed to encode welcome message"),
        }

        let first = !self.users.contains_key(&user_id);
        self.clients.insert(client_id.clone(), conn);
        self.users
            .entry(user_id.clone())
            .or_default()
            .insert(client_id.clone());

        info!(
            client = %client_id,
            user = %user_id,
            connections = self.clients.len(),
            "Client registered"
        );
        self.events.emit(RegistryEvent::Connected {
            client_id: client_id.clone(),
            user_id: user_id.clone(),
        });

        if first {
            let status = UserStatus::new(&user_id, &user_name, PresenceStatus::Online);
            self.announce(&Message::user_status(&status), Some(&client_id));
            self.events
                .emit(RegistryEvent::UserOnline { user_id, user_name });
        }

        registration
    }

    /// Broadcast a registry-originated message.
    fn announce(&mut self, message: &Message, exclude: Option<&str>) {
        let payload = match encode(message) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(kind = %message.kind, error = %err, "Failed to encode announcement");
                return;
            }
        };
        let ids: Vec<ClientId> = self
            .clients
            .keys()
            .filter(|id| exclude != Some(id.as_str()))
            .cloned()
            .collect();
        self.queue_many(ids, &payload);
    }

    /// Queue a payload for one connection, dropping it if its queue is
    /// full or its writer is gone.
    fn queue(&mut self, client_id: &str, payload: Bytes) -> Result<(), RegistryError> {
        let conn = self
            .clients
            .get(client_id)
            .ok_or_else(|| RegistryError::ClientNotFound(client_id.to_string()))?;

        match conn.try_deliver(payload) {
            Ok(()) => Ok(()),
            Err(failure) => {
                if let Some(conn) = self.clients.remove(client_id) {
                    conn.close();
                    self.dropped.push((conn, failure));
                }
                Err(match failure {
                    QueueFailure::Full => RegistryError::BufferFull(client_id.to_string()),
                    QueueFailure::Closed => RegistryError::ClientNotFound(client_id.to_string()),
                })
            }
        }
    }

    fn queue_many(&mut self, ids: Vec<ClientId>, payload: &Bytes) -> usize {
        ids.iter()
            .filter(|id| self.queue(id, payload.clone()).is_ok())
            .count()
    }

    async fn settle_dropped(&mut self) {
        while let Some((conn, failure)) = self.dropped.pop() {
            if failure == QueueFailure::Full {
                warn!(
                    client = %conn.id,
                    user = %conn.user_id,
                    capacity = self.config.send_queue_capacity,
                    "Outbound queue full, dropping slow client"
                );
                self.events.emit(RegistryEvent::SlowConsumerDropped {
                    client_id: conn.id.clone(),
                    user_id: conn.user_id.clone(),
                });
            }
            self.cleanup(conn).await;
        }
    }

    /// Remove every trace of a connection already taken out of `clients`.
    async fn cleanup(&mut self, conn: Connection) {
        for room in &conn.rooms {
            self.unlink_room(&conn.id, room).await;
        }

        let mut last = false;
        if let Some(ids) = self.users.get_mut(&conn.user_id) {
            ids.remove(&conn.id);
            if ids.is_empty() {
                self.users.remove(&conn.user_id);
                last = true;
            }
        }

        info!(
            client = %conn.id,
            user = %conn.user_id,
            connections = self.clients.len(),
            "Client unregistered"
        );
        self.events.emit(RegistryEvent::Disconnected {
            client_id: conn.id.clone(),
            user_id: conn.user_id.clone(),
        });

        if last {
            let status = UserStatus::new(&conn.user_id, &conn.user_name, PresenceStatus::Offline);
            self.announce(&Message::user_offline(&status), None);
            self.events.emit(RegistryEvent::UserOffline {
                user_id: conn.user_id,
                user_name: conn.user_name,
            });
        }
    }

    async fn join(&mut self, client_id: &str, room: &str) -> Result<(), RegistryError> {
        let conn = self
            .clients
            .get(client_id)
            .ok_or_else(|| RegistryError::ClientNotFound(client_id.to_string()))?;
        if conn.rooms.contains(room) {
            return Ok(());
        }
        let limit = self.config.max_rooms_per_connection;
        if conn.rooms.len() >= limit {
            return Err(RegistryError::TooManyRooms {
                client: client_id.to_string(),
                limit,
            });
        }
        let info = conn.member_info();

        let timeout = self.config.store_timeout();
        tokio::time::timeout(timeout, self.groups.add_member(room, client_id, info))
            .await
            .map_err(|_| RegistryError::StoreTimeout(timeout))??;

        if let Some(conn) = self.clients.get_mut(client_id) {
            conn.rooms.insert(room.to_string());
        }
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(client_id.to_string());

        debug!(client = %client_id, room = %room, "Joined room");
        self.events.emit(RegistryEvent::JoinedRoom {
            client_id: client_id.to_string(),
            room: room.to_string(),
        });
        Ok(())
    }

    async fn leave(&mut self, client_id: &str, room: &str) -> Result<(), RegistryError> {
        let conn = self
            .clients
            .get_mut(client_id)
            .ok_or_else(|| RegistryError::ClientNotFound(client_id.to_string()))?;
        if !conn.rooms.remove(room) {
            return Err(RegistryError::RoomNotFound(room.to_string()));
        }
        self.unlink_room(client_id, room).await;
        debug!(client = %client_id, room = %room, "Left room");
        Ok(())
    }

    async fn unlink_room(&mut self, client_id: &str, room: &str) {
        if let Some(ids) = self.rooms.get_mut(room) {
            ids.remove(client_id);
            if ids.is_empty() {
                self.rooms.remove(room);
            }
        }
        let timeout = self.config.store_timeout();
        match tokio::time::timeout(timeout, self.groups.remove_member(room, client_id)).await {
            Ok(Ok(()) | Err(GroupError::NotFound(_))) => {}
            Ok(Err(err)) => {
                warn!(client = %client_id, room = %room, error = %err, "Failed to remove group member");
            }
            Err(_) => {
                warn!(client = %client_id, room = %room, ?timeout, "Group store timed out removing member");
            }
        }
        self.events.emit(RegistryEvent::LeftRoom {
            client_id: client_id.to_string(),
            room: room.to_string(),
        });
    }

    fn shutdown(&mut self) {
        let count = self.clients.len();
        for conn in self.clients.values() {
            conn.close();
        }
        self.clients.clear();
        self.users.clear();
        self.rooms.clear();
        self.commands.close();
        info!(connections = count, "Connection registry stopped");
    }
}
