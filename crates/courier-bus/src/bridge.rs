//! Cross-process delivery bridge.
//!
//! A user may be connected to any process in the fleet. Senders publish on
//! a routing channel (`<prefix>broadcast`, `<prefix>user:<id>`,
//! `<prefix>room:<id>`, `<prefix>notification:<id>`) and every process runs
//! a [`Bridge`] that pattern-subscribes to those channels and hands each
//! message to its own [`Registry`]. Processes without the target simply
//! find nothing to deliver.
//!
//! [`BridgePublisher`] is the sending side. [`Bridge::relay_topic`] feeds the
//! same routing from a durable bus topic.

use courier_core::{notification_message, Registry, RegistryError};
use courier_protocol::{Message, Notification};
use courier_store::{MessageStream, SharedClient, StoreError};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::bus::{BusError, MessageBus};
use crate::envelope::Envelope;
use crate::handler::HandlerError;

/// Pause before resubscribing after the subscription stream ends.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Bridge errors.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Payload was not a routable message.
    #[error("Malformed envelope on {channel}: {reason}")]
    MalformedEnvelope { channel: String, reason: String },

    /// Local delivery failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Shared store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Bus failure.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Message could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Prefix of every routing channel.
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,

    /// Bus topics whose messages carry a [`RelayMessage`] to route.
    #[serde(default)]
    pub relay_topics: Vec<String>,
}

fn default_channel_prefix() -> String {
    "websocket:".to_string()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            channel_prefix: default_channel_prefix(),
            relay_topics: Vec::new(),
        }
    }
}

/// Where a bridged message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Broadcast,
    User(String),
    Room(String),
    Notification(String),
}

impl Route {
    /// Channel name relative to the prefix.
    #[must_use]
    pub fn channel(&self) -> String {
        match self {
            Route::Broadcast => "broadcast".to_string(),
            Route::User(id) => format!("user:{id}"),
            Route::Room(id) => format!("room:{id}"),
            Route::Notification(id) => format!("notification:{id}"),
        }
    }

    /// Parse a channel name relative to the prefix.
    #[must_use]
    pub fn parse(channel: &str) -> Option<Self> {
        if channel == "broadcast" {
            return Some(Route::Broadcast);
        }
        let (kind, id) = channel.split_once(':')?;
        if id.is_empty() {
            return None;
        }
        match kind {
            "user" => Some(Route::User(id.to_string())),
            "room" => Some(Route::Room(id.to_string())),
            "notification" => Some(Route::Notification(id.to_string())),
            _ => None,
        }
    }
}

/// Pub/sub payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChannelPayload {
    message: Message,
}

/// Payload of relay topics on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayMessage {
    /// Channel name relative to the prefix, e.g. `user:42`.
    pub channel: String,
    pub message: Message,
}

/// Deliver to this process's connections. Targets absent here are not
/// an error.
async fn deliver(registry: &Registry, route: &Route, message: &Message) -> Result<usize, BridgeError> {
    let result = match route {
        Route::Broadcast => registry.broadcast(message).await,
        Route::User(id) | Route::Notification(id) => registry.send_to_user(id, message).await,
        Route::Room(room) => registry.send_to_room(room, message).await,
    };
    match result {
        Ok(delivered) => Ok(delivered),
        Err(err) if err.is_not_found() => Ok(0),
        Err(err) => Err(err.into()),
    }
}

/// Subscribes to routing channels and delivers locally.
#[derive(Debug, Clone)]
pub struct Bridge {
    client: SharedClient,
    registry: Registry,
    /// Full channel prefix including the store key prefix.
    prefix: String,
}

impl Bridge {
    #[must_use]
    pub fn new(client: SharedClient, registry: Registry, config: &BridgeConfig) -> Self {
        let prefix = client.key(&config.channel_prefix);
        Self {
            client,
            registry,
            prefix,
        }
    }

    /// Patterns this bridge subscribes to.
    #[must_use]
    pub fn patterns(&self) -> Vec<String> {
        ["broadcast", "user:*", "room:*", "notification:*"]
            .iter()
            .map(|suffix| format!("{}{}", self.prefix, suffix))
            .collect()
    }

    /// Subscribe, then deliver in a background task until `cancel` fires.
    /// The subscription is active when this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial subscription fails.
    pub async fn start(self, cancel: CancellationToken) -> Result<JoinHandle<()>, BridgeError> {
        let Some(store) = self.client.store().cloned() else {
            info!("Shared store disabled, bridge idle");
            return Ok(tokio::spawn(async move { cancel.cancelled().await }));
        };
        let patterns = self.patterns();
        let stream = store.psubscribe(&patterns).await?;
        info!(patterns = ?patterns, "Bridge subscribed");
        Ok(tokio::spawn(self.run(stream, cancel)))
    }

    async fn run(self, mut stream: MessageStream, cancel: CancellationToken) {
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => break,
                next = stream.next() => next,
            };

            match next {
                Some(msg) => match self.dispatch(&msg.channel, &msg.payload).await {
                    Ok(_) => {}
                    Err(err @ BridgeError::MalformedEnvelope { .. }) => {
                        warn!(error = %err, "Dropping bridged message");
                    }
                    Err(err) => {
                        error!(channel = %msg.channel, error = %err, "Bridged delivery failed");
                    }
                },
                None => {
                    warn!("Bridge subscription ended, resubscribing");
                    match self.resubscribe(&cancel).await {
                        Some(fresh) => stream = fresh,
                        None => break,
                    }
                }
            }
        }
        debug!("Bridge stopped");
    }

    async fn resubscribe(&self, cancel: &CancellationToken) -> Option<MessageStream> {
        let store = self.client.store()?;
        let patterns = self.patterns();
        loop {
            tokio::select! {
                () = cancel.cancelled() => return None,
                () = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
            }
            match store.psubscribe(&patterns).await {
                Ok(stream) => return Some(stream),
                Err(err) => warn!(error = %err, "Bridge resubscribe failed"),
            }
        }
    }

    /// Route one pub/sub message. Channels outside the bridge's namespace
    /// are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::MalformedEnvelope`] if the payload is not a
    /// `{"message": ...}` object.
    pub async fn dispatch(&self, channel: &str, payload: &str) -> Result<usize, BridgeError> {
        let Some(route) = channel.strip_prefix(&self.prefix).and_then(Route::parse) else {
            trace!(channel = %channel, "Ignoring unrouted channel");
            return Ok(0);
        };
        let ChannelPayload { message } =
            serde_json::from_str(payload).map_err(|err| BridgeError::MalformedEnvelope {
                channel: channel.to_string(),
                reason: err.to_string(),
            })?;
        let delivered = deliver(&self.registry, &route, &message).await?;
        trace!(channel = %channel, delivered, "Bridged message delivered");
        Ok(delivered)
    }

    /// Consume a bus topic of [`RelayMessage`]s and deliver them locally.
    /// Every process relaying the same topic shares one consumer group, so
    /// relay topics suit deliveries to rooms and users pinned to one node;
    /// fleet-wide fan-out goes through [`BridgePublisher`].
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be created.
    pub async fn relay_topic(
        &self,
        bus: &MessageBus,
        topic: &str,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>, BridgeError> {
        let registry = self.registry.clone();
        let handler = move |envelope: Envelope| {
            let registry = registry.clone();
            async move {
                let relay = match envelope.payload_as::<RelayMessage>() {
                    Ok(relay) => relay,
                    Err(err) => {
                        warn!(topic = %envelope.topic, id = %envelope.id, error = %err, "Dropping malformed relay message");
                        return Ok(());
                    }
                };
                let Some(route) = Route::parse(&relay.channel) else {
                    warn!(channel = %relay.channel, "Dropping relay message for unknown channel");
                    return Ok(());
                };
                deliver(&registry, &route, &relay.message)
                    .await
                    .map(|_| ())
                    .map_err(|err| Box::new(err) as HandlerError)
            }
        };
        Ok(bus.subscribe(topic, handler, cancel).await?)
    }
}

/// Sends messages through the bridge, or straight to the local registry
/// when the shared store is disabled.
#[derive(Debug, Clone)]
pub struct BridgePublisher {
    client: SharedClient,
    registry: Registry,
    prefix: String,
}

impl BridgePublisher {
    #[must_use]
    pub fn new(client: SharedClient, registry: Registry, config: &BridgeConfig) -> Self {
        let prefix = client.key(&config.channel_prefix);
        Self {
            client,
            registry,
            prefix,
        }
    }

    /// # Errors
    ///
    /// Returns an error if publishing or local delivery fails.
    pub async fn broadcast(&self, message: &Message) -> Result<usize, BridgeError> {
        self.publish(&Route::Broadcast, message).await
    }

    /// # Errors
    ///
    /// Returns an error if publishing or local delivery fails.
    pub async fn to_user(&self, user_id: &str, message: &Message) -> Result<usize, BridgeError> {
        self.publish(&Route::User(user_id.to_string()), message).await
    }

    /// # Errors
    ///
    /// Returns an error if publishing or local delivery fails.
    pub async fn to_room(&self, room: &str, message: &Message) -> Result<usize, BridgeError> {
        self.publish(&Route::Room(room.to_string()), message).await
    }

    /// Send a tagged notification to every connection of a user.
    ///
    /// # Errors
    ///
    /// Returns an error if publishing or local delivery fails.
    pub async fn notify(&self, user_id: &str, notification: &Notification) -> Result<usize, BridgeError> {
        let message = notification_message(user_id, notification);
        self.publish(&Route::Notification(user_id.to_string()), &message)
            .await
    }

    /// Publish on the route's channel. Returns the number of subscribed
    /// processes, or of local connections reached when disabled.
    ///
    /// # Errors
    ///
    /// Returns an error if publishing or local delivery fails.
    pub async fn publish(&self, route: &Route, message: &Message) -> Result<usize, BridgeError> {
        let Some(store) = self.client.store() else {
            return deliver(&self.registry, route, message).await;
        };
        let channel = format!("{}{}", self.prefix, route.channel());
        let payload = serde_json::to_string(&ChannelPayload {
            message: message.clone(),
        })?;
        let receivers = store.publish(&channel, &payload).await?;
        trace!(channel = %channel, receivers, "Published to bridge");
        Ok(receivers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_parse() {
        assert_eq!(Route::parse("broadcast"), Some(Route::Broadcast));
        assert_eq!(Route::parse("user:42"), Some(Route::User("42".into())));
        assert_eq!(Route::parse("room:a:b"), Some(Route::Room("a:b".into())));
        assert_eq!(
            Route::parse("notification:7"),
            Some(Route::Notification("7".into()))
        );
        assert_eq!(Route::parse("user:"), None);
        assert_eq!(Route::parse("presence:1"), None);
    }

    #[test]
    fn test_patterns_include_store_prefix() {
        let (registry, _actor) = Registry::new(
            courier_core::RegistryConfig::default(),
            courier_core::GroupManager::memory(),
            courier_core::EventBus::new(),
        );
        let client = SharedClient::memory().with_prefix("app:");
        let bridge = Bridge::new(client, registry, &BridgeConfig::default());
        assert_eq!(
            bridge.patterns(),
            vec![
                "app:websocket:broadcast",
                "app:websocket:user:*",
                "app:websocket:room:*",
                "app:websocket:notification:*",
            ]
        );
    }
}
