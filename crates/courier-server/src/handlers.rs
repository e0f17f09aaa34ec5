//! HTTP and WebSocket handlers.
//!
//! Each WebSocket connection runs one select loop that drains the
//! registry's outbound queue, reads client frames and keeps the heartbeat.

use crate::config::Config;
use crate::state::AppState;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use courier_core::RegistryError;
use courier_protocol::{codec, Message, MessageType};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Map;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Error codes sent back to clients.
const CODE_BAD_REQUEST: i32 = 400;
const CODE_NOT_FOUND: i32 = 404;
const CODE_INTERNAL: i32 = 500;

type Sink = SplitSink<WebSocket, WsMessage>;

/// Build the HTTP router.
pub fn build_app(state: Arc<AppState>) -> Router {
    let path = state.config.websocket_path.clone();
    Router::new()
        .route(&path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Start every service and serve until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn run_server(config: Config, shutdown: CancellationToken) -> Result<()> {
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    let path = config.websocket_path.clone();
    let state = AppState::start(config, shutdown).await;

    info!("Courier server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, path);

    serve(listener, state).await
}

/// Serve on an already bound listener, then stop the services.
///
/// # Errors
///
/// Returns an error if the server fails while accepting connections.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let app = build_app(Arc::clone(&state));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("Server error")?;

    state.stop().await;
    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let registry = state.registry.stats().await.ok();
    let status = if registry.is_some() { "ok" } else { "degraded" };

    axum::Json(serde_json::json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started.elapsed().as_secs(),
        "registry": registry,
        "store": {
            "enabled": state.client.is_enabled(),
            "backend": state.client.backend_name(),
        },
    }))
}

/// Identity set by the upstream authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Identity {
    user_id: String,
    user_name: String,
}

impl Identity {
    /// Read `x-user-id` / `x-user-name`, falling back to the `user_id` /
    /// `user_name` query parameters.
    fn extract(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<Self> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let param = |name: &str| query.get(name).filter(|v| !v.is_empty()).cloned();

        let user_id = header("x-user-id").or_else(|| param("user_id"))?;
        let user_name = header("x-user-name")
            .or_else(|| param("user_name"))
            .unwrap_or_else(|| user_id.clone());
        Some(Self { user_id, user_name })
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(identity) = Identity::extract(&headers, &query) else {
        return (StatusCode::UNAUTHORIZED, "missing user identity").into_response();
    };

    match state.registry.stats().await {
        Ok(stats) if stats.connections >= state.config.limits.max_connections => {
            warn!(limit = state.config.limits.max_connections, "Connection limit reached");
            return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
        }
        Ok(_) => {}
        Err(_) => return StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, identity, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, identity: Identity, state: Arc<AppState>) {
    let registration = match state
        .registry
        .register(&identity.user_id, &identity.user_name, Map::new())
        .await
    {
        Ok(registration) => registration,
        Err(e) => {
            warn!(user = %identity.user_id, error = %e, "Registration failed");
            return;
        }
    };
    let client_id = registration.client_id.clone();
    let mut outbound = registration.outbound;
    let closed = registration.closed;

    if let Err(e) = state
        .sessions
        .create_session(&client_id, &identity.user_id)
        .await
    {
        warn!(client = %client_id, error = %e, "Failed to create session");
    }

    debug!(client = %client_id, user = %identity.user_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    let heartbeat = &state.config.heartbeat;
    let mut ping = tokio::time::interval_at(Instant::now() + heartbeat.interval(), heartbeat.interval());
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let idle = tokio::time::sleep(heartbeat.timeout());
    tokio::pin!(idle);

    loop {
        tokio::select! {
            biased;

            () = closed.cancelled() => {
                debug!(client = %client_id, "Closed by registry");
                // Flush what was queued before the close, e.g. a kick notice.
                while let Ok(frame) = outbound.try_recv() {
                    if send_frame(&mut sender, &frame).await.is_err() {
                        break;
                    }
                }
                break;
            }

            () = state.shutdown.cancelled() => break,

            // Registry -> client
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if send_frame(&mut sender, &frame).await.is_err() {
                    break;
                }
            }

            _ = ping.tick() => {
                if sender.send(WsMessage::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }

            () = &mut idle => {
                debug!(client = %client_id, "Heartbeat timeout");
                break;
            }

            // Client -> server
            msg = receiver.next() => {
                idle.as_mut().reset(Instant::now() + heartbeat.timeout());

                let decoded = match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        if text.len() > state.config.limits.max_message_size {
                            warn!(client = %client_id, size = text.len(), "Message too large");
                            break;
                        }
                        codec::decode(text.as_bytes())
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        if data.len() > state.config.limits.max_message_size {
                            warn!(client = %client_id, size = data.len(), "Message too large");
                            break;
                        }
                        codec::decode_binary(&data)
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if sender.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(WsMessage::Pong(_))) => continue,
                    Some(Ok(WsMessage::Close(_))) => {
                        debug!(client = %client_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(client = %client_id, error = %e, "WebSocket error");
                        break;
                    }
                    None => {
                        debug!(client = %client_id, "WebSocket stream ended");
                        break;
                    }
                };

                let reply = match decoded {
                    Ok(message) => handle_message(message, &client_id, &identity, &state).await,
                    Err(e) => {
                        debug!(client = %client_id, error = %e, "Malformed message");
                        Some(Message::error(CODE_BAD_REQUEST, format!("Malformed message: {e}")))
                    }
                };
                if let Some(reply) = reply {
                    if send_message(&mut sender, &reply).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    if let Err(e) = state.registry.unregister(&client_id).await {
        debug!(client = %client_id, error = %e, "Unregister after shutdown");
    }
    if let Err(e) = state.sessions.remove_session(&client_id).await {
        warn!(client = %client_id, error = %e, "Failed to remove session");
    }
    let _ = sender.close().await;

    debug!(client = %client_id, "WebSocket disconnected");
}

/// Handle a decoded client message. Returns a direct reply, if any.
async fn handle_message(
    message: Message,
    client_id: &str,
    identity: &Identity,
    state: &AppState,
) -> Option<Message> {
    match message.kind {
        MessageType::Ping => {
            if let Err(e) = state.sessions.touch(client_id).await {
                debug!(client = %client_id, error = %e, "Session touch failed");
            }
            Some(Message::pong())
        }

        MessageType::JoinRoom | MessageType::LeaveRoom => {
            let Some(room) = message.target_room() else {
                return Some(Message::error(CODE_BAD_REQUEST, "Room name required"));
            };
            let result = if message.kind == MessageType::JoinRoom {
                state.registry.join_room(client_id, room).await
            } else {
                state.registry.leave_room(client_id, room).await
            };
            match result {
                Ok(()) => None,
                Err(e) => Some(registry_error(&e)),
            }
        }

        MessageType::RoomMessage => {
            let Some(room) = message.target_room().map(str::to_string) else {
                return Some(Message::error(CODE_BAD_REQUEST, "Room name required"));
            };
            let message = stamp(message, identity).with_room(room.clone());
            debug!(client = %client_id, room = %room, "Room message");
            match state.publisher.to_room(&room, &message).await {
                Ok(_) => None,
                Err(e) => Some(Message::error(CODE_INTERNAL, e.to_string())),
            }
        }

        MessageType::Chat => {
            let Some(to) = message.to.clone().filter(|to| !to.is_empty()) else {
                return Some(Message::error(CODE_BAD_REQUEST, "Recipient required"));
            };
            let message = stamp(message, identity);
            match state.publisher.to_user(&to, &message).await {
                Ok(_) => None,
                Err(e) => Some(Message::error(CODE_INTERNAL, e.to_string())),
            }
        }

        MessageType::Broadcast => {
            let message = stamp(message, identity);
            match state.publisher.broadcast(&message).await {
                Ok(_) => None,
                Err(e) => Some(Message::error(CODE_INTERNAL, e.to_string())),
            }
        }

        MessageType::Pong => None,

        kind => {
            debug!(client = %client_id, kind = %kind, "Unsupported message type");
            Some(Message::error(
                CODE_BAD_REQUEST,
                format!("Unsupported message type: {kind}"),
            ))
        }
    }
}

/// Overwrite the sender fields; clients cannot spoof them.
fn stamp(message: Message, identity: &Identity) -> Message {
    message.with_from(&identity.user_id, &identity.user_name)
}

fn registry_error(err: &RegistryError) -> Message {
    let code = if err.is_not_found() {
        CODE_NOT_FOUND
    } else {
        CODE_BAD_REQUEST
    };
    Message::error(code, err.to_string())
}

/// Forward a pre-encoded JSON frame from the outbound queue.
async fn send_frame(sender: &mut Sink, frame: &[u8]) -> Result<()> {
    let text = std::str::from_utf8(frame)?;
    sender.send(WsMessage::Text(text.to_owned())).await?;
    Ok(())
}

/// Send a message to the WebSocket as JSON text.
async fn send_message(sender: &mut Sink, message: &Message) -> Result<()> {
    let data = codec::encode(message)?;
    let text = String::from_utf8(data.to_vec())?;
    sender.send(WsMessage::Text(text)).await?;
    Ok(())
}
