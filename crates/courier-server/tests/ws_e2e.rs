//! End-to-end WebSocket tests against a server bound to an ephemeral port.

use courier_protocol::{codec, Message, MessageType};
use courier_server::{serve, AppState, Config};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let state = AppState::start(Config::default(), shutdown.clone()).await;
    tokio::spawn(serve(listener, state));
    (addr, shutdown)
}

async fn connect(addr: SocketAddr, user: &'static str) -> Client {
    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("x-user-id", HeaderValue::from_static(user));
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    let welcome = recv_kind(&mut ws, MessageType::Welcome).await;
    assert!(welcome.data("client_id").is_some());
    ws
}

async fn recv(ws: &mut Client) -> Message {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .unwrap();
        if let WsMessage::Text(text) = frame {
            return codec::decode(text.as_bytes()).unwrap();
        }
    }
}

/// Skip presence and other traffic until a message of `kind` arrives.
async fn recv_kind(ws: &mut Client, kind: MessageType) -> Message {
    loop {
        let msg = recv(ws).await;
        if msg.kind == kind {
            return msg;
        }
    }
}

async fn send(ws: &mut Client, value: serde_json::Value) {
    ws.send(WsMessage::Text(value.to_string())).await.unwrap();
}

/// Round-trip a ping so every earlier request on `ws` has been handled.
async fn sync(ws: &mut Client) {
    send(ws, json!({ "type": "ping" })).await;
    recv_kind(ws, MessageType::Pong).await;
}

#[tokio::test]
async fn test_welcome_and_ping() {
    let (addr, shutdown) = start_server().await;
    let mut alice = connect(addr, "alice").await;

    send(&mut alice, json!({ "type": "ping" })).await;
    assert_eq!(recv(&mut alice).await.kind, MessageType::Pong);

    shutdown.cancel();
}

#[tokio::test]
async fn test_room_message_between_clients() {
    let (addr, shutdown) = start_server().await;
    let mut alice = connect(addr, "alice").await;
    let mut bob = connect(addr, "bob").await;

    send(&mut alice, json!({ "type": "join_room", "content": "lobby" })).await;
    send(&mut bob, json!({ "type": "join_room", "room": "lobby" })).await;
    sync(&mut alice).await;
    sync(&mut bob).await;

    send(
        &mut alice,
        json!({ "type": "room_message", "room": "lobby", "content": "hi all", "from": "mallory" }),
    )
    .await;

    let received = recv_kind(&mut bob, MessageType::RoomMessage).await;
    assert_eq!(received.content, "hi all");
    assert_eq!(received.room.as_deref(), Some("lobby"));
    assert_eq!(received.from.as_deref(), Some("alice"));

    shutdown.cancel();
}

#[tokio::test]
async fn test_chat_to_user() {
    let (addr, shutdown) = start_server().await;
    let mut alice = connect(addr, "alice").await;
    let mut bob = connect(addr, "bob").await;

    send(&mut alice, json!({ "type": "chat", "to": "bob", "content": "psst" })).await;

    let received = recv_kind(&mut bob, MessageType::Chat).await;
    assert_eq!(received.content, "psst");
    assert_eq!(received.from.as_deref(), Some("alice"));

    send(&mut alice, json!({ "type": "chat", "content": "nobody" })).await;
    let error = recv_kind(&mut alice, MessageType::Error).await;
    assert_eq!(error.content["code"], 400);

    shutdown.cancel();
}

#[tokio::test]
async fn test_malformed_input_keeps_connection() {
    let (addr, shutdown) = start_server().await;
    let mut alice = connect(addr, "alice").await;

    alice
        .send(WsMessage::Text("{not json".to_string()))
        .await
        .unwrap();
    assert_eq!(recv(&mut alice).await.kind, MessageType::Error);

    sync(&mut alice).await;

    shutdown.cancel();
}

#[tokio::test]
async fn test_missing_identity_rejected() {
    let (addr, shutdown) = start_server().await;

    let err = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap_err();
    match err {
        tungstenite::Error::Http(response) => assert_eq!(response.status(), 401),
        other => panic!("unexpected error: {other}"),
    }

    // Query parameters are accepted as a fallback.
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?user_id=carol"))
        .await
        .unwrap();
    drop(ws);

    shutdown.cancel();
}

#[tokio::test]
async fn test_health_reports_connections() {
    let (addr, shutdown) = start_server().await;
    let mut alice = connect(addr, "alice").await;
    sync(&mut alice).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let health: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["registry"]["connections"], 1);
    assert_eq!(health["store"]["enabled"], false);

    shutdown.cancel();
}
