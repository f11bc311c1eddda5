//! End-to-end tests using a real WebSocket client against the echo server.

use std::time::Duration;

use chanmux_server::{ServerConfig, ServerHandle};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn boot_server(channels: &[&str]) -> (String, ServerHandle) {
    let config = ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        channels: channels.iter().map(|c| c.to_string()).collect(),
        ..Default::default()
    };
    let handle = chanmux_server::start(config).await.unwrap();
    (format!("ws://127.0.0.1:{}/ws", handle.port), handle)
}

async fn connect(url: &str) -> WsStream {
    let (ws, _) = timeout(TIMEOUT, connect_async(url)).await.unwrap().unwrap();
    ws
}

async fn send_json(ws: &mut WsStream, value: serde_json::Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

/// Next text message, skipping control frames.
async fn recv_text(ws: &mut WsStream) -> String {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended")
            .expect("read failed");
        match msg {
            Message::Text(text) => return text.as_str().to_owned(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

async fn wait_for_sessions(handle: &ServerHandle, expected: usize) {
    timeout(TIMEOUT, async {
        while handle.registry().count() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session count never settled");
}

#[tokio::test]
async fn ten_round_trips_echo_unchanged() {
    let (url, handle) = boot_server(&["dp"]).await;
    let mut ws = connect(&url).await;

    for _ in 0..10 {
        send_json(&mut ws, json!({"channel": "dp", "payload": "regular string"})).await;
        assert_eq!(recv_text(&mut ws).await, "\"regular string\"");
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn pipelined_messages_keep_order() {
    let (url, handle) = boot_server(&["dp"]).await;
    let mut ws = connect(&url).await;

    for i in 0..50 {
        send_json(&mut ws, json!({"channel": "dp", "payload": {"n": i}})).await;
    }
    for i in 0..50 {
        let echoed: serde_json::Value = serde_json::from_str(&recv_text(&mut ws).await).unwrap();
        assert_eq!(echoed, json!({"n": i}));
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn malformed_and_unknown_messages_do_not_end_session() {
    let (url, handle) = boot_server(&["dp"]).await;
    let mut ws = connect(&url).await;

    ws.send(Message::text("definitely not json")).await.unwrap();
    send_json(&mut ws, json!({"channel": "unknown", "payload": 1})).await;
    send_json(&mut ws, json!({"payload": 2})).await;
    send_json(&mut ws, json!({"channel": "dp", "payload": 3})).await;

    assert_eq!(recv_text(&mut ws).await, "3");
    assert_eq!(handle.registry().open_count(), 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn each_channel_is_echoed_independently() {
    let (url, handle) = boot_server(&["a", "b"]).await;
    let mut ws = connect(&url).await;

    send_json(&mut ws, json!({"channel": "a", "payload": "from-a"})).await;
    assert_eq!(recv_text(&mut ws).await, "\"from-a\"");
    send_json(&mut ws, json!({"channel": "b", "payload": "from-b"})).await;
    assert_eq!(recv_text(&mut ws).await, "\"from-b\"");

    handle.shutdown().await;
}

#[tokio::test]
async fn client_close_tears_down_session() {
    let (url, handle) = boot_server(&["dp"]).await;
    let mut ws = connect(&url).await;
    wait_for_sessions(&handle, 1).await;

    ws.close(None).await.unwrap();
    wait_for_sessions(&handle, 0).await;

    handle.shutdown().await;
}

#[tokio::test]
async fn sessions_are_isolated_per_connection() {
    let (url, handle) = boot_server(&["dp"]).await;
    let mut first = connect(&url).await;
    let mut second = connect(&url).await;
    wait_for_sessions(&handle, 2).await;

    send_json(&mut first, json!({"channel": "dp", "payload": "one"})).await;
    send_json(&mut second, json!({"channel": "dp", "payload": "two"})).await;
    assert_eq!(recv_text(&mut first).await, "\"one\"");
    assert_eq!(recv_text(&mut second).await, "\"two\"");

    handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_connected_clients() {
    let (url, handle) = boot_server(&["dp"]).await;
    let mut ws = connect(&url).await;
    wait_for_sessions(&handle, 1).await;

    handle.shutdown().await;

    let ended = timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "client was not disconnected");
}
