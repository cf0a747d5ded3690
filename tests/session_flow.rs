//! End-to-end session behavior against an in-process WebSocket server.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use debug_session_rs::{
    ConnectionEvent, ConnectionOptions, ConnectionState, SessionClient, SessionClientOptions,
    SessionMessage,
};

/// Debug-server stand-in: logs every envelope it receives, answers pings
/// with matching pongs, greets each handshake with a server-side ping, and
/// echoes correlated replies for requests carrying a message id.
async fn spawn_server() -> (String, Arc<Mutex<Vec<Value>>>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    let server_log = Arc::clone(&log);
    let handle = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            while let Some(Ok(frame)) = ws.next().await {
                let Message::Text(text) = frame else { continue };
                let Ok(value) = serde_json::from_str::<Value>(text.as_str()) else {
                    continue;
                };
                server_log.lock().await.push(value.clone());

                match value.get("type").and_then(Value::as_str) {
                    Some("ping") => {
                        let pong = serde_json::json!({"type": "pong", "time": value.get("time")});
                        let _ = ws.send(Message::Text(pong.to_string().into())).await;
                    }
                    Some("handshake") => {
                        let ping = serde_json::json!({"type": "ping", "time": 4242});
                        let _ = ws.send(Message::Text(ping.to_string().into())).await;
                    }
                    Some("pong") => {}
                    _ => {
                        if let Some(id) = value.pointer("/meta/messageId").and_then(Value::as_str) {
                            let reply = serde_json::json!({
                                "type": "reply",
                                "payload": {"echo": value.get("payload")},
                                "meta": {"responseToId": id},
                            });
                            let _ = ws.send(Message::Text(reply.to_string().into())).await;
                        }
                    }
                }
            }
        }
    });

    (format!("ws://{}/", addr), log, handle)
}

async fn received_types(log: &Mutex<Vec<Value>>) -> Vec<String> {
    log.lock()
        .await
        .iter()
        .filter_map(|v| v.get("type").and_then(Value::as_str).map(str::to_string))
        .collect()
}

/// Polls until `predicate` holds or two seconds pass.
async fn wait_until<F, Fut>(mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if predicate().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within deadline");
}

#[tokio::test]
async fn test_send_and_wait_resolves_with_correlated_reply() {
    let (url, _log, server) = spawn_server().await;
    let client = SessionClient::new(SessionClientOptions::default());
    client.connect(&url).await.unwrap();

    let reply = client
        .send_and_wait(
            SessionMessage::new("eval", serde_json::json!({"expr": "2*21"})),
            Some(Duration::from_secs(2)),
        )
        .await
        .unwrap();

    assert_eq!(reply.msg_type, "reply");
    assert_eq!(reply.payload["echo"]["expr"], "2*21");

    client.disconnect().await.unwrap();
    server.abort();
}

#[tokio::test]
async fn test_handshake_precedes_queued_messages_in_fifo_order() {
    let (url, log, server) = spawn_server().await;
    let client = SessionClient::new(SessionClientOptions::default());

    // Issued while disconnected: all three must be buffered, none dropped
    for msg_type in ["alpha", "beta", "gamma"] {
        assert!(!client.send(SessionMessage::new(msg_type, Value::Null)).await);
    }
    assert_eq!(client.queued_messages(), 3);

    client.connect(&url).await.unwrap();

    wait_until(|| async { received_types(&log).await.contains(&"gamma".to_string()) }).await;

    let order: Vec<String> = received_types(&log)
        .await
        .into_iter()
        .filter(|t| t != "pong")
        .collect();
    assert_eq!(order, ["handshake", "alpha", "beta", "gamma"]);
    assert_eq!(client.queued_messages(), 0);

    client.disconnect().await.unwrap();
    server.abort();
}

#[tokio::test]
async fn test_client_answers_server_ping_with_matching_pong() {
    let (url, log, server) = spawn_server().await;
    let client = SessionClient::new(SessionClientOptions::default());
    client.connect(&url).await.unwrap();

    // The server pings right after the handshake
    wait_until(|| async { received_types(&log).await.contains(&"pong".to_string()) }).await;

    let pong_time = log
        .lock()
        .await
        .iter()
        .find(|v| v.get("type").and_then(Value::as_str) == Some("pong"))
        .and_then(|v| v.get("time").and_then(Value::as_u64));
    assert_eq!(pong_time, Some(4242));

    client.disconnect().await.unwrap();
    server.abort();
}

#[tokio::test]
async fn test_reconnect_exhaustion_leaves_connection_closed() {
    let (url, _log, server) = spawn_server().await;
    let client = SessionClient::new(SessionClientOptions {
        connection: ConnectionOptions {
            reconnect_interval: 10,
            max_reconnect_attempts: 2,
            ..Default::default()
        },
        ..Default::default()
    });
    client.connect(&url).await.unwrap();

    let connection = client.connection().await.unwrap();
    let (_sub, mut events) = connection.on_any();

    // Kill the server: the socket drops and the port stops accepting
    server.abort();

    let mut reconnect_attempts_seen = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("ran out of time waiting for reconnect exhaustion")
            .expect("event stream ended unexpectedly");
        match event {
            ConnectionEvent::Reconnecting { attempt } => reconnect_attempts_seen.push(attempt),
            ConnectionEvent::Error(e) if e.contains("exhausted") => break,
            _ => {}
        }
    }

    assert_eq!(reconnect_attempts_seen, [1, 2]);
    assert_eq!(connection.reconnect_attempts(), 2);
    assert_eq!(connection.state().await, ConnectionState::Closed);

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_session_reattaches_after_server_restart() {
    let (url, log, server) = spawn_server().await;
    let client = SessionClient::new(SessionClientOptions {
        connection: ConnectionOptions {
            reconnect_interval: 20,
            ..Default::default()
        },
        ..Default::default()
    });
    client.connect(&url).await.unwrap();
    // Wait for the first server to log the handshake before killing it,
    // so the >= 2 handshake condition below can be reached
    wait_until(|| async { received_types(&log).await.contains(&"handshake".to_string()) }).await;

    // Restart the server on the same port
    let addr = url
        .trim_start_matches("ws://")
        .trim_end_matches('/')
        .to_string();
    server.abort();
    // Give the old listener time to release the port
    tokio::time::sleep(Duration::from_millis(50)).await;
    let listener = TcpListener::bind(&addr).await.unwrap();
    let restart_log = Arc::clone(&log);
    let server = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                if let Ok(value) = serde_json::from_str::<Value>(text.as_str()) {
                    restart_log.lock().await.push(value);
                }
            }
        }
    });

    // The session must re-handshake on the new physical connection
    wait_until(|| async {
        received_types(&log)
            .await
            .iter()
            .filter(|t| *t == "handshake")
            .count()
            >= 2
    })
    .await;

    client.disconnect().await.unwrap();
    server.abort();
}
