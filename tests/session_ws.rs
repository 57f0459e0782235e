//! End-to-end session tests against an in-process WebSocket server.

use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;

use meetlink::config::Config;
use meetlink::protocol::SessionState;
use meetlink::session::{SessionEvent, SessionHandle, SessionOptions, TransportSession};

const PING_FRAME: &str = r#"{"type":"ping"}"#;
const CONNECTED_CAN_RECORD: &str =
    r#"{"type":"connection_status","status":"connected","canRecord":true}"#;

fn test_config(port: u16) -> Config {
    Config {
        ws_url: format!("ws://127.0.0.1:{port}"),
        api_url: format!("http://127.0.0.1:{port}"),
        capture_device: "default".to_string(),
        sample_rate: 16_000,
        channels: 1,
        period_size: 128,
    }
}

/// Quiet heartbeat, long timeout: tests that do not exercise liveness.
fn calm_options() -> SessionOptions {
    SessionOptions {
        heartbeat_interval: Duration::from_secs(60),
        pong_timeout: Duration::from_secs(60),
        backoff_base: Duration::from_millis(30),
        backoff_factor: 1.5,
        backoff_cap: Duration::from_millis(100),
        max_reconnect_attempts: 10,
    }
}

async fn start_session(
    config: &Config,
    opts: SessionOptions,
) -> (SessionHandle, mpsc::Receiver<SessionEvent>, tokio::task::JoinHandle<()>) {
    let (event_tx, event_rx) = mpsc::channel(32);
    let (session, handle) =
        TransportSession::with_options(config, "meeting-1", event_tx, opts).unwrap();
    let task = tokio::spawn(session.run());
    (handle, event_rx, task)
}

async fn accept_client(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("no incoming connection")
        .unwrap();
    accept_async(stream).await.unwrap()
}

async fn expect_ping(ws: &mut WebSocketStream<TcpStream>) {
    let msg = timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("no frame from client")
        .unwrap()
        .unwrap();
    assert_eq!(msg.to_text().unwrap(), PING_FRAME);
}

#[tokio::test]
async fn handshake_gates_binary_sends_until_connected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = test_config(listener.local_addr().unwrap().port());
    let (handle, _events, _task) = start_session(&config, calm_options()).await;

    let mut ws = accept_client(&listener).await;

    // The client probes with a ping immediately after the transport opens
    // but must stay in Connecting until the server acknowledges.
    expect_ping(&mut ws).await;
    assert_eq!(handle.status().state, SessionState::Connecting);

    // A server-declared "connecting" keeps the gate shut.
    ws.send(Message::Text(
        r#"{"type":"connection_status","status":"connecting"}"#.into(),
    ))
    .await
    .unwrap();

    handle.send_binary(Bytes::from_static(b"early")).await;
    let nothing = timeout(Duration::from_millis(150), ws.next()).await;
    assert!(nothing.is_err(), "binary frame leaked before Connected");
    assert_eq!(handle.status().state, SessionState::Connecting);
    assert!(!handle.status().can_record);

    // Handshake acknowledgment flips state and capability.
    ws.send(Message::Text(CONNECTED_CAN_RECORD.into()))
        .await
        .unwrap();
    let mut status_rx = handle.watch_status();
    status_rx
        .wait_for(|s| s.state == SessionState::Connected && s.can_record)
        .await
        .unwrap();

    // Round-trip fidelity: bytes arrive exactly as sent.
    let payload = vec![0u8, 1, 127, 128, 255, 7];
    handle.send_binary(Bytes::from(payload.clone())).await;
    let msg = timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("no binary frame")
        .unwrap()
        .unwrap();
    match msg {
        Message::Binary(data) => assert_eq!(data.as_ref(), payload.as_slice()),
        other => panic!("expected binary frame, got {:?}", other),
    }
}

#[tokio::test]
async fn connected_without_capability_keeps_can_record_false() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = test_config(listener.local_addr().unwrap().port());
    let (handle, _events, _task) = start_session(&config, calm_options()).await;

    let mut ws = accept_client(&listener).await;
    expect_ping(&mut ws).await;

    ws.send(Message::Text(
        r#"{"type":"connection_status","status":"connected","canRecord":false}"#.into(),
    ))
    .await
    .unwrap();

    let mut status_rx = handle.watch_status();
    let status = *status_rx
        .wait_for(|s| s.state == SessionState::Connected)
        .await
        .unwrap();
    assert!(!status.can_record);
}

#[tokio::test]
async fn pong_resolves_heartbeat_and_reports_latency() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = test_config(listener.local_addr().unwrap().port());
    let (_handle, mut events, _task) = start_session(&config, calm_options()).await;

    let mut ws = accept_client(&listener).await;
    expect_ping(&mut ws).await;
    ws.send(Message::Text(r#"{"type":"pong"}"#.into()))
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no event")
        .unwrap();
    assert!(matches!(event, SessionEvent::Latency(_)));
}

#[tokio::test]
async fn messages_and_transcripts_are_forwarded_malformed_dropped() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = test_config(listener.local_addr().unwrap().port());
    let (_handle, mut events, _task) = start_session(&config, calm_options()).await;

    let mut ws = accept_client(&listener).await;
    expect_ping(&mut ws).await;

    // Malformed text must be ignored, not fatal and not forwarded.
    ws.send(Message::Text("not json at all".into())).await.unwrap();
    ws.send(Message::Text(r#"{"type":"message","content":"hi"}"#.into()))
        .await
        .unwrap();
    ws.send(Message::Text(
        r#"{"type":"text","content":"hello world","final":true}"#.into(),
    ))
    .await
    .unwrap();

    match timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
        Some(SessionEvent::Message(content)) => assert_eq!(content, "hi"),
        other => panic!("expected message event, got {:?}", other),
    }
    match timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
        Some(SessionEvent::Text(raw)) => {
            assert_eq!(raw, r#"{"type":"text","content":"hello world","final":true}"#)
        }
        other => panic!("expected text event, got {:?}", other),
    }
}

#[tokio::test]
async fn control_messages_sent_verbatim_ping_routed_once() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = test_config(listener.local_addr().unwrap().port());
    let (handle, _events, _task) = start_session(&config, calm_options()).await;

    let mut ws = accept_client(&listener).await;
    expect_ping(&mut ws).await;

    handle
        .send_control(json!({"type": "listen", "mode": "auto"}))
        .await;
    let msg = timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("no control frame")
        .unwrap()
        .unwrap();
    let value: serde_json::Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
    assert_eq!(value["type"], "listen");
    assert_eq!(value["mode"], "auto");

    // A ping-typed control goes through the heartbeat path: exactly one
    // ping frame, not two.
    handle.send_control(json!({"type": "ping"})).await;
    expect_ping(&mut ws).await;
    let nothing = timeout(Duration::from_millis(150), ws.next()).await;
    assert!(nothing.is_err(), "ping control was sent twice");
}

#[tokio::test]
async fn heartbeat_timeout_forces_disconnect_and_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = test_config(listener.local_addr().unwrap().port());
    let opts = SessionOptions {
        heartbeat_interval: Duration::from_millis(50),
        pong_timeout: Duration::from_millis(150),
        backoff_base: Duration::from_millis(30),
        backoff_factor: 1.5,
        backoff_cap: Duration::from_millis(100),
        max_reconnect_attempts: 10,
    };
    let (handle, _events, _task) = start_session(&config, opts).await;

    let mut ws = accept_client(&listener).await;
    expect_ping(&mut ws).await;
    // Never answer: the armed timeout must force Disconnected.
    let mut status_rx = handle.watch_status();
    status_rx
        .wait_for(|s| s.state == SessionState::Disconnected)
        .await
        .unwrap();

    // One reconnect attempt follows the backoff.
    let mut ws2 = accept_client(&listener).await;
    expect_ping(&mut ws2).await;
    ws2.send(Message::Text(CONNECTED_CAN_RECORD.into()))
        .await
        .unwrap();
    status_rx
        .wait_for(|s| s.state == SessionState::Connected)
        .await
        .unwrap();
}

#[tokio::test]
async fn abnormal_close_code_triggers_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = test_config(listener.local_addr().unwrap().port());
    let (handle, _events, _task) = start_session(&config, calm_options()).await;

    let mut ws = accept_client(&listener).await;
    expect_ping(&mut ws).await;
    ws.send(Message::Close(Some(CloseFrame {
        code: CloseCode::Away,
        reason: "restarting".into(),
    })))
    .await
    .unwrap();

    let mut status_rx = handle.watch_status();
    status_rx
        .wait_for(|s| s.state == SessionState::Disconnected)
        .await
        .unwrap();

    let mut ws2 = accept_client(&listener).await;
    expect_ping(&mut ws2).await;
}

#[tokio::test]
async fn deliberate_close_never_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = test_config(listener.local_addr().unwrap().port());
    let (handle, _events, task) = start_session(&config, calm_options()).await;

    let mut ws = accept_client(&listener).await;
    expect_ping(&mut ws).await;
    ws.send(Message::Text(CONNECTED_CAN_RECORD.into()))
        .await
        .unwrap();

    handle.close().await;

    // The client announces a normal closure...
    loop {
        match timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no close frame")
        {
            Some(Ok(Message::Close(frame))) => {
                assert_eq!(frame.expect("empty close frame").code, CloseCode::Normal);
                break;
            }
            Some(Ok(_)) => continue,
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    // ...the task ends, and no reconnect attempt is made.
    timeout(Duration::from_secs(5), task)
        .await
        .expect("session task did not finish")
        .unwrap();
    let nothing = timeout(Duration::from_millis(300), listener.accept()).await;
    assert!(nothing.is_err(), "session reconnected after deliberate close");
}

#[tokio::test]
async fn exhausted_attempts_park_until_manual_reconnect() {
    // Reserve a port, then refuse connections on it.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = test_config(port);
    let opts = SessionOptions {
        heartbeat_interval: Duration::from_secs(60),
        pong_timeout: Duration::from_secs(60),
        backoff_base: Duration::from_millis(10),
        backoff_factor: 1.5,
        backoff_cap: Duration::from_millis(20),
        max_reconnect_attempts: 2,
    };
    let (handle, _events, _task) = start_session(&config, opts).await;

    // Two failed attempts and the session parks.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(handle.status().state, SessionState::Disconnected);

    // A recovery signal revives it immediately.
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    handle.reconnect().await;
    let mut ws = accept_client(&listener).await;
    expect_ping(&mut ws).await;
}

#[tokio::test]
async fn manual_reconnect_while_connecting_reopens_transport() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = test_config(listener.local_addr().unwrap().port());
    let (handle, _events, _task) = start_session(&config, calm_options()).await;

    // The transport is open but the server never acknowledges, so the
    // session is stuck in Connecting.
    let mut ws = accept_client(&listener).await;
    expect_ping(&mut ws).await;
    assert_eq!(handle.status().state, SessionState::Connecting);

    // A manual reconnect must not just reset counters; it drops this
    // connection and dials again.
    handle.reconnect().await;
    let mut ws2 = accept_client(&listener).await;
    expect_ping(&mut ws2).await;
    ws2.send(Message::Text(CONNECTED_CAN_RECORD.into()))
        .await
        .unwrap();
    let mut status_rx = handle.watch_status();
    status_rx
        .wait_for(|s| s.state == SessionState::Connected)
        .await
        .unwrap();
}

#[tokio::test]
async fn server_declared_disconnect_triggers_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = test_config(listener.local_addr().unwrap().port());
    let (handle, _events, _task) = start_session(&config, calm_options()).await;

    let mut ws = accept_client(&listener).await;
    expect_ping(&mut ws).await;
    ws.send(Message::Text(CONNECTED_CAN_RECORD.into()))
        .await
        .unwrap();
    let mut status_rx = handle.watch_status();
    status_rx
        .wait_for(|s| s.state == SessionState::Connected)
        .await
        .unwrap();

    // The server revokes the session; the socket is useless from here on
    // and the client must dial a fresh one.
    ws.send(Message::Text(
        r#"{"type":"connection_status","status":"disconnected"}"#.into(),
    ))
    .await
    .unwrap();
    status_rx
        .wait_for(|s| s.state == SessionState::Disconnected)
        .await
        .unwrap();

    let mut ws2 = accept_client(&listener).await;
    expect_ping(&mut ws2).await;
}

#[tokio::test]
async fn handshake_timeout_reconnects_when_status_never_arrives() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = test_config(listener.local_addr().unwrap().port());
    let opts = SessionOptions {
        heartbeat_interval: Duration::from_secs(60),
        pong_timeout: Duration::from_millis(150),
        backoff_base: Duration::from_millis(30),
        backoff_factor: 1.5,
        backoff_cap: Duration::from_millis(100),
        max_reconnect_attempts: 10,
    };
    let (handle, _events, _task) = start_session(&config, opts).await;

    // A server that answers the probe but never sends connection_status
    // leaves the handshake incomplete; the liveness window applies to it
    // just as it does to a missing pong.
    let mut ws = accept_client(&listener).await;
    expect_ping(&mut ws).await;
    ws.send(Message::Text(r#"{"type":"pong"}"#.into()))
        .await
        .unwrap();

    let mut status_rx = handle.watch_status();
    status_rx
        .wait_for(|s| s.state == SessionState::Disconnected)
        .await
        .unwrap();
    let mut ws2 = accept_client(&listener).await;
    expect_ping(&mut ws2).await;
}
