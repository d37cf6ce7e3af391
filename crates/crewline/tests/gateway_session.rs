//! Session client tests against an in-process mock gateway.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

use crewline::gateway::{GatewayClient, SessionSink};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Sink that records every cumulative text snapshot it receives.
#[derive(Default)]
struct RecordingSink {
    snapshots: Mutex<Vec<String>>,
}

impl RecordingSink {
    fn snapshots(&self) -> Vec<String> {
        self.snapshots.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionSink for RecordingSink {
    async fn on_text(&self, text: &str) {
        self.snapshots.lock().unwrap().push(text.to_string());
    }
}

/// Start a one-connection mock gateway and hand the accepted socket to the
/// script. Returns the URL to point the client at.
async fn spawn_gateway<F, Fut>(script: F) -> String
where
    F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        script(ws).await;
    });
    format!("http://{addr}")
}

async fn read_request(ws: &mut WebSocketStream<TcpStream>) -> Value {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(text.as_str()).unwrap();
            }
            Some(Ok(_)) => continue,
            other => panic!("connection ended before a request arrived: {other:?}"),
        }
    }
}

async fn send_json(ws: &mut WebSocketStream<TcpStream>, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

/// Accept the handshake and the turn start, returning the assigned run id.
async fn accept_turn(ws: &mut WebSocketStream<TcpStream>, run_id: &str) {
    let connect = read_request(ws).await;
    assert_eq!(connect["method"], "connect");
    assert_eq!(connect["params"]["minProtocol"], 3);
    send_json(ws, json!({"type": "res", "id": connect["id"], "ok": true})).await;

    let chat_send = read_request(ws).await;
    assert_eq!(chat_send["method"], "chat.send");
    assert!(!chat_send["params"]["idempotencyKey"].as_str().unwrap().is_empty());
    send_json(
        ws,
        json!({"type": "res", "id": chat_send["id"], "ok": true, "result": {"runId": run_id}}),
    )
    .await;
}

#[tokio::test]
async fn test_cumulative_snapshots_replace_not_append() {
    let url = spawn_gateway(|mut ws| async move {
        accept_turn(&mut ws, "run-1").await;

        for text in ["Hello", "Hello world", "Hello world!"] {
            send_json(
                &mut ws,
                json!({"type": "event", "event": "agent",
                       "payload": {"stream": "assistant", "run": "run-1",
                                   "data": {"text": text}}}),
            )
            .await;
        }
        send_json(
            &mut ws,
            json!({"type": "event", "event": "chat",
                   "payload": {"state": "final", "run": "run-1"}}),
        )
        .await;
    })
    .await;

    let client = GatewayClient::new(url, "tok");
    let sink = RecordingSink::default();
    let result = client
        .run_session("feishu:role:dev:chat:oc_1", "hi", &sink, TEST_TIMEOUT)
        .await;

    assert_eq!(result.as_deref(), Some("Hello world!"));
    assert_eq!(sink.snapshots(), vec!["Hello", "Hello world", "Hello world!"]);
}

#[tokio::test]
async fn test_final_body_used_when_nothing_streamed() {
    let url = spawn_gateway(|mut ws| async move {
        accept_turn(&mut ws, "run-1").await;
        send_json(
            &mut ws,
            json!({"type": "event", "event": "chat",
                   "payload": {"state": "final", "run": "run-1",
                               "message": {"content": "the full answer"}}}),
        )
        .await;
    })
    .await;

    let client = GatewayClient::new(url, "tok");
    let sink = RecordingSink::default();
    let result = client
        .run_session("feishu:role:dev:chat:oc_1", "hi", &sink, TEST_TIMEOUT)
        .await;

    assert_eq!(result.as_deref(), Some("the full answer"));
}

#[tokio::test]
async fn test_final_body_does_not_override_streamed_text() {
    let url = spawn_gateway(|mut ws| async move {
        accept_turn(&mut ws, "run-1").await;
        send_json(
            &mut ws,
            json!({"type": "event", "event": "agent",
                   "payload": {"stream": "assistant", "run": "run-1",
                               "data": {"text": "streamed answer"}}}),
        )
        .await;
        send_json(
            &mut ws,
            json!({"type": "event", "event": "chat",
                   "payload": {"state": "final", "run": "run-1",
                               "message": {"content": "duplicate body"}}}),
        )
        .await;
    })
    .await;

    let client = GatewayClient::new(url, "tok");
    let result = client
        .run_session(
            "feishu:role:dev:chat:oc_1",
            "hi",
            &RecordingSink::default(),
            TEST_TIMEOUT,
        )
        .await;

    assert_eq!(result.as_deref(), Some("streamed answer"));
}

#[tokio::test]
async fn test_events_from_other_runs_are_ignored() {
    let url = spawn_gateway(|mut ws| async move {
        accept_turn(&mut ws, "run-mine").await;

        send_json(
            &mut ws,
            json!({"type": "event", "event": "agent",
                   "payload": {"stream": "assistant", "run": "run-other",
                               "data": {"text": "someone else's turn"}}}),
        )
        .await;
        send_json(
            &mut ws,
            json!({"type": "event", "event": "agent",
                   "payload": {"stream": "assistant", "run": "run-mine",
                               "data": {"text": "my answer"}}}),
        )
        .await;
        // A final for the other run must not end this turn.
        send_json(
            &mut ws,
            json!({"type": "event", "event": "chat",
                   "payload": {"state": "final", "run": "run-other"}}),
        )
        .await;
        send_json(
            &mut ws,
            json!({"type": "event", "event": "chat",
                   "payload": {"state": "final", "run": "run-mine"}}),
        )
        .await;
    })
    .await;

    let client = GatewayClient::new(url, "tok");
    let sink = RecordingSink::default();
    let result = client
        .run_session("feishu:role:dev:chat:oc_1", "hi", &sink, TEST_TIMEOUT)
        .await;

    assert_eq!(result.as_deref(), Some("my answer"));
    assert_eq!(sink.snapshots(), vec!["my answer"]);
}

#[tokio::test]
async fn test_unrelated_frames_are_skipped() {
    let url = spawn_gateway(|mut ws| async move {
        // Noise before the handshake response still lets the poll succeed.
        send_json(&mut ws, json!({"type": "event", "event": "health", "payload": {}})).await;

        let connect = read_request(&mut ws).await;
        send_json(&mut ws, json!({"type": "res", "id": connect["id"], "ok": true})).await;

        let chat_send = read_request(&mut ws).await;
        send_json(
            &mut ws,
            json!({"type": "res", "id": chat_send["id"], "ok": true, "result": {}}),
        )
        .await;

        // No run id assigned: events pass unfiltered.
        send_json(
            &mut ws,
            json!({"type": "event", "event": "agent",
                   "payload": {"stream": "assistant", "data": {"text": "unfiltered"}}}),
        )
        .await;
        send_json(
            &mut ws,
            json!({"type": "event", "event": "chat", "payload": {"state": "final"}}),
        )
        .await;
    })
    .await;

    let client = GatewayClient::new(url, "tok");
    let result = client
        .run_session(
            "feishu:role:dev:chat:oc_1",
            "hi",
            &RecordingSink::default(),
            TEST_TIMEOUT,
        )
        .await;

    assert_eq!(result.as_deref(), Some("unfiltered"));
}

#[tokio::test]
async fn test_rejected_handshake_sends_no_turn() {
    let (seen_tx, seen_rx) = tokio::sync::oneshot::channel::<Vec<String>>();

    let url = spawn_gateway(|mut ws| async move {
        let connect = read_request(&mut ws).await;
        send_json(&mut ws, json!({"type": "res", "id": connect["id"], "ok": false})).await;
        ws.close(None).await.unwrap();

        let mut methods = vec![connect["method"].as_str().unwrap().to_string()];
        // Drain whatever else the client sent before closing.
        while let Some(Ok(Message::Text(text))) = ws.next().await {
            if let Ok(frame) = serde_json::from_str::<Value>(text.as_str())
                && let Some(method) = frame["method"].as_str()
            {
                methods.push(method.to_string());
            }
        }
        seen_tx.send(methods).unwrap();
    })
    .await;

    let client = GatewayClient::new(url, "bad-token");
    let result = client
        .run_session(
            "feishu:role:dev:chat:oc_1",
            "hi",
            &RecordingSink::default(),
            TEST_TIMEOUT,
        )
        .await;

    assert_eq!(result, None);
    assert_eq!(seen_rx.await.unwrap(), vec!["connect"]);
}

#[tokio::test]
async fn test_rejected_turn_start_yields_none() {
    let url = spawn_gateway(|mut ws| async move {
        let connect = read_request(&mut ws).await;
        send_json(&mut ws, json!({"type": "res", "id": connect["id"], "ok": true})).await;

        let chat_send = read_request(&mut ws).await;
        send_json(
            &mut ws,
            json!({"type": "res", "id": chat_send["id"], "ok": false,
                   "error": {"message": "session limit reached"}}),
        )
        .await;
    })
    .await;

    let client = GatewayClient::new(url, "tok");
    let result = client
        .run_session(
            "feishu:role:dev:chat:oc_1",
            "hi",
            &RecordingSink::default(),
            TEST_TIMEOUT,
        )
        .await;

    assert_eq!(result, None);
}

#[tokio::test]
async fn test_connection_drop_returns_partial_text() {
    let url = spawn_gateway(|mut ws| async move {
        accept_turn(&mut ws, "run-1").await;
        send_json(
            &mut ws,
            json!({"type": "event", "event": "agent",
                   "payload": {"stream": "assistant", "run": "run-1",
                               "data": {"text": "partial progress"}}}),
        )
        .await;
        // Drop without a final event.
    })
    .await;

    let client = GatewayClient::new(url, "tok");
    let result = client
        .run_session(
            "feishu:role:dev:chat:oc_1",
            "hi",
            &RecordingSink::default(),
            TEST_TIMEOUT,
        )
        .await;

    assert_eq!(result.as_deref(), Some("partial progress"));
}
