//! Bridge integration tests: a real client against a real host, in process
//! and over the WebSocket endpoint.
//!
//! Run with: `cargo test -p sandbox-bridge-host --test integration`

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

use sandbox_bridge_client::InteractionClient;
use sandbox_bridge_core::config::{AiConfig, Config, HostConfig};
use sandbox_bridge_core::protocol::Envelope;
use sandbox_bridge_core::types::{
    AiResponse, InteractionIds, PersistenceScope, PushEvent, RealtimeMessage, UserProgress,
};
use sandbox_bridge_host::{HostBridge, LoopbackRealtime, UnconfiguredPersistence};

const WIDGETS: &str = "https://widgets.example";
const HOST: &str = "https://host.example";
const TIMEOUT: Duration = Duration::from_secs(5);

/// Find an available port.
fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn test_config(port: u16) -> Config {
    Config {
        host: Some(HostConfig {
            port,
            bind: Some("127.0.0.1".into()),
            origin: Some(HOST.into()),
            allowed_origins: vec![WIDGETS.into()],
        }),
        ai: Some(AiConfig {
            response_timeout_ms: 2_000,
            auto_display: false,
        }),
        ..Default::default()
    }
}

fn test_bridge(port: u16) -> (HostBridge, Arc<LoopbackRealtime>) {
    let realtime = Arc::new(LoopbackRealtime::new());
    let bridge = HostBridge::new(
        Arc::new(test_config(port)),
        realtime.clone(),
        Arc::new(UnconfiguredPersistence),
    );
    (bridge, realtime)
}

/// Start a bridge server in the background and wait for `/health`.
async fn start_test_server() -> (HostBridge, u16) {
    let port = find_free_port();
    let (bridge, _) = test_bridge(port);

    let server_bridge = bridge.clone();
    tokio::spawn(async move {
        let _ = sandbox_bridge_host::serve_with_shutdown(
            server_bridge,
            port,
            std::future::pending::<()>(),
        )
        .await;
    });

    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if reqwest::get(format!("http://127.0.0.1:{port}/health"))
            .await
            .is_ok()
        {
            break;
        }
    }
    (bridge, port)
}

async fn recv_envelope(
    stream: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
) -> Envelope {
    let msg = timeout(TIMEOUT, stream.next())
        .await
        .expect("Timed out waiting for WS message")
        .expect("Stream ended")
        .expect("WS error");
    match msg {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("Expected Text frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_health_endpoint() {
    let (bridge, port) = start_test_server().await;
    bridge
        .initialize(InteractionIds::new("l1", "s1", "i1"))
        .await;

    let body: serde_json::Value = reqwest::get(format!("http://127.0.0.1:{port}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["active"], true);
    assert_eq!(body["channels"], 0);
}

#[tokio::test]
async fn test_ws_upgrade_rejects_untrusted_origin() {
    let (_bridge, port) = start_test_server().await;

    let mut request = format!("ws://127.0.0.1:{port}/bridge/i1")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Origin", "https://evil.example".parse().unwrap());

    match tokio_tungstenite::connect_async(request).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 403);
        }
        other => panic!("Expected 403, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_ws_ready_and_request_reply() {
    let (bridge, port) = start_test_server().await;
    bridge
        .initialize(InteractionIds::new("l1", "s1", "i1"))
        .await;

    let mut request = format!("ws://127.0.0.1:{port}/bridge/i1")
        .into_client_request()
        .unwrap();
    request.headers_mut().insert("Origin", WIDGETS.parse().unwrap());
    let (mut ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("WS connect failed");

    let ready = recv_envelope(&mut ws).await;
    assert_eq!(ready.kind, "ai-sdk-ready");
    assert_eq!(ready.str_field("interactionId"), Some("i1"));

    let req = json!({"type": "ai-sdk-update-state", "requestId": "req-1", "key": "step", "value": 4});
    ws.send(Message::Text(req.to_string().into())).await.unwrap();
    let ack = recv_envelope(&mut ws).await;
    assert_eq!(ack.kind, "ai-sdk-update-state-ack");
    assert_eq!(ack.request_id.as_deref(), Some("req-1"));

    let req = json!({"type": "ai-sdk-get-state", "requestId": "req-2", "key": "step"});
    ws.send(Message::Text(req.to_string().into())).await.unwrap();
    let ack = recv_envelope(&mut ws).await;
    assert_eq!(ack.request_id.as_deref(), Some("req-2"));
    assert_eq!(ack.get("value"), Some(&json!(4)));

    // Unknown type with a request id gets an error reply.
    let req = json!({"type": "ai-sdk-teleport", "requestId": "req-3"});
    ws.send(Message::Text(req.to_string().into())).await.unwrap();
    let ack = recv_envelope(&mut ws).await;
    assert_eq!(ack.str_field("code"), Some("unknown_message_type"));

    ws.close(None).await.unwrap();
    for _ in 0..50 {
        if bridge.channel_count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(bridge.channel_count().await, 0);
}

#[tokio::test]
async fn test_in_process_client_end_to_end() {
    let (bridge, realtime) = test_bridge(18790);
    let (_, port) = bridge.mount("i1", WIDGETS).await.unwrap();
    let client = InteractionClient::new(port, Some(HOST), Duration::from_secs(2));

    // Requests before initialise are rejected, not ignored.
    let err = client.get_state().await.unwrap_err();
    assert_eq!(err.code(), "not_initialized");

    bridge
        .initialize(InteractionIds::new("l1", "s1", "i1"))
        .await;
    let ids = client.wait_ready(TIMEOUT).await.unwrap().unwrap();
    assert_eq!(ids.lesson_id, "l1");

    client.update_state("answer", json!("b")).unwrap();
    assert_eq!(
        client.get_state_value("answer").await.unwrap(),
        Some(json!("b"))
    );
    assert_eq!(client.get_context().await.unwrap().interaction_id, "i1");

    // Durable subscription receives pushed responses.
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let subscription = client
        .on_response(move |resp| sink.lock().unwrap().push(resp.content))
        .await
        .unwrap();
    bridge.handle_push(PushEvent::Response(AiResponse {
        content: "Keep going".into(),
        ..Default::default()
    }));

    // One-shot AI request answered by a fake tutor on the loopback channel.
    let mut published = realtime.subscribe();
    let tutor = bridge.clone();
    tokio::spawn(async move {
        while let Ok(message) = published.recv().await {
            if let RealtimeMessage::AiRequest { context, prompt, .. } = message {
                tutor.handle_push(PushEvent::Response(AiResponse {
                    content: format!("Answer to {prompt}"),
                    interaction_id: Some(context.interaction_id),
                    ..Default::default()
                }));
            }
        }
    });
    let answer = client.request_ai_response("what next?").await.unwrap();
    assert_eq!(answer.content, "Answer to what next?");

    for _ in 0..50 {
        if received.lock().unwrap().len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        received.lock().unwrap().first().map(String::as_str),
        Some("Keep going")
    );
    subscription.unsubscribe().unwrap();

    // Progress fails closed without a persistence scope.
    let err = client
        .save_user_progress(&UserProgress {
            score: Some(0.0),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "missing_context");

    // With a scope, a failing backend surfaces as an unsuccessful outcome.
    bridge.facade().set_context(PersistenceScope {
        lesson_id: "l1".into(),
        stage_id: "st1".into(),
        substage_id: "s1".into(),
        interaction_type_id: "quiz".into(),
    });
    let outcome = client.save_instance_data(json!({"answer": "b"})).await.unwrap();
    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("No persistence API"));

    // Destroy tears the channel's view down.
    assert_eq!(bridge.destroy().await, 1);
    let err = client.get_state().await.unwrap_err();
    assert_eq!(err.code(), "not_initialized");
}
