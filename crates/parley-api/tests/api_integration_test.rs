//! End-to-end tests for the parley HTTP and WebSocket surface.
//!
//! Each test boots a real coordinator with an in-process tool runtime and
//! notification sink, serves it on `127.0.0.1:0`, and drives it with
//! `reqwest` and `tokio-tungstenite`.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parley_api::server::run_server;
use parley_kernel::bridge::ToolRuntime;
use parley_kernel::notify::NotificationSink;
use parley_kernel::Coordinator;
use parley_types::capability::Capability;
use parley_types::config::CoordinatorConfig;
use parley_types::envelope::{Envelope, EnvelopeKind};
use parley_types::notification::NotificationDelivery;
use parley_types::tool::ToolDescriptor;
use parley_wire::{decode_frame, encode_frame, StreamFrame};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

struct SandboxRuntime;

#[async_trait]
impl ToolRuntime for SandboxRuntime {
    async fn list_registered(&self) -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor {
                name: "run_python".to_string(),
                server: "sandbox".to_string(),
                description: "Run a Python snippet".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {"code": {"type": "string"}},
                    "required": ["code"]
                }),
                enabled: true,
            },
            ToolDescriptor {
                name: "fetch_url".to_string(),
                server: "browser".to_string(),
                description: String::new(),
                input_schema: json!({"type": "object"}),
                enabled: true,
            },
        ]
    }

    async fn execute(&self, tool: &ToolDescriptor, args: Value) -> Result<Value, String> {
        Ok(json!({ "tool": tool.name, "stdout": format!("ran {}", args["code"]) }))
    }
}

#[derive(Default)]
struct RecordingSink(Mutex<Vec<(String, NotificationDelivery)>>);

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(&self, endpoint: &str, delivery: &NotificationDelivery) -> Result<(), String> {
        self.0
            .lock()
            .unwrap()
            .push((endpoint.to_string(), delivery.clone()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct TestServer {
    base: String,
    ws_base: String,
    coordinator: Arc<Coordinator>,
    sink: Arc<RecordingSink>,
    client: reqwest::Client,
}

impl TestServer {
    async fn start() -> Self {
        let mut config = CoordinatorConfig::default();
        config.capabilities = vec![
            Capability::new("code_execution", "Run code in a sandbox", "1.2.0"),
            Capability::new("browsing", "Fetch web pages", "1.0.0"),
        ];
        config
            .tools
            .capability_servers
            .insert("code_execution".to_string(), vec!["sandbox".to_string()]);

        let sink = Arc::new(RecordingSink::default());
        let coordinator =
            Coordinator::boot_with(config, Arc::new(SandboxRuntime), sink.clone()).unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run_server(coordinator.clone(), listener));

        Self {
            base: format!("http://{addr}"),
            ws_base: format!("ws://{addr}"),
            coordinator,
            sink,
            client: reqwest::Client::new(),
        }
    }

    async fn negotiate(&self, requester: &str, required: &[&str]) -> Value {
        let resp = self
            .client
            .post(format!("{}/negotiate", self.base))
            .json(&json!({
                "requester_id": requester,
                "preferences": [{"name": "a2a", "version": "1.0", "features": ["streaming"]}],
                "required": required,
                "optional": ["telepathy"],
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        resp.json().await.unwrap()
    }
}

async fn next_frame<S>(ws: &mut S) -> StreamFrame
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return decode_frame(&text).unwrap();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_card_discovery_and_negotiation() {
    let server = TestServer::start().await;

    let card: Value = server
        .client
        .get(format!("{}/.well-known/agent-card", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(card["id"], "parley-agent");
    assert_eq!(card["capabilities"].as_array().unwrap().len(), 2);

    let found: Value = server
        .client
        .post(format!("{}/discover", server.base))
        .json(&json!({"requester_id": "alice", "filter": ["browsing"]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(found.as_array().unwrap().len(), 1);
    assert_eq!(found[0]["name"], "browsing");

    let granted = server.negotiate("alice", &["code_execution"]).await;
    assert_eq!(granted["protocol"]["name"], "a2a");
    assert_eq!(granted["granted"], json!(["code_execution"]));
    assert_eq!(granted["dropped_optional"], json!(["telepathy"]));
    assert_eq!(granted["token"].as_str().unwrap().len(), 64);

    let mismatch = server
        .client
        .post(format!("{}/negotiate", server.base))
        .json(&json!({
            "requester_id": "bob",
            "preferences": [{"name": "a2a", "version": "2.0"}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(mismatch.status(), 409);
    let body: Value = mismatch.json().await.unwrap();
    assert_eq!(body["kind"], "ProtocolMismatch");

    let missing = server
        .client
        .post(format!("{}/negotiate", server.base))
        .json(&json!({
            "requester_id": "bob",
            "preferences": [{"name": "a2a", "version": "1.0"}],
            "required": ["time_travel"],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 422);
}

#[tokio::test]
async fn test_tools_require_token_and_grant() {
    let server = TestServer::start().await;

    let anon = server
        .client
        .get(format!("{}/tools", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(anon.status(), 401);
    let body: Value = anon.json().await.unwrap();
    assert_eq!(body["kind"], "Unauthorized");

    let session = server.negotiate("alice", &["code_execution"]).await;
    let token = session["token"].as_str().unwrap();

    let tools: Value = server
        .client
        .get(format!("{}/tools", server.base))
        .bearer_auth(token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let names: Vec<&str> = tools
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["run_python"]);

    let ok: Value = server
        .client
        .post(format!("{}/tools/execute", server.base))
        .bearer_auth(token)
        .json(&json!({"tool": "run_python", "args": {"code": "print(1)"}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ok["tool"], "run_python");
    assert_eq!(ok["output"]["stdout"], "ran \"print(1)\"");

    let invalid = server
        .client
        .post(format!("{}/tools/execute", server.base))
        .bearer_auth(token)
        .json(&json!({"tool": "run_python", "args": {"code": 42}}))
        .send()
        .await
        .unwrap();
    assert_eq!(invalid.status(), 400);
    let body: Value = invalid.json().await.unwrap();
    assert_eq!(body["kind"], "ToolValidationError");

    let forbidden = server
        .client
        .post(format!("{}/tools/execute", server.base))
        .bearer_auth(token)
        .json(&json!({"tool": "browser/fetch_url", "args": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(forbidden.status(), 403);
    let body: Value = forbidden.json().await.unwrap();
    assert_eq!(body["kind"], "ToolUnauthorized");

    // Tools on ungranted servers do not resolve by bare name.
    let hidden = server
        .client
        .post(format!("{}/tools/execute", server.base))
        .bearer_auth(token)
        .json(&json!({"tool": "fetch_url", "args": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(hidden.status(), 400);
}

#[tokio::test]
async fn test_message_request_and_revoke() {
    let server = TestServer::start().await;
    let session = server.negotiate("alice", &[]).await;
    let token = session["token"].as_str().unwrap();
    let sid = session["session_id"].as_str().unwrap();

    let request = json!({
        "envelope": {
            "id": "m-1",
            "session_id": sid,
            "sender": "alice",
            "recipient": "parley-agent",
            "kind": "request",
            "correlation_id": "c1",
            "payload": {"question": 42},
            "timestamp": chrono_now(),
        },
        "await_response": true,
        "timeout_ms": 2000,
    });
    let reply: Value = server
        .client
        .post(format!("{}/message", server.base))
        .bearer_auth(token)
        .json(&request)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reply["kind"], "response");
    assert_eq!(reply["correlation_id"], "c1");
    assert_eq!(reply["payload"]["echo"]["question"], 42);

    let revoked: Value = server
        .client
        .post(format!("{}/session/revoke", server.base))
        .bearer_auth(token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(revoked["revoked"], true);

    let after = server
        .client
        .post(format!("{}/message", server.base))
        .bearer_auth(token)
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(after.status(), 401);

    let health: Value = server
        .client
        .get(format!("{}/health", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["sessions"], 0);
}

#[tokio::test]
async fn test_notify_subscribe_and_publish() {
    let server = TestServer::start().await;
    let session = server.negotiate("watcher", &[]).await;
    let token = session["token"].as_str().unwrap();

    let sub: Value = server
        .client
        .post(format!("{}/notify", server.base))
        .bearer_auth(token)
        .json(&json!({
            "action": "subscribe",
            "event_types": ["task.*"],
            "endpoint": "http://hooks.example/parley",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let sub_id = sub["subscription_id"].as_str().unwrap().to_string();

    let published: Value = server
        .client
        .post(format!("{}/notify", server.base))
        .bearer_auth(token)
        .json(&json!({
            "action": "publish",
            "event_type": "task.completed",
            "payload": {"task": 7},
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(published["matched"], 1);

    for _ in 0..50 {
        if !server.sink.0.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let seen = server.sink.0.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "http://hooks.example/parley");
    assert_eq!(seen[0].1.subscription_id, sub_id);
    assert_eq!(seen[0].1.payload["task"], 7);

    let bad = server
        .client
        .post(format!("{}/notify", server.base))
        .bearer_auth(token)
        .json(&json!({
            "action": "subscribe",
            "event_types": [],
            "endpoint": "http://hooks.example/parley",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), 400);
}

#[tokio::test]
async fn test_stream_request_response_and_close_on_revoke() {
    let server = TestServer::start().await;
    let session = server.negotiate("alice", &[]).await;
    let token = session["token"].as_str().unwrap().to_string();
    let sid = parley_types::session::SessionId::parse(session["session_id"].as_str().unwrap())
        .unwrap();

    let (mut ws, _) =
        tokio_tungstenite::connect_async(format!("{}/stream?token={token}", server.ws_base))
            .await
            .unwrap();
    let hello = encode_frame(&StreamFrame::Hello {
        agent_id: "alice".to_string(),
    })
    .unwrap();
    ws.send(Message::Text(hello)).await.unwrap();
    match next_frame(&mut ws).await {
        StreamFrame::Welcome { resumed, .. } => assert!(!resumed),
        other => panic!("expected welcome, got {other:?}"),
    }

    // A request addressed to alice is delivered over her stream and her
    // reply on the stream completes the HTTP call.
    let request = Envelope::request(sid, "alice", "alice", json!({"ping": true}));
    let http = {
        let client = server.client.clone();
        let url = format!("{}/message", server.base);
        let token = token.clone();
        let body = json!({"envelope": request, "await_response": true, "timeout_ms": 5000});
        tokio::spawn(async move {
            client
                .post(url)
                .bearer_auth(token)
                .json(&body)
                .send()
                .await
                .unwrap()
                .json::<Value>()
                .await
                .unwrap()
        })
    };

    let (seq, delivered) = match next_frame(&mut ws).await {
        StreamFrame::Data { seq, envelope } => (seq, envelope),
        other => panic!("expected data, got {other:?}"),
    };
    assert_eq!(delivered.kind, EnvelopeKind::Request);
    assert_eq!(delivered.correlation_id, request.correlation_id);

    ws.send(Message::Text(encode_frame(&StreamFrame::Ack { seq }).unwrap()))
        .await
        .unwrap();
    let response = Envelope::response_to(&delivered, json!({"pong": true}));
    ws.send(Message::Text(
        encode_frame(&StreamFrame::Send { envelope: response }).unwrap(),
    ))
    .await
    .unwrap();

    let reply = http.await.unwrap();
    assert_eq!(reply["kind"], "response");
    assert_eq!(reply["payload"]["pong"], true);

    let stats = server.coordinator.transport.stats_for(sid, "alice").unwrap();
    assert!(stats.connected);
    assert_eq!(stats.buffered, 0);

    server.coordinator.revoke(sid).unwrap();
    match next_frame(&mut ws).await {
        StreamFrame::Close { .. } => {}
        other => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn test_stream_rejects_bad_token() {
    let server = TestServer::start().await;
    let (mut ws, _) =
        tokio_tungstenite::connect_async(format!("{}/stream?token=nope", server.ws_base))
            .await
            .unwrap();
    let hello = encode_frame(&StreamFrame::Hello {
        agent_id: "alice".to_string(),
    })
    .unwrap();
    ws.send(Message::Text(hello)).await.unwrap();
    match next_frame(&mut ws).await {
        StreamFrame::Error { error } => {
            assert_eq!(error.kind, parley_types::ErrorKind::Unauthorized)
        }
        other => panic!("expected error, got {other:?}"),
    }
}

fn chrono_now() -> String {
    chrono::Utc::now().to_rfc3339()
}
