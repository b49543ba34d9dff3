//! Integration tests for the gateway's HTTP and WebSocket surface.
//!
//! Each test spins up a real server on an ephemeral port via
//! [`run_server_with_config`], drives it with a plain WebSocket client and
//! HTTP requests, and shuts it down cleanly. Client sockets are dropped
//! before shutdown so the graceful-shutdown path never has to wait out
//! lingering connections.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use pushgate::config::GatewayConfig;
use pushgate::server::http::{ILLEGAL_REQUEST, TIMEOUT_HEADER, TIMEOUT_RESPONSE};
use pushgate::server::startup::{run_server_with_config, ServerConfig, ServerHandle};
use pushgate::server::GatewayState;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn start_test_server() -> ServerHandle {
    start_with_config(GatewayConfig::default()).await
}

async fn start_with_config(config: GatewayConfig) -> ServerHandle {
    let state = Arc::new(GatewayState::new(config));
    run_server_with_config(ServerConfig::for_testing(state))
        .await
        .unwrap()
}

/// Open a socket and send a REGISTER envelope for `token`. Does not wait
/// for the registration to land; pair with [`wait_until_bound`].
async fn connect_and_register(handle: &ServerHandle, token: &str) -> WsStream {
    let (mut ws, _) = tokio_tungstenite::connect_async(handle.ws_url())
        .await
        .expect("ws connect failed");
    let body = json!({ "token": token, "event": "integration" }).to_string();
    let frame = json!({ "Kind": 1, "Body": body }).to_string();
    ws.send(WsMessage::Text(frame.into())).await.unwrap();
    ws
}

/// Poll /lookup until the user shows up as bound.
async fn wait_until_bound(handle: &ServerHandle, user_id: &str) {
    let url = format!("{}/lookup?userid={}", handle.base_url(), user_id);
    for _ in 0..40 {
        if let Ok(resp) = reqwest::get(&url).await {
            if resp.status() == 200 {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("user {} never bound", user_id);
}

/// Run the socket as an echo client: every received `{id,msg}` command is
/// answered, after `delay`, with a Kind-255 envelope whose msg is the
/// original msg plus `suffix`. Raw received frames are forwarded for
/// assertions. Abort the returned task to hang up.
fn spawn_echo(
    mut ws: WsStream,
    suffix: &'static str,
    delay: Duration,
) -> (JoinHandle<()>, mpsc::UnboundedReceiver<String>) {
    let (raw_tx, raw_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws.next().await {
            let WsMessage::Text(text) = msg else { continue };
            let _ = raw_tx.send(text.to_string());
            let frame: serde_json::Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let id = frame["id"].as_str().unwrap_or_default().to_string();
            let msg_in = frame["msg"].as_str().unwrap_or_default().to_string();
            if id.is_empty() {
                continue;
            }
            tokio::time::sleep(delay).await;
            let body = json!({ "id": id, "msg": format!("{}{}", msg_in, suffix) }).to_string();
            let reply = json!({ "Kind": 255, "Body": body }).to_string();
            if ws.send(WsMessage::Text(reply.into())).await.is_err() {
                break;
            }
        }
    });
    (task, raw_rx)
}

async fn push(
    base_url: String,
    user: &'static str,
    comm: &'static str,
    message: &'static str,
    timeout_ms: Option<u64>,
) -> (reqwest::StatusCode, String) {
    let client = reqwest::Client::new();
    let mut req = client
        .post(format!("{}/push", base_url))
        .json(&json!({ "userId": user, "commId": comm, "message": message }));
    if let Some(ms) = timeout_ms {
        req = req.header(TIMEOUT_HEADER, ms.to_string());
    }
    let resp = req.send().await.expect("push request failed");
    let status = resp.status();
    let body = resp.text().await.unwrap();
    (status, body)
}

// ---------------------------------------------------------------------------
// 1. Basic round trip: push -> client -> reply -> HTTP response
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_basic_round_trip() {
    let handle = start_test_server().await;

    let ws = connect_and_register(&handle, "alice").await;
    wait_until_bound(&handle, "alice").await;
    let (echo, mut raw_rx) = spawn_echo(ws, "-reply", Duration::ZERO);

    let (status, body) = push(handle.base_url(), "alice", "c1", "hello", None).await;
    assert_eq!(status, 200);
    assert_eq!(body, "hello-reply");

    // The command frame on the wire is a bare {id,msg} object, not
    // envelope-wrapped.
    let raw = raw_rx.recv().await.unwrap();
    let frame: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(frame, json!({ "id": "c1", "msg": "hello" }));

    echo.abort();
    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 2. Timeout: a silent client surfaces as 500 and frees the command id
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_push_timeout_frees_command_id() {
    let handle = start_test_server().await;

    // bob registers but never answers.
    let ws = connect_and_register(&handle, "bob").await;
    wait_until_bound(&handle, "bob").await;

    let started = Instant::now();
    let (status, body) = push(handle.base_url(), "bob", "c1", "x", Some(300)).await;
    assert_eq!(status, 500);
    assert_eq!(body, TIMEOUT_RESPONSE);
    assert!(started.elapsed() >= Duration::from_millis(300));

    // The record was removed on exit: the same commId is usable again and
    // times out the same way rather than failing as a duplicate.
    let (status, body) = push(handle.base_url(), "bob", "c1", "x", Some(300)).await;
    assert_eq!(status, 500);
    assert_eq!(body, TIMEOUT_RESPONSE);

    // Property: the command table drains back to zero.
    let health: serde_json::Value = reqwest::get(format!("{}/health", handle.base_url()))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["pendingCommands"], 0);
    assert_eq!(health["boundUsers"], 1);

    drop(ws);
    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 3. Push against a user that is not connected
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_push_unknown_user() {
    let handle = start_test_server().await;

    let (status, body) = push(handle.base_url(), "ghost", "c1", "x", None).await;
    assert_eq!(status, 500);
    assert!(body.contains("no such user"), "body: {}", body);

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 4. Duplicate registration: exactly one socket is bound
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_registration_binds_exactly_one() {
    let handle = start_test_server().await;

    let first = connect_and_register(&handle, "alice").await;
    wait_until_bound(&handle, "alice").await;
    let mut second = connect_and_register(&handle, "alice").await;
    // Give the server time to process (and drop) the second registration.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (echo, _raw_rx) = spawn_echo(first, "-first", Duration::ZERO);
    let (status, body) = push(handle.base_url(), "alice", "c1", "hello", None).await;
    assert_eq!(status, 200);
    assert_eq!(body, "hello-first");

    // The losing socket stays open but never receives the command.
    let nothing = tokio::time::timeout(Duration::from_millis(200), second.next()).await;
    assert!(nothing.is_err(), "second socket unexpectedly received a frame");

    echo.abort();
    drop(second);
    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 5. Lookup semantics: 200 bound, 404 absent, 400 missing param
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lookup() {
    let handle = start_test_server().await;

    let ws = connect_and_register(&handle, "alice").await;
    wait_until_bound(&handle, "alice").await;

    let resp = reqwest::get(format!("{}/lookup?userid=alice", handle.base_url()))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = reqwest::get(format!("{}/lookup?userid=nobody", handle.base_url()))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = reqwest::get(format!("{}/lookup", handle.base_url()))
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(resp.text().await.unwrap(), ILLEGAL_REQUEST);

    drop(ws);
    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 6. Concurrent pushes with the same commId: one wins, one is rejected
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_comm_id_rejected_without_touching_winner() {
    let handle = start_test_server().await;

    let ws = connect_and_register(&handle, "alice").await;
    wait_until_bound(&handle, "alice").await;
    // Replies arrive 400ms after the command, so the first record is still
    // alive when the second push lands.
    let (echo, _raw_rx) = spawn_echo(ws, "-reply", Duration::from_millis(400));

    let base_url = handle.base_url();
    let first = push(base_url.clone(), "alice", "dup", "hello", Some(2_000));
    let second = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        push(base_url.clone(), "alice", "dup", "ignored", Some(2_000)).await
    };
    let (first, second) = tokio::join!(first, second);

    assert_eq!(first.0, 200);
    assert_eq!(first.1, "hello-reply");
    assert_eq!(second.0, 500);
    assert!(
        second.1.contains("command already exists"),
        "body: {}",
        second.1
    );

    echo.abort();
    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 7. Push auth: configured bearer token gates /push
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_push_auth() {
    let handle = start_with_config(GatewayConfig {
        auth_token: Some("secret".to_string()),
        ..GatewayConfig::default()
    })
    .await;

    let client = reqwest::Client::new();
    let body = json!({ "userId": "ghost", "commId": "c1", "message": "x" });

    let resp = client
        .post(format!("{}/push", handle.base_url()))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    // With the right token the request passes auth and fails later, on the
    // missing user.
    let resp = client
        .post(format!("{}/push", handle.base_url()))
        .header("authorization", "Bearer secret")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 8. Invalid push bodies
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_push_rejects_bad_bodies() {
    let handle = start_test_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/push", handle.base_url()))
        .header("content-type", "application/json")
        .body("{ this is not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(resp.text().await.unwrap(), ILLEGAL_REQUEST);

    let resp = client
        .post(format!("{}/push", handle.base_url()))
        .json(&json!({ "userId": "", "commId": "c1", "message": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(resp.text().await.unwrap(), ILLEGAL_REQUEST);

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 9. Wrong methods are rejected with 405
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wrong_methods_rejected() {
    let handle = start_test_server().await;
    let client = reqwest::Client::new();

    let resp = reqwest::get(format!("{}/push", handle.base_url()))
        .await
        .unwrap();
    assert_eq!(resp.status(), 405);

    let resp = client
        .post(format!("{}/lookup", handle.base_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 405);

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 10. Disconnect during the wait surfaces as timeout (default policy)
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_during_wait_surfaces_as_timeout() {
    let handle = start_test_server().await;

    let ws = connect_and_register(&handle, "carol").await;
    wait_until_bound(&handle, "carol").await;

    let base_url = handle.base_url();
    let started = Instant::now();
    let push_task =
        tokio::spawn(async move { push(base_url, "carol", "c1", "x", Some(600)).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(ws);

    let (status, body) = push_task.await.unwrap();
    assert_eq!(status, 500);
    assert_eq!(body, TIMEOUT_RESPONSE);
    // The handler ran out the clock instead of waking early.
    assert!(started.elapsed() >= Duration::from_millis(550));

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 11. Disconnect during the wait cancels early when opted in
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_cancels_early_when_opted_in() {
    let handle = start_with_config(GatewayConfig {
        cancel_on_disconnect: true,
        ..GatewayConfig::default()
    })
    .await;

    let ws = connect_and_register(&handle, "carol").await;
    wait_until_bound(&handle, "carol").await;

    let base_url = handle.base_url();
    let started = Instant::now();
    let push_task =
        tokio::spawn(async move { push(base_url, "carol", "c1", "x", Some(2_000)).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(ws);

    let (status, body) = push_task.await.unwrap();
    assert_eq!(status, 500);
    assert_eq!(body, "connection is closed");
    assert!(started.elapsed() < Duration::from_millis(1_500));

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 12. Disconnect unbinds the user
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_unbinds_user() {
    let handle = start_test_server().await;

    let ws = connect_and_register(&handle, "dave").await;
    wait_until_bound(&handle, "dave").await;
    drop(ws);

    // The close path runs shortly after the socket drops.
    let url = format!("{}/lookup?userid=dave", handle.base_url());
    let mut unbound = false;
    for _ in 0..40 {
        let resp = reqwest::get(&url).await.unwrap();
        if resp.status() == 404 {
            unbound = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(unbound, "dave never unbound after disconnect");

    // And pushes to him now fail fast.
    let (status, body) = push(handle.base_url(), "dave", "c1", "x", None).await;
    assert_eq!(status, 500);
    assert!(body.contains("no such user"));

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 13. Health endpoint
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health_endpoint_responds() {
    let handle = start_test_server().await;

    let resp = reqwest::get(format!("{}/health", handle.base_url()))
        .await
        .expect("GET /health failed");
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body.get("version").is_some());
    assert_eq!(body["boundUsers"], 0);
    assert_eq!(body["pendingCommands"], 0);

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 14. WebSocket upgrade request responds with 101
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ws_upgrade_responds_101() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let handle = start_test_server().await;
    let addr = handle.local_addr();

    let mut stream = tokio::net::TcpStream::connect(addr)
        .await
        .expect("TCP connect failed");

    let request = format!(
        "GET /ws HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n",
        addr
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = vec![0u8; 1024];
    let n = stream.read(&mut buf).await.unwrap();
    let response = String::from_utf8_lossy(&buf[..n]);
    assert!(
        response.contains("101"),
        "Expected 101 Switching Protocols, got: {}",
        response
    );

    drop(stream);
    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 15. Graceful shutdown completes and the server becomes unreachable
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_graceful_shutdown() {
    let handle = start_test_server().await;
    let url = format!("{}/health", handle.base_url());

    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status(), 200);

    tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
        .await
        .expect("Shutdown did not complete within 5s");

    let result = reqwest::get(&url).await;
    assert!(result.is_err(), "Expected connection error after shutdown");
}
