use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;
use serde_json::{json, Value};
use switchboard_sdk::session::proto::Kwargs;
use switchboard_sdk::{ClientError, LifecycleEvent, SessionClient, SessionError, SessionOptions};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;

const STEP_TIMEOUT: Duration = Duration::from_secs(2);
const TEST_SESSION_ID: &str = "sess-1";

type Observed = Result<Vec<Value>, String>;
type Scenario = fn(WebSocket) -> Pin<Box<dyn Future<Output = Observed> + Send>>;

#[derive(Clone)]
struct WsState {
    scenario: Scenario,
    observed_tx: Arc<Mutex<Option<oneshot::Sender<Observed>>>>,
}

struct MockRouter {
    url: String,
    observed_rx: oneshot::Receiver<Observed>,
    shutdown_tx: oneshot::Sender<()>,
    server_task: tokio::task::JoinHandle<()>,
}

impl MockRouter {
    async fn start(scenario: Scenario) -> Self {
        let (observed_tx, observed_rx) = oneshot::channel();
        let state = WsState {
            scenario,
            observed_tx: Arc::new(Mutex::new(Some(observed_tx))),
        };
        let app = Router::new().route("/ws", get(ws_handler)).with_state(state);
        let (addr, shutdown_tx, server_task) = spawn_server(app).await;
        Self {
            url: format!("ws://{addr}/ws"),
            observed_rx,
            shutdown_tx,
            server_task,
        }
    }

    fn client(&self) -> SessionClient {
        SessionClient::new(self.url.as_str())
    }

    /// Waits for the scenario to finish and returns the frames it recorded.
    async fn finish(self) -> Vec<Value> {
        let observed = timeout(STEP_TIMEOUT, self.observed_rx)
            .await
            .expect("timed out waiting for ws server observations")
            .expect("ws observation channel closed")
            .expect("ws protocol assertions failed");
        let _ = self.shutdown_tx.send(());
        self.server_task.abort();
        observed
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_subscribes_serves_invocations_and_calls() {
    let router = MockRouter::start(|socket| Box::pin(full_session_scenario(socket))).await;
    let connection = timeout(STEP_TIMEOUT, router.client().connect())
        .await
        .expect("timed out connecting")
        .expect("connect to mock router");
    assert_eq!(connection.session_id().to_string(), TEST_SESSION_ID);
    let (handle, _events) = connection.split();

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    handle
        .subscribe("chat.lobby", move |event| {
            let _ = event_tx.send(event.args.clone());
            Ok(())
        })
        .await
        .expect("subscribe");
    let registered = handle
        .register("math.add", |args, _| {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            Ok(Some(json!({ "sum": sum })))
        })
        .await
        .expect("register");
    assert!(registered);

    let result = timeout(
        STEP_TIMEOUT,
        handle.call("remote.echo", vec![json!("ping")], Kwargs::new()),
    )
    .await
    .expect("timed out waiting for call result")
    .expect("call result");
    assert_eq!(result, json!({"echo": ["ping"]}));

    let event_args = timeout(STEP_TIMEOUT, event_rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel open");
    assert_eq!(event_args, vec![json!("hello")]);

    handle.close().expect("close session");
    let frames = router.finish().await;

    assert_eq!(frames[0], json!({"type": "hello"}));
    assert!(frames.contains(&json!({"type": "subscribe", "requestId": 0, "topic": "chat.lobby"})));
    assert!(frames.contains(&json!({"type": "register", "requestId": 1, "procedure": "math.add"})));
    assert!(frames.contains(&json!({
        "type": "call",
        "requestId": 2,
        "procedure": "remote.echo",
        "args": ["ping"],
        "kwargs": {}
    })));
    assert!(frames.contains(&json!({"type": "yield", "invokeId": 1, "result": {"sum": 5}})));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abort_during_handshake_fails_connect_with_message() {
    let router = MockRouter::start(|socket| Box::pin(abort_scenario(socket))).await;
    let err = timeout(STEP_TIMEOUT, router.client().connect())
        .await
        .expect("timed out connecting")
        .expect_err("abort must fail the connect");
    match err {
        ClientError::Session(SessionError::SessionAborted(message)) => {
            assert_eq!(message, "realm not found");
        }
        other => panic!("expected session aborted, got {other}"),
    }

    let frames = router.finish().await;
    assert_eq!(frames, vec![json!({"type": "hello"})]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_close_fails_pending_call_with_connection_lost() {
    let router = MockRouter::start(|socket| Box::pin(close_after_call_scenario(socket))).await;
    let mut connection = timeout(STEP_TIMEOUT, router.client().connect())
        .await
        .expect("timed out connecting")
        .expect("connect to mock router");
    let handle = connection.handle();

    let err = timeout(
        STEP_TIMEOUT,
        handle.call("remote.slow", Vec::new(), Kwargs::new()),
    )
    .await
    .expect("timed out waiting for call outcome")
    .expect_err("call must fail when the socket closes");
    assert!(
        matches!(err, ClientError::Session(SessionError::ConnectionLost)),
        "{err}"
    );

    let mut saw_closed = false;
    while let Ok(Some(event)) = timeout(STEP_TIMEOUT, connection.recv()).await {
        if event == LifecycleEvent::Closed {
            saw_closed = true;
            break;
        }
    }
    assert!(saw_closed, "expected closed lifecycle event");

    let err = handle
        .publish("t", Vec::new(), Kwargs::new())
        .await
        .expect_err("worker stopped");
    assert!(matches!(err, ClientError::CommandQueueClosed), "{err}");

    router.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unanswered_call_times_out() {
    let router = MockRouter::start(|socket| Box::pin(silent_scenario(socket))).await;
    let options = SessionOptions::default().with_request_timeout(Duration::from_millis(100));
    let connection = timeout(STEP_TIMEOUT, router.client().with_options(options).connect())
        .await
        .expect("timed out connecting")
        .expect("connect to mock router");
    let handle = connection.handle();

    let err = timeout(
        STEP_TIMEOUT,
        handle.call("remote.never", Vec::new(), Kwargs::new()),
    )
    .await
    .expect("timeout must fire before the guard")
    .expect_err("unanswered call");
    assert!(
        matches!(
            err,
            ClientError::Session(SessionError::Timeout { request_id: 0 })
        ),
        "{err}"
    );

    handle.close().expect("close session");
    let frames = router.finish().await;
    assert_eq!(frames.len(), 2, "hello and call: {frames:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ping_frames_are_answered() {
    let router = MockRouter::start(|socket| Box::pin(ping_scenario(socket))).await;
    let connection = timeout(STEP_TIMEOUT, router.client().connect())
        .await
        .expect("timed out connecting")
        .expect("connect to mock router");

    let frames = router.finish().await;
    assert_eq!(frames, vec![json!({"type": "hello"}), json!({"pong": "pulse"})]);
    connection.handle().close().expect("close session");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unpolled_lifecycle_receiver_holds_no_raw_frames() {
    let router = MockRouter::start(|socket| Box::pin(event_flood_scenario(socket))).await;
    let connection = timeout(STEP_TIMEOUT, router.client().connect())
        .await
        .expect("timed out connecting")
        .expect("connect to mock router");
    let (handle, mut events) = connection.split();

    let result = timeout(
        STEP_TIMEOUT,
        handle.call("remote.echo", Vec::new(), Kwargs::new()),
    )
    .await
    .expect("timed out waiting for call result")
    .expect("call result");
    assert_eq!(result, json!("done"));

    let mut queued = Vec::new();
    while let Ok(event) = events.try_recv() {
        queued.push(event);
    }
    assert_eq!(queued.len(), 1, "{queued:?}");
    assert!(matches!(queued[0], LifecycleEvent::Established { .. }));

    handle.close().expect("close session");
    router.finish().await;
}

async fn ws_handler(State(state): State<WsState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let scenario = state.scenario;
    let observed_tx = state.observed_tx.clone();
    ws.on_upgrade(move |socket| async move {
        let result = scenario(socket).await;
        if let Some(tx) = observed_tx.lock().await.take() {
            let _ = tx.send(result);
        }
    })
    .into_response()
}

/// Reads the hello and answers with a welcome.
async fn accept_session(socket: &mut WebSocket, frames: &mut Vec<Value>) -> Result<(), String> {
    let hello = recv_frame(socket)
        .await?
        .ok_or_else(|| "socket ended before hello".to_string())?;
    if hello != json!({"type": "hello"}) {
        return Err(format!("expected hello, got {hello}"));
    }
    frames.push(hello);
    send_frame(
        socket,
        json!({"type": "welcome", "sessionId": TEST_SESSION_ID}),
    )
    .await
}

async fn full_session_scenario(mut socket: WebSocket) -> Observed {
    let mut frames = Vec::new();
    accept_session(&mut socket, &mut frames).await?;

    while let Some(frame) = recv_frame(&mut socket).await? {
        let request_id = frame.get("requestId").cloned().unwrap_or(Value::Null);
        match frame.get("type").and_then(Value::as_str) {
            Some("subscribe") => {
                send_frame(
                    &mut socket,
                    json!({"type": "subscribed", "requestId": request_id, "subscriptionId": 501}),
                )
                .await?;
                send_frame(
                    &mut socket,
                    json!({
                        "type": "event",
                        "topic": frame["topic"],
                        "subscriptionId": 501,
                        "args": ["hello"],
                        "kwargs": {}
                    }),
                )
                .await?;
            }
            Some("register") => {
                send_frame(
                    &mut socket,
                    json!({"type": "registered", "requestId": request_id}),
                )
                .await?;
                send_frame(
                    &mut socket,
                    json!({
                        "type": "invoke",
                        "invokeId": 1,
                        "procedure": frame["procedure"],
                        "args": [2, 3],
                        "kwargs": {}
                    }),
                )
                .await?;
            }
            Some("call") => {
                send_frame(
                    &mut socket,
                    json!({
                        "type": "result",
                        "requestId": request_id,
                        "result": {"echo": frame["args"]}
                    }),
                )
                .await?;
            }
            Some("yield") => {}
            other => return Err(format!("unexpected client message type {other:?}")),
        }
        frames.push(frame);
    }
    Ok(frames)
}

async fn abort_scenario(mut socket: WebSocket) -> Observed {
    let mut frames = Vec::new();
    let hello = recv_frame(&mut socket)
        .await?
        .ok_or_else(|| "socket ended before hello".to_string())?;
    frames.push(hello);
    send_frame(
        &mut socket,
        json!({"type": "abort", "details": {"message": "realm not found"}}),
    )
    .await?;
    while let Some(frame) = recv_frame(&mut socket).await? {
        frames.push(frame);
    }
    Ok(frames)
}

async fn close_after_call_scenario(mut socket: WebSocket) -> Observed {
    let mut frames = Vec::new();
    accept_session(&mut socket, &mut frames).await?;
    let call = recv_frame(&mut socket)
        .await?
        .ok_or_else(|| "socket ended before call".to_string())?;
    if call.get("type").and_then(Value::as_str) != Some("call") {
        return Err(format!("expected call, got {call}"));
    }
    frames.push(call);
    socket
        .send(Message::Close(None))
        .await
        .map_err(|err| format!("failed to send close: {err}"))?;
    Ok(frames)
}

async fn silent_scenario(mut socket: WebSocket) -> Observed {
    let mut frames = Vec::new();
    accept_session(&mut socket, &mut frames).await?;
    while let Some(frame) = recv_frame(&mut socket).await? {
        frames.push(frame);
    }
    Ok(frames)
}

/// Floods an unsubscribed topic before answering the first call.
async fn event_flood_scenario(mut socket: WebSocket) -> Observed {
    let mut frames = Vec::new();
    accept_session(&mut socket, &mut frames).await?;
    let call = recv_frame(&mut socket)
        .await?
        .ok_or_else(|| "socket ended before call".to_string())?;
    for seq in 0..500 {
        send_frame(
            &mut socket,
            json!({
                "type": "event",
                "topic": "ticker.noise",
                "subscriptionId": 9,
                "args": [seq],
                "kwargs": {}
            }),
        )
        .await?;
    }
    send_frame(
        &mut socket,
        json!({"type": "result", "requestId": call["requestId"], "result": "done"}),
    )
    .await?;
    frames.push(call);
    while let Some(frame) = recv_frame(&mut socket).await? {
        frames.push(frame);
    }
    Ok(frames)
}

async fn ping_scenario(mut socket: WebSocket) -> Observed {
    let mut frames = Vec::new();
    accept_session(&mut socket, &mut frames).await?;
    socket
        .send(Message::Ping(b"pulse".to_vec().into()))
        .await
        .map_err(|err| format!("failed to send ping: {err}"))?;
    loop {
        match socket.next().await {
            Some(Ok(Message::Pong(payload))) => {
                if &payload[..] != b"pulse" {
                    return Err("pong payload did not echo the ping".to_string());
                }
                frames.push(json!({"pong": "pulse"}));
                return Ok(frames);
            }
            Some(Ok(Message::Text(text))) => {
                return Err(format!("unexpected text frame before pong: {}", text.as_str()));
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(format!("websocket receive error: {err}")),
            None => return Err("websocket stream ended before pong".to_string()),
        }
    }
}

/// Next JSON text frame; `None` once the client closes.
async fn recv_frame(socket: &mut WebSocket) -> Result<Option<Value>, String> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(text.as_str())
                    .map(Some)
                    .map_err(|err| format!("failed to decode client frame: {err}"));
            }
            Some(Ok(Message::Ping(payload))) => {
                socket
                    .send(Message::Pong(payload))
                    .await
                    .map_err(|err| format!("failed to send pong: {err}"))?;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => return Err("received unexpected non-text websocket frame".to_string()),
            Some(Err(err)) => return Err(format!("websocket receive error: {err}")),
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: Value) -> Result<(), String> {
    socket
        .send(Message::Text(frame.to_string().into()))
        .await
        .map_err(|err| format!("failed to send server frame: {err}"))
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}
