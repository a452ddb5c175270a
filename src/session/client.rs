//! Websocket driver for the protocol core.
//!
//! The client spawns a background worker that owns the socket and the
//! [`Session`]. Application calls travel to the worker as commands; lifecycle
//! notifications come back on an unbounded channel.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::options::SessionOptions;
use crate::session::dispatch::{completion, Session};
use crate::session::error::{HandlerError, SessionError};
use crate::session::handler::{
    event_handler, procedure_handler, CallCompletion, Event, EventHandler, ProcedureHandler,
};
use crate::session::proto::{Args, Kwargs, OpaqueId};
use crate::session::state::LifecycleEvent;

/// Local development router endpoint.
pub const LOCAL_ENDPOINT: &str = "ws://127.0.0.1:8080/ws";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WorkerSession = Session<VecDeque<String>>;
type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Entry point for opening sessions against a router.
#[derive(Clone, Debug)]
pub struct SessionClient {
    endpoint: String,
    options: SessionOptions,
}

impl SessionClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: trim_endpoint(endpoint.into()),
            options: SessionOptions::default(),
        }
    }

    /// Client for [`LOCAL_ENDPOINT`].
    pub fn local() -> Self {
        Self::new(LOCAL_ENDPOINT)
    }

    /// Replaces the websocket endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = trim_endpoint(endpoint.into());
        self
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Opens the websocket and completes the hello/welcome exchange.
    ///
    /// Resolves once the router welcomes the session. An abort during the
    /// handshake, a transport failure or the handshake timeout fail the
    /// connect; the worker is torn down in every failure case.
    pub async fn connect(&self) -> Result<SessionConnection, ClientError> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let url = self.endpoint.clone();
        let options = self.options.clone();
        info!(event = "session_connecting", url = %url);

        let worker = tokio::spawn(async move {
            session_worker(url, options, command_rx, event_tx, ready_tx).await;
        });

        let Ok(handshake) = timeout(self.options.handshake_timeout, ready_rx).await else {
            warn!(event = "session_handshake_timeout", url = %self.endpoint);
            // Drops the socket of a stalled upgrade or welcome.
            worker.abort();
            return Err(ClientError::HandshakeTimeout);
        };

        match handshake {
            Ok(Ok(session_id)) => Ok(SessionConnection {
                handle: SessionHandle {
                    tx: command_tx,
                    session_id,
                },
                events: event_rx,
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ClientError::Handshake(
                "session worker stopped before welcome".to_string(),
            )),
        }
    }
}

fn trim_endpoint(endpoint: String) -> String {
    endpoint.trim().to_string()
}

/// An established session: command handle plus lifecycle notifications.
#[derive(Debug)]
pub struct SessionConnection {
    handle: SessionHandle,
    events: mpsc::UnboundedReceiver<LifecycleEvent>,
}

impl SessionConnection {
    /// Returns a cloneable handle for session operations.
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn session_id(&self) -> &OpaqueId {
        self.handle.session_id()
    }

    pub fn split(self) -> (SessionHandle, mpsc::UnboundedReceiver<LifecycleEvent>) {
        (self.handle, self.events)
    }

    /// Receives the next lifecycle notification. `None` once the worker has
    /// stopped and every notification was consumed.
    pub async fn recv(&mut self) -> Option<LifecycleEvent> {
        self.events.recv().await
    }
}

enum Command {
    Subscribe {
        topic: String,
        handler: EventHandler,
        reply: Reply<()>,
    },
    Unsubscribe {
        topic: String,
        reply: Reply<bool>,
    },
    Publish {
        topic: String,
        args: Args,
        kwargs: Kwargs,
        reply: Reply<u64>,
    },
    Register {
        procedure: String,
        handler: ProcedureHandler,
        reply: Reply<bool>,
    },
    Unregister {
        procedure: String,
        reply: Reply<bool>,
    },
    Call {
        procedure: String,
        args: Args,
        kwargs: Kwargs,
        completion: CallCompletion,
        reply: Reply<u64>,
    },
    CancelCall {
        request_id: u64,
        reply: oneshot::Sender<bool>,
    },
    Close,
}

/// Cloneable handle to a running session.
///
/// Handlers passed here run on the worker task; they must not block.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Command>,
    session_id: OpaqueId,
}

impl SessionHandle {
    pub fn session_id(&self) -> &OpaqueId {
        &self.session_id
    }

    /// Whether the worker has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn subscribe<F>(&self, topic: impl Into<String>, handler: F) -> Result<(), ClientError>
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let topic = topic.into();
        let handler = event_handler(handler);
        self.request(|reply| Command::Subscribe {
            topic,
            handler,
            reply,
        })
        .await
    }

    pub async fn unsubscribe(&self, topic: impl Into<String>) -> Result<bool, ClientError> {
        let topic = topic.into();
        self.request(|reply| Command::Unsubscribe { topic, reply })
            .await
    }

    /// Publishes to `topic` and returns the request id.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        args: Args,
        kwargs: Kwargs,
    ) -> Result<u64, ClientError> {
        let topic = topic.into();
        self.request(|reply| Command::Publish {
            topic,
            args,
            kwargs,
            reply,
        })
        .await
    }

    /// Registers a local procedure. `Ok(false)` if the name is already taken.
    pub async fn register<F>(
        &self,
        procedure: impl Into<String>,
        handler: F,
    ) -> Result<bool, ClientError>
    where
        F: Fn(&Args, &Kwargs) -> Result<Option<Value>, HandlerError> + Send + Sync + 'static,
    {
        let procedure = procedure.into();
        let handler = procedure_handler(handler);
        self.request(|reply| Command::Register {
            procedure,
            handler,
            reply,
        })
        .await
    }

    pub async fn unregister(&self, procedure: impl Into<String>) -> Result<bool, ClientError> {
        let procedure = procedure.into();
        self.request(|reply| Command::Unregister { procedure, reply })
            .await
    }

    /// Calls a remote procedure and waits for its outcome.
    pub async fn call(
        &self,
        procedure: impl Into<String>,
        args: Args,
        kwargs: Kwargs,
    ) -> Result<Value, ClientError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.call_with(procedure, args, kwargs, move |outcome| {
            let _ = done_tx.send(outcome);
        })
        .await?;

        match done_rx.await {
            Ok(outcome) => outcome.map_err(ClientError::from),
            Err(_) => Err(ClientError::Session(SessionError::ConnectionLost)),
        }
    }

    /// Calls a remote procedure; `on_complete` runs exactly once on the
    /// worker task. Returns the request id, usable with [`Self::cancel_call`].
    pub async fn call_with<F>(
        &self,
        procedure: impl Into<String>,
        args: Args,
        kwargs: Kwargs,
        on_complete: F,
    ) -> Result<u64, ClientError>
    where
        F: FnOnce(Result<Value, SessionError>) + Send + 'static,
    {
        let procedure = procedure.into();
        let completion = completion(on_complete);
        self.request(|reply| Command::Call {
            procedure,
            args,
            kwargs,
            completion,
            reply,
        })
        .await
    }

    /// Cancels a pending call locally. Returns `false` if it already completed.
    pub async fn cancel_call(&self, request_id: u64) -> Result<bool, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CancelCall { request_id, reply })?;
        rx.await.map_err(|_| ClientError::CommandQueueClosed)
    }

    /// Closes the websocket. Pending calls complete with
    /// [`SessionError::ConnectionLost`].
    pub fn close(&self) -> Result<(), ClientError> {
        self.send(Command::Close)
    }

    fn send(&self, command: Command) -> Result<(), ClientError> {
        self.tx
            .send(command)
            .map_err(|_| ClientError::CommandQueueClosed)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply))?;
        let outcome = rx.await.map_err(|_| ClientError::CommandQueueClosed)?;
        outcome.map_err(ClientError::from)
    }
}

/// Errors produced by the websocket driver.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// The session rejected the operation or the request failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The worker has stopped and no longer accepts commands.
    #[error("command queue is closed")]
    CommandQueueClosed,

    /// The connection ended before the session was established.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// No welcome arrived within [`SessionOptions::handshake_timeout`].
    #[error("handshake timed out")]
    HandshakeTimeout,
}

type ReadySender = oneshot::Sender<Result<OpaqueId, ClientError>>;

async fn session_worker(
    url: String,
    options: SessionOptions,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<LifecycleEvent>,
    ready_tx: ReadySender,
) {
    let mut socket = match connect_async(url.as_str()).await {
        Ok((socket, _)) => socket,
        Err(err) => {
            warn!(event = "session_connect_failed", url = %url, error = %err);
            let _ = ready_tx.send(Err(ClientError::WebSocket(err)));
            return;
        }
    };

    let ready = Arc::new(Mutex::new(Some(ready_tx)));
    let mut session = Session::new(VecDeque::new(), &options);
    session.observe(move |event| {
        if let Some(outcome) = handshake_outcome(event) {
            if let Some(tx) = ready.lock().ok().and_then(|mut slot| slot.take()) {
                let _ = tx.send(outcome);
            }
        }
        let _ = events_tx.send(event.clone());
    });

    session.on_open();
    if let Err(err) = flush(&mut socket, &mut session).await {
        warn!(event = "session_send_failed", error = %err);
        session.on_close();
        return;
    }

    loop {
        let deadline = session.next_deadline();
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(Command::Close) | None => {
                        debug!(event = "session_close_requested");
                        let _ = socket.close(None).await;
                        session.on_close();
                        break;
                    }
                    Some(command) => apply(&mut session, command),
                }
            }
            frame = socket.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => session.on_text(text.as_str()),
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            session.on_close();
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        debug!(event = "session_close_frame", frame = ?frame);
                        session.on_close();
                        break;
                    }
                    Some(Ok(_)) => {
                        warn!(event = "session_non_text_frame");
                        let _ = socket.close(None).await;
                        session.on_close();
                        break;
                    }
                    Some(Err(err)) => {
                        warn!(event = "session_transport_error", error = %err);
                        session.on_close();
                        break;
                    }
                    None => {
                        session.on_close();
                        break;
                    }
                }
            }
            _ = sleep_until(deadline) => {
                let expired = session.expire(Instant::now());
                debug!(event = "session_requests_expired", expired);
            }
        }

        if let Err(err) = flush(&mut socket, &mut session).await {
            warn!(event = "session_send_failed", error = %err);
            session.on_close();
            break;
        }

        if session.state().is_terminal() {
            let _ = socket.close(None).await;
            break;
        }
    }

    info!(event = "session_worker_stopped", state = ?session.state());
}

fn apply(session: &mut WorkerSession, command: Command) {
    match command {
        Command::Subscribe {
            topic,
            handler,
            reply,
        } => {
            let _ = reply.send(session.subscribe(&topic, handler));
        }
        Command::Unsubscribe { topic, reply } => {
            let _ = reply.send(session.unsubscribe(&topic));
        }
        Command::Publish {
            topic,
            args,
            kwargs,
            reply,
        } => {
            let _ = reply.send(session.publish(&topic, args, kwargs));
        }
        Command::Register {
            procedure,
            handler,
            reply,
        } => {
            let _ = reply.send(session.register(&procedure, handler));
        }
        Command::Unregister { procedure, reply } => {
            let _ = reply.send(session.unregister(&procedure));
        }
        Command::Call {
            procedure,
            args,
            kwargs,
            completion,
            reply,
        } => {
            let _ = reply.send(session.call(&procedure, args, kwargs, completion));
        }
        Command::CancelCall { request_id, reply } => {
            let _ = reply.send(session.cancel_call(request_id));
        }
        // Handled by the worker loop.
        Command::Close => {}
    }
}

/// Maps the first terminal-or-established notification to the connect result.
fn handshake_outcome(event: &LifecycleEvent) -> Option<Result<OpaqueId, ClientError>> {
    match event {
        LifecycleEvent::Established { session_id } => Some(Ok(session_id.clone())),
        LifecycleEvent::Aborted { message } => Some(Err(ClientError::Session(
            SessionError::SessionAborted(message.clone()),
        ))),
        LifecycleEvent::Closed => Some(Err(ClientError::Handshake(
            "connection closed before welcome".to_string(),
        ))),
        LifecycleEvent::RequestFailed { .. } | LifecycleEvent::Message { .. } => None,
    }
}

async fn flush(socket: &mut Socket, session: &mut WorkerSession) -> Result<(), WsError> {
    while let Some(frame) = session.transport_mut().pop_front() {
        socket.send(Message::Text(frame.into())).await?;
    }
    Ok(())
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    use super::{handshake_outcome, ClientError, SessionClient, LOCAL_ENDPOINT};
    use crate::options::SessionOptions;
    use crate::session::error::SessionError;
    use crate::session::proto::OpaqueId;
    use crate::session::state::LifecycleEvent;

    #[test]
    fn endpoint_is_trimmed() {
        let client = SessionClient::new("  ws://router.example/ws \n");
        assert_eq!(client.endpoint(), "ws://router.example/ws");
    }

    #[test]
    fn endpoint_override_replaces_local_default() {
        let client = SessionClient::local();
        assert_eq!(client.endpoint(), LOCAL_ENDPOINT);

        let client = client.with_endpoint("wss://router-dev.example/ws   ");
        assert_eq!(client.endpoint(), "wss://router-dev.example/ws");
    }

    #[test]
    fn options_are_carried_to_the_client() {
        let options = SessionOptions::default().with_request_timeout(Duration::from_secs(3));
        let client = SessionClient::local().with_options(options.clone());
        assert_eq!(client.options(), &options);
    }

    #[test]
    fn handshake_resolves_on_welcome_or_termination() {
        let established = handshake_outcome(&LifecycleEvent::Established {
            session_id: OpaqueId::from(7),
        });
        assert!(matches!(established, Some(Ok(OpaqueId::Number(7)))));

        let aborted = handshake_outcome(&LifecycleEvent::Aborted {
            message: "no realm".to_string(),
        });
        assert!(matches!(
            aborted,
            Some(Err(ClientError::Session(SessionError::SessionAborted(ref message)))) if message == "no realm"
        ));

        assert!(matches!(
            handshake_outcome(&LifecycleEvent::Closed),
            Some(Err(ClientError::Handshake(_)))
        ));
        assert!(handshake_outcome(&LifecycleEvent::Message {
            text: "{}".to_string()
        })
        .is_none());
    }

    #[tokio::test]
    async fn handshake_timeout_tears_down_the_stalled_socket() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind silent listener");
        let addr = listener.local_addr().expect("listener address");
        let client = SessionClient::new(format!("ws://{addr}/ws")).with_options(
            SessionOptions::default().with_handshake_timeout(Duration::from_millis(200)),
        );

        let (connected, accepted) = tokio::join!(client.connect(), listener.accept());
        let err = connected.expect_err("silent peer never completes the upgrade");
        assert!(matches!(err, ClientError::HandshakeTimeout), "{err}");

        let (mut peer, _) = accepted.expect("accept client connection");
        let mut received = Vec::new();
        let drained = timeout(Duration::from_secs(2), peer.read_to_end(&mut received)).await;
        assert!(drained.is_ok(), "client socket still open after handshake timeout");
    }

    #[tokio::test]
    async fn connect_to_unreachable_endpoint_fails() {
        let client = SessionClient::new("ws://127.0.0.1:9/ws")
            .with_options(SessionOptions::default().with_handshake_timeout(Duration::from_secs(5)));
        let err = client.connect().await.expect_err("nothing listens on port 9");
        assert!(
            matches!(err, ClientError::WebSocket(_) | ClientError::HandshakeTimeout),
            "{err}"
        );
    }
}
