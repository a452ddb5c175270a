//! Protocol core: one `Session` per transport lifetime.
//!
//! The session is driven by three transport callbacks (`on_open`, `on_text`,
//! `on_close`) and by application calls. It never blocks and never spawns;
//! outbound frames are handed to a [`Transport`]. Timeouts are advanced by
//! the driver through [`Session::expire`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, warn};

use crate::options::SessionOptions;
use crate::session::calls::CallDispatcher;
use crate::session::correlator::{PendingRequest, RequestCorrelator, RequestKind};
use crate::session::error::SessionError;
use crate::session::handler::{isolate, CallCompletion, Event, EventHandler, ProcedureHandler};
use crate::session::procedures::ProcedureRegistry;
use crate::session::proto::{Args, ClientMessage, Kwargs, OpaqueId, ServerMessage};
use crate::session::state::{Lifecycle, LifecycleEvent, SessionState};
use crate::session::subscriptions::{SubscribeAction, SubscriptionRegistry};

/// Outbound half of the connection. Sends are fire-and-forget; a broken
/// transport reports itself through [`Session::on_close`].
pub trait Transport {
    fn send(&mut self, frame: String);
}

impl Transport for Vec<String> {
    fn send(&mut self, frame: String) {
        self.push(frame);
    }
}

impl Transport for VecDeque<String> {
    fn send(&mut self, frame: String) {
        self.push_back(frame);
    }
}

/// Callback receiving lifecycle notifications.
pub type LifecycleObserver = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// Client protocol state for one connection.
///
/// Outbound requests issued before the welcome are queued (ids and deadlines
/// are assigned immediately) and flushed in order once the session is
/// established. After an abort or close every operation is rejected.
///
/// Dropping a session that is not yet terminal closes it, so no pending call
/// is left without a completion.
pub struct Session<T: Transport> {
    transport: T,
    lifecycle: Lifecycle,
    correlator: RequestCorrelator,
    subscriptions: SubscriptionRegistry,
    procedures: ProcedureRegistry,
    calls: CallDispatcher,
    queued: VecDeque<ClientMessage>,
    observers: Vec<LifecycleObserver>,
    observe_raw_messages: bool,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, options: &SessionOptions) -> Self {
        Self {
            transport,
            lifecycle: Lifecycle::new(),
            correlator: RequestCorrelator::new(options.request_timeout),
            subscriptions: SubscriptionRegistry::default(),
            procedures: ProcedureRegistry::default(),
            calls: CallDispatcher::default(),
            queued: VecDeque::new(),
            observers: Vec::new(),
            observe_raw_messages: options.observe_raw_messages,
        }
    }

    pub fn state(&self) -> &SessionState {
        self.lifecycle.state()
    }

    pub fn session_id(&self) -> Option<&OpaqueId> {
        self.lifecycle.session_id()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Number of requests awaiting a reply (calls included).
    pub fn pending_requests(&self) -> usize {
        self.correlator.len()
    }

    pub fn pending_calls(&self) -> usize {
        self.calls.len()
    }

    /// Number of local handlers for `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscriptions.handler_count(topic)
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.contains(topic)
    }

    pub fn subscription_id(&self, topic: &str) -> Option<&OpaqueId> {
        self.subscriptions.subscription_id(topic)
    }

    pub fn is_registered(&self, procedure: &str) -> bool {
        self.procedures.contains(procedure)
    }

    /// Whether the peer acknowledged the registration of `procedure`.
    pub fn is_registration_acked(&self, procedure: &str) -> bool {
        self.procedures.is_acked(procedure)
    }

    pub fn observe<F>(&mut self, observer: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.observers.push(Arc::new(observer));
    }

    /// Earliest request deadline, if timeouts are enabled.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.correlator.next_deadline()
    }

    /// Transport opened: sends the single hello.
    pub fn on_open(&mut self) {
        if self.lifecycle.open() {
            self.transmit(&ClientMessage::Hello);
        }
    }

    /// Transport delivered one text frame.
    ///
    /// The frame is reported as [`LifecycleEvent::Message`] only when
    /// [`SessionOptions::observe_raw_messages`] is set.
    pub fn on_text(&mut self, text: &str) {
        if self.observe_raw_messages && !self.observers.is_empty() {
            self.notify(&LifecycleEvent::Message {
                text: text.to_string(),
            });
        }

        if self.lifecycle.state().is_terminal() {
            debug!(event = "inbound_after_termination", state = ?self.lifecycle.state());
            return;
        }

        let message = match ServerMessage::from_text(text) {
            Ok(message) => message,
            Err(err) => {
                let err = SessionError::Protocol(err.to_string());
                warn!(event = "inbound_message_malformed", error = %err);
                return;
            }
        };

        let kind = message.kind();
        if let Err(err) = self.route(message) {
            warn!(event = "inbound_message_rejected", kind, error = %err);
        }
    }

    /// Transport closed: terminal, resolves everything outstanding.
    pub fn on_close(&mut self) {
        if self.lifecycle.close() {
            self.terminate();
            self.notify(&LifecycleEvent::Closed);
        }
    }

    /// Resolves every request whose deadline is at or before `now` with
    /// [`SessionError::Timeout`]. Returns the number of expired entries.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired = self.correlator.take_expired(now);
        let count = expired.len();
        for pending in expired {
            self.drop_queued(pending.request_id);
            let err = SessionError::Timeout {
                request_id: pending.request_id,
            };
            self.fail_request(pending, err);
        }
        count
    }

    /// Adds `handler` for `topic`. Only the first handler of a topic causes a
    /// wire `subscribe`.
    pub fn subscribe(&mut self, topic: &str, handler: EventHandler) -> Result<(), SessionError> {
        self.lifecycle.ensure_usable()?;
        if self.subscriptions.add_handler(topic, handler) == SubscribeAction::Joined {
            debug!(event = "subscribe_joined", topic);
            return Ok(());
        }

        let request_id = self
            .correlator
            .track(RequestKind::Subscribe, topic, Instant::now());
        self.subscriptions.mark_requested(topic, request_id);
        self.send(ClientMessage::Subscribe {
            request_id,
            topic: topic.to_string(),
        });
        Ok(())
    }

    /// Drops every local handler for `topic`. Returns `false` if the topic
    /// had no subscription.
    pub fn unsubscribe(&mut self, topic: &str) -> Result<bool, SessionError> {
        self.lifecycle.ensure_usable()?;
        if !self.subscriptions.remove(topic) {
            return Ok(false);
        }

        let request_id = self
            .correlator
            .track(RequestKind::Unsubscribe, topic, Instant::now());
        self.send(ClientMessage::Unsubscribe {
            request_id,
            topic: topic.to_string(),
        });
        Ok(true)
    }

    pub fn publish(&mut self, topic: &str, args: Args, kwargs: Kwargs) -> Result<u64, SessionError> {
        self.lifecycle.ensure_usable()?;
        let request_id = self
            .correlator
            .track(RequestKind::Publish, topic, Instant::now());
        self.send(ClientMessage::Publish {
            request_id,
            topic: topic.to_string(),
            args,
            kwargs,
        });
        Ok(request_id)
    }

    /// Registers a local procedure. Returns `Ok(false)` without any wire
    /// traffic when the name is already registered.
    ///
    /// The handler serves invocations immediately, so an `invoke` may arrive
    /// and be answered before the peer's `registered` ack.
    pub fn register(
        &mut self,
        procedure: &str,
        handler: ProcedureHandler,
    ) -> Result<bool, SessionError> {
        self.lifecycle.ensure_usable()?;
        if self.procedures.contains(procedure) {
            debug!(event = "register_duplicate", procedure);
            return Ok(false);
        }

        let request_id = self
            .correlator
            .track(RequestKind::Register, procedure, Instant::now());
        self.procedures.insert(procedure, handler, request_id);
        self.send(ClientMessage::Register {
            request_id,
            procedure: procedure.to_string(),
        });
        Ok(true)
    }

    pub fn unregister(&mut self, procedure: &str) -> Result<bool, SessionError> {
        self.lifecycle.ensure_usable()?;
        if !self.procedures.remove(procedure) {
            return Ok(false);
        }

        let request_id = self
            .correlator
            .track(RequestKind::Unregister, procedure, Instant::now());
        self.send(ClientMessage::Unregister {
            request_id,
            procedure: procedure.to_string(),
        });
        Ok(true)
    }

    /// Calls a remote procedure. `completion` runs exactly once: with the
    /// result, the peer's error, a timeout, a cancellation or the session
    /// termination error. When the session is already terminal the error is
    /// returned instead and `completion` is dropped.
    pub fn call(
        &mut self,
        procedure: &str,
        args: Args,
        kwargs: Kwargs,
        completion: CallCompletion,
    ) -> Result<u64, SessionError> {
        self.lifecycle.ensure_usable()?;
        let request_id = self
            .correlator
            .track(RequestKind::Call, procedure, Instant::now());
        self.calls.insert(request_id, completion);
        self.send(ClientMessage::Call {
            request_id,
            procedure: procedure.to_string(),
            args,
            kwargs,
        });
        Ok(request_id)
    }

    /// Forgets a pending call locally and completes it with
    /// [`SessionError::Cancelled`]. The peer is not notified; a late reply
    /// becomes a correlation miss.
    pub fn cancel_call(&mut self, request_id: u64) -> bool {
        let is_call = self
            .correlator
            .get(request_id)
            .is_some_and(|pending| pending.kind == RequestKind::Call);
        if !is_call {
            return false;
        }
        self.correlator.take(request_id);
        self.drop_queued(request_id);
        debug!(event = "call_cancelled", request_id);
        self.calls.resolve(request_id, Err(SessionError::Cancelled))
    }

    fn route(&mut self, message: ServerMessage) -> Result<(), SessionError> {
        let lifecycle_message = matches!(
            message,
            ServerMessage::Welcome { .. } | ServerMessage::Abort { .. }
        );
        if !lifecycle_message && !self.lifecycle.is_established() {
            return Err(SessionError::Protocol(format!(
                "{} received before welcome",
                message.kind()
            )));
        }

        match message {
            ServerMessage::Welcome { session_id } => {
                self.lifecycle.welcome(session_id.clone())?;
                self.flush_queued();
                self.notify(&LifecycleEvent::Established { session_id });
            }
            ServerMessage::Abort { details } => {
                if self.lifecycle.abort(&details.message) {
                    self.terminate();
                    self.notify(&LifecycleEvent::Aborted {
                        message: details.message,
                    });
                }
            }
            ServerMessage::Subscribed {
                request_id,
                subscription_id,
            } => {
                let pending = self.take_reply(request_id, RequestKind::Subscribe, "subscribed")?;
                self.subscriptions
                    .acknowledge(&pending.target, request_id, subscription_id);
            }
            ServerMessage::Unsubscribed { request_id } => {
                self.take_reply(request_id, RequestKind::Unsubscribe, "unsubscribed")?;
            }
            ServerMessage::Published { request_id } => {
                self.take_reply(request_id, RequestKind::Publish, "published")?;
            }
            ServerMessage::Registered { request_id } => {
                let pending = self.take_reply(request_id, RequestKind::Register, "registered")?;
                self.procedures.acknowledge(&pending.target, request_id);
            }
            ServerMessage::Unregistered { request_id } => {
                self.take_reply(request_id, RequestKind::Unregister, "unregistered")?;
            }
            ServerMessage::Event {
                topic,
                subscription_id,
                args,
                kwargs,
            } => {
                let event = Event {
                    topic,
                    subscription_id,
                    args,
                    kwargs,
                };
                self.subscriptions.dispatch(&event);
            }
            ServerMessage::Invoke {
                invoke_id,
                procedure,
                args,
                kwargs,
            } => {
                let reply = self.procedures.invoke(invoke_id, &procedure, &args, &kwargs);
                self.transmit(&reply);
            }
            ServerMessage::Result { request_id, result } => {
                self.take_reply(request_id, RequestKind::Call, "result")?;
                if !self.calls.resolve(request_id, Ok(result)) {
                    return Err(SessionError::Correlation { request_id });
                }
            }
            ServerMessage::Error {
                request_id: Some(request_id),
                message,
                ..
            } => {
                let pending = self
                    .correlator
                    .take(request_id)
                    .ok_or(SessionError::Correlation { request_id })?;
                self.fail_request(pending, SessionError::Remote(message));
            }
            ServerMessage::Error {
                request_id: None,
                invoke_id: Some(invoke_id),
                message,
            } => {
                warn!(event = "invoke_reply_rejected", invoke_id, message = %message);
            }
            ServerMessage::Error {
                request_id: None,
                invoke_id: None,
                message,
            } => {
                return Err(SessionError::Protocol(format!(
                    "error reply without requestId or invokeId: {message}"
                )));
            }
        }
        Ok(())
    }

    /// Consumes the pending entry for a reply. A reply of the wrong kind
    /// still consumes the entry and fails it with a protocol error.
    fn take_reply(
        &mut self,
        request_id: u64,
        expected: RequestKind,
        reply: &str,
    ) -> Result<PendingRequest, SessionError> {
        let pending = self
            .correlator
            .take(request_id)
            .ok_or(SessionError::Correlation { request_id })?;
        if pending.kind != expected {
            let err = SessionError::Protocol(format!(
                "{reply} reply for {} request {request_id}",
                pending.kind
            ));
            self.fail_request(pending, err.clone());
            return Err(err);
        }
        Ok(pending)
    }

    fn fail_request(&mut self, pending: PendingRequest, error: SessionError) {
        warn!(
            event = "request_failed",
            request_id = pending.request_id,
            kind = %pending.kind,
            target = %pending.target,
            error = %error
        );
        match pending.kind {
            RequestKind::Call => {
                self.calls.resolve(pending.request_id, Err(error));
                return;
            }
            RequestKind::Subscribe => {
                self.subscriptions
                    .reject(&pending.target, pending.request_id);
            }
            RequestKind::Register => {
                self.procedures.reject(&pending.target, pending.request_id);
            }
            RequestKind::Unsubscribe | RequestKind::Publish | RequestKind::Unregister => {}
        }
        self.notify(&LifecycleEvent::RequestFailed {
            request_id: pending.request_id,
            kind: pending.kind,
            target: pending.target,
            error,
        });
    }

    /// Resolves every outstanding entry with the termination error.
    fn terminate(&mut self) {
        let error = self.lifecycle.termination_error();
        self.queued.clear();
        for pending in self.correlator.drain() {
            self.fail_request(pending, error.clone());
        }
        self.calls.fail_all(&error);
    }

    fn send(&mut self, message: ClientMessage) {
        if self.lifecycle.is_established() {
            self.transmit(&message);
        } else {
            debug!(event = "outbound_queued", kind = message.kind());
            self.queued.push_back(message);
        }
    }

    fn flush_queued(&mut self) {
        while let Some(message) = self.queued.pop_front() {
            self.transmit(&message);
        }
    }

    fn drop_queued(&mut self, request_id: u64) {
        self.queued
            .retain(|message| message.request_id() != Some(request_id));
    }

    fn transmit(&mut self, message: &ClientMessage) {
        match message.to_text() {
            Ok(frame) => {
                debug!(event = "outbound_sent", kind = message.kind());
                self.transport.send(frame);
            }
            Err(err) => {
                warn!(event = "outbound_encode_failed", kind = message.kind(), error = %err);
            }
        }
    }

    fn notify(&self, event: &LifecycleEvent) {
        for observer in &self.observers {
            if let Err(err) = isolate(|| {
                observer(event);
                Ok(())
            }) {
                warn!(event = "lifecycle_observer_failed", error = %err);
            }
        }
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        self.on_close();
    }
}

/// Wraps a closure as a call completion.
pub fn completion<F>(on_complete: F) -> CallCompletion
where
    F: FnOnce(Result<Value, SessionError>) + Send + 'static,
{
    Box::new(on_complete)
}
