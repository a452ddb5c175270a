use std::collections::HashMap;

use tracing::{debug, warn};

use crate::session::handler::{isolate, Event, EventHandler};
use crate::session::proto::OpaqueId;

#[derive(Default)]
struct Subscription {
    /// Request id of the in-flight `subscribe`, cleared on ack.
    request_id: Option<u64>,
    subscription_id: Option<OpaqueId>,
    handlers: Vec<EventHandler>,
}

/// What the caller must do after adding a handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SubscribeAction {
    /// First interest in the topic: send a wire `subscribe`.
    SendSubscribe,
    /// A subscribe is already in flight or established.
    Joined,
}

/// Maps topics to subscription ids and local handlers.
///
/// Events are correlated by topic. The server-assigned subscription id is
/// recorded for diagnostics only.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    topics: HashMap<String, Subscription>,
}

impl SubscriptionRegistry {
    pub(crate) fn add_handler(&mut self, topic: &str, handler: EventHandler) -> SubscribeAction {
        let subscription = self.topics.entry(topic.to_string()).or_default();
        subscription.handlers.push(handler);
        if subscription.handlers.len() == 1 {
            SubscribeAction::SendSubscribe
        } else {
            SubscribeAction::Joined
        }
    }

    pub(crate) fn mark_requested(&mut self, topic: &str, request_id: u64) {
        if let Some(subscription) = self.topics.get_mut(topic) {
            subscription.request_id = Some(request_id);
        }
    }

    /// Binds the server-assigned id. Acks for a superseded request are ignored.
    pub(crate) fn acknowledge(&mut self, topic: &str, request_id: u64, subscription_id: OpaqueId) {
        match self.topics.get_mut(topic) {
            Some(subscription) if subscription.request_id == Some(request_id) => {
                debug!(
                    event = "subscription_acknowledged",
                    topic,
                    request_id,
                    subscription_id = %subscription_id
                );
                subscription.request_id = None;
                subscription.subscription_id = Some(subscription_id);
            }
            _ => {
                debug!(event = "subscription_ack_stale", topic, request_id);
            }
        }
    }

    /// Drops the subscription if it still belongs to `request_id`.
    ///
    /// Returns the number of handlers that were discarded.
    pub(crate) fn reject(&mut self, topic: &str, request_id: u64) -> usize {
        let owned = self
            .topics
            .get(topic)
            .is_some_and(|subscription| subscription.request_id == Some(request_id));
        if !owned {
            return 0;
        }
        self.topics
            .remove(topic)
            .map_or(0, |subscription| subscription.handlers.len())
    }

    /// Removes the topic and all its handlers.
    pub(crate) fn remove(&mut self, topic: &str) -> bool {
        self.topics.remove(topic).is_some()
    }

    pub(crate) fn contains(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    pub(crate) fn subscription_id(&self, topic: &str) -> Option<&OpaqueId> {
        self.topics
            .get(topic)
            .and_then(|subscription| subscription.subscription_id.as_ref())
    }

    pub(crate) fn handler_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map_or(0, |subscription| subscription.handlers.len())
    }

    /// Fans the event out to a snapshot of the topic's handlers.
    ///
    /// Returns the number of handlers invoked. Handler failures are logged.
    pub(crate) fn dispatch(&self, event: &Event) -> usize {
        let Some(subscription) = self.topics.get(&event.topic) else {
            debug!(event = "event_without_subscription", topic = %event.topic);
            return 0;
        };

        if let (Some(bound), Some(received)) = (
            subscription.subscription_id.as_ref(),
            event.subscription_id.as_ref(),
        ) {
            if bound != received {
                debug!(
                    event = "event_subscription_id_mismatch",
                    topic = %event.topic,
                    bound = %bound,
                    received = %received
                );
            }
        }

        let snapshot: Vec<EventHandler> = subscription.handlers.clone();
        for (index, handler) in snapshot.iter().enumerate() {
            if let Err(err) = isolate(|| handler(event)) {
                warn!(
                    event = "event_handler_failed",
                    topic = %event.topic,
                    handler_index = index,
                    error = %err
                );
            }
        }
        snapshot.len()
    }
}
