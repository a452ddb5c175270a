//! Session configuration.

use std::time::Duration;

/// Default values used by [`SessionOptions::default`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionDefaults;

impl SessionDefaults {
    /// Upper bound for the websocket upgrade plus hello/welcome exchange.
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
    /// Request timeouts are disabled unless configured.
    pub const REQUEST_TIMEOUT: Option<Duration> = None;
    /// Raw inbound frames are not reported to lifecycle observers.
    pub const OBSERVE_RAW_MESSAGES: bool = false;
}

/// Tunables shared by the protocol core and the websocket driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionOptions {
    /// Deadline applied to every pending request and call.
    ///
    /// `None` disables request timeouts.
    pub request_timeout: Option<Duration>,
    /// Upper bound for the websocket connect plus hello/welcome exchange.
    pub handshake_timeout: Duration,
    /// Report every inbound frame as [`LifecycleEvent::Message`].
    ///
    /// Off by default: the websocket driver forwards lifecycle events on an
    /// unbounded channel, so enabling this requires the receiver to be polled.
    ///
    /// [`LifecycleEvent::Message`]: crate::session::state::LifecycleEvent::Message
    pub observe_raw_messages: bool,
}

impl SessionOptions {
    /// Sets the per-request timeout. A zero duration disables timeouts.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Sets the bound on connect plus the hello/welcome exchange.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Enables or disables [`SessionOptions::observe_raw_messages`].
    pub fn with_raw_messages(mut self, observe: bool) -> Self {
        self.observe_raw_messages = observe;
        self
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            request_timeout: SessionDefaults::REQUEST_TIMEOUT,
            handshake_timeout: SessionDefaults::HANDSHAKE_TIMEOUT,
            observe_raw_messages: SessionDefaults::OBSERVE_RAW_MESSAGES,
        }
    }
}
