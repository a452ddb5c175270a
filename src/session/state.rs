use tracing::{info, warn};

use crate::session::correlator::RequestKind;
use crate::session::error::SessionError;
use crate::session::proto::OpaqueId;

/// Connection lifecycle of a single session.
///
/// `Aborted` and `Closed` are terminal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Established,
    Aborted(String),
    Closed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Aborted(_) | Self::Closed)
    }
}

/// Notifications delivered to lifecycle observers.
#[derive(Clone, Debug, PartialEq)]
pub enum LifecycleEvent {
    /// Welcome received; outbound traffic is unblocked.
    Established { session_id: OpaqueId },
    /// The peer aborted the session. Delivered once.
    Aborted { message: String },
    /// The transport closed.
    Closed,
    /// A request without a caller-owned completion failed.
    RequestFailed {
        request_id: u64,
        kind: RequestKind,
        target: String,
        error: SessionError,
    },
    /// Raw inbound text, observed before decoding.
    Message { text: String },
}

/// Session Manager: owns the state machine and the one-time handshake.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: SessionState,
    session_id: Option<OpaqueId>,
    opened: bool,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: SessionState::Connecting,
            session_id: None,
            opened: false,
        }
    }

    pub(crate) fn state(&self) -> &SessionState {
        &self.state
    }

    pub(crate) fn session_id(&self) -> Option<&OpaqueId> {
        self.session_id.as_ref()
    }

    pub(crate) fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    /// Marks the transport open. Returns `true` when a hello must be sent.
    pub(crate) fn open(&mut self) -> bool {
        if self.opened || self.state.is_terminal() {
            warn!(event = "session_open_ignored", state = ?self.state);
            return false;
        }
        self.opened = true;
        true
    }

    pub(crate) fn welcome(&mut self, session_id: OpaqueId) -> Result<(), SessionError> {
        if self.state != SessionState::Connecting || !self.opened {
            return Err(SessionError::Protocol(format!(
                "unexpected welcome in state {:?}",
                self.state
            )));
        }
        info!(event = "session_established", session_id = %session_id);
        self.session_id = Some(session_id);
        self.state = SessionState::Established;
        Ok(())
    }

    /// Returns `false` when the session was already terminal.
    pub(crate) fn abort(&mut self, message: &str) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        info!(event = "session_aborted", message);
        self.state = SessionState::Aborted(message.to_string());
        true
    }

    /// Returns `false` when the session was already terminal.
    pub(crate) fn close(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        info!(event = "session_closed");
        self.state = SessionState::Closed;
        true
    }

    /// Rejects outbound work once the session is terminal.
    pub(crate) fn ensure_usable(&self) -> Result<(), SessionError> {
        match &self.state {
            SessionState::Aborted(message) => Err(SessionError::SessionAborted(message.clone())),
            SessionState::Closed => Err(SessionError::ConnectionLost),
            SessionState::Connecting | SessionState::Established => Ok(()),
        }
    }

    /// Error used to resolve outstanding entries at termination.
    pub(crate) fn termination_error(&self) -> SessionError {
        match &self.state {
            SessionState::Aborted(message) => SessionError::SessionAborted(message.clone()),
            _ => SessionError::ConnectionLost,
        }
    }
}
