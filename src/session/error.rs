use thiserror::Error;

/// Boxed failure returned by application event and procedure handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced by the protocol core.
///
/// `Protocol`, `Correlation` and `ProcedureNotFound` are non-fatal and only
/// logged or answered on the wire; `SessionAborted` and `ConnectionLost` are
/// terminal for the session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Malformed or unexpected inbound message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Reply for a request id with no pending entry.
    #[error("no pending request with id {request_id}")]
    Correlation { request_id: u64 },

    /// Invocation for a procedure that is not registered locally.
    #[error("no such procedure: {0}")]
    ProcedureNotFound(String),

    /// The peer aborted the session.
    #[error("session aborted: {0}")]
    SessionAborted(String),

    /// The transport closed before the request completed.
    #[error("connection lost")]
    ConnectionLost,

    /// No reply arrived within the configured request timeout.
    #[error("request {request_id} timed out")]
    Timeout { request_id: u64 },

    /// The peer answered the request with an error reply.
    #[error("remote error: {0}")]
    Remote(String),

    /// The call was cancelled locally before a reply arrived.
    #[error("call cancelled")]
    Cancelled,

    /// A local handler returned an error or panicked.
    #[error("handler failed: {0}")]
    Handler(String),
}
