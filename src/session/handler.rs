use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;

use crate::session::error::{HandlerError, SessionError};
use crate::session::proto::{Args, Kwargs, OpaqueId};

/// Event delivered to topic subscribers.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub topic: String,
    pub subscription_id: Option<OpaqueId>,
    pub args: Args,
    pub kwargs: Kwargs,
}

/// Subscriber callback. Shared so fan-out can run over a snapshot.
pub type EventHandler = Arc<dyn Fn(&Event) -> Result<(), HandlerError> + Send + Sync>;

/// Local procedure body. `Ok(None)` is answered with an empty object.
pub type ProcedureHandler =
    Arc<dyn Fn(&Args, &Kwargs) -> Result<Option<Value>, HandlerError> + Send + Sync>;

/// Completion for a remote call, invoked exactly once.
pub type CallCompletion = Box<dyn FnOnce(Result<Value, SessionError>) + Send>;

/// Wraps a closure as a shareable [`EventHandler`].
pub fn event_handler<F>(handler: F) -> EventHandler
where
    F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(handler)
}

/// Wraps a closure as a shareable [`ProcedureHandler`].
pub fn procedure_handler<F>(handler: F) -> ProcedureHandler
where
    F: Fn(&Args, &Kwargs) -> Result<Option<Value>, HandlerError> + Send + Sync + 'static,
{
    Arc::new(handler)
}

/// Runs a handler so that neither its error nor a panic escapes into routing.
pub(crate) fn isolate<T>(run: impl FnOnce() -> Result<T, HandlerError>) -> Result<T, SessionError> {
    match catch_unwind(AssertUnwindSafe(run)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(SessionError::Handler(err.to_string())),
        Err(payload) => Err(SessionError::Handler(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return format!("panicked: {message}");
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return format!("panicked: {message}");
    }
    "panicked".to_string()
}

#[cfg(test)]
mod tests {
    use super::isolate;
    use crate::session::error::SessionError;

    #[test]
    fn isolate_passes_through_success() {
        assert_eq!(isolate(|| Ok(5)), Ok(5));
    }

    #[test]
    fn isolate_converts_errors_and_panics() {
        let failed: Result<(), SessionError> = isolate(|| Err("bad input".into()));
        assert_eq!(failed, Err(SessionError::Handler("bad input".to_string())));

        let panicked: Result<(), SessionError> = isolate(|| panic!("kaboom"));
        assert_eq!(
            panicked,
            Err(SessionError::Handler("panicked: kaboom".to_string()))
        );
    }
}
