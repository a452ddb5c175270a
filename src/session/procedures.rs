use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::session::error::SessionError;
use crate::session::handler::{isolate, ProcedureHandler};
use crate::session::proto::{Args, ClientMessage, Kwargs};

/// Reply text for invocations of procedures that are not registered.
pub const NO_SUCH_PROCEDURE: &str = "No such procedure.";

struct Registration {
    handler: ProcedureHandler,
    request_id: u64,
    acked: bool,
}

/// Maps locally registered procedure names to their handlers.
///
/// Registration is optimistic: the handler serves invocations as soon as it
/// is inserted, before the peer acknowledges the `register`.
#[derive(Default)]
pub(crate) struct ProcedureRegistry {
    procedures: HashMap<String, Registration>,
}

impl ProcedureRegistry {
    pub(crate) fn contains(&self, procedure: &str) -> bool {
        self.procedures.contains_key(procedure)
    }

    /// Returns `false` if the name is taken.
    pub(crate) fn insert(
        &mut self,
        procedure: &str,
        handler: ProcedureHandler,
        request_id: u64,
    ) -> bool {
        if self.contains(procedure) {
            return false;
        }
        self.procedures.insert(
            procedure.to_string(),
            Registration {
                handler,
                request_id,
                acked: false,
            },
        );
        true
    }

    pub(crate) fn acknowledge(&mut self, procedure: &str, request_id: u64) {
        match self.procedures.get_mut(procedure) {
            Some(registration) if registration.request_id == request_id => {
                debug!(event = "registration_acknowledged", procedure, request_id);
                registration.acked = true;
            }
            _ => debug!(event = "registration_ack_stale", procedure, request_id),
        }
    }

    /// Drops the registration if it still belongs to `request_id`.
    pub(crate) fn reject(&mut self, procedure: &str, request_id: u64) -> bool {
        let owned = self
            .procedures
            .get(procedure)
            .is_some_and(|registration| registration.request_id == request_id);
        owned && self.procedures.remove(procedure).is_some()
    }

    pub(crate) fn remove(&mut self, procedure: &str) -> bool {
        self.procedures.remove(procedure).is_some()
    }

    pub(crate) fn is_acked(&self, procedure: &str) -> bool {
        self.procedures
            .get(procedure)
            .is_some_and(|registration| registration.acked)
    }

    /// Runs the handler for an invocation and builds the wire reply.
    pub(crate) fn invoke(
        &self,
        invoke_id: u64,
        procedure: &str,
        args: &Args,
        kwargs: &Kwargs,
    ) -> ClientMessage {
        let Some(registration) = self.procedures.get(procedure) else {
            let err = SessionError::ProcedureNotFound(procedure.to_string());
            warn!(event = "invoke_unknown_procedure", invoke_id, procedure, error = %err);
            return ClientMessage::Error {
                invoke_id,
                message: NO_SUCH_PROCEDURE.to_string(),
            };
        };

        let handler = &registration.handler;
        match isolate(|| handler(args, kwargs)) {
            Ok(result) => {
                debug!(event = "invoke_completed", invoke_id, procedure);
                ClientMessage::Yield {
                    invoke_id,
                    result: result.unwrap_or_else(|| Value::Object(Map::new())),
                }
            }
            Err(err) => {
                warn!(event = "invoke_handler_failed", invoke_id, procedure, error = %err);
                ClientMessage::Error {
                    invoke_id,
                    message: err.to_string(),
                }
            }
        }
    }
}
