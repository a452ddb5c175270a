use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use crate::session::error::SessionError;
use crate::session::handler::{isolate, CallCompletion};

/// Outstanding remote calls keyed by request id.
#[derive(Default)]
pub(crate) struct CallDispatcher {
    pending: HashMap<u64, CallCompletion>,
}

impl CallDispatcher {
    pub(crate) fn insert(&mut self, request_id: u64, completion: CallCompletion) {
        self.pending.insert(request_id, completion);
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Removes the completion and invokes it. Returns `false` on a miss.
    pub(crate) fn resolve(&mut self, request_id: u64, outcome: Result<Value, SessionError>) -> bool {
        let Some(completion) = self.pending.remove(&request_id) else {
            return false;
        };
        complete(request_id, completion, outcome);
        true
    }

    /// Resolves every outstanding call with `error`, in request id order.
    pub(crate) fn fail_all(&mut self, error: &SessionError) -> usize {
        let mut ids: Vec<u64> = self.pending.keys().copied().collect();
        ids.sort_unstable();
        for request_id in &ids {
            if let Some(completion) = self.pending.remove(request_id) {
                complete(*request_id, completion, Err(error.clone()));
            }
        }
        ids.len()
    }
}

fn complete(request_id: u64, completion: CallCompletion, outcome: Result<Value, SessionError>) {
    debug!(event = "call_completed", request_id, ok = outcome.is_ok());
    if let Err(err) = isolate(move || {
        completion(outcome);
        Ok(())
    }) {
        debug!(event = "call_completion_failed", request_id, error = %err);
    }
}
