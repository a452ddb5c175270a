use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Kind of outbound request awaiting a correlated reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Subscribe,
    Unsubscribe,
    Publish,
    Register,
    Unregister,
    Call,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Publish => "publish",
            Self::Register => "register",
            Self::Unregister => "unregister",
            Self::Call => "call",
        };
        f.write_str(name)
    }
}

/// Bookkeeping for one request that has been sent (or queued) but not answered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingRequest {
    pub request_id: u64,
    pub kind: RequestKind,
    /// Topic or procedure name the request refers to.
    pub target: String,
    pub deadline: Option<Instant>,
}

/// Allocates request ids and matches replies to the requests that caused them.
///
/// Ids start at zero and grow by one for the lifetime of the session. `take`
/// removes the entry, so a reply can be consumed at most once.
#[derive(Debug)]
pub(crate) struct RequestCorrelator {
    next_id: u64,
    timeout: Option<Duration>,
    pending: HashMap<u64, PendingRequest>,
}

impl RequestCorrelator {
    pub(crate) fn new(timeout: Option<Duration>) -> Self {
        Self {
            next_id: 0,
            timeout,
            pending: HashMap::new(),
        }
    }

    pub(crate) fn allocate(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Allocates an id and records the pending request under it.
    pub(crate) fn track(&mut self, kind: RequestKind, target: &str, now: Instant) -> u64 {
        let request_id = self.allocate();
        let deadline = self.timeout.and_then(|timeout| now.checked_add(timeout));
        self.pending.insert(
            request_id,
            PendingRequest {
                request_id,
                kind,
                target: target.to_string(),
                deadline,
            },
        );
        request_id
    }

    pub(crate) fn take(&mut self, request_id: u64) -> Option<PendingRequest> {
        self.pending.remove(&request_id)
    }

    pub(crate) fn get(&self, request_id: u64) -> Option<&PendingRequest> {
        self.pending.get(&request_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .filter_map(|pending| pending.deadline)
            .min()
    }

    /// Removes and returns every entry whose deadline is at or before `now`,
    /// ordered by request id.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<PendingRequest> {
        let mut expired: Vec<u64> = self
            .pending
            .values()
            .filter(|pending| pending.deadline.is_some_and(|deadline| deadline <= now))
            .map(|pending| pending.request_id)
            .collect();
        expired.sort_unstable();
        expired
            .into_iter()
            .filter_map(|request_id| self.pending.remove(&request_id))
            .collect()
    }

    /// Removes every entry, ordered by request id.
    pub(crate) fn drain(&mut self) -> Vec<PendingRequest> {
        let mut drained: Vec<PendingRequest> = self.pending.drain().map(|(_, v)| v).collect();
        drained.sort_unstable_by_key(|pending| pending.request_id);
        drained
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{RequestCorrelator, RequestKind};

    #[test]
    fn ids_start_at_zero_and_strictly_increase() {
        let mut correlator = RequestCorrelator::new(None);
        let now = Instant::now();
        let first = correlator.track(RequestKind::Subscribe, "a", now);
        let second = correlator.allocate();
        let third = correlator.track(RequestKind::Call, "f", now);
        assert_eq!((first, second, third), (0, 1, 2));

        correlator.take(first).expect("first pending");
        let fourth = correlator.track(RequestKind::Publish, "a", now);
        assert_eq!(fourth, 3, "ids are never reused after resolution");
    }

    #[test]
    fn take_consumes_a_reply_once() {
        let mut correlator = RequestCorrelator::new(None);
        let id = correlator.track(RequestKind::Register, "math.add", Instant::now());

        let pending = correlator.take(id).expect("pending entry");
        assert_eq!(pending.kind, RequestKind::Register);
        assert_eq!(pending.target, "math.add");
        assert!(correlator.take(id).is_none());
        assert!(correlator.take(999).is_none());
        assert_eq!(correlator.len(), 0);
    }

    #[test]
    fn deadlines_are_absent_without_a_timeout() {
        let mut correlator = RequestCorrelator::new(None);
        let now = Instant::now();
        correlator.track(RequestKind::Call, "f", now);
        assert!(correlator.next_deadline().is_none());
        assert!(correlator
            .take_expired(now + Duration::from_secs(3600))
            .is_empty());
    }

    #[test]
    fn expired_entries_are_purged_in_id_order() {
        let mut correlator = RequestCorrelator::new(Some(Duration::from_millis(100)));
        let start = Instant::now();
        let a = correlator.track(RequestKind::Call, "f", start);
        let b = correlator.track(RequestKind::Subscribe, "t", start);
        let c = correlator.track(RequestKind::Call, "g", start + Duration::from_millis(50));

        assert_eq!(
            correlator.next_deadline(),
            Some(start + Duration::from_millis(100))
        );
        assert!(correlator
            .take_expired(start + Duration::from_millis(99))
            .is_empty());

        let expired = correlator.take_expired(start + Duration::from_millis(100));
        let ids: Vec<u64> = expired.iter().map(|pending| pending.request_id).collect();
        assert_eq!(ids, vec![a, b]);
        assert!(correlator.get(c).is_some());
        assert_eq!(
            correlator.next_deadline(),
            Some(start + Duration::from_millis(150))
        );
    }

    #[test]
    fn drain_empties_the_map() {
        let mut correlator = RequestCorrelator::new(None);
        let now = Instant::now();
        correlator.track(RequestKind::Call, "f", now);
        correlator.track(RequestKind::Publish, "t", now);
        let drained = correlator.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].request_id, 0);
        assert_eq!(correlator.len(), 0);
    }
}
