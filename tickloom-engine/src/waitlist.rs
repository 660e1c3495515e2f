//! Request Waiting List
//!
//! Per-process tracking of outstanding correlations. Each entry carries a
//! callback, the peer the request went to, and a deadline tick; entries are
//! removed exactly once, by response, timeout or cancellation.

use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::{debug, trace, warn};

use crate::clock::Tick;
use crate::process::ProcessId;
use crate::{Result, TickloomError};

/// Receives the outcome of one outstanding correlation.
///
/// Implementations use interior mutability; one callback is typically shared
/// across the correlation ids of a whole broadcast. The return value reports
/// whether this correlation is finished and its entry should be removed.
pub trait ResponseCallback {
    /// Deliver the response (or failure) attributed to `from`.
    fn on_response(&self, from: ProcessId, result: Result<Vec<u8>>) -> bool;
}

struct PendingRequest {
    callback: Rc<dyn ResponseCallback>,
    destination: ProcessId,
    deadline: Tick,
}

/// Outstanding correlations for one process.
pub struct RequestWaitingList {
    owner: ProcessId,
    entries: BTreeMap<String, PendingRequest>,
    default_timeout_ticks: u64,
    now: Tick,
}

impl RequestWaitingList {
    /// An empty list with the ambient timeout applied by [`add`](Self::add).
    pub fn new(owner: ProcessId, default_timeout_ticks: u64) -> Self {
        RequestWaitingList {
            owner,
            entries: BTreeMap::new(),
            default_timeout_ticks,
            now: 0,
        }
    }

    /// Track a correlation with the ambient timeout. A duplicate id replaces
    /// the existing entry and logs a warning; replacement is not
    /// cancellation, so the replaced callback is not notified.
    pub fn add(
        &mut self,
        correlation_id: String,
        destination: ProcessId,
        callback: Rc<dyn ResponseCallback>,
    ) {
        self.add_with_timeout(correlation_id, destination, callback, self.default_timeout_ticks);
    }

    /// Track a correlation with an explicit timeout.
    pub fn add_with_timeout(
        &mut self,
        correlation_id: String,
        destination: ProcessId,
        callback: Rc<dyn ResponseCallback>,
        timeout_ticks: u64,
    ) {
        let entry = PendingRequest {
            callback,
            destination,
            deadline: self.now + timeout_ticks,
        };
        if self.entries.insert(correlation_id.clone(), entry).is_some() {
            warn!(
                process = %self.owner,
                correlation_id = %correlation_id,
                "duplicate correlation id replaced"
            );
        }
    }

    /// Deliver a response. Unknown ids are late responses and are dropped
    /// silently; known ids hand the result to the callback and remove the
    /// entry when the callback reports completion.
    pub fn handle_response(
        &mut self,
        correlation_id: &str,
        from: ProcessId,
        result: Result<Vec<u8>>,
    ) {
        let callback = match self.entries.get(correlation_id) {
            Some(entry) => entry.callback.clone(),
            None => {
                trace!(
                    process = %self.owner,
                    correlation_id = %correlation_id,
                    "late response dropped"
                );
                return;
            }
        };
        if callback.on_response(from, result) {
            self.entries.remove(correlation_id);
        }
    }

    /// Remove an entry and notify its callback with `Cancelled`.
    pub fn cancel(&mut self, correlation_id: &str) {
        if let Some(entry) = self.entries.remove(correlation_id) {
            debug!(
                process = %self.owner,
                correlation_id = %correlation_id,
                "request cancelled"
            );
            entry
                .callback
                .on_response(entry.destination, Err(TickloomError::Cancelled));
        }
    }

    /// Expire entries whose deadline has passed. Each expired entry is
    /// removed and its callback receives `TimedOut` attributed to the peer
    /// the request was sent to.
    pub fn tick(&mut self, now: Tick) {
        self.now = now;
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for correlation_id in expired {
            if let Some(entry) = self.entries.remove(&correlation_id) {
                debug!(
                    process = %self.owner,
                    correlation_id = %correlation_id,
                    peer = %entry.destination,
                    tick = now,
                    "request timed out"
                );
                entry
                    .callback
                    .on_response(entry.destination, Err(TickloomError::TimedOut));
            }
        }
    }

    /// Outstanding correlation count.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when the correlation is still tracked.
    pub fn contains(&self, correlation_id: &str) -> bool {
        self.entries.contains_key(correlation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recording {
        deliveries: RefCell<Vec<(ProcessId, Result<Vec<u8>>)>>,
    }

    impl ResponseCallback for Recording {
        fn on_response(&self, from: ProcessId, result: Result<Vec<u8>>) -> bool {
            self.deliveries.borrow_mut().push((from, result));
            true
        }
    }

    fn list() -> RequestWaitingList {
        RequestWaitingList::new(ProcessId::of("wl-owner"), 10)
    }

    #[test]
    fn test_response_removes_entry_and_delivers_once() {
        let mut list = list();
        let callback = Rc::new(Recording::default());
        let peer = ProcessId::of("wl-peer");
        list.add("c1".to_string(), peer.clone(), callback.clone());

        list.handle_response("c1", peer.clone(), Ok(b"r".to_vec()));
        assert!(!list.contains("c1"));

        // A second delivery for the same id is a late response.
        list.handle_response("c1", peer, Ok(b"r".to_vec()));
        assert_eq!(callback.deliveries.borrow().len(), 1);
    }

    #[test]
    fn test_unknown_id_is_dropped_silently() {
        let mut list = list();
        list.handle_response("nope", ProcessId::of("wl-peer"), Ok(Vec::new()));
        assert!(list.is_empty());
    }

    #[test]
    fn test_timeout_fires_at_deadline_not_before() {
        let mut list = list();
        let callback = Rc::new(Recording::default());
        let peer = ProcessId::of("wl-peer");
        list.tick(5);
        list.add("c1".to_string(), peer, callback.clone());

        list.tick(14);
        assert!(list.contains("c1"));
        assert!(callback.deliveries.borrow().is_empty());

        list.tick(15);
        assert!(!list.contains("c1"));
        let deliveries = callback.deliveries.borrow();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].1, Err(TickloomError::TimedOut));
    }

    #[test]
    fn test_cancel_notifies_with_cancelled() {
        let mut list = list();
        let callback = Rc::new(Recording::default());
        list.add("c1".to_string(), ProcessId::of("wl-peer"), callback.clone());
        list.cancel("c1");
        assert!(list.is_empty());
        assert_eq!(
            callback.deliveries.borrow()[0].1,
            Err(TickloomError::Cancelled)
        );
    }

    #[test]
    fn test_duplicate_id_replaces_without_notifying() {
        let mut list = list();
        let first = Rc::new(Recording::default());
        let second = Rc::new(Recording::default());
        let peer = ProcessId::of("wl-peer");
        list.add("c1".to_string(), peer.clone(), first.clone());
        list.add("c1".to_string(), peer.clone(), second.clone());
        assert_eq!(list.len(), 1);
        assert!(first.deliveries.borrow().is_empty());

        list.handle_response("c1", peer, Ok(Vec::new()));
        assert!(first.deliveries.borrow().is_empty());
        assert_eq!(second.deliveries.borrow().len(), 1);
    }
}
