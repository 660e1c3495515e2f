//! Quorum aggregation
//!
//! A [`QuorumCallback`] is shared across the correlation ids of one
//! broadcast. It records per-peer responses, completes its future exactly
//! once when the required success count is reached or can no longer be
//! reached, and discards anything that arrives after completion.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::trace;

use crate::future::OpFuture;
use crate::process::ProcessId;
use crate::waitlist::ResponseCallback;
use crate::{Result, TickloomError};

struct QuorumState<T> {
    successes: BTreeMap<ProcessId, T>,
    failures: BTreeMap<ProcessId, TickloomError>,
    completed: bool,
}

/// Aggregates one response per peer until `required` successes arrive or
/// more than `expected - required` peers have failed.
///
/// Payload bytes are turned into `T` by the per-broadcast decoder; a payload
/// that fails to decode counts as a failure vote from that peer. Timeouts
/// and error replies arrive through the same [`ResponseCallback`] path and
/// also count as failure votes.
pub struct QuorumCallback<T> {
    expected: usize,
    required: usize,
    decoder: fn(&[u8]) -> Result<T>,
    state: RefCell<QuorumState<T>>,
    future: OpFuture<BTreeMap<ProcessId, T>>,
}

impl<T: Clone + 'static> QuorumCallback<T> {
    /// A callback needing `required` successes out of `expected` peers.
    pub fn new(expected: usize, required: usize, decoder: fn(&[u8]) -> Result<T>) -> Rc<Self> {
        Rc::new(QuorumCallback {
            expected,
            required,
            decoder,
            state: RefCell::new(QuorumState {
                successes: BTreeMap::new(),
                failures: BTreeMap::new(),
                completed: false,
            }),
            future: OpFuture::pending(),
        })
    }

    /// A callback needing a majority of `expected` peers.
    pub fn majority(expected: usize, decoder: fn(&[u8]) -> Result<T>) -> Rc<Self> {
        QuorumCallback::new(expected, expected / 2 + 1, decoder)
    }

    /// The future resolved exactly once with the aggregated success map, or
    /// failed with `QuorumNotReached`.
    pub fn future(&self) -> OpFuture<BTreeMap<ProcessId, T>> {
        self.future.clone()
    }

    /// Successes required to complete.
    pub fn required(&self) -> usize {
        self.required
    }

    /// Responses observed so far.
    pub fn received(&self) -> usize {
        let state = self.state.borrow();
        state.successes.len() + state.failures.len()
    }

    fn evaluate(&self, state: &mut QuorumState<T>) {
        if state.completed {
            return;
        }
        if state.successes.len() >= self.required {
            state.completed = true;
            self.future.resolve(state.successes.clone());
        } else if state.failures.len() > self.expected - self.required {
            state.completed = true;
            self.future.fail(TickloomError::QuorumNotReached {
                successes: state.successes.len(),
                required: self.required,
            });
        }
    }
}

impl<T: Clone + 'static> ResponseCallback for QuorumCallback<T> {
    fn on_response(&self, from: ProcessId, result: Result<Vec<u8>>) -> bool {
        let mut state = self.state.borrow_mut();
        if state.completed {
            trace!(peer = %from, "delivery after quorum completion dropped");
            return true;
        }
        match result {
            Ok(payload) => match (self.decoder)(&payload) {
                Ok(value) => {
                    state.successes.insert(from, value);
                }
                Err(error) => {
                    state.failures.insert(from, error);
                }
            },
            Err(error) => {
                state.failures.insert(from, error);
            }
        }
        self.evaluate(&mut state);
        true
    }
}
