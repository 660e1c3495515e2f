//! Completion cells for tick-resolved operations
//!
//! The runtime never blocks. Any operation that cannot finish within the
//! current tick hands back an [`OpFuture`]: a clonable single-assignment cell
//! resolved by the storage engine or a quorum callback on a later tick, and
//! polled from inside the owner's tick loop.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::trace;

use crate::{Result, TickloomError};

enum Slot<T> {
    Pending,
    Ready(Result<T>),
    Consumed,
}

/// A single-assignment completion cell.
///
/// Clones share the same slot. The producer calls [`resolve`](Self::resolve)
/// or [`fail`](Self::fail) exactly once; later completions are dropped. The
/// consumer observes resolution by calling [`take`](Self::take) from its own
/// tick, which moves the result out exactly once.
pub struct OpFuture<T> {
    slot: Rc<RefCell<Slot<T>>>,
}

impl<T> Clone for OpFuture<T> {
    fn clone(&self) -> Self {
        OpFuture {
            slot: self.slot.clone(),
        }
    }
}

impl<T> OpFuture<T> {
    /// An unresolved future.
    pub fn pending() -> Self {
        OpFuture {
            slot: Rc::new(RefCell::new(Slot::Pending)),
        }
    }

    /// A future that is already complete.
    pub fn ready(result: Result<T>) -> Self {
        OpFuture {
            slot: Rc::new(RefCell::new(Slot::Ready(result))),
        }
    }

    /// Complete with a value. No effect if already completed.
    pub fn resolve(&self, value: T) {
        self.complete(Ok(value));
    }

    /// Complete with an error. No effect if already completed.
    pub fn fail(&self, error: TickloomError) {
        self.complete(Err(error));
    }

    /// Complete with a result. Completion is first-writer-wins; anything
    /// after the first completion is dropped.
    pub fn complete(&self, result: Result<T>) {
        let mut slot = self.slot.borrow_mut();
        match *slot {
            Slot::Pending => *slot = Slot::Ready(result),
            Slot::Ready(_) | Slot::Consumed => {
                trace!("dropping completion for already-completed future");
            }
        }
    }

    /// True until the producer completes the cell.
    pub fn is_pending(&self) -> bool {
        matches!(*self.slot.borrow(), Slot::Pending)
    }

    /// Move the result out, once. Returns `None` while pending and after the
    /// result has already been taken.
    pub fn take(&self) -> Option<Result<T>> {
        let mut slot = self.slot.borrow_mut();
        match *slot {
            Slot::Ready(_) => match std::mem::replace(&mut *slot, Slot::Consumed) {
                Slot::Ready(result) => Some(result),
                _ => None,
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_then_take() {
        let future = OpFuture::pending();
        assert!(future.is_pending());
        assert!(future.take().is_none());

        future.resolve(7u32);
        assert!(!future.is_pending());
        assert_eq!(future.take(), Some(Ok(7)));
        assert!(future.take().is_none());
    }

    #[test]
    fn test_clones_share_the_slot() {
        let producer = OpFuture::pending();
        let consumer = producer.clone();
        producer.resolve("v".to_string());
        assert_eq!(consumer.take(), Some(Ok("v".to_string())));
    }

    #[test]
    fn test_first_completion_wins() {
        let future = OpFuture::pending();
        future.resolve(1u32);
        future.fail(TickloomError::Closed);
        assert_eq!(future.take(), Some(Ok(1)));
    }

    #[test]
    fn test_failure_is_observable() {
        let future: OpFuture<u32> = OpFuture::pending();
        future.fail(TickloomError::TimedOut);
        assert_eq!(future.take(), Some(Err(TickloomError::TimedOut)));
    }
}
