//! Logical Clock & Tick Driver
//!
//! Discrete time for the whole runtime. The driver steps every registered
//! component exactly once per tick, in registration order, and performs no
//! I/O itself.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::trace;

/// Logical time. Starts at zero, increments by one per tick, never goes back.
pub type Tick = u64;

/// A component whose progress is driven by the tick loop.
///
/// Work enqueued during `tick` (messages, storage operations, futures) must
/// not become observable before the next tick; that is what keeps each tick
/// terminating and deterministic.
pub trait Tickable {
    /// Advance this component to `now`. Must not block.
    fn tick(&mut self, now: Tick);
}

/// Owns the tick counter and the registered tickables.
pub struct TickDriver {
    now: Tick,
    tickables: Vec<Rc<RefCell<dyn Tickable>>>,
}

impl TickDriver {
    /// Create a driver at tick zero with no registrants.
    pub fn new() -> Self {
        TickDriver {
            now: 0,
            tickables: Vec::new(),
        }
    }

    /// Register a tickable. Registration order is stepping order.
    pub fn register(&mut self, tickable: Rc<RefCell<dyn Tickable>>) {
        self.tickables.push(tickable);
    }

    /// Current tick. Monotonic, non-decreasing.
    pub fn now(&self) -> Tick {
        self.now
    }

    /// Step `n` ticks. Each step increments the counter, then invokes every
    /// registrant's `tick` exactly once in registration order.
    pub fn advance(&mut self, n: u64) {
        for _ in 0..n {
            self.now += 1;
            trace!(tick = self.now, "tick");
            for tickable in &self.tickables {
                tickable.borrow_mut().tick(self.now);
            }
        }
    }
}

impl Default for TickDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        label: u32,
        seen: Rc<RefCell<Vec<(u32, Tick)>>>,
    }

    impl Tickable for Recorder {
        fn tick(&mut self, now: Tick) {
            self.seen.borrow_mut().push((self.label, now));
        }
    }

    #[test]
    fn test_advance_increments_counter() {
        let mut driver = TickDriver::new();
        assert_eq!(driver.now(), 0);
        driver.advance(3);
        assert_eq!(driver.now(), 3);
    }

    #[test]
    fn test_tickables_stepped_in_registration_order() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut driver = TickDriver::new();
        for label in 0..3 {
            driver.register(Rc::new(RefCell::new(Recorder {
                label,
                seen: seen.clone(),
            })));
        }

        driver.advance(2);

        let seen = seen.borrow();
        assert_eq!(
            *seen,
            vec![(0, 1), (1, 1), (2, 1), (0, 2), (1, 2), (2, 2)]
        );
    }
}
