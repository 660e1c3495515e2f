//! Message Bus
//!
//! Point-to-point typed messaging between processes. The bus contract is
//! FIFO per (source, destination) pair, best-effort delivery, and hand-off
//! to the destination only during its tick. [`SimulatedBus`] is the
//! deterministic in-memory implementation used by the harness; concrete
//! transports live outside the engine and implement the same trait.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use tracing::{debug, trace};

use crate::clock::{Tick, Tickable};
use crate::message::Message;
use crate::process::ProcessId;
use crate::{Result, TickloomError};

/// Transport seam between replicas. All methods take `&self`; buses use
/// interior mutability so one handle can be shared across a process.
pub trait MessageBus {
    /// Subscribe a process; subsequent deliveries for `id` are queued for it.
    fn register(&self, id: ProcessId);

    /// Close a subscription; queued and future messages for `id` are dropped.
    fn unregister(&self, id: &ProcessId);

    /// Queue a message for asynchronous delivery on the destination's next
    /// tick. Best-effort: losses must surface as waiting-list timeouts, not
    /// as duplicates.
    fn send(&self, message: Message) -> Result<()>;

    /// Messages that became deliverable to `destination` before `now`, in
    /// arrival order. Called by the owning process inside its own tick.
    fn drain_ready(&self, destination: &ProcessId, now: Tick) -> Vec<Message>;
}

struct BusInner {
    now: Tick,
    inboxes: HashMap<ProcessId, VecDeque<(Tick, Message)>>,
    isolated: HashSet<ProcessId>,
    cut_links: HashSet<(ProcessId, ProcessId)>,
    dropped: u64,
}

/// Deterministic in-memory bus. Messages are stamped with the tick they were
/// sent in and handed over strictly on a later tick, preserving per-pair
/// FIFO. Link faults (isolation, directed cuts) drop messages at send time;
/// the loss is observable only as a timeout, per the bus contract.
#[derive(Clone)]
pub struct SimulatedBus {
    inner: Rc<RefCell<BusInner>>,
}

impl SimulatedBus {
    /// An empty bus at tick zero.
    pub fn new() -> Self {
        SimulatedBus {
            inner: Rc::new(RefCell::new(BusInner {
                now: 0,
                inboxes: HashMap::new(),
                isolated: HashSet::new(),
                cut_links: HashSet::new(),
                dropped: 0,
            })),
        }
    }

    /// Drop every message to or from `id` until [`heal`](Self::heal).
    pub fn isolate(&self, id: &ProcessId) {
        debug!(process = %id, "bus: isolating process");
        self.inner.borrow_mut().isolated.insert(id.clone());
    }

    /// Undo [`isolate`](Self::isolate).
    pub fn heal(&self, id: &ProcessId) {
        debug!(process = %id, "bus: healing process");
        self.inner.borrow_mut().isolated.remove(id);
    }

    /// Drop messages on the directed link `from -> to`.
    pub fn cut_link(&self, from: &ProcessId, to: &ProcessId) {
        self.inner
            .borrow_mut()
            .cut_links
            .insert((from.clone(), to.clone()));
    }

    /// Restore the directed link `from -> to`.
    pub fn heal_link(&self, from: &ProcessId, to: &ProcessId) {
        self.inner
            .borrow_mut()
            .cut_links
            .remove(&(from.clone(), to.clone()));
    }

    /// Messages dropped by faults so far.
    pub fn dropped(&self) -> u64 {
        self.inner.borrow().dropped
    }
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus for SimulatedBus {
    fn register(&self, id: ProcessId) {
        self.inner.borrow_mut().inboxes.entry(id).or_default();
    }

    fn unregister(&self, id: &ProcessId) {
        self.inner.borrow_mut().inboxes.remove(id);
    }

    fn send(&self, message: Message) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.isolated.contains(&message.source)
            || inner.isolated.contains(&message.destination)
            || inner
                .cut_links
                .contains(&(message.source.clone(), message.destination.clone()))
        {
            trace!(
                source = %message.source,
                destination = %message.destination,
                kind = %message.message_type,
                "bus: message dropped by link fault"
            );
            inner.dropped += 1;
            return Ok(());
        }
        let stamp = inner.now;
        match inner.inboxes.get_mut(&message.destination) {
            Some(inbox) => {
                trace!(
                    source = %message.source,
                    destination = %message.destination,
                    kind = %message.message_type,
                    tick = stamp,
                    "bus: message queued"
                );
                inbox.push_back((stamp, message));
                Ok(())
            }
            None => Err(TickloomError::Io(format!(
                "no subscriber for {}",
                message.destination
            ))),
        }
    }

    fn drain_ready(&self, destination: &ProcessId, now: Tick) -> Vec<Message> {
        let mut inner = self.inner.borrow_mut();
        let inbox = match inner.inboxes.get_mut(destination) {
            Some(inbox) => inbox,
            None => return Vec::new(),
        };
        let mut ready = Vec::new();
        while let Some((stamp, _)) = inbox.front() {
            if *stamp < now {
                if let Some((_, message)) = inbox.pop_front() {
                    ready.push(message);
                }
            } else {
                break;
            }
        }
        ready
    }
}

impl Tickable for SimulatedBus {
    fn tick(&mut self, now: Tick) {
        self.inner.borrow_mut().now = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageType, PeerType};

    fn msg(from: &ProcessId, to: &ProcessId, corr: &str) -> Message {
        Message::new(
            from.clone(),
            to.clone(),
            PeerType::Server,
            MessageType::INTERNAL_READ,
            Vec::new(),
            corr.to_string(),
        )
    }

    fn pair() -> (SimulatedBus, ProcessId, ProcessId) {
        let bus = SimulatedBus::new();
        let a = ProcessId::of("bus-a");
        let b = ProcessId::of("bus-b");
        bus.register(a.clone());
        bus.register(b.clone());
        (bus, a, b)
    }

    #[test]
    fn test_delivery_is_strictly_next_tick() {
        let (mut bus, a, b) = pair();
        bus.tick(1);
        bus.send(msg(&a, &b, "c1")).unwrap();
        assert!(bus.drain_ready(&b, 1).is_empty());
        assert_eq!(bus.drain_ready(&b, 2).len(), 1);
    }

    #[test]
    fn test_fifo_per_pair() {
        let (mut bus, a, b) = pair();
        bus.tick(1);
        bus.send(msg(&a, &b, "c1")).unwrap();
        bus.send(msg(&a, &b, "c2")).unwrap();
        let delivered = bus.drain_ready(&b, 2);
        let ids: Vec<&str> = delivered.iter().map(|m| m.correlation_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
    }

    #[test]
    fn test_isolation_drops_both_directions() {
        let (mut bus, a, b) = pair();
        bus.tick(1);
        bus.isolate(&b);
        bus.send(msg(&a, &b, "c1")).unwrap();
        bus.send(msg(&b, &a, "c2")).unwrap();
        assert!(bus.drain_ready(&b, 2).is_empty());
        assert!(bus.drain_ready(&a, 2).is_empty());
        assert_eq!(bus.dropped(), 2);

        bus.heal(&b);
        bus.tick(2);
        bus.send(msg(&a, &b, "c3")).unwrap();
        assert_eq!(bus.drain_ready(&b, 3).len(), 1);
    }

    #[test]
    fn test_directed_cut_only_affects_one_direction() {
        let (mut bus, a, b) = pair();
        bus.tick(1);
        bus.cut_link(&a, &b);
        bus.send(msg(&a, &b, "c1")).unwrap();
        bus.send(msg(&b, &a, "c2")).unwrap();
        assert!(bus.drain_ready(&b, 2).is_empty());
        assert_eq!(bus.drain_ready(&a, 2).len(), 1);
    }

    #[test]
    fn test_unknown_destination_is_an_io_error() {
        let (bus, a, _) = pair();
        let ghost = ProcessId::of("bus-ghost");
        assert!(matches!(
            bus.send(msg(&a, &ghost, "c1")),
            Err(TickloomError::Io(_))
        ));
    }
}
