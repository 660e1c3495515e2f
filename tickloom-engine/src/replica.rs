//! Replica Runtime
//!
//! The shared substrate every replication algorithm builds on: a handler
//! table keyed by message type, persistence helpers that serialize through
//! the codec, correlation-id minting, whole-cluster broadcast wired to the
//! waiting list, the self-send fast path, and the initialisation gate.
//!
//! A concrete algorithm embeds a [`ReplicaCore`] and implements [`Node`];
//! the runtime behaviour arrives through the blanket [`NodeExt`]
//! implementation, and the node's `Tickable` impl forwards to
//! [`NodeExt::step`]. Handlers must all be registered before the replica
//! subscribes to the bus.

use std::collections::HashMap;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::bus::MessageBus;
use crate::clock::{Tick, Tickable};
use crate::codec::{Codec, JsonCodec};
use crate::future::OpFuture;
use crate::message::{Message, MessageType};
use crate::process::ProcessId;
use crate::storage::StorageEngine;
use crate::waitlist::{RequestWaitingList, ResponseCallback};
use crate::Result;

/// A message handler. Plain function pointers keep the table `Copy`-able, so
/// dispatch can look a handler up and then hand the node over mutably.
pub type Handler<N> = fn(&mut N, Message);

/// A storage completion whose continuation needs the whole node. Queued by
/// the persistence helpers and drained inside the owner's tick; this is the
/// `then` of the runtime's future primitive, defunctionalised so nothing is
/// ever called from outside the tick loop.
enum PendingIo<N> {
    Get {
        future: OpFuture<Option<Vec<u8>>>,
        action: Box<dyn FnOnce(&mut N, Result<Option<Vec<u8>>>)>,
    },
    Put {
        future: OpFuture<bool>,
        action: Box<dyn FnOnce(&mut N, Result<bool>)>,
    },
    Sync {
        future: OpFuture<()>,
        action: Box<dyn FnOnce(&mut N, Result<()>)>,
    },
}

/// Per-replica state shared by every algorithm: identity, membership, bus,
/// codec, storage, waiting list, clock reading, request counter, handler
/// table and the initialisation flag.
pub struct ReplicaCore<N> {
    id: ProcessId,
    replicas: Vec<ProcessId>,
    bus: Rc<dyn MessageBus>,
    codec: JsonCodec,
    /// The replica's private storage engine.
    pub storage: StorageEngine,
    /// Outstanding correlations and their deadlines.
    pub waiting: RequestWaitingList,
    now: Tick,
    request_seq: u64,
    handlers: HashMap<MessageType, Handler<N>>,
    pending_io: Vec<PendingIo<N>>,
    initialised: bool,
}

impl<N> ReplicaCore<N> {
    /// Assemble a core. `replicas` is the full cluster membership, including
    /// this node. The caller registers handlers and only then subscribes the
    /// node to the bus.
    pub fn new(
        id: ProcessId,
        replicas: Vec<ProcessId>,
        bus: Rc<dyn MessageBus>,
        storage: StorageEngine,
        request_timeout_ticks: u64,
    ) -> Self {
        let waiting = RequestWaitingList::new(id.clone(), request_timeout_ticks);
        ReplicaCore {
            id,
            replicas,
            bus,
            codec: JsonCodec,
            storage,
            waiting,
            now: 0,
            request_seq: 0,
            handlers: HashMap::new(),
            pending_io: Vec::new(),
            initialised: false,
        }
    }

    /// This node's identity.
    pub fn id(&self) -> &ProcessId {
        &self.id
    }

    /// Full cluster membership, including this node.
    pub fn replicas(&self) -> &[ProcessId] {
        &self.replicas
    }

    /// Cluster size N.
    pub fn cluster_size(&self) -> usize {
        self.replicas.len()
    }

    /// The bus this node is attached to.
    pub fn bus(&self) -> &Rc<dyn MessageBus> {
        &self.bus
    }

    /// The tick this node last observed.
    pub fn now(&self) -> Tick {
        self.now
    }

    /// True once the startup sync has completed.
    pub fn initialised(&self) -> bool {
        self.initialised
    }

    /// Register a handler for one message type. Later registrations replace
    /// earlier ones.
    pub fn register_handler(&mut self, message_type: MessageType, handler: Handler<N>) {
        self.handlers.insert(message_type, handler);
    }

    fn handler(&self, message_type: &MessageType) -> Option<Handler<N>> {
        self.handlers.get(message_type).copied()
    }

    /// Mint a correlation id unique among this node's outstanding requests.
    pub fn next_correlation_id(&mut self) -> String {
        self.request_seq += 1;
        format!("{}-{}", self.id.name(), self.request_seq)
    }

    /// Encode a value through the configured codec.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        self.codec.encode(value)
    }

    /// Decode a payload through the configured codec.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        self.codec.decode(bytes)
    }

    /// Serialize `value` and write it under `key`; `action` runs inside a
    /// later tick with the outcome. Encoding errors surface immediately.
    pub fn persist<T, F>(&mut self, key: &[u8], value: &T, action: F) -> Result<()>
    where
        T: Serialize,
        F: FnOnce(&mut N, Result<bool>) + 'static,
    {
        let bytes = self.codec.encode(value)?;
        let future = self.storage.put(key, &bytes);
        self.pending_io.push(PendingIo::Put {
            future,
            action: Box::new(action),
        });
        Ok(())
    }

    /// Read and decode the value under `key`; `action` runs inside a later
    /// tick with `Ok(None)` when the key is absent.
    pub fn load<T, F>(&mut self, key: &[u8], action: F)
    where
        T: DeserializeOwned + 'static,
        F: FnOnce(&mut N, Result<Option<T>>) + 'static,
    {
        let codec = self.codec;
        let future = self.storage.get(key);
        let decode = move |node: &mut N, result: Result<Option<Vec<u8>>>| {
            let typed = result.and_then(|maybe| match maybe {
                Some(bytes) => codec.decode::<T>(&bytes).map(Some),
                None => Ok(None),
            });
            action(node, typed);
        };
        self.pending_io.push(PendingIo::Get {
            future,
            action: Box::new(decode),
        });
    }
}

/// A concrete replication algorithm: a struct embedding a [`ReplicaCore`]
/// plus hook methods. Runtime behaviour comes from [`NodeExt`].
pub trait Node: Sized + 'static {
    /// Mutable access to the embedded core.
    fn core(&mut self) -> &mut ReplicaCore<Self>;

    /// Shared access to the embedded core.
    fn core_ref(&self) -> &ReplicaCore<Self>;

    /// Hook invoked once, when the startup sync completes.
    fn on_initialised(&mut self) {}

    /// Hook invoked at the end of every tick, after messages, storage
    /// completions and timeouts have been processed.
    fn after_tick(&mut self, _now: Tick) {}
}

/// The replica runtime, available on every [`Node`] through a blanket
/// implementation.
pub trait NodeExt: Node {
    /// Begin initialisation: issue the startup sync. The node rejects
    /// everything but `HELLO` until the sync completes; completion flips
    /// `initialised` exactly once and fires [`Node::on_initialised`].
    fn start(&mut self) {
        let future = self.core().storage.sync();
        self.core().pending_io.push(PendingIo::Sync {
            future,
            action: Box::new(|node: &mut Self, result| match result {
                Ok(()) => {
                    node.core().initialised = true;
                    info!(replica = %node.core_ref().id(), "replica initialised");
                    node.on_initialised();
                }
                Err(error) => {
                    error!(
                        replica = %node.core_ref().id(),
                        %error,
                        "startup sync failed; replica stays uninitialised"
                    );
                }
            }),
        });
    }

    /// Deliver one message through the handler table. `HELLO` is answered
    /// with `WELCOME` or `REJECT` regardless of the gate; every other
    /// message is dropped until the node is initialised.
    fn dispatch(&mut self, message: Message) {
        if message.message_type == MessageType::HELLO {
            let kind = if self.core_ref().initialised {
                MessageType::WELCOME
            } else {
                MessageType::REJECT
            };
            let reply = Message::new(
                self.core_ref().id().clone(),
                message.source.clone(),
                message.peer_type,
                kind,
                Vec::new(),
                message.correlation_id.clone(),
            );
            self.send_message(reply);
            return;
        }
        if !self.core_ref().initialised {
            debug!(
                replica = %self.core_ref().id(),
                kind = %message.message_type,
                "message dropped: replica not initialised"
            );
            return;
        }
        match self.core_ref().handler(&message.message_type) {
            Some(handler) => handler(self, message),
            None => warn!(
                replica = %self.core_ref().id(),
                kind = %message.message_type,
                "message dropped: no handler registered"
            ),
        }
    }

    /// Send a message. A destination equal to this node's id takes the
    /// self-send fast path: the message goes through the local dispatch
    /// path synchronously, before the current handler returns, and still
    /// counts as an ordinary delivery for the waiting list.
    fn send_message(&mut self, message: Message) {
        if message.destination == *self.core_ref().id() {
            trace!(
                replica = %self.core_ref().id(),
                kind = %message.message_type,
                "self send: dispatching directly"
            );
            self.dispatch(message);
            return;
        }
        if let Err(error) = self.core_ref().bus().send(message) {
            warn!(replica = %self.core_ref().id(), %error, "bus send failed");
        }
    }

    /// Respond to `request`: same correlation id, same peer type, reversed
    /// direction. Encoding failures are logged and the reply is dropped.
    fn reply<T: Serialize>(&mut self, request: &Message, message_type: MessageType, payload: &T) {
        let encoded = match self.core_ref().encode(payload) {
            Ok(bytes) => bytes,
            Err(error) => {
                error!(
                    replica = %self.core_ref().id(),
                    kind = %message_type,
                    %error,
                    "reply payload failed to encode"
                );
                return;
            }
        };
        let response = Message::new(
            self.core_ref().id().clone(),
            request.source.clone(),
            request.peer_type,
            message_type,
            encoded,
            request.correlation_id.clone(),
        );
        self.send_message(response);
    }

    /// For every member of the cluster (this node included): mint a fresh
    /// correlation id, register it with `callback` in the waiting list, and
    /// send the message produced by `build(correlation_id, destination)`.
    fn broadcast_to_all_replicas<F>(&mut self, callback: Rc<dyn ResponseCallback>, mut build: F)
    where
        F: FnMut(&str, &ProcessId) -> Message,
    {
        let members = self.core_ref().replicas().to_vec();
        for destination in members {
            let correlation_id = self.core().next_correlation_id();
            self.core()
                .waiting
                .add(correlation_id.clone(), destination.clone(), callback.clone());
            let message = build(&correlation_id, &destination);
            self.send_message(message);
        }
    }

    /// Close the bus subscription and the storage engine.
    fn shutdown(&mut self) {
        let id = self.core_ref().id().clone();
        self.core_ref().bus().unregister(&id);
        self.core().storage.close();
        info!(replica = %id, "replica shut down");
    }

    /// One tick: advance storage and expire deadlines, run due storage
    /// continuations, deliver buffered messages, then the algorithm's
    /// [`Node::after_tick`] hook. Deadlines are expired first so that
    /// entries added later in the same tick see the current tick as their
    /// arrival time.
    fn step(&mut self, now: Tick) {
        {
            let core = self.core();
            core.now = now;
            core.storage.tick(now);
            core.waiting.tick(now);
        }
        self.drain_pending_io();
        let id = self.core_ref().id().clone();
        let inbound = self.core_ref().bus().drain_ready(&id, now);
        for message in inbound {
            self.dispatch(message);
        }
        self.after_tick(now);
    }

    /// Run continuations whose storage futures have resolved, preserving
    /// submission order for the rest.
    fn drain_pending_io(&mut self) {
        let pending = std::mem::take(&mut self.core().pending_io);
        let mut unresolved = Vec::with_capacity(pending.len());
        for io in pending {
            match io {
                PendingIo::Get { future, action } => match future.take() {
                    Some(result) => action(self, result),
                    None => unresolved.push(PendingIo::Get { future, action }),
                },
                PendingIo::Put { future, action } => match future.take() {
                    Some(result) => action(self, result),
                    None => unresolved.push(PendingIo::Put { future, action }),
                },
                PendingIo::Sync { future, action } => match future.take() {
                    Some(result) => action(self, result),
                    None => unresolved.push(PendingIo::Sync { future, action }),
                },
            }
        }
        // Continuations may have queued fresh I/O; keep the older entries first.
        let queued_during_drain = std::mem::take(&mut self.core().pending_io);
        unresolved.extend(queued_during_drain);
        self.core().pending_io = unresolved;
    }
}

impl<N: Node> NodeExt for N {}
