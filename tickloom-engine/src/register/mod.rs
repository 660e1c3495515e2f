//! Quorum Register Protocol
//!
//! A single logical key-value register per key, replicated across all N
//! cluster members with majority quorums (Q = N/2 + 1). Writes carry
//! client-supplied timestamps and reconcile last-writer-wins; reads return
//! the highest-timestamped value a quorum observed and repair lagging
//! replicas in the background.

mod client;
mod messages;

pub use client::ClusterClient;
pub use messages::{
    ErrorReply, GetOk, GetRequest, ReadOk, ReadRequest, SetOk, SetRequest, VersionedValue,
    WriteOk, WriteRequest,
};

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;

use tracing::{debug, error, warn};

use crate::bus::MessageBus;
use crate::clock::{Tick, Tickable};
use crate::future::OpFuture;
use crate::message::{Message, MessageType, PeerType};
use crate::process::ProcessId;
use crate::quorum::QuorumCallback;
use crate::replica::{Node, NodeExt, ReplicaCore};
use crate::storage::StorageEngine;
use crate::TickloomError;

/// One client request the coordinator is holding open while its quorum
/// callback runs: INIT, then waiting for the quorum, then exactly one reply.
enum InFlight {
    Set {
        request: Message,
        future: OpFuture<BTreeMap<ProcessId, WriteOk>>,
    },
    Get {
        request: Message,
        key: Vec<u8>,
        future: OpFuture<BTreeMap<ProcessId, ReadOk>>,
    },
}

/// A replica running the quorum register protocol. Any member serves as
/// coordinator for the requests a client happens to send it.
pub struct QuorumReplica {
    core: ReplicaCore<QuorumReplica>,
    inflight: Vec<InFlight>,
    /// Per-key write serialization. While a versioned write for a key is
    /// between its load and its persist, later writes for the same key wait
    /// here; applying them interleaved would let a stale value overwrite a
    /// newer one.
    write_queues: HashMap<Vec<u8>, VecDeque<(WriteRequest, Message)>>,
}

impl QuorumReplica {
    /// Build a replica, wire its handler table, and subscribe it to the bus.
    /// `replicas` is the full membership, this node included. Call
    /// [`NodeExt::start`] afterwards to open the initialisation gate.
    pub fn new(
        id: ProcessId,
        replicas: Vec<ProcessId>,
        bus: Rc<dyn MessageBus>,
        storage: StorageEngine,
        request_timeout_ticks: u64,
    ) -> Self {
        let mut core = ReplicaCore::new(
            id.clone(),
            replicas,
            bus.clone(),
            storage,
            request_timeout_ticks,
        );
        core.register_handler(MessageType::CLIENT_SET, on_client_set);
        core.register_handler(MessageType::CLIENT_GET, on_client_get);
        core.register_handler(MessageType::INTERNAL_WRITE, on_internal_write);
        core.register_handler(MessageType::INTERNAL_READ, on_internal_read);
        core.register_handler(MessageType::INTERNAL_WRITE_OK, on_internal_response);
        core.register_handler(MessageType::INTERNAL_READ_OK, on_internal_response);
        core.register_handler(MessageType::INTERNAL_WRITE_ERR, on_internal_error);
        core.register_handler(MessageType::INTERNAL_READ_ERR, on_internal_error);
        // Handlers are in place; only now may deliveries begin.
        bus.register(id);
        QuorumReplica {
            core,
            inflight: Vec::new(),
            write_queues: HashMap::new(),
        }
    }

    /// Client requests still waiting on their quorum.
    pub fn inflight_requests(&self) -> usize {
        self.inflight.len()
    }

    fn drain_completed_requests(&mut self) {
        let inflight = std::mem::take(&mut self.inflight);
        let mut open = Vec::with_capacity(inflight.len());
        for entry in inflight {
            match entry {
                InFlight::Set { request, future } => match future.take() {
                    None => open.push(InFlight::Set { request, future }),
                    Some(Ok(acks)) => {
                        debug!(
                            replica = %self.core_ref().id(),
                            correlation_id = %request.correlation_id,
                            acks = acks.len(),
                            "write quorum reached"
                        );
                        self.reply(&request, MessageType::CLIENT_SET_OK, &SetOk {});
                    }
                    Some(Err(outcome)) => {
                        warn!(
                            replica = %self.core_ref().id(),
                            correlation_id = %request.correlation_id,
                            %outcome,
                            "write failed"
                        );
                        self.reply(
                            &request,
                            MessageType::CLIENT_SET_ERR,
                            &ErrorReply {
                                reason: outcome.to_string(),
                            },
                        );
                    }
                },
                InFlight::Get {
                    request,
                    key,
                    future,
                } => match future.take() {
                    None => open.push(InFlight::Get {
                        request,
                        key,
                        future,
                    }),
                    Some(Ok(responses)) => {
                        let winner = highest(&responses);
                        if let Some(winner) = &winner {
                            self.read_repair(&key, winner, &responses);
                        }
                        self.reply(&request, MessageType::CLIENT_GET_OK, &GetOk { value: winner });
                    }
                    Some(Err(outcome)) => {
                        warn!(
                            replica = %self.core_ref().id(),
                            correlation_id = %request.correlation_id,
                            %outcome,
                            "read failed"
                        );
                        self.reply(
                            &request,
                            MessageType::CLIENT_GET_ERR,
                            &ErrorReply {
                                reason: outcome.to_string(),
                            },
                        );
                    }
                },
            }
        }
        // Keep anything that was opened while replies were going out.
        let opened = std::mem::take(&mut self.inflight);
        open.extend(opened);
        self.inflight = open;
    }

    /// Push the winning value at replicas that answered with something
    /// older. Fire-and-forget: the client reply never waits for these, and
    /// their acknowledgements are absorbed as late responses.
    fn read_repair(
        &mut self,
        key: &[u8],
        winner: &VersionedValue,
        responses: &BTreeMap<ProcessId, ReadOk>,
    ) {
        let laggards: Vec<ProcessId> = responses
            .iter()
            .filter(|(_, response)| match &response.value {
                None => true,
                Some(held) => winner.supersedes(held),
            })
            .map(|(peer, _)| peer.clone())
            .collect();
        if laggards.is_empty() {
            return;
        }
        let payload = match self.core_ref().encode(&WriteRequest {
            key: key.to_vec(),
            value: winner.clone(),
        }) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(replica = %self.core_ref().id(), %err, "read repair payload failed to encode");
                return;
            }
        };
        for peer in laggards {
            debug!(
                replica = %self.core_ref().id(),
                peer = %peer,
                timestamp = winner.timestamp,
                "read repair"
            );
            let correlation_id = self.core().next_correlation_id();
            let message = Message::new(
                self.core_ref().id().clone(),
                peer,
                PeerType::Server,
                MessageType::INTERNAL_WRITE,
                payload.clone(),
                correlation_id,
            );
            self.send_message(message);
        }
    }
}

impl Node for QuorumReplica {
    fn core(&mut self) -> &mut ReplicaCore<Self> {
        &mut self.core
    }

    fn core_ref(&self) -> &ReplicaCore<Self> {
        &self.core
    }

    fn after_tick(&mut self, _now: Tick) {
        self.drain_completed_requests();
    }
}

impl Tickable for QuorumReplica {
    fn tick(&mut self, now: Tick) {
        self.step(now);
    }
}

fn highest(responses: &BTreeMap<ProcessId, ReadOk>) -> Option<VersionedValue> {
    responses
        .values()
        .filter_map(|response| response.value.as_ref())
        .max_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.value.cmp(&b.value))
        })
        .cloned()
}

fn on_client_set(node: &mut QuorumReplica, message: Message) {
    let request: SetRequest = match node.core_ref().decode(&message.payload) {
        Ok(request) => request,
        Err(err) => {
            warn!(replica = %node.core_ref().id(), %err, "unreadable client set request");
            node.reply(
                &message,
                MessageType::CLIENT_SET_ERR,
                &ErrorReply {
                    reason: err.to_string(),
                },
            );
            return;
        }
    };
    let write = WriteRequest {
        key: request.key,
        value: VersionedValue::new(request.value, request.timestamp),
    };
    let payload = match node.core_ref().encode(&write) {
        Ok(bytes) => bytes,
        Err(err) => {
            node.reply(
                &message,
                MessageType::CLIENT_SET_ERR,
                &ErrorReply {
                    reason: err.to_string(),
                },
            );
            return;
        }
    };
    let callback = QuorumCallback::majority(node.core_ref().cluster_size(), messages::decode_write_ok);
    node.inflight.push(InFlight::Set {
        request: message,
        future: callback.future(),
    });
    let source = node.core_ref().id().clone();
    node.broadcast_to_all_replicas(callback, |correlation_id, destination| {
        Message::new(
            source.clone(),
            destination.clone(),
            PeerType::Server,
            MessageType::INTERNAL_WRITE,
            payload.clone(),
            correlation_id.to_string(),
        )
    });
}

fn on_client_get(node: &mut QuorumReplica, message: Message) {
    let request: GetRequest = match node.core_ref().decode(&message.payload) {
        Ok(request) => request,
        Err(err) => {
            warn!(replica = %node.core_ref().id(), %err, "unreadable client get request");
            node.reply(
                &message,
                MessageType::CLIENT_GET_ERR,
                &ErrorReply {
                    reason: err.to_string(),
                },
            );
            return;
        }
    };
    let read = ReadRequest {
        key: request.key.clone(),
    };
    let payload = match node.core_ref().encode(&read) {
        Ok(bytes) => bytes,
        Err(err) => {
            node.reply(
                &message,
                MessageType::CLIENT_GET_ERR,
                &ErrorReply {
                    reason: err.to_string(),
                },
            );
            return;
        }
    };
    let callback = QuorumCallback::majority(node.core_ref().cluster_size(), messages::decode_read_ok);
    node.inflight.push(InFlight::Get {
        request: message,
        key: request.key,
        future: callback.future(),
    });
    let source = node.core_ref().id().clone();
    node.broadcast_to_all_replicas(callback, |correlation_id, destination| {
        Message::new(
            source.clone(),
            destination.clone(),
            PeerType::Server,
            MessageType::INTERNAL_READ,
            payload.clone(),
            correlation_id.to_string(),
        )
    });
}

fn on_internal_write(node: &mut QuorumReplica, message: Message) {
    let request: WriteRequest = match node.core_ref().decode(&message.payload) {
        Ok(request) => request,
        Err(err) => {
            node.reply(
                &message,
                MessageType::INTERNAL_WRITE_ERR,
                &ErrorReply {
                    reason: err.to_string(),
                },
            );
            return;
        }
    };
    if let Some(queue) = node.write_queues.get_mut(&request.key) {
        // A write for this key is between its load and its persist; applying
        // this one now could let a stale value overwrite a newer one.
        queue.push_back((request, message));
        return;
    }
    node.write_queues
        .insert(request.key.clone(), VecDeque::new());
    apply_write(node, request, message);
}

fn apply_write(node: &mut QuorumReplica, request: WriteRequest, message: Message) {
    let key = request.key.clone();
    let lookup = key.clone();
    node.core()
        .load::<VersionedValue, _>(&lookup, move |node, existing| {
            let current = match existing {
                Ok(current) => current,
                Err(err) => {
                    node.reply(
                        &message,
                        MessageType::INTERNAL_WRITE_ERR,
                        &ErrorReply {
                            reason: err.to_string(),
                        },
                    );
                    finish_write(node, key);
                    return;
                }
            };
            let accepted = current
                .as_ref()
                .map_or(true, |held| request.value.supersedes(held));
            if !accepted {
                // Stale write: acknowledge as an idempotent no-op so it
                // still counts toward the quorum.
                node.reply(
                    &message,
                    MessageType::INTERNAL_WRITE_OK,
                    &WriteOk { accepted: false },
                );
                finish_write(node, key);
                return;
            }
            let reply_to = message.clone();
            let persist_key = key.clone();
            let persisted =
                node.core()
                    .persist(&request.key, &request.value, move |node, stored| {
                        match stored {
                            Ok(_) => node.reply(
                                &message,
                                MessageType::INTERNAL_WRITE_OK,
                                &WriteOk { accepted: true },
                            ),
                            Err(err) => node.reply(
                                &message,
                                MessageType::INTERNAL_WRITE_ERR,
                                &ErrorReply {
                                    reason: err.to_string(),
                                },
                            ),
                        }
                        finish_write(node, persist_key);
                    });
            if let Err(err) = persisted {
                node.reply(
                    &reply_to,
                    MessageType::INTERNAL_WRITE_ERR,
                    &ErrorReply {
                        reason: err.to_string(),
                    },
                );
                finish_write(node, key);
            }
        });
}

/// Release the per-key write slot and start the next queued write, if any.
fn finish_write(node: &mut QuorumReplica, key: Vec<u8>) {
    let next = node
        .write_queues
        .get_mut(&key)
        .and_then(|queue| queue.pop_front());
    match next {
        Some((request, message)) => apply_write(node, request, message),
        None => {
            node.write_queues.remove(&key);
        }
    }
}

fn on_internal_read(node: &mut QuorumReplica, message: Message) {
    let request: ReadRequest = match node.core_ref().decode(&message.payload) {
        Ok(request) => request,
        Err(err) => {
            node.reply(
                &message,
                MessageType::INTERNAL_READ_ERR,
                &ErrorReply {
                    reason: err.to_string(),
                },
            );
            return;
        }
    };
    node.core()
        .load::<VersionedValue, _>(&request.key, move |node, loaded| match loaded {
            Ok(value) => node.reply(&message, MessageType::INTERNAL_READ_OK, &ReadOk { value }),
            Err(err) => node.reply(
                &message,
                MessageType::INTERNAL_READ_ERR,
                &ErrorReply {
                    reason: err.to_string(),
                },
            ),
        });
}

fn on_internal_response(node: &mut QuorumReplica, message: Message) {
    let from = message.source.clone();
    node.core()
        .waiting
        .handle_response(&message.correlation_id, from, Ok(message.payload));
}

fn on_internal_error(node: &mut QuorumReplica, message: Message) {
    let reason = node
        .core_ref()
        .decode::<ErrorReply>(&message.payload)
        .map(|reply| reply.reason)
        .unwrap_or_else(|_| "unreadable error reply".to_string());
    let from = message.source.clone();
    node.core().waiting.handle_response(
        &message.correlation_id,
        from,
        Err(TickloomError::StorageFailed(reason)),
    );
}
