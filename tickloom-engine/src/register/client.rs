//! Register protocol client
//!
//! A thin request/reply endpoint for the quorum register: it registers its
//! own process id on the bus, sends `CLIENT_SET`/`CLIENT_GET` requests at a
//! coordinator of the caller's choosing, and drains replies during a tick
//! (or, over a real transport, whenever the caller polls).

use std::rc::Rc;

use tracing::debug;

use crate::bus::MessageBus;
use crate::clock::Tick;
use crate::codec::{Codec, JsonCodec};
use crate::message::{Message, MessageType, PeerType};
use crate::process::ProcessId;
use crate::register::messages::{ErrorReply, GetOk, GetRequest, SetRequest};
use crate::register::VersionedValue;
use crate::Result;

/// A client endpoint of the quorum register.
pub struct ClusterClient {
    id: ProcessId,
    bus: Rc<dyn MessageBus>,
    codec: JsonCodec,
    seq: u64,
}

impl ClusterClient {
    /// Register `id` on the bus and return a client handle.
    pub fn new(id: ProcessId, bus: Rc<dyn MessageBus>) -> Self {
        bus.register(id.clone());
        ClusterClient {
            id,
            bus,
            codec: JsonCodec,
            seq: 0,
        }
    }

    /// This client's identity.
    pub fn id(&self) -> &ProcessId {
        &self.id
    }

    fn next_correlation_id(&mut self) -> String {
        self.seq += 1;
        format!("{}-{}", self.id.name(), self.seq)
    }

    /// Probe a replica's initialisation gate. The reply is `WELCOME` once
    /// the node serves requests, `REJECT` before that.
    pub fn send_hello(&mut self, to: &ProcessId) -> Result<String> {
        let correlation_id = self.next_correlation_id();
        self.bus.send(Message::new(
            self.id.clone(),
            to.clone(),
            PeerType::Client,
            MessageType::HELLO,
            Vec::new(),
            correlation_id.clone(),
        ))?;
        Ok(correlation_id)
    }

    /// Send a write request to `to`, returning the correlation id the reply
    /// will carry.
    pub fn send_set(
        &mut self,
        to: &ProcessId,
        key: &[u8],
        value: &[u8],
        timestamp: i64,
    ) -> Result<String> {
        let correlation_id = self.next_correlation_id();
        self.send_set_with_id(to, key, value, timestamp, correlation_id)
    }

    /// Send a write request under a caller-chosen correlation id.
    pub fn send_set_with_id(
        &mut self,
        to: &ProcessId,
        key: &[u8],
        value: &[u8],
        timestamp: i64,
        correlation_id: String,
    ) -> Result<String> {
        let payload = self.codec.encode(&SetRequest {
            key: key.to_vec(),
            value: value.to_vec(),
            timestamp,
        })?;
        debug!(client = %self.id, coordinator = %to, correlation_id = %correlation_id, "set");
        self.bus.send(Message::new(
            self.id.clone(),
            to.clone(),
            PeerType::Client,
            MessageType::CLIENT_SET,
            payload,
            correlation_id.clone(),
        ))?;
        Ok(correlation_id)
    }

    /// Send a read request to `to`, returning the correlation id the reply
    /// will carry.
    pub fn send_get(&mut self, to: &ProcessId, key: &[u8]) -> Result<String> {
        let correlation_id = self.next_correlation_id();
        self.send_get_with_id(to, key, correlation_id)
    }

    /// Send a read request under a caller-chosen correlation id.
    pub fn send_get_with_id(
        &mut self,
        to: &ProcessId,
        key: &[u8],
        correlation_id: String,
    ) -> Result<String> {
        let payload = self.codec.encode(&GetRequest { key: key.to_vec() })?;
        debug!(client = %self.id, coordinator = %to, correlation_id = %correlation_id, "get");
        self.bus.send(Message::new(
            self.id.clone(),
            to.clone(),
            PeerType::Client,
            MessageType::CLIENT_GET,
            payload,
            correlation_id.clone(),
        ))?;
        Ok(correlation_id)
    }

    /// Replies that have become deliverable, in arrival order.
    pub fn drain_replies(&mut self, now: Tick) -> Vec<Message> {
        self.bus.drain_ready(&self.id, now)
    }

    /// Decode a `CLIENT_GET_OK` payload.
    pub fn decode_get_ok(&self, message: &Message) -> Result<Option<VersionedValue>> {
        self.codec
            .decode::<GetOk>(&message.payload)
            .map(|ok| ok.value)
    }

    /// Decode an `_ERR` payload's reason.
    pub fn decode_error(&self, message: &Message) -> Result<String> {
        self.codec
            .decode::<ErrorReply>(&message.payload)
            .map(|err| err.reason)
    }

    /// Unsubscribe from the bus.
    pub fn close(&mut self) {
        self.bus.unregister(&self.id);
    }
}
