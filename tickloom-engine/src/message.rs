//! Message envelope
//!
//! Immutable typed messages exchanged between processes. The runtime fixes
//! the envelope fields and their non-null semantics; payload layout belongs
//! to the codec.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::process::ProcessId;

/// Whether the far side of a message is a client or another server.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PeerType {
    /// An external client of the cluster.
    Client,
    /// Another replica.
    Server,
}

/// A named message tag. Equality is by name; custom tags may be minted with
/// [`MessageType::custom`].
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageType(Cow<'static, str>);

impl MessageType {
    /// Client handshake probe.
    pub const HELLO: MessageType = MessageType(Cow::Borrowed("hello"));
    /// Handshake accepted; the replica is serving.
    pub const WELCOME: MessageType = MessageType(Cow::Borrowed("welcome"));
    /// Handshake refused; the replica has not finished initialising.
    pub const REJECT: MessageType = MessageType(Cow::Borrowed("reject"));

    /// Client write request.
    pub const CLIENT_SET: MessageType = MessageType(Cow::Borrowed("client_set"));
    /// Client write acknowledged by a quorum.
    pub const CLIENT_SET_OK: MessageType = MessageType(Cow::Borrowed("client_set_ok"));
    /// Client write failed.
    pub const CLIENT_SET_ERR: MessageType = MessageType(Cow::Borrowed("client_set_err"));
    /// Client read request.
    pub const CLIENT_GET: MessageType = MessageType(Cow::Borrowed("client_get"));
    /// Client read served from a quorum.
    pub const CLIENT_GET_OK: MessageType = MessageType(Cow::Borrowed("client_get_ok"));
    /// Client read failed.
    pub const CLIENT_GET_ERR: MessageType = MessageType(Cow::Borrowed("client_get_err"));

    /// Coordinator-to-replica versioned write.
    pub const INTERNAL_WRITE: MessageType = MessageType(Cow::Borrowed("internal_write"));
    /// Replica accepted (or idempotently skipped) a versioned write.
    pub const INTERNAL_WRITE_OK: MessageType = MessageType(Cow::Borrowed("internal_write_ok"));
    /// Replica failed to persist a versioned write.
    pub const INTERNAL_WRITE_ERR: MessageType = MessageType(Cow::Borrowed("internal_write_err"));
    /// Coordinator-to-replica versioned read.
    pub const INTERNAL_READ: MessageType = MessageType(Cow::Borrowed("internal_read"));
    /// Replica answered a versioned read.
    pub const INTERNAL_READ_OK: MessageType = MessageType(Cow::Borrowed("internal_read_ok"));
    /// Replica failed a versioned read.
    pub const INTERNAL_READ_ERR: MessageType = MessageType(Cow::Borrowed("internal_read_err"));

    /// Mint a custom tag by name.
    pub fn custom(name: &str) -> Self {
        MessageType(Cow::Owned(name.to_string()))
    }

    /// The tag name.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The immutable message envelope. All fields are required; the correlation
/// id is opaque but must be unique per outstanding request from its
/// originator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    /// Sending process.
    pub source: ProcessId,
    /// Receiving process.
    pub destination: ProcessId,
    /// Role of the peer this message talks to.
    pub peer_type: PeerType,
    /// Dispatch tag.
    pub message_type: MessageType,
    /// Codec-defined payload bytes.
    pub payload: Vec<u8>,
    /// Ties a request to its eventual response.
    pub correlation_id: String,
}

impl Message {
    /// Build an envelope.
    pub fn new(
        source: ProcessId,
        destination: ProcessId,
        peer_type: PeerType,
        message_type: MessageType,
        payload: Vec<u8>,
        correlation_id: String,
    ) -> Self {
        Message {
            source,
            destination,
            peer_type,
            message_type,
            payload,
            correlation_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_equality_is_by_name() {
        assert_eq!(MessageType::custom("hello"), MessageType::HELLO);
        assert_ne!(MessageType::custom("hola"), MessageType::HELLO);
    }

    #[test]
    fn test_message_type_serde_round_trip() {
        let bytes = serde_json::to_vec(&MessageType::INTERNAL_WRITE).unwrap();
        let back: MessageType = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, MessageType::INTERNAL_WRITE);
    }

    #[test]
    fn test_envelope_serde_round_trip() {
        let msg = Message::new(
            ProcessId::of("client-a"),
            ProcessId::of("athens"),
            PeerType::Client,
            MessageType::CLIENT_SET,
            b"payload".to_vec(),
            "client-a-1".to_string(),
        );
        let bytes = serde_json::to_vec(&msg).unwrap();
        let back: Message = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.source, msg.source);
        assert_eq!(back.destination, msg.destination);
        assert_eq!(back.message_type, msg.message_type);
        assert_eq!(back.payload, msg.payload);
        assert_eq!(back.correlation_id, msg.correlation_id);
    }
}
