//! Wire payloads for the quorum register protocol

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::codec::{Codec, JsonCodec};
use crate::Result;

/// A value paired with its logical timestamp: the unit of replicated state.
/// Timestamps are externally supplied tags; the register never invents them.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    /// Opaque value bytes.
    pub value: Vec<u8>,
    /// Logical timestamp supplied by the writer.
    pub timestamp: i64,
}

impl VersionedValue {
    /// Pair a value with its timestamp.
    pub fn new(value: Vec<u8>, timestamp: i64) -> Self {
        VersionedValue { value, timestamp }
    }

    /// Last-writer-wins: true when `self` must replace `other`. Equal
    /// timestamps break by strictly greater byte value, so every replica
    /// reaches the same verdict.
    pub fn supersedes(&self, other: &VersionedValue) -> bool {
        match self.timestamp.cmp(&other.timestamp) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.value > other.value,
        }
    }
}

/// Client write request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetRequest {
    /// Register key.
    pub key: Vec<u8>,
    /// Value bytes to store.
    pub value: Vec<u8>,
    /// Client-supplied logical timestamp.
    pub timestamp: i64,
}

/// Client write acknowledgement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetOk {}

/// Client read request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetRequest {
    /// Register key.
    pub key: Vec<u8>,
}

/// Client read result: the highest-timestamped value a quorum observed, or
/// `None` when no replica in the quorum held the key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetOk {
    /// The winning versioned value, if any.
    pub value: Option<VersionedValue>,
}

/// Coordinator-to-replica versioned write.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteRequest {
    /// Register key.
    pub key: Vec<u8>,
    /// Versioned value to install.
    pub value: VersionedValue,
}

/// Replica write acknowledgement. A stale write is acknowledged with
/// `accepted: false`; it still counts toward the quorum.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteOk {
    /// Whether the value was installed, as opposed to an idempotent no-op.
    pub accepted: bool,
}

/// Coordinator-to-replica versioned read.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadRequest {
    /// Register key.
    pub key: Vec<u8>,
}

/// Replica read result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadOk {
    /// The replica's stored versioned value, if any.
    pub value: Option<VersionedValue>,
}

/// Payload shared by every `_ERR` response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Human-readable failure description.
    pub reason: String,
}

pub(crate) fn decode_write_ok(bytes: &[u8]) -> Result<WriteOk> {
    JsonCodec.decode(bytes)
}

pub(crate) fn decode_read_ok(bytes: &[u8]) -> Result<ReadOk> {
    JsonCodec.decode(bytes)
}
