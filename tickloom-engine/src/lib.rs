//! Deterministic Tick-Driven Replication Runtime
//!
//! TickLoom simulates or runs a cluster of replicas that communicate over a
//! message bus, persist state through an asynchronous key-value store, and
//! answer client read/write requests with quorum consistency.
//!
//! # Architecture
//!
//! - **Logical clock**: discrete ticks drive every component; nothing blocks
//! - **Async storage**: operations complete on a future tick, with seeded
//!   delay and failure injection
//! - **Waiting list**: outstanding correlations with deadlines and quorum
//!   aggregation
//! - **Replica runtime**: handler dispatch, persistence helpers, broadcast,
//!   initialisation gate
//! - **Quorum register**: last-writer-wins replicated register with
//!   read-repair
//!
//! Given a fixed seed and a fixed input transcript, every observable output
//! is reproducible. That property is what the linearizability harnesses
//! downstream rely on.

#![warn(missing_docs)]

pub mod bus;
pub mod clock;
pub mod codec;
pub mod future;
pub mod message;
pub mod process;
pub mod quorum;
pub mod register;
pub mod replica;
pub mod sim;
pub mod storage;
pub mod waitlist;

pub use bus::{MessageBus, SimulatedBus};
pub use clock::{Tick, TickDriver, Tickable};
pub use codec::{Codec, JsonCodec};
pub use future::OpFuture;
pub use message::{Message, MessageType, PeerType};
pub use process::ProcessId;
pub use quorum::QuorumCallback;
pub use register::{ClusterClient, QuorumReplica, VersionedValue};
pub use replica::{Node, NodeExt, ReplicaCore};
pub use sim::SimCluster;
pub use storage::{StorageConfig, StorageEngine, WriteBatch, WriteOptions};
pub use waitlist::{RequestWaitingList, ResponseCallback};

use thiserror::Error;

/// Runtime errors surfaced by the tick loop, storage engine, waiting list
/// and quorum protocol.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TickloomError {
    /// Malformed input at an API boundary; never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Transient or permanent storage failure, injected or from the backend.
    #[error("storage operation failed: {0}")]
    StorageFailed(String),

    /// A waiting-list deadline passed before the response arrived.
    #[error("request timed out")]
    TimedOut,

    /// Not enough replicas agreed before the callback completed.
    #[error("quorum not reached: {successes} of {required} required successes")]
    QuorumNotReached {
        /// Successful responses observed at completion time.
        successes: usize,
        /// Successes the callback needed.
        required: usize,
    },

    /// A waiting-list entry was cancelled explicitly.
    #[error("request cancelled")]
    Cancelled,

    /// Message received before the replica finished initialisation.
    #[error("replica not initialised")]
    NotInitialised,

    /// No handler registered for the message type.
    #[error("no handler registered for message type {0}")]
    UnknownHandler(String),

    /// Payload encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// The storage engine was shut down.
    #[error("storage engine closed")]
    Closed,

    /// Message bus delivery failure.
    #[error("bus i/o error: {0}")]
    Io(String),
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, TickloomError>;
