//! Async Storage Engine
//!
//! Per-replica key-value persistence whose operations resolve on a future
//! tick. Every call records a completion tick, queues the operation, and
//! returns an unresolved [`OpFuture`]; the engine's own `tick` drains due
//! operations in (completion tick, submission order), injecting failures
//! from a seeded PRNG so fault schedules replay exactly.

mod backend;

pub use backend::{MemoryBackend, SledBackend, StorageBackend};

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::clock::{Tick, Tickable};
use crate::future::OpFuture;
use crate::{Result, TickloomError};

/// Durability options for writes.
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteOptions {
    /// Force backend durability as part of the write itself. The default
    /// leaves durability to an explicit [`StorageEngine::sync`].
    pub fsync: bool,
}

/// An ordered set of writes applied together.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl WriteBatch {
    /// An empty batch.
    pub fn new() -> Self {
        WriteBatch::default()
    }

    /// Append a write.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.entries.push((key, value));
    }

    /// The writes, in insertion order.
    pub fn entries(&self) -> &[(Vec<u8>, Vec<u8>)] {
        &self.entries
    }

    /// True when no writes were appended.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of writes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Tuning for delay and fault injection.
#[derive(Clone, Copy, Debug)]
pub struct StorageConfig {
    /// Ticks between submission and completion. Clamped to at least one so
    /// completions are never observable in the submitting tick.
    pub delay_ticks: u64,
    /// Probability that a due operation resolves with `StorageFailed`
    /// instead of executing.
    pub failure_rate: f64,
    /// PRNG seed for fault injection. Same seed, same submissions, same
    /// faults.
    pub seed: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            delay_ticks: 1,
            failure_rate: 0.0,
            seed: 0,
        }
    }
}

enum StorageOp {
    Get {
        key: Vec<u8>,
        future: OpFuture<Option<Vec<u8>>>,
    },
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        options: WriteOptions,
        future: OpFuture<bool>,
    },
    PutBatch {
        batch: WriteBatch,
        options: WriteOptions,
        future: OpFuture<bool>,
    },
    ReadRange {
        start: Vec<u8>,
        end: Vec<u8>,
        future: OpFuture<BTreeMap<Vec<u8>, Vec<u8>>>,
    },
    LowerKey {
        upper_bound: Vec<u8>,
        future: OpFuture<Option<Vec<u8>>>,
    },
    Sync {
        future: OpFuture<()>,
    },
}

impl StorageOp {
    fn fail(self, error: TickloomError) {
        match self {
            StorageOp::Get { future, .. } => future.fail(error),
            StorageOp::Put { future, .. } => future.fail(error),
            StorageOp::PutBatch { future, .. } => future.fail(error),
            StorageOp::ReadRange { future, .. } => future.fail(error),
            StorageOp::LowerKey { future, .. } => future.fail(error),
            StorageOp::Sync { future } => future.fail(error),
        }
    }
}

/// The asynchronous key-value engine. Owned by exactly one replica and
/// mutated only inside that replica's tick.
pub struct StorageEngine {
    backend: Box<dyn StorageBackend>,
    pending: BTreeMap<(Tick, u64), StorageOp>,
    seq: u64,
    now: Tick,
    delay_ticks: u64,
    failure_rate: f64,
    rng: fastrand::Rng,
    closed: bool,
}

impl StorageEngine {
    /// Wrap a backend with the given delay/fault configuration.
    pub fn new(backend: Box<dyn StorageBackend>, config: StorageConfig) -> Self {
        StorageEngine {
            backend,
            pending: BTreeMap::new(),
            seq: 0,
            now: 0,
            delay_ticks: config.delay_ticks.max(1),
            failure_rate: config.failure_rate,
            rng: fastrand::Rng::with_seed(config.seed),
            closed: false,
        }
    }

    /// Memory-backed engine, for simulation and tests.
    pub fn in_memory(config: StorageConfig) -> Self {
        StorageEngine::new(Box::new(MemoryBackend::new()), config)
    }

    fn schedule(&mut self, op: StorageOp) {
        if self.closed {
            op.fail(TickloomError::Closed);
            return;
        }
        self.seq += 1;
        let completion = (self.now + self.delay_ticks, self.seq);
        trace!(tick = completion.0, seq = completion.1, "storage op scheduled");
        self.pending.insert(completion, op);
    }

    /// Read one key. Completes with `None` when absent.
    pub fn get(&mut self, key: &[u8]) -> OpFuture<Option<Vec<u8>>> {
        if key.is_empty() {
            return OpFuture::ready(Err(TickloomError::InvalidArgument(
                "empty key".to_string(),
            )));
        }
        let future = OpFuture::pending();
        self.schedule(
            StorageOp::Get {
                key: key.to_vec(),
                future: future.clone(),
            },
        );
        future
    }

    /// Write one key with default options.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> OpFuture<bool> {
        self.put_with_options(key, value, WriteOptions::default())
    }

    /// Write one key.
    pub fn put_with_options(
        &mut self,
        key: &[u8],
        value: &[u8],
        options: WriteOptions,
    ) -> OpFuture<bool> {
        if key.is_empty() {
            return OpFuture::ready(Err(TickloomError::InvalidArgument(
                "empty key".to_string(),
            )));
        }
        let future = OpFuture::pending();
        self.schedule(
            StorageOp::Put {
                key: key.to_vec(),
                value: value.to_vec(),
                options,
                future: future.clone(),
            },
        );
        future
    }

    /// Apply a batch of writes atomically with respect to this engine's
    /// submission order.
    pub fn put_batch(&mut self, batch: WriteBatch, options: WriteOptions) -> OpFuture<bool> {
        if batch.entries().iter().any(|(key, _)| key.is_empty()) {
            return OpFuture::ready(Err(TickloomError::InvalidArgument(
                "empty key in batch".to_string(),
            )));
        }
        let future = OpFuture::pending();
        self.schedule(
            StorageOp::PutBatch {
                batch,
                options,
                future: future.clone(),
            },
        );
        future
    }

    /// All entries with `start <= key < end`, in key order.
    pub fn read_range(&mut self, start: &[u8], end: &[u8]) -> OpFuture<BTreeMap<Vec<u8>, Vec<u8>>> {
        if start > end {
            return OpFuture::ready(Err(TickloomError::InvalidArgument(
                "range start past end".to_string(),
            )));
        }
        let future = OpFuture::pending();
        self.schedule(
            StorageOp::ReadRange {
                start: start.to_vec(),
                end: end.to_vec(),
                future: future.clone(),
            },
        );
        future
    }

    /// The greatest key strictly less than `upper_bound`. Recovers the last
    /// write-ahead index for subsystems that keep a lexicographic prefix.
    pub fn lower_key(&mut self, upper_bound: &[u8]) -> OpFuture<Option<Vec<u8>>> {
        let future = OpFuture::pending();
        self.schedule(
            StorageOp::LowerKey {
                upper_bound: upper_bound.to_vec(),
                future: future.clone(),
            },
        );
        future
    }

    /// Force durability of prior writes.
    pub fn sync(&mut self) -> OpFuture<()> {
        let future = OpFuture::pending();
        self.schedule(
            StorageOp::Sync {
                future: future.clone(),
            },
        );
        future
    }

    /// Shut the engine down: every queued operation resolves with `Closed`
    /// and later submissions are rejected.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let pending = std::mem::take(&mut self.pending);
        debug!(dropped = pending.len(), "storage engine closed");
        for (_, op) in pending {
            op.fail(TickloomError::Closed);
        }
    }

    /// Queued operations not yet due.
    pub fn pending_ops(&self) -> usize {
        self.pending.len()
    }

    /// Change the injected failure probability mid-run. Harnesses use this
    /// to turn faults on around a specific operation window.
    pub fn set_failure_rate(&mut self, failure_rate: f64) {
        self.failure_rate = failure_rate;
    }

    /// Direct synchronous backend read, bypassing delay and fault injection.
    /// For harness assertions and debugging only; protocol code must go
    /// through [`get`](Self::get).
    pub fn inspect(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.backend.get(key)
    }

    fn execute(&mut self, op: StorageOp) {
        match op {
            StorageOp::Get { key, future } => future.complete(self.backend.get(&key)),
            StorageOp::Put {
                key,
                value,
                options,
                future,
            } => {
                let result = self.backend.put(&key, &value).and_then(|()| {
                    if options.fsync {
                        self.backend.sync()?;
                    }
                    Ok(true)
                });
                future.complete(result);
            }
            StorageOp::PutBatch {
                batch,
                options,
                future,
            } => {
                let result = self.backend.put_batch(&batch).and_then(|()| {
                    if options.fsync {
                        self.backend.sync()?;
                    }
                    Ok(true)
                });
                future.complete(result);
            }
            StorageOp::ReadRange { start, end, future } => {
                future.complete(self.backend.read_range(&start, &end));
            }
            StorageOp::LowerKey {
                upper_bound,
                future,
            } => future.complete(self.backend.lower_key(&upper_bound)),
            StorageOp::Sync { future } => future.complete(self.backend.sync()),
        }
    }
}

impl Tickable for StorageEngine {
    fn tick(&mut self, now: Tick) {
        self.now = now;
        loop {
            let due = match self.pending.keys().next() {
                Some(&(tick, seq)) if tick <= now => (tick, seq),
                _ => break,
            };
            let op = match self.pending.remove(&due) {
                Some(op) => op,
                None => break,
            };
            if self.failure_rate > 0.0 && self.rng.f64() < self.failure_rate {
                trace!(tick = now, seq = due.1, "injected storage fault");
                op.fail(TickloomError::StorageFailed("injected fault".to_string()));
            } else {
                self.execute(op);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(delay: u64, failure_rate: f64, seed: u64) -> StorageEngine {
        StorageEngine::in_memory(StorageConfig {
            delay_ticks: delay,
            failure_rate,
            seed,
        })
    }

    #[test]
    fn test_completion_respects_delay() {
        let mut engine = engine(3, 0.0, 0);
        engine.tick(1);
        let future = engine.put(b"k", b"v");
        engine.tick(2);
        engine.tick(3);
        assert!(future.is_pending());
        engine.tick(4);
        assert_eq!(future.take(), Some(Ok(true)));
    }

    #[test]
    fn test_never_completes_in_submission_tick() {
        let mut engine = engine(0, 0.0, 0);
        engine.tick(1);
        let future = engine.put(b"k", b"v");
        assert!(future.is_pending());
        engine.tick(2);
        assert!(!future.is_pending());
    }

    #[test]
    fn test_ties_drain_in_submission_order() {
        let mut engine = engine(1, 0.0, 0);
        engine.tick(1);
        let first = engine.put(b"k", b"first");
        let second = engine.put(b"k", b"second");
        engine.tick(2);
        assert_eq!(first.take(), Some(Ok(true)));
        assert_eq!(second.take(), Some(Ok(true)));
        assert_eq!(engine.inspect(b"k").unwrap(), Some(b"second".to_vec()));
    }

    #[test]
    fn test_get_sees_prior_put() {
        let mut engine = engine(1, 0.0, 0);
        engine.tick(1);
        engine.put(b"k", b"v");
        let read = engine.get(b"k");
        engine.tick(2);
        assert_eq!(read.take(), Some(Ok(Some(b"v".to_vec()))));
    }

    #[test]
    fn test_empty_key_is_invalid() {
        let mut engine = engine(1, 0.0, 0);
        let future = engine.get(b"");
        assert!(matches!(
            future.take(),
            Some(Err(TickloomError::InvalidArgument(_)))
        ));
    }

    #[test]
    fn test_injected_faults_are_deterministic() {
        let outcomes = |seed| {
            let mut engine = engine(1, 0.5, seed);
            let mut results = Vec::new();
            for round in 0u64..20 {
                engine.tick(round * 2 + 1);
                let future = engine.put(b"k", b"v");
                engine.tick(round * 2 + 2);
                results.push(future.take().map(|r| r.is_ok()));
            }
            results
        };
        assert_eq!(outcomes(7), outcomes(7));
        assert_ne!(outcomes(7), outcomes(8));
    }

    #[test]
    fn test_close_fails_pending_and_rejects_new() {
        let mut engine = engine(5, 0.0, 0);
        engine.tick(1);
        let queued = engine.put(b"k", b"v");
        engine.close();
        assert_eq!(queued.take(), Some(Err(TickloomError::Closed)));

        let after = engine.get(b"k");
        engine.tick(10);
        assert_eq!(after.take(), Some(Err(TickloomError::Closed)));
    }

    #[test]
    fn test_lower_key_and_range_through_engine() {
        let mut engine = engine(1, 0.0, 0);
        engine.tick(1);
        let mut batch = WriteBatch::new();
        batch.put(b"wal:001".to_vec(), b"a".to_vec());
        batch.put(b"wal:002".to_vec(), b"b".to_vec());
        engine.put_batch(batch, WriteOptions { fsync: true });
        engine.tick(2);

        let last = engine.lower_key(b"wal:\xff");
        let range = engine.read_range(b"wal:", b"wal:\xff");
        engine.tick(3);
        assert_eq!(last.take(), Some(Ok(Some(b"wal:002".to_vec()))));
        let range = range.take().unwrap().unwrap();
        assert_eq!(range.len(), 2);
    }
}
