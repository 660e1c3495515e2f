//! Property tests for the runtime's core invariants

use proptest::collection::vec;
use proptest::prelude::*;

use tickloom_engine::clock::Tickable;
use tickloom_engine::register::VersionedValue;
use tickloom_engine::storage::{StorageConfig, StorageEngine};
use tickloom_engine::{Codec, JsonCodec};

fn versioned_value() -> impl Strategy<Value = VersionedValue> {
    (vec(any::<u8>(), 0..16), any::<i64>())
        .prop_map(|(value, timestamp)| VersionedValue::new(value, timestamp))
}

/// The winner of a set of candidates under last-writer-wins.
fn winner(candidates: &[VersionedValue]) -> Option<VersionedValue> {
    let mut best: Option<&VersionedValue> = None;
    for candidate in candidates {
        best = match best {
            None => Some(candidate),
            Some(held) if candidate.supersedes(held) => Some(candidate),
            Some(held) => Some(held),
        };
    }
    best.cloned()
}

proptest! {
    #[test]
    fn prop_supersedes_is_total_on_distinct_values(
        a in versioned_value(),
        b in versioned_value(),
    ) {
        if a == b {
            prop_assert!(!a.supersedes(&b));
            prop_assert!(!b.supersedes(&a));
        } else {
            // Exactly one direction wins; both replicas reach the same verdict.
            prop_assert_ne!(a.supersedes(&b), b.supersedes(&a));
        }
    }

    #[test]
    fn prop_winner_is_order_insensitive(
        mut candidates in vec(versioned_value(), 1..8),
    ) {
        let forward = winner(&candidates);
        candidates.reverse();
        let backward = winner(&candidates);
        prop_assert_eq!(forward, backward);
    }

    #[test]
    fn prop_versioned_value_codec_round_trip(value in versioned_value()) {
        let bytes = JsonCodec.encode(&value).unwrap();
        let back: VersionedValue = JsonCodec.decode(&bytes).unwrap();
        prop_assert_eq!(back, value);
    }

    #[test]
    fn prop_storage_completion_never_precedes_delay(
        delay in 1u64..6,
        submit_tick in 1u64..20,
    ) {
        let mut engine = StorageEngine::in_memory(StorageConfig {
            delay_ticks: delay,
            failure_rate: 0.0,
            seed: 0,
        });
        engine.tick(submit_tick);
        let future = engine.put(b"key", b"value");
        for now in submit_tick..submit_tick + delay {
            engine.tick(now);
            prop_assert!(future.is_pending(), "completed early at tick {}", now);
        }
        engine.tick(submit_tick + delay);
        prop_assert_eq!(future.take(), Some(Ok(true)));
    }

    #[test]
    fn prop_fault_schedule_replays_with_the_seed(
        seed in any::<u64>(),
        rate in 0.0f64..1.0,
        ops in 1usize..30,
    ) {
        let run = |seed: u64| -> Vec<bool> {
            let mut engine = StorageEngine::in_memory(StorageConfig {
                delay_ticks: 1,
                failure_rate: rate,
                seed,
            });
            let mut outcomes = Vec::new();
            for i in 0..ops {
                let now = (i as u64) * 2 + 1;
                engine.tick(now);
                let future = engine.put(b"key", b"value");
                engine.tick(now + 1);
                outcomes.push(matches!(future.take(), Some(Ok(true))));
            }
            outcomes
        };
        prop_assert_eq!(run(seed), run(seed));
    }
}
