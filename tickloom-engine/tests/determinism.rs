//! Determinism: identical seeds and inputs produce identical transcripts

use tickloom_engine::message::MessageType;
use tickloom_engine::sim::SimCluster;
use tickloom_engine::storage::StorageConfig;
use tickloom_engine::Tick;

type Transcript = Vec<(Tick, String, Vec<u8>)>;

/// Drive a fixed workload against a faulty three-node cluster and record
/// every client-visible reply with the tick it was observed in.
fn run_workload(seed: u64) -> Transcript {
    let mut cluster = SimCluster::builder(3)
        .name_prefix("det")
        .request_timeout_ticks(15)
        .storage(StorageConfig {
            delay_ticks: 1,
            failure_rate: 0.0,
            seed,
        })
        .build();
    // Let every replica through its startup sync, then turn faults on.
    cluster.advance(1);
    for index in 0..3 {
        cluster.set_failure_rate(index, 0.2);
    }

    let mut client = cluster.client("det-client");
    let mut transcript = Transcript::new();
    let coordinator = cluster.replica_id(0);

    for round in 0..5i64 {
        client
            .send_set(
                &coordinator,
                b"k",
                format!("v{round}").as_bytes(),
                round + 1,
            )
            .unwrap();
        for _ in 0..25 {
            cluster.advance(1);
            for reply in client.drain_replies(cluster.now()) {
                transcript.push((
                    cluster.now(),
                    reply.message_type.name().to_string(),
                    reply.payload,
                ));
            }
        }
        client.send_get(&coordinator, b"k").unwrap();
        for _ in 0..25 {
            cluster.advance(1);
            for reply in client.drain_replies(cluster.now()) {
                transcript.push((
                    cluster.now(),
                    reply.message_type.name().to_string(),
                    reply.payload,
                ));
            }
        }
    }
    transcript
}

#[test]
fn test_identical_seeds_produce_identical_transcripts() {
    let first = run_workload(41);
    let second = run_workload(41);
    assert!(!first.is_empty());
    assert_eq!(first, second);
}

#[test]
fn test_every_request_is_eventually_answered() {
    // With injected faults some operations fail, but every request must
    // resolve one way or the other: ten requests, ten replies.
    let transcript = run_workload(17);
    assert_eq!(transcript.len(), 10);
    for (_, kind, _) in &transcript {
        assert!(
            [
                MessageType::CLIENT_SET_OK.name(),
                MessageType::CLIENT_SET_ERR.name(),
                MessageType::CLIENT_GET_OK.name(),
                MessageType::CLIENT_GET_ERR.name(),
            ]
            .contains(&kind.as_str()),
            "unexpected reply kind {kind}"
        );
    }
}
