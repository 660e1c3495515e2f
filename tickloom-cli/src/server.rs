//! Replica server loop

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use tracing::info;

use tickloom_config::{ClusterConfig, ConfigError};
use tickloom_engine::clock::TickDriver;
use tickloom_engine::process::ProcessId;
use tickloom_engine::register::QuorumReplica;
use tickloom_engine::replica::NodeExt;
use tickloom_engine::storage::{SledBackend, StorageConfig, StorageEngine};
use tickloom_net::TcpBus;

use crate::{CliError, ServerArgs};

/// Known replica algorithms for `--factory`.
const FACTORIES: &[&str] = &["quorum-kv"];

/// Wall-clock pacing of the logical clock.
const TICK_INTERVAL: Duration = Duration::from_millis(10);

pub fn run(args: ServerArgs) -> Result<(), CliError> {
    if !FACTORIES.contains(&args.factory.as_str()) {
        return Err(CliError::Usage(format!(
            "unknown factory {:?}; known: {}",
            args.factory,
            FACTORIES.join(", ")
        )));
    }

    let config = ClusterConfig::from_file(&args.config)?;
    if !config.contains(&args.id) {
        return Err(CliError::Config(ConfigError::Invalid(format!(
            "process {} is not in the topology",
            args.id
        ))));
    }

    let mut topology = HashMap::new();
    let mut replica_ids = Vec::new();
    for entry in &config.process_configs {
        let address: SocketAddr = entry.address()?;
        let process_id = ProcessId::of(&entry.process_id);
        replica_ids.push(process_id.clone());
        topology.insert(process_id, address);
    }

    let id = ProcessId::of(&args.id);
    let bus = TcpBus::new(topology);
    bus.register_listener(id.clone())
        .map_err(|err| CliError::Runtime(err.to_string()))?;

    let backend =
        SledBackend::open(&args.data).map_err(|err| CliError::Runtime(err.to_string()))?;
    let storage = StorageEngine::new(
        Box::new(backend),
        StorageConfig {
            delay_ticks: 1,
            failure_rate: 0.0,
            seed: id.num(),
        },
    );

    // Only quorum-kv today; the factory check above keeps the flag honest.
    let mut replica = QuorumReplica::new(
        id.clone(),
        replica_ids,
        Rc::new(bus),
        storage,
        args.timeout,
    );
    replica.start();

    info!(
        replica = %id,
        timeout_ticks = args.timeout,
        factory = %args.factory,
        "replica serving"
    );

    let mut driver = TickDriver::new();
    driver.register(Rc::new(RefCell::new(replica)));
    loop {
        driver.advance(1);
        std::thread::sleep(TICK_INTERVAL);
    }
}
