//! One-shot client requests

use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::debug;
use uuid::Uuid;

use tickloom_config::{ClusterConfig, ConfigError};
use tickloom_engine::message::MessageType;
use tickloom_engine::process::ProcessId;
use tickloom_engine::register::ClusterClient;
use tickloom_net::TcpBus;

use crate::{CliError, ClientArgs};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

enum Operation {
    Set { key: String, value: String },
    Get { key: String },
}

fn parse_operation(args: &ClientArgs) -> Result<Operation, CliError> {
    match (&args.set, &args.get) {
        (Some(key), None) => {
            let value = args
                .value
                .clone()
                .ok_or_else(|| CliError::Usage("--set requires --value".to_string()))?;
            Ok(Operation::Set {
                key: key.clone(),
                value,
            })
        }
        (None, Some(key)) => Ok(Operation::Get { key: key.clone() }),
        _ => Err(CliError::Usage(
            "exactly one of --set or --get is required".to_string(),
        )),
    }
}

pub fn run(args: ClientArgs) -> Result<(), CliError> {
    let operation = parse_operation(&args)?;

    let config = ClusterConfig::from_file(&args.config)?;
    let mut topology = HashMap::new();
    for entry in &config.process_configs {
        topology.insert(ProcessId::of(&entry.process_id), entry.address()?);
    }

    let replicas: Vec<ProcessId> = args
        .replicas
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| {
            if config.contains(name) {
                Ok(ProcessId::of(name))
            } else {
                Err(CliError::Config(ConfigError::Invalid(format!(
                    "replica {name} is not in the topology"
                ))))
            }
        })
        .collect::<Result<_, _>>()?;
    let coordinator = replicas
        .first()
        .ok_or_else(|| CliError::Usage("--replicas must name at least one replica".to_string()))?
        .clone();

    let bus = TcpBus::new(topology);
    let mut client = ClusterClient::new(ProcessId::of(&args.id), Rc::new(bus));

    let correlation_id = Uuid::new_v4().to_string();
    match &operation {
        Operation::Set { key, value } => {
            let timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as i64;
            client
                .send_set_with_id(
                    &coordinator,
                    key.as_bytes(),
                    value.as_bytes(),
                    timestamp,
                    correlation_id.clone(),
                )
                .map_err(|err| CliError::Runtime(err.to_string()))?;
        }
        Operation::Get { key } => {
            client
                .send_get_with_id(&coordinator, key.as_bytes(), correlation_id.clone())
                .map_err(|err| CliError::Runtime(err.to_string()))?;
        }
    }

    let deadline = Instant::now() + Duration::from_millis(args.deadline_ms);
    loop {
        for reply in client.drain_replies(u64::MAX) {
            if reply.correlation_id != correlation_id {
                debug!(correlation_id = %reply.correlation_id, "unrelated reply dropped");
                continue;
            }
            return if reply.message_type == MessageType::CLIENT_SET_OK {
                println!("OK");
                Ok(())
            } else if reply.message_type == MessageType::CLIENT_GET_OK {
                match client
                    .decode_get_ok(&reply)
                    .map_err(|err| CliError::Runtime(err.to_string()))?
                {
                    Some(versioned) => {
                        println!("{}", String::from_utf8_lossy(&versioned.value));
                    }
                    None => println!("(nil)"),
                }
                Ok(())
            } else {
                let reason = client
                    .decode_error(&reply)
                    .unwrap_or_else(|_| "unreadable error reply".to_string());
                Err(CliError::Request(reason))
            };
        }
        if Instant::now() >= deadline {
            return Err(CliError::Request(format!(
                "no reply within {} ms",
                args.deadline_ms
            )));
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}
