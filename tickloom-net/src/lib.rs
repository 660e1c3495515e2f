//! TCP Message Bus
//!
//! The concrete transport collaborator: length-prefixed JSON frames over
//! `TcpStream`. Reader threads decode inbound frames into per-process
//! channels; the owning process drains its channel only inside its own tick,
//! so replica state is never touched concurrently. Outbound routes are
//! cached per destination, and a route is learned from every inbound frame
//! so replies to ephemeral clients travel back over the socket the request
//! arrived on.
//!
//! Delivery is best-effort, per the bus contract: a broken connection
//! surfaces as an `Io` error or a lost message, and the waiting list's
//! timeout is the recovery mechanism either way.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use dashmap::DashMap;
use tracing::{debug, trace, warn};

use tickloom_engine::bus::MessageBus;
use tickloom_engine::clock::Tick;
use tickloom_engine::message::Message;
use tickloom_engine::process::ProcessId;
use tickloom_engine::{Result, TickloomError};

/// Frames larger than this are treated as protocol corruption and drop the
/// connection.
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Bound on undrained inbound messages per process; readers block once it is
/// reached, pushing backpressure onto the sender's socket.
const INBOX_CAPACITY: usize = 1024;

struct Inbox {
    sender: flume::Sender<Message>,
    receiver: flume::Receiver<Message>,
}

struct Inner {
    topology: HashMap<ProcessId, SocketAddr>,
    inboxes: DashMap<ProcessId, Inbox>,
    routes: Mutex<HashMap<ProcessId, TcpStream>>,
    listening: Mutex<HashSet<ProcessId>>,
}

/// A TCP-backed [`MessageBus`]. Clones share the same sockets and inboxes.
#[derive(Clone)]
pub struct TcpBus {
    inner: Arc<Inner>,
}

impl TcpBus {
    /// Build a bus over a cluster topology. Only processes present in the
    /// topology can be listened for; anything else (an ephemeral client) is
    /// reachable solely through learned routes.
    pub fn new(topology: HashMap<ProcessId, SocketAddr>) -> Self {
        TcpBus {
            inner: Arc::new(Inner {
                topology,
                inboxes: DashMap::new(),
                routes: Mutex::new(HashMap::new()),
                listening: Mutex::new(HashSet::new()),
            }),
        }
    }

    fn listen(&self, id: &ProcessId, addr: SocketAddr) -> Result<()> {
        let mut listening = self
            .inner
            .listening
            .lock()
            .map_err(|_| TickloomError::Io("listener table poisoned".to_string()))?;
        if listening.contains(id) {
            return Ok(());
        }
        let listener = TcpListener::bind(addr)
            .map_err(|e| TickloomError::Io(format!("bind {addr}: {e}")))?;
        listening.insert(id.clone());
        debug!(process = %id, %addr, "tcp bus listening");
        let inner = self.inner.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => spawn_reader(inner.clone(), stream),
                    Err(error) => {
                        warn!(%error, "tcp bus accept failed");
                    }
                }
            }
        });
        Ok(())
    }

    /// Register and bind in one step, surfacing bind failures to the caller
    /// (the trait's `register` must be infallible, so servers use this).
    pub fn register_listener(&self, id: ProcessId) -> Result<()> {
        self.ensure_inbox(&id);
        match self.inner.topology.get(&id) {
            Some(&addr) => self.listen(&id, addr),
            None => Err(TickloomError::Io(format!(
                "process {id} has no topology entry to listen on"
            ))),
        }
    }

    fn ensure_inbox(&self, id: &ProcessId) {
        self.inner.inboxes.entry(id.clone()).or_insert_with(|| {
            let (sender, receiver) = flume::bounded(INBOX_CAPACITY);
            Inbox { sender, receiver }
        });
    }

    fn write_to_route(&self, message: &Message) -> Result<()> {
        let frame = encode_frame(message)?;
        let destination = message.destination.clone();
        let mut routes = self
            .inner
            .routes
            .lock()
            .map_err(|_| TickloomError::Io("route table poisoned".to_string()))?;

        if let Some(stream) = routes.get_mut(&destination) {
            match write_frame(stream, &frame) {
                Ok(()) => return Ok(()),
                Err(error) => {
                    trace!(peer = %destination, %error, "cached route failed, reconnecting");
                    routes.remove(&destination);
                }
            }
        }

        let addr = self.inner.topology.get(&destination).copied().ok_or_else(|| {
            TickloomError::Io(format!("no route to {destination}"))
        })?;
        let mut stream = TcpStream::connect(addr)
            .map_err(|e| TickloomError::Io(format!("connect {addr}: {e}")))?;
        let reader = stream
            .try_clone()
            .map_err(|e| TickloomError::Io(format!("clone stream: {e}")))?;
        // Replies from this peer come back over the same socket.
        spawn_reader(self.inner.clone(), reader);
        write_frame(&mut stream, &frame)?;
        routes.insert(destination, stream);
        Ok(())
    }
}

impl MessageBus for TcpBus {
    fn register(&self, id: ProcessId) {
        self.ensure_inbox(&id);
        if let Some(&addr) = self.inner.topology.get(&id) {
            if let Err(error) = self.listen(&id, addr) {
                warn!(process = %id, %error, "tcp bus listener failed");
            }
        }
    }

    fn unregister(&self, id: &ProcessId) {
        self.inner.inboxes.remove(id);
    }

    fn send(&self, message: Message) -> Result<()> {
        // Same-process loopback: the destination's inbox lives in this bus.
        if let Some(inbox) = self.inner.inboxes.get(&message.destination) {
            return inbox
                .sender
                .send(message)
                .map_err(|_| TickloomError::Io("local inbox closed".to_string()));
        }
        self.write_to_route(&message)
    }

    fn drain_ready(&self, destination: &ProcessId, _now: Tick) -> Vec<Message> {
        match self.inner.inboxes.get(destination) {
            Some(inbox) => inbox.receiver.try_iter().collect(),
            None => Vec::new(),
        }
    }
}

fn encode_frame(message: &Message) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(message).map_err(|e| TickloomError::Codec(e.to_string()))?;
    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn write_frame(stream: &mut TcpStream, frame: &[u8]) -> Result<()> {
    stream
        .write_all(frame)
        .map_err(|e| TickloomError::Io(format!("write frame: {e}")))
}

fn spawn_reader(inner: Arc<Inner>, stream: TcpStream) {
    thread::spawn(move || {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        if let Err(error) = read_loop(&inner, stream) {
            trace!(%peer, %error, "tcp bus reader finished");
        }
    });
}

fn read_loop(inner: &Inner, mut stream: TcpStream) -> std::io::Result<()> {
    loop {
        let mut len_bytes = [0u8; 4];
        stream.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes);
        if len > MAX_FRAME_BYTES {
            warn!(len, "oversized frame, dropping connection");
            return Ok(());
        }
        let mut body = vec![0u8; len as usize];
        stream.read_exact(&mut body)?;
        let message: Message = match serde_json::from_slice(&body) {
            Ok(message) => message,
            Err(error) => {
                warn!(%error, "undecodable frame, dropping connection");
                return Ok(());
            }
        };

        learn_route(inner, &message.source, &stream);

        match inner.inboxes.get(&message.destination) {
            Some(inbox) => {
                if inbox.sender.send(message).is_err() {
                    // The process unsubscribed; stop reading for it.
                    return Ok(());
                }
            }
            None => {
                trace!(
                    destination = %message.destination,
                    "frame for unsubscribed process dropped"
                );
            }
        }
    }
}

fn learn_route(inner: &Inner, source: &ProcessId, stream: &TcpStream) {
    let mut routes = match inner.routes.lock() {
        Ok(routes) => routes,
        Err(_) => return,
    };
    if routes.contains_key(source) {
        return;
    }
    if let Ok(clone) = stream.try_clone() {
        trace!(peer = %source, "route learned from inbound connection");
        routes.insert(source.clone(), clone);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tickloom_engine::message::{MessageType, PeerType};

    fn free_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    fn wait_for_message(bus: &TcpBus, id: &ProcessId) -> Message {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let mut drained = bus.drain_ready(id, 0);
            if let Some(message) = drained.pop() {
                return message;
            }
            assert!(Instant::now() < deadline, "no message for {id}");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_request_and_learned_route_reply() {
        let server_id = ProcessId::of("tcp-server");
        let client_id = ProcessId::of("tcp-client");
        let mut topology = HashMap::new();
        topology.insert(server_id.clone(), free_addr());

        let server_bus = TcpBus::new(topology.clone());
        server_bus.register_listener(server_id.clone()).unwrap();

        // The client is not in the topology; replies must use the learned
        // route over the client's own connection.
        let client_bus = TcpBus::new(topology);
        client_bus.register(client_id.clone());

        client_bus
            .send(Message::new(
                client_id.clone(),
                server_id.clone(),
                PeerType::Client,
                MessageType::HELLO,
                Vec::new(),
                "probe-1".to_string(),
            ))
            .unwrap();

        let request = wait_for_message(&server_bus, &server_id);
        assert_eq!(request.message_type, MessageType::HELLO);
        assert_eq!(request.source, client_id);

        server_bus
            .send(Message::new(
                server_id.clone(),
                client_id.clone(),
                PeerType::Client,
                MessageType::WELCOME,
                Vec::new(),
                request.correlation_id,
            ))
            .unwrap();

        let reply = wait_for_message(&client_bus, &client_id);
        assert_eq!(reply.message_type, MessageType::WELCOME);
        assert_eq!(reply.correlation_id, "probe-1");
    }

    #[test]
    fn test_send_without_route_is_an_io_error() {
        let bus = TcpBus::new(HashMap::new());
        let result = bus.send(Message::new(
            ProcessId::of("tcp-nobody"),
            ProcessId::of("tcp-ghost"),
            PeerType::Server,
            MessageType::HELLO,
            Vec::new(),
            "c1".to_string(),
        ));
        assert!(matches!(result, Err(TickloomError::Io(_))));
    }

    #[test]
    fn test_loopback_delivery_within_one_bus() {
        let bus = TcpBus::new(HashMap::new());
        let a = ProcessId::of("tcp-loop-a");
        let b = ProcessId::of("tcp-loop-b");
        bus.register(a.clone());
        bus.register(b.clone());
        bus.send(Message::new(
            a,
            b.clone(),
            PeerType::Server,
            MessageType::HELLO,
            Vec::new(),
            "c1".to_string(),
        ))
        .unwrap();
        assert_eq!(bus.drain_ready(&b, 0).len(), 1);
    }
}
