//! Tag-matched send/receive fabric underneath the message protocol.
//!
//! The fabric is the zero-copy primitive the protocol is layered on: sends
//! are addressed `(destination, tag, payload)`, receives match a
//! `(tag, mask)` pair against queued deliveries. Two implementations:
//! an in-process loopback hub for tests and single-host clusters, and a
//! length-prefixed TCP fabric with one demux thread per inbound connection.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use ffr_common::{FfrError, NodeId, Result, TransportErrorKind, TransportStage};
use tracing::{debug, warn};

/// Blocking waits are sliced so cancellation and timeouts stay responsive.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Tag-matched messaging primitive between cluster nodes.
pub trait TagFabric: Send + Sync {
    /// This node's id.
    fn self_node(&self) -> NodeId;

    /// Number of nodes reachable through this fabric, self included.
    fn num_nodes(&self) -> usize;

    /// Post one tagged payload to a destination node.
    fn post_send(&self, dest: NodeId, tag: u64, payload: Vec<u8>) -> Result<()>;

    /// Block until a delivery matching `tag` under `mask` arrives.
    ///
    /// Matching compares `delivered_tag & mask == tag & mask`; deliveries are
    /// consumed in arrival order among matches. Returns the full tag and the
    /// payload, or a timeout error attributed to `dest_hint`.
    fn recv_match(
        &self,
        tag: u64,
        mask: u64,
        timeout: Duration,
        dest_hint: NodeId,
    ) -> Result<(u64, Vec<u8>)>;
}

/// One node's tag-matched mailbox: deliveries awaiting a matching receive.
#[derive(Default)]
struct Mailbox {
    deliveries: Vec<(u64, Vec<u8>)>,
}

struct MailboxSlot {
    mailbox: Mutex<Mailbox>,
    arrived: Condvar,
}

impl MailboxSlot {
    fn new() -> Self {
        Self {
            mailbox: Mutex::new(Mailbox::default()),
            arrived: Condvar::new(),
        }
    }

    fn push(&self, tag: u64, payload: Vec<u8>) {
        let mut mailbox = self.mailbox.lock().expect("mailbox poisoned");
        mailbox.deliveries.push((tag, payload));
        self.arrived.notify_all();
    }

    fn take_match(
        &self,
        tag: u64,
        mask: u64,
        timeout: Duration,
        dest_hint: NodeId,
    ) -> Result<(u64, Vec<u8>)> {
        let deadline = Instant::now() + timeout;
        let mut mailbox = self.mailbox.lock().expect("mailbox poisoned");
        loop {
            if let Some(at) = mailbox
                .deliveries
                .iter()
                .position(|(t, _)| t & mask == tag & mask)
            {
                return Ok(mailbox.deliveries.remove(at));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(FfrError::Transport {
                    node_id: dest_hint,
                    stage: TransportStage::Frame,
                    kind: TransportErrorKind::Timeout,
                });
            }
            let wait = WAIT_SLICE.min(deadline - now);
            let (guard, _) = self
                .arrived
                .wait_timeout(mailbox, wait)
                .expect("mailbox poisoned");
            mailbox = guard;
        }
    }
}

/// In-process fabric: every node shares one hub of per-node mailboxes.
pub struct MemoryFabric {
    self_node: NodeId,
    hub: Arc<Vec<MailboxSlot>>,
}

impl MemoryFabric {
    /// Create a connected cluster of `num_nodes` in-process fabrics.
    pub fn cluster(num_nodes: usize) -> Vec<Arc<MemoryFabric>> {
        let hub = Arc::new((0..num_nodes).map(|_| MailboxSlot::new()).collect::<Vec<_>>());
        (0..num_nodes)
            .map(|i| {
                Arc::new(MemoryFabric {
                    self_node: NodeId(i as u16),
                    hub: Arc::clone(&hub),
                })
            })
            .collect()
    }
}

impl TagFabric for MemoryFabric {
    fn self_node(&self) -> NodeId {
        self.self_node
    }

    fn num_nodes(&self) -> usize {
        self.hub.len()
    }

    fn post_send(&self, dest: NodeId, tag: u64, payload: Vec<u8>) -> Result<()> {
        let slot = self.hub.get(dest.0 as usize).ok_or(FfrError::Transport {
            node_id: dest,
            stage: TransportStage::BeginTransmission,
            kind: TransportErrorKind::PeerGone,
        })?;
        slot.push(tag, payload);
        Ok(())
    }

    fn recv_match(
        &self,
        tag: u64,
        mask: u64,
        timeout: Duration,
        dest_hint: NodeId,
    ) -> Result<(u64, Vec<u8>)> {
        self.hub[self.self_node.0 as usize].take_match(tag, mask, timeout, dest_hint)
    }
}

/// TCP fabric: one outbound stream per peer, one demux thread per inbound
/// connection, frames as `tag u64 | len u64 | payload` little-endian.
pub struct TcpFabric {
    self_node: NodeId,
    peers: HashMap<NodeId, String>,
    outbound: Mutex<HashMap<NodeId, TcpStream>>,
    inbox: Arc<MailboxSlot>,
    shutdown: Arc<AtomicBool>,
}

impl TcpFabric {
    /// Bind the listener and start accepting peer connections.
    ///
    /// `peers` maps every cluster node (self included) to its listen address.
    pub fn bind(self_node: NodeId, peers: HashMap<NodeId, String>) -> Result<Arc<Self>> {
        let listen_addr = peers.get(&self_node).ok_or(FfrError::Transport {
            node_id: self_node,
            stage: TransportStage::BeginTransmission,
            kind: TransportErrorKind::Refused,
        })?;
        let listener = TcpListener::bind(listen_addr)?;

        let fabric = Arc::new(Self {
            self_node,
            peers,
            outbound: Mutex::new(HashMap::new()),
            inbox: Arc::new(MailboxSlot::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        });

        let inbox = Arc::clone(&fabric.inbox);
        let shutdown = Arc::clone(&fabric.shutdown);
        std::thread::Builder::new()
            .name(format!("ffr-fabric-accept-{self_node}"))
            .spawn(move || accept_loop(listener, inbox, shutdown))?;

        Ok(fabric)
    }

    /// Stop the accept loop; established demux threads exit on stream close.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        // Wake the accept loop with a throwaway connection to self.
        if let Some(addr) = self.peers.get(&self.self_node) {
            let _ = TcpStream::connect(addr);
        }
    }
}

fn accept_loop(listener: TcpListener, inbox: Arc<MailboxSlot>, shutdown: Arc<AtomicBool>) {
    for stream in listener.incoming() {
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        let Ok(stream) = stream else {
            continue;
        };
        let inbox = Arc::clone(&inbox);
        let shutdown = Arc::clone(&shutdown);
        let spawned = std::thread::Builder::new()
            .name("ffr-fabric-demux".to_string())
            .spawn(move || demux_loop(stream, inbox, shutdown));
        if spawned.is_err() {
            warn!("failed to spawn fabric demux thread");
        }
    }
}

fn demux_loop(mut stream: TcpStream, inbox: Arc<MailboxSlot>, shutdown: Arc<AtomicBool>) {
    let mut head = [0u8; 16];
    loop {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        if stream.read_exact(&mut head).is_err() {
            debug!("fabric peer stream closed");
            return;
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&head[0..8]);
        let tag = u64::from_le_bytes(word);
        word.copy_from_slice(&head[8..16]);
        let len = u64::from_le_bytes(word) as usize;
        let mut payload = vec![0u8; len];
        if stream.read_exact(&mut payload).is_err() {
            debug!("fabric peer stream closed mid-frame");
            return;
        }
        inbox.push(tag, payload);
    }
}

impl TagFabric for TcpFabric {
    fn self_node(&self) -> NodeId {
        self.self_node
    }

    fn num_nodes(&self) -> usize {
        self.peers.len()
    }

    fn post_send(&self, dest: NodeId, tag: u64, payload: Vec<u8>) -> Result<()> {
        if dest == self.self_node {
            self.inbox.push(tag, payload);
            return Ok(());
        }

        let mut outbound = self.outbound.lock().expect("outbound poisoned");
        if !outbound.contains_key(&dest) {
            let addr = self.peers.get(&dest).ok_or(FfrError::Transport {
                node_id: dest,
                stage: TransportStage::BeginTransmission,
                kind: TransportErrorKind::PeerGone,
            })?;
            let stream = TcpStream::connect(addr).map_err(|_| FfrError::Transport {
                node_id: dest,
                stage: TransportStage::BeginTransmission,
                kind: TransportErrorKind::Refused,
            })?;
            outbound.insert(dest, stream);
        }

        let stream = outbound.get_mut(&dest).expect("just inserted");
        let mut head = [0u8; 16];
        head[0..8].copy_from_slice(&tag.to_le_bytes());
        head[8..16].copy_from_slice(&(payload.len() as u64).to_le_bytes());
        let write = stream
            .write_all(&head)
            .and_then(|_| stream.write_all(&payload));
        if write.is_err() {
            outbound.remove(&dest);
            return Err(FfrError::Transport {
                node_id: dest,
                stage: TransportStage::Frame,
                kind: TransportErrorKind::PeerGone,
            });
        }
        Ok(())
    }

    fn recv_match(
        &self,
        tag: u64,
        mask: u64,
        timeout: Duration,
        dest_hint: NodeId,
    ) -> Result<(u64, Vec<u8>)> {
        self.inbox.take_match(tag, mask, timeout, dest_hint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_fabric_matches_on_masked_tag() {
        let nodes = MemoryFabric::cluster(2);
        nodes[0].post_send(NodeId(1), 0xAA_0001, b"one".to_vec()).expect("send");
        nodes[0].post_send(NodeId(1), 0xBB_0002, b"two".to_vec()).expect("send");

        // Match only on the low 16 bits: the second delivery wins.
        let (tag, payload) = nodes[1]
            .recv_match(0x0002, 0xFFFF, Duration::from_secs(1), NodeId(0))
            .expect("recv");
        assert_eq!(tag, 0xBB_0002);
        assert_eq!(payload, b"two");

        let (tag, _) = nodes[1]
            .recv_match(0xAA_0001, u64::MAX, Duration::from_secs(1), NodeId(0))
            .expect("recv");
        assert_eq!(tag, 0xAA_0001);
    }

    #[test]
    fn recv_match_times_out_with_peer_attribution() {
        let nodes = MemoryFabric::cluster(1);
        let err = nodes[0]
            .recv_match(7, u64::MAX, Duration::from_millis(120), NodeId(9))
            .unwrap_err();
        match err {
            FfrError::Transport { node_id, kind, .. } => {
                assert_eq!(node_id, NodeId(9));
                assert_eq!(kind, TransportErrorKind::Timeout);
            }
            other => panic!("expected transport timeout, got {other}"),
        }
    }

    #[test]
    fn tcp_fabric_delivers_between_two_nodes() {
        let mut peers = HashMap::new();
        peers.insert(NodeId(0), "127.0.0.1:39771".to_string());
        peers.insert(NodeId(1), "127.0.0.1:39772".to_string());

        let a = TcpFabric::bind(NodeId(0), peers.clone()).expect("bind a");
        let b = TcpFabric::bind(NodeId(1), peers).expect("bind b");

        a.post_send(NodeId(1), 42, b"hello".to_vec()).expect("send");
        let (tag, payload) = b
            .recv_match(42, u64::MAX, Duration::from_secs(5), NodeId(0))
            .expect("recv");
        assert_eq!(tag, 42);
        assert_eq!(payload, b"hello");

        a.shutdown();
        b.shutdown();
    }
}
