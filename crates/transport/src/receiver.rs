//! Receiver side of the message protocol.
//!
//! The service loop matches begin-transmission headers, acknowledges them,
//! collects data frames in `frame_id` order, reassembles the payload, and
//! routes the message to the owning query's sink through the graph registry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arrow::record_batch::RecordBatch;
use ffr_common::{
    ContextToken, FfrError, NodeId, Result, TransportErrorKind, TransportStage, global_metrics,
};
use tracing::{debug, warn};

use crate::codec;
use crate::fabric::TagFabric;
use crate::header::MessageHeader;
use crate::protocol::{STATUS_OK, encode_ack};
use crate::registry::GraphRegistry;
use crate::tag::{ACK_FRAME_ID, BEGIN_FRAME_ID, FRAME_ONLY_MASK, FULL_MASK, MessageTag};

/// Well-known metadata keys used to route and interpret messages.
pub mod meta {
    /// Query context token (decimal) owning the message.
    pub const CONTEXT_TOKEN: &str = "context_token";
    /// Route key inside the destination graph (e.g. `partition_7`).
    pub const ROUTE: &str = "route";
    /// Sending node id (decimal).
    pub const SENDER_NODE: &str = "sender_node";
    /// Marks the sender's final message on a route.
    pub const LAST: &str = "last";
    /// Row count carried by control messages.
    pub const NUM_ROWS: &str = "num_rows";
    /// Average bytes per row carried by sample messages.
    pub const AVG_BYTES_PER_ROW: &str = "avg_bytes_per_row";
    /// Global partition index of a shipped sub-batch.
    pub const PARTITION: &str = "partition";
}

/// One fully reassembled inbound message.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Node that sent the message.
    pub from: NodeId,
    /// Message metadata from the header.
    pub metadata: BTreeMap<String, String>,
    /// Decoded payload batches; empty for control messages.
    pub batches: Vec<RecordBatch>,
}

impl ReceivedMessage {
    /// Route key of this message, empty when absent.
    pub fn route(&self) -> &str {
        self.metadata.get(meta::ROUTE).map(String::as_str).unwrap_or("")
    }
}

/// Destination for reassembled messages of one query.
pub trait MessageSink: Send + Sync {
    /// Accept one message; blocking is allowed and applies backpressure
    /// (the service delays later ACKs while blocked here).
    fn deliver(&self, msg: ReceivedMessage) -> Result<()>;
}

/// Background receive loop over one fabric endpoint.
pub struct ReceiverService {
    fabric: Arc<dyn TagFabric>,
    graphs: Arc<GraphRegistry>,
    frame_timeout: Duration,
    stop: Arc<AtomicBool>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// How long the loop waits for a routable sink before dropping a message.
const SINK_WAIT: Duration = Duration::from_secs(5);
/// Poll slice while waiting for headers, so `stop` stays responsive.
const HEADER_POLL: Duration = Duration::from_millis(100);

impl ReceiverService {
    /// Create and start the service thread.
    pub fn start(
        fabric: Arc<dyn TagFabric>,
        graphs: Arc<GraphRegistry>,
        frame_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let service = Arc::new(Self {
            fabric,
            graphs,
            frame_timeout,
            stop: Arc::new(AtomicBool::new(false)),
            handle: std::sync::Mutex::new(None),
        });

        let runner = Arc::clone(&service);
        let handle = std::thread::Builder::new()
            .name(format!("ffr-recv-{}", service.fabric.self_node()))
            .spawn(move || runner.run_loop())?;
        *service.handle.lock().expect("receiver handle poisoned") = Some(handle);
        Ok(service)
    }

    /// Stop the loop and join the thread.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().expect("receiver handle poisoned").take() {
            let _ = handle.join();
        }
    }

    fn run_loop(&self) {
        let header_probe = MessageTag::new(ffr_common::MessageId(0), NodeId(0), BEGIN_FRAME_ID);
        while !self.stop.load(Ordering::Acquire) {
            let matched = self.fabric.recv_match(
                header_probe.pack(),
                FRAME_ONLY_MASK,
                HEADER_POLL,
                self.fabric.self_node(),
            );
            let (raw_tag, header_bytes) = match matched {
                Ok(delivery) => delivery,
                // Idle poll expiry; anything else on the header path is
                // logged and the loop keeps serving other messages.
                Err(FfrError::Transport {
                    kind: TransportErrorKind::Timeout,
                    ..
                }) => continue,
                Err(e) => {
                    warn!(error = %e, "receiver header wait failed");
                    continue;
                }
            };

            if let Err(e) = self.receive_one(MessageTag::unpack(raw_tag), &header_bytes) {
                if !e.is_benign() {
                    warn!(error = %e, "inbound message failed");
                }
            }
        }
    }

    fn receive_one(&self, tag: MessageTag, header_bytes: &[u8]) -> Result<()> {
        let origin = tag.origin;
        let header = MessageHeader::decode(header_bytes, origin)?;

        // Frame buffers are sized from the advertised layout before the ACK
        // releases the sender into step 3.
        let mut frames: Vec<Vec<u8>> = Vec::with_capacity(header.frame_sizes.len());

        self.fabric.post_send(
            origin,
            tag.with_frame(ACK_FRAME_ID).pack(),
            encode_ack(STATUS_OK, self.fabric.self_node()),
        )?;

        for (k, &advertised) in header.frame_sizes.iter().enumerate() {
            let (_, frame) = self.fabric.recv_match(
                tag.data_frame(k).pack(),
                FULL_MASK,
                self.frame_timeout,
                origin,
            )?;
            if frame.len() as u64 != advertised {
                return Err(FfrError::Transport {
                    node_id: origin,
                    stage: TransportStage::Frame,
                    kind: TransportErrorKind::Corrupt,
                });
            }
            frames.push(frame);
        }
        global_metrics().add_transport_frames(&origin.to_string(), 0, frames.len() as u64);

        let batches = if frames.is_empty() {
            Vec::new()
        } else {
            codec::decode_batches(&frames.concat(), origin)?
        };

        let token = header
            .metadata
            .get(meta::CONTEXT_TOKEN)
            .and_then(|raw| raw.parse::<u32>().ok())
            .map(ContextToken)
            .ok_or(FfrError::Transport {
                node_id: origin,
                stage: TransportStage::Frame,
                kind: TransportErrorKind::Corrupt,
            })?;

        let msg = ReceivedMessage {
            from: origin,
            metadata: header.metadata,
            batches,
        };

        // The graph may still be under construction when its first inbound
        // message lands; wait briefly for registration.
        let deadline = Instant::now() + SINK_WAIT;
        loop {
            if self.graphs.deliver(token, msg.clone())? {
                debug!(token = token.0, route = msg.route(), "message delivered");
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(token = token.0, "dropping message for unregistered query");
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
