//! Sender side of the three-way message protocol.
//!
//! Per message and destination:
//! 1. post the serialized header with `frame_id = 0`;
//! 2. block for the acknowledgment frame (`frame_id = 0xFFFF`) carrying a
//!    status code and the responder's node id;
//! 3. post one tagged send per data frame (`frame_id = k + 1`).
//!
//! Broadcasts run the handshake concurrently per destination and share the
//! header serialization. The receiver throttles by delaying its ACK; the
//! sender cannot reach step 3 without it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arrow::record_batch::RecordBatch;
use ffr_common::{
    FfrError, NodeId, Result, TransportErrorKind, TransportStage, global_metrics,
};
use tracing::debug;

use crate::codec::{self, DEFAULT_MAX_FRAME_BYTES};
use crate::fabric::TagFabric;
use crate::header::MessageHeader;
use crate::registry::TransportRegistry;
use crate::tag::{ACK_FRAME_ID, BEGIN_FRAME_ID, MAX_DATA_FRAMES, MessageTag};

/// Acknowledgment status: receiver allocated frame buffers and is ready.
pub const STATUS_OK: u8 = 0;
/// Acknowledgment status: receiver rejected the transmission.
pub const STATUS_REFUSED: u8 = 1;

/// Encode an acknowledgment payload (status plus responder node id).
pub fn encode_ack(status: u8, responder: NodeId) -> Vec<u8> {
    let mut out = Vec::with_capacity(3);
    out.push(status);
    out.extend_from_slice(&responder.0.to_le_bytes());
    out
}

/// Decode an acknowledgment payload.
pub fn decode_ack(payload: &[u8], dest_hint: NodeId) -> Result<(u8, NodeId)> {
    if payload.len() != 3 {
        return Err(FfrError::Transport {
            node_id: dest_hint,
            stage: TransportStage::Acknowledgment,
            kind: TransportErrorKind::Corrupt,
        });
    }
    let node = NodeId(u16::from_le_bytes([payload[1], payload[2]]));
    Ok((payload[0], node))
}

/// One logical message to be shipped to peers.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    /// Routing and bookkeeping metadata.
    pub metadata: BTreeMap<String, String>,
    /// Transported batch; `None` for metadata-only control messages.
    pub batch: Option<RecordBatch>,
}

/// Sender handle over a fabric, shared by a query's distributed kernels.
pub struct MessageSender {
    fabric: Arc<dyn TagFabric>,
    registry: Arc<TransportRegistry>,
    timeout: Duration,
    max_frame_bytes: usize,
}

impl MessageSender {
    /// Create a sender with the runtime's registry and per-message timeout.
    pub fn new(
        fabric: Arc<dyn TagFabric>,
        registry: Arc<TransportRegistry>,
        timeout: Duration,
    ) -> Self {
        Self {
            fabric,
            registry,
            timeout,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Override the frame chunk size (tests use small frames).
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes.max(1);
        self
    }

    /// Node id of the local fabric endpoint.
    pub fn self_node(&self) -> NodeId {
        self.fabric.self_node()
    }

    /// Send one message to every destination, running the per-destination
    /// handshake concurrently.
    pub fn send(&self, destinations: &[NodeId], message: &OutboundMessage) -> Result<()> {
        let message_id = self.registry.next_message_id();
        self.registry.begin_message();
        let result = self.send_inner(message_id, destinations, message);
        self.registry.end_message();
        result
    }

    fn send_inner(
        &self,
        message_id: ffr_common::MessageId,
        destinations: &[NodeId],
        message: &OutboundMessage,
    ) -> Result<()> {
        let payload = match &message.batch {
            Some(batch) => codec::encode_batch(batch)?,
            None => Vec::new(),
        };
        let frames = codec::chunk_frames(&payload, self.max_frame_bytes);
        if frames.len() > MAX_DATA_FRAMES {
            return Err(FfrError::Transport {
                node_id: self.fabric.self_node(),
                stage: TransportStage::BeginTransmission,
                kind: TransportErrorKind::Refused,
            });
        }

        let header = MessageHeader {
            metadata: message.metadata.clone(),
            columns: message
                .batch
                .as_ref()
                .map(MessageHeader::describe_columns)
                .unwrap_or_default(),
            frame_sizes: frames.iter().map(|f| f.len() as u64).collect(),
        };
        let header_bytes = header.encode();
        let base_tag = MessageTag::new(message_id, self.fabric.self_node(), BEGIN_FRAME_ID);

        debug!(
            message_id = message_id.0,
            destinations = destinations.len(),
            frames = frames.len(),
            "sending message"
        );

        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(destinations.len());
            for &dest in destinations {
                let frames = &frames;
                let header_bytes = &header_bytes;
                handles.push((
                    dest,
                    scope.spawn(move || self.send_to_one(dest, base_tag, header_bytes, frames)),
                ));
            }
            for (dest, handle) in handles {
                handle.join().map_err(|_| FfrError::Transport {
                    node_id: dest,
                    stage: TransportStage::Frame,
                    kind: TransportErrorKind::PeerGone,
                })??;
            }
            Ok(())
        })
    }

    fn send_to_one(
        &self,
        dest: NodeId,
        base_tag: MessageTag,
        header_bytes: &[u8],
        frames: &[Vec<u8>],
    ) -> Result<()> {
        self.fabric
            .post_send(dest, base_tag.pack(), header_bytes.to_vec())?;

        // All destinations acknowledge with the same tag; any OK unblocks this
        // lane, and a refusal is attributed by the node id in the payload.
        let ack_tag = base_tag.with_frame(ACK_FRAME_ID).pack();
        let (_, ack_payload) = self
            .fabric
            .recv_match(ack_tag, crate::tag::FULL_MASK, self.timeout, dest)
            .map_err(|e| match e {
                FfrError::Transport { node_id, kind, .. } => FfrError::Transport {
                    node_id,
                    stage: TransportStage::Acknowledgment,
                    kind,
                },
                other => other,
            })?;
        let (status, responder) = decode_ack(&ack_payload, dest)?;
        if status != STATUS_OK {
            return Err(FfrError::Transport {
                node_id: responder,
                stage: TransportStage::Acknowledgment,
                kind: TransportErrorKind::Refused,
            });
        }

        for (k, frame) in frames.iter().enumerate() {
            self.fabric
                .post_send(dest, base_tag.data_frame(k).pack(), frame.clone())?;
        }
        global_metrics().add_transport_frames(&dest.to_string(), frames.len() as u64, 0);
        Ok(())
    }
}
