//! Framed inter-node message transport for the FFR runtime.
//!
//! Architecture role:
//! - packs 64-bit tags demultiplexing messages and frames;
//! - encodes the begin-transmission header wire format;
//! - abstracts the tag-matched fabric (in-process and TCP);
//! - runs the three-way send/ACK/frames protocol and the receive loop;
//! - owns the transport and graph registries replacing global lookup maps.
//!
//! Key modules:
//! - [`tag`]
//! - [`header`]
//! - [`fabric`]
//! - [`codec`]
//! - [`protocol`]
//! - [`receiver`]
//! - [`registry`]

pub mod codec;
pub mod fabric;
pub mod header;
pub mod protocol;
pub mod receiver;
pub mod registry;
pub mod tag;

pub use codec::{DEFAULT_MAX_FRAME_BYTES, chunk_frames, decode_batches, encode_batch};
pub use fabric::{MemoryFabric, TagFabric, TcpFabric};
pub use header::{ColumnDescriptor, MessageHeader};
pub use protocol::{MessageSender, OutboundMessage, STATUS_OK, STATUS_REFUSED};
pub use receiver::{MessageSink, ReceivedMessage, ReceiverService, meta};
pub use registry::{GraphRegistry, TransportRegistry};
