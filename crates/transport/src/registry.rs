//! Runtime-owned registries replacing process-wide lookup maps.
//!
//! Per-message and per-query state is reached through handles passed to the
//! protocol explicitly; nothing here is a global singleton.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ffr_common::{ContextToken, MessageId, Result};

use crate::receiver::MessageSink;

/// Allocates message ids and tracks in-flight message count for one runtime.
#[derive(Debug, Default)]
pub struct TransportRegistry {
    next_message_id: AtomicU32,
    in_flight: AtomicUsize,
}

impl TransportRegistry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocate the next per-process message id.
    pub fn next_message_id(&self) -> MessageId {
        MessageId(self.next_message_id.fetch_add(1, Ordering::AcqRel))
    }

    /// Number of messages currently mid-protocol.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn begin_message(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn end_message(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Maps query context tokens to the sink receiving that query's messages.
#[derive(Default)]
pub struct GraphRegistry {
    sinks: Mutex<HashMap<ContextToken, Arc<dyn MessageSink>>>,
}

impl GraphRegistry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register the sink for one query; replaces any previous registration.
    pub fn register(&self, token: ContextToken, sink: Arc<dyn MessageSink>) {
        self.sinks
            .lock()
            .expect("graph registry poisoned")
            .insert(token, sink);
    }

    /// Remove the sink for one query.
    pub fn deregister(&self, token: ContextToken) {
        self.sinks
            .lock()
            .expect("graph registry poisoned")
            .remove(&token);
    }

    /// Look up the sink for one query.
    pub fn sink_for(&self, token: ContextToken) -> Option<Arc<dyn MessageSink>> {
        self.sinks
            .lock()
            .expect("graph registry poisoned")
            .get(&token)
            .cloned()
    }

    /// Deliver-or-drop helper used by the receiver loop.
    pub fn deliver(&self, token: ContextToken, msg: crate::receiver::ReceivedMessage) -> Result<bool> {
        match self.sink_for(token) {
            Some(sink) => {
                sink.deliver(msg)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
