//! Distributed exchange handle: routes inbound messages to kernels and
//! wraps the sender protocol for outbound traffic.
//!
//! Inbound messages land in the graph's message router (the query's
//! [`MessageSink`]), keyed by their `route` metadata; distributed kernels
//! block on their route. Outbound traffic goes through [`Exchange::send`]
//! and friends, stamping the context token, sender node, and substep.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use arrow::record_batch::RecordBatch;
use ffr_common::{FfrError, NodeId, Result, TransportErrorKind, TransportStage};
use ffr_transport::{
    MessageSender, MessageSink, OutboundMessage, ReceivedMessage, TagFabric, TransportRegistry,
    meta,
};
use tracing::debug;

use crate::context::QueryContext;

const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Per-query inbound mailbox, keyed by route.
pub struct MessageRouter {
    ctx: QueryContext,
    routes: Mutex<HashMap<String, VecDeque<ReceivedMessage>>>,
    arrived: Condvar,
}

impl MessageRouter {
    /// Create the router for one query.
    pub fn new(ctx: QueryContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            routes: Mutex::new(HashMap::new()),
            arrived: Condvar::new(),
        })
    }

    /// Block until a message arrives on `route`.
    pub fn recv(&self, route: &str, timeout: Duration) -> Result<ReceivedMessage> {
        let deadline = Instant::now() + timeout;
        let mut routes = self.routes.lock().expect("router poisoned");
        loop {
            if let Some(queue) = routes.get_mut(route) {
                if let Some(msg) = queue.pop_front() {
                    return Ok(msg);
                }
            }
            if self.ctx.is_cancelled() {
                return Err(FfrError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(FfrError::Transport {
                    node_id: self.ctx.self_node(),
                    stage: TransportStage::Frame,
                    kind: TransportErrorKind::Timeout,
                });
            }
            let wait = WAIT_SLICE.min(deadline - now);
            let (guard, _) = self
                .arrived
                .wait_timeout(routes, wait)
                .expect("router poisoned");
            routes = guard;
        }
    }
}

impl MessageSink for MessageRouter {
    fn deliver(&self, msg: ReceivedMessage) -> Result<()> {
        let mut routes = self.routes.lock().expect("router poisoned");
        routes
            .entry(msg.route().to_string())
            .or_default()
            .push_back(msg);
        self.arrived.notify_all();
        Ok(())
    }
}

/// Distributed exchange handle shared by one query's kernels.
pub struct Exchange {
    ctx: QueryContext,
    sender: MessageSender,
    router: Arc<MessageRouter>,
}

impl Exchange {
    /// Create the exchange for one query over a fabric endpoint.
    ///
    /// The caller registers the returned router under the query token in the
    /// node's graph registry so the receiver service can deliver to it.
    pub fn new(
        ctx: QueryContext,
        fabric: Arc<dyn TagFabric>,
        transports: Arc<TransportRegistry>,
    ) -> (Arc<Self>, Arc<MessageRouter>) {
        let timeout = Duration::from_millis(ctx.config().transport_message_timeout_ms);
        let router = MessageRouter::new(ctx.clone());
        let exchange = Arc::new(Self {
            ctx,
            sender: MessageSender::new(fabric, transports, timeout),
            router: Arc::clone(&router),
        });
        (exchange, router)
    }

    /// The query context this exchange serves.
    pub fn ctx(&self) -> &QueryContext {
        &self.ctx
    }

    /// Send one batch (or a control message) to a route on selected peers.
    pub fn send(
        &self,
        destinations: &[NodeId],
        route: &str,
        batch: Option<RecordBatch>,
        extra: &[(&str, String)],
    ) -> Result<()> {
        self.ctx.increment_substep();
        let mut metadata = BTreeMap::new();
        metadata.insert(
            meta::CONTEXT_TOKEN.to_string(),
            self.ctx.token().0.to_string(),
        );
        metadata.insert(meta::ROUTE.to_string(), route.to_string());
        metadata.insert(
            meta::SENDER_NODE.to_string(),
            self.ctx.self_node().0.to_string(),
        );
        for (key, value) in extra {
            metadata.insert((*key).to_string(), value.clone());
        }
        debug!(
            query_id = self.ctx.token().0,
            step = self.ctx.step(),
            substep = self.ctx.substep(),
            route,
            destinations = destinations.len(),
            "exchange send"
        );
        self.sender.send(destinations, &OutboundMessage { metadata, batch })
    }

    /// Send to every peer node.
    pub fn broadcast(
        &self,
        route: &str,
        batch: Option<RecordBatch>,
        extra: &[(&str, String)],
    ) -> Result<()> {
        let peers = self.ctx.peer_ids();
        if peers.is_empty() {
            return Ok(());
        }
        self.send(&peers, route, batch, extra)
    }

    /// Block for the next message on a route.
    pub fn recv(&self, route: &str) -> Result<ReceivedMessage> {
        let timeout = Duration::from_millis(self.ctx.config().transport_message_timeout_ms);
        self.router.recv(route, timeout)
    }

    /// Collect exactly one message per peer on a route.
    pub fn recv_from_all_peers(&self, route: &str) -> Result<Vec<ReceivedMessage>> {
        let mut out = Vec::with_capacity(self.ctx.num_nodes().saturating_sub(1));
        for _ in self.ctx.peer_ids() {
            out.push(self.recv(route)?);
        }
        Ok(out)
    }

    /// All-gather a per-node row count; returns counts indexed by node id.
    ///
    /// Used by the distributed limit: a node's prefix is the sum of counts
    /// of nodes with a lower index.
    pub fn gather_num_rows(&self, route: &str, local_rows: u64) -> Result<Vec<u64>> {
        let mut counts = vec![0u64; self.ctx.num_nodes()];
        counts[self.ctx.self_node_index()] = local_rows;

        self.broadcast(route, None, &[(meta::NUM_ROWS, local_rows.to_string())])?;
        for msg in self.recv_from_all_peers(route)? {
            let rows = msg
                .metadata
                .get(meta::NUM_ROWS)
                .and_then(|raw| raw.parse::<u64>().ok())
                .ok_or(FfrError::Transport {
                    node_id: msg.from,
                    stage: TransportStage::Frame,
                    kind: TransportErrorKind::Corrupt,
                })?;
            counts[msg.from.0 as usize] = rows;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use ffr_common::ContextToken;

    use super::*;
    use crate::context::NodeInfo;

    fn two_node_ctx(self_node: u16) -> QueryContext {
        QueryContext::new(
            ContextToken(4),
            NodeId(self_node),
            vec![
                NodeInfo {
                    id: NodeId(0),
                    address: "mem".into(),
                },
                NodeInfo {
                    id: NodeId(1),
                    address: "mem".into(),
                },
            ],
            HashMap::new(),
        )
    }

    #[test]
    fn router_delivers_by_route_and_times_out() {
        let router = MessageRouter::new(two_node_ctx(0));
        router
            .deliver(ReceivedMessage {
                from: NodeId(1),
                metadata: BTreeMap::from([(meta::ROUTE.to_string(), "a".to_string())]),
                batches: Vec::new(),
            })
            .expect("deliver");

        let got = router.recv("a", Duration::from_millis(200)).expect("recv");
        assert_eq!(got.from, NodeId(1));
        assert!(router.recv("a", Duration::from_millis(120)).is_err());
    }

    #[test]
    fn router_unblocks_on_cancellation() {
        let ctx = two_node_ctx(0);
        let router = MessageRouter::new(ctx.clone());
        ctx.cancel();
        assert!(matches!(
            router.recv("never", Duration::from_secs(5)),
            Err(FfrError::Cancelled)
        ));
    }
}
