//! Hash redistribution of batches across cluster nodes.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use ffr_common::{NodeId, Result};
use ffr_transport::meta;

use crate::exchange::Exchange;
use crate::kernel::{KernelCore, PORT_DEFAULT};
use crate::rows::{ScalarVal, gather_indices, select_columns, take_batch};

/// Repartition rows by key hash so equal keys land on one node.
///
/// Each node runs the same kernel id; local rows pass through directly,
/// remote rows ship over the transport, and the run ends after every peer's
/// end-of-stream marker arrives. An empty key set routes every row to node
/// 0, which is how single-partition operators (e.g. `OVER (ORDER BY …)`
/// without `PARTITION BY`) get whole-input locality.
pub struct DistributeByHashKernel {
    key_columns: Vec<usize>,
    exchange: Arc<Exchange>,
}

impl DistributeByHashKernel {
    /// Create a hash distribution on the given key columns.
    pub fn new(key_columns: Vec<usize>, exchange: Arc<Exchange>) -> Self {
        Self {
            key_columns,
            exchange,
        }
    }

    pub(crate) fn detail(&self) -> String {
        format!("keys={:?}", self.key_columns)
    }

    pub(crate) fn run(&self, core: &KernelCore) -> Result<()> {
        let ctx = core.ctx();
        let num_nodes = ctx.num_nodes();
        let self_index = ctx.self_node_index();
        let route = format!("hash_{}", core.id());
        let input = core.input(PORT_DEFAULT)?;

        while let Some(batch) = input.pull()? {
            core.check_cancelled()?;
            core.note_batch();

            let mut per_node: Vec<Vec<u32>> = vec![Vec::new(); num_nodes];
            if self.key_columns.is_empty() {
                per_node[0] = (0..batch.num_rows() as u32).collect();
            } else {
                let key_columns = select_columns(&batch, &self.key_columns);
                for row in 0..batch.num_rows() {
                    let key = ScalarVal::row_key(&key_columns, row)?;
                    let mut hasher = DefaultHasher::new();
                    key.hash(&mut hasher);
                    per_node[(hasher.finish() % num_nodes as u64) as usize].push(row as u32);
                }
            }

            for (node, rows) in per_node.into_iter().enumerate() {
                if rows.is_empty() {
                    continue;
                }
                let part = take_batch(&batch, &gather_indices(rows))?;
                if node == self_index {
                    core.emit(PORT_DEFAULT, part)?;
                } else {
                    self.exchange
                        .send(&[NodeId(node as u16)], &route, Some(part), &[])?;
                }
            }
        }

        self.exchange
            .broadcast(&route, None, &[(meta::LAST, "true".to_string())])?;
        let mut remaining_peers = num_nodes - 1;
        while remaining_peers > 0 {
            core.check_cancelled()?;
            let msg = self.exchange.recv(&route)?;
            if msg.metadata.contains_key(meta::LAST) {
                remaining_peers -= 1;
                continue;
            }
            for batch in msg.batches {
                core.emit(PORT_DEFAULT, batch)?;
            }
        }
        Ok(())
    }
}
