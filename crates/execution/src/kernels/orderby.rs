//! The order-by pipeline: sort+sample, partition planning, range
//! partitioning (local or distributed), and k-way merge.
//!
//! Partition ownership is contiguous: with `P` partitions over `n` nodes
//! (`P` a multiple of `n`), node `k` owns partitions
//! `k·P/n .. (k+1)·P/n`, so concatenating per-node merged outputs in node
//! order yields the global order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use arrow::record_batch::RecordBatch;
use arrow_schema::Schema;
use ffr_common::Result;
use ffr_planner::SortVars;
use ffr_transport::meta;
use rand::seq::index::sample as sample_indices;
use rand::thread_rng;
use tracing::debug;

use crate::cache::batch_bytes;
use crate::exchange::Exchange;
use crate::kernel::{KernelCore, PORT_DEFAULT, PORT_PARTITIONS, PORT_PIVOTS, PORT_SAMPLES};
use crate::kernels::row_ops::determine_local_limit;
use crate::rows::{
    KeyColumns, SortKey, concat_all, gather_indices, project_columns, sort_batch, sort_keys,
    split_by_pivots, take_batch,
};

/// Rows per merged output chunk.
const MERGE_CHUNK_ROWS: usize = 8192;

/// Per-batch sample bounds.
const MIN_SAMPLES: usize = 100;
const MAX_SAMPLES: usize = 1000;

/// Sample size for one batch: `max(100, min(1000, ceil(0.1·n)))`, capped at `n`.
pub fn compute_total_samples(num_rows: usize) -> usize {
    let tenth = num_rows.div_ceil(10);
    tenth.clamp(MIN_SAMPLES, MAX_SAMPLES).min(num_rows)
}

/// Input population totals shared between the sample and plan kernels.
#[derive(Debug, Default)]
pub struct SharedPopulation {
    rows: AtomicU64,
    bytes: AtomicU64,
}

impl SharedPopulation {
    /// Create an empty population.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn add(&self, rows: u64, bytes: u64) {
        self.rows.fetch_add(rows, Ordering::AcqRel);
        self.bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    fn rows(&self) -> u64 {
        self.rows.load(Ordering::Acquire)
    }

    fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }
}

/// Agreed partition geometry, set by the partitioning kernel and awaited by
/// the merge kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLayout {
    /// Total partitions across the cluster.
    pub total_partitions: usize,
    /// Partitions owned by each node (`total / num_nodes`).
    pub per_node: usize,
}

impl PartitionLayout {
    /// Node owning a global partition index (contiguous block ownership).
    pub fn owner(&self, partition: usize) -> usize {
        partition / self.per_node.max(1)
    }

    /// Local for-each slot of a global partition at its owner.
    pub fn local_slot(&self, partition: usize) -> usize {
        partition % self.per_node.max(1)
    }
}

/// One-shot layout cell with blocking wait.
#[derive(Default)]
pub struct SharedLayout {
    cell: Mutex<Option<PartitionLayout>>,
    set: Condvar,
}

impl SharedLayout {
    /// Create an unset layout cell.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn put(&self, layout: PartitionLayout) {
        let mut cell = self.cell.lock().expect("layout poisoned");
        *cell = Some(layout);
        self.set.notify_all();
    }

    fn wait(&self, core: &KernelCore) -> Result<PartitionLayout> {
        let mut cell = self.cell.lock().expect("layout poisoned");
        loop {
            if let Some(layout) = *cell {
                return Ok(layout);
            }
            core.check_cancelled()?;
            let (guard, _) = self
                .set
                .wait_timeout(cell, Duration::from_millis(100))
                .expect("layout poisoned");
            cell = guard;
        }
    }
}

/// Stage 1: sort each batch locally and emit a key sample per batch.
pub struct SortSampleKernel {
    vars: SortVars,
    population: Arc<SharedPopulation>,
}

impl SortSampleKernel {
    /// Create the kernel from parsed sort variables.
    pub fn new(vars: SortVars, population: Arc<SharedPopulation>) -> Self {
        Self { vars, population }
    }

    fn keys(&self) -> Vec<SortKey> {
        sort_keys(&self.vars.columns, &self.vars.directions)
    }

    pub(crate) fn detail(&self) -> String {
        format!("keys={:?}", self.vars.columns)
    }

    pub(crate) fn run(&self, core: &KernelCore) -> Result<()> {
        let input = core.input(PORT_DEFAULT)?;
        let keys = self.keys();

        while let Some(batch) = input.pull()? {
            core.check_cancelled()?;
            self.population
                .add(batch.num_rows() as u64, batch_bytes(&batch));

            let sample = draw_sample(&batch, &self.vars.columns)?;
            let sorted = sort_batch(&batch, &keys)?;
            core.note_batch();
            core.emit(PORT_SAMPLES, sample)?;
            core.emit(PORT_DEFAULT, sorted)?;
        }
        Ok(())
    }
}

/// Random sample of the key columns of one batch.
fn draw_sample(batch: &RecordBatch, key_columns: &[usize]) -> Result<RecordBatch> {
    let keys_only = project_columns(batch, key_columns)?;
    let n = keys_only.num_rows();
    let k = compute_total_samples(n);
    if k == n {
        return Ok(keys_only);
    }
    let indices = sample_indices(&mut thread_rng(), n, k)
        .into_iter()
        .map(|i| i as u32);
    take_batch(&keys_only, &gather_indices(indices))
}

/// Stage 2: consolidate samples into a broadcast pivot table.
///
/// In a cluster, node 0 collects every node's samples and population stats,
/// derives the plan, and broadcasts the pivot table; other nodes forward
/// their samples and wait.
pub struct PartitionPlanKernel {
    vars: SortVars,
    population: Arc<SharedPopulation>,
    exchange: Option<Arc<Exchange>>,
}

impl PartitionPlanKernel {
    /// Create the kernel from parsed sort variables.
    pub fn new(
        vars: SortVars,
        population: Arc<SharedPopulation>,
        exchange: Option<Arc<Exchange>>,
    ) -> Self {
        Self {
            vars,
            population,
            exchange,
        }
    }

    pub(crate) fn detail(&self) -> String {
        String::new()
    }

    pub(crate) fn run(&self, core: &KernelCore) -> Result<()> {
        let samples_in = core.input(PORT_SAMPLES)?;
        let mut samples = Vec::new();
        while let Some(batch) = samples_in.pull()? {
            core.check_cancelled()?;
            core.note_batch();
            samples.push(batch);
        }

        let ctx = core.ctx();
        let mut total_rows = self.population.rows();
        let mut total_bytes = self.population.bytes();

        let pivots = match &self.exchange {
            Some(exchange) if ctx.num_nodes() > 1 => {
                let sample_route = format!("orderby_samples_{}", core.id());
                let pivot_route = format!("orderby_pivots_{}", core.id());

                if ctx.self_node_index() != 0 {
                    exchange.send(
                        &[ffr_common::NodeId(0)],
                        &sample_route,
                        concat_all(&samples)?,
                        &[
                            (meta::NUM_ROWS, total_rows.to_string()),
                            (meta::AVG_BYTES_PER_ROW, avg_row_bytes(total_rows, total_bytes).to_string()),
                        ],
                    )?;
                    let msg = exchange.recv(&pivot_route)?;
                    concat_all(&msg.batches)?
                        .unwrap_or_else(|| RecordBatch::new_empty(Arc::new(Schema::empty())))
                } else {
                    for msg in exchange.recv_from_all_peers(&sample_route)? {
                        let peer_rows = parse_meta_u64(&msg, meta::NUM_ROWS);
                        let peer_avg = parse_meta_u64(&msg, meta::AVG_BYTES_PER_ROW);
                        total_rows += peer_rows;
                        total_bytes += peer_rows * peer_avg;
                        samples.extend(msg.batches);
                    }
                    let pivots = self.generate_partition_plan(core, &samples, total_rows, total_bytes)?;
                    exchange.broadcast(&pivot_route, Some(pivots.clone()), &[])?;
                    pivots
                }
            }
            _ => self.generate_partition_plan(core, &samples, total_rows, total_bytes)?,
        };

        core.emit(PORT_PIVOTS, pivots)?;
        Ok(())
    }

    /// Derive `P` and take `P − 1` equi-spaced pivots from the sorted samples.
    fn generate_partition_plan(
        &self,
        core: &KernelCore,
        samples: &[RecordBatch],
        total_rows: u64,
        total_bytes: u64,
    ) -> Result<RecordBatch> {
        let ctx = core.ctx();
        let config = ctx.config();
        let num_nodes = ctx.num_nodes() as u64;
        let avg_bytes_per_row = avg_row_bytes(total_rows, total_bytes);

        let mut total_num_partitions =
            (total_rows * avg_bytes_per_row).div_ceil(config.num_bytes_per_order_by_partition);
        if total_num_partitions == 0 {
            total_num_partitions = 1;
        }
        // A multiple of the node count distributes evenly.
        total_num_partitions = total_num_partitions.div_ceil(num_nodes) * num_nodes;
        let cap = config.max_num_order_by_partitions_per_node as u64 * num_nodes;
        if total_num_partitions > cap {
            total_num_partitions = cap;
        }

        debug!(
            query_id = ctx.token().0,
            step = ctx.step(),
            substep = ctx.substep(),
            total_rows,
            avg_bytes_per_row,
            total_num_partitions,
            "determining number of order-by partitions"
        );

        let Some(all_samples) = concat_all(samples)? else {
            return Ok(RecordBatch::new_empty(Arc::new(Schema::empty())));
        };

        // Sample batches hold only the key columns, in key order.
        let sample_keys: Vec<SortKey> = self
            .vars
            .directions
            .iter()
            .enumerate()
            .map(|(i, d)| SortKey {
                column: i,
                descending: d.is_descending(),
            })
            .collect();
        let sorted = sort_batch(&all_samples, &sample_keys)?;

        let sample_rows = sorted.num_rows();
        let p = total_num_partitions as usize;
        if sample_rows == 0 || p <= 1 {
            return Ok(sorted.slice(0, 0));
        }
        let indices = (1..p).map(|i| (i * sample_rows / p) as u32);
        take_batch(&sorted, &gather_indices(indices))
    }
}

fn avg_row_bytes(total_rows: u64, total_bytes: u64) -> u64 {
    if total_rows == 0 {
        0
    } else {
        (total_bytes / total_rows).max(1)
    }
}

fn parse_meta_u64(msg: &ffr_transport::ReceivedMessage, key: &str) -> u64 {
    msg.metadata
        .get(key)
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or(0)
}

/// Stage 3 (single node): range-split sorted batches into for-each slots.
pub struct PartitionKernel {
    vars: SortVars,
    layout: Arc<SharedLayout>,
}

impl PartitionKernel {
    /// Create the kernel from parsed sort variables.
    pub fn new(vars: SortVars, layout: Arc<SharedLayout>) -> Self {
        Self { vars, layout }
    }

    pub(crate) fn detail(&self) -> String {
        String::new()
    }

    pub(crate) fn run(&self, core: &KernelCore) -> Result<()> {
        let pivots = drain_pivots(core)?;
        let keys = sort_keys(&self.vars.columns, &self.vars.directions);
        let layout = PartitionLayout {
            total_partitions: pivots.num_rows() + 1,
            per_node: pivots.num_rows() + 1,
        };
        self.layout.put(layout);

        let input = core.input(PORT_DEFAULT)?;
        let partitions_out = core.output(PORT_PARTITIONS)?;
        while let Some(batch) = input.pull()? {
            core.check_cancelled()?;
            core.note_batch();
            for (p, part) in split_by_pivots(&batch, &keys, &pivots)?.into_iter().enumerate() {
                if part.num_rows() == 0 {
                    continue;
                }
                partitions_out.put_to(p, part)?;
            }
        }
        Ok(())
    }
}

/// Stage 3 (multi-node): range-split and redistribute across the cluster.
pub struct DistributeByRangeKernel {
    vars: SortVars,
    layout: Arc<SharedLayout>,
    exchange: Arc<Exchange>,
}

impl DistributeByRangeKernel {
    /// Create the kernel from parsed sort variables.
    pub fn new(vars: SortVars, layout: Arc<SharedLayout>, exchange: Arc<Exchange>) -> Self {
        Self {
            vars,
            layout,
            exchange,
        }
    }

    pub(crate) fn detail(&self) -> String {
        String::new()
    }

    pub(crate) fn run(&self, core: &KernelCore) -> Result<()> {
        let ctx = core.ctx();
        let pivots = drain_pivots(core)?;
        let keys = sort_keys(&self.vars.columns, &self.vars.directions);
        let num_nodes = ctx.num_nodes();
        let total = pivots.num_rows() + 1;
        let layout = PartitionLayout {
            total_partitions: total,
            per_node: total.div_ceil(num_nodes),
        };
        self.layout.put(layout);

        let route = format!("orderby_partition_{}", core.id());
        let self_index = ctx.self_node_index();
        let input = core.input(PORT_DEFAULT)?;
        let partitions_out = core.output(PORT_PARTITIONS)?;

        while let Some(batch) = input.pull()? {
            core.check_cancelled()?;
            core.note_batch();
            for (p, part) in split_by_pivots(&batch, &keys, &pivots)?.into_iter().enumerate() {
                if part.num_rows() == 0 {
                    continue;
                }
                let owner = layout.owner(p);
                if owner == self_index {
                    partitions_out.put_to(layout.local_slot(p), part)?;
                } else {
                    self.exchange.send(
                        &[ffr_common::NodeId(owner as u16)],
                        &route,
                        Some(part),
                        &[(meta::PARTITION, p.to_string())],
                    )?;
                }
            }
        }

        // Tell peers this node is done, then collect their partitions.
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
            let p = msg
                .metadata
                .get(meta::PARTITION)
                .and_then(|raw| raw.parse::<usize>().ok())
                .ok_or_else(|| core.err("partition message without partition index"))?;
            for batch in msg.batches {
                partitions_out.put_to(layout.local_slot(p), batch)?;
            }
        }
        Ok(())
    }
}

fn drain_pivots(core: &KernelCore) -> Result<RecordBatch> {
    let pivots_in = core.input(PORT_PIVOTS)?;
    let mut batches = Vec::new();
    while let Some(batch) = pivots_in.pull()? {
        batches.push(batch);
    }
    Ok(concat_all(&batches)?
        .unwrap_or_else(|| RecordBatch::new_empty(Arc::new(Schema::empty()))))
}

/// Stage 4: k-way merge owned partitions in ascending global order.
pub struct MergeKernel {
    vars: SortVars,
    layout: Arc<SharedLayout>,
    exchange: Option<Arc<Exchange>>,
}

impl MergeKernel {
    /// Create the kernel from parsed sort variables.
    pub fn new(
        vars: SortVars,
        layout: Arc<SharedLayout>,
        exchange: Option<Arc<Exchange>>,
    ) -> Self {
        Self {
            vars,
            layout,
            exchange,
        }
    }

    pub(crate) fn detail(&self) -> String {
        match self.vars.fetch {
            Some(fetch) => format!("fetch={fetch}"),
            None => String::new(),
        }
    }

    pub(crate) fn run(&self, core: &KernelCore) -> Result<()> {
        let layout = self.layout.wait(core)?;
        let keys = sort_keys(&self.vars.columns, &self.vars.directions);
        let partitions_in = core.input(PORT_PARTITIONS)?;

        // Every run must be collected before merging, and the distributed
        // limit needs the full local row count before anything is emitted.
        let owned = layout.per_node.min(layout.total_partitions);
        let mut slots: Vec<Vec<RecordBatch>> = Vec::with_capacity(owned);
        let mut local_rows = 0u64;
        for slot in 0..owned {
            let mut runs = Vec::new();
            while let Some(batch) = partitions_in.pull_from(slot)? {
                core.check_cancelled()?;
                local_rows += batch.num_rows() as u64;
                runs.push(batch);
            }
            slots.push(runs);
        }

        let mut remaining = match self.vars.fetch {
            Some(fetch) => {
                determine_local_limit(core, self.exchange.as_deref(), local_rows, fetch)?
            }
            None => u64::MAX,
        };

        for runs in slots {
            if remaining == 0 {
                break;
            }
            core.check_cancelled()?;
            let Some(merged) = merge_runs(core, runs, &keys)? else {
                continue;
            };
            core.note_batch();

            let mut offset = 0usize;
            while offset < merged.num_rows() && remaining > 0 {
                let len = MERGE_CHUNK_ROWS
                    .min(merged.num_rows() - offset)
                    .min(remaining as usize);
                core.emit(PORT_DEFAULT, merged.slice(offset, len))?;
                offset += len;
                remaining -= len as u64;
            }
        }
        Ok(())
    }
}

/// Merge sorted runs pairwise until one remains.
fn merge_runs(
    core: &KernelCore,
    mut runs: Vec<RecordBatch>,
    keys: &[SortKey],
) -> Result<Option<RecordBatch>> {
    runs.retain(|r| r.num_rows() > 0);
    while runs.len() > 1 {
        let mut next = Vec::with_capacity(runs.len().div_ceil(2));
        let mut iter = runs.into_iter();
        while let Some(a) = iter.next() {
            match iter.next() {
                Some(b) => next.push(merge_sorted_pair(core, &a, &b, keys)?),
                None => next.push(a),
            }
        }
        runs = next;
    }
    Ok(runs.into_iter().next())
}

/// Merge two key-sorted batches, taking the left row on ties so input order
/// is preserved.
fn merge_sorted_pair(
    core: &KernelCore,
    a: &RecordBatch,
    b: &RecordBatch,
    keys: &[SortKey],
) -> Result<RecordBatch> {
    let a_keys = KeyColumns::from_batch(a, keys)?;
    let b_keys = KeyColumns::from_batch(b, keys)?;

    let mut indices = Vec::with_capacity(a.num_rows() + b.num_rows());
    let (mut i, mut j) = (0usize, 0usize);
    while i < a.num_rows() && j < b.num_rows() {
        if a_keys.compare_rows(i, &b_keys, j)? != std::cmp::Ordering::Greater {
            indices.push((0usize, i));
            i += 1;
        } else {
            indices.push((1usize, j));
            j += 1;
        }
    }
    indices.extend((i..a.num_rows()).map(|r| (0usize, r)));
    indices.extend((j..b.num_rows()).map(|r| (1usize, r)));

    let mut columns = Vec::with_capacity(a.num_columns());
    for c in 0..a.num_columns() {
        let column = arrow::compute::interleave(
            &[a.column(c).as_ref(), b.column(c).as_ref()],
            &indices,
        )
        .map_err(|e| core.err(format!("merge interleave failed: {e}")))?;
        columns.push(column);
    }
    RecordBatch::try_new(a.schema(), columns)
        .map_err(|e| core.err(format!("merged batch build failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_size_follows_the_clamp_formula() {
        assert_eq!(compute_total_samples(50), 50);
        assert_eq!(compute_total_samples(100), 100);
        assert_eq!(compute_total_samples(500), 100);
        assert_eq!(compute_total_samples(5_000), 500);
        assert_eq!(compute_total_samples(50_000), 1000);
        assert_eq!(compute_total_samples(1_000_000), 1000);
    }

    #[test]
    fn contiguous_ownership_covers_all_partitions() {
        let layout = PartitionLayout {
            total_partitions: 8,
            per_node: 4,
        };
        let owners: Vec<usize> = (0..8).map(|p| layout.owner(p)).collect();
        assert_eq!(owners, vec![0, 0, 0, 0, 1, 1, 1, 1]);
        let slots: Vec<usize> = (0..8).map(|p| layout.local_slot(p)).collect();
        assert_eq!(slots, vec![0, 1, 2, 3, 0, 1, 2, 3]);
    }
}
