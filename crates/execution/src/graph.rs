//! Execution graph: DAG of kernels linked by caches, plus the scheduler.
//!
//! Contract:
//! - kernels and edges are wired at build time and immutable afterwards;
//! - at most one cache exists per `(kernel, output port)`; fan-out is
//!   modeled by duplication kernels, never by shared caches;
//! - `start_execute` spawns one task per kernel, in topological order, onto
//!   a fixed-size worker pool; coordination happens only through caches;
//! - the first fatal error wins the graph error slot; every other kernel
//!   observes closed caches and exits cleanly.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use arrow::record_batch::RecordBatch;
use ffr_common::{FfrError, KernelId, Result};
use tracing::{debug, info, warn};

use crate::cache::{BatchCache, CacheSettings};
use crate::context::QueryContext;
use crate::exchange::Exchange;
use crate::kernel::{Kernel, KernelState};
use crate::memory::MemoryMonitor;

/// One directed edge of the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    /// Producing kernel (or the head sentinel).
    pub source: KernelId,
    /// Consuming kernel.
    pub target: KernelId,
    /// Producer's output port.
    pub source_port: String,
    /// Consumer's input port.
    pub target_port: String,
}

impl Ord for Edge {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.target, self.source, &self.source_port, &self.target_port).cmp(&(
            other.target,
            other.source,
            &other.source_port,
            &other.target_port,
        ))
    }
}

impl PartialOrd for Edge {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Progress snapshot of one kernel.
#[derive(Debug, Clone)]
pub struct KernelProgress {
    /// Kernel description.
    pub description: String,
    /// Whether the kernel reached a terminal state.
    pub finished: bool,
    /// Input batches processed so far.
    pub batches_completed: u64,
}

/// Progress snapshot of the whole graph.
#[derive(Debug, Clone, Default)]
pub struct GraphProgress {
    /// Per-kernel snapshots in topological order.
    pub kernels: Vec<KernelProgress>,
}

/// Callback invoked with periodic progress snapshots.
pub type ProgressCallback = Box<dyn Fn(&GraphProgress) + Send + Sync>;

/// Single-writer-wins error slot.
#[derive(Default)]
pub(crate) struct ErrorSlot {
    inner: Mutex<Option<FfrError>>,
}

impl ErrorSlot {
    pub(crate) fn store(&self, error: FfrError) {
        let mut slot = self.inner.lock().expect("error slot poisoned");
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    pub(crate) fn surface(&self) -> Option<FfrError> {
        self.inner
            .lock()
            .expect("error slot poisoned")
            .as_ref()
            .map(resurface)
    }
}

/// Rebuild an owned error from the stored one (IO errors lose their source).
fn resurface(error: &FfrError) -> FfrError {
    match error {
        FfrError::PlanParse { line, reason } => FfrError::PlanParse {
            line: *line,
            reason: reason.clone(),
        },
        FfrError::Kernel { kernel_id, reason } => FfrError::Kernel {
            kernel_id: *kernel_id,
            reason: reason.clone(),
        },
        FfrError::Transport {
            node_id,
            stage,
            kind,
        } => FfrError::Transport {
            node_id: *node_id,
            stage: *stage,
            kind: *kind,
        },
        FfrError::ResourceExhausted { kind, detail } => FfrError::ResourceExhausted {
            kind: *kind,
            detail: detail.clone(),
        },
        FfrError::Closed => FfrError::Closed,
        FfrError::Cancelled => FfrError::Cancelled,
        FfrError::AlreadyReleased => FfrError::AlreadyReleased,
        FfrError::Io(e) => FfrError::Kernel {
            kernel_id: KernelId::HEAD,
            reason: format!("io error: {e}"),
        },
    }
}

struct RunState {
    pool: rayon::ThreadPool,
    done: Arc<(Mutex<HashSet<KernelId>>, Condvar)>,
    monitor: MemoryMonitor,
}

/// The execution graph of one query on one node.
pub struct Graph {
    ctx: QueryContext,
    kernels: BTreeMap<KernelId, Arc<Kernel>>,
    edges: BTreeSet<Edge>,
    caches: Vec<Arc<BatchCache>>,
    cache_by_source: HashMap<(KernelId, String), Arc<BatchCache>>,
    ordered_kernel_ids: Vec<KernelId>,
    output_kernel: Option<KernelId>,
    exchange: Option<Arc<Exchange>>,
    error_slot: ErrorSlot,
    progress_callback: Mutex<Option<ProgressCallback>>,
    run_state: Mutex<Option<RunState>>,
    started: AtomicBool,
}

impl Graph {
    /// Create an empty graph for one query.
    pub fn new(ctx: QueryContext) -> Self {
        Self {
            ctx,
            kernels: BTreeMap::new(),
            edges: BTreeSet::new(),
            caches: Vec::new(),
            cache_by_source: HashMap::new(),
            ordered_kernel_ids: Vec::new(),
            output_kernel: None,
            exchange: None,
            error_slot: ErrorSlot::default(),
            progress_callback: Mutex::new(None),
            run_state: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Query context of this graph.
    pub fn ctx(&self) -> &QueryContext {
        &self.ctx
    }

    /// Attach the distributed exchange handle.
    pub fn set_exchange(&mut self, exchange: Arc<Exchange>) {
        self.exchange = Some(exchange);
    }

    /// Distributed exchange handle, when the query spans nodes.
    pub fn exchange(&self) -> Option<&Arc<Exchange>> {
        self.exchange.as_ref()
    }

    /// Number of kernels in the graph.
    pub fn num_nodes(&self) -> usize {
        self.kernels.len()
    }

    /// Add a kernel node; ids must be unique.
    pub fn add_node(&mut self, kernel: Kernel) -> Result<KernelId> {
        let id = kernel.id();
        if self.kernels.contains_key(&id) {
            return Err(FfrError::PlanParse {
                line: 0,
                reason: format!("duplicate kernel id {id}"),
            });
        }
        self.kernels.insert(id, Arc::new(kernel));
        Ok(id)
    }

    /// Kernel by id.
    pub fn get_node(&self, id: KernelId) -> Option<&Arc<Kernel>> {
        self.kernels.get(&id)
    }

    /// The designated output kernel.
    pub fn output_kernel(&self) -> Option<&Arc<Kernel>> {
        self.output_kernel.and_then(|id| self.kernels.get(&id))
    }

    /// Mark the output kernel (the last kernel of the graph).
    pub fn set_output_kernel(&mut self, id: KernelId) {
        self.output_kernel = Some(id);
    }

    /// Wire an edge, creating its cache from the settings.
    ///
    /// Edges from the head sentinel mark graph sources and create no cache.
    pub fn add_edge(
        &mut self,
        source: KernelId,
        target: KernelId,
        source_port: &str,
        target_port: &str,
        settings: CacheSettings,
    ) -> Result<()> {
        if !self.kernels.contains_key(&target) {
            return Err(FfrError::PlanParse {
                line: 0,
                reason: format!("edge target kernel {target} does not exist"),
            });
        }

        if source != KernelId::HEAD {
            let source_kernel = self.kernels.get(&source).ok_or_else(|| FfrError::PlanParse {
                line: 0,
                reason: format!("edge source kernel {source} does not exist"),
            })?;
            let key = (source, source_port.to_string());
            if self.cache_by_source.contains_key(&key) {
                return Err(FfrError::PlanParse {
                    line: 0,
                    reason: format!(
                        "kernel {source} already has a cache on output port `{source_port}`"
                    ),
                });
            }

            let cache = Arc::new(BatchCache::new(
                format!("{source}_{source_port}"),
                self.ctx.clone(),
                settings,
            ));
            source_kernel.core().register_output(source_port, Arc::clone(&cache));
            self.kernels[&target]
                .core()
                .register_input(target_port, Arc::clone(&cache));
            self.caches.push(Arc::clone(&cache));
            self.cache_by_source.insert(key, cache);
        }

        self.edges.insert(Edge {
            source,
            target,
            source_port: source_port.to_string(),
            target_port: target_port.to_string(),
        });
        Ok(())
    }

    /// Cache on one kernel's output port.
    pub fn get_kernel_output_cache(&self, id: KernelId, port: &str) -> Option<Arc<BatchCache>> {
        self.cache_by_source.get(&(id, port.to_string())).cloned()
    }

    /// Every cache of the graph (memory-monitor sampling).
    pub fn caches(&self) -> &[Arc<BatchCache>] {
        &self.caches
    }

    /// Outgoing edges of one kernel.
    pub fn get_neighbours(&self, id: KernelId) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.source == id).collect()
    }

    /// Incoming edges of one kernel.
    pub fn get_reverse_neighbours(&self, id: KernelId) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.target == id).collect()
    }

    /// Rows so far pushed toward one kernel across its input caches.
    pub fn get_estimated_input_rows_to_kernel(&self, id: KernelId) -> u64 {
        self.get_reverse_neighbours(id)
            .into_iter()
            .filter(|e| e.source != KernelId::HEAD)
            .filter_map(|e| self.get_kernel_output_cache(e.source, &e.source_port))
            .map(|cache| cache.estimated_rows())
            .sum()
    }

    /// Compute and store the topological start order.
    pub fn set_kernels_order(&mut self) -> Result<()> {
        let mut in_degree: BTreeMap<KernelId, usize> =
            self.kernels.keys().map(|id| (*id, 0)).collect();
        for edge in &self.edges {
            if edge.source == KernelId::HEAD {
                continue;
            }
            *in_degree.entry(edge.target).or_insert(0) += 1;
        }

        let mut ready: Vec<KernelId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.kernels.len());
        while let Some(id) = ready.pop() {
            order.push(id);
            for edge in self.edges.iter().filter(|e| e.source == id) {
                let degree = in_degree.get_mut(&edge.target).expect("known target");
                *degree -= 1;
                if *degree == 0 {
                    ready.push(edge.target);
                }
            }
        }

        if order.len() != self.kernels.len() {
            return Err(FfrError::PlanParse {
                line: 0,
                reason: "execution graph contains a cycle".to_string(),
            });
        }
        self.ordered_kernel_ids = order;
        Ok(())
    }

    /// Topological kernel order used at start time.
    pub fn kernels_order(&self) -> &[KernelId] {
        &self.ordered_kernel_ids
    }

    /// Check the workflow invariants before execution.
    ///
    /// Every non-output kernel needs at least one outgoing edge; the output
    /// kernel must have none.
    pub fn check_and_complete_workflow(&self) -> Result<()> {
        let output = self.output_kernel.ok_or_else(|| FfrError::PlanParse {
            line: 0,
            reason: "graph has no output kernel".to_string(),
        })?;
        for id in self.kernels.keys() {
            let outgoing = self.get_neighbours(*id).len();
            if *id == output && outgoing != 0 {
                return Err(FfrError::PlanParse {
                    line: 0,
                    reason: format!("output kernel {id} has {outgoing} outgoing edges"),
                });
            }
            if *id != output && outgoing == 0 {
                return Err(FfrError::PlanParse {
                    line: 0,
                    reason: format!("kernel {id} has no outgoing edge"),
                });
            }
        }
        Ok(())
    }

    /// Log the DAG: kernels in start order, then edges.
    pub fn show(&self) {
        for id in &self.ordered_kernel_ids {
            if let Some(kernel) = self.kernels.get(id) {
                info!(query_id = self.ctx.token().0, kernel = %kernel.describe(), "graph node");
            }
        }
        for edge in &self.edges {
            info!(
                query_id = self.ctx.token().0,
                source = edge.source.0,
                source_port = %edge.source_port,
                target = edge.target.0,
                target_port = %edge.target_port,
                "graph edge"
            );
        }
    }

    /// Per-kernel progress snapshot in start order.
    pub fn get_progress(&self) -> GraphProgress {
        GraphProgress {
            kernels: self
                .ordered_kernel_ids
                .iter()
                .filter_map(|id| self.kernels.get(id))
                .map(|kernel| KernelProgress {
                    description: kernel.describe(),
                    finished: kernel.state().is_terminal(),
                    batches_completed: kernel.core().batches_completed(),
                })
                .collect(),
        }
    }

    /// Returns whether every kernel reached a terminal state.
    pub fn query_is_complete(&self) -> bool {
        self.kernels.values().all(|k| k.state().is_terminal())
    }

    /// Install the progress callback invoked by the monitor thread.
    pub fn set_progress_callback(&self, callback: ProgressCallback) {
        *self
            .progress_callback
            .lock()
            .expect("progress callback poisoned") = Some(callback);
    }

    pub(crate) fn invoke_progress(&self) {
        let callback = self
            .progress_callback
            .lock()
            .expect("progress callback poisoned");
        if let Some(callback) = callback.as_ref() {
            callback(&self.get_progress());
        }
    }

    /// Record the query's first fatal error.
    pub fn store_error(&self, error: FfrError) {
        warn!(query_id = self.ctx.token().0, error = %error, "graph error recorded");
        self.error_slot.store(error);
    }

    /// Cancel the query: flag the context and close every cache.
    pub fn cancel(&self) {
        self.ctx.cancel();
        for cache in &self.caches {
            cache.close();
        }
    }

    /// Spawn one task per kernel onto a fixed-size worker pool.
    pub fn start_execute(self: &Arc<Self>, max_kernel_run_threads: usize) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(FfrError::Kernel {
                kernel_id: KernelId::HEAD,
                reason: "graph was already started".to_string(),
            });
        }
        self.ctx.increment_step();
        info!(
            query_id = self.ctx.token().0,
            step = self.ctx.step(),
            kernels = self.kernels.len(),
            threads = max_kernel_run_threads,
            "starting execution graph"
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(max_kernel_run_threads.max(1))
            .thread_name(|i| format!("ffr-kernel-{i}"))
            .build()
            .map_err(|e| FfrError::Kernel {
                kernel_id: KernelId::HEAD,
                reason: format!("worker pool build failed: {e}"),
            })?;

        let done = Arc::new((Mutex::new(HashSet::new()), Condvar::new()));
        for id in &self.ordered_kernel_ids {
            let kernel = Arc::clone(&self.kernels[id]);
            kernel.core().set_state(KernelState::Ready);
            let graph = Arc::clone(self);
            let done = Arc::clone(&done);
            let id = *id;
            pool.spawn(move || {
                if let Err(error) = kernel.run() {
                    if error.is_benign() {
                        debug!(kernel = id.0, error = %error, "kernel ended early");
                    } else {
                        graph.store_error(error);
                    }
                }
                let (set, cond) = &*done;
                set.lock().expect("done set poisoned").insert(id);
                cond.notify_all();
            });
        }

        let monitor = MemoryMonitor::start(Arc::downgrade(self), self.ctx.clone());
        *self.run_state.lock().expect("run state poisoned") = Some(RunState {
            pool,
            done,
            monitor,
        });
        Ok(())
    }

    /// Join every kernel task and surface the first stored error.
    pub fn finish_execute(&self) -> Result<()> {
        let Some(run_state) = self.run_state.lock().expect("run state poisoned").take() else {
            return Err(FfrError::Kernel {
                kernel_id: KernelId::HEAD,
                reason: "graph was not started".to_string(),
            });
        };

        {
            let (set, cond) = &*run_state.done;
            let mut set = set.lock().expect("done set poisoned");
            while set.len() != self.kernels.len() {
                let (guard, _) = cond
                    .wait_timeout(set, Duration::from_millis(100))
                    .expect("done set poisoned");
                set = guard;
            }
        }
        run_state.monitor.stop();
        drop(run_state.pool);

        info!(
            query_id = self.ctx.token().0,
            step = self.ctx.step(),
            "query execution done"
        );
        match self.error_slot.surface() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Release the accumulated result set from the output kernel.
    ///
    /// Fails with the stored error if the query failed, with `Cancelled` if
    /// it was cancelled, and with `AlreadyReleased` on a second call.
    pub fn release_results(&self) -> Result<Vec<RecordBatch>> {
        if let Some(error) = self.error_slot.surface() {
            return Err(error);
        }
        if self.ctx.is_cancelled() {
            return Err(FfrError::Cancelled);
        }
        let output = self.output_kernel().ok_or_else(|| FfrError::PlanParse {
            line: 0,
            reason: "graph has no output kernel".to_string(),
        })?;
        output.release()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use arrow_schema::{DataType, Field, Schema};
    use ffr_common::ContextToken;
    use ffr_storage::{BatchProvider, MemBatchProvider};

    use super::*;
    use crate::builder::build_graph;
    use crate::kernel::PORT_DEFAULT;

    fn provider() -> Arc<dyn BatchProvider> {
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, false)]));
        Arc::new(MemBatchProvider::single(schema, Vec::new()))
    }

    fn ctx() -> QueryContext {
        QueryContext::single_node(ContextToken(66), HashMap::new())
    }

    #[test]
    fn topological_order_covers_every_kernel_once_with_sources_first() {
        let plan = "LogicalSort(sort0=[$0], dir0=[ASC])\n  LogicalFilter(condition=[>($0, 0)])\n    LogicalTableScan(table=[[main, t]])\n";
        let graph = build_graph(plan, ctx(), vec![provider()], None).expect("graph");

        let order = graph.kernels_order();
        assert_eq!(order.len(), graph.num_nodes());
        let position: HashMap<KernelId, usize> =
            order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        for id in order {
            for edge in graph.get_neighbours(*id) {
                assert!(
                    position[&edge.source] < position[&edge.target],
                    "edge {} -> {} violates the start order",
                    edge.source,
                    edge.target
                );
            }
        }
    }

    #[test]
    fn one_cache_per_output_port_is_enforced() {
        let plan = "LogicalTableScan(table=[[main, t]])\n";
        let graph = build_graph(plan, ctx(), vec![provider()], None).expect("graph");

        // The scan's default port already feeds the output kernel.
        let scan = graph.kernels_order()[0];
        assert!(graph.get_kernel_output_cache(scan, PORT_DEFAULT).is_some());
    }

    #[test]
    fn estimated_input_rows_follow_cache_puts() {
        let plan = "LogicalTableScan(table=[[main, t]])\n";
        let graph = build_graph(plan, ctx(), vec![provider()], None).expect("graph");
        let scan = graph.kernels_order()[0];
        let output = graph
            .output_kernel()
            .map(|k| k.id())
            .expect("output kernel");

        assert_eq!(graph.get_estimated_input_rows_to_kernel(output), 0);
        let cache = graph
            .get_kernel_output_cache(scan, PORT_DEFAULT)
            .expect("cache");
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, false)]));
        let batch = arrow::record_batch::RecordBatch::try_new(
            schema,
            vec![Arc::new(arrow::array::Int64Array::from(vec![1_i64, 2]))],
        )
        .expect("batch");
        cache.put(batch).expect("put");
        assert_eq!(graph.get_estimated_input_rows_to_kernel(output), 2);
    }
}
