//! Kernel harness and variant dispatch.
//!
//! A kernel is a tagged variant over the operator implementations, sharing
//! one [`KernelCore`] harness: stable id, name, ports, context handle, and
//! the atomic progress counters. Dispatch is a match over the variant for
//! the `{describe, run, release}` operation set; terminal transitions close
//! every owned output cache exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::Mutex;

use arrow::record_batch::RecordBatch;
use ffr_common::{FfrError, KernelId, Result, global_metrics};
use tracing::debug;

use crate::cache::BatchCache;
use crate::context::QueryContext;
use crate::kernels::aggregate::AggregateKernel;
use crate::kernels::distribute::DistributeByHashKernel;
use crate::kernels::join::JoinKernel;
use crate::kernels::orderby::{
    DistributeByRangeKernel, MergeKernel, PartitionKernel, PartitionPlanKernel, SortSampleKernel,
};
use crate::kernels::output::OutputKernel;
use crate::kernels::row_ops::{FilterKernel, LimitKernel, ProjectKernel, UnionAllKernel};
use crate::kernels::scan::{BindableScanKernel, TableScanKernel};
use crate::kernels::window::WindowKernel;

/// Main data port shared by most kernels.
pub const PORT_DEFAULT: &str = "default";
/// Sample stream port of the sort/sample kernel.
pub const PORT_SAMPLES: &str = "samples";
/// Pivot-table port between partition planning and partitioning.
pub const PORT_PIVOTS: &str = "pivots";
/// For-each partition port between partitioning and merge.
pub const PORT_PARTITIONS: &str = "partitions";
/// Build-side input of a join.
pub const PORT_BUILD: &str = "build";
/// Probe-side input of a join.
pub const PORT_PROBE: &str = "probe";

/// Input port name of the `i`th input of a multi-input kernel.
pub fn input_port(i: usize) -> String {
    format!("input_{i}")
}

/// Lifecycle state of one kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KernelState {
    /// Constructed but not wired.
    Uninitialized = 0,
    /// Wired into the graph, not yet started.
    Ready = 1,
    /// `run` in progress.
    Running = 2,
    /// `run` returned successfully.
    Finished = 3,
    /// `run` returned a fatal error.
    Failed = 4,
    /// `run` observed cancellation.
    Cancelled = 5,
}

impl KernelState {
    fn from_u8(raw: u8) -> KernelState {
        match raw {
            0 => KernelState::Uninitialized,
            1 => KernelState::Ready,
            2 => KernelState::Running,
            3 => KernelState::Finished,
            4 => KernelState::Failed,
            _ => KernelState::Cancelled,
        }
    }

    /// Returns whether the state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            KernelState::Finished | KernelState::Failed | KernelState::Cancelled
        )
    }
}

/// Shared harness of every kernel variant.
pub struct KernelCore {
    id: KernelId,
    name: String,
    ctx: QueryContext,
    state: AtomicU8,
    batches_completed: AtomicU64,
    rows_emitted: AtomicU64,
    inputs: Mutex<HashMap<String, Arc<BatchCache>>>,
    outputs: Mutex<HashMap<String, Arc<BatchCache>>>,
    outputs_closed: AtomicBool,
}

impl KernelCore {
    /// Create a harness for one kernel.
    pub fn new(id: KernelId, name: impl Into<String>, ctx: QueryContext) -> Self {
        Self {
            id,
            name: name.into(),
            ctx,
            state: AtomicU8::new(KernelState::Uninitialized as u8),
            batches_completed: AtomicU64::new(0),
            rows_emitted: AtomicU64::new(0),
            inputs: Mutex::new(HashMap::new()),
            outputs: Mutex::new(HashMap::new()),
            outputs_closed: AtomicBool::new(false),
        }
    }

    /// Kernel id.
    pub fn id(&self) -> KernelId {
        self.id
    }

    /// Human-readable kernel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Query context handle.
    pub fn ctx(&self) -> &QueryContext {
        &self.ctx
    }

    /// Current lifecycle state.
    pub fn state(&self) -> KernelState {
        KernelState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: KernelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Input batches processed so far.
    pub fn batches_completed(&self) -> u64 {
        self.batches_completed.load(Ordering::Acquire)
    }

    /// Rows pushed to outputs so far.
    pub fn rows_emitted(&self) -> u64 {
        self.rows_emitted.load(Ordering::Acquire)
    }

    /// Wire an input cache onto a named port.
    pub fn register_input(&self, port: &str, cache: Arc<BatchCache>) {
        self.inputs
            .lock()
            .expect("kernel ports poisoned")
            .insert(port.to_string(), cache);
    }

    /// Wire an output cache onto a named port.
    pub fn register_output(&self, port: &str, cache: Arc<BatchCache>) {
        self.outputs
            .lock()
            .expect("kernel ports poisoned")
            .insert(port.to_string(), cache);
    }

    /// Input cache of a named port.
    pub fn input(&self, port: &str) -> Result<Arc<BatchCache>> {
        self.inputs
            .lock()
            .expect("kernel ports poisoned")
            .get(port)
            .cloned()
            .ok_or_else(|| self.err(format!("no input cache on port `{port}`")))
    }

    /// Output cache of a named port.
    pub fn output(&self, port: &str) -> Result<Arc<BatchCache>> {
        self.outputs
            .lock()
            .expect("kernel ports poisoned")
            .get(port)
            .cloned()
            .ok_or_else(|| self.err(format!("no output cache on port `{port}`")))
    }

    /// Returns whether a port has an output cache wired.
    pub fn has_output(&self, port: &str) -> bool {
        self.outputs
            .lock()
            .expect("kernel ports poisoned")
            .contains_key(port)
    }

    /// Push a batch to a named output port.
    pub fn emit(&self, port: &str, batch: RecordBatch) -> Result<()> {
        self.rows_emitted
            .fetch_add(batch.num_rows() as u64, Ordering::AcqRel);
        self.output(port)?.put(batch)
    }

    /// Count one processed input batch.
    pub fn note_batch(&self) {
        self.batches_completed.fetch_add(1, Ordering::AcqRel);
        global_metrics().inc_kernel_batches(&self.ctx.token().to_string(), &self.name);
    }

    /// Close every owned output cache; idempotent.
    pub fn close_outputs(&self) {
        if self.outputs_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for cache in self.outputs.lock().expect("kernel ports poisoned").values() {
            cache.close();
        }
    }

    /// Build a kernel-attributed error.
    pub fn err(&self, reason: impl Into<String>) -> FfrError {
        FfrError::Kernel {
            kernel_id: self.id,
            reason: reason.into(),
        }
    }

    /// Cancellation check for run loops.
    pub fn check_cancelled(&self) -> Result<()> {
        self.ctx.check_cancelled()
    }
}

/// Operator variants of the runtime.
pub enum KernelVariant {
    /// Full-table scan over a batch provider.
    TableScan(TableScanKernel),
    /// Scan with pushed-down projection and filters.
    BindableScan(BindableScanKernel),
    /// Row predicate.
    Filter(FilterKernel),
    /// Column projection/computation.
    Project(ProjectKernel),
    /// Per-batch sort plus key sampling (order-by stage 1).
    SortSample(SortSampleKernel),
    /// Sample consolidation into a broadcast pivot table (order-by stage 2).
    PartitionPlan(PartitionPlanKernel),
    /// Local range split into for-each partitions (order-by stage 3).
    Partition(PartitionKernel),
    /// Range split plus inter-node redistribution (order-by stage 3).
    DistributeByRange(DistributeByRangeKernel),
    /// Hash redistribution across nodes.
    DistributeByHash(DistributeByHashKernel),
    /// K-way merge of sorted partitions (order-by stage 4).
    Merge(MergeKernel),
    /// Row limit with distributed prefix accounting.
    Limit(LimitKernel),
    /// Grouped/global aggregation.
    Aggregate(AggregateKernel),
    /// Hash equi-join (build + probe).
    Join(JoinKernel),
    /// Window functions over partition/order keys.
    Window(WindowKernel),
    /// Bag union of inputs in input order.
    UnionAll(UnionAllKernel),
    /// Result accumulation and release.
    Output(OutputKernel),
}

impl KernelVariant {
    fn run(&self, core: &KernelCore) -> Result<()> {
        match self {
            KernelVariant::TableScan(k) => k.run(core),
            KernelVariant::BindableScan(k) => k.run(core),
            KernelVariant::Filter(k) => k.run(core),
            KernelVariant::Project(k) => k.run(core),
            KernelVariant::SortSample(k) => k.run(core),
            KernelVariant::PartitionPlan(k) => k.run(core),
            KernelVariant::Partition(k) => k.run(core),
            KernelVariant::DistributeByRange(k) => k.run(core),
            KernelVariant::DistributeByHash(k) => k.run(core),
            KernelVariant::Merge(k) => k.run(core),
            KernelVariant::Limit(k) => k.run(core),
            KernelVariant::Aggregate(k) => k.run(core),
            KernelVariant::Join(k) => k.run(core),
            KernelVariant::Window(k) => k.run(core),
            KernelVariant::UnionAll(k) => k.run(core),
            KernelVariant::Output(k) => k.run(core),
        }
    }

    fn detail(&self) -> String {
        match self {
            KernelVariant::TableScan(k) => k.detail(),
            KernelVariant::BindableScan(k) => k.detail(),
            KernelVariant::Filter(k) => k.detail(),
            KernelVariant::Project(k) => k.detail(),
            KernelVariant::SortSample(k) => k.detail(),
            KernelVariant::PartitionPlan(k) => k.detail(),
            KernelVariant::Partition(k) => k.detail(),
            KernelVariant::DistributeByRange(k) => k.detail(),
            KernelVariant::DistributeByHash(k) => k.detail(),
            KernelVariant::Merge(k) => k.detail(),
            KernelVariant::Limit(k) => k.detail(),
            KernelVariant::Aggregate(k) => k.detail(),
            KernelVariant::Join(k) => k.detail(),
            KernelVariant::Window(k) => k.detail(),
            KernelVariant::UnionAll(k) => k.detail(),
            KernelVariant::Output(k) => k.detail(),
        }
    }
}

/// One executing operator instance.
pub struct Kernel {
    core: Arc<KernelCore>,
    variant: KernelVariant,
}

impl Kernel {
    /// Pair a harness with its operator variant.
    pub fn new(core: KernelCore, variant: KernelVariant) -> Self {
        Self {
            core: Arc::new(core),
            variant,
        }
    }

    /// Kernel id.
    pub fn id(&self) -> KernelId {
        self.core.id()
    }

    /// Shared harness handle.
    pub fn core(&self) -> &Arc<KernelCore> {
        &self.core
    }

    /// Human-readable description for logs and progress snapshots.
    pub fn describe(&self) -> String {
        let detail = self.variant.detail();
        if detail.is_empty() {
            format!("{}({})", self.core.name(), self.core.id())
        } else {
            format!("{}({}) {detail}", self.core.name(), self.core.id())
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> KernelState {
        self.core.state()
    }

    /// Execute the kernel's run loop to a terminal state.
    ///
    /// `Closed` from a downstream cache and cancellation both end the run
    /// without counting as failures; outputs are closed exactly once on
    /// every path.
    pub fn run(&self) -> Result<()> {
        self.core.set_state(KernelState::Running);
        debug!(
            query_id = self.core.ctx().token().0,
            step = self.core.ctx().step(),
            substep = self.core.ctx().substep(),
            kernel = %self.describe(),
            "kernel started"
        );

        let result = match self.variant.run(&self.core) {
            // A closed downstream cache is a graceful stop, not a failure.
            Err(FfrError::Closed) => Ok(()),
            Err(error) => Err(error.for_kernel(self.core.id())),
            ok => ok,
        };

        match &result {
            Ok(()) if self.core.ctx().is_cancelled() => {
                self.core.set_state(KernelState::Cancelled)
            }
            Ok(()) => self.core.set_state(KernelState::Finished),
            Err(FfrError::Cancelled) => self.core.set_state(KernelState::Cancelled),
            Err(_) => self.core.set_state(KernelState::Failed),
        }
        self.core.close_outputs();

        debug!(
            query_id = self.core.ctx().token().0,
            kernel = %self.describe(),
            state = ?self.core.state(),
            batches = self.core.batches_completed(),
            "kernel finished"
        );
        result
    }

    /// Release accumulated results (output kernel only; empty otherwise).
    pub fn release(&self) -> Result<Vec<RecordBatch>> {
        match &self.variant {
            KernelVariant::Output(k) => k.release(),
            _ => Ok(Vec::new()),
        }
    }

    /// Let a scan stop early after `rows` (simple scan+limit plans).
    ///
    /// Returns whether this kernel is a scan that honors the hint.
    pub fn set_scan_stop_after(&self, rows: u64) -> bool {
        match &self.variant {
            KernelVariant::TableScan(k) => {
                k.set_stop_after_rows(rows);
                true
            }
            KernelVariant::BindableScan(k) => {
                k.set_stop_after_rows(rows);
                true
            }
            _ => false,
        }
    }
}
