//! Bounded FIFO caches linking kernels.
//!
//! Contract:
//! - `put` blocks while admitting the batch would exceed the byte capacity
//!   (a single oversized batch is admitted into an empty cache so producers
//!   cannot deadlock);
//! - `pull` blocks while the cache is empty and not closed, and yields
//!   `None` once closed and drained;
//! - `close` is idempotent and wakes all waiters;
//! - FIFO order holds per cache (per sub-queue for the for-each variant);
//! - every blocking wait is a timed condvar wait so cancellation is observed
//!   within 100 ms.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use ffr_common::{FfrError, Result, global_metrics};
use tracing::debug;

use crate::context::QueryContext;
use crate::spill::{SpilledSlot, read_spill, write_spill};

/// Blocking waits are sliced to keep cancellation responsive.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Default cache capacity when settings do not override it.
pub const DEFAULT_CACHE_CAPACITY_BYTES: u64 = 256 * 1024 * 1024;

/// Default fuse threshold for concatenating caches.
pub const DEFAULT_CONCAT_THRESHOLD_BYTES: u64 = 32 * 1024 * 1024;

/// Cache variant with its numeric parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    /// Plain bounded FIFO.
    Simple,
    /// Fuses arriving batches into the tail slot up to a byte threshold.
    Concatenating {
        /// Maximum fused slot size in bytes.
        threshold_bytes: u64,
    },
    /// Round-robins arriving batches into `num_queues` sub-queues.
    ForEach {
        /// Number of sub-queues.
        num_queues: usize,
    },
}

/// Settings describing the cache an edge creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    /// Cache variant.
    pub kind: CacheKind,
    /// Byte capacity bounding queued batches.
    pub capacity_bytes: u64,
}

impl CacheSettings {
    /// Simple cache with the default capacity.
    pub fn simple() -> Self {
        Self {
            kind: CacheKind::Simple,
            capacity_bytes: DEFAULT_CACHE_CAPACITY_BYTES,
        }
    }

    /// Concatenating cache with the default capacity and threshold.
    pub fn concatenating() -> Self {
        Self {
            kind: CacheKind::Concatenating {
                threshold_bytes: DEFAULT_CONCAT_THRESHOLD_BYTES,
            },
            capacity_bytes: DEFAULT_CACHE_CAPACITY_BYTES,
        }
    }

    /// For-each cache with `num_queues` sub-queues.
    pub fn for_each(num_queues: usize) -> Self {
        Self {
            kind: CacheKind::ForEach {
                num_queues: num_queues.max(1),
            },
            capacity_bytes: DEFAULT_CACHE_CAPACITY_BYTES,
        }
    }

    /// Override the byte capacity.
    pub fn with_capacity(mut self, capacity_bytes: u64) -> Self {
        self.capacity_bytes = capacity_bytes.max(1);
        self
    }
}

/// In-memory byte estimate of one batch.
pub fn batch_bytes(batch: &RecordBatch) -> u64 {
    batch.get_array_memory_size() as u64
}

enum CacheSlot {
    Batch(RecordBatch),
    Concat {
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
        bytes: u64,
    },
    Spilled(SpilledSlot),
}

impl CacheSlot {
    fn mem_bytes(&self) -> u64 {
        match self {
            CacheSlot::Batch(b) => batch_bytes(b),
            CacheSlot::Concat { bytes, .. } => *bytes,
            CacheSlot::Spilled(_) => 0,
        }
    }
}

struct CacheState {
    queues: Vec<VecDeque<CacheSlot>>,
    next_queue: usize,
    bytes_queued: u64,
    closed: bool,
    paused: bool,
}

/// Bounded FIFO of table batches between two kernels.
pub struct BatchCache {
    name: String,
    ctx: QueryContext,
    settings: CacheSettings,
    state: Mutex<CacheState>,
    changed: Condvar,
    total_rows_put: AtomicU64,
    total_bytes_put: AtomicU64,
    put_waits: AtomicU64,
}

impl BatchCache {
    /// Create a cache named for its producing `(kernel, port)` pair.
    pub fn new(name: impl Into<String>, ctx: QueryContext, settings: CacheSettings) -> Self {
        let num_queues = match settings.kind {
            CacheKind::ForEach { num_queues } => num_queues,
            _ => 1,
        };
        Self {
            name: name.into(),
            ctx,
            settings,
            state: Mutex::new(CacheState {
                queues: (0..num_queues).map(|_| VecDeque::new()).collect(),
                next_queue: 0,
                bytes_queued: 0,
                closed: false,
                paused: false,
            }),
            changed: Condvar::new(),
            total_rows_put: AtomicU64::new(0),
            total_bytes_put: AtomicU64::new(0),
            put_waits: AtomicU64::new(0),
        }
    }

    /// Cache name used in logs and metrics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of sub-queues (1 unless for-each).
    pub fn num_queues(&self) -> usize {
        match self.settings.kind {
            CacheKind::ForEach { num_queues } => num_queues,
            _ => 1,
        }
    }

    /// Enqueue one batch, blocking under backpressure.
    ///
    /// For-each caches round-robin across sub-queues; use [`BatchCache::put_to`]
    /// to address a sub-queue directly.
    pub fn put(&self, batch: RecordBatch) -> Result<()> {
        let queue = {
            let mut state = self.lock_state();
            let queue = state.next_queue;
            state.next_queue = (state.next_queue + 1) % state.queues.len();
            queue
        };
        self.put_to(queue, batch)
    }

    /// Enqueue one batch into a specific sub-queue.
    pub fn put_to(&self, queue: usize, batch: RecordBatch) -> Result<()> {
        let bytes = batch_bytes(&batch);
        let rows = batch.num_rows() as u64;

        let mut state = self.lock_state();
        loop {
            if state.closed {
                return Err(FfrError::Closed);
            }
            if self.ctx.is_cancelled() {
                return Err(FfrError::Cancelled);
            }
            let admit_oversized = state.bytes_queued == 0;
            let fits = state.bytes_queued + bytes <= self.settings.capacity_bytes;
            if !state.paused && (fits || admit_oversized) {
                break;
            }
            self.put_waits.fetch_add(1, Ordering::AcqRel);
            let (guard, _) = self
                .changed
                .wait_timeout(state, WAIT_SLICE)
                .expect("cache poisoned");
            state = guard;
        }

        if queue >= state.queues.len() {
            return Err(FfrError::Kernel {
                kernel_id: ffr_common::KernelId::HEAD,
                reason: format!("cache {} has no sub-queue {queue}", self.name),
            });
        }

        match self.settings.kind {
            CacheKind::Concatenating { threshold_bytes } => {
                let fused = match state.queues[queue].back_mut() {
                    Some(CacheSlot::Concat {
                        schema,
                        batches,
                        bytes: slot_bytes,
                    }) if *schema == batch.schema() && *slot_bytes + bytes <= threshold_bytes => {
                        batches.push(batch.clone());
                        *slot_bytes += bytes;
                        true
                    }
                    _ => false,
                };
                if !fused {
                    state.queues[queue].push_back(CacheSlot::Concat {
                        schema: batch.schema(),
                        batches: vec![batch],
                        bytes,
                    });
                }
            }
            _ => state.queues[queue].push_back(CacheSlot::Batch(batch)),
        }

        state.bytes_queued += bytes;
        self.total_rows_put.fetch_add(rows, Ordering::AcqRel);
        self.total_bytes_put.fetch_add(bytes, Ordering::AcqRel);
        self.publish_depth(&state);
        self.changed.notify_all();
        Ok(())
    }

    /// Dequeue the next batch, blocking while empty and not closed.
    ///
    /// Returns `Ok(None)` once the cache is closed and drained, or on
    /// cancellation. The only error path is spill re-materialization.
    pub fn pull(&self) -> Result<Option<RecordBatch>> {
        self.pull_from(0)
    }

    /// Dequeue from one sub-queue of a for-each cache.
    pub fn pull_from(&self, queue: usize) -> Result<Option<RecordBatch>> {
        let slot = {
            let mut state = self.lock_state();
            loop {
                if queue >= state.queues.len() {
                    return Ok(None);
                }
                if let Some(slot) = state.queues[queue].pop_front() {
                    state.bytes_queued -= slot.mem_bytes();
                    self.publish_depth(&state);
                    self.changed.notify_all();
                    break slot;
                }
                if state.closed || self.ctx.is_cancelled() {
                    return Ok(None);
                }
                let (guard, _) = self
                    .changed
                    .wait_timeout(state, WAIT_SLICE)
                    .expect("cache poisoned");
                state = guard;
            }
        };
        self.materialize(slot).map(Some)
    }

    /// Non-blocking dequeue.
    pub fn try_pull(&self) -> Result<Option<RecordBatch>> {
        let slot = {
            let mut state = self.lock_state();
            match state.queues[0].pop_front() {
                Some(slot) => {
                    state.bytes_queued -= slot.mem_bytes();
                    self.publish_depth(&state);
                    self.changed.notify_all();
                    slot
                }
                None => return Ok(None),
            }
        };
        self.materialize(slot).map(Some)
    }

    fn materialize(&self, slot: CacheSlot) -> Result<RecordBatch> {
        match slot {
            CacheSlot::Batch(batch) => Ok(batch),
            CacheSlot::Concat {
                schema, batches, ..
            } => {
                if batches.len() == 1 {
                    Ok(batches.into_iter().next().expect("single batch"))
                } else {
                    concat_batches(&schema, &batches).map_err(|e| FfrError::Kernel {
                        kernel_id: ffr_common::KernelId::HEAD,
                        reason: format!("cache {} concat failed: {e}", self.name),
                    })
                }
            }
            CacheSlot::Spilled(spilled) => {
                let batches = read_spill(&spilled.path)?;
                let schema = batches
                    .first()
                    .map(|b| b.schema())
                    .ok_or_else(|| FfrError::Kernel {
                        kernel_id: ffr_common::KernelId::HEAD,
                        reason: format!("spill file for cache {} was empty", self.name),
                    })?;
                if batches.len() == 1 {
                    Ok(batches.into_iter().next().expect("single batch"))
                } else {
                    concat_batches(&schema, &batches).map_err(|e| FfrError::Kernel {
                        kernel_id: ffr_common::KernelId::HEAD,
                        reason: format!("spill concat failed: {e}"),
                    })
                }
            }
        }
    }

    /// Close the cache; idempotent, wakes all waiters.
    pub fn close(&self) {
        let mut state = self.lock_state();
        if !state.closed {
            state.closed = true;
            debug!(cache = %self.name, "cache closed");
        }
        self.changed.notify_all();
    }

    /// Returns whether the cache was closed.
    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// Block until the cache is closed and fully drained.
    pub fn wait_until_finished(&self) {
        let mut state = self.lock_state();
        loop {
            let drained = state.queues.iter().all(VecDeque::is_empty);
            if (state.closed && drained) || self.ctx.is_cancelled() {
                return;
            }
            let (guard, _) = self
                .changed
                .wait_timeout(state, WAIT_SLICE)
                .expect("cache poisoned");
            state = guard;
        }
    }

    /// Rows put into this cache so far (running estimate for progress).
    pub fn estimated_rows(&self) -> u64 {
        self.total_rows_put.load(Ordering::Acquire)
    }

    /// Total bytes put into this cache so far.
    pub fn total_bytes_put(&self) -> u64 {
        self.total_bytes_put.load(Ordering::Acquire)
    }

    /// Bytes currently held in memory by queued slots.
    pub fn bytes_in_flight(&self) -> u64 {
        self.lock_state().bytes_queued
    }

    /// Batches currently queued across sub-queues.
    pub fn batches_queued(&self) -> u64 {
        self.lock_state()
            .queues
            .iter()
            .map(|q| q.len() as u64)
            .sum()
    }

    /// Times a producer blocked in `put` (observability for backpressure).
    pub fn put_wait_count(&self) -> u64 {
        self.put_waits.load(Ordering::Acquire)
    }

    /// Block producers until [`BatchCache::resume`]; monitor-only throttle.
    pub fn pause(&self) {
        self.lock_state().paused = true;
    }

    /// Release a [`BatchCache::pause`] throttle.
    pub fn resume(&self) {
        let mut state = self.lock_state();
        state.paused = false;
        self.changed.notify_all();
    }

    /// Returns whether producers are currently throttled.
    pub fn is_paused(&self) -> bool {
        self.lock_state().paused
    }

    /// Spill oldest in-memory slots until at least `target_bytes` are freed.
    ///
    /// Monitor-only. IO happens under the cache lock so FIFO positions are
    /// preserved; producers blocked meanwhile are exactly the ones being
    /// relieved.
    pub fn spill_oldest(&self, spill_dir: &Path, target_bytes: u64) -> Result<u64> {
        let mut state = self.lock_state();
        let mut freed = 0u64;
        let num_queues = state.queues.len();
        'queues: for queue in 0..num_queues {
            for slot in state.queues[queue].iter_mut() {
                if freed >= target_bytes {
                    break 'queues;
                }
                let mem = slot.mem_bytes();
                if mem == 0 {
                    continue;
                }
                let batches = match slot {
                    CacheSlot::Batch(b) => std::slice::from_ref(b).to_vec(),
                    CacheSlot::Concat { batches, .. } => batches.clone(),
                    CacheSlot::Spilled(_) => continue,
                };
                let spilled = write_spill(spill_dir, self.ctx.token(), &batches, mem)?;
                *slot = CacheSlot::Spilled(spilled);
                freed += mem;
            }
        }
        state.bytes_queued -= freed;
        self.publish_depth(&state);
        self.changed.notify_all();
        Ok(freed)
    }

    fn publish_depth(&self, state: &CacheState) {
        let batches = state.queues.iter().map(|q| q.len() as u64).sum();
        global_metrics().set_cache_depth(
            &self.ctx.token().to_string(),
            &self.name,
            state.bytes_queued,
            batches,
        );
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().expect("cache poisoned")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    use arrow::array::{Array, Int64Array};
    use arrow_schema::{DataType, Field, Schema};
    use ffr_common::ContextToken;

    use super::*;

    fn test_ctx() -> QueryContext {
        QueryContext::single_node(ContextToken(99), HashMap::new())
    }

    fn batch_of(values: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).expect("batch")
    }

    fn column_values(batch: &RecordBatch) -> Vec<i64> {
        batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int column")
            .values()
            .to_vec()
    }

    #[test]
    fn preserves_fifo_order() {
        let cache = BatchCache::new("t", test_ctx(), CacheSettings::simple());
        for i in 0..10 {
            cache.put(batch_of(vec![i])).expect("put");
        }
        cache.close();

        let mut seen = Vec::new();
        while let Some(batch) = cache.pull().expect("pull") {
            seen.extend(column_values(&batch));
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn put_after_close_fails_and_pull_drains() {
        let cache = BatchCache::new("t", test_ctx(), CacheSettings::simple());
        cache.put(batch_of(vec![1])).expect("put");
        cache.close();
        cache.close(); // idempotent

        assert!(matches!(
            cache.put(batch_of(vec![2])),
            Err(FfrError::Closed)
        ));
        assert!(cache.pull().expect("pull").is_some());
        assert!(cache.pull().expect("pull").is_none());
    }

    #[test]
    fn backpressure_blocks_producer_until_consumed() {
        let small = batch_of(vec![1, 2, 3]);
        let capacity = batch_bytes(&small) * 2;
        let cache = Arc::new(BatchCache::new(
            "t",
            test_ctx(),
            CacheSettings::simple().with_capacity(capacity),
        ));

        let producer_cache = Arc::clone(&cache);
        let producer = std::thread::spawn(move || {
            for i in 0..20 {
                producer_cache.put(batch_of(vec![i, i, i])).expect("put");
            }
            producer_cache.close();
        });

        let mut pulled = 0;
        while let Some(_batch) = cache.pull().expect("pull") {
            pulled += 1;
            std::thread::sleep(Duration::from_millis(2));
        }
        producer.join().expect("producer");

        assert_eq!(pulled, 20);
        assert!(cache.put_wait_count() > 0);
    }

    #[test]
    fn concatenating_cache_fuses_small_batches() {
        let cache = BatchCache::new("t", test_ctx(), CacheSettings::concatenating());
        for i in 0..5 {
            cache.put(batch_of(vec![i])).expect("put");
        }
        cache.close();

        let fused = cache.pull().expect("pull").expect("batch");
        assert_eq!(column_values(&fused), vec![0, 1, 2, 3, 4]);
        assert!(cache.pull().expect("pull").is_none());
    }

    #[test]
    fn for_each_cache_addresses_sub_queues() {
        let cache = BatchCache::new("t", test_ctx(), CacheSettings::for_each(3));
        cache.put_to(2, batch_of(vec![22])).expect("put");
        cache.put_to(0, batch_of(vec![0])).expect("put");
        cache.close();

        assert_eq!(
            column_values(&cache.pull_from(2).expect("pull").expect("batch")),
            vec![22]
        );
        assert_eq!(
            column_values(&cache.pull_from(0).expect("pull").expect("batch")),
            vec![0]
        );
        assert!(cache.pull_from(1).expect("pull").is_none());
    }

    #[test]
    fn spill_oldest_frees_capacity_and_pull_rematerializes() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("ffr_cache_spill_{nanos}"));

        let cache = BatchCache::new("t", test_ctx(), CacheSettings::simple());
        cache.put(batch_of(vec![7, 8, 9])).expect("put");
        cache.put(batch_of(vec![10])).expect("put");
        let before = cache.bytes_in_flight();

        let freed = cache.spill_oldest(&dir, 1).expect("spill");
        assert!(freed > 0);
        assert_eq!(cache.bytes_in_flight(), before - freed);

        cache.close();
        let first = cache.pull().expect("pull").expect("batch");
        assert_eq!(column_values(&first), vec![7, 8, 9]);
        let second = cache.pull().expect("pull").expect("batch");
        assert_eq!(column_values(&second), vec![10]);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn cancellation_unblocks_waiters() {
        let ctx = test_ctx();
        let cache = Arc::new(BatchCache::new("t", ctx.clone(), CacheSettings::simple()));

        let puller_cache = Arc::clone(&cache);
        let puller = std::thread::spawn(move || puller_cache.pull().expect("pull"));

        std::thread::sleep(Duration::from_millis(20));
        ctx.cancel();
        let got = puller.join().expect("join");
        assert!(got.is_none());
    }
}
