//! Memory monitor: samples cache pressure, commands spill, throttles
//! producers, and drives the progress callback.
//!
//! The monitor is the only component allowed to command spill. Policy per
//! sample: when the free ratio falls under the low-water mark, the largest
//! cache spills its oldest slots toward the high-water mark; if memory is
//! still tight afterwards, the highest-throughput producer cache is paused
//! until the free ratio recovers past the high-water mark. Two consecutive
//! pressure samples with nothing left to spill are fatal.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ffr_common::{FfrError, ResourceKind};
use tracing::{debug, warn};

use crate::cache::BatchCache;
use crate::context::QueryContext;
use crate::graph::Graph;

/// Minimum spacing between progress callback invocations.
const PROGRESS_PERIOD: Duration = Duration::from_millis(250);

/// Background monitor thread for one running graph.
pub struct MemoryMonitor {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MemoryMonitor {
    /// Start the monitor over a running graph.
    pub(crate) fn start(graph: Weak<Graph>, ctx: QueryContext) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name(format!("ffr-memmon-{}", ctx.token()))
            .spawn(move || monitor_loop(graph, ctx, stop_flag))
            .ok();
        Self { stop, handle }
    }

    /// Stop and join the monitor thread.
    pub(crate) fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn monitor_loop(graph: Weak<Graph>, ctx: QueryContext, stop: Arc<AtomicBool>) {
    let period = Duration::from_millis(ctx.config().memory_monitor_period_ms.max(1));
    let low_water = ctx.config().memory_monitor_low_water;
    let high_water = ctx.config().memory_monitor_high_water;
    let pool_bytes = ctx.config().pool_memory_bytes.max(1);
    let spill_dir = PathBuf::from(&ctx.config().spill_dir);

    let mut last_progress = Instant::now() - PROGRESS_PERIOD;
    let mut paused: Vec<Arc<BatchCache>> = Vec::new();
    let mut pressure_strikes = 0u32;

    while !stop.load(Ordering::Acquire) {
        std::thread::sleep(period.min(Duration::from_millis(50)));
        let Some(graph) = graph.upgrade() else {
            break;
        };

        if last_progress.elapsed() >= PROGRESS_PERIOD {
            graph.invoke_progress();
            last_progress = Instant::now();
        }

        let used: u64 = graph.caches().iter().map(|c| c.bytes_in_flight()).sum();
        let free_ratio = 1.0 - used as f64 / pool_bytes as f64;

        if free_ratio < low_water {
            debug!(
                query_id = ctx.token().0,
                used, free_ratio, "memory pressure detected"
            );

            // Spill the largest cache down toward the high-water mark.
            let high_water_used = ((1.0 - high_water) * pool_bytes as f64) as u64;
            let target = used.saturating_sub(high_water_used).max(1);
            let largest = graph
                .caches()
                .iter()
                .max_by_key(|c| c.bytes_in_flight())
                .cloned();

            let freed = match largest {
                Some(cache) if cache.bytes_in_flight() > 0 => {
                    match cache.spill_oldest(&spill_dir, target) {
                        Ok(freed) => freed,
                        Err(error) => {
                            graph.store_error(error);
                            graph.cancel();
                            break;
                        }
                    }
                }
                _ => 0,
            };

            if freed == 0 {
                pressure_strikes += 1;
                if pressure_strikes >= 2 {
                    graph.store_error(FfrError::ResourceExhausted {
                        kind: ResourceKind::Memory,
                        detail: "pool pressure persisted with nothing left to spill".to_string(),
                    });
                    graph.cancel();
                    break;
                }
            } else {
                pressure_strikes = 0;
            }

            // Still tight after spilling: throttle the loudest producer.
            let used_after: u64 = graph.caches().iter().map(|c| c.bytes_in_flight()).sum();
            if 1.0 - used_after as f64 / (pool_bytes as f64) < low_water {
                let loudest = graph
                    .caches()
                    .iter()
                    .filter(|c| !c.is_paused())
                    .max_by_key(|c| c.total_bytes_put())
                    .cloned();
                if let Some(cache) = loudest {
                    warn!(
                        query_id = ctx.token().0,
                        cache = cache.name(),
                        "pausing producer under memory pressure"
                    );
                    cache.pause();
                    paused.push(cache);
                }
            }
        } else if free_ratio >= high_water && !paused.is_empty() {
            for cache in paused.drain(..) {
                debug!(
                    query_id = ctx.token().0,
                    cache = cache.name(),
                    "resuming paused producer"
                );
                cache.resume();
            }
        }
    }

    // The graph may outlive this loop; leave nothing paused behind.
    for cache in paused {
        cache.resume();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

    use arrow::array::{Array, Int64Array};
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema};
    use ffr_common::{ContextToken, KernelId};
    use ffr_storage::MemBatchProvider;

    use super::*;
    use crate::cache::CacheSettings;
    use crate::kernel::{Kernel, KernelCore, KernelVariant, PORT_DEFAULT};
    use crate::kernels::output::OutputKernel;
    use crate::kernels::scan::TableScanKernel;

    #[test]
    fn monitor_spills_the_largest_cache_under_pressure() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let spill_dir = std::env::temp_dir().join(format!("ffr_monitor_test_{nanos}"));

        let mut options = HashMap::new();
        options.insert("POOL_MEMORY_BYTES".to_string(), "200000".to_string());
        options.insert("MEMORY_MONITOR_PERIOD_MS".to_string(), "10".to_string());
        options.insert(
            "SPILL_DIR".to_string(),
            spill_dir.to_string_lossy().to_string(),
        );
        let ctx = QueryContext::single_node(ContextToken(55), options);

        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let provider = Arc::new(MemBatchProvider::single(schema.clone(), Vec::new()));

        let mut graph = Graph::new(ctx.clone());
        let scan = graph
            .add_node(Kernel::new(
                KernelCore::new(KernelId(0), "TableScan", ctx.clone()),
                KernelVariant::TableScan(TableScanKernel::new(provider)),
            ))
            .expect("scan node");
        let output = graph
            .add_node(Kernel::new(
                KernelCore::new(KernelId(1), "OutputKernel", ctx.clone()),
                KernelVariant::Output(OutputKernel::new()),
            ))
            .expect("output node");
        graph
            .add_edge(scan, output, PORT_DEFAULT, PORT_DEFAULT, CacheSettings::simple())
            .expect("edge");
        let graph = Arc::new(graph);

        // Fill well past the 75%-used low-water mark of the 200 KB pool.
        let cache = graph
            .get_kernel_output_cache(scan, PORT_DEFAULT)
            .expect("cache");
        for i in 0..8i64 {
            let batch = RecordBatch::try_new(
                schema.clone(),
                vec![Arc::new(Int64Array::from(
                    (i * 10_000..(i + 1) * 10_000).collect::<Vec<_>>(),
                ))],
            )
            .expect("batch");
            cache.put(batch).expect("put");
        }
        let before = cache.bytes_in_flight();
        assert!(before > 150_000);

        let monitor = MemoryMonitor::start(Arc::downgrade(&graph), ctx);
        let deadline = Instant::now() + Duration::from_secs(5);
        while cache.bytes_in_flight() >= before && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        monitor.stop();

        assert!(
            cache.bytes_in_flight() < before,
            "monitor never spilled: {} bytes still resident",
            cache.bytes_in_flight()
        );

        // Spilled slots re-materialize transparently, FIFO intact.
        cache.close();
        let mut next = 0i64;
        while let Some(batch) = cache.pull().expect("pull") {
            let values = batch
                .column(0)
                .as_any()
                .downcast_ref::<Int64Array>()
                .expect("ints")
                .values()
                .to_vec();
            assert_eq!(values[0], next);
            next = values[values.len() - 1] + 1;
        }
        assert_eq!(next, 80_000);

        let _ = std::fs::remove_dir_all(spill_dir);
    }
}
