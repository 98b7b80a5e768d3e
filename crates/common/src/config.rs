use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Option-map key controlling the kernel worker-pool size.
pub const MAX_KERNEL_RUN_THREADS: &str = "MAX_KERNEL_RUN_THREADS";
/// Option-map key controlling the target order-by partition size in bytes.
pub const NUM_BYTES_PER_ORDER_BY_PARTITION: &str = "NUM_BYTES_PER_ORDER_BY_PARTITION";
/// Option-map key capping order-by partitions per node.
pub const MAX_NUM_ORDER_BY_PARTITIONS_PER_NODE: &str = "MAX_NUM_ORDER_BY_PARTITIONS_PER_NODE";
/// Option-map key for the memory-monitor sampling period in milliseconds.
pub const MEMORY_MONITOR_PERIOD_MS: &str = "MEMORY_MONITOR_PERIOD_MS";
/// Option-map key for the monitor's low-water free ratio.
pub const MEMORY_MONITOR_LOW_WATER: &str = "MEMORY_MONITOR_LOW_WATER";
/// Option-map key for the monitor's high-water free ratio.
pub const MEMORY_MONITOR_HIGH_WATER: &str = "MEMORY_MONITOR_HIGH_WATER";
/// Option-map key for the per-message transport timeout in milliseconds.
pub const TRANSPORT_MESSAGE_TIMEOUT_MS: &str = "TRANSPORT_MESSAGE_TIMEOUT_MS";
/// Option-map key for the pool memory limit backing the monitor's free ratio.
pub const POOL_MEMORY_BYTES: &str = "POOL_MEMORY_BYTES";
/// Option-map key for the spill directory.
pub const SPILL_DIR: &str = "SPILL_DIR";

/// Engine/runtime configuration shared across graph, monitor, and transport.
///
/// Every field has a counterpart key in the per-query string option map; a
/// query's map overrides the engine defaults via [`EngineConfig::with_options`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker-pool size for kernel run loops.
    pub max_kernel_run_threads: usize,
    /// Target bytes per order-by range partition.
    pub num_bytes_per_order_by_partition: u64,
    /// Cap on order-by partitions per node.
    pub max_num_order_by_partitions_per_node: usize,
    /// Memory monitor sampling period in milliseconds.
    pub memory_monitor_period_ms: u64,
    /// Free-ratio low-water mark below which the monitor spills/pauses.
    pub memory_monitor_low_water: f64,
    /// Free-ratio high-water mark at which paused producers resume.
    pub memory_monitor_high_water: f64,
    /// Per-message transport timeout in milliseconds.
    pub transport_message_timeout_ms: u64,
    /// Directory used for spill files.
    pub spill_dir: String,
    /// Pool memory limit in bytes used to derive the free ratio.
    pub pool_memory_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_kernel_run_threads: 16,
            num_bytes_per_order_by_partition: 400_000_000,
            max_num_order_by_partitions_per_node: 8,
            memory_monitor_period_ms: 50,
            memory_monitor_low_water: 0.25,
            memory_monitor_high_water: 0.5,
            transport_message_timeout_ms: 5 * 60 * 1000,
            spill_dir: "./ffr_spill".to_string(),
            pool_memory_bytes: 4 * 1024 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    /// Overlay recognized keys from a per-query option map onto this config.
    ///
    /// Unknown keys are ignored. Malformed values keep the current setting
    /// and log a warning, matching the permissive behavior of the option map
    /// contract (string values, best-effort parsing).
    pub fn with_options(mut self, options: &HashMap<String, String>) -> Self {
        parse_into(options, MAX_KERNEL_RUN_THREADS, &mut self.max_kernel_run_threads);
        parse_into(
            options,
            NUM_BYTES_PER_ORDER_BY_PARTITION,
            &mut self.num_bytes_per_order_by_partition,
        );
        parse_into(
            options,
            MAX_NUM_ORDER_BY_PARTITIONS_PER_NODE,
            &mut self.max_num_order_by_partitions_per_node,
        );
        parse_into(options, MEMORY_MONITOR_PERIOD_MS, &mut self.memory_monitor_period_ms);
        parse_into(options, MEMORY_MONITOR_LOW_WATER, &mut self.memory_monitor_low_water);
        parse_into(options, MEMORY_MONITOR_HIGH_WATER, &mut self.memory_monitor_high_water);
        parse_into(
            options,
            TRANSPORT_MESSAGE_TIMEOUT_MS,
            &mut self.transport_message_timeout_ms,
        );
        parse_into(options, POOL_MEMORY_BYTES, &mut self.pool_memory_bytes);
        if let Some(dir) = options.get(SPILL_DIR) {
            self.spill_dir = dir.clone();
        }
        self
    }

    /// Flatten the effective settings into `key: value; ` pairs for query logs.
    pub fn describe(&self) -> String {
        format!(
            "{MAX_KERNEL_RUN_THREADS}: {}; {NUM_BYTES_PER_ORDER_BY_PARTITION}: {}; \
             {MAX_NUM_ORDER_BY_PARTITIONS_PER_NODE}: {}; {MEMORY_MONITOR_PERIOD_MS}: {}; \
             {TRANSPORT_MESSAGE_TIMEOUT_MS}: {}; ",
            self.max_kernel_run_threads,
            self.num_bytes_per_order_by_partition,
            self.max_num_order_by_partitions_per_node,
            self.memory_monitor_period_ms,
            self.transport_message_timeout_ms,
        )
    }
}

fn parse_into<T: std::str::FromStr>(
    options: &HashMap<String, String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(raw) = options.get(key) {
        match raw.parse::<T>() {
            Ok(v) => *slot = v,
            Err(_) => warn!(key, value = %raw, "ignoring malformed config option"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_override_defaults_and_ignore_garbage() {
        let mut options = HashMap::new();
        options.insert(MAX_KERNEL_RUN_THREADS.to_string(), "4".to_string());
        options.insert(NUM_BYTES_PER_ORDER_BY_PARTITION.to_string(), "1024".to_string());
        options.insert(MEMORY_MONITOR_PERIOD_MS.to_string(), "not-a-number".to_string());

        let config = EngineConfig::default().with_options(&options);
        assert_eq!(config.max_kernel_run_threads, 4);
        assert_eq!(config.num_bytes_per_order_by_partition, 1024);
        assert_eq!(config.memory_monitor_period_ms, 50);
    }
}
