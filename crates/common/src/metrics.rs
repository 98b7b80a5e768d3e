use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};

/// Process-wide metrics registry for cache, kernel, spill, and transport activity.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    cache_bytes: GaugeVec,
    cache_batches: GaugeVec,
    kernel_batches_completed: CounterVec,
    spill_bytes: CounterVec,
    transport_frames_sent: CounterVec,
    transport_frames_received: CounterVec,
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let cache_bytes = GaugeVec::new(
            Opts::new("ffr_cache_bytes", "Bytes currently queued in a cache"),
            &["query_id", "cache"],
        )
        .expect("cache_bytes opts");
        let cache_batches = GaugeVec::new(
            Opts::new("ffr_cache_batches", "Batches currently queued in a cache"),
            &["query_id", "cache"],
        )
        .expect("cache_batches opts");
        let kernel_batches_completed = CounterVec::new(
            Opts::new(
                "ffr_kernel_batches_completed",
                "Batches a kernel has finished processing",
            ),
            &["query_id", "kernel"],
        )
        .expect("kernel_batches opts");
        let spill_bytes = CounterVec::new(
            Opts::new("ffr_spill_bytes", "Bytes written to spill files"),
            &["query_id"],
        )
        .expect("spill_bytes opts");
        let transport_frames_sent = CounterVec::new(
            Opts::new("ffr_transport_frames_sent", "Message frames posted to peers"),
            &["peer"],
        )
        .expect("frames_sent opts");
        let transport_frames_received = CounterVec::new(
            Opts::new(
                "ffr_transport_frames_received",
                "Message frames received from peers",
            ),
            &["peer"],
        )
        .expect("frames_received opts");

        registry.register(Box::new(cache_bytes.clone())).expect("register");
        registry.register(Box::new(cache_batches.clone())).expect("register");
        registry
            .register(Box::new(kernel_batches_completed.clone()))
            .expect("register");
        registry.register(Box::new(spill_bytes.clone())).expect("register");
        registry
            .register(Box::new(transport_frames_sent.clone()))
            .expect("register");
        registry
            .register(Box::new(transport_frames_received.clone()))
            .expect("register");

        Self {
            registry,
            cache_bytes,
            cache_batches,
            kernel_batches_completed,
            spill_bytes,
            transport_frames_sent,
            transport_frames_received,
        }
    }
}

impl MetricsRegistry {
    /// Create a fresh registry (tests); production code uses [`global_metrics`].
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Record the current depth of one cache.
    pub fn set_cache_depth(&self, query_id: &str, cache: &str, bytes: u64, batches: u64) {
        self.inner
            .cache_bytes
            .with_label_values(&[query_id, cache])
            .set(bytes as f64);
        self.inner
            .cache_batches
            .with_label_values(&[query_id, cache])
            .set(batches as f64);
    }

    /// Count one batch completed by a kernel.
    pub fn inc_kernel_batches(&self, query_id: &str, kernel: &str) {
        self.inner
            .kernel_batches_completed
            .with_label_values(&[query_id, kernel])
            .inc();
    }

    /// Count bytes written to spill files.
    pub fn add_spill_bytes(&self, query_id: &str, bytes: u64) {
        self.inner
            .spill_bytes
            .with_label_values(&[query_id])
            .inc_by(bytes as f64);
    }

    /// Count frames posted to / received from a peer.
    pub fn add_transport_frames(&self, peer: &str, sent: u64, received: u64) {
        self.inner
            .transport_frames_sent
            .with_label_values(&[peer])
            .inc_by(sent as f64);
        self.inner
            .transport_frames_received
            .with_label_values(&[peer])
            .inc_by(received as f64);
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&metric_families, &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// Shared process-wide metrics registry.
pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_recorded_samples() {
        let metrics = MetricsRegistry::new();
        metrics.set_cache_depth("7", "3_default", 4096, 2);
        metrics.inc_kernel_batches("7", "Sort");
        let text = metrics.render();
        assert!(text.contains("ffr_cache_bytes"));
        assert!(text.contains("ffr_kernel_batches_completed"));
    }
}
