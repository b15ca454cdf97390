use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Mutex, MutexGuard, OnceLock};

/// Bridge metric names, kept in one place so the hub's `/metrics` output and
/// the tests agree.
pub mod names {
    pub const ENVELOPES_TOTAL: &str = "bridge_envelopes_total";
    pub const CLAIM_REJECTIONS_TOTAL: &str = "bridge_claim_rejections_total";
    pub const INVALID_FRAMES_TOTAL: &str = "bridge_invalid_frames_total";
    pub const DUPLICATES_DROPPED_TOTAL: &str = "bridge_duplicates_dropped_total";
    pub const HANDLER_FAILURES_TOTAL: &str = "bridge_handler_failures_total";
    pub const OUTBOX_ACKS_TOTAL: &str = "outbox_acks_total";
    pub const RECONNECT_ATTEMPTS_TOTAL: &str = "connection_reconnect_attempts_total";
    pub const NODES_ONLINE: &str = "bridge_nodes_online";
    pub const OBSERVERS_ONLINE: &str = "bridge_observers_online";
    pub const DRAIN_DURATION_SECONDS: &str = "outbox_drain_duration_seconds";
}

/// Upper bounds (seconds) shared by every histogram.
const BUCKETS: [f64; 8] = [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

#[derive(Debug, Default)]
struct Histogram {
    /// Per-bucket hits, not cumulative; export sums them up.
    hits: [u64; BUCKETS.len()],
    count: u64,
    sum: f64,
}

impl Histogram {
    fn observe(&mut self, value: f64) {
        if let Some(i) = BUCKETS.iter().position(|le| value <= *le) {
            self.hits[i] += 1;
        }
        self.count += 1;
        self.sum += value;
    }
}

#[derive(Debug, Default)]
struct Registry {
    /// name -> rendered label set -> value
    counters: BTreeMap<String, BTreeMap<String, u64>>,
    gauges: BTreeMap<String, i64>,
    histograms: BTreeMap<String, Histogram>,
}

/// Render `pairs` as a Prometheus label set, sorted by key; empty for none.
fn label_set(pairs: &[(&str, &str)]) -> String {
    if pairs.is_empty() {
        return String::new();
    }
    let mut sorted = pairs.to_vec();
    sorted.sort_by_key(|(k, _)| *k);
    let inner: Vec<String> = sorted.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect();
    format!("{{{}}}", inner.join(","))
}

/// Counters, gauges and latency histograms for the bridge, exported in the
/// Prometheus text format on the hub's `/metrics` route.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    registry: Mutex<Registry>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        *self
            .registry()
            .counters
            .entry(name.to_string())
            .or_default()
            .entry(label_set(labels))
            .or_default() += 1;
    }

    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.registry()
            .counters
            .get(name)
            .and_then(|series| series.get(&label_set(labels)))
            .copied()
            .unwrap_or(0)
    }

    pub fn set_gauge(&self, name: &str, value: i64) {
        self.registry().gauges.insert(name.to_string(), value);
    }

    pub fn get_gauge(&self, name: &str) -> i64 {
        self.registry().gauges.get(name).copied().unwrap_or(0)
    }

    pub fn record_histogram(&self, name: &str, value: f64) {
        self.registry()
            .histograms
            .entry(name.to_string())
            .or_default()
            .observe(value);
    }

    pub fn histogram_count(&self, name: &str) -> u64 {
        self.registry().histograms.get(name).map_or(0, |h| h.count)
    }

    /// Everything recorded so far, in Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let registry = self.registry();
        let mut out = String::new();

        for (name, series) in &registry.counters {
            let _ = writeln!(out, "# TYPE {name} counter");
            for (labels, value) in series {
                let _ = writeln!(out, "{name}{labels} {value}");
            }
        }
        for (name, value) in &registry.gauges {
            let _ = writeln!(out, "# TYPE {name} gauge");
            let _ = writeln!(out, "{name} {value}");
        }
        for (name, h) in &registry.histograms {
            let _ = writeln!(out, "# TYPE {name} histogram");
            let mut cumulative = 0;
            for (le, hits) in BUCKETS.iter().zip(h.hits) {
                cumulative += hits;
                let _ = writeln!(out, "{name}_bucket{{le=\"{le}\"}} {cumulative}");
            }
            let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {}", h.count);
            let _ = writeln!(out, "{name}_sum {}", h.sum);
            let _ = writeln!(out, "{name}_count {}", h.count);
        }
        out
    }
}

/// The process-wide collector the bridge reports into.
pub fn global_metrics() -> &'static MetricsCollector {
    static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
    INSTANCE.get_or_init(MetricsCollector::new)
}
