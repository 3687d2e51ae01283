//! Prometheus metrics for the sync fabric
//!
//! The value types only carry state; names and help text live with the
//! standard set and the exposition helpers. Sink traffic is partitioned
//! by kind, and the sync-latency histogram is bucketed around the
//! record-lock retry budget (100 ms steps up to the 3.2 s give-up
//! point) rather than generic RPC bounds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

/// Monotonically increasing count
#[derive(Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Point-in-time level (readers on this process, leader flag, queue
/// depth)
#[derive(Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub const fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
        }
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Bucket bounds for the per-row sync path. The 0.1/0.2/0.4 steps track
/// record-lock retry rounds; 3.2 s is the full retry budget; anything
/// past that is a stuck sink.
pub const SYNC_BUCKETS: &[f64] = &[0.001, 0.005, 0.025, 0.1, 0.2, 0.4, 0.8, 1.6, 3.2, 10.0];

/// Latency distribution over fixed bucket bounds
pub struct Histogram {
    bounds: &'static [f64],
    buckets: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: &'static [f64]) -> Self {
        Self {
            bounds,
            buckets: bounds.iter().map(|_| AtomicU64::new(0)).collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, seconds: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((seconds * 1_000_000.0) as u64, Ordering::Relaxed);

        for (bound, bucket) in self.bounds.iter().zip(&self.buckets) {
            if seconds <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Records the time elapsed since `started`
    pub fn observe_since(&self, started: Instant) {
        self.observe(started.elapsed().as_secs_f64());
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Counter partitioned by a low-cardinality kind label (sink kinds,
/// reader kinds)
#[derive(Default)]
pub struct KindCounter {
    shards: RwLock<HashMap<String, u64>>,
}

impl KindCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, kind: &str) {
        let mut shards = self.shards.write();
        *shards.entry(kind.to_string()).or_insert(0) += 1;
    }

    pub fn get(&self, kind: &str) -> u64 {
        self.shards.read().get(kind).copied().unwrap_or(0)
    }

    /// Sorted (kind, count) pairs for rendering
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut pairs: Vec<(String, u64)> = self
            .shards
            .read()
            .iter()
            .map(|(kind, count)| (kind.clone(), *count))
            .collect();
        pairs.sort();
        pairs
    }
}

fn render_counter(out: &mut String, name: &str, help: &str, value: u64) {
    out.push_str(&format!(
        "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
    ));
}

fn render_gauge(out: &mut String, name: &str, help: &str, value: i64) {
    out.push_str(&format!(
        "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n"
    ));
}

fn render_kind_counter(out: &mut String, name: &str, help: &str, counter: &KindCounter) {
    out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} counter\n"));
    for (kind, count) in counter.snapshot() {
        out.push_str(&format!("{name}{{kind=\"{kind}\"}} {count}\n"));
    }
}

fn render_histogram(out: &mut String, name: &str, help: &str, histogram: &Histogram) {
    out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} histogram\n"));
    for (bound, bucket) in histogram.bounds.iter().zip(&histogram.buckets) {
        out.push_str(&format!(
            "{name}_bucket{{le=\"{bound}\"}} {}\n",
            bucket.load(Ordering::Relaxed)
        ));
    }
    let sum = histogram.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
    out.push_str(&format!("{name}_sum {sum}\n"));
    out.push_str(&format!("{name}_count {}\n", histogram.count()));
}

/// Standard Porter metrics
pub mod standard {
    use super::*;
    use std::sync::LazyLock;

    pub static EVENTS_RECEIVED: Counter = Counter::new();
    pub static EVENTS_ACKED: Counter = Counter::new();
    pub static TASKS_SUBMITTED: Counter = Counter::new();
    pub static TASK_FAILURES: Counter = Counter::new();
    pub static LOCK_FAILURES: Counter = Counter::new();
    pub static WORKER_PANICS: Counter = Counter::new();

    pub static ACTIVE_READERS: Gauge = Gauge::new();
    pub static IS_LEADER: Gauge = Gauge::new();

    /// Successful sink calls, partitioned by sink kind
    pub static SINK_WRITES: LazyLock<KindCounter> = LazyLock::new(KindCounter::new);

    pub static SYNC_DURATION: LazyLock<Histogram> =
        LazyLock::new(|| Histogram::new(SYNC_BUCKETS));
}

/// Renders every standard metric in Prometheus exposition format
pub fn gather_system_metrics() -> String {
    use standard::*;

    let mut out = String::new();

    render_counter(
        &mut out,
        "porter_events_total",
        "Change events read from sources",
        EVENTS_RECEIVED.get(),
    );
    render_counter(
        &mut out,
        "porter_events_acked_total",
        "Change events acknowledged upstream",
        EVENTS_ACKED.get(),
    );
    render_counter(
        &mut out,
        "porter_tasks_total",
        "Per-row tasks submitted to the worker pool",
        TASKS_SUBMITTED.get(),
    );
    render_counter(
        &mut out,
        "porter_task_failures_total",
        "Per-row tasks that recorded a batch error",
        TASK_FAILURES.get(),
    );
    render_counter(
        &mut out,
        "porter_lock_failures_total",
        "Record mutex acquisitions abandoned after the retry budget",
        LOCK_FAILURES.get(),
    );
    render_counter(
        &mut out,
        "porter_worker_panics_total",
        "Supervised worker panics",
        WORKER_PANICS.get(),
    );

    render_gauge(
        &mut out,
        "porter_active_readers",
        "Readers currently assigned to this process",
        ACTIVE_READERS.get(),
    );
    render_gauge(
        &mut out,
        "porter_is_leader",
        "1 when this process holds the leader node",
        IS_LEADER.get(),
    );

    render_kind_counter(
        &mut out,
        "porter_sink_writes_total",
        "Successful sink calls by sink kind",
        &SINK_WRITES,
    );

    render_histogram(
        &mut out,
        "porter_sync_duration_seconds",
        "Per-row sync latency",
        &SYNC_DURATION,
    );

    out
}
