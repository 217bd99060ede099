//! C7: Metrics & Events.
//!
//! No external metrics registry here; the pool's own `AtomicU64` counters
//! plus a small reservoir histogram are enough for `stats()`, and a
//! `tokio::sync::broadcast` channel carries typed [`Event`]s to anyone
//! listening (a future admin surface, a log sink, a test assertion).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tailwind_pool_proto::{Counters, Event, HistogramSnapshot};
use tokio::sync::broadcast;

const HISTOGRAM_CAPACITY: usize = 512;
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct AtomicCounters {
    compilations_total: AtomicU64,
    compilations_ok: AtomicU64,
    compilations_err: AtomicU64,
    worker_created: AtomicU64,
    worker_reused: AtomicU64,
    worker_evicted: AtomicU64,
    batch_groups: AtomicU64,
    capture_immediate: AtomicU64,
    capture_file_based: AtomicU64,
    capture_preserved_state: AtomicU64,
    capture_forced_regeneration: AtomicU64,
}

impl AtomicCounters {
    fn snapshot(&self) -> Counters {
        Counters {
            compilations_total: self.compilations_total.load(Ordering::Relaxed),
            compilations_ok: self.compilations_ok.load(Ordering::Relaxed),
            compilations_err: self.compilations_err.load(Ordering::Relaxed),
            worker_created: self.worker_created.load(Ordering::Relaxed),
            worker_reused: self.worker_reused.load(Ordering::Relaxed),
            worker_evicted: self.worker_evicted.load(Ordering::Relaxed),
            batch_groups: self.batch_groups.load(Ordering::Relaxed),
            capture_immediate: self.capture_immediate.load(Ordering::Relaxed),
            capture_file_based: self.capture_file_based.load(Ordering::Relaxed),
            capture_preserved_state: self.capture_preserved_state.load(Ordering::Relaxed),
            capture_forced_regeneration: self.capture_forced_regeneration.load(Ordering::Relaxed),
        }
    }
}

/// A fixed-capacity reservoir of observed durations.
///
/// Once full, each new sample evicts a uniformly random existing one
/// (classic reservoir sampling), so `snapshot()` over a long-running pool
/// stays representative instead of drifting to "whatever happened most
/// recently fit in an unbounded Vec."
pub(crate) struct Histogram {
    samples: Mutex<Vec<Duration>>,
    seen: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            samples: Mutex::new(Vec::with_capacity(HISTOGRAM_CAPACITY)),
            seen: AtomicU64::new(0),
        }
    }

    pub(crate) fn record(&self, value: Duration) {
        let n = self.seen.fetch_add(1, Ordering::Relaxed);
        let mut samples = self.samples.lock().expect("histogram mutex poisoned");
        if samples.len() < HISTOGRAM_CAPACITY {
            samples.push(value);
            return;
        }
        // xorshift-lite index pick; doesn't need to be cryptographically
        // random, only roughly uniform over `0..=n`.
        let idx = (splitmix64(n) % (n + 1)) as usize;
        if idx < HISTOGRAM_CAPACITY {
            samples[idx] = value;
        }
    }

    pub(crate) fn snapshot(&self) -> HistogramSnapshot {
        let mut samples = self.samples.lock().expect("histogram mutex poisoned").clone();
        if samples.is_empty() {
            return HistogramSnapshot::default();
        }
        samples.sort_unstable();
        let count = samples.len();
        let pick = |q: f64| samples[((count - 1) as f64 * q).round() as usize];
        HistogramSnapshot {
            count: self.seen.load(Ordering::Relaxed),
            min: samples[0],
            max: samples[count - 1],
            p50: pick(0.50),
            p99: pick(0.99),
        }
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Owns every counter and histogram the pool exposes, plus the broadcast
/// channel events fan out on.
pub struct Metrics {
    counters: AtomicCounters,
    pub(crate) queue_wait: Histogram,
    pub(crate) readiness_wait: Histogram,
    pub(crate) submit_to_output: Histogram,
    pub(crate) total: Histogram,
    events: broadcast::Sender<Event>,
}

impl Metrics {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            counters: AtomicCounters::default(),
            queue_wait: Histogram::new(),
            readiness_wait: Histogram::new(),
            submit_to_output: Histogram::new(),
            total: Histogram::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Best-effort publish: a full or subscriber-less channel never blocks
    /// or fails the caller, it just means nobody was listening.
    pub fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    pub fn inc_compilation(&self, ok: bool) {
        self.counters.compilations_total.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.counters.compilations_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.compilations_err.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_worker_created(&self) {
        self.counters.worker_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_worker_reused(&self) {
        self.counters.worker_reused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_worker_evicted(&self) {
        self.counters.worker_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_batch_group_by(&self, n: u64) {
        self.counters.batch_groups.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_capture(&self, method: tailwind_pool_proto::CaptureMethod) {
        use tailwind_pool_proto::CaptureMethod::*;
        let counter = match method {
            Immediate => &self.counters.capture_immediate,
            FileBased => &self.counters.capture_file_based,
            PreservedState => &self.counters.capture_preserved_state,
            ForcedRegeneration => &self.counters.capture_forced_regeneration,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters_snapshot(&self) -> Counters {
        self.counters.snapshot()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
