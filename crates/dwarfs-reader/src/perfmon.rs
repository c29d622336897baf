//! Named performance counters and timers.
//!
//! A monitor is created with the set of component names it tracks. Asking
//! for a timer or counter of any other component yields `None`, so untracked
//! call sites cost one `Option` check and nothing is ever allocated for them.
//!
//! One monitor may be shared by several filesystem handles; all recording is
//! done with atomics.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

#[derive(Debug)]
struct TimerStats {
    samples: AtomicU64,
    total_ns: AtomicU64,
    min_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl TimerStats {
    fn new() -> Self {
        Self {
            samples: AtomicU64::new(0),
            total_ns: AtomicU64::new(0),
            min_ns: AtomicU64::new(u64::MAX),
            max_ns: AtomicU64::new(0),
        }
    }

    fn record(&self, elapsed: Duration) {
        let ns = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(ns, Ordering::Relaxed);
        self.min_ns.fetch_min(ns, Ordering::Relaxed);
        self.max_ns.fetch_max(ns, Ordering::Relaxed);
    }
}

/// Handle to one named timer.
#[derive(Debug, Clone)]
pub struct PerfTimer {
    stats: Arc<TimerStats>,
}

impl PerfTimer {
    /// Start timing; the elapsed time is recorded when the guard drops.
    pub fn section(&self) -> PerfSection<'_> {
        PerfSection {
            timer: self,
            start: Instant::now(),
        }
    }

    pub fn record(&self, elapsed: Duration) {
        self.stats.record(elapsed);
    }

    pub fn samples(&self) -> u64 {
        self.stats.samples.load(Ordering::Relaxed)
    }
}

/// Timing guard returned by [`PerfTimer::section`].
pub struct PerfSection<'a> {
    timer: &'a PerfTimer,
    start: Instant,
}

impl Drop for PerfSection<'_> {
    fn drop(&mut self) {
        self.timer.record(self.start.elapsed());
    }
}

/// Start a section on an optional timer.
pub fn section(timer: &Option<PerfTimer>) -> Option<PerfSection<'_>> {
    timer.as_ref().map(PerfTimer::section)
}

/// Handle to one named counter.
#[derive(Debug, Clone)]
pub struct PerfCounter {
    value: Arc<AtomicU64>,
}

impl PerfCounter {
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct Component {
    timers: RwLock<BTreeMap<String, Arc<TimerStats>>>,
    counters: RwLock<BTreeMap<String, Arc<AtomicU64>>>,
}

/// Set of tracked components, each holding named timers and counters.
#[derive(Debug)]
pub struct PerformanceMonitor {
    components: BTreeMap<String, Component>,
}

impl PerformanceMonitor {
    /// Create a monitor tracking exactly `names`.
    pub fn create<I, S>(names: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let components = names
            .into_iter()
            .map(|n| (n.into(), Component::default()))
            .collect();
        Arc::new(Self { components })
    }

    /// Convenience for a `HashSet` of names.
    pub fn from_set(names: &HashSet<String>) -> Arc<Self> {
        Self::create(names.iter().cloned())
    }

    pub fn is_enabled(&self, component: &str) -> bool {
        self.components.contains_key(component)
    }

    /// Tracked component names, sorted.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.components.keys().map(String::as_str)
    }

    /// Get or register a timer. `None` if `component` is not tracked.
    pub fn timer(&self, component: &str, name: &str) -> Option<PerfTimer> {
        let comp = self.components.get(component)?;
        if let Some(stats) = comp.timers.read().get(name) {
            return Some(PerfTimer {
                stats: Arc::clone(stats),
            });
        }
        let mut timers = comp.timers.write();
        let stats = timers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(TimerStats::new()));
        Some(PerfTimer {
            stats: Arc::clone(stats),
        })
    }

    /// Get or register a counter. `None` if `component` is not tracked.
    pub fn counter(&self, component: &str, name: &str) -> Option<PerfCounter> {
        let comp = self.components.get(component)?;
        let mut counters = comp.counters.write();
        let value = counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)));
        Some(PerfCounter {
            value: Arc::clone(value),
        })
    }

    /// Render every timer with samples and every non-zero counter.
    ///
    /// Reading does not reset anything.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for (cname, comp) in &self.components {
            for (tname, stats) in comp.timers.read().iter() {
                let samples = stats.samples.load(Ordering::Relaxed);
                if samples == 0 {
                    continue;
                }
                let total = stats.total_ns.load(Ordering::Relaxed);
                let _ = writeln!(
                    out,
                    "[{cname}.{tname}] samples: {samples}, overall: {}, avg: {}, min: {}, max: {}",
                    fmt_ns(total),
                    fmt_ns(total / samples),
                    fmt_ns(stats.min_ns.load(Ordering::Relaxed)),
                    fmt_ns(stats.max_ns.load(Ordering::Relaxed)),
                );
            }
            for (name, value) in comp.counters.read().iter() {
                let count = value.load(Ordering::Relaxed);
                if count > 0 {
                    let _ = writeln!(out, "[{cname}.{name}] count: {count}");
                }
            }
        }
        out
    }
}

fn fmt_ns(ns: u64) -> String {
    match ns {
        0..1_000 => format!("{ns}ns"),
        1_000..1_000_000 => format!("{:.3}us", ns as f64 / 1e3),
        1_000_000..1_000_000_000 => format!("{:.3}ms", ns as f64 / 1e6),
        _ => format!("{:.3}s", ns as f64 / 1e9),
    }
}
