//! Counters describing what the module database has done so far.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Default)]
pub(crate) struct Counters {
    nodes_live: AtomicU64,
    units_opened: AtomicU64,
    units_closed: AtomicU64,
    sessions_started: AtomicU64,
    tasks_executed: AtomicU64,
    fallbacks: AtomicU64,
    load_failures: AtomicU64,
}

macro_rules! bump {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            #[inline]
            pub(crate) fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl Counters {
    bump! {
        node_created => nodes_live,
        unit_opened => units_opened,
        unit_closed => units_closed,
        session_started => sessions_started,
        task_executed => tasks_executed,
        fallback_taken => fallbacks,
        load_failed => load_failures,
    }

    #[inline]
    pub(crate) fn node_freed(&self) {
        self.nodes_live.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ModuleDbMetrics {
        ModuleDbMetrics {
            nodes_live: self.nodes_live.load(Ordering::Relaxed),
            units_opened: self.units_opened.load(Ordering::Relaxed),
            units_closed: self.units_closed.load(Ordering::Relaxed),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            tasks_executed: self.tasks_executed.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the database counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ModuleDbMetrics {
    /// Nodes whose holder count has not yet reached zero.
    pub nodes_live: u64,
    pub units_opened: u64,
    pub units_closed: u64,
    /// Batches that had to go through the parallel loader.
    pub sessions_started: u64,
    pub tasks_executed: u64,
    pub fallbacks: u64,
    pub load_failures: u64,
}

/// Records a span of time for diagnostic purposes.
#[derive(Debug)]
pub(crate) struct SpanTimer {
    label: &'static str,
    start: Instant,
}

impl SpanTimer {
    pub(crate) fn new(label: &'static str) -> Self {
        Self {
            label,
            start: Instant::now(),
        }
    }

    pub(crate) fn finish(self) -> Duration {
        let duration = self.start.elapsed();
        tracing::trace!(target: "profiling", label = self.label, elapsed = ?duration);
        duration
    }
}
