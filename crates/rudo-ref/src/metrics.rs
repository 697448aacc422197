//! Reference processing metrics and statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative counters for one [`RefContext`](crate::RefContext).
///
/// Counters are updated with relaxed atomics by the handler, cleaner and
/// finalizer threads; read them through [`RefMetrics::snapshot`].
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use rudo_ref::{ManualCollector, RefContext};
///
/// let ctx = RefContext::new(Arc::new(ManualCollector::new())).unwrap();
/// let stats = ctx.metrics().snapshot();
/// assert_eq!(stats.actions_run, 0);
/// ```
#[derive(Debug, Default)]
pub struct RefMetrics {
    handler_rounds: AtomicU64,
    references_processed: AtomicU64,
    references_enqueued: AtomicU64,
    inline_cleanups: AtomicU64,
    actions_run: AtomicU64,
    actions_panicked: AtomicU64,
    finalizers_run: AtomicU64,
    finalizers_panicked: AtomicU64,
}

/// Point-in-time copy of [`RefMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefStats {
    /// Completed reference handler rounds, including empty ones.
    pub handler_rounds: u64,
    /// References taken from the collector's pending list.
    pub references_processed: u64,
    /// Pending references appended to a reference queue by the handler.
    pub references_enqueued: u64,
    /// Cleaner actions the handler ran on its own thread.
    pub inline_cleanups: u64,
    /// Cleaner actions that ran, on any thread.
    pub actions_run: u64,
    /// Cleaner actions that panicked.
    pub actions_panicked: u64,
    /// `Finalize::finalize` calls made.
    pub finalizers_run: u64,
    /// `Finalize::finalize` calls that panicked.
    pub finalizers_panicked: u64,
}

impl RefMetrics {
    /// Create a new `RefMetrics` with all counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            handler_rounds: AtomicU64::new(0),
            references_processed: AtomicU64::new(0),
            references_enqueued: AtomicU64::new(0),
            inline_cleanups: AtomicU64::new(0),
            actions_run: AtomicU64::new(0),
            actions_panicked: AtomicU64::new(0),
            finalizers_run: AtomicU64::new(0),
            finalizers_panicked: AtomicU64::new(0),
        }
    }

    /// Copy all counters.
    #[must_use]
    pub fn snapshot(&self) -> RefStats {
        RefStats {
            handler_rounds: self.handler_rounds.load(Ordering::Relaxed),
            references_processed: self.references_processed.load(Ordering::Relaxed),
            references_enqueued: self.references_enqueued.load(Ordering::Relaxed),
            inline_cleanups: self.inline_cleanups.load(Ordering::Relaxed),
            actions_run: self.actions_run.load(Ordering::Relaxed),
            actions_panicked: self.actions_panicked.load(Ordering::Relaxed),
            finalizers_run: self.finalizers_run.load(Ordering::Relaxed),
            finalizers_panicked: self.finalizers_panicked.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_round(&self, processed: u64, enqueued: u64, inline: u64) {
        self.handler_rounds.fetch_add(1, Ordering::Relaxed);
        self.references_processed
            .fetch_add(processed, Ordering::Relaxed);
        self.references_enqueued.fetch_add(enqueued, Ordering::Relaxed);
        self.inline_cleanups.fetch_add(inline, Ordering::Relaxed);
    }

    pub(crate) fn record_action(&self, panicked: bool) {
        self.actions_run.fetch_add(1, Ordering::Relaxed);
        if panicked {
            self.actions_panicked.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_finalizer(&self, panicked: bool) {
        self.finalizers_run.fetch_add(1, Ordering::Relaxed);
        if panicked {
            self.finalizers_panicked.fetch_add(1, Ordering::Relaxed);
        }
    }
}
