//! The reference handler thread.
//!
//! One handler runs per [`RefContext`](crate::RefContext). It sleeps until the
//! collector reports pending references, swaps the whole pending list out,
//! and routes every reference either to its queue or, for cleaner-owned
//! references, straight into the cleanup action.
//!
//! Running cleaner actions inline keeps latency low for anyone waiting on
//! [`wait_for_reference_processing`](crate::RefContext::wait_for_reference_processing),
//! at the price that one slow action delays every other delivery. Use
//! [`QueueOnly`] to send cleaner references through their cleaner's own
//! thread instead.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use sys_thread::ThreadPriority;

use crate::collector::Collector;
use crate::context::{spawn_worker, RefConfig};
use crate::error::RefError;
use crate::metrics::RefMetrics;
use crate::reference::{Delivery, RawReference};
use crate::sync::{LockGuard, LockOrder};

/// Decides where the handler delivers a pending reference.
pub trait DispatchStrategy: Send + Sync + 'static {
    /// Returns `true` to run the reference's cleanup action on the handler
    /// thread. Only consulted for references that carry one.
    fn run_inline(&self, reference: &RawReference) -> bool;
}

/// Runs cleaner actions on the handler thread. The default.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineCleanup;

impl DispatchStrategy for InlineCleanup {
    fn run_inline(&self, _reference: &RawReference) -> bool {
        true
    }
}

/// Delivers every reference through its queue, so cleaner actions run on the
/// owning cleaner's thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct QueueOnly;

impl DispatchStrategy for QueueOnly {
    fn run_inline(&self, _reference: &RawReference) -> bool {
        false
    }
}

struct RoundState {
    processing: bool,
    rounds: u64,
    shutdown: bool,
}

struct HandlerShared {
    collector: Arc<dyn Collector>,
    dispatch: Arc<dyn DispatchStrategy>,
    metrics: Arc<RefMetrics>,
    state: Mutex<RoundState>,
    round_done: Condvar,
}

impl HandlerShared {
    fn run(&self) {
        loop {
            // Read before the shutdown check: an interrupt sent after it still
            // ends the wait below.
            let epoch = self.collector.interrupt_epoch();
            if self.state.lock().shutdown {
                break;
            }
            self.collector.wait_until_pending_list_nonempty(epoch);
            if self.state.lock().shutdown {
                break;
            }
            self.process_pending_references();
        }
    }

    fn process_pending_references(&self) {
        let (pending, _round) = {
            let mut state = self.state.lock();
            let _order = LockGuard::new(LockOrder::Handler);
            state.processing = true;
            (self.collector.take_and_clear_pending_list(), state.rounds + 1)
        };

        #[cfg(feature = "tracing")]
        let _span = crate::tracing::span_handler_round(_round).entered();

        let (mut processed, mut enqueued, mut inline) = (0, 0, 0);
        for reference in pending {
            processed += 1;
            let run_inline = reference.has_cleanup() && self.wants_inline(&reference);
            match reference.process(run_inline) {
                Delivery::Enqueued => enqueued += 1,
                Delivery::Cleaned => inline += 1,
                Delivery::Discarded => {}
            }
        }

        self.metrics.record_round(processed, enqueued, inline);
        #[cfg(feature = "tracing")]
        crate::tracing::log_handler_round(processed, enqueued, inline);

        let mut state = self.state.lock();
        state.processing = false;
        state.rounds += 1;
        self.round_done.notify_all();
    }

    fn wants_inline(&self, reference: &RawReference) -> bool {
        // A misbehaving strategy must not take the handler down.
        catch_unwind(AssertUnwindSafe(|| self.dispatch.run_inline(reference))).unwrap_or(false)
    }
}

/// Owner of the reference handler thread. Dropping it stops and joins the
/// thread.
pub(crate) struct ReferenceHandler {
    shared: Arc<HandlerShared>,
    thread: Option<JoinHandle<()>>,
}

impl ReferenceHandler {
    pub(crate) fn start(
        collector: Arc<dyn Collector>,
        metrics: Arc<RefMetrics>,
        config: &RefConfig,
    ) -> Result<Self, RefError> {
        let shared = Arc::new(HandlerShared {
            collector,
            dispatch: Arc::clone(&config.dispatch),
            metrics,
            state: Mutex::new(RoundState {
                processing: false,
                rounds: 0,
                shutdown: false,
            }),
            round_done: Condvar::new(),
        });

        let priority = config.raise_priority.then_some(ThreadPriority::Highest);
        let thread = spawn_worker(config.thread_name("reference-handler"), priority, {
            let shared = Arc::clone(&shared);
            move || shared.run()
        })?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Blocks while a round is in progress or the collector has pending
    /// references. Returns `true` if it had to wait.
    ///
    /// Returns `false` at once on the handler thread itself, where the round
    /// in progress is the caller's own.
    pub(crate) fn wait_for_reference_processing(&self) -> bool {
        if self.is_current_thread() {
            return false;
        }
        let shared = &self.shared;
        let mut state = shared.state.lock();
        let _order = LockGuard::new(LockOrder::Handler);
        let mut waited = false;
        while !state.shutdown && (state.processing || shared.collector.has_pending_list()) {
            waited = true;
            shared.round_done.wait(&mut state);
        }
        waited
    }

    fn is_current_thread(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| thread.thread().id() == std::thread::current().id())
    }
}

impl Drop for ReferenceHandler {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.round_done.notify_all();
        }
        self.shared.collector.interrupt();
        // The last context handle may be dropped by an inline action.
        if !self.is_current_thread() {
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

impl fmt::Debug for ReferenceHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ReferenceHandler")
            .field("rounds", &state.rounds)
            .field("processing", &state.processing)
            .finish_non_exhaustive()
    }
}
