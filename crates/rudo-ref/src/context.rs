//! The process-wide reference processing context.
//!
//! A [`RefContext`] bundles the collector, the reference handler thread, the
//! lazily started finalizer and the metrics every other part reports to. It
//! is constructed explicitly and passed to whatever creates references; one
//! context may additionally be installed as the process-wide
//! [`global`](RefContext::global) instance.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use sys_thread::ThreadPriority;

use crate::collector::Collector;
use crate::error::RefError;
use crate::finalizer::Finalizer;
use crate::handler::{DispatchStrategy, InlineCleanup, ReferenceHandler};
use crate::metrics::RefMetrics;
use crate::sync::{enter_thread_shutdown, LockGuard, LockOrder};

/// Prefix of every thread name spawned by a context.
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "rudo";

/// Configuration for a [`RefContext`].
#[derive(Clone)]
pub struct RefConfig {
    /// Where the handler delivers cleaner-owned references.
    pub dispatch: Arc<dyn DispatchStrategy>,
    /// Prefix of spawned thread names, e.g. `rudo-reference-handler`.
    pub thread_name_prefix: String,
    /// Ask the OS to raise the handler and finalizer thread priority.
    pub raise_priority: bool,
}

impl Default for RefConfig {
    fn default() -> Self {
        Self {
            dispatch: Arc::new(InlineCleanup),
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_owned(),
            raise_priority: true,
        }
    }
}

impl RefConfig {
    /// Replaces the dispatch strategy.
    #[must_use]
    pub fn with_dispatch(mut self, dispatch: impl DispatchStrategy) -> Self {
        self.dispatch = Arc::new(dispatch);
        self
    }

    /// Replaces the thread name prefix.
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Enables or disables priority elevation.
    #[must_use]
    pub const fn with_raise_priority(mut self, raise: bool) -> Self {
        self.raise_priority = raise;
        self
    }

    pub(crate) fn thread_name(&self, role: &str) -> String {
        format!("{}-{role}", self.thread_name_prefix)
    }
}

impl fmt::Debug for RefConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefConfig")
            .field("thread_name_prefix", &self.thread_name_prefix)
            .field("raise_priority", &self.raise_priority)
            .finish_non_exhaustive()
    }
}

/// Wraps a worker body with priority setup, lifecycle events and lock-order
/// teardown.
#[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
pub(crate) fn worker_body<R>(
    name: String,
    priority: Option<ThreadPriority>,
    body: impl FnOnce() -> R + Send + 'static,
) -> impl FnOnce() -> R + Send + 'static {
    move || {
        if let Some(priority) = priority {
            if let Err(err) = sys_thread::set_current_thread_priority(priority) {
                #[cfg(feature = "tracing")]
                crate::tracing::log_priority_refused(&name, &err);
            }
        }
        #[cfg(feature = "tracing")]
        crate::tracing::log_thread_start(&name);

        let result = body();

        #[cfg(feature = "tracing")]
        crate::tracing::log_thread_exit(&name);
        enter_thread_shutdown();
        result
    }
}

pub(crate) fn spawn_worker(
    name: String,
    priority: Option<ThreadPriority>,
    body: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>, RefError> {
    thread::Builder::new()
        .name(name.clone())
        .spawn(worker_body(name.clone(), priority, body))
        .map_err(|err| RefError::spawn(name, err))
}

struct ContextInner {
    handler: ReferenceHandler,
    finalizer: Mutex<Option<Finalizer>>,
    collector: Arc<dyn Collector>,
    metrics: Arc<RefMetrics>,
    config: RefConfig,
    next_cleaner_id: AtomicU64,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if let Some(finalizer) = self.finalizer.get_mut().take() {
            finalizer.shutdown();
        }
    }
}

static GLOBAL: OnceLock<RefContext> = OnceLock::new();

/// Shared state for reference processing: collector, handler thread,
/// finalizer and metrics.
///
/// Cloning yields another handle to the same context. When the last handle
/// is dropped the handler thread is stopped and joined, and the finalizer
/// thread is told to exit once its queue is drained.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use rudo_ref::{ManualCollector, RefConfig, RefContext, QueueOnly};
///
/// let collector = Arc::new(ManualCollector::new());
/// let config = RefConfig::default()
///     .with_dispatch(QueueOnly)
///     .with_thread_name_prefix("app");
/// let ctx = RefContext::with_config(collector, config).unwrap();
/// assert!(!ctx.wait_for_reference_processing());
/// ```
#[derive(Clone)]
pub struct RefContext {
    inner: Arc<ContextInner>,
}

impl RefContext {
    /// Creates a context with the default configuration and starts its
    /// reference handler.
    ///
    /// # Errors
    ///
    /// Returns [`RefError::Spawn`] if the handler thread cannot be started.
    pub fn new(collector: Arc<dyn Collector>) -> Result<Self, RefError> {
        Self::with_config(collector, RefConfig::default())
    }

    /// Creates a context with `config` and starts its reference handler.
    ///
    /// # Errors
    ///
    /// Returns [`RefError::Spawn`] if the handler thread cannot be started.
    pub fn with_config(collector: Arc<dyn Collector>, config: RefConfig) -> Result<Self, RefError> {
        let metrics = Arc::new(RefMetrics::new());
        let handler =
            ReferenceHandler::start(Arc::clone(&collector), Arc::clone(&metrics), &config)?;
        Ok(Self {
            inner: Arc::new(ContextInner {
                handler,
                finalizer: Mutex::new(None),
                collector,
                metrics,
                config,
                next_cleaner_id: AtomicU64::new(0),
            }),
        })
    }

    /// Installs this context as the process-wide instance.
    ///
    /// The installed context lives, and its handler runs, until the process
    /// exits.
    ///
    /// # Errors
    ///
    /// Returns [`RefError::AlreadyInstalled`] if a context was installed
    /// before; `self` is dropped in that case.
    pub fn install(self) -> Result<&'static Self, RefError> {
        GLOBAL.set(self).map_err(|_| RefError::AlreadyInstalled)?;
        GLOBAL.get().ok_or(RefError::AlreadyInstalled)
    }

    /// The installed process-wide context, if any.
    #[must_use]
    pub fn global() -> Option<&'static Self> {
        GLOBAL.get()
    }

    /// The collector feeding this context.
    #[must_use]
    pub fn collector(&self) -> &Arc<dyn Collector> {
        &self.inner.collector
    }

    /// The configuration this context was built with.
    #[must_use]
    pub fn config(&self) -> &RefConfig {
        &self.inner.config
    }

    /// Counters updated by this context's threads.
    #[must_use]
    pub fn metrics(&self) -> &RefMetrics {
        &self.inner.metrics
    }

    /// Blocks until the handler has processed everything the collector has
    /// published so far. Returns `true` if it had to wait.
    ///
    /// Called from a cleaner action running on the handler thread, this
    /// returns `false` immediately instead of waiting for its own round.
    pub fn wait_for_reference_processing(&self) -> bool {
        self.inner.handler.wait_for_reference_processing()
    }

    /// The finalizer of this context, started on first use.
    ///
    /// # Errors
    ///
    /// Returns [`RefError::Spawn`] if the finalizer thread cannot be started.
    pub fn finalizer(&self) -> Result<Finalizer, RefError> {
        let mut slot = self.inner.finalizer.lock();
        let _order = LockGuard::new(LockOrder::Registry);
        if let Some(finalizer) = slot.as_ref() {
            return Ok(finalizer.clone());
        }
        let finalizer = Finalizer::start(
            Arc::clone(&self.inner.collector),
            Arc::clone(&self.inner.metrics),
            &self.inner.config,
        )?;
        *slot = Some(finalizer.clone());
        Ok(finalizer)
    }

    /// Waits for pending references to be processed, then finalizes every
    /// object already handed to the finalizer on a separate short-lived
    /// thread, returning how many were finalized.
    ///
    /// Returns `Ok(0)` without spawning anything if the finalizer was never
    /// used. Safe to call from a cleaner action on the handler thread; the
    /// wait for reference processing is skipped there.
    ///
    /// # Errors
    ///
    /// Returns [`RefError::Spawn`] if the secondary thread cannot be started.
    pub fn run_pending_finalizations(&self) -> Result<usize, RefError> {
        self.wait_for_reference_processing();
        let finalizer = self.inner.finalizer.lock().clone();
        finalizer.map_or(Ok(0), |finalizer| finalizer.run_pending_finalizations())
    }

    pub(crate) fn shared_metrics(&self) -> Arc<RefMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    pub(crate) fn next_cleaner_id(&self) -> u64 {
        self.inner.next_cleaner_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl fmt::Debug for RefContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefContext")
            .field("handler", &self.inner.handler)
            .field("config", &self.inner.config)
            .field("stats", &self.inner.metrics.snapshot())
            .finish_non_exhaustive()
    }
}
