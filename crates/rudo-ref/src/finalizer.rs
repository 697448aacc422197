//! Legacy finalization.
//!
//! Objects registered with a [`Finalizer`] are kept alive by it until they are
//! reachable through nothing else. The collector then hands them to the
//! finalizer thread, which calls [`Finalize::finalize`] exactly once and
//! releases the last handle.
//!
//! Prefer [`Cleaner`](crate::Cleaner) for new code: finalization keeps the
//! object alive for an extra collection and shares one thread between every
//! finalizable type.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use sys_thread::ThreadPriority;

use crate::collector::Collector;
use crate::context::{spawn_worker, worker_body, RefConfig};
use crate::error::RefError;
use crate::metrics::RefMetrics;
use crate::queue::ReferenceQueue;
use crate::reference::{Reference, ReferenceKind, Referent};
use crate::sync::{LockGuard, LockOrder};

/// Types with a finalization hook.
pub trait Finalize: Send + Sync + 'static {
    /// Called once, on a finalizer thread, after the object became
    /// unreachable. Panics are swallowed.
    fn finalize(&self);
}

struct FinalizerShared {
    collector: Arc<dyn Collector>,
    metrics: Arc<RefMetrics>,
    queue: ReferenceQueue<dyn Finalize>,
    awaiting: Mutex<HashMap<usize, Reference<dyn Finalize>>>,
    secondary_name: String,
}

impl FinalizerShared {
    fn drain(&self) {
        while let Some(reference) = self.queue.remove(None) {
            self.run_finalizer(&reference);
        }
    }

    fn drain_available(&self) -> usize {
        let mut finalized = 0;
        while let Some(reference) = self.queue.poll() {
            if self.run_finalizer(&reference) {
                finalized += 1;
            }
        }
        finalized
    }

    /// Returns `false` if another thread already began finalizing the object.
    fn run_finalizer(&self, reference: &Reference<dyn Finalize>) -> bool {
        let Some(object) = reference.begin_finalization() else {
            return false;
        };
        self.unlink(address_of(&object), reference);

        let panicked = catch_unwind(AssertUnwindSafe(move || {
            object.finalize();
            drop(object);
        }))
        .is_err();
        self.metrics.record_finalizer(panicked);
        true
    }

    fn unlink(&self, address: usize, reference: &Reference<dyn Finalize>) {
        let removed = {
            let mut awaiting = self.awaiting.lock();
            let _order = LockGuard::new(LockOrder::Registry);
            match awaiting.get(&address) {
                Some(linked) if Reference::ptr_eq(linked, reference) => awaiting.remove(&address),
                _ => None,
            }
        };
        drop(removed);
    }
}

fn address_of<T: ?Sized>(object: &Arc<T>) -> usize {
    Arc::as_ptr(object).cast::<()>().addr()
}

/// The finalizer of a [`RefContext`](crate::RefContext).
///
/// Obtained through [`RefContext::finalizer`](crate::RefContext::finalizer),
/// which starts the finalizer thread on first use.
///
/// # Example
///
/// ```
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::sync::Arc;
/// use rudo_ref::{Finalize, ManualCollector, RefContext};
///
/// static CLOSED: AtomicBool = AtomicBool::new(false);
///
/// struct Handle;
///
/// impl Finalize for Handle {
///     fn finalize(&self) {
///         CLOSED.store(true, Ordering::SeqCst);
///     }
/// }
///
/// let collector = Arc::new(ManualCollector::new());
/// let ctx = RefContext::new(collector.clone()).unwrap();
/// let handle = ctx.finalizer().unwrap().allocate(Handle);
///
/// drop(handle);
/// collector.collect();
/// ctx.run_pending_finalizations().unwrap();
/// # for _ in 0..500 {
/// #     if CLOSED.load(Ordering::SeqCst) { break; }
/// #     std::thread::sleep(std::time::Duration::from_millis(10));
/// # }
/// assert!(CLOSED.load(Ordering::SeqCst));
/// ```
#[derive(Clone)]
pub struct Finalizer {
    shared: Arc<FinalizerShared>,
}

impl Finalizer {
    pub(crate) fn start(
        collector: Arc<dyn Collector>,
        metrics: Arc<RefMetrics>,
        config: &RefConfig,
    ) -> Result<Self, RefError> {
        let shared = Arc::new(FinalizerShared {
            collector,
            metrics,
            queue: ReferenceQueue::new(),
            awaiting: Mutex::new(HashMap::new()),
            secondary_name: config.thread_name("secondary-finalizer"),
        });

        let priority = config.raise_priority.then_some(ThreadPriority::High);
        // Detached; exits once the owning context closes the queue.
        spawn_worker(config.thread_name("finalizer"), priority, {
            let shared = Arc::clone(&shared);
            move || shared.drain()
        })?;

        Ok(Self { shared })
    }

    /// Registers `object` for finalization.
    ///
    /// The finalizer keeps its own handle to `object` until
    /// [`Finalize::finalize`] has run.
    ///
    /// # Errors
    ///
    /// Returns [`RefError::AlreadyRegistered`] if `object` is already awaiting
    /// finalization.
    pub fn register<T: Finalize>(&self, object: &Arc<T>) -> Result<(), RefError> {
        let address = address_of(object);
        let owned: Arc<dyn Finalize> = object.clone();
        let reference = Reference::build(
            ReferenceKind::Final,
            Referent::Owned(owned),
            Some(&self.shared.queue),
            None,
        );

        {
            let mut awaiting = self.shared.awaiting.lock();
            let _order = LockGuard::new(LockOrder::Registry);
            if awaiting.contains_key(&address) {
                return Err(RefError::AlreadyRegistered { address });
            }
            awaiting.insert(address, reference.clone());
        }
        reference.track(&self.shared.collector);
        Ok(())
    }

    /// Moves `value` into a new `Arc` and registers it.
    pub fn allocate<T: Finalize>(&self, value: T) -> Arc<T> {
        let object = Arc::new(value);
        let registered = self.register(&object);
        debug_assert!(registered.is_ok(), "a fresh allocation is never registered");
        object
    }

    /// Number of registered objects whose finalization has not begun.
    #[must_use]
    pub fn awaiting_len(&self) -> usize {
        self.shared.awaiting.lock().len()
    }

    /// Finalizes every object already delivered to the finalizer, on a
    /// short-lived secondary thread, and waits for it. Returns how many
    /// objects that thread finalized.
    ///
    /// The finalizer thread keeps running concurrently; objects it picks up
    /// are not counted.
    ///
    /// # Errors
    ///
    /// Returns [`RefError::Spawn`] if the secondary thread cannot be started.
    pub fn run_pending_finalizations(&self) -> Result<usize, RefError> {
        if self.shared.queue.is_empty() {
            return Ok(0);
        }

        let name = self.shared.secondary_name.clone();
        let shared = Arc::clone(&self.shared);
        let secondary = thread::Builder::new()
            .name(name.clone())
            .spawn(worker_body(name.clone(), None, move || shared.drain_available()))
            .map_err(|err| RefError::spawn(name, err))?;
        let finalized = secondary.join().unwrap_or(0);

        #[cfg(feature = "tracing")]
        crate::tracing::log_finalization_pass(finalized);

        Ok(finalized)
    }

    /// Returns `true` if both handles refer to the same finalizer.
    #[must_use]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.shared, &other.shared)
    }

    pub(crate) fn shutdown(&self) {
        self.shared.queue.close();
    }
}

impl fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Finalizer")
            .field("awaiting", &self.awaiting_len())
            .field("queued", &self.shared.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::collector::ManualCollector;
    use crate::RefContext;

    struct Counted(Arc<AtomicUsize>);

    impl Finalize for Counted {
        fn finalize(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_register_twice_is_rejected() {
        let ctx = RefContext::new(Arc::new(ManualCollector::new())).unwrap();
        let finalizer = ctx.finalizer().unwrap();
        let object = Arc::new(Counted(Arc::new(AtomicUsize::new(0))));

        finalizer.register(&object).unwrap();
        let err = finalizer.register(&object).unwrap_err();
        assert!(matches!(err, RefError::AlreadyRegistered { .. }));
        assert_eq!(finalizer.awaiting_len(), 1);
    }

    #[test]
    fn test_finalizer_keeps_object_alive() {
        let ctx = RefContext::new(Arc::new(ManualCollector::new())).unwrap();
        let finalizer = ctx.finalizer().unwrap();
        let object = finalizer.allocate(Counted(Arc::new(AtomicUsize::new(0))));
        assert_eq!(Arc::strong_count(&object), 2);
    }

    #[test]
    fn test_run_finalizer_only_once() {
        let ctx = RefContext::new(Arc::new(ManualCollector::new())).unwrap();
        let finalizer = ctx.finalizer().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let object = finalizer.allocate(Counted(count.clone()));

        let reference = finalizer.shared.awaiting.lock().values().next().cloned().unwrap();
        drop(object);
        assert!(finalizer.shared.run_finalizer(&reference));
        assert!(!finalizer.shared.run_finalizer(&reference));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(finalizer.awaiting_len(), 0);
    }

    #[test]
    fn test_run_pending_on_empty_queue() {
        let ctx = RefContext::new(Arc::new(ManualCollector::new())).unwrap();
        let finalizer = ctx.finalizer().unwrap();
        assert_eq!(finalizer.run_pending_finalizations().unwrap(), 0);
    }
}
