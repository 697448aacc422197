//! Cleaners: one-shot actions run after an object becomes unreachable.
//!
//! A [`Cleaner`] owns a registry of phantom references, a private
//! [`ReferenceQueue`] and a worker thread draining it. Each
//! [`register`](Cleaner::register) call returns a [`Cleanable`] whose action
//! runs exactly once: either explicitly through [`Cleanable::invoke`], or
//! after the collector finds the object unreachable. Whichever comes first
//! unlinks the registration; the other becomes a no-op.
//!
//! Actions must not capture the object they clean up after, or it never
//! becomes unreachable.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::collector::Collector;
use crate::context::{worker_body, RefContext};
use crate::error::RefError;
use crate::metrics::RefMetrics;
use crate::queue::ReferenceQueue;
use crate::reference::{Cleanup, Reference, ReferenceKind, Referent};
use crate::sync::{LockGuard, LockOrder};

type Tracked = dyn Any + Send + Sync;
type Action = Box<dyn FnOnce() + Send>;

/// Starts the worker thread of a [`Cleaner`].
pub trait ThreadFactory {
    /// Runs `task` on a new thread named `name`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be created.
    fn new_thread(
        &self,
        name: String,
        task: Box<dyn FnOnce() + Send>,
    ) -> io::Result<JoinHandle<()>>;
}

/// Spawns plain `std` threads.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultThreadFactory;

impl ThreadFactory for DefaultThreadFactory {
    fn new_thread(
        &self,
        name: String,
        task: Box<dyn FnOnce() + Send>,
    ) -> io::Result<JoinHandle<()>> {
        thread::Builder::new().name(name).spawn(task)
    }
}

struct Entries {
    live: HashMap<u64, Reference<Tracked>>,
    abandoned: bool,
}

struct Registry {
    id: u64,
    entries: Mutex<Entries>,
    queue: ReferenceQueue<Tracked>,
    metrics: Arc<RefMetrics>,
    next_key: AtomicU64,
}

impl Registry {
    fn link(&self, key: u64, reference: Reference<Tracked>) {
        let mut entries = self.entries.lock();
        let _order = LockGuard::new(LockOrder::Registry);
        entries.live.insert(key, reference);
    }

    /// Removes a registration. Only the caller that gets `Some` may run the
    /// action.
    fn unlink(&self, key: u64) -> Option<Reference<Tracked>> {
        let (reference, close) = {
            let mut entries = self.entries.lock();
            let _order = LockGuard::new(LockOrder::Registry);
            let reference = entries.live.remove(&key);
            (reference, entries.abandoned && entries.live.is_empty())
        };
        if close {
            self.queue.close();
        }
        reference
    }

    fn abandon(&self) {
        let close = {
            let mut entries = self.entries.lock();
            let _order = LockGuard::new(LockOrder::Registry);
            entries.abandoned = true;
            entries.live.is_empty()
        };
        if close {
            self.queue.close();
        }
    }

    fn len(&self) -> usize {
        self.entries.lock().live.len()
    }

    fn drain(&self) {
        while let Some(reference) = self.queue.remove(None) {
            reference.run_cleanup();
        }
    }
}

struct CleanupEntry {
    key: u64,
    registry: Weak<Registry>,
    action: Mutex<Option<Action>>,
}

impl Cleanup for CleanupEntry {
    fn clean(&self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let Some(reference) = registry.unlink(self.key) else {
            return false;
        };
        reference.clear();
        drop(reference);

        let Some(action) = self.action.lock().take() else {
            return false;
        };
        let panicked = catch_unwind(AssertUnwindSafe(action)).is_err();
        registry.metrics.record_action(panicked);
        true
    }
}

/// Handle to one registration with a [`Cleaner`].
///
/// Dropping a `Cleanable` does not cancel the registration.
#[derive(Clone)]
pub struct Cleanable {
    entry: Arc<CleanupEntry>,
}

impl Cleanable {
    /// Runs the action now if it has not run yet, and unregisters it.
    ///
    /// Safe to call from any number of threads, concurrently with collector
    /// delivery; the action runs at most once overall. A panic in the action
    /// is swallowed.
    pub fn invoke(&self) {
        self.entry.clean();
    }
}

impl fmt::Debug for Cleanable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cleanable")
            .field("key", &self.entry.key)
            .field("pending", &self.entry.action.lock().is_some())
            .finish()
    }
}

struct CleanerOwner {
    registry: Arc<Registry>,
    collector: Arc<dyn Collector>,
}

impl Drop for CleanerOwner {
    fn drop(&mut self) {
        self.registry.abandon();
    }
}

/// A registry of cleanup actions with its own worker thread.
///
/// Cloning yields another handle to the same cleaner. Once every handle is
/// dropped the cleaner accepts no new registrations, and its thread exits as
/// soon as every outstanding action has run.
///
/// # Example
///
/// ```
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::sync::Arc;
/// use rudo_ref::{Cleaner, ManualCollector, RefContext};
///
/// let collector = Arc::new(ManualCollector::new());
/// let ctx = RefContext::new(collector.clone()).unwrap();
/// let cleaner = Cleaner::create(&ctx).unwrap();
///
/// let closed = Arc::new(AtomicBool::new(false));
/// let resource = Arc::new(vec![0u8; 16]);
/// let cleanable = cleaner.register(&resource, {
///     let closed = closed.clone();
///     move || closed.store(true, Ordering::SeqCst)
/// });
///
/// cleanable.invoke();
/// assert!(closed.load(Ordering::SeqCst));
/// assert!(cleaner.is_empty());
/// ```
#[derive(Clone)]
pub struct Cleaner {
    owner: Arc<CleanerOwner>,
}

impl Cleaner {
    /// Creates a cleaner whose worker is a plain `std` thread.
    ///
    /// # Errors
    ///
    /// Returns [`RefError::Spawn`] if the worker thread cannot be started.
    pub fn create(ctx: &RefContext) -> Result<Self, RefError> {
        Self::with_thread_factory(ctx, &DefaultThreadFactory)
    }

    /// Creates a cleaner whose worker is started by `factory`.
    ///
    /// # Errors
    ///
    /// Returns [`RefError::Spawn`] if `factory` fails.
    pub fn with_thread_factory(
        ctx: &RefContext,
        factory: &dyn ThreadFactory,
    ) -> Result<Self, RefError> {
        let id = ctx.next_cleaner_id();
        let registry = Arc::new(Registry {
            id,
            entries: Mutex::new(Entries {
                live: HashMap::new(),
                abandoned: false,
            }),
            queue: ReferenceQueue::new(),
            metrics: ctx.shared_metrics(),
            next_key: AtomicU64::new(0),
        });

        let name = ctx.config().thread_name(&format!("cleaner-{id}"));
        let task = worker_body(name.clone(), None, {
            let registry = Arc::clone(&registry);
            move || registry.drain()
        });
        // The worker detaches; it stops on its own once the registry empties.
        factory
            .new_thread(name.clone(), Box::new(task))
            .map_err(|err| RefError::spawn(name, err))?;

        Ok(Self {
            owner: Arc::new(CleanerOwner {
                registry,
                collector: Arc::clone(ctx.collector()),
            }),
        })
    }

    /// Registers `action` to run once `object` becomes unreachable.
    pub fn register<T, F>(&self, object: &Arc<T>, action: F) -> Cleanable
    where
        T: Send + Sync + 'static,
        F: FnOnce() + Send + 'static,
    {
        let weak = Arc::downgrade(object);
        self.link(weak, Box::new(action))
    }

    /// Like [`register`](Self::register), for an object only held weakly.
    ///
    /// # Errors
    ///
    /// Returns [`RefError::DeadReferent`] if the object is already gone; the
    /// action is dropped without running.
    pub fn try_register<T, F>(&self, object: &Weak<T>, action: F) -> Result<Cleanable, RefError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() + Send + 'static,
    {
        if object.strong_count() == 0 {
            return Err(RefError::DeadReferent);
        }
        Ok(self.link(object.clone(), Box::new(action)))
    }

    /// Number of registrations whose action has not been claimed yet.
    #[must_use]
    pub fn len(&self) -> usize {
        self.owner.registry.len()
    }

    /// Returns `true` if no registration is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn link(&self, object: Weak<Tracked>, action: Action) -> Cleanable {
        let registry = &self.owner.registry;
        let key = registry.next_key.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(CleanupEntry {
            key,
            registry: Arc::downgrade(registry),
            action: Mutex::new(Some(action)),
        });
        let cleanup: Arc<dyn Cleanup> = entry.clone();
        let reference = Reference::build(
            ReferenceKind::Phantom,
            Referent::Weak(object),
            Some(&registry.queue),
            Some(cleanup),
        );
        // Linked before the collector can see it, so delivery always finds it.
        registry.link(key, reference.clone());
        reference.track(&self.owner.collector);
        Cleanable { entry }
    }
}

impl fmt::Debug for Cleaner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cleaner")
            .field("id", &self.owner.registry.id)
            .field("registered", &self.len())
            .finish()
    }
}
