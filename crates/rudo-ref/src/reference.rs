//! Tracking references and their state machine.
//!
//! A [`Reference`] tracks one `Arc`-managed object without keeping it alive
//! (or, for the finalizer kind, while being its last owner) and moves through
//! two independent axes of state:
//!
//! - **Reachability**: `Active → Pending → Inactive`. Only the collector moves
//!   a reference to `Pending`; `clear()` skips from `Active` straight to
//!   `Inactive`, and `enqueue()` retires from either `Active` or `Pending`.
//!   Nothing comes out of a queue while still `Pending`.
//! - **Queue**: `Registered → Enqueued → Dequeued`, or `Unregistered` for the
//!   whole life of a reference created without a queue.
//!
//! The referent is present exactly while the reference is `Active`. Once it is
//! gone it never comes back.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::collector::Collector;
use crate::error::RefError;
use crate::queue::{QueueInner, ReferenceQueue};
use crate::sync::{LockGuard, LockOrder};
use crate::RefContext;

static NEXT_REFERENCE_ID: AtomicU64 = AtomicU64::new(1);

/// Flavor of a [`Reference`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    /// `get()` returns the referent while it is alive.
    Weak,
    /// `get()` always returns `None`; used purely for post-mortem notification.
    Phantom,
    /// Owns its referent until finalization begins. Internal to the finalizer.
    Final,
}

/// Position on the reachability axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    /// The referent has not been cleared.
    Active,
    /// Discovered by the collector, not yet processed by the handler.
    Pending,
    /// Cleared for good.
    Inactive,
}

/// Position on the queue axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueState {
    /// Created without a queue.
    Unregistered = 0,
    /// Associated with a queue, not yet delivered.
    Registered = 1,
    /// Sitting in its queue.
    Enqueued = 2,
    /// Taken out of its queue. Terminal.
    Dequeued = 3,
}

impl QueueState {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Registered,
            2 => Self::Enqueued,
            3 => Self::Dequeued,
            _ => Self::Unregistered,
        }
    }
}

pub(crate) enum Referent<T: ?Sized> {
    Weak(Weak<T>),
    Owned(Arc<T>),
}

impl<T: ?Sized> Referent<T> {
    /// Weak referents are unreachable once every `Arc` is gone; owned ones once
    /// ours is the last.
    fn is_unreachable(&self) -> bool {
        match self {
            Self::Weak(weak) => weak.strong_count() == 0,
            Self::Owned(arc) => Arc::strong_count(arc) == 1,
        }
    }

    fn upgrade(&self) -> Option<Arc<T>> {
        match self {
            Self::Weak(weak) => weak.upgrade(),
            Self::Owned(arc) => Some(Arc::clone(arc)),
        }
    }

    fn address(&self) -> *const () {
        match self {
            Self::Weak(weak) => weak.as_ptr().cast(),
            Self::Owned(arc) => Arc::as_ptr(arc).cast(),
        }
    }
}

/// One-shot cleanup attached to a reference by a [`Cleaner`](crate::Cleaner).
pub(crate) trait Cleanup: Send + Sync {
    /// Claims and runs the action. Returns `false` if it was already claimed.
    fn clean(&self) -> bool;
}

struct RefState<T: ?Sized> {
    reachability: Reachability,
    referent: Option<Referent<T>>,
}

pub(crate) struct RefCore<T: ?Sized> {
    id: u64,
    kind: ReferenceKind,
    state: Mutex<RefState<T>>,
    queue_state: AtomicU8,
    queue: Option<Weak<QueueInner<T>>>,
    cleanup: Option<Arc<dyn Cleanup>>,
}

impl<T: ?Sized> RefCore<T> {
    /// Empties the referent, leaving `Active` if still there. The referent is
    /// handed back so the caller can drop it outside the lock.
    fn clear_referent(&self) -> Option<Referent<T>> {
        let mut state = self.state.lock();
        let _order = LockGuard::new(LockOrder::Referent);
        if state.reachability == Reachability::Active {
            state.reachability = Reachability::Inactive;
        }
        state.referent.take()
    }

    /// Like `clear_referent`, but also retires a `Pending` reference so it
    /// can be delivered ahead of the handler.
    fn retire_referent(&self) -> Option<Referent<T>> {
        let mut state = self.state.lock();
        let _order = LockGuard::new(LockOrder::Referent);
        state.reachability = Reachability::Inactive;
        state.referent.take()
    }

    pub(crate) fn queue_link(&self) -> Option<&Weak<QueueInner<T>>> {
        self.queue.as_ref()
    }

    pub(crate) fn try_mark_enqueued(&self) -> bool {
        self.queue_state
            .compare_exchange(
                QueueState::Registered as u8,
                QueueState::Enqueued as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn mark_dequeued(&self) {
        self.queue_state
            .store(QueueState::Dequeued as u8, Ordering::Release);
    }
}

/// A tracking handle for an `Arc`-managed object.
///
/// Cloning a `Reference` yields another handle to the same tracking state.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use rudo_ref::{ManualCollector, RefContext, Reference, ReferenceQueue};
///
/// let collector = Arc::new(ManualCollector::new());
/// let ctx = RefContext::new(collector.clone()).unwrap();
/// let queue = ReferenceQueue::new();
///
/// let value = Arc::new(String::from("tracked"));
/// let reference = Reference::new(&ctx, &value, Some(&queue));
/// assert_eq!(reference.get().as_deref().map(String::as_str), Some("tracked"));
///
/// drop(value);
/// collector.collect();
/// let delivered = queue.remove(Some(Duration::from_secs(5))).unwrap();
/// assert!(Reference::ptr_eq(&delivered, &reference));
/// assert!(delivered.get().is_none());
/// ```
pub struct Reference<T: ?Sized> {
    pub(crate) core: Arc<RefCore<T>>,
}

impl<T: ?Sized + Send + Sync + 'static> Reference<T> {
    /// Creates a weak reference to `referent`, optionally delivered to `queue`.
    #[must_use]
    pub fn new(ctx: &RefContext, referent: &Arc<T>, queue: Option<&ReferenceQueue<T>>) -> Self {
        let reference = Self::build(
            ReferenceKind::Weak,
            Referent::Weak(Arc::downgrade(referent)),
            queue,
            None,
        );
        reference.track(ctx.collector());
        reference
    }

    /// Creates a weak reference from an existing `Weak`.
    ///
    /// # Errors
    ///
    /// Returns [`RefError::DeadReferent`] if the object is already gone.
    pub fn from_weak(
        ctx: &RefContext,
        referent: &Weak<T>,
        queue: Option<&ReferenceQueue<T>>,
    ) -> Result<Self, RefError> {
        if referent.strong_count() == 0 {
            return Err(RefError::DeadReferent);
        }
        let reference = Self::build(
            ReferenceKind::Weak,
            Referent::Weak(referent.clone()),
            queue,
            None,
        );
        reference.track(ctx.collector());
        Ok(reference)
    }

    /// Creates a phantom reference: `get()` always returns `None`, and the
    /// only signal is delivery to `queue` after `referent` dies.
    #[must_use]
    pub fn phantom(ctx: &RefContext, referent: &Arc<T>, queue: &ReferenceQueue<T>) -> Self {
        let reference = Self::build(
            ReferenceKind::Phantom,
            Referent::Weak(Arc::downgrade(referent)),
            Some(queue),
            None,
        );
        reference.track(ctx.collector());
        reference
    }

    /// Builds an untracked reference. Callers must [`track`](Self::track) it
    /// once every structure that should see its delivery is linked.
    pub(crate) fn build(
        kind: ReferenceKind,
        referent: Referent<T>,
        queue: Option<&ReferenceQueue<T>>,
        cleanup: Option<Arc<dyn Cleanup>>,
    ) -> Self {
        let queue_state = if queue.is_some() {
            QueueState::Registered
        } else {
            QueueState::Unregistered
        };
        Self {
            core: Arc::new(RefCore {
                id: NEXT_REFERENCE_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                state: Mutex::new(RefState {
                    reachability: Reachability::Active,
                    referent: Some(referent),
                }),
                queue_state: AtomicU8::new(queue_state as u8),
                queue: queue.map(ReferenceQueue::downgrade),
                cleanup,
            }),
        }
    }

    pub(crate) fn track(&self, collector: &Arc<dyn Collector>) {
        collector.track(self.as_raw().downgrade());
    }

    /// Returns the referent, or `None` once it has been cleared.
    ///
    /// Phantom references always return `None`.
    #[must_use]
    pub fn get(&self) -> Option<Arc<T>> {
        if self.core.kind == ReferenceKind::Phantom {
            return None;
        }
        let state = self.core.state.lock();
        let _order = LockGuard::new(LockOrder::Referent);
        state.referent.as_ref().and_then(Referent::upgrade)
    }

    /// Returns `true` if this reference still tracks `object`.
    ///
    /// Works for phantom references too, without exposing the referent.
    #[must_use]
    pub fn refers_to(&self, object: &Arc<T>) -> bool {
        let state = self.core.state.lock();
        let _order = LockGuard::new(LockOrder::Referent);
        state
            .referent
            .as_ref()
            .is_some_and(|referent| referent.address() == Arc::as_ptr(object).cast())
    }

    /// Clears the referent. Idempotent, and never enqueues.
    pub fn clear(&self) {
        drop(self.core.clear_referent());
    }

    /// Clears the referent and appends this reference to its queue.
    ///
    /// Returns `false` if the reference has no queue or was already enqueued
    /// or dequeued, including by the reference handler.
    pub fn enqueue(&self) -> bool {
        if self.core.kind == ReferenceKind::Final {
            return false;
        }
        drop(self.core.retire_referent());
        self.core
            .queue
            .as_ref()
            .and_then(ReferenceQueue::upgrade)
            .is_some_and(|queue| queue.enqueue(self))
    }

    /// Returns `true` while this reference sits in its queue.
    #[must_use]
    pub fn is_enqueued(&self) -> bool {
        self.queue_state() == QueueState::Enqueued
    }

    /// Current position on the queue axis.
    #[must_use]
    pub fn queue_state(&self) -> QueueState {
        QueueState::from_u8(self.core.queue_state.load(Ordering::Acquire))
    }

    /// Current position on the reachability axis.
    #[must_use]
    pub fn reachability(&self) -> Reachability {
        self.core.state.lock().reachability
    }

    /// The flavor of this reference.
    #[must_use]
    pub fn kind(&self) -> ReferenceKind {
        self.core.kind
    }

    /// Process-unique id of this reference.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.core.id
    }

    /// Returns `true` if both handles share the same tracking state.
    #[must_use]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.core, &other.core)
    }

    /// Type-erased handle for collectors.
    #[must_use]
    pub fn as_raw(&self) -> RawReference {
        let core: Arc<dyn Discover> = self.core.clone();
        RawReference(core)
    }

    /// Marks finalization as begun and takes the referent.
    ///
    /// Returns `None` if another thread already began finalizing.
    pub(crate) fn begin_finalization(&self) -> Option<Arc<T>> {
        let mut state = self.core.state.lock();
        let _order = LockGuard::new(LockOrder::Referent);
        if state.reachability == Reachability::Inactive {
            return None;
        }
        state.reachability = Reachability::Inactive;
        match state.referent.take()? {
            Referent::Owned(arc) => Some(arc),
            Referent::Weak(weak) => weak.upgrade(),
        }
    }

    /// Runs the attached cleanup, if any. Returns whether it ran here.
    pub(crate) fn run_cleanup(&self) -> bool {
        self.core.cleanup.as_ref().is_some_and(|cleanup| cleanup.clean())
    }
}

impl<T: ?Sized> Clone for Reference<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Reference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reference")
            .field("id", &self.core.id)
            .field("kind", &self.core.kind)
            .field("reachability", &self.core.state.lock().reachability)
            .field(
                "queue_state",
                &QueueState::from_u8(self.core.queue_state.load(Ordering::Acquire)),
            )
            .finish()
    }
}

/// What the handler did with a pending reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Enqueued,
    Cleaned,
    Discarded,
}

/// Collector-facing view of a reference, independent of its referent type.
pub(crate) trait Discover: Send + Sync {
    fn id(&self) -> u64;
    fn kind(&self) -> ReferenceKind;
    fn reachability(&self) -> Reachability;
    fn is_unreachable(&self) -> bool;
    fn discover(&self) -> bool;
    fn has_cleanup(&self) -> bool;
    fn process(self: Arc<Self>, run_cleanup_inline: bool) -> Delivery;
}

impl<T: ?Sized + Send + Sync + 'static> Discover for RefCore<T> {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> ReferenceKind {
        self.kind
    }

    fn reachability(&self) -> Reachability {
        self.state.lock().reachability
    }

    fn is_unreachable(&self) -> bool {
        let state = self.state.lock();
        let _order = LockGuard::new(LockOrder::Referent);
        state.reachability == Reachability::Active
            && state.referent.as_ref().is_some_and(Referent::is_unreachable)
    }

    fn discover(&self) -> bool {
        let (discovered, released) = {
            let mut state = self.state.lock();
            let _order = LockGuard::new(LockOrder::Referent);
            if state.reachability != Reachability::Active {
                return false;
            }
            if self.queue.is_none() && self.cleanup.is_none() {
                // Nothing will ever observe delivery; retire in place.
                state.reachability = Reachability::Inactive;
                (false, state.referent.take())
            } else {
                state.reachability = Reachability::Pending;
                let released = if self.kind == ReferenceKind::Final {
                    None
                } else {
                    state.referent.take()
                };
                (true, released)
            }
        };
        drop(released);
        discovered
    }

    fn has_cleanup(&self) -> bool {
        self.cleanup.is_some()
    }

    fn process(self: Arc<Self>, run_cleanup_inline: bool) -> Delivery {
        if self.kind != ReferenceKind::Final {
            let released = {
                let mut state = self.state.lock();
                let _order = LockGuard::new(LockOrder::Referent);
                state.reachability = Reachability::Inactive;
                state.referent.take()
            };
            drop(released);
        }

        if run_cleanup_inline {
            if let Some(cleanup) = &self.cleanup {
                return if cleanup.clean() {
                    Delivery::Cleaned
                } else {
                    Delivery::Discarded
                };
            }
        }

        let Some(queue) = self.queue.as_ref().and_then(ReferenceQueue::upgrade) else {
            return Delivery::Discarded;
        };
        if queue.enqueue(&Reference { core: self }) {
            Delivery::Enqueued
        } else {
            Delivery::Discarded
        }
    }
}

/// Type-erased handle given to [`Collector`] implementations.
#[derive(Clone)]
pub struct RawReference(Arc<dyn Discover>);

impl RawReference {
    /// Process-unique id of the underlying reference.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.0.id()
    }

    /// The flavor of the underlying reference.
    #[must_use]
    pub fn kind(&self) -> ReferenceKind {
        self.0.kind()
    }

    /// Current position on the reachability axis.
    #[must_use]
    pub fn reachability(&self) -> Reachability {
        self.0.reachability()
    }

    /// Returns `true` if the reference is `Active` and its referent is no
    /// longer reachable through ordinary `Arc` handles.
    #[must_use]
    pub fn is_unreachable(&self) -> bool {
        self.0.is_unreachable()
    }

    /// Moves an `Active` reference to `Pending`.
    ///
    /// Only collectors call this, right before putting the reference on their
    /// pending list. Returns `false` if the reference was not `Active` or has
    /// nowhere to be delivered (it is retired to `Inactive` instead); such
    /// references must not be added to the pending list.
    pub fn discover(&self) -> bool {
        self.0.discover()
    }

    /// Non-owning handle, for collectors that track every live reference.
    #[must_use]
    pub fn downgrade(&self) -> WeakRawReference {
        WeakRawReference(Arc::downgrade(&self.0))
    }

    pub(crate) fn has_cleanup(&self) -> bool {
        self.0.has_cleanup()
    }

    pub(crate) fn process(self, run_cleanup_inline: bool) -> Delivery {
        self.0.process(run_cleanup_inline)
    }
}

impl fmt::Debug for RawReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawReference")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

/// Non-owning [`RawReference`]; dead once every handle to the reference is dropped.
#[derive(Clone)]
pub struct WeakRawReference(Weak<dyn Discover>);

impl WeakRawReference {
    /// Returns the reference if any handle to it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<RawReference> {
        self.0.upgrade().map(RawReference)
    }
}

impl fmt::Debug for WeakRawReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakRawReference")
    }
}
