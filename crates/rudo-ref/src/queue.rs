//! Reference queues.
//!
//! A [`ReferenceQueue`] is the hand-off point between the reference handler
//! and consumer code: the handler appends references whose referents died,
//! and consumers take them out with [`poll`](ReferenceQueue::poll) or
//! [`remove`](ReferenceQueue::remove). Delivery is FIFO per queue and at most
//! once per reference.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::reference::Reference;
use crate::sync::{LockGuard, LockOrder};

struct Contents<T: ?Sized> {
    items: VecDeque<Reference<T>>,
    closed: bool,
}

pub(crate) struct QueueInner<T: ?Sized> {
    contents: Mutex<Contents<T>>,
    available: Condvar,
}

/// A thread-safe FIFO of references whose referents were found unreachable.
///
/// Cloning a `ReferenceQueue` yields another handle to the same queue.
/// References only link back to their queue weakly: once every handle is
/// dropped, deliveries to the queue are discarded.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use rudo_ref::{ManualCollector, RefContext, Reference, ReferenceQueue};
///
/// let ctx = RefContext::new(Arc::new(ManualCollector::new())).unwrap();
/// let queue = ReferenceQueue::new();
/// let value = Arc::new(1u8);
///
/// let reference = Reference::new(&ctx, &value, Some(&queue));
/// assert!(queue.poll().is_none());
/// assert!(reference.enqueue());
/// assert!(queue.poll().is_some());
/// ```
pub struct ReferenceQueue<T: ?Sized> {
    inner: Arc<QueueInner<T>>,
}

impl<T: ?Sized + Send + Sync + 'static> ReferenceQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                contents: Mutex::new(Contents {
                    items: VecDeque::new(),
                    closed: false,
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// Removes the head of the queue without blocking.
    #[must_use]
    pub fn poll(&self) -> Option<Reference<T>> {
        let mut contents = self.inner.contents.lock();
        let _order = LockGuard::new(LockOrder::Queue);
        Self::take_head(&mut contents)
    }

    /// Removes the head of the queue, blocking until one is available.
    ///
    /// With `Some(timeout)` the wait is bounded and `None` is returned when it
    /// elapses. With `None` the call only returns `None` if the queue was
    /// closed by its owning cleaner or finalizer.
    #[must_use]
    pub fn remove(&self, timeout: Option<Duration>) -> Option<Reference<T>> {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let mut contents = self.inner.contents.lock();
        let _order = LockGuard::new(LockOrder::Queue);
        loop {
            if let Some(reference) = Self::take_head(&mut contents) {
                return Some(reference);
            }
            if contents.closed {
                return None;
            }
            match deadline {
                Some(deadline) => {
                    if self
                        .inner
                        .available
                        .wait_until(&mut contents, deadline)
                        .timed_out()
                    {
                        return Self::take_head(&mut contents);
                    }
                }
                None => self.inner.available.wait(&mut contents),
            }
        }
    }

    /// Number of references waiting in the queue.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.contents.lock().items.len()
    }

    /// Returns `true` if no reference is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `reference` if it belongs to this queue and was never enqueued.
    pub(crate) fn enqueue(&self, reference: &Reference<T>) -> bool {
        let belongs = reference
            .core
            .queue_link()
            .is_some_and(|link| std::ptr::eq(link.as_ptr(), Arc::as_ptr(&self.inner)));
        if !belongs {
            return false;
        }

        let mut contents = self.inner.contents.lock();
        let _order = LockGuard::new(LockOrder::Queue);
        if !reference.core.try_mark_enqueued() {
            return false;
        }
        contents.items.push_back(reference.clone());
        self.inner.available.notify_one();
        true
    }

    /// Wakes every blocked consumer; an unbounded `remove` on an empty closed
    /// queue returns `None`. Queued references stay available.
    pub(crate) fn close(&self) {
        let mut contents = self.inner.contents.lock();
        let _order = LockGuard::new(LockOrder::Queue);
        contents.closed = true;
        self.inner.available.notify_all();
    }

    pub(crate) fn downgrade(&self) -> Weak<QueueInner<T>> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(link: &Weak<QueueInner<T>>) -> Option<Self> {
        link.upgrade().map(|inner| Self { inner })
    }

    fn take_head(contents: &mut Contents<T>) -> Option<Reference<T>> {
        let reference = contents.items.pop_front()?;
        reference.core.mark_dequeued();
        Some(reference)
    }
}

impl<T: ?Sized + Send + Sync + 'static> Default for ReferenceQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> Clone for ReferenceQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ?Sized> fmt::Debug for ReferenceQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let contents = self.inner.contents.lock();
        f.debug_struct("ReferenceQueue")
            .field("len", &contents.items.len())
            .field("closed", &contents.closed)
            .finish()
    }
}
