//! The collector contract and an in-memory collector.
//!
//! This crate never decides on its own that an object is unreachable. That is
//! the job of a [`Collector`]: it discovers references (moving them from
//! `Active` to `Pending`), strings them onto its pending list, and hands the
//! whole list to the reference handler on request.

use std::fmt;
use std::mem;

use crossbeam::queue::SegQueue;
use parking_lot::{Condvar, Mutex};

use crate::reference::{Reachability, RawReference, WeakRawReference};
use crate::sync::{LockGuard, LockOrder};

/// References discovered by a collector, in discovery order.
#[derive(Debug, Default)]
pub struct PendingList {
    references: Vec<RawReference>,
}

impl PendingList {
    /// Creates an empty list.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            references: Vec::new(),
        }
    }

    /// Appends a reference that was just [`discover`](RawReference::discover)ed.
    pub fn push(&mut self, reference: RawReference) {
        self.references.push(reference);
    }

    /// Number of references in the list.
    #[must_use]
    pub fn len(&self) -> usize {
        self.references.len()
    }

    /// Returns `true` if the list holds no reference.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }
}

impl Extend<RawReference> for PendingList {
    fn extend<I: IntoIterator<Item = RawReference>>(&mut self, iter: I) {
        self.references.extend(iter);
    }
}

impl FromIterator<RawReference> for PendingList {
    fn from_iter<I: IntoIterator<Item = RawReference>>(iter: I) -> Self {
        Self {
            references: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for PendingList {
    type Item = RawReference;
    type IntoIter = std::vec::IntoIter<RawReference>;

    fn into_iter(self) -> Self::IntoIter {
        self.references.into_iter()
    }
}

/// The interface between a collector and the reference handler.
///
/// A collector is the only party allowed to call
/// [`RawReference::discover`]. Everything it discovers must end up on the
/// list returned by the next [`take_and_clear_pending_list`] call.
///
/// [`take_and_clear_pending_list`]: Collector::take_and_clear_pending_list
pub trait Collector: Send + Sync + 'static {
    /// Told about every newly constructed reference.
    ///
    /// Collectors that find references some other way can ignore this.
    fn track(&self, reference: WeakRawReference) {
        let _ = reference;
    }

    /// Blocks until the pending list may be non-empty, or until the
    /// interrupt epoch has moved past `epoch`.
    ///
    /// `epoch` is a value previously read from
    /// [`interrupt_epoch`](Collector::interrupt_epoch). Spurious returns are
    /// allowed.
    fn wait_until_pending_list_nonempty(&self, epoch: u64);

    /// Atomically takes the pending list, leaving an empty one behind.
    fn take_and_clear_pending_list(&self) -> PendingList;

    /// Returns `true` if the pending list is currently non-empty.
    fn has_pending_list(&self) -> bool;

    /// Number of [`interrupt`](Collector::interrupt) calls so far.
    fn interrupt_epoch(&self) -> u64;

    /// Advances the interrupt epoch and wakes every thread blocked in
    /// [`wait_until_pending_list_nonempty`](Collector::wait_until_pending_list_nonempty).
    ///
    /// A waiter that read the epoch before this call returns even if it
    /// starts waiting afterwards, so an interrupt is never lost and never
    /// consumed by another waiter.
    fn interrupt(&self);
}

struct CollectorState {
    tracked: Vec<WeakRawReference>,
    pending: PendingList,
    interrupts: u64,
}

/// A collector driven explicitly by its owner.
///
/// References register themselves through [`Collector::track`]. Each call to
/// [`collect`](ManualCollector::collect) discovers every tracked, still active
/// reference whose referent is no longer reachable through an `Arc`, and
/// [`discover`](ManualCollector::discover) forces discovery of one reference
/// regardless of reachability.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use rudo_ref::{ManualCollector, RefContext, Reference, ReferenceQueue};
///
/// let collector = Arc::new(ManualCollector::new());
/// let ctx = RefContext::new(collector.clone()).unwrap();
/// let queue = ReferenceQueue::new();
///
/// let value = Arc::new(42);
/// let _reference = Reference::new(&ctx, &value, Some(&queue));
/// assert_eq!(collector.collect(), 0);
///
/// drop(value);
/// assert_eq!(collector.collect(), 1);
/// ```
pub struct ManualCollector {
    incoming: SegQueue<WeakRawReference>,
    state: Mutex<CollectorState>,
    signal: Condvar,
}

impl ManualCollector {
    /// Creates a collector with nothing tracked.
    #[must_use]
    pub fn new() -> Self {
        Self {
            incoming: SegQueue::new(),
            state: Mutex::new(CollectorState {
                tracked: Vec::new(),
                pending: PendingList::new(),
                interrupts: 0,
            }),
            signal: Condvar::new(),
        }
    }

    /// Discovers every tracked reference whose referent became unreachable
    /// and publishes them to the reference handler.
    ///
    /// Returns the number of references added to the pending list.
    pub fn collect(&self) -> usize {
        let mut scanned = Vec::new();
        let discovered = {
            let mut state = self.state.lock();
            let _order = LockGuard::new(LockOrder::Collector);
            while let Some(reference) = self.incoming.pop() {
                state.tracked.push(reference);
            }

            let mut discovered = Vec::new();
            state.tracked.retain(|weak| {
                let Some(reference) = weak.upgrade() else {
                    return false;
                };
                let keep = if reference.is_unreachable() {
                    if reference.discover() {
                        discovered.push(reference.clone());
                    }
                    false
                } else {
                    reference.reachability() == Reachability::Active
                };
                // Dropped after the lock: the last handle may own user data.
                scanned.push(reference);
                keep
            });

            #[cfg(feature = "tracing")]
            crate::tracing::log_collect(state.tracked.len(), discovered.len());

            let count = discovered.len();
            state.pending.extend(discovered);
            if count > 0 {
                self.signal.notify_all();
            }
            count
        };
        drop(scanned);
        discovered
    }

    /// Forces discovery of `reference`, as if its referent had become
    /// unreachable.
    ///
    /// Returns `false` if the reference was not active or has nowhere to be
    /// delivered.
    pub fn discover(&self, reference: &RawReference) -> bool {
        let mut state = self.state.lock();
        let _order = LockGuard::new(LockOrder::Collector);
        if !reference.discover() {
            return false;
        }
        state.pending.push(reference.clone());
        self.signal.notify_all();
        true
    }

    /// Number of references tracked as of the last `collect`, plus any
    /// registered since.
    #[must_use]
    pub fn tracked_len(&self) -> usize {
        self.state.lock().tracked.len() + self.incoming.len()
    }
}

impl Default for ManualCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManualCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManualCollector")
            .field("tracked", &(state.tracked.len() + self.incoming.len()))
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl Collector for ManualCollector {
    fn track(&self, reference: WeakRawReference) {
        self.incoming.push(reference);
    }

    fn wait_until_pending_list_nonempty(&self, epoch: u64) {
        let mut state = self.state.lock();
        let _order = LockGuard::new(LockOrder::Collector);
        while state.pending.is_empty() && state.interrupts == epoch {
            self.signal.wait(&mut state);
        }
    }

    fn take_and_clear_pending_list(&self) -> PendingList {
        let mut state = self.state.lock();
        let _order = LockGuard::new(LockOrder::Collector);
        mem::take(&mut state.pending)
    }

    fn has_pending_list(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    fn interrupt_epoch(&self) -> u64 {
        self.state.lock().interrupts
    }

    fn interrupt(&self) {
        let mut state = self.state.lock();
        state.interrupts = state.interrupts.wrapping_add(1);
        self.signal.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::queue::ReferenceQueue;
    use crate::reference::{Reference, ReferenceKind, Referent};

    fn tracked(
        collector: &Arc<dyn Collector>,
        queue: &ReferenceQueue<u8>,
        value: &Arc<u8>,
    ) -> Reference<u8> {
        let reference = Reference::build(
            ReferenceKind::Weak,
            Referent::Weak(Arc::downgrade(value)),
            Some(queue),
            None,
        );
        reference.track(collector);
        reference
    }

    #[test]
    fn test_collect_discovers_only_dead_referents() {
        let manual = Arc::new(ManualCollector::new());
        let collector: Arc<dyn Collector> = manual.clone();
        let queue = ReferenceQueue::new();
        let live = Arc::new(1);
        let dead = Arc::new(2);
        let r_live = tracked(&collector, &queue, &live);
        let r_dead = tracked(&collector, &queue, &dead);
        drop(dead);

        assert_eq!(manual.collect(), 1);
        assert_eq!(r_dead.reachability(), Reachability::Pending);
        assert_eq!(r_live.reachability(), Reachability::Active);
        assert_eq!(manual.tracked_len(), 1);

        let pending = manual.take_and_clear_pending_list();
        assert_eq!(pending.len(), 1);
        assert!(!manual.has_pending_list());
    }

    #[test]
    fn test_collect_prunes_dropped_references() {
        let manual = Arc::new(ManualCollector::new());
        let collector: Arc<dyn Collector> = manual.clone();
        let queue = ReferenceQueue::new();
        let value = Arc::new(1);
        drop(tracked(&collector, &queue, &value));
        assert_eq!(manual.collect(), 0);
        assert_eq!(manual.tracked_len(), 0);
    }

    #[test]
    fn test_forced_discover_happens_once() {
        let manual = ManualCollector::new();
        let queue = ReferenceQueue::new();
        let value = Arc::new(1u8);
        let reference = Reference::build(
            ReferenceKind::Weak,
            Referent::Weak(Arc::downgrade(&value)),
            Some(&queue),
            None,
        );
        assert!(manual.discover(&reference.as_raw()));
        assert!(!manual.discover(&reference.as_raw()));
        assert!(manual.has_pending_list());
    }

    #[test]
    fn test_interrupt_before_wait_is_not_lost() {
        let manual = ManualCollector::new();
        let epoch = manual.interrupt_epoch();
        manual.interrupt();
        // Returns immediately instead of blocking forever.
        manual.wait_until_pending_list_nonempty(epoch);
    }

    #[test]
    fn test_interrupt_wakes_every_waiter() {
        let manual = Arc::new(ManualCollector::new());
        let epoch = manual.interrupt_epoch();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let manual = Arc::clone(&manual);
                std::thread::spawn(move || manual.wait_until_pending_list_nonempty(epoch))
            })
            .collect();

        std::thread::sleep(std::time::Duration::from_millis(10));
        manual.interrupt();
        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(manual.interrupt_epoch(), epoch + 1);
    }
}
