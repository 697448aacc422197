//! # Lock Ordering Discipline
//!
//! Every lock in this crate belongs to one of the levels below. A thread may
//! only acquire locks of the same or a higher level than the ones it already
//! holds.
//!
//! | Level | Lock                | Guards                                         |
//! |-------|---------------------|------------------------------------------------|
//! | 1     | `Handler`           | reference handler round state                  |
//! | 1     | `Registry`          | cleaner registrations, finalizer "awaiting" map |
//! | 2     | `Collector`         | collector pending list and tracked references  |
//! | 3     | `Queue`             | reference queue contents                       |
//! | 4     | `Referent`          | a single reference's referent and reachability |
//!
//! The handler holds `Handler` while it swaps out the collector's pending
//! list, a cleaner may close its queue while holding `Registry`, and a
//! collector discovers references (taking `Referent`) while holding its own
//! lock. No lock is held while user code runs.
//!
//! ## Validation
//!
//! In debug builds each acquisition is recorded in a thread-local stack by
//! [`LockGuard`], and acquiring a lower level than the one held panics with
//! `Lock ordering violation`. Release builds compile the checks away.
//!
//! ```ignore
//! let _state = self.state.lock();
//! let _order = LockGuard::new(LockOrder::Handler);
//! let pending = self.collector.take_and_clear_pending_list(); // Collector: level 2
//! ```

use std::cell::{Cell, RefCell};

const MAX_LOCK_DEPTH: usize = 16;

struct LockOrderState {
    stack: RefCell<Vec<u8>>,
    is_shutdown: Cell<bool>,
}

thread_local!(static LOCK_ORDER_STATE: LockOrderState = LockOrderState {
    stack: RefCell::new(Vec::with_capacity(MAX_LOCK_DEPTH)),
    is_shutdown: Cell::new(false),
});

/// Lock order tags for validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockOrder {
    /// Reference handler round state (level 1).
    Handler = 1,
    /// Cleaner and finalizer registries (level 1).
    Registry = 2,
    /// Collector pending list and tracking state (level 2).
    Collector = 3,
    /// Reference queue contents (level 3).
    Queue = 4,
    /// A single reference's referent slot (level 4).
    Referent = 5,
}

impl LockOrder {
    /// Unique value of this tag.
    #[must_use]
    pub const fn order_value(self) -> u8 {
        self as u8
    }

    /// Conceptual level used for ordering checks.
    #[must_use]
    pub const fn level(self) -> u8 {
        match self {
            Self::Handler | Self::Registry => 1,
            Self::Collector => 2,
            Self::Queue => 3,
            Self::Referent => 4,
        }
    }

    const fn from_level(level: u8) -> Self {
        match level {
            2 => Self::Collector,
            3 => Self::Queue,
            4 => Self::Referent,
            _ => Self::Handler,
        }
    }
}

/// RAII record of a held lock level.
///
/// Create it right after taking the lock it describes and keep it alive for
/// as long as the lock is held.
#[must_use]
pub struct LockGuard {
    _tag: LockOrder,
}

impl LockGuard {
    /// Records that a lock of level `tag` is now held by this thread.
    ///
    /// # Panics
    ///
    /// Panics in debug builds when a lock of a higher level is already held.
    #[must_use = "LockGuard must be held for the duration of the critical section"]
    pub fn new(tag: LockOrder) -> Self {
        #[cfg(debug_assertions)]
        {
            validate_lock_order(tag, get_min_lock_order());
            push_lock_order(tag);
        }
        Self { _tag: tag }
    }
}

#[cfg(debug_assertions)]
impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = LOCK_ORDER_STATE.try_with(|state| {
            if !state.is_shutdown.get() {
                state.stack.borrow_mut().pop();
            }
        });
    }
}

/// Disables lock order tracking for the rest of this thread's life.
///
/// Worker threads call this on their way out so guards dropped during
/// thread-local destruction do not touch destroyed state.
#[inline]
#[allow(clippy::missing_const_for_fn)]
pub fn enter_thread_shutdown() {
    #[cfg(debug_assertions)]
    {
        let _ = LOCK_ORDER_STATE.try_with(|state| {
            state.is_shutdown.set(true);
        });
    }
}

/// Panics if `tag` would be a downgrade from `current`.
#[inline]
#[cfg(debug_assertions)]
pub fn validate_lock_order(tag: LockOrder, current: LockOrder) {
    assert!(
        tag.level() >= current.level(),
        "Lock ordering violation: {tag:?} (level {}) cannot be acquired while holding {current:?} (level {}).",
        tag.level(),
        current.level()
    );
}

#[cfg(debug_assertions)]
fn push_lock_order(order: LockOrder) {
    let _ = LOCK_ORDER_STATE.try_with(|state| {
        if state.is_shutdown.get() {
            return;
        }
        state.stack.borrow_mut().push(order.level());
    });
}

/// Highest lock level currently held by this thread, `Handler` if none.
#[inline]
#[cfg(debug_assertions)]
#[must_use]
pub fn get_min_lock_order() -> LockOrder {
    LOCK_ORDER_STATE
        .try_with(|state| {
            if state.is_shutdown.get() {
                return LockOrder::Handler;
            }
            let level = state.stack.borrow().iter().copied().max().unwrap_or(1);
            LockOrder::from_level(level)
        })
        .unwrap_or(LockOrder::Handler)
}

#[cfg(test)]
mod tests {
    use super::{LockGuard, LockOrder};

    #[test]
    fn test_lock_order_levels() {
        assert_eq!(LockOrder::Handler.level(), 1);
        assert_eq!(LockOrder::Registry.level(), 1);
        assert_eq!(LockOrder::Collector.level(), 2);
        assert_eq!(LockOrder::Queue.level(), 3);
        assert_eq!(LockOrder::Referent.level(), 4);
        assert_eq!(LockOrder::Referent.order_value(), 5);
    }

    #[test]
    fn test_handler_then_collector() {
        let _guard1 = LockGuard::new(LockOrder::Handler);
        let _guard2 = LockGuard::new(LockOrder::Collector);
        let _guard3 = LockGuard::new(LockOrder::Referent);
    }

    #[test]
    fn test_same_level_any_order() {
        let _guard1 = LockGuard::new(LockOrder::Registry);
        let _guard2 = LockGuard::new(LockOrder::Handler);
    }

    #[test]
    fn test_state_restored_after_drop() {
        {
            let _guard1 = LockGuard::new(LockOrder::Queue);
        }
        let _guard2 = LockGuard::new(LockOrder::Registry);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Lock ordering violation")]
    fn test_queue_then_registry_panics() {
        let _guard1 = LockGuard::new(LockOrder::Queue);
        let _guard2 = LockGuard::new(LockOrder::Registry);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Lock ordering violation")]
    fn test_referent_then_collector_panics() {
        let _guard1 = LockGuard::new(LockOrder::Referent);
        let _guard2 = LockGuard::new(LockOrder::Collector);
    }
}
