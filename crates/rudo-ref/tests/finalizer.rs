//! Integration tests for legacy finalization.
//!
//! These tests verify that `finalize` runs once per registered object, after
//! the finalizer holds the last handle, and never takes the finalizer down.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rudo_ref::{Finalize, ManualCollector, RefContext, RefError};

fn setup() -> (Arc<ManualCollector>, RefContext) {
    let collector = Arc::new(ManualCollector::new());
    let ctx = RefContext::new(collector.clone()).unwrap();
    (collector, ctx)
}

fn wait_until(condition: impl Fn() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

struct Tracked {
    finalized: Arc<AtomicUsize>,
}

impl Finalize for Tracked {
    fn finalize(&self) {
        self.finalized.fetch_add(1, Ordering::SeqCst);
    }
}

struct Exploding;

impl Finalize for Exploding {
    fn finalize(&self) {
        panic!("finalize failed");
    }
}

/// A pending finalization completes after an explicit finalization pass.
#[test]
fn test_run_pending_finalizations() {
    let (collector, ctx) = setup();
    let finalized = Arc::new(AtomicUsize::new(0));
    let object = ctx.finalizer().unwrap().allocate(Tracked {
        finalized: finalized.clone(),
    });

    drop(object);
    assert_eq!(collector.collect(), 1);
    ctx.run_pending_finalizations().unwrap();

    assert!(wait_until(|| finalized.load(Ordering::SeqCst) == 1));
    assert_eq!(ctx.finalizer().unwrap().awaiting_len(), 0);
}

/// Objects still held elsewhere are not finalized.
#[test]
fn test_reachable_object_not_finalized() {
    let (collector, ctx) = setup();
    let finalized = Arc::new(AtomicUsize::new(0));
    let object = ctx.finalizer().unwrap().allocate(Tracked {
        finalized: finalized.clone(),
    });

    assert_eq!(collector.collect(), 0);
    ctx.run_pending_finalizations().unwrap();
    assert_eq!(finalized.load(Ordering::SeqCst), 0);
    assert_eq!(ctx.finalizer().unwrap().awaiting_len(), 1);
    drop(object);
}

/// `finalize` runs once even across repeated collections.
#[test]
fn test_finalize_runs_once() {
    let (collector, ctx) = setup();
    let finalized = Arc::new(AtomicUsize::new(0));
    let finalizer = ctx.finalizer().unwrap();
    for _ in 0..20 {
        drop(finalizer.allocate(Tracked {
            finalized: finalized.clone(),
        }));
    }

    assert_eq!(collector.collect(), 20);
    assert_eq!(collector.collect(), 0);
    ctx.run_pending_finalizations().unwrap();

    assert!(wait_until(|| ctx.metrics().snapshot().finalizers_run == 20));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(finalized.load(Ordering::SeqCst), 20);
}

/// Registering the same object twice is rejected.
#[test]
fn test_duplicate_registration() {
    let (_collector, ctx) = setup();
    let finalizer = ctx.finalizer().unwrap();
    let object = Arc::new(Tracked {
        finalized: Arc::new(AtomicUsize::new(0)),
    });

    finalizer.register(&object).unwrap();
    let err = finalizer.register(&object).unwrap_err();
    assert!(matches!(err, RefError::AlreadyRegistered { .. }));
}

/// A panicking `finalize` does not stop later finalizations.
#[test]
fn test_panicking_finalize_is_isolated() {
    let (collector, ctx) = setup();
    let finalizer = ctx.finalizer().unwrap();
    let finalized = Arc::new(AtomicUsize::new(0));

    drop(finalizer.allocate(Exploding));
    drop(finalizer.allocate(Tracked {
        finalized: finalized.clone(),
    }));
    assert_eq!(collector.collect(), 2);
    ctx.run_pending_finalizations().unwrap();

    assert!(wait_until(|| finalized.load(Ordering::SeqCst) == 1));
    assert!(wait_until(|| ctx.metrics().snapshot().finalizers_panicked == 1));
}

/// Without a finalizer, an explicit pass has nothing to do.
#[test]
fn test_run_pending_without_finalizer() {
    let (_collector, ctx) = setup();
    assert_eq!(ctx.run_pending_finalizations().unwrap(), 0);
}
