//! Integration tests for references and reference queues.
//!
//! These tests verify FIFO delivery, blocking removal and the reference
//! state machine as seen from consumer code.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use rudo_ref::{
    ManualCollector, QueueState, Reachability, RefContext, RefError, Reference, ReferenceKind,
    ReferenceQueue,
};

fn setup() -> (Arc<ManualCollector>, RefContext) {
    let collector = Arc::new(ManualCollector::new());
    let ctx = RefContext::new(collector.clone()).unwrap();
    (collector, ctx)
}

/// Explicitly enqueued references come out in order.
#[test]
fn test_explicit_enqueue_is_fifo() {
    let (_collector, ctx) = setup();
    let queue = ReferenceQueue::new();
    let a = Arc::new('a');
    let b = Arc::new('b');
    let ra = Reference::new(&ctx, &a, Some(&queue));
    let rb = Reference::new(&ctx, &b, Some(&queue));

    assert!(ra.enqueue());
    assert!(rb.enqueue());
    assert!(!ra.enqueue());

    assert!(Reference::ptr_eq(&queue.poll().unwrap(), &ra));
    assert!(Reference::ptr_eq(&queue.poll().unwrap(), &rb));
    assert!(queue.poll().is_none());
    assert_eq!(ra.queue_state(), QueueState::Dequeued);
    assert!(!ra.enqueue());
}

/// A blocked consumer receives a reference the collector discovered.
#[test]
fn test_consumer_receives_discovered_reference() {
    let (collector, ctx) = setup();
    let queue: ReferenceQueue<Vec<u8>> = ReferenceQueue::new();
    let object = Arc::new(vec![1, 2, 3]);
    let reference = Reference::new(&ctx, &object, Some(&queue));

    let consumer = thread::spawn({
        let queue = queue.clone();
        move || queue.remove(None)
    });

    assert!(collector.discover(&reference.as_raw()));
    let delivered = consumer.join().unwrap().unwrap();

    assert!(Reference::ptr_eq(&delivered, &reference));
    assert!(delivered.get().is_none());
    assert_eq!(delivered.reachability(), Reachability::Inactive);
    // Forced discovery does not free the object itself.
    assert_eq!(*object, vec![1, 2, 3]);
}

/// Handler deliveries preserve discovery order within one queue.
#[test]
fn test_handler_delivery_is_fifo() {
    let (collector, ctx) = setup();
    let queue = ReferenceQueue::new();
    let objects: Vec<_> = (0..10).map(Arc::new).collect();
    let references: Vec<_> = objects
        .iter()
        .map(|object| Reference::new(&ctx, object, Some(&queue)))
        .collect();

    for reference in &references {
        assert!(collector.discover(&reference.as_raw()));
    }
    ctx.wait_for_reference_processing();

    for expected in &references {
        let delivered = queue.remove(Some(Duration::from_secs(5))).unwrap();
        assert!(Reference::ptr_eq(&delivered, expected));
    }
    assert!(queue.is_empty());
}

/// `clear` is idempotent and never delivers.
#[test]
fn test_clear_is_idempotent() {
    let (collector, ctx) = setup();
    let queue = ReferenceQueue::new();
    let object = Arc::new(3.5f64);
    let reference = Reference::new(&ctx, &object, Some(&queue));

    reference.clear();
    reference.clear();
    assert!(reference.get().is_none());
    assert_eq!(reference.reachability(), Reachability::Inactive);

    drop(object);
    assert_eq!(collector.collect(), 0);
    ctx.wait_for_reference_processing();
    assert!(queue.poll().is_none());
    assert!(!reference.is_enqueued());
}

/// A reference whose referent dies is delivered exactly once.
#[test]
fn test_dead_referent_delivered_once() {
    let (collector, ctx) = setup();
    let queue = ReferenceQueue::new();
    let object = Arc::new(String::from("gone"));
    let reference = Reference::new(&ctx, &object, Some(&queue));

    drop(object);
    assert_eq!(collector.collect(), 1);
    assert_eq!(collector.collect(), 0);
    ctx.wait_for_reference_processing();

    assert!(queue.poll().is_some());
    assert!(queue.poll().is_none());
    assert!(!reference.enqueue());
}

/// Phantom references never expose their referent.
#[test]
fn test_phantom_reference() {
    let (collector, ctx) = setup();
    let queue = ReferenceQueue::new();
    let object = Arc::new(42u32);
    let reference = Reference::phantom(&ctx, &object, &queue);

    assert_eq!(reference.kind(), ReferenceKind::Phantom);
    assert!(reference.get().is_none());
    assert!(reference.refers_to(&object));

    drop(object);
    collector.collect();
    let delivered = queue.remove(Some(Duration::from_secs(5))).unwrap();
    assert!(Reference::ptr_eq(&delivered, &reference));
}

/// References without a queue are simply cleared on discovery.
#[test]
fn test_unregistered_reference_retires() {
    let (collector, ctx) = setup();
    let object = Arc::new(1u8);
    let reference = Reference::new(&ctx, &object, None);

    assert_eq!(reference.queue_state(), QueueState::Unregistered);
    assert!(!reference.enqueue());
    drop(object);
    assert_eq!(collector.collect(), 0);
    assert_eq!(reference.reachability(), Reachability::Inactive);
}

/// `from_weak` rejects objects that are already gone.
#[test]
fn test_from_weak_dead_referent() {
    let (_collector, ctx) = setup();
    let object = Arc::new(0u8);
    let weak = Arc::downgrade(&object);
    drop(object);

    let result = Reference::from_weak(&ctx, &weak, None);
    assert!(matches!(result, Err(RefError::DeadReferent)));
}

/// A bounded `remove` gives up after its timeout.
#[test]
fn test_remove_timeout() {
    let queue: ReferenceQueue<u8> = ReferenceQueue::new();
    assert!(queue.remove(Some(Duration::from_millis(20))).is_none());
}

/// Deliveries to a queue nobody holds any more are dropped.
#[test]
fn test_delivery_to_dropped_queue() {
    let (collector, ctx) = setup();
    let queue = ReferenceQueue::new();
    let object = Arc::new(8u8);
    let reference = Reference::new(&ctx, &object, Some(&queue));
    drop(queue);

    drop(object);
    assert_eq!(collector.collect(), 1);
    ctx.wait_for_reference_processing();
    assert_eq!(reference.queue_state(), QueueState::Registered);
    assert_eq!(reference.reachability(), Reachability::Inactive);
}

/// An explicit enqueue after discovery retires the pending reference first.
#[test]
fn test_enqueue_after_discovery_is_inactive() {
    let (collector, ctx) = setup();
    let queue = ReferenceQueue::new();
    let object = Arc::new(5u16);
    let reference = Reference::new(&ctx, &object, Some(&queue));

    assert!(collector.discover(&reference.as_raw()));
    reference.enqueue();
    ctx.wait_for_reference_processing();

    let delivered = queue.poll().unwrap();
    assert!(Reference::ptr_eq(&delivered, &reference));
    assert_eq!(delivered.reachability(), Reachability::Inactive);
    assert!(delivered.get().is_none());
    assert!(queue.poll().is_none());
}

/// Racing an explicit enqueue against the handler delivers exactly once.
#[test]
fn test_explicit_enqueue_races_handler() {
    let (collector, ctx) = setup();
    let queue = ReferenceQueue::new();

    for _ in 0..200 {
        let object = Arc::new(0u64);
        let reference = Reference::new(&ctx, &object, Some(&queue));
        let before = ctx.metrics().snapshot().references_enqueued;
        let start = Arc::new(Barrier::new(2));

        let explicit = thread::spawn({
            let reference = reference.clone();
            let start = Arc::clone(&start);
            move || {
                start.wait();
                reference.enqueue()
            }
        });

        start.wait();
        drop(object);
        collector.collect();
        let explicit = explicit.join().unwrap();
        ctx.wait_for_reference_processing();

        let by_handler = ctx.metrics().snapshot().references_enqueued - before;
        assert_eq!(u64::from(explicit) + by_handler, 1);
        assert_eq!(queue.len(), 1);
        let delivered = queue.poll().unwrap();
        assert!(Reference::ptr_eq(&delivered, &reference));
        assert_eq!(delivered.reachability(), Reachability::Inactive);
    }
}
