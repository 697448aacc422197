//! Loom tests for at-most-once enqueue.
//!
//! These tests model the queue-state transition used when the reference
//! handler and an explicit `enqueue()` race for the same reference.

use loom::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use loom::sync::Arc;

const REGISTERED: u8 = 1;
const ENQUEUED: u8 = 2;
const DEQUEUED: u8 = 3;

fn try_mark_enqueued(state: &AtomicU8) -> bool {
    state
        .compare_exchange(REGISTERED, ENQUEUED, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

/// Exactly one of two racing enqueuers wins.
#[test]
#[ignore = "loom test - run with cargo test loom_enqueue_once --release"]
fn test_racing_enqueue_single_winner() {
    loom::model(|| {
        let state = Arc::new(AtomicU8::new(REGISTERED));
        let winners = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..2)
            .map(|_| {
                let state = Arc::clone(&state);
                let winners = Arc::clone(&winners);
                loom::thread::spawn(move || {
                    if try_mark_enqueued(&state) {
                        winners.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::Relaxed), 1);
        assert_eq!(state.load(Ordering::Acquire), ENQUEUED);
    });
}

/// Once dequeued, a reference can never be enqueued again.
#[test]
#[ignore = "loom test - run with cargo test loom_enqueue_after_dequeue --release"]
fn test_enqueue_after_dequeue_fails() {
    loom::model(|| {
        let state = Arc::new(AtomicU8::new(REGISTERED));

        let consumer = loom::thread::spawn({
            let state = Arc::clone(&state);
            move || {
                if try_mark_enqueued(&state) {
                    state.store(DEQUEUED, Ordering::Release);
                }
            }
        });
        let late = loom::thread::spawn({
            let state = Arc::clone(&state);
            move || try_mark_enqueued(&state)
        });

        consumer.join().unwrap();
        let late_won = late.join().unwrap();

        let final_state = state.load(Ordering::Acquire);
        if late_won {
            assert_eq!(final_state, ENQUEUED);
        } else {
            assert_eq!(final_state, DEQUEUED);
        }
    });
}
