//! Reference queues, cleaners and finalization for `Arc`-managed objects.
//!
//! `rudo-ref` tells user code, asynchronously and off the collector's path,
//! that an object it tracks has become unreachable, so that a cleanup action
//! runs exactly once. Reachability is decided by a pluggable [`Collector`];
//! [`ManualCollector`] decides it from `Arc` strong counts.
//!
//! # Building blocks
//!
//! - [`Reference`]: a weak or phantom tracking handle with a two-axis state
//!   machine, optionally tied to a [`ReferenceQueue`].
//! - [`ReferenceQueue`]: FIFO delivery point for references whose referent
//!   died, with blocking and non-blocking removal.
//! - The reference handler: one thread per [`RefContext`] that drains the
//!   collector's pending list into queues.
//! - [`Cleaner`]: one-shot actions, run either explicitly or after the object
//!   becomes unreachable, whichever happens first.
//! - [`Finalizer`]: legacy `finalize` hooks on a shared finalizer thread.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use rudo_ref::{Cleaner, ManualCollector, RefContext};
//!
//! let collector = Arc::new(ManualCollector::new());
//! let ctx = RefContext::new(collector.clone()).unwrap();
//! let cleaner = Cleaner::create(&ctx).unwrap();
//!
//! let closed = Arc::new(AtomicUsize::new(0));
//! let socket = Arc::new(String::from("fd:7"));
//! cleaner.register(&socket, {
//!     let closed = closed.clone();
//!     move || {
//!         closed.fetch_add(1, Ordering::SeqCst);
//!     }
//! });
//!
//! drop(socket);
//! collector.collect();
//! ctx.wait_for_reference_processing();
//! assert_eq!(closed.load(Ordering::SeqCst), 1);
//! ```
//!
//! # Threads
//!
//! Each context owns a reference handler thread, joined when the last
//! context handle drops. Cleaners and the finalizer run detached worker
//! threads that exit once they have nothing left to do.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod cleaner;
mod collector;
mod context;
mod error;
mod finalizer;
mod handler;
mod metrics;
mod queue;
mod reference;
#[cfg(feature = "tracing")]
mod tracing;

/// Lock ordering discipline.
///
/// This module is public for testing and advanced use cases.
pub mod sync;

pub use cleaner::{Cleanable, Cleaner, DefaultThreadFactory, ThreadFactory};
pub use collector::{Collector, ManualCollector, PendingList};
pub use context::{RefConfig, RefContext, DEFAULT_THREAD_NAME_PREFIX};
pub use error::RefError;
pub use finalizer::{Finalize, Finalizer};
pub use handler::{DispatchStrategy, InlineCleanup, QueueOnly};
pub use metrics::{RefMetrics, RefStats};
pub use queue::ReferenceQueue;
pub use reference::{
    QueueState, RawReference, Reachability, Reference, ReferenceKind, WeakRawReference,
};

/// Keeps `value` reachable up to this point of the calling code.
///
/// Cleanup for an object may start as soon as its last handle is no longer
/// used, even while a borrow derived from it is still being worked with.
/// Calling this after the last use of such a borrow prevents the compiler
/// from ending the object's lifetime earlier.
///
/// ```
/// use std::sync::Arc;
///
/// let buffer = Arc::new(vec![1u8, 2, 3]);
/// let first = buffer[0];
/// rudo_ref::reachability_fence(&buffer);
/// assert_eq!(first, 1);
/// ```
#[inline(never)]
pub fn reachability_fence<T: ?Sized>(value: &T) {
    std::hint::black_box(value);
    std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
}
