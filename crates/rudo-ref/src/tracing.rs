//! Reference processing tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! spans and events for handler rounds and worker thread lifecycles. Failures
//! of user cleanup code are deliberately never reported here.

#[cfg(feature = "tracing")]
use ::tracing::Span;

/// Create a span covering one reference handler round.
#[cfg(feature = "tracing")]
pub fn span_handler_round(round: u64) -> Span {
    ::tracing::debug_span!("reference_handler_round", round = round)
}

/// Log the outcome of a reference handler round.
#[cfg(feature = "tracing")]
pub fn log_handler_round(processed: u64, enqueued: u64, inline: u64) {
    ::tracing::debug!(
        processed = processed,
        enqueued = enqueued,
        inline = inline,
        "handler_round"
    );
}

/// Log a worker thread starting.
#[cfg(feature = "tracing")]
pub fn log_thread_start(name: &str) {
    ::tracing::debug!(thread = name, "thread_start");
}

/// Log a worker thread exiting.
#[cfg(feature = "tracing")]
pub fn log_thread_exit(name: &str) {
    ::tracing::debug!(thread = name, "thread_exit");
}

/// Log a refused thread priority change.
#[cfg(feature = "tracing")]
pub fn log_priority_refused(thread: &str, error: &std::io::Error) {
    ::tracing::debug!(thread = thread, error = %error, "priority_refused");
}

/// Log a completed explicit finalization pass.
#[cfg(feature = "tracing")]
pub fn log_finalization_pass(finalized: usize) {
    ::tracing::debug!(finalized = finalized, "finalization_pass");
}

/// Log a collector scan.
#[cfg(feature = "tracing")]
pub fn log_collect(tracked: usize, discovered: usize) {
    ::tracing::debug!(tracked = tracked, discovered = discovered, "collect");
}
