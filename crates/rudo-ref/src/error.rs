//! Errors reported synchronously by registration and setup APIs.
//!
//! Failures of user-supplied cleanup actions are never surfaced here; they are
//! caught where the action runs and only counted in [`crate::RefStats`].

use std::io;

/// Errors returned by `rudo-ref` registration and construction APIs.
#[derive(Debug, thiserror::Error)]
pub enum RefError {
    /// The object to track was already dropped when it was registered.
    #[error("referent is already unreachable at registration time")]
    DeadReferent,

    /// The object is already registered with this finalizer.
    #[error("object at {address:#x} is already registered for finalization")]
    AlreadyRegistered {
        /// Address of the shared allocation.
        address: usize,
    },

    /// A process-wide context has already been installed.
    #[error("a global reference context is already installed")]
    AlreadyInstalled,

    /// A background thread could not be started.
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        /// Name of the thread that failed to start.
        name: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
}

impl RefError {
    pub(crate) fn spawn(name: impl Into<String>, source: io::Error) -> Self {
        Self::Spawn {
            name: name.into(),
            source,
        }
    }
}
