use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

/// Scheduling priority requested for the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadPriority {
    /// The scheduler's default priority.
    Normal,
    /// Above normal, below the highest level.
    High,
    /// The highest priority an unprivileged process may request.
    Highest,
}

/// Sets the scheduling priority of the calling thread.
///
/// This is best effort: on Linux raising priority lowers the thread's nice
/// value, which needs `CAP_SYS_NICE`, and other Unix platforms have no
/// per-thread knob at all. Callers are expected to carry on at normal
/// priority when this returns an error.
///
/// # Errors
///
/// Returns the OS error when the request is refused, or
/// [`io::ErrorKind::Unsupported`] when the platform cannot adjust a single
/// thread.
pub fn set_current_thread_priority(priority: ThreadPriority) -> io::Result<()> {
    os::set_current_thread_priority(priority)
}
