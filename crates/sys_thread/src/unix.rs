use std::io::{self, Error};

use crate::ThreadPriority;

#[cfg(any(target_os = "linux", target_os = "android"))]
const fn nice_value(priority: ThreadPriority) -> libc::c_int {
    match priority {
        ThreadPriority::Normal => 0,
        ThreadPriority::High => -10,
        ThreadPriority::Highest => -20,
    }
}

/// Linux schedules threads as tasks, so `setpriority` on the thread id only
/// touches the calling thread.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn set_current_thread_priority(priority: ThreadPriority) -> io::Result<()> {
    // SAFETY: gettid has no preconditions and cannot fail.
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    let who = tid as libc::id_t;
    // SAFETY: plain syscall on our own task id.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, who, nice_value(priority)) };
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn set_current_thread_priority(priority: ThreadPriority) -> io::Result<()> {
    match priority {
        ThreadPriority::Normal => Ok(()),
        ThreadPriority::High | ThreadPriority::Highest => Err(Error::new(
            io::ErrorKind::Unsupported,
            "per-thread priority is not adjustable on this platform",
        )),
    }
}
