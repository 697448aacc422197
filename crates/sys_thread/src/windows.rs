use std::io::{self, Error};

use windows_sys::Win32::System::Threading::{
    GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_ABOVE_NORMAL, THREAD_PRIORITY_HIGHEST,
    THREAD_PRIORITY_NORMAL,
};

use crate::ThreadPriority;

pub fn set_current_thread_priority(priority: ThreadPriority) -> io::Result<()> {
    let level = match priority {
        ThreadPriority::Normal => THREAD_PRIORITY_NORMAL,
        ThreadPriority::High => THREAD_PRIORITY_ABOVE_NORMAL,
        ThreadPriority::Highest => THREAD_PRIORITY_HIGHEST,
    };
    // SAFETY: the pseudo handle from GetCurrentThread is always valid for the caller.
    let ok = unsafe { SetThreadPriority(GetCurrentThread(), level) };
    if ok == 0 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}
