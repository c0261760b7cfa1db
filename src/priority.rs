//! Scheduling-class changes for the mixing thread.
use tracing::{debug, warn};

use crate::config::ThreadPriority;

/// Apply `priority` to the calling thread. Failures are logged and otherwise ignored: an
/// unprivileged process still mixes, just with more jitter.
pub fn apply_thread_priority(priority: ThreadPriority) -> bool {
    match priority {
        ThreadPriority::Normal => true,
        ThreadPriority::Realtime(level) => set_realtime(level),
    }
}

#[cfg(unix)]
fn set_realtime(level: i32) -> bool {
    unsafe {
        let mut param: libc::sched_param = std::mem::zeroed();
        let min = libc::sched_get_priority_min(libc::SCHED_FIFO);
        let max = libc::sched_get_priority_max(libc::SCHED_FIFO);
        param.sched_priority = level.clamp(min, max);
        let rc = libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param);
        if rc == 0 {
            debug!(priority = param.sched_priority, "mixing thread set to SCHED_FIFO");
            true
        } else {
            warn!(
                priority = param.sched_priority,
                errno = rc,
                "could not raise mixing thread priority"
            );
            false
        }
    }
}

#[cfg(not(unix))]
fn set_realtime(level: i32) -> bool {
    warn!(priority = level, "real-time priority not supported on this platform");
    false
}
