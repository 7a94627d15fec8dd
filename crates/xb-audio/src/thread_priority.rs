//! Real-Time Thread Priority
//!
//! Elevates the calling thread for zone worker loops.
//!
//! # Platform Support
//!
//! - **Linux**: SCHED_FIFO, falling back to SCHED_RR (requires CAP_SYS_NICE or root)
//! - everything else: unsupported, the thread keeps its default priority
//!
//! Call once at the start of the worker thread, never per period.

/// Result of priority elevation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityResult {
    /// Successfully elevated to real-time priority
    Success,
    /// Failed to set priority (non-fatal, will use default)
    Failed,
    /// Platform not supported
    Unsupported,
}

/// Promote the current thread to real-time scheduling at `priority`
pub fn promote_current_thread(priority: i32) -> PriorityResult {
    let result = platform_set_priority(priority);

    match result {
        PriorityResult::Success => {
            log::info!("zone thread elevated to real-time priority {}", priority);
        }
        PriorityResult::Failed => {
            log::warn!("failed to set real-time thread priority (non-fatal)");
        }
        PriorityResult::Unsupported => {
            log::debug!("real-time priority not supported on this platform");
        }
    }

    result
}

// ═══════════════════════════════════════════════════════════════════════════════
// Linux Implementation
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(target_os = "linux")]
fn platform_set_priority(priority: i32) -> PriorityResult {
    use libc::{SCHED_FIFO, SCHED_RR, pthread_self, pthread_setschedparam, sched_param};
    use xb_core::RT_PRIORITY_RANGE;

    let param = sched_param {
        sched_priority: priority.clamp(*RT_PRIORITY_RANGE.start(), *RT_PRIORITY_RANGE.end()),
    };
    // SAFETY: pthread_self is always valid for the calling thread and param outlives the call.
    let thread = unsafe { pthread_self() };
    let result = unsafe { pthread_setschedparam(thread, SCHED_FIFO, &param) };
    if result == 0 {
        return PriorityResult::Success;
    }

    log::debug!("SCHED_FIFO failed (errno {}), trying SCHED_RR", result);

    // SAFETY: as above
    let result = unsafe { pthread_setschedparam(thread, SCHED_RR, &param) };
    if result == 0 {
        PriorityResult::Success
    } else {
        log::debug!("SCHED_RR failed (errno {})", result);
        PriorityResult::Failed
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Unsupported Platforms
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(not(target_os = "linux"))]
fn platform_set_priority(_priority: i32) -> PriorityResult {
    PriorityResult::Unsupported
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promote_is_non_fatal() {
        let handle = std::thread::spawn(|| promote_current_thread(10));
        let result = handle.join().unwrap();
        assert!(matches!(
            result,
            PriorityResult::Success | PriorityResult::Failed | PriorityResult::Unsupported
        ));
    }
}
