// Deferred log entries and buffer ownership states

use crate::sink::AsyncLog;

/// A deferred logging action.
///
/// Producers capture whatever they want recorded (strings, numbers, latency
/// samples) and move the closure into their thread's write buffer. The I/O
/// thread later invokes it with the sink, so all stringification and output
/// happen off the hot path. Entries are moved, never copied, and run exactly
/// once.
pub type LogEntry = Box<dyn FnOnce(&mut AsyncLog) + Send>;

/// Buffer ownership states for the per-thread double buffer.
///
/// Three states rather than two: the I/O thread must be able to tell
/// "producer is appending" apart from "consumer is draining" so it can skip
/// a busy buffer instead of stealing it.
pub(crate) const UNLOCKED: u8 = 0;
pub(crate) const READ_LOCK: u8 = 1;
pub(crate) const WRITE_LOCK: u8 = 2;

/// Get current thread ID (truncated to u32)
pub(crate) fn current_thread_id() -> u32 {
    #[cfg(target_os = "linux")]
    {
        unsafe { libc::gettid() as u32 }
    }
    #[cfg(not(target_os = "linux"))]
    {
        use std::sync::atomic::{AtomicU32, Ordering};
        static NEXT_TID: AtomicU32 = AtomicU32::new(1);
        thread_local! {
            static TID: u32 = NEXT_TID.fetch_add(1, Ordering::Relaxed);
        }
        TID.with(|tid| *tid)
    }
}
