// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Lock-free asynchronous logging for latency-sensitive harnesses.
//!
//! Many worker threads emit log and trace records on hot paths while a
//! single dedicated I/O thread performs all stringification, ordering and
//! output. Producing threads never block, never allocate on a contended
//! structure and never touch a syscall: an entry is a deferred closure
//! pushed onto the thread's private double buffer, and the I/O thread is
//! notified through a lock-free ring of swap requests.
//!
//! Per-thread submission order is preserved end to end; no ordering is
//! guaranteed across threads.
//!
//! # Quick start
//!
//! ```ignore
//! let logger = swaplog::global();
//! logger.start_logging(Box::new(summary_file), Box::new(detail_file));
//! logger.start_io_thread();
//!
//! swaplog::log(|log| log.log_detail("hot path event"));
//!
//! logger.stop_logging();
//! logger.stop_io_thread();
//! ```

mod config;
mod entry;
mod error;
mod logger;
mod macros;
mod sink;
mod swap_ring;
mod thread_log;

pub use config::LogConfig;
pub use entry::LogEntry;
pub use error::LogError;
pub use logger::{Logger, ThreadLogHandle};
pub use sink::{AsyncLog, LatencyNanos, ScopedTracer};

use std::cell::RefCell;
use std::sync::{Arc, OnceLock};

static GLOBAL: OnceLock<Arc<Logger>> = OnceLock::new();

/// The process-wide logger, built with default configuration on first use.
pub fn global() -> &'static Arc<Logger> {
    GLOBAL.get_or_init(|| Logger::new(LogConfig::default()).expect("default config is valid"))
}

thread_local! {
    static THREAD_LOGGER: RefCell<Option<ThreadLogHandle>> = const { RefCell::new(None) };
}

/// Submit a deferred entry to the global logger from any thread.
///
/// The first call on a thread registers it as a producer; the handle lives
/// in thread-local storage and orphans the thread's buffers when the
/// thread exits, so exiting never waits on the I/O thread.
pub fn log<F>(entry: F)
where
    F: FnOnce(&mut AsyncLog) + Send + 'static,
{
    // try_with: entries submitted while thread-local storage is already
    // being torn down have nowhere to queue and are dropped.
    let _ = THREAD_LOGGER.try_with(|slot| {
        let mut slot = slot.borrow_mut();
        let handle = slot.get_or_insert_with(|| global().thread_handle());
        handle.log(entry);
    });
}
