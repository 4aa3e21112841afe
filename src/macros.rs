// SPDX-License-Identifier: Apache-2.0 OR MIT
// Logging macros for convenient logging

/// Log a formatted line to the detail stream via the global logger.
///
/// Formatting happens on the I/O thread; the arguments are captured by
/// value into the deferred entry.
///
/// # Examples
/// ```ignore
/// log_detail!("issued query {} of {}", i, total);
/// ```
#[macro_export]
macro_rules! log_detail {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        $crate::log(move |log| log.log_detail(&message));
    }};
}

/// Log a formatted line to the summary stream via the global logger.
///
/// # Examples
/// ```ignore
/// log_summary!("p99 latency: {} ns", p99);
/// ```
#[macro_export]
macro_rules! log_summary {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        $crate::log(move |log| log.log_summary(&message));
    }};
}

/// Log a formatted error line to the detail stream via the global logger.
/// Asynchronous; for fatal diagnostics use `Logger::log_error_sync`.
///
/// # Examples
/// ```ignore
/// log_error!("response arrived after deadline: {:?}", id);
/// ```
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        $crate::log(move |log| {
            let line = format!("ERROR : {}", message);
            log.log_detail(&line);
        });
    }};
}
