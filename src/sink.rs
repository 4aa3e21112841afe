// SPDX-License-Identifier: Apache-2.0 OR MIT
// The sink: stringification and output, all on the I/O thread
//
// AsyncLog is the object every deferred entry receives. It owns the
// summary, detail and trace output streams, so the only code that ever
// touches them runs on the I/O thread (plus the mutex-guarded synchronous
// error path).

use chrono::Local;
use std::io::{self, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

/// Latency sample in nanoseconds.
pub type LatencyNanos = i64;

/// Shared latency accumulator.
///
/// Entries record into it from the I/O thread; harness threads block on
/// [`LatencyStore::get_blocking`] until the expected sample count arrives.
/// It deliberately lives outside the sink mutex so a blocked collector
/// never holds up entry execution.
pub(crate) struct LatencyStore {
    samples: Mutex<Vec<LatencyNanos>>,
    recorded: Condvar,
}

impl LatencyStore {
    pub(crate) fn new() -> Self {
        Self {
            samples: Mutex::new(Vec::new()),
            recorded: Condvar::new(),
        }
    }

    pub(crate) fn restart(&self) {
        self.samples.lock().unwrap().clear();
    }

    pub(crate) fn record(&self, latency: LatencyNanos) {
        self.samples.lock().unwrap().push(latency);
        self.recorded.notify_all();
    }

    pub(crate) fn get_blocking(&self, expected_count: usize) -> Vec<LatencyNanos> {
        let guard = self.samples.lock().unwrap();
        let mut guard = self
            .recorded
            .wait_while(guard, |samples| samples.len() < expected_count)
            .unwrap();
        std::mem::take(&mut *guard)
    }
}

type OutputStream = Box<dyn Write + Send>;

/// The formatting and output backend handed to every entry.
pub struct AsyncLog {
    summary_out: Option<OutputStream>,
    detail_out: Option<OutputStream>,
    trace_out: Option<OutputStream>,
    log_origin: Instant,
    trace_origin: Instant,
    current_pid_tid: String,
    latencies: Arc<LatencyStore>,
}

impl AsyncLog {
    pub(crate) fn new(latencies: Arc<LatencyStore>) -> Self {
        let now = Instant::now();
        Self {
            summary_out: None,
            detail_out: None,
            trace_out: None,
            log_origin: now,
            trace_origin: now,
            current_pid_tid: format!("\"pid\": {}, \"tid\": 0, ", std::process::id()),
            latencies,
        }
    }

    /// Append one line to the detail stream.
    pub fn log_detail(&mut self, message: &str) {
        let offset_us = self.log_origin.elapsed().as_micros();
        if let Some(out) = self.detail_out.as_mut() {
            let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            let _ = writeln!(out, "[{}] [{} us] {}", timestamp, offset_us, message);
        }
    }

    /// Append one line to the summary stream.
    pub fn log_summary(&mut self, message: &str) {
        let offset_us = self.log_origin.elapsed().as_micros();
        if let Some(out) = self.summary_out.as_mut() {
            let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            let _ = writeln!(out, "[{}] [{} us] {}", timestamp, offset_us, message);
        }
    }

    /// Emit an instant trace event under the current thread identity.
    pub fn trace_event(&mut self, name: &str, args: &[(&str, String)]) {
        let ts_us = Instant::now()
            .saturating_duration_since(self.trace_origin)
            .as_micros();
        let event = format!(
            "{{ \"name\": \"{}\", \"ph\": \"i\", {}\"ts\": {}, \"args\": {{ {} }} }}",
            name,
            self.current_pid_tid,
            ts_us,
            format_args_json(args),
        );
        self.write_trace_line(&event);
    }

    /// Emit a complete-duration trace event for a measured span.
    pub fn scoped_trace(&mut self, name: &str, start: Instant, end: Instant, args: &[(&str, String)]) {
        let ts_us = start
            .saturating_duration_since(self.trace_origin)
            .as_micros();
        let dur_us = end.saturating_duration_since(start).as_micros();
        let event = format!(
            "{{ \"name\": \"{}\", \"ph\": \"X\", {}\"ts\": {}, \"dur\": {}, \"args\": {{ {} }} }}",
            name,
            self.current_pid_tid,
            ts_us,
            dur_us,
            format_args_json(args),
        );
        self.write_trace_line(&event);
    }

    /// Install the identity fragment spliced into every trace event. The
    /// I/O thread calls this before draining each producer's buffer.
    pub fn set_current_trace_pid_tid(&mut self, pid_tid: &str) {
        self.current_pid_tid.clear();
        self.current_pid_tid.push_str(pid_tid);
    }

    /// Replace the summary and detail streams, flushing the old ones.
    /// `origin` rebases the per-line microsecond offsets.
    pub fn set_log_files(
        &mut self,
        summary: Option<OutputStream>,
        detail: Option<OutputStream>,
        origin: Instant,
    ) {
        if let Some(out) = self.summary_out.as_mut() {
            let _ = out.flush();
        }
        if let Some(out) = self.detail_out.as_mut() {
            let _ = out.flush();
        }
        self.summary_out = summary;
        self.detail_out = detail;
        self.log_origin = origin;
    }

    /// Close any trace in progress and begin a new one on `out`.
    pub fn start_new_trace(&mut self, out: Option<OutputStream>, origin: Instant) {
        if let Some(old) = self.trace_out.as_mut() {
            let _ = writeln!(old, "{{ \"name\": \"trace_end\" }} ]");
            let _ = old.flush();
        }
        self.trace_out = out;
        self.trace_origin = origin;
        if let Some(new) = self.trace_out.as_mut() {
            let _ = writeln!(new, "[");
        }
    }

    /// Close the current trace stream.
    pub fn stop_tracing(&mut self) {
        self.start_new_trace(None, Instant::now());
    }

    pub fn restart_latency_recording(&mut self) {
        self.latencies.restart();
    }

    /// Record one latency sample. Callable from entries.
    pub fn record_latency(&mut self, latency: LatencyNanos) {
        self.latencies.record(latency);
    }

    /// Block until `expected_count` samples have been recorded since the
    /// last restart, then drain and return them.
    pub fn get_latencies_blocking(&self, expected_count: usize) -> Vec<LatencyNanos> {
        self.latencies.get_blocking(expected_count)
    }

    /// Flush every output stream. The I/O thread calls this once per tick.
    pub fn flush(&mut self) {
        if let Some(out) = self.summary_out.as_mut() {
            let _ = out.flush();
        }
        if let Some(out) = self.detail_out.as_mut() {
            let _ = out.flush();
        }
        if let Some(out) = self.trace_out.as_mut() {
            let _ = out.flush();
        }
    }

    /// Synchronous error line, flushed immediately. Falls back to stderr
    /// when no detail stream is installed so fatal diagnostics are never
    /// silently dropped.
    pub(crate) fn write_error_line(&mut self, message: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        match self.detail_out.as_mut() {
            Some(out) => {
                let _ = writeln!(out, "[{}] ERROR : {}", timestamp, message);
                let _ = out.flush();
            }
            None => {
                let _ = writeln!(io::stderr(), "[{}] ERROR : {}", timestamp, message);
            }
        }
    }

    fn write_trace_line(&mut self, event: &str) {
        if let Some(out) = self.trace_out.as_mut() {
            let _ = writeln!(out, "{},", event);
        }
    }
}

fn format_args_json(args: &[(&str, String)]) -> String {
    args.iter()
        .map(|(key, value)| format!("\"{}\": \"{}\"", key, value))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Measures a wall-clock span and submits a trace event for it on drop,
/// through the global logger.
pub struct ScopedTracer {
    name: &'static str,
    start: Instant,
}

impl ScopedTracer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }
}

impl Drop for ScopedTracer {
    fn drop(&mut self) {
        let name = self.name;
        let start = self.start;
        let end = Instant::now();
        crate::log(move |log| log.scoped_trace(name, start, end, &[]));
    }
}
