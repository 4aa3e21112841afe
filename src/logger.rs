// Logger core: thread registry, orphan list and the I/O thread
//
// The I/O thread is the single consumer for every producer's double
// buffer. Each tick it gathers swap requests from the ring, swaps the
// threads whose previous read side has been drained, executes the drained
// entries against the sink and flushes once. Mutexes guard only the cold
// paths (registry, orphans, sink installation); the log/swap/drain paths
// are mutex-free.

use std::io;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::LogConfig;
use crate::error::LogError;
use crate::sink::{AsyncLog, LatencyNanos, LatencyStore};
use crate::swap_ring::{Claim, SwapRing};
use crate::thread_log::ThreadLog;

/// A `ThreadLog` pointer as carried through the ring and the I/O thread's
/// working lists.
#[derive(Clone, Copy)]
struct TlsRef(*const ThreadLog);

// SAFETY: the pointee is Send + Sync; the raw pointer only exists so the
// ring can store it in one machine word.
unsafe impl Send for TlsRef {}

impl TlsRef {
    /// SAFETY: pointers originate from `Arc<ThreadLog>`s held by the
    /// registry or the orphan list. An orphan is only dropped after its
    /// final entry has executed, which happens strictly after the pointer
    /// has left the ring and every consumer-side list, so the reference
    /// never outlives the allocation.
    fn get(&self) -> &ThreadLog {
        unsafe { &*self.0 }
    }
}

struct SlotRetry {
    slot: usize,
    next_id: usize,
}

/// State owned by the I/O thread across ticks.
#[derive(Default)]
struct IoThreadState {
    swap_request_id_read: usize,
    slots_to_retry: Vec<SlotRetry>,
    threads_to_swap_deferred: Vec<TlsRef>,
    threads_to_read: Vec<TlsRef>,
}

struct IoSignal {
    keep_alive: Mutex<bool>,
    wake: Condvar,
}

/// The logging core. Owns the swap ring, the registry of live
/// [`ThreadLog`]s, the orphan list, the sink and the I/O thread.
pub struct Logger {
    poll_period: Duration,
    max_threads: usize,

    ring: SwapRing,
    registry: Mutex<Vec<Arc<ThreadLog>>>,
    orphans: Mutex<Vec<Arc<ThreadLog>>>,
    // Orphan identities whose final entry has executed; reaped at the end
    // of each tick. Written only from entries running on the I/O thread.
    orphans_to_destroy: Mutex<Vec<usize>>,

    sink: Mutex<AsyncLog>,
    latencies: Arc<LatencyStore>,

    io: IoSignal,
    io_thread: Mutex<Option<JoinHandle<()>>>,

    // Contention diagnostics, all relaxed. Reported at stop_logging.
    swap_request_slots_retry_count: AtomicUsize,
    swap_request_slots_retry_retry_count: AtomicUsize,
    swap_request_slots_retry_reencounter_count: AtomicUsize,
    start_reading_entries_retry_count: AtomicUsize,
    tls_total_log_cas_fail_count: AtomicUsize,
    tls_total_swap_slot_retry_count: AtomicUsize,
}

impl Logger {
    pub fn new(config: LogConfig) -> Result<Arc<Self>, LogError> {
        config.validate()?;
        let latencies = Arc::new(LatencyStore::new());
        Ok(Arc::new(Self {
            poll_period: config.poll_period,
            max_threads: config.max_threads,
            ring: SwapRing::new(config.max_threads),
            registry: Mutex::new(Vec::new()),
            orphans: Mutex::new(Vec::new()),
            orphans_to_destroy: Mutex::new(Vec::new()),
            sink: Mutex::new(AsyncLog::new(Arc::clone(&latencies))),
            latencies,
            io: IoSignal {
                keep_alive: Mutex::new(false),
                wake: Condvar::new(),
            },
            io_thread: Mutex::new(None),
            swap_request_slots_retry_count: AtomicUsize::new(0),
            swap_request_slots_retry_retry_count: AtomicUsize::new(0),
            swap_request_slots_retry_reencounter_count: AtomicUsize::new(0),
            start_reading_entries_retry_count: AtomicUsize::new(0),
            tls_total_log_cas_fail_count: AtomicUsize::new(0),
            tls_total_swap_slot_retry_count: AtomicUsize::new(0),
        }))
    }

    /// Register the calling thread as a producer. The handle is the
    /// thread's private submission endpoint; dropping it (normally at
    /// thread exit) orphans the underlying buffers so the thread can
    /// terminate without waiting for the I/O thread.
    pub fn thread_handle(self: &Arc<Self>) -> ThreadLogHandle {
        let tls = Arc::new(ThreadLog::new());
        self.register(&tls);
        ThreadLogHandle {
            logger: Arc::clone(self),
            tls: Some(tls),
            _not_sync: PhantomData,
        }
    }

    fn register(&self, tls: &Arc<ThreadLog>) {
        let over_capacity = {
            let mut registry = self.registry.lock().unwrap();
            registry.push(Arc::clone(tls));
            registry.len() > self.max_threads
        };
        // Warn outside the registry lock: the sink lock is taken after the
        // registry lock nowhere else.
        if over_capacity {
            self.log_error_sync(
                &LogError::TooManyThreads {
                    max: self.max_threads,
                }
                .to_string(),
            );
        }
    }

    /// Move ownership of an exiting thread's buffers into the orphan list
    /// and queue its final entry. The entry executes on the I/O thread
    /// after the buffers have drained; only then is the orphan reaped, so
    /// the I/O thread never reads from freed storage.
    fn unregister(self: &Arc<Self>, tls: Arc<ThreadLog>) {
        let tls_id = Arc::as_ptr(&tls) as usize;
        self.orphans.lock().unwrap().push(Arc::clone(&tls));

        // Remove from the registry only after the orphan list holds the
        // thread, so stats collection never has a coverage gap.
        self.registry
            .lock()
            .unwrap()
            .retain(|t| !Arc::ptr_eq(t, &tls));

        let logger = Arc::downgrade(self);
        let tls_weak = Arc::downgrade(&tls);
        tls.log(
            self,
            Box::new(move |_log| {
                if let Some(logger) = logger.upgrade() {
                    if let Some(tls) = tls_weak.upgrade() {
                        logger.collect_thread_stats(&tls);
                    }
                    logger.orphans_to_destroy.lock().unwrap().push(tls_id);
                }
            }),
        );
    }

    /// Post "swap me" on the ring for `tls`. Lock-free; called by the
    /// producer from inside [`ThreadLog::log`].
    pub(crate) fn request_swap_buffers(&self, tls: &ThreadLog) {
        let retries = self.ring.post(tls as *const ThreadLog);
        if retries > 0 {
            tls.note_swap_slot_retries(retries);
        }
    }

    fn collect_thread_stats(&self, tls: &ThreadLog) {
        self.tls_total_log_cas_fail_count
            .fetch_add(tls.report_log_cas_fail_count(), Ordering::Relaxed);
        self.tls_total_swap_slot_retry_count
            .fetch_add(tls.report_swap_slot_retry_count(), Ordering::Relaxed);
    }

    /// Write an error line straight to the sink, bypassing the lock-free
    /// path. Only for invariant violations and configuration warnings.
    pub fn log_error_sync(&self, message: &str) {
        self.sink.lock().unwrap().write_error_line(message);
    }

    /// A CAS the protocol asserts must succeed has failed: the ownership
    /// state machine is broken and entries can no longer be trusted not to
    /// race. Report synchronously and abort.
    pub(crate) fn fatal_invariant(&self, what: &str) -> ! {
        self.log_error_sync(&LogError::InvariantViolation(what.to_string()).to_string());
        std::process::abort();
    }

    // ------------------------------------------------------------------
    // Control API
    // ------------------------------------------------------------------

    pub fn start_io_thread(self: &Arc<Self>) {
        *self.io.keep_alive.lock().unwrap() = true;
        let logger = Arc::clone(self);
        let handle = thread::spawn(move || logger.io_thread_loop());
        *self.io_thread.lock().unwrap() = Some(handle);
    }

    pub fn stop_io_thread(&self) {
        {
            let mut keep_alive = self.io.keep_alive.lock().unwrap();
            *keep_alive = false;
            self.io.wake.notify_all();
        }
        if let Some(handle) = self.io_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Install the summary and detail output streams and start logging.
    pub fn start_logging(
        &self,
        summary: Box<dyn io::Write + Send>,
        detail: Box<dyn io::Write + Send>,
    ) {
        self.sink
            .lock()
            .unwrap()
            .set_log_files(Some(summary), Some(detail), Instant::now());
    }

    /// Report contention counters, flush the calling thread's entries and
    /// redirect output to stderr. Requires the I/O thread for the flush
    /// hand-shake and is therefore rejected when called from it.
    pub fn stop_logging(self: &Arc<Self>) {
        let (on_io_thread, io_running) = {
            let guard = self.io_thread.lock().unwrap();
            (
                guard
                    .as_ref()
                    .map_or(false, |h| h.thread().id() == thread::current().id()),
                guard.is_some(),
            )
        };
        if on_io_thread {
            self.log_error_sync(&LogError::StopLoggingFromIoThread.to_string());
            return;
        }

        let handle = self.thread_handle();
        let logger = Arc::downgrade(self);
        handle.log(move |log| {
            let Some(logger) = logger.upgrade() else {
                return;
            };
            {
                let registry = logger.registry.lock().unwrap();
                for tls in registry.iter() {
                    logger.collect_thread_stats(tls);
                }
            }
            {
                let orphans = logger.orphans.lock().unwrap();
                for tls in orphans.iter() {
                    logger.collect_thread_stats(tls);
                }
            }

            log.log_detail("Log Contention Counters:");
            let counters = [
                (
                    logger.swap_request_slots_retry_count.load(Ordering::Relaxed),
                    "swap_request_slots_retry_count",
                ),
                (
                    logger
                        .swap_request_slots_retry_retry_count
                        .load(Ordering::Relaxed),
                    "swap_request_slots_retry_retry_count",
                ),
                (
                    logger
                        .swap_request_slots_retry_reencounter_count
                        .load(Ordering::Relaxed),
                    "swap_request_slots_retry_reencounter_count",
                ),
                (
                    logger.start_reading_entries_retry_count.load(Ordering::Relaxed),
                    "start_reading_entries_retry_count",
                ),
                (
                    logger.tls_total_log_cas_fail_count.load(Ordering::Relaxed),
                    "tls_total_log_cas_fail_count",
                ),
                (
                    logger.tls_total_swap_slot_retry_count.load(Ordering::Relaxed),
                    "tls_total_swap_buffers_slot_retry_count",
                ),
            ];
            for (count, name) in counters {
                log.log_detail(&format!("{} : {}", count, name));
            }
        });

        if io_running {
            handle.flush();
        }
        drop(handle);

        self.sink.lock().unwrap().set_log_files(
            Some(Box::new(io::stderr())),
            Some(Box::new(io::stderr())),
            Instant::now(),
        );
    }

    /// Begin a new trace on `out` with timestamps relative to `origin`.
    pub fn start_new_trace(&self, out: Box<dyn io::Write + Send>, origin: Instant) {
        self.sink
            .lock()
            .unwrap()
            .start_new_trace(Some(out), origin);
    }

    /// Flush the calling thread's pending trace entries, then close the
    /// trace stream.
    pub fn stop_tracing(self: &Arc<Self>) {
        let io_running = self.io_thread.lock().unwrap().is_some();
        if io_running {
            let handle = self.thread_handle();
            handle.flush();
        }
        self.sink.lock().unwrap().stop_tracing();
    }

    pub fn restart_latency_recording(&self) {
        self.latencies.restart();
    }

    /// Block until `expected_count` latency samples have been recorded,
    /// then drain and return them.
    pub fn get_latencies_blocking(&self, expected_count: usize) -> Vec<LatencyNanos> {
        self.latencies.get_blocking(expected_count)
    }

    /// Threads currently registered as producers.
    pub fn registered_thread_count(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    /// Exited threads whose buffers have not been fully drained yet.
    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().unwrap().len()
    }

    // ------------------------------------------------------------------
    // I/O thread
    // ------------------------------------------------------------------

    fn io_thread_loop(self: Arc<Self>) {
        let mut state = IoThreadState::default();
        loop {
            // Sample the stop flag before the tick: the tick that observes
            // the stop signal runs in full, so every request posted before
            // stop_io_thread() still gets gathered and drained.
            let keep_running = {
                let keep_alive = self.io.keep_alive.lock().unwrap();
                let (keep_alive, _) = self
                    .io
                    .wake
                    .wait_timeout_while(keep_alive, self.poll_period, |keep| *keep)
                    .unwrap();
                *keep_alive
            };

            self.gather_swap_requests(&mut state);
            self.process_threads_to_read(&mut state);
            self.sink.lock().unwrap().flush();
            self.reap_orphans();

            if !keep_running {
                break;
            }
        }
    }

    fn gather_swap_requests(&self, state: &mut IoThreadState) {
        let mut threads_to_swap = std::mem::take(&mut state.threads_to_swap_deferred);
        self.gather_retry_swap_requests(state, &mut threads_to_swap);
        self.gather_new_swap_requests(state, &mut threads_to_swap);

        for tls_ref in threads_to_swap {
            let tls = tls_ref.get();
            if tls.read_buffer_has_been_consumed() {
                tls.swap_buffers(self);
                state.threads_to_read.push(tls_ref);
            } else {
                // Keep the request; swapping now would drop the entries
                // still sitting on the undrained read side.
                state.threads_to_swap_deferred.push(tls_ref);
            }
        }
    }

    fn gather_retry_swap_requests(
        &self,
        state: &mut IoThreadState,
        threads_to_swap: &mut Vec<TlsRef>,
    ) {
        if state.slots_to_retry.is_empty() {
            return;
        }
        let retry_slots = std::mem::take(&mut state.slots_to_retry);
        for slot_retry in retry_slots {
            match self.ring.claim(slot_retry.slot, slot_retry.next_id) {
                Claim::Request(tls) => threads_to_swap.push(TlsRef(tls)),
                Claim::NotPosted => {
                    state.slots_to_retry.push(slot_retry);
                    self.swap_request_slots_retry_retry_count
                        .fetch_add(1, Ordering::Relaxed);
                }
                Claim::Broken(observed) => {
                    self.fatal_invariant(&format!(
                        "retry claim CAS failed, slot {} held {:#x}",
                        slot_retry.slot, observed
                    ));
                }
            }
        }
    }

    fn gather_new_swap_requests(&self, state: &mut IoThreadState, threads_to_swap: &mut Vec<TlsRef>) {
        let swap_request_end = self.ring.pending_end();
        while state.swap_request_id_read < swap_request_end {
            let id = state.swap_request_id_read;
            let slot = id % self.ring.slot_count();
            let next_id = id + self.ring.slot_count();
            match self.ring.claim(slot, next_id) {
                Claim::Request(tls) => threads_to_swap.push(TlsRef(tls)),
                Claim::NotPosted => {
                    // The producer is between its id fetch_add and its slot
                    // CAS. Park the slot on the retry list and move on.
                    self.swap_request_slots_retry_count
                        .fetch_add(1, Ordering::Relaxed);
                    match state.slots_to_retry.iter_mut().find(|r| r.slot == slot) {
                        Some(existing) => {
                            // Still retrying this slot since the last lap.
                            existing.next_id = next_id;
                            self.swap_request_slots_retry_reencounter_count
                                .fetch_add(1, Ordering::Relaxed);
                        }
                        None => state.slots_to_retry.push(SlotRetry { slot, next_id }),
                    }
                }
                Claim::Broken(observed) => {
                    self.fatal_invariant(&format!(
                        "claim CAS failed, slot {} held {:#x}",
                        slot, observed
                    ));
                }
            }
            state.swap_request_id_read += 1;
        }
    }

    fn process_threads_to_read(&self, state: &mut IoThreadState) {
        state.threads_to_read.retain(|tls_ref| {
            let tls = tls_ref.get();
            let Some(entries) = tls.start_reading_entries() else {
                // Producer holds the write lock right now; retry next tick.
                self.start_reading_entries_retry_count
                    .fetch_add(1, Ordering::Relaxed);
                return true;
            };

            let mut sink = self.sink.lock().unwrap();
            sink.set_current_trace_pid_tid(tls.trace_pid_tid());
            for entry in entries.drain(..) {
                entry(&mut sink);
            }
            drop(sink);

            tls.finish_reading_entries();
            false
        });
    }

    fn reap_orphans(&self) {
        let to_destroy: Vec<usize> = std::mem::take(&mut *self.orphans_to_destroy.lock().unwrap());
        if to_destroy.is_empty() {
            return;
        }
        let mut orphans = self.orphans.lock().unwrap();
        orphans.retain(|orphan| !to_destroy.contains(&(Arc::as_ptr(orphan) as usize)));
    }
}

/// A producer thread's private submission endpoint.
///
/// Created by [`Logger::thread_handle`]; the free function [`crate::log`]
/// manages one per thread automatically for the global logger. Dropping
/// the handle emits the thread's contention counters as a trace event and
/// orphans the buffers for deferred draining and destruction.
pub struct ThreadLogHandle {
    logger: Arc<Logger>,
    tls: Option<Arc<ThreadLog>>,
    // The double buffer tolerates one producer, not several: keep shared
    // references on one thread.
    _not_sync: PhantomData<std::cell::Cell<()>>,
}

impl ThreadLogHandle {
    /// Submit a deferred entry. Never blocks, never fails.
    pub fn log<F>(&self, entry: F)
    where
        F: FnOnce(&mut AsyncLog) + Send + 'static,
    {
        if let Some(tls) = &self.tls {
            tls.log(&self.logger, Box::new(entry));
        }
    }

    /// Submit a trace event carrying this thread's contention counters.
    pub fn trace_counters(&self) {
        if let Some(tls) = &self.tls {
            let (cas_fails, slot_retries) = tls.counter_snapshot();
            let tid = tls.tid_as_string().to_string();
            self.log(move |log| {
                log.trace_event(
                    "ThreadLog:ContentionCounters",
                    &[
                        ("tid", tid),
                        ("log_cas_fail_count", cas_fails.to_string()),
                        ("swap_buffers_slot_retry_count", slot_retries.to_string()),
                    ],
                );
            });
        }
    }

    /// Block until the I/O thread has executed every entry previously
    /// submitted through this handle. The I/O thread must be running.
    pub fn flush(&self) {
        let (flushed_tx, flushed_rx) = mpsc::channel();
        self.log(move |_| {
            let _ = flushed_tx.send(());
        });
        let _ = flushed_rx.recv();
    }
}

impl Drop for ThreadLogHandle {
    fn drop(&mut self) {
        self.trace_counters();
        if let Some(tls) = self.tls.take() {
            self.logger.unregister(tls);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> LogConfig {
        LogConfig {
            poll_period: Duration::from_millis(1),
            max_threads: 8,
        }
    }

    #[test]
    fn test_register_and_orphan() {
        let logger = Logger::new(test_config()).unwrap();
        let handle = logger.thread_handle();
        assert_eq!(logger.registered_thread_count(), 1);
        assert_eq!(logger.orphan_count(), 0);

        drop(handle);
        assert_eq!(logger.registered_thread_count(), 0);
        assert_eq!(logger.orphan_count(), 1);
    }

    #[test]
    fn test_orphan_reaped_after_drain() {
        let logger = Logger::new(test_config()).unwrap();
        logger.start_io_thread();

        let handle = logger.thread_handle();
        handle.log(|_| {});
        drop(handle);

        let deadline = Instant::now() + Duration::from_secs(2);
        while logger.orphan_count() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(logger.orphan_count(), 0);
        logger.stop_io_thread();
    }

    #[test]
    fn test_capacity_warning_does_not_reject() {
        let logger = Logger::new(LogConfig {
            poll_period: Duration::from_millis(1),
            max_threads: 1,
        })
        .unwrap();
        let first = logger.thread_handle();
        let second = logger.thread_handle();
        assert_eq!(logger.registered_thread_count(), 2);
        drop(second);
        drop(first);
    }

    #[test]
    fn test_stop_io_thread_joins() {
        let logger = Logger::new(test_config()).unwrap();
        logger.start_io_thread();
        logger.stop_io_thread();
        assert!(logger.io_thread.lock().unwrap().is_none());
    }
}
