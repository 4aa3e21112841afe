// Shared helpers for the end-to-end logging tests
#![allow(dead_code)]

use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use swaplog::{LogConfig, Logger};

/// In-memory output stream, cloneable so the test keeps a reading side
/// while the sink owns the writing side.
#[derive(Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_owned).collect()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Construct a logger with capture streams installed and the I/O thread
/// running. Returns (logger, summary, detail).
pub fn start_logger(
    poll: Duration,
    max_threads: usize,
) -> anyhow::Result<(Arc<Logger>, SharedBuf, SharedBuf)> {
    let logger = Logger::new(LogConfig {
        poll_period: poll,
        max_threads,
    })?;
    let summary = SharedBuf::new();
    let detail = SharedBuf::new();
    logger.start_logging(Box::new(summary.clone()), Box::new(detail.clone()));
    logger.start_io_thread();
    Ok((logger, summary, detail))
}

/// Parse a "tid=<t> seq=<s>" pair out of a detail line, if present.
pub fn parse_tagged_line(line: &str) -> Option<(usize, usize)> {
    let rest = line.split("tid=").nth(1)?;
    let mut fields = rest.split(" seq=");
    let tid = fields.next()?.trim().parse().ok()?;
    let seq = fields.next()?.trim().parse().ok()?;
    Some((tid, seq))
}
