// Producer lifecycle tests: thread exit with entries in flight, orphan
// reclamation, ring pressure with a small ring, stalled producers.

mod common;

use std::io::Read;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use common::{parse_tagged_line, start_logger};

fn wait_for_orphans_reaped(logger: &Arc<swaplog::Logger>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if logger.orphan_count() == 0 {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    logger.orphan_count() == 0
}

#[test]
fn test_thread_exit_mid_flight() -> anyhow::Result<()> {
    let (logger, _summary, detail) = start_logger(Duration::from_millis(2), 16)?;

    {
        let logger = Arc::clone(&logger);
        thread::spawn(move || {
            let handle = logger.thread_handle();
            for seq in 0..1000usize {
                handle.log(move |log| log.log_detail(&format!("tid=0 seq={}", seq)));
            }
            // Handle dropped here: the thread exits without waiting for
            // its entries to drain.
        })
        .join()
        .unwrap();
    }

    logger.stop_logging();

    // The exited thread's buffers are drained and its storage reclaimed.
    assert!(
        wait_for_orphans_reaped(&logger, Duration::from_secs(2)),
        "orphans not reaped: {}",
        logger.orphan_count()
    );
    logger.stop_io_thread();

    let mut next_seq = 0usize;
    for line in detail.lines() {
        let Some((_, seq)) = parse_tagged_line(&line) else {
            continue;
        };
        assert_eq!(seq, next_seq);
        next_seq += 1;
    }
    assert_eq!(next_seq, 1000);
    Ok(())
}

#[test]
fn test_ring_pressure_small_ring() -> anyhow::Result<()> {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 20_000;

    // max_threads = 4 gives a ring of 8 slots; a short poll period forces
    // frequent buffer swaps so the ring actually cycles.
    let (logger, _summary, detail) = start_logger(Duration::from_millis(1), PRODUCERS)?;

    let mut workers = Vec::new();
    for tid in 0..PRODUCERS {
        let logger = Arc::clone(&logger);
        workers.push(thread::spawn(move || {
            let handle = logger.thread_handle();
            for seq in 0..PER_PRODUCER {
                handle.log(move |log| log.log_detail(&format!("tid={} seq={}", tid, seq)));
                if seq % 512 == 0 {
                    thread::yield_now();
                }
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    logger.stop_logging();
    logger.stop_io_thread();

    let mut next_seq = vec![0usize; PRODUCERS];
    let mut total = 0usize;
    for line in detail.lines() {
        let Some((tid, seq)) = parse_tagged_line(&line) else {
            continue;
        };
        assert_eq!(seq, next_seq[tid], "thread {} lost or reordered", tid);
        next_seq[tid] += 1;
        total += 1;
    }
    assert_eq!(total, PRODUCERS * PER_PRODUCER, "entries were lost");
    Ok(())
}

#[test]
fn test_stalled_producer_does_not_block_others() -> anyhow::Result<()> {
    let (logger, _summary, detail) = start_logger(Duration::from_millis(2), 8)?;

    // A producer that registers, logs once, then stalls while still
    // holding its handle.
    let (resume_tx, resume_rx) = mpsc::channel::<()>();
    let stalled = {
        let logger = Arc::clone(&logger);
        thread::spawn(move || {
            let handle = logger.thread_handle();
            handle.log(|log| log.log_detail("tid=0 seq=0"));
            resume_rx.recv().unwrap();
            handle.log(|log| log.log_detail("tid=0 seq=1"));
            handle.flush();
        })
    };

    // Meanwhile another producer makes progress through many ticks.
    let handle = logger.thread_handle();
    for seq in 0..100usize {
        handle.log(move |log| log.log_detail(&format!("tid=1 seq={}", seq)));
        thread::sleep(Duration::from_millis(1));
    }
    handle.flush();

    let delivered = detail
        .lines()
        .iter()
        .filter(|line| line.contains("tid=1"))
        .count();
    assert_eq!(delivered, 100, "active producer was held up");

    // Once the stalled producer resumes, its entries land too.
    resume_tx.send(()).unwrap();
    stalled.join().unwrap();
    assert!(detail.contents().contains("tid=0 seq=1"));

    drop(handle);
    logger.stop_io_thread();
    Ok(())
}

#[test]
fn test_capacity_warning_is_reported_synchronously() -> anyhow::Result<()> {
    let (logger, _summary, detail) = start_logger(Duration::from_millis(2), 2)?;

    let first = logger.thread_handle();
    let second = logger.thread_handle();
    // Third registration exceeds max_threads: warned, not rejected.
    let third = logger.thread_handle();
    assert!(detail.contents().contains("more than 2 threads"));

    // The excess thread still logs normally.
    third.log(|log| log.log_detail("over-capacity entry"));
    third.flush();
    assert!(detail.contents().contains("over-capacity entry"));

    drop(third);
    drop(second);
    drop(first);
    logger.stop_io_thread();
    Ok(())
}

#[test]
fn test_many_exiting_threads_are_all_reclaimed() -> anyhow::Result<()> {
    let (logger, _summary, detail) = start_logger(Duration::from_millis(1), 8)?;

    for wave in 0..4usize {
        let mut workers = Vec::new();
        for t in 0..4usize {
            let logger = Arc::clone(&logger);
            workers.push(thread::spawn(move || {
                let handle = logger.thread_handle();
                for seq in 0..50usize {
                    let tag = wave * 4 + t;
                    handle.log(move |log| log.log_detail(&format!("tid={} seq={}", tag, seq)));
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
    }

    logger.stop_logging();
    assert!(
        wait_for_orphans_reaped(&logger, Duration::from_secs(2)),
        "orphans not reaped: {}",
        logger.orphan_count()
    );
    assert_eq!(logger.registered_thread_count(), 0);
    logger.stop_io_thread();

    let tagged = detail
        .lines()
        .iter()
        .filter(|line| parse_tagged_line(line).is_some())
        .count();
    assert_eq!(tagged, 16 * 50);
    Ok(())
}

#[test]
fn test_detail_log_to_file() -> anyhow::Result<()> {
    let detail_file = tempfile::NamedTempFile::new()?;
    let logger = swaplog::Logger::new(swaplog::LogConfig {
        poll_period: Duration::from_millis(2),
        max_threads: 8,
    })?;
    logger.start_logging(
        Box::new(std::io::sink()),
        Box::new(detail_file.reopen()?),
    );
    logger.start_io_thread();

    let handle = logger.thread_handle();
    handle.log(|log| log.log_detail("persisted line"));
    handle.flush();

    drop(handle);
    logger.stop_io_thread();

    let mut contents = String::new();
    detail_file.reopen()?.read_to_string(&mut contents)?;
    assert!(contents.contains("persisted line"));
    Ok(())
}
