//! Server output capture
//!
//! The output queue is a single-producer/single-consumer FIFO of raw stdout
//! lines. Its two halves are not `Clone`, so the one-reader/one-relay
//! discipline is enforced by ownership rather than by locking. The underlying
//! channel gives every pop a happens-before edge with the matching push, on
//! whichever runtime worker either side runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::ReaderConfig;
use crate::io::process::ProcessSupervisor;

/// One raw line of server output, newline included when present
pub type OutputRecord = Vec<u8>;

/// Counters shared by both halves of the queue
#[derive(Debug, Default)]
struct QueueCounters {
    pending: AtomicUsize,
    dropped: AtomicU64,
}

/// Create an output queue holding at most `capacity` pending records
pub fn output_queue(capacity: usize) -> (QueueWriter, QueueReader) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let counters = Arc::new(QueueCounters::default());

    (
        QueueWriter {
            sender,
            counters: Arc::clone(&counters),
            capacity,
        },
        QueueReader { receiver, counters },
    )
}

/// Producer half, owned by the output reader
#[derive(Debug)]
pub struct QueueWriter {
    sender: mpsc::UnboundedSender<OutputRecord>,
    counters: Arc<QueueCounters>,
    capacity: usize,
}

impl QueueWriter {
    /// Append a record; returns false if it was dropped
    pub fn push(&self, record: OutputRecord) -> bool {
        if self.counters.pending.load(Ordering::Acquire) >= self.capacity {
            let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                "Output queue full ({} pending), dropped record ({} dropped so far)",
                self.capacity, dropped
            );
            return false;
        }

        self.counters.pending.fetch_add(1, Ordering::AcqRel);
        if self.sender.send(record).is_err() {
            self.counters.pending.fetch_sub(1, Ordering::AcqRel);
            trace!("QueueWriter: consumer gone, record discarded");
            return false;
        }
        true
    }

}

/// Consumer half, owned by the output relay
#[derive(Debug)]
pub struct QueueReader {
    receiver: mpsc::UnboundedReceiver<OutputRecord>,
    counters: Arc<QueueCounters>,
}

impl QueueReader {
    /// Pop the oldest record without waiting
    pub fn try_pop(&mut self) -> Option<OutputRecord> {
        let record = self.receiver.try_recv().ok()?;
        self.counters.pending.fetch_sub(1, Ordering::AcqRel);
        Some(record)
    }

    /// Counter view that can be handed to other tasks
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            counters: Arc::clone(&self.counters),
        }
    }
}

/// Read-only view of the queue's pending and dropped counts
#[derive(Debug, Clone)]
pub struct QueueStats {
    counters: Arc<QueueCounters>,
}

impl QueueStats {
    pub fn pending(&self) -> usize {
        self.counters.pending.load(Ordering::Acquire)
    }

    /// Total records dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Output Reader
// ============================================================================

/// Result of one read cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// No server process; nothing to read
    Absent,
    /// A record was queued
    Queued,
    /// A record was read but the queue was full
    Dropped,
    /// EOF or a read error
    Anomaly,
}

/// Moves stdout lines from the server process into the output queue
pub struct OutputReader {
    supervisor: Arc<ProcessSupervisor>,
    queue: QueueWriter,
    poll_interval: Duration,
    eof_reported: bool,
}

impl OutputReader {
    pub fn new(supervisor: Arc<ProcessSupervisor>, queue: QueueWriter, config: ReaderConfig) -> Self {
        Self {
            supervisor,
            queue,
            poll_interval: config.poll_interval,
            eof_reported: false,
        }
    }

    /// Read forever; sleeps only while there is nothing to read
    pub async fn run(mut self) {
        info!("Output reader started");
        loop {
            match self.read_cycle().await {
                ReadOutcome::Queued | ReadOutcome::Dropped => {}
                ReadOutcome::Absent | ReadOutcome::Anomaly => {
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Read at most one record from the current server's stdout
    pub async fn read_cycle(&mut self) -> ReadOutcome {
        let Some(stream) = self
            .supervisor
            .output_stream()
            .and_then(|weak| weak.upgrade())
        else {
            self.eof_reported = false;
            return ReadOutcome::Absent;
        };

        let mut record = Vec::new();
        let result = stream.lock().await.read_until(b'\n', &mut record).await;
        drop(stream);

        match result {
            Ok(0) => {
                if self.eof_reported {
                    trace!("OutputReader: stdout still at EOF");
                } else {
                    warn!("Server stdout returned an empty record (EOF)");
                    self.eof_reported = true;
                }
                if let Some(status) = self.supervisor.reap_exited() {
                    debug!("OutputReader: server reaped with status {}", status);
                }
                ReadOutcome::Anomaly
            }
            Ok(n) => {
                self.eof_reported = false;
                trace!("OutputReader: read {} bytes", n);
                if self.queue.push(record) {
                    ReadOutcome::Queued
                } else {
                    ReadOutcome::Dropped
                }
            }
            Err(e) => {
                warn!("Failed to read server stdout: {}", e);
                ReadOutcome::Anomaly
            }
        }
    }
}
