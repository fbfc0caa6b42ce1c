//! Output relay
//!
//! Drains the output queue in batch windows and forwards each batch to the
//! configured sink as a single message.

pub mod markdown;
pub mod sink;

use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Level, error, info, trace};

use crate::config::BatchConfig;
use crate::io::output::QueueReader;
use crate::io::process::ServerPresence;
use crate::log_timing;

pub use markdown::{decode_record, escape_markdown};
pub use sink::{DiscordChannelSink, OutputSink, StdoutSink};

/// Records accumulated during one flush cycle
///
/// Bounded by wall-clock time and by record count; thrown away after the
/// flush attempt whether or not delivery succeeded.
#[derive(Debug)]
pub struct BatchWindow {
    text: String,
    records: usize,
    opened_at: Instant,
    config: BatchConfig,
}

impl BatchWindow {
    pub fn open(config: BatchConfig) -> Self {
        Self {
            text: String::new(),
            records: 0,
            opened_at: Instant::now(),
            config,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.opened_at.elapsed() >= self.config.window_timeout
    }

    pub fn is_full(&self) -> bool {
        self.records >= self.config.max_records
    }

    pub fn append(&mut self, record: &[u8]) {
        if record.is_empty() {
            trace!("BatchWindow: empty record");
        }
        self.text.push_str(&decode_record(record));
        self.records += 1;
    }

    pub fn records(&self) -> usize {
        self.records
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Result of a single flush cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// No server process present
    Skipped,
    /// Window closed without any text
    Empty,
    Delivered { records: usize },
    Failed { records: usize },
}

/// Periodically moves queued output into the sink
pub struct OutputRelay {
    presence: Arc<dyn ServerPresence>,
    queue: QueueReader,
    sink: Arc<dyn OutputSink>,
    config: BatchConfig,
}

impl OutputRelay {
    pub fn new(
        presence: Arc<dyn ServerPresence>,
        queue: QueueReader,
        sink: Arc<dyn OutputSink>,
        config: BatchConfig,
    ) -> Self {
        Self {
            presence,
            queue,
            sink,
            config,
        }
    }

    /// Flush on a fixed period for the lifetime of the process
    pub async fn run(mut self) {
        info!(
            "Output relay started (every {:?}, window {:?} / {} records)",
            self.config.flush_period, self.config.window_timeout, self.config.max_records
        );

        let mut ticker = tokio::time::interval(self.config.flush_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.flush_cycle().await;
        }
    }

    /// Run one batch window and deliver whatever it collected
    pub async fn flush_cycle(&mut self) -> FlushOutcome {
        if !self.presence.is_present() {
            return FlushOutcome::Skipped;
        }

        let started = Instant::now();
        let window = self.collect_window().await;
        let records = window.records();

        if window.text().is_empty() {
            return FlushOutcome::Empty;
        }

        let message = escape_markdown(window.text());
        let outcome = match self.sink.deliver(&message).await {
            Ok(()) => {
                trace!("OutputRelay: delivered {} records", records);
                FlushOutcome::Delivered { records }
            }
            Err(e) => {
                error!("Failed to deliver {} console records: {}", records, e);
                FlushOutcome::Failed { records }
            }
        };

        log_timing!(Level::TRACE, "relay_flush", started.elapsed());
        outcome
    }

    /// Pop records until the queue runs dry or either window bound is hit
    async fn collect_window(&mut self) -> BatchWindow {
        let mut window = BatchWindow::open(self.config);

        while !window.is_expired() {
            tokio::time::sleep(self.config.poll_interval).await;

            let Some(record) = self.queue.try_pop() else {
                break;
            };
            window.append(&record);

            if window.is_full() {
                break;
            }
        }

        window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::output::{QueueWriter, output_queue};
    use crate::relay::sink::RecordingSink;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[cfg(feature = "test-logging")]
    crate::setup_test_logging!();

    struct FixedPresence(AtomicBool);

    impl ServerPresence for FixedPresence {
        fn is_present(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn generous() -> BatchConfig {
        BatchConfig {
            flush_period: Duration::from_secs(1),
            window_timeout: Duration::from_secs(60),
            max_records: 1000,
            poll_interval: Duration::from_millis(100),
        }
    }

    fn relay_with(config: BatchConfig, present: bool) -> (OutputRelay, QueueWriter, Arc<RecordingSink>) {
        let (writer, reader) = output_queue(100_000);
        let sink = Arc::new(RecordingSink::default());
        let relay = OutputRelay::new(
            Arc::new(FixedPresence(AtomicBool::new(present))),
            reader,
            sink.clone(),
            config,
        );
        (relay, writer, sink)
    }

    fn push_all(writer: &QueueWriter, lines: &[&str]) {
        for line in lines {
            assert!(writer.push(line.as_bytes().to_vec()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_lines_delivered_as_one_message() {
        let (mut relay, writer, sink) = relay_with(generous(), true);
        push_all(&writer, &["Server started\n", "Player joined\n"]);

        let outcome = relay.flush_cycle().await;

        assert_eq!(outcome, FlushOutcome::Delivered { records: 2 });
        assert_eq!(sink.messages(), vec!["Server started\nPlayer joined\n".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_is_markdown_escaped() {
        let (mut relay, writer, sink) = relay_with(generous(), true);
        push_all(&writer, &["Steve_1 joined\n", "*wave*\n"]);

        relay.flush_cycle().await;

        assert_eq!(sink.messages(), vec!["Steve\\_1 joined\n\\*wave\\*\n".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_queue_delivers_nothing() {
        let (mut relay, _writer, sink) = relay_with(generous(), true);

        let outcome = relay.flush_cycle().await;

        assert_eq!(outcome, FlushOutcome::Empty);
        assert!(sink.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_records_deliver_nothing() {
        let (mut relay, writer, sink) = relay_with(generous(), true);
        push_all(&writer, &["", ""]);

        let outcome = relay.flush_cycle().await;

        assert_eq!(outcome, FlushOutcome::Empty);
        assert!(sink.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_server_skips_flush() {
        let (mut relay, writer, sink) = relay_with(generous(), false);
        push_all(&writer, &["left over\n"]);

        let outcome = relay.flush_cycle().await;

        assert_eq!(outcome, FlushOutcome::Skipped);
        assert!(sink.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_closes_at_record_bound() {
        let (mut relay, writer, sink) = relay_with(BatchConfig::default(), true);
        let lines: Vec<String> = (0..20).map(|i| format!("line {i}\n")).collect();
        for line in &lines {
            writer.push(line.clone().into_bytes());
        }

        let first = relay.flush_cycle().await;
        let second = relay.flush_cycle().await;

        assert_eq!(first, FlushOutcome::Delivered { records: 13 });
        assert_eq!(second, FlushOutcome::Delivered { records: 7 });

        let messages = sink.messages();
        assert_eq!(messages[0], lines[..13].concat());
        assert_eq!(messages[1], lines[13..].concat());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_closes_at_time_bound() {
        let config = BatchConfig {
            flush_period: Duration::from_secs(1),
            window_timeout: Duration::from_secs(10),
            max_records: 100,
            poll_interval: Duration::from_secs(1),
        };
        let (mut relay, writer, sink) = relay_with(config, true);
        let lines: Vec<String> = (0..50).map(|i| format!("tick {i}\n")).collect();
        for line in &lines {
            writer.push(line.clone().into_bytes());
        }

        let started = Instant::now();
        let outcome = relay.flush_cycle().await;

        assert_eq!(outcome, FlushOutcome::Delivered { records: 10 });
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11));
        assert_eq!(sink.messages(), vec![lines[..10].concat()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_delivery_discards_batch() {
        let (mut relay, writer, sink) = relay_with(generous(), true);
        sink.fail.store(true, Ordering::SeqCst);
        push_all(&writer, &["lost\n"]);

        assert_eq!(relay.flush_cycle().await, FlushOutcome::Failed { records: 1 });

        sink.fail.store(false, Ordering::SeqCst);
        push_all(&writer, &["kept\n"]);
        relay.flush_cycle().await;

        assert_eq!(sink.messages(), vec!["kept\n".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_concatenate_to_original_sequence() {
        let config = BatchConfig {
            max_records: 7,
            ..BatchConfig::default()
        };
        let (mut relay, writer, sink) = relay_with(config, true);

        // Irregular line lengths, no markdown so escaping is the identity
        let lines: Vec<String> = (0..100)
            .map(|i| format!("entry {} {}\n", i, "x".repeat((i * 37) % 11)))
            .collect();
        for line in &lines {
            writer.push(line.clone().into_bytes());
        }

        let mut delivered = 0;
        while delivered < lines.len() {
            match relay.flush_cycle().await {
                FlushOutcome::Delivered { records } => {
                    assert!(records <= 7);
                    delivered += records;
                }
                other => panic!("unexpected outcome {other:?}"),
            }
        }

        let messages = sink.messages();
        assert_eq!(messages.concat(), lines.concat());
        for message in &messages {
            // Every message is made of whole records
            assert!(message.ends_with('\n'));
            assert!(message.lines().all(|l| l.starts_with("entry ")));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_flushes_periodically() {
        let (relay, writer, sink) = relay_with(generous(), true);
        let task = tokio::spawn(relay.run());

        push_all(&writer, &["first\n"]);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        push_all(&writer, &["second\n"]);
        tokio::time::sleep(Duration::from_secs(2)).await;

        task.abort();
        assert_eq!(
            sink.messages(),
            vec!["first\n".to_string(), "second\n".to_string()]
        );
    }
}
