// =============================================================================
// Buffered Sink — size/time triggered batching in front of a RecordSink
// =============================================================================
//
// A flush sends the entire buffer as one batch. Only a successful write
// clears it; a failed write keeps every record and restarts the timer. Until
// the next success only the time trigger retries, so an unavailable store
// sees at most one attempt per `save_every`. While the store stays down the
// buffer keeps growing, and whatever is still buffered when `close()` fails
// is lost.
// =============================================================================

use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::RecordSink;
use crate::types::{Record, WriteTarget};

/// Flush thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSettings {
    /// Flush once this many records are pending.
    pub buffer_size: usize,
    /// Flush once this much time has passed since the last flush.
    pub save_every: Duration,
    /// Consecutive failures after which the outage is reported at error level.
    pub max_consecutive_failures: u32,
}

/// Counters exposed for the end-of-run summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SinkStats {
    pub flushes: u64,
    pub records_written: u64,
    pub failed_flushes: u64,
    pub pending: usize,
}

pub struct BufferedSink {
    label: &'static str,
    sink: Box<dyn RecordSink>,
    target: WriteTarget,
    settings: BufferSettings,
    buffer: Vec<Record>,
    last_flush: Instant,
    consecutive_failures: u32,
    flushes: u64,
    records_written: u64,
    failed_flushes: u64,
}

impl BufferedSink {
    /// `label` names the stream in logs (`trades`, `candles`).
    pub fn new(
        label: &'static str,
        sink: Box<dyn RecordSink>,
        target: WriteTarget,
        settings: BufferSettings,
    ) -> Self {
        info!(
            label,
            backend = sink.sink_type(),
            target = %target,
            buffer_size = settings.buffer_size,
            save_every_secs = settings.save_every.as_secs_f64(),
            "buffered sink ready"
        );

        Self {
            label,
            sink,
            target,
            settings: BufferSettings {
                buffer_size: settings.buffer_size.max(1),
                ..settings
            },
            buffer: Vec::with_capacity(settings.buffer_size.max(1)),
            last_flush: Instant::now(),
            consecutive_failures: 0,
            flushes: 0,
            records_written: 0,
            failed_flushes: 0,
        }
    }

    /// Append a record, then evaluate both flush triggers.
    pub async fn push(&mut self, record: impl Into<Record>) {
        self.buffer.push(record.into());
        if self.size_due() || self.time_due() {
            let _ = self.flush().await;
        }
    }

    /// Evaluate the time trigger only. Called on every loop iteration so an
    /// idle stream still drains its partial batch.
    pub async fn tick(&mut self) {
        if self.time_due() {
            let _ = self.flush().await;
        }
    }

    /// Write the whole buffer as one batch.
    ///
    /// Either way the timer is reset. On success the buffer is cleared; on
    /// failure nothing is dropped. Returns the number of records written.
    pub async fn flush(&mut self) -> Result<usize> {
        if self.buffer.is_empty() {
            self.last_flush = Instant::now();
            return Ok(0);
        }

        match self.sink.write_batch(&self.buffer, self.target).await {
            Ok(()) => {
                let written = self.buffer.len();
                self.buffer.clear();
                self.last_flush = Instant::now();
                self.consecutive_failures = 0;
                self.flushes += 1;
                self.records_written += written as u64;
                debug!(label = self.label, written, target = %self.target, "batch flushed");
                Ok(written)
            }
            Err(e) => {
                self.last_flush = Instant::now();
                self.consecutive_failures += 1;
                self.failed_flushes += 1;
                if self.consecutive_failures >= self.settings.max_consecutive_failures {
                    error!(
                        label = self.label,
                        error = %e,
                        consecutive_failures = self.consecutive_failures,
                        pending = self.buffer.len(),
                        "downstream store unavailable, buffer growing"
                    );
                } else {
                    warn!(
                        label = self.label,
                        error = %e,
                        consecutive_failures = self.consecutive_failures,
                        pending = self.buffer.len(),
                        retry_in_secs = self.settings.save_every.as_secs_f64(),
                        "flush failed, will retry"
                    );
                }
                Err(e)
            }
        }
    }

    /// Final forced flush at shutdown. Records that cannot be written are
    /// reported as lost.
    pub async fn close(&mut self) -> Result<usize> {
        let pending = self.buffer.len();
        match self.flush().await {
            Ok(written) => {
                info!(label = self.label, written, "buffered sink closed");
                Ok(written)
            }
            Err(e) => {
                error!(
                    label = self.label,
                    lost = pending,
                    error = %e,
                    "final flush failed, buffered records are lost"
                );
                Err(e)
            }
        }
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    #[cfg(test)]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            flushes: self.flushes,
            records_written: self.records_written,
            failed_flushes: self.failed_flushes,
            pending: self.buffer.len(),
        }
    }

    /// Suspended after a failed flush; the timer drives retries until the
    /// store accepts a batch again.
    fn size_due(&self) -> bool {
        self.consecutive_failures == 0 && self.buffer.len() >= self.settings.buffer_size
    }

    fn time_due(&self) -> bool {
        !self.buffer.is_empty() && self.last_flush.elapsed() >= self.settings.save_every
    }
}

impl std::fmt::Debug for BufferedSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedSink")
            .field("label", &self.label)
            .field("backend", &self.sink.sink_type())
            .field("target", &self.target)
            .field("pending", &self.buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use crate::sink::testing::RecordingSink;
    use crate::types::Trade;

    fn settings(buffer_size: usize, save_every: Duration) -> BufferSettings {
        BufferSettings {
            buffer_size,
            save_every,
            max_consecutive_failures: 3,
        }
    }

    fn trade(i: i64) -> Trade {
        Trade::new("BTC/USD", 100.0 + i as f64, 1.0, i)
    }

    #[tokio::test]
    async fn size_trigger_flushes_exactly_one_full_batch() {
        let store = RecordingSink::default();
        let mut sink = BufferedSink::new(
            "trades",
            Box::new(store.clone()),
            WriteTarget::Online,
            settings(5, Duration::from_secs(3600)),
        );

        for i in 0..4 {
            sink.push(trade(i)).await;
        }
        assert!(store.batch_sizes().is_empty());

        sink.push(trade(4)).await;
        assert_eq!(store.batch_sizes(), vec![5]);
        assert_eq!(sink.pending(), 0);
        assert_eq!(store.batches.lock()[0].1, WriteTarget::Online);

        let times: Vec<_> = store
            .records()
            .iter()
            .map(|r| match r {
                Record::Trade(t) => t.timestamp_ms,
                Record::Candle(_) => unreachable!(),
            })
            .collect();
        assert_eq!(times, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn time_trigger_flushes_partial_batch() {
        let store = RecordingSink::default();
        let mut sink = BufferedSink::new(
            "candles",
            Box::new(store.clone()),
            WriteTarget::Offline,
            settings(100, Duration::from_millis(50)),
        );

        sink.push(trade(1)).await;
        sink.push(trade(2)).await;
        sink.tick().await;
        assert!(store.batch_sizes().is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;
        sink.tick().await;
        assert_eq!(store.batch_sizes(), vec![2]);
        assert_eq!(sink.pending(), 0);
    }

    #[tokio::test]
    async fn failed_flush_retains_buffer_and_retries() {
        let store = RecordingSink::failing(2);
        let mut sink = BufferedSink::new(
            "trades",
            Box::new(store.clone()),
            WriteTarget::Online,
            settings(2, Duration::from_millis(50)),
        );

        sink.push(trade(0)).await;
        sink.push(trade(1)).await;
        assert_eq!(sink.pending(), 2);
        assert_eq!(sink.consecutive_failures(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        sink.push(trade(2)).await;
        assert_eq!(sink.pending(), 3);
        assert_eq!(sink.consecutive_failures(), 2);

        tokio::time::sleep(Duration::from_millis(80)).await;
        sink.push(trade(3)).await;
        assert_eq!(sink.pending(), 0);
        assert_eq!(sink.consecutive_failures(), 0);
        assert_eq!(store.batch_sizes(), vec![4]);
        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);

        let stats = sink.stats();
        assert_eq!(stats.failed_flushes, 2);
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.records_written, 4);
    }

    #[tokio::test]
    async fn outage_retries_once_per_interval() {
        let store = RecordingSink::failing(u32::MAX);
        let mut sink = BufferedSink::new(
            "trades",
            Box::new(store.clone()),
            WriteTarget::Online,
            settings(1, Duration::from_millis(100)),
        );
        for i in 0..10 {
            sink.push(trade(i)).await;
            sink.tick().await;
        }
        assert_eq!(sink.pending(), 10);
        assert_eq!(sink.consecutive_failures(), 1);
        assert_eq!(store.attempts.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        sink.tick().await;
        sink.push(trade(10)).await;
        assert_eq!(store.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(sink.consecutive_failures(), 2);
        assert_eq!(sink.pending(), 11);
    }

    #[tokio::test]
    async fn repeated_outage_escalates_without_panicking() {
        let store = RecordingSink::failing(u32::MAX);
        let mut sink = BufferedSink::new(
            "trades",
            Box::new(store.clone()),
            WriteTarget::Online,
            settings(1, Duration::ZERO),
        );
        for i in 0..10 {
            sink.push(trade(i)).await;
        }
        assert_eq!(sink.pending(), 10);
        assert_eq!(sink.consecutive_failures(), 10);
    }

    #[tokio::test]
    async fn close_drains_sub_threshold_buffer() {
        let store = RecordingSink::default();
        let mut sink = BufferedSink::new(
            "trades",
            Box::new(store.clone()),
            WriteTarget::Online,
            settings(10, Duration::from_secs(3600)),
        );
        sink.push(trade(0)).await;
        sink.push(trade(1)).await;
        sink.push(trade(2)).await;

        assert_eq!(sink.close().await.unwrap(), 3);
        assert_eq!(store.batch_sizes(), vec![3]);
        assert_eq!(sink.close().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_close_reports_error() {
        let store = RecordingSink::failing(1);
        let mut sink = BufferedSink::new(
            "trades",
            Box::new(store.clone()),
            WriteTarget::Online,
            settings(10, Duration::from_secs(3600)),
        );
        sink.push(trade(0)).await;
        assert!(sink.close().await.is_err());
        assert_eq!(sink.pending(), 1);
    }
}
