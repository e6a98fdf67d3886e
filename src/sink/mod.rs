// =============================================================================
// Downstream sinks
// =============================================================================
//
// `RecordSink` is the boundary to the durable store: it takes a whole batch
// and a routing target. `BufferedSink` sits in front of it and decides when a
// batch is due.
// =============================================================================

pub mod buffered;
pub mod jsonl;

pub use buffered::{BufferSettings, BufferedSink, SinkStats};
pub use jsonl::JsonlSink;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::types::{Record, WriteTarget};

/// Durable store accepting batch inserts.
#[async_trait]
pub trait RecordSink: Send {
    /// Write the whole batch. An error means the caller must assume nothing
    /// was stored.
    async fn write_batch(&mut self, batch: &[Record], target: WriteTarget) -> Result<()>;

    /// Backend label for logging.
    fn sink_type(&self) -> &'static str;
}

/// Dry-run sink: logs each batch and drops it.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl RecordSink for LogSink {
    async fn write_batch(&mut self, batch: &[Record], target: WriteTarget) -> Result<()> {
        let first = batch.first().map(Record::key).unwrap_or_default();
        let kind = batch.first().map(Record::kind).unwrap_or_default();
        info!(records = batch.len(), kind, first_key = first, target = %target, "batch (dry run)");
        Ok(())
    }

    fn sink_type(&self) -> &'static str {
        "log"
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    /// Records every successful batch; fails the next `fail_next` writes.
    #[derive(Clone, Default)]
    pub struct RecordingSink {
        pub batches: Arc<Mutex<Vec<(Vec<Record>, WriteTarget)>>>,
        pub fail_next: Arc<AtomicU32>,
        pub attempts: Arc<AtomicU32>,
    }

    impl RecordingSink {
        pub fn failing(times: u32) -> Self {
            let sink = Self::default();
            sink.fail_next.store(times, Ordering::SeqCst);
            sink
        }

        pub fn batch_sizes(&self) -> Vec<usize> {
            self.batches.lock().iter().map(|(b, _)| b.len()).collect()
        }

        pub fn records(&self) -> Vec<Record> {
            self.batches
                .lock()
                .iter()
                .flat_map(|(b, _)| b.iter().cloned())
                .collect()
        }
    }

    #[async_trait]
    impl RecordSink for RecordingSink {
        async fn write_batch(&mut self, batch: &[Record], target: WriteTarget) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.fail_next.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_next.store(remaining - 1, Ordering::SeqCst);
                anyhow::bail!("simulated store outage");
            }
            self.batches.lock().push((batch.to_vec(), target));
            Ok(())
        }

        fn sink_type(&self) -> &'static str {
            "recording"
        }
    }
}
