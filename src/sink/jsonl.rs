// =============================================================================
// JSONL Sink — append-only files partitioned by target, kind and instrument
// =============================================================================
//
// Layout: {root}/{online|offline}/{trades|candles}/{instrument}.jsonl
//
// A batch is grouped by file and each group appended in arrival order. A
// failure part-way through can leave a prefix of the batch on disk; the
// retried batch then duplicates it (at-least-once).
// =============================================================================

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use super::RecordSink;
use crate::types::{Record, WriteTarget};

pub struct JsonlSink {
    root: PathBuf,
    lines_written: u64,
}

impl JsonlSink {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create output dir {}", root.display()))?;
        info!(path = %root.display(), "JSONL sink ready");
        Ok(Self {
            root,
            lines_written: 0,
        })
    }

    #[cfg(test)]
    pub fn lines_written(&self) -> u64 {
        self.lines_written
    }

    /// Destination file for one record.
    pub fn path_for(&self, target: WriteTarget, kind: &str, key: &str) -> PathBuf {
        self.root
            .join(target.as_str())
            .join(kind)
            .join(format!("{}.jsonl", file_stem(key)))
    }

    fn append(&self, path: &Path, records: &[&Record]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut writer = BufWriter::new(file);

        for record in records {
            let line = serde_json::to_string(record).context("failed to serialize record")?;
            writeln!(writer, "{line}")?;
        }
        writer
            .flush()
            .with_context(|| format!("failed to flush {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl RecordSink for JsonlSink {
    async fn write_batch(&mut self, batch: &[Record], target: WriteTarget) -> Result<()> {
        let mut groups: BTreeMap<PathBuf, Vec<&Record>> = BTreeMap::new();
        for record in batch {
            groups
                .entry(self.path_for(target, record.kind(), record.key()))
                .or_default()
                .push(record);
        }

        for (path, records) in &groups {
            self.append(path, records)?;
            debug!(path = %path.display(), lines = records.len(), "appended");
        }

        self.lines_written += batch.len() as u64;
        Ok(())
    }

    fn sink_type(&self) -> &'static str {
        "jsonl"
    }
}

impl std::fmt::Debug for JsonlSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlSink")
            .field("root", &self.root)
            .field("lines_written", &self.lines_written)
            .finish()
    }
}

/// `BTC/USD` -> `BTC-USD`. Anything outside `[A-Za-z0-9._-]` becomes `-`.
fn file_stem(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}
