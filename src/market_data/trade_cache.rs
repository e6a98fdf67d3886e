// =============================================================================
// Trade Page Cache — one file per historical request
// =============================================================================
//
// Each REST page is stored under `<dir>/<sha256(signature)>.json`, where the
// signature is the exact request (instrument + cursor). Presence of the file
// means "already fetched": a restarted backfill replays the same cursor path
// from disk without touching the network. Entries are write-once and written
// atomically (tmp + rename) so a crash never leaves a truncated page behind.
// =============================================================================

use std::path::PathBuf;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::types::Trade;

/// Content-addressed on-disk cache of raw trade pages.
#[derive(Debug, Clone)]
pub struct TradePageCache {
    dir: PathBuf,
}

impl TradePageCache {
    /// Open (and create if needed) a cache rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create cache dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// Hex SHA-256 of the request signature.
    pub fn key(instrument: &str, since_ms: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("trades|{instrument}|{since_ms}").as_bytes());
        hex::encode(hasher.finalize())
    }

    fn path_for(&self, instrument: &str, since_ms: i64) -> PathBuf {
        self.dir
            .join(format!("{}.json", Self::key(instrument, since_ms)))
    }

    /// Return the cached page for this request, if one was stored.
    pub fn get(&self, instrument: &str, since_ms: i64) -> Result<Option<Vec<Trade>>> {
        let path = self.path_for(instrument, since_ms);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read cached page {}", path.display()))?;
        let trades: Vec<Trade> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse cached page {}", path.display()))?;

        debug!(instrument, since_ms, count = trades.len(), "cache hit");
        Ok(Some(trades))
    }

    /// Store a raw page. An existing entry is left untouched.
    pub fn put(&self, instrument: &str, since_ms: i64, trades: &[Trade]) -> Result<()> {
        let path = self.path_for(instrument, since_ms);
        if path.exists() {
            warn!(instrument, since_ms, "cache entry already present, keeping the original");
            return Ok(());
        }

        let content =
            serde_json::to_string(trades).context("failed to serialise trade page")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp page to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename tmp page to {}", path.display()))?;

        debug!(instrument, since_ms, count = trades.len(), "page cached");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_depends_on_instrument_and_cursor() {
        let a = TradePageCache::key("BTC/USD", 1000);
        assert_eq!(a.len(), 64);
        assert_eq!(a, TradePageCache::key("BTC/USD", 1000));
        assert_ne!(a, TradePageCache::key("BTC/USD", 1001));
        assert_ne!(a, TradePageCache::key("ETH/USD", 1000));
    }

    #[test]
    fn put_then_get_returns_page() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TradePageCache::open(dir.path().join("pages")).unwrap();
        let page = vec![
            Trade::new("BTC/USD", 100.0, 0.1, 1_000),
            Trade::new("BTC/USD", 101.0, 0.2, 1_500),
        ];

        assert_eq!(cache.get("BTC/USD", 1_000).unwrap(), None);
        cache.put("BTC/USD", 1_000, &page).unwrap();
        assert_eq!(cache.get("BTC/USD", 1_000).unwrap(), Some(page));
        assert_eq!(cache.get("BTC/USD", 1_001).unwrap(), None);
    }

    #[test]
    fn entries_are_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TradePageCache::open(dir.path()).unwrap();
        let first = vec![Trade::new("BTC/USD", 100.0, 0.1, 1_000)];
        let second = vec![Trade::new("BTC/USD", 999.0, 9.0, 1_000)];

        cache.put("BTC/USD", 0, &first).unwrap();
        cache.put("BTC/USD", 0, &second).unwrap();
        assert_eq!(cache.get("BTC/USD", 0).unwrap(), Some(first));
    }

    #[test]
    fn empty_pages_are_cached_too() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TradePageCache::open(dir.path()).unwrap();
        cache.put("ETH/USD", 5, &[]).unwrap();
        assert_eq!(cache.get("ETH/USD", 5).unwrap(), Some(vec![]));
    }

    #[test]
    fn corrupt_entry_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TradePageCache::open(dir.path()).unwrap();
        let path = dir
            .path()
            .join(format!("{}.json", TradePageCache::key("BTC/USD", 7)));
        std::fs::write(path, "not json").unwrap();
        assert!(cache.get("BTC/USD", 7).is_err());
    }
}
