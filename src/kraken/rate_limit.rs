// =============================================================================
// Rate-Limit Handling — Kraken "too many requests" detection and backoff stats
// =============================================================================
//
// Kraken answers an over-eager client with HTTP 200 and an `error` array
// (`EGeneral:Too many requests`, `EAPI:Rate limit exceeded`), occasionally
// with a plain 429. Recognising that is provider specific, so it is isolated
// in `is_rate_limited`; everything else in the crate only sees the boolean.
//
// The tracker keeps atomic counters so concurrent fetchers can share one.
// =============================================================================

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Error fragments Kraken uses to signal throttling.
const RATE_LIMIT_MARKERS: &[&str] = &["Too many requests", "Rate limit exceeded"];

/// Fault classifier: `true` when the provider error list signals throttling.
pub fn is_rate_limited<S: AsRef<str>>(errors: &[S]) -> bool {
    errors
        .iter()
        .any(|e| RATE_LIMIT_MARKERS.iter().any(|m| e.as_ref().contains(m)))
}

/// Thread-safe counters of rate-limit hits and time spent backing off.
pub struct RateLimitTracker {
    hits: AtomicU32,
    backoff_ms: AtomicU64,
}

/// Immutable snapshot of the tracker (logged at the end of a run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub hits: u32,
    pub backoff_ms: u64,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            hits: AtomicU32::new(0),
            backoff_ms: AtomicU64::new(0),
        }
    }

    /// Record one throttled response and sleep for `backoff` before the caller
    /// retries the same request.
    pub async fn back_off(&self, instrument: &str, backoff: Duration) {
        let hits = self.hits.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            instrument,
            hits,
            backoff_secs = backoff.as_secs_f64(),
            "rate limited by provider, backing off"
        );
        tokio::time::sleep(backoff).await;
        self.backoff_ms
            .fetch_add(backoff.as_millis() as u64, Ordering::Relaxed);
        debug!(instrument, "backoff elapsed, retrying");
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            backoff_ms: self.backoff_ms.load(Ordering::Relaxed),
        }
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("backoff_ms", &self.backoff_ms.load(Ordering::Relaxed))
            .finish()
    }
}
