// =============================================================================
// Historical Trade Fetcher — paginated REST backfill with page cache
// =============================================================================
//
// One fetcher walks one instrument from `from_ms` to `to_ms` using the
// provider's `since` cursor. Every page is cached under the exact request it
// answered, so a restarted backfill replays the same cursor path from disk.
//
// Pagination rules:
//   newest trade  > cursor  =>  cursor = newest
//   newest trade <= cursor  =>  cursor += 1 ms (provider keeps returning the
//                               boundary trade; without this we would spin)
//   empty page              =>  cursor = to_ms (nothing newer exists)
//
// `HistoricalTrades` fans one fetcher out per instrument and releases the
// merged pages in event-time order: a trade is handed out only once no
// unfinished fetcher can still return anything older (every later page starts
// at or after that fetcher's cursor). Instruments that ran ahead hold their
// page and are not polled again until it has been released.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::trade_cache::TradePageCache;
use crate::kraken::{PageResponse, RateLimitSnapshot, RateLimitTracker, TradesApi};
use crate::types::Trade;

const DAY_MS: i64 = 86_400_000;

/// Default pause after a "too many requests" answer.
pub const DEFAULT_RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(30);

/// `[today_midnight_utc - last_n_days, today_midnight_utc)` in Unix ms.
pub fn backfill_range(last_n_days: u32, now: DateTime<Utc>) -> (i64, i64) {
    let to_ms = now
        .date_naive()
        .and_time(NaiveTime::MIN)
        .and_utc()
        .timestamp_millis();
    let from_ms = to_ms - i64::from(last_n_days) * DAY_MS;
    (from_ms, to_ms)
}

/// Resumable position of one instrument's backfill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchCursor {
    pub instrument: String,
    pub next_since_ms: i64,
    pub range_end_ms: i64,
    pub done: bool,
}

/// Paginated REST puller for a single instrument.
pub struct HistoricalTradeFetcher {
    cursor: FetchCursor,
    from_ms: i64,
    api: Arc<dyn TradesApi>,
    cache: TradePageCache,
    backoff: Duration,
    rate_limits: Arc<RateLimitTracker>,
    pages: u64,
    cache_hits: u64,
}

impl HistoricalTradeFetcher {
    /// Create a fetcher covering `[from_ms, to_ms)` for `instrument`.
    pub fn new(
        instrument: impl Into<String>,
        (from_ms, to_ms): (i64, i64),
        api: Arc<dyn TradesApi>,
        cache: TradePageCache,
    ) -> Self {
        let cursor = FetchCursor {
            instrument: instrument.into(),
            next_since_ms: from_ms,
            range_end_ms: to_ms,
            done: from_ms >= to_ms,
        };

        Self {
            cursor,
            from_ms,
            api,
            cache,
            backoff: DEFAULT_RATE_LIMIT_BACKOFF,
            rate_limits: Arc::new(RateLimitTracker::new()),
            pages: 0,
            cache_hits: 0,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Share rate-limit counters with sibling fetchers.
    pub fn with_rate_limit_tracker(mut self, tracker: Arc<RateLimitTracker>) -> Self {
        self.rate_limits = tracker;
        self
    }

    pub fn instrument(&self) -> &str {
        &self.cursor.instrument
    }

    pub fn cursor(&self) -> &FetchCursor {
        &self.cursor
    }

    pub fn is_done(&self) -> bool {
        self.cursor.done
    }

    /// Pages consumed so far (cached or fetched).
    pub fn pages(&self) -> u64 {
        self.pages
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits
    }

    /// Fraction of the range covered, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        let span = self.cursor.range_end_ms - self.from_ms;
        if span <= 0 || self.cursor.done {
            return 1.0;
        }
        ((self.cursor.next_since_ms - self.from_ms) as f64 / span as f64).clamp(0.0, 1.0)
    }

    /// Fetch the next page and advance the cursor.
    ///
    /// Returns only trades inside `[from_ms, to_ms]`; an empty vector is a
    /// normal answer. Calling this once done performs no I/O.
    pub async fn get_trades(&mut self) -> Result<Vec<Trade>> {
        if self.cursor.done {
            return Ok(Vec::new());
        }

        let since = self.cursor.next_since_ms;
        let page = match self.cache.get(&self.cursor.instrument, since)? {
            Some(page) => {
                self.cache_hits += 1;
                page
            }
            None => {
                let page = self.fetch_page(since).await?;
                self.cache.put(&self.cursor.instrument, since, &page)?;
                page
            }
        };

        self.pages += 1;
        self.advance(&page);

        let (lo, hi) = (self.from_ms, self.cursor.range_end_ms);
        let raw = page.len();
        let trades: Vec<Trade> = page
            .into_iter()
            .filter(|t| t.timestamp_ms >= lo && t.timestamp_ms <= hi)
            .collect();

        debug!(
            instrument = %self.cursor.instrument,
            since,
            next_since = self.cursor.next_since_ms,
            raw,
            kept = trades.len(),
            progress = format!("{:.1}%", self.progress() * 100.0),
            "historical page consumed"
        );

        if self.cursor.done {
            info!(
                instrument = %self.cursor.instrument,
                pages = self.pages,
                cache_hits = self.cache_hits,
                "historical backfill complete"
            );
        }

        Ok(trades)
    }

    /// Request one page from the provider, backing off while throttled. The
    /// cursor is not touched here.
    async fn fetch_page(&self, since: i64) -> Result<Vec<Trade>> {
        let instrument = self.cursor.instrument.as_str();
        loop {
            let response = self
                .api
                .fetch_trades(instrument, since)
                .await
                .with_context(|| format!("failed to fetch trades for {instrument} since {since}"))?;

            match response {
                PageResponse::Page(trades) => return Ok(trades),
                PageResponse::RateLimited => {
                    self.rate_limits.back_off(instrument, self.backoff).await;
                }
            }
        }
    }

    fn advance(&mut self, page: &[Trade]) {
        let current = self.cursor.next_since_ms;
        let next = match page.iter().map(|t| t.timestamp_ms).max() {
            None => self.cursor.range_end_ms,
            Some(newest) if newest <= current => current + 1,
            Some(newest) => newest,
        };

        self.cursor.next_since_ms = next;
        if next >= self.cursor.range_end_ms {
            self.cursor.done = true;
        }
    }
}

impl std::fmt::Debug for HistoricalTradeFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoricalTradeFetcher")
            .field("cursor", &self.cursor)
            .field("from_ms", &self.from_ms)
            .field("pages", &self.pages)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Multi-instrument container
// ---------------------------------------------------------------------------

/// One fetcher per instrument; pages are pulled sequentially or with a
/// bounded number of requests in flight.
pub struct HistoricalTrades {
    fetchers: Vec<HistoricalTradeFetcher>,
    /// Fetched trades newer than the release bound.
    held: Vec<Trade>,
    concurrency: usize,
    rate_limits: Arc<RateLimitTracker>,
}

impl HistoricalTrades {
    /// Build fetchers for every instrument over the same range.
    ///
    /// `concurrency == 1` fetches sequentially.
    pub fn new(
        instruments: &[String],
        range: (i64, i64),
        api: Arc<dyn TradesApi>,
        cache: TradePageCache,
        backoff: Duration,
        concurrency: usize,
    ) -> Self {
        let rate_limits = Arc::new(RateLimitTracker::new());
        let fetchers = instruments
            .iter()
            .map(|instrument| {
                HistoricalTradeFetcher::new(instrument.clone(), range, api.clone(), cache.clone())
                    .with_backoff(backoff)
                    .with_rate_limit_tracker(rate_limits.clone())
            })
            .collect();

        info!(
            instruments = ?instruments,
            from_ms = range.0,
            to_ms = range.1,
            concurrency,
            "historical backfill configured"
        );

        Self {
            fetchers,
            held: Vec::new(),
            concurrency: concurrency.max(1),
            rate_limits,
        }
    }

    /// Done only when every child fetcher is done and nothing is held back.
    pub fn is_done(&self) -> bool {
        self.held.is_empty() && self.fetchers.iter().all(HistoricalTradeFetcher::is_done)
    }

    /// Trades fetched but not yet released.
    pub fn held(&self) -> usize {
        self.held.len()
    }

    pub fn fetchers(&self) -> &[HistoricalTradeFetcher] {
        &self.fetchers
    }

    pub fn rate_limit_snapshot(&self) -> RateLimitSnapshot {
        self.rate_limits.snapshot()
    }

    /// One page from each unfinished fetcher that has nothing held back,
    /// then every trade at or before the release bound in timestamp order
    /// (ties keep instrument order).
    pub async fn get_trades(&mut self) -> Result<Vec<Trade>> {
        let waiting: Vec<bool> = self
            .fetchers
            .iter()
            .map(|f| self.held.iter().any(|t| t.instrument == f.instrument()))
            .collect();
        let pending = self
            .fetchers
            .iter_mut()
            .zip(waiting)
            .filter(|(f, waiting)| !f.is_done() && !waiting)
            .map(|(f, _)| f);

        if self.concurrency == 1 {
            for fetcher in pending {
                self.held.extend(fetcher.get_trades().await?);
            }
        } else {
            let pages: Vec<Result<Vec<Trade>>> = stream::iter(pending.map(|f| f.get_trades()))
                .buffered(self.concurrency)
                .collect()
                .await;
            for page in pages {
                self.held.extend(page?);
            }
        }

        self.held.sort_by_key(|t| t.timestamp_ms);
        let ready = match self.release_bound() {
            Some(bound) => {
                let split = self.held.partition_point(|t| t.timestamp_ms <= bound);
                self.held.drain(..split).collect()
            }
            None => std::mem::take(&mut self.held),
        };

        debug!(released = ready.len(), held = self.held.len(), "historical trades merged");
        Ok(ready)
    }

    /// Oldest cursor among unfinished fetchers; `None` once all are done.
    fn release_bound(&self) -> Option<i64> {
        self.fetchers
            .iter()
            .filter(|f| !f.is_done())
            .map(|f| f.cursor().next_since_ms)
            .min()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
