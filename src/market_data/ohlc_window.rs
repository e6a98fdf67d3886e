use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{Candle, Trade};

/// Longest run of empty windows `CarryForward` will fill in one go.
const MAX_GAP_FILL: i64 = 10_000;

// ---------------------------------------------------------------------------
// Configuration types
// ---------------------------------------------------------------------------

/// What to emit for a window in which an instrument did not trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPolicy {
    /// Emit nothing; only windows that saw trades produce candles.
    Skip,
    /// Emit a flat candle at the previous close for every empty window
    /// between two traded windows.
    CarryForward,
}

impl Default for GapPolicy {
    fn default() -> Self {
        Self::Skip
    }
}

/// Tumbling-window parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSettings {
    pub window_ms: i64,
    pub allowed_lateness_ms: i64,
    pub max_open_windows: usize,
    pub gap_policy: GapPolicy,
}

impl WindowSettings {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            allowed_lateness_ms: 0,
            max_open_windows: 2,
            gap_policy: GapPolicy::Skip,
        }
    }
}

/// Start of the tumbling window containing `timestamp_ms`.
pub fn window_start(timestamp_ms: i64, window_ms: i64) -> i64 {
    timestamp_ms.div_euclid(window_ms) * window_ms
}

// ---------------------------------------------------------------------------
// Open window state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct OpenWindow {
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    trades: u64,
}

impl OpenWindow {
    fn seed(price: f64) -> Self {
        Self {
            open: price,
            high: price,
            low: price,
            close: price,
            trades: 1,
        }
    }

    fn update(&mut self, price: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.trades += 1;
    }
}

// ---------------------------------------------------------------------------
// OhlcWindowAggregator
// ---------------------------------------------------------------------------

/// Event-time tumbling-window OHLC aggregator keyed by
/// `(instrument, window_start_ms)`.
///
/// The watermark is the newest event time seen on any instrument. A window
/// closes once the watermark reaches `window_end + allowed_lateness`, when the
/// per-instrument open-window cap pushes it out, or on [`flush_all`]. Closed
/// windows are removed from state and queued exactly once.
///
/// Lateness is judged per instrument: a trade is dropped only when its window
/// was already emitted for that instrument, or when the instrument's own
/// newest event time has moved past the window. A lagging instrument can
/// still open windows behind the global watermark.
///
/// [`flush_all`]: OhlcWindowAggregator::flush_all
pub struct OhlcWindowAggregator {
    settings: WindowSettings,
    open: BTreeMap<(String, i64), OpenWindow>,
    /// Last emitted `(window_start, close)` per instrument.
    last_emitted: HashMap<String, (i64, f64)>,
    watermark: Option<i64>,
    /// Newest event time per instrument.
    instrument_watermarks: HashMap<String, i64>,
    closed: VecDeque<Candle>,
    late_trades: u64,
    rejected_trades: u64,
    emitted: u64,
}

impl OhlcWindowAggregator {
    pub fn new(settings: WindowSettings) -> Self {
        Self {
            settings: WindowSettings {
                window_ms: settings.window_ms.max(1),
                allowed_lateness_ms: settings.allowed_lateness_ms.max(0),
                max_open_windows: settings.max_open_windows.max(1),
                gap_policy: settings.gap_policy,
            },
            open: BTreeMap::new(),
            last_emitted: HashMap::new(),
            watermark: None,
            instrument_watermarks: HashMap::new(),
            closed: VecDeque::new(),
            late_trades: 0,
            rejected_trades: 0,
            emitted: 0,
        }
    }

    /// Fold one trade into its window and close whatever the new watermark
    /// expires.
    pub fn push(&mut self, trade: &Trade) {
        if !trade.price.is_finite() {
            warn!(instrument = %trade.instrument, price = trade.price, "dropping trade with non-finite price");
            self.rejected_trades += 1;
            return;
        }

        let ts = trade.timestamp_ms;
        let watermark = self.watermark.map_or(ts, |w| w.max(ts));
        self.watermark = Some(watermark);
        self.close_expired(watermark);

        let instrument_watermark = {
            let seen = self
                .instrument_watermarks
                .entry(trade.instrument.clone())
                .or_insert(ts);
            *seen = (*seen).max(ts);
            *seen
        };

        let start = window_start(ts, self.settings.window_ms);
        let key = (trade.instrument.clone(), start);

        if let Some(window) = self.open.get_mut(&key) {
            window.update(trade.price);
            return;
        }

        let already_emitted = self
            .last_emitted
            .get(&trade.instrument)
            .is_some_and(|(last_start, _)| start <= *last_start);

        if already_emitted || self.expires_at(start) <= instrument_watermark {
            self.late_trades += 1;
            debug!(
                instrument = %trade.instrument,
                timestamp_ms = ts,
                window_start_ms = start,
                instrument_watermark,
                "dropping late trade for closed window"
            );
            return;
        }

        self.open.insert(key, OpenWindow::seed(trade.price));
        self.enforce_cap(&trade.instrument);
    }

    /// Close every open window (shutdown / end of backfill). Returns the
    /// number of windows closed.
    pub fn flush_all(&mut self) -> usize {
        let keys: Vec<_> = self.open.keys().cloned().collect();
        let count = keys.len();
        for key in keys {
            self.close(key);
        }
        if count > 0 {
            debug!(count, "flushed all open windows");
        }
        count
    }

    /// Take every closed candle queued so far, in emission order.
    pub fn drain_closed(&mut self) -> Vec<Candle> {
        self.closed.drain(..).collect()
    }

    #[cfg(test)]
    pub fn open_windows(&self) -> usize {
        self.open.len()
    }

    #[cfg(test)]
    pub fn open_windows_for(&self, instrument: &str) -> usize {
        self.instrument_keys(instrument).len()
    }

    pub fn watermark(&self) -> Option<i64> {
        self.watermark
    }

    pub fn late_trades(&self) -> u64 {
        self.late_trades
    }

    pub fn rejected_trades(&self) -> u64 {
        self.rejected_trades
    }

    /// Candles emitted since construction, gap fills included.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    // -- internals ----------------------------------------------------------

    fn expires_at(&self, start: i64) -> i64 {
        start
            .saturating_add(self.settings.window_ms)
            .saturating_add(self.settings.allowed_lateness_ms)
    }

    fn close_expired(&mut self, watermark: i64) {
        // BTreeMap order: instrument, then window start ascending.
        let expired: Vec<_> = self
            .open
            .keys()
            .filter(|(_, start)| self.expires_at(*start) <= watermark)
            .cloned()
            .collect();
        for key in expired {
            self.close(key);
        }
    }

    fn instrument_keys(&self, instrument: &str) -> Vec<(String, i64)> {
        let lo = (instrument.to_string(), i64::MIN);
        let hi = (instrument.to_string(), i64::MAX);
        self.open.range(lo..=hi).map(|(k, _)| k.clone()).collect()
    }

    fn enforce_cap(&mut self, instrument: &str) {
        let keys = self.instrument_keys(instrument);
        let excess = keys.len().saturating_sub(self.settings.max_open_windows);
        for key in keys.into_iter().take(excess) {
            debug!(
                instrument,
                window_start_ms = key.1,
                cap = self.settings.max_open_windows,
                "open-window cap reached, force-closing oldest window"
            );
            self.close(key);
        }
    }

    fn close(&mut self, key: (String, i64)) {
        let Some(window) = self.open.remove(&key) else {
            return;
        };
        let (instrument, start) = key;
        let window_ms = self.settings.window_ms;

        if self.settings.gap_policy == GapPolicy::CarryForward {
            if let Some(&(prev_start, prev_close)) = self.last_emitted.get(&instrument) {
                let missing = (start - prev_start) / window_ms - 1;
                if missing > MAX_GAP_FILL {
                    warn!(
                        instrument = %instrument,
                        missing,
                        "gap too wide to carry forward, skipping fill"
                    );
                } else {
                    let mut gap_start = prev_start + window_ms;
                    while gap_start < start {
                        self.emit(Candle {
                            instrument: instrument.clone(),
                            window_start_ms: gap_start,
                            window_end_ms: gap_start + window_ms,
                            open: prev_close,
                            high: prev_close,
                            low: prev_close,
                            close: prev_close,
                        });
                        gap_start += window_ms;
                    }
                }
            }
        }

        debug!(
            instrument = %instrument,
            window_start_ms = start,
            trades = window.trades,
            "window closed"
        );

        self.last_emitted
            .insert(instrument.clone(), (start, window.close));
        self.emit(Candle {
            instrument,
            window_start_ms: start,
            window_end_ms: start.saturating_add(window_ms),
            open: window.open,
            high: window.high,
            low: window.low,
            close: window.close,
        });
    }

    fn emit(&mut self, candle: Candle) {
        debug_assert!(candle.is_consistent(), "inconsistent candle {candle:?}");
        self.emitted += 1;
        self.closed.push_back(candle);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
