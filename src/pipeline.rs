// =============================================================================
// Pipeline — single poll/emit loop from a trade source to the sinks
// =============================================================================
//
// This loop is the only writer of aggregator and buffer state. Each
// iteration:
//   1. pull a batch from the source (may block on network I/O)
//   2. buffer the raw trades
//   3. feed the aggregator and buffer every candle it closed
//   4. evaluate the sinks' time triggers
//
// `drive` stops on shutdown, source exhaustion or a source error and leaves
// all state intact, so a live stream can be swapped in after a reconnect.
// `finish` closes every open window and performs the final flushes.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::market_data::{OhlcWindowAggregator, TradeSource};
use crate::sink::{BufferedSink, SinkStats};
use crate::types::Record;

/// Why `drive` returned without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The source reported `is_done()`.
    Exhausted,
    /// The shutdown flag was raised.
    Shutdown,
}

/// End-of-run counters, logged by the binary.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub iterations: u64,
    pub trades: u64,
    pub candles: u64,
    pub late_trades: u64,
    pub rejected_trades: u64,
    pub trade_sink: Option<SinkStats>,
    pub candle_sink: Option<SinkStats>,
}

pub struct Pipeline {
    source: TradeSource,
    aggregator: Option<OhlcWindowAggregator>,
    trade_sink: Option<BufferedSink>,
    candle_sink: Option<BufferedSink>,
    iterations: u64,
    trades: u64,
    candles: u64,
}

impl Pipeline {
    /// Every consumer is optional: trades only, candles only, or both. Candles
    /// are computed only when both an aggregator and a candle sink exist.
    pub fn new(
        source: TradeSource,
        aggregator: Option<OhlcWindowAggregator>,
        trade_sink: Option<BufferedSink>,
        candle_sink: Option<BufferedSink>,
    ) -> Self {
        let aggregator = if candle_sink.is_some() { aggregator } else { None };
        info!(
            mode = %source.mode(),
            trades = trade_sink.is_some(),
            candles = aggregator.is_some(),
            "pipeline assembled"
        );

        Self {
            source,
            aggregator,
            trade_sink,
            candle_sink,
            iterations: 0,
            trades: 0,
            candles: 0,
        }
    }

    pub fn source(&self) -> &TradeSource {
        &self.source
    }

    /// Swap in a freshly connected source, keeping windows and buffers.
    pub fn replace_source(&mut self, source: TradeSource) -> TradeSource {
        info!(mode = %source.mode(), "trade source replaced");
        std::mem::replace(&mut self.source, source)
    }

    /// Drive the loop, then finish. A source error is returned after the
    /// final flushes have been attempted.
    pub async fn run(&mut self, shutdown: &AtomicBool) -> Result<RunSummary> {
        let outcome = self.drive(shutdown).await;
        let summary = self.finish().await;
        match outcome {
            Ok(reason) => {
                info!(reason = ?reason, "pipeline stopped");
                summary
            }
            Err(e) => {
                if let Err(flush_err) = summary {
                    warn!(error = %flush_err, "final flush failed after source error");
                }
                Err(e)
            }
        }
    }

    /// Poll the source until it is exhausted, shutdown is requested or it
    /// fails. Blocked reads are not interrupted; the flag is checked between
    /// iterations.
    pub async fn drive(&mut self, shutdown: &AtomicBool) -> Result<StopReason> {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                return Ok(StopReason::Shutdown);
            }
            if self.source.is_done() {
                return Ok(StopReason::Exhausted);
            }

            let trades = self.source.get_trades().await?;
            self.iterations += 1;
            self.trades += trades.len() as u64;

            if let Some(aggregator) = self.aggregator.as_mut() {
                for trade in &trades {
                    aggregator.push(trade);
                }
            }

            if let Some(sink) = self.trade_sink.as_mut() {
                for trade in trades {
                    sink.push(trade).await;
                }
            }

            self.emit_closed().await;

            if let Some(sink) = self.trade_sink.as_mut() {
                sink.tick().await;
            }
            if let Some(sink) = self.candle_sink.as_mut() {
                sink.tick().await;
            }
        }
    }

    /// Close all open windows, buffer the resulting candles and force a final
    /// flush on both sinks. Safe to call more than once.
    pub async fn finish(&mut self) -> Result<RunSummary> {
        if let Some(aggregator) = self.aggregator.as_mut() {
            let closed = aggregator.flush_all();
            debug!(
                closed,
                watermark = ?aggregator.watermark(),
                emitted = aggregator.emitted(),
                "open windows flushed"
            );
        }
        self.emit_closed().await;

        let mut first_err = None;
        for sink in [self.trade_sink.as_mut(), self.candle_sink.as_mut()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = sink.close().await {
                first_err.get_or_insert(e);
            }
        }

        let summary = self.summary();
        info!(
            iterations = summary.iterations,
            trades = summary.trades,
            candles = summary.candles,
            late_trades = summary.late_trades,
            rejected_trades = summary.rejected_trades,
            "pipeline finished"
        );

        match first_err {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    pub fn summary(&self) -> RunSummary {
        let (late_trades, rejected_trades) = self
            .aggregator
            .as_ref()
            .map(|a| (a.late_trades(), a.rejected_trades()))
            .unwrap_or_default();

        RunSummary {
            iterations: self.iterations,
            trades: self.trades,
            candles: self.candles,
            late_trades,
            rejected_trades,
            trade_sink: self.trade_sink.as_ref().map(BufferedSink::stats),
            candle_sink: self.candle_sink.as_ref().map(BufferedSink::stats),
        }
    }

    async fn emit_closed(&mut self) {
        let (Some(aggregator), Some(sink)) = (self.aggregator.as_mut(), self.candle_sink.as_mut())
        else {
            return;
        };

        for candle in aggregator.drain_closed() {
            debug!(
                instrument = %candle.instrument,
                window_start_ms = candle.window_start_ms,
                open = candle.open,
                high = candle.high,
                low = candle.low,
                close = candle.close,
                "candle closed"
            );
            self.candles += 1;
            sink.push(Record::from(candle)).await;
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("source", &self.source)
            .field("iterations", &self.iterations)
            .field("trades", &self.trades)
            .field("candles", &self.candles)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
