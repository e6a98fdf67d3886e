// =============================================================================
// OHLC Pipeline — Main Entry Point
// =============================================================================
//
// Ingests Kraken trades (live websocket or historical REST backfill), builds
// event-time OHLC candles and hands both to buffered downstream sinks. Live
// data is routed to the online path, backfilled data to the offline path.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod kraken;
mod market_data;
mod pipeline;
mod runtime_config;
mod sink;
mod types;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::market_data::{is_connection_lost, OhlcWindowAggregator, TradeSource};
use crate::pipeline::{Pipeline, RunSummary};
use crate::runtime_config::{PipelineConfig, SinkKind};
use crate::sink::{BufferSettings, BufferedSink, JsonlSink, LogSink, RecordSink};
use crate::types::{SourceMode, WriteTarget};

const DEFAULT_CONFIG_PATH: &str = "pipeline_config.json";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path =
        PathBuf::from(std::env::var("PIPELINE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into()));
    let mut config = PipelineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        PipelineConfig::default()
    });
    config.apply_env_overrides()?;
    config.validate()?;

    info!(
        mode = %config.mode,
        instruments = ?config.instruments,
        window_seconds = config.window_seconds,
        sink = ?config.sink,
        "OHLC pipeline starting"
    );

    // ── 2. Shutdown flag ─────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Shutdown signal received — finishing current iteration");
                shutdown.store(true, Ordering::SeqCst);
            }
        });
    }

    // ── 3. Source, aggregator, sinks ─────────────────────────────────────
    let source = TradeSource::from_config(&config).await?;
    let target = WriteTarget::from(config.mode);

    let trade_sink = if config.emit_trades {
        Some(buffered_sink("trades", &config, target)?)
    } else {
        None
    };
    let (aggregator, candle_sink) = if config.emit_candles {
        (
            Some(OhlcWindowAggregator::new(config.window_settings())),
            Some(buffered_sink("candles", &config, target)?),
        )
    } else {
        (None, None)
    };

    let mut pipeline = Pipeline::new(source, aggregator, trade_sink, candle_sink);

    // ── 4. Run ───────────────────────────────────────────────────────────
    let summary = match config.mode {
        SourceMode::Historical => {
            let result = pipeline.run(&shutdown).await;
            if let TradeSource::Historical(backfill) = pipeline.source() {
                for fetcher in backfill.fetchers() {
                    info!(
                        instrument = fetcher.instrument(),
                        pages = fetcher.pages(),
                        cache_hits = fetcher.cache_hits(),
                        "Backfill summary"
                    );
                }
                let limits = backfill.rate_limit_snapshot();
                info!(hits = limits.hits, backoff_ms = limits.backoff_ms, "Rate limit summary");
            }
            result?
        }
        SourceMode::Live => run_live(&mut pipeline, &config, &shutdown).await?,
    };

    info!(
        iterations = summary.iterations,
        trades = summary.trades,
        candles = summary.candles,
        late_trades = summary.late_trades,
        "OHLC pipeline shut down complete."
    );
    Ok(())
}

/// Keep the live feed running until shutdown. A lost connection is followed
/// by a fixed delay and a fresh connection; aggregator and buffer state carry
/// over. Any other stream error (e.g. a malformed payload) is fatal: the
/// buffers are flushed and the error is returned.
async fn run_live(
    pipeline: &mut Pipeline,
    config: &PipelineConfig,
    shutdown: &AtomicBool,
) -> Result<RunSummary> {
    loop {
        match pipeline.drive(shutdown).await {
            Ok(reason) => {
                info!(reason = ?reason, "Live stream stopped");
                break;
            }
            Err(e) if is_connection_lost(&e) => {
                error!(error = %e, "Trade stream error — reconnecting in 5s");
            }
            Err(e) => {
                error!(error = %e, "Trade stream failed with a non-recoverable error");
                if let Err(flush_err) = pipeline.finish().await {
                    warn!(error = %flush_err, "Final flush failed after stream error");
                }
                return Err(e);
            }
        }

        loop {
            tokio::time::sleep(RECONNECT_DELAY).await;
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            match TradeSource::from_config(config).await {
                Ok(source) => {
                    pipeline.replace_source(source);
                    break;
                }
                Err(e) if is_connection_lost(&e) => {
                    error!(error = %e, "Reconnect failed — retrying in 5s")
                }
                Err(e) => {
                    error!(error = %e, "Reconnect failed with a non-recoverable error");
                    if let Err(flush_err) = pipeline.finish().await {
                        warn!(error = %flush_err, "Final flush failed after reconnect error");
                    }
                    return Err(e);
                }
            }
        }
    }

    pipeline.finish().await
}

fn buffered_sink(
    label: &'static str,
    config: &PipelineConfig,
    target: WriteTarget,
) -> Result<BufferedSink> {
    let backend: Box<dyn RecordSink> = match config.sink {
        SinkKind::Jsonl => Box::new(JsonlSink::new(&config.output_dir)?),
        SinkKind::Log => Box::new(LogSink),
    };

    Ok(BufferedSink::new(
        label,
        backend,
        target,
        BufferSettings {
            buffer_size: config.buffer_size,
            save_every: config.save_every(),
            max_consecutive_failures: config.max_consecutive_failures,
        },
    ))
}
