pub mod historical;
pub mod ohlc_window;
pub mod trade_cache;
pub mod trade_stream;

pub use historical::{backfill_range, HistoricalTrades};
pub use ohlc_window::{GapPolicy, OhlcWindowAggregator, WindowSettings};
pub use trade_cache::TradePageCache;
pub use trade_stream::{is_connection_lost, LiveTradeStream};

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use crate::kraken::{KrakenRestClient, TradesApi};
use crate::runtime_config::PipelineConfig;
use crate::types::{SourceMode, Trade};

/// The two interchangeable trade sources. Each `get_trades` call returns
/// zero or more trades and never blocks forever once `is_done` is true.
pub enum TradeSource {
    Live(LiveTradeStream),
    Historical(HistoricalTrades),
}

impl TradeSource {
    /// Build the source selected by `config.mode`. Live mode connects and
    /// subscribes before returning.
    pub async fn from_config(config: &PipelineConfig) -> Result<Self> {
        match config.mode {
            SourceMode::Live => {
                let stream = LiveTradeStream::connect(&config.ws_url, &config.instruments).await?;
                Ok(Self::Live(stream))
            }
            SourceMode::Historical => {
                let api: Arc<dyn TradesApi> =
                    Arc::new(KrakenRestClient::new(&config.rest_url, config.http_timeout()));
                let cache = TradePageCache::open(&config.cache_dir)?;
                let range = backfill_range(config.last_n_days, Utc::now());
                Ok(Self::Historical(HistoricalTrades::new(
                    &config.instruments,
                    range,
                    api,
                    cache,
                    config.rate_limit_backoff(),
                    config.fetch_concurrency(),
                )))
            }
        }
    }

    pub async fn get_trades(&mut self) -> Result<Vec<Trade>> {
        match self {
            Self::Live(stream) => stream.get_trades().await,
            Self::Historical(backfill) => backfill.get_trades().await,
        }
    }

    pub fn is_done(&self) -> bool {
        match self {
            Self::Live(stream) => stream.is_done(),
            Self::Historical(backfill) => backfill.is_done(),
        }
    }

    pub fn mode(&self) -> SourceMode {
        match self {
            Self::Live(_) => SourceMode::Live,
            Self::Historical(_) => SourceMode::Historical,
        }
    }
}

impl std::fmt::Debug for TradeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live(stream) => f
                .debug_struct("TradeSource::Live")
                .field("instruments", &stream.instruments())
                .field("messages", &stream.messages())
                .finish(),
            Self::Historical(backfill) => f
                .debug_struct("TradeSource::Historical")
                .field("fetchers", &backfill.fetchers())
                .field("held", &backfill.held())
                .field("done", &backfill.is_done())
                .finish(),
        }
    }
}
