// =============================================================================
// Shared types used across the trade → OHLC pipeline
// =============================================================================

use serde::{Deserialize, Serialize};

/// A single executed trade as reported by the exchange.
///
/// `timestamp_ms` is event time (exchange clock), never ingestion time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub instrument: String,
    pub price: f64,
    pub volume: f64,
    pub timestamp_ms: i64,
}

impl Trade {
    pub fn new(instrument: impl Into<String>, price: f64, volume: f64, timestamp_ms: i64) -> Self {
        Self {
            instrument: instrument.into(),
            price,
            volume,
            timestamp_ms,
        }
    }
}

/// A closed OHLC candle for one instrument and one tumbling window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub instrument: String,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Candle {
    /// `low <= min(open, close) <= max(open, close) <= high`.
    pub fn is_consistent(&self) -> bool {
        self.low <= self.open.min(self.close) && self.open.max(self.close) <= self.high
    }
}

/// Where trades come from: the live websocket feed or the REST backfill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    Live,
    Historical,
}

impl Default for SourceMode {
    fn default() -> Self {
        Self::Live
    }
}

impl std::fmt::Display for SourceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Historical => write!(f, "historical"),
        }
    }
}

impl std::str::FromStr for SourceMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "live" => Ok(Self::Live),
            "historical" => Ok(Self::Historical),
            other => anyhow::bail!("invalid source mode '{other}' (expected live or historical)"),
        }
    }
}

/// Which path of the durable store a batch targets.
///
/// Live data goes to the low-latency online path, backfilled data to the
/// bulk offline path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteTarget {
    Online,
    Offline,
}

impl WriteTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

impl From<SourceMode> for WriteTarget {
    fn from(mode: SourceMode) -> Self {
        match mode {
            SourceMode::Live => Self::Online,
            SourceMode::Historical => Self::Offline,
        }
    }
}

impl std::fmt::Display for WriteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One downstream record. Serialises as the flat JSON object of the inner
/// value; the instrument symbol is the routing key.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Record {
    Trade(Trade),
    Candle(Candle),
}

impl Record {
    pub fn key(&self) -> &str {
        match self {
            Self::Trade(t) => &t.instrument,
            Self::Candle(c) => &c.instrument,
        }
    }

    /// Short label used for partition directories and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Trade(_) => "trades",
            Self::Candle(_) => "candles",
        }
    }
}

impl From<Trade> for Record {
    fn from(trade: Trade) -> Self {
        Self::Trade(trade)
    }
}

impl From<Candle> for Record {
    fn from(candle: Candle) -> Self {
        Self::Candle(candle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_serialises_flat() {
        let rec = Record::from(Trade::new("BTC/USD", 100.5, 0.2, 1_700_000_000_000));
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["instrument"], "BTC/USD");
        assert_eq!(json["timestamp_ms"], 1_700_000_000_000_i64);
        assert!(json.get("Trade").is_none());
        assert_eq!(rec.key(), "BTC/USD");
        assert_eq!(rec.kind(), "trades");
    }

    #[test]
    fn candle_schema_is_exact() {
        let candle = Candle {
            instrument: "ETH/USD".into(),
            window_start_ms: 0,
            window_end_ms: 60_000,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
        };
        let json = serde_json::to_value(Record::from(candle)).unwrap();
        let mut keys: Vec<_> = json.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(
            keys,
            vec!["close", "high", "instrument", "low", "open", "window_end_ms", "window_start_ms"]
        );
    }

    #[test]
    fn source_mode_parsing() {
        assert_eq!("Live".parse::<SourceMode>().unwrap(), SourceMode::Live);
        assert_eq!(" historical ".parse::<SourceMode>().unwrap(), SourceMode::Historical);
        assert!("replay".parse::<SourceMode>().is_err());
        assert_eq!(WriteTarget::from(SourceMode::Historical), WriteTarget::Offline);
    }
}
