// =============================================================================
// Live Trade Stream — Kraken v2 websocket trade channel
// =============================================================================

use anyhow::{Context, Result};
use chrono::DateTime;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::types::Trade;

/// Confirmation messages Kraken sends per subscribed symbol before data.
const CONFIRMATIONS_PER_INSTRUMENT: usize = 2;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport-level loss of the feed. Only this failure is worth a reconnect;
/// anything else coming out of the stream (bad payloads, unexpected frames)
/// is fatal.
#[derive(Debug)]
pub enum ConnectionLost {
    /// Server sent a close frame.
    Closed(Option<String>),
    /// Stream ended without a close frame.
    Ended,
    /// Connect, send or read failed.
    Transport(tungstenite::Error),
}

impl std::fmt::Display for ConnectionLost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed(Some(reason)) => write!(f, "trade WebSocket closed by server: {reason}"),
            Self::Closed(None) => write!(f, "trade WebSocket closed by server"),
            Self::Ended => write!(f, "trade WebSocket stream ended"),
            Self::Transport(e) => write!(f, "trade WebSocket transport error: {e}"),
        }
    }
}

impl std::error::Error for ConnectionLost {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

/// `true` when `err` (or anything in its context chain) is a lost connection.
pub fn is_connection_lost(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<ConnectionLost>())
}

/// Persistent subscriber to the trade channel for a set of instruments.
///
/// There is no reconnect logic here: any transport failure or close frame is
/// returned to the caller, which owns the reconnect policy.
#[derive(Debug)]
pub struct LiveTradeStream {
    instruments: Vec<String>,
    ws: WsStream,
    messages: u64,
}

impl LiveTradeStream {
    /// Connect to `url`, subscribe to `instruments` and consume the
    /// subscription confirmations.
    pub async fn connect(url: &str, instruments: &[String]) -> Result<Self> {
        info!(url = %url, instruments = ?instruments, "connecting to trade WebSocket");

        let (ws, _response) = connect_async(url)
            .await
            .map_err(ConnectionLost::Transport)
            .context("failed to connect to trade WebSocket")?;

        let mut stream = Self {
            instruments: instruments.to_vec(),
            ws,
            messages: 0,
        };
        stream.subscribe().await?;

        info!(instruments = ?stream.instruments, "trade WebSocket subscribed");
        Ok(stream)
    }

    async fn subscribe(&mut self) -> Result<()> {
        let msg = subscription_message(&self.instruments);
        self.ws
            .send(Message::Text(msg.to_string()))
            .await
            .map_err(ConnectionLost::Transport)
            .context("failed to send trade subscription")?;

        for _ in 0..CONFIRMATIONS_PER_INSTRUMENT * self.instruments.len() {
            let confirmation = self.next_data_message().await?;
            debug!(message = %confirmation, "discarding subscription confirmation");
        }
        Ok(())
    }

    /// Next text payload, skipping control frames.
    async fn next_data_message(&mut self) -> Result<String> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text),
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.to_string());
                    return Err(ConnectionLost::Closed(reason))
                        .context("trade WebSocket closed during subscription");
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(ConnectionLost::Transport(e))
                        .context("trade WebSocket read error during subscription")
                }
                None => {
                    return Err(ConnectionLost::Ended).context("trade WebSocket ended during subscription")
                }
            }
        }
    }

    /// One receive from the socket.
    ///
    /// Heartbeats, control frames and non-trade channel messages give an
    /// empty vector. A close frame, end of stream or read error is a
    /// [`ConnectionLost`]; a malformed payload or binary frame is a plain
    /// error.
    pub async fn get_trades(&mut self) -> Result<Vec<Trade>> {
        match self.ws.next().await {
            Some(Ok(Message::Text(text))) => {
                self.messages += 1;
                parse_trade_message(&text)
            }
            Some(Ok(Message::Binary(bytes))) => {
                anyhow::bail!("unexpected binary frame of {} bytes on trade WebSocket", bytes.len())
            }
            Some(Ok(Message::Close(frame))) => {
                warn!(frame = ?frame, "trade WebSocket closed by server");
                Err(ConnectionLost::Closed(frame.map(|f| f.reason.to_string())).into())
            }
            // Ping / Pong / raw frames: tungstenite answers pings itself.
            Some(Ok(_)) => Ok(Vec::new()),
            Some(Err(e)) => Err(ConnectionLost::Transport(e).into()),
            None => Err(ConnectionLost::Ended.into()),
        }
    }

    /// A live feed never completes.
    pub fn is_done(&self) -> bool {
        false
    }

    pub fn instruments(&self) -> &[String] {
        &self.instruments
    }

    /// Text messages received after subscription.
    pub fn messages(&self) -> u64 {
        self.messages
    }
}

/// `{"method":"subscribe","params":{"channel":"trade","symbol":[..],"snapshot":false}}`
pub fn subscription_message(instruments: &[String]) -> serde_json::Value {
    serde_json::json!({
        "method": "subscribe",
        "params": {
            "channel": "trade",
            "symbol": instruments,
            "snapshot": false,
        },
    })
}

/// Parse one text payload from the feed.
///
/// Expected data shape:
/// ```json
/// { "channel": "trade", "type": "update", "data": [
///   { "symbol": "BTC/USD", "price": 64350.1, "qty": 0.0015,
///     "timestamp": "2024-06-17T09:45:38.494012Z" } ] }
/// ```
pub fn parse_trade_message(text: &str) -> Result<Vec<Trade>> {
    if text.contains("heartbeat") {
        return Ok(Vec::new());
    }

    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse trade message JSON")?;

    if root["channel"].as_str() != Some("trade") {
        debug!(message = %text, "ignoring non-trade message");
        return Ok(Vec::new());
    }

    let data = root["data"]
        .as_array()
        .context("trade message missing data array")?;

    data.iter().map(parse_trade_entry).collect()
}

fn parse_trade_entry(entry: &serde_json::Value) -> Result<Trade> {
    let instrument = entry["symbol"]
        .as_str()
        .context("missing field symbol")?;
    let price = parse_number(&entry["price"], "price")?;
    let volume = parse_number(&entry["qty"], "qty")?;
    let timestamp = entry["timestamp"]
        .as_str()
        .context("missing field timestamp")?;

    Ok(Trade::new(instrument, price, volume, iso8601_to_ms(timestamp)?))
}

/// `2024-06-17T09:45:38.494012Z` -> Unix milliseconds.
pub fn iso8601_to_ms(timestamp: &str) -> Result<i64> {
    let parsed = DateTime::parse_from_rfc3339(timestamp)
        .with_context(|| format!("invalid trade timestamp '{timestamp}'"))?;
    Ok(parsed.timestamp_millis())
}

/// Kraken v2 sends numbers, but tolerate numeric strings.
fn parse_number(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        _ => anyhow::bail!("missing or non-numeric field {name}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
