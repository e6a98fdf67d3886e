// =============================================================================
// Kraken REST Client — public Trades endpoint
// =============================================================================
//
// GET /0/public/Trades?pair=<symbol>&since=<nanoseconds>
//
// Response shape:
//   { "error": [], "result": { "<pair>": [[price, volume, time, ...], ...],
//                              "last": "<ns cursor>" } }
//
// `price` and `volume` arrive as strings, `time` as float seconds. Kraken does
// not honour an upper bound, so range filtering is left to the fetcher.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, instrument};

use super::rate_limit::is_rate_limited;
use crate::types::Trade;

/// Outcome of one page request that reached the provider.
#[derive(Debug, Clone, PartialEq)]
pub enum PageResponse {
    /// Raw page of trades, in provider order, unfiltered.
    Page(Vec<Trade>),
    /// Provider asked us to slow down; nothing was consumed.
    RateLimited,
}

/// Paginated trade history provider.
#[async_trait]
pub trait TradesApi: Send + Sync {
    /// Fetch the page of trades for `instrument` starting at `since_ms`.
    async fn fetch_trades(&self, instrument: &str, since_ms: i64) -> Result<PageResponse>;
}

/// Kraken public REST API client (no authentication required).
#[derive(Clone)]
pub struct KrakenRestClient {
    url: String,
    client: reqwest::Client,
}

impl KrakenRestClient {
    /// Create a client for the Trades endpoint at `url`.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");

        let url = url.into();
        debug!(url = %url, "KrakenRestClient initialised");

        Self { url, client }
    }
}

#[async_trait]
impl TradesApi for KrakenRestClient {
    #[instrument(skip(self), name = "kraken::fetch_trades")]
    async fn fetch_trades(&self, instrument: &str, since_ms: i64) -> Result<PageResponse> {
        let since_ns = since_ms.saturating_mul(1_000_000).to_string();

        let resp = self
            .client
            .get(&self.url)
            .header("Accept", "application/json")
            .query(&[("pair", instrument), ("since", since_ns.as_str())])
            .send()
            .await
            .context("GET /0/public/Trades request failed")?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Ok(PageResponse::RateLimited);
        }

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Kraken GET /0/public/Trades returned {}: {}", status, body);
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse Trades response")?;

        let page = parse_trades_response(instrument, &body)?;
        if let PageResponse::Page(trades) = &page {
            debug!(instrument, count = trades.len(), "trades page fetched");
        }
        Ok(page)
    }
}

impl std::fmt::Debug for KrakenRestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KrakenRestClient")
            .field("url", &self.url)
            .finish()
    }
}

/// Turn a decoded Trades response into a [`PageResponse`].
///
/// The result object is keyed by Kraken's internal pair name (`XXBTZUSD` for
/// `BTC/USD`), so the trade array is whichever entry is not `last`. Trades
/// are labelled with the symbol the caller asked for.
pub fn parse_trades_response(instrument: &str, body: &serde_json::Value) -> Result<PageResponse> {
    let errors: Vec<&str> = body["error"]
        .as_array()
        .map(|arr| arr.iter().filter_map(|e| e.as_str()).collect())
        .unwrap_or_default();

    if is_rate_limited(&errors) {
        return Ok(PageResponse::RateLimited);
    }
    if !errors.is_empty() {
        anyhow::bail!("Kraken rejected Trades request for {instrument}: {}", errors.join(", "));
    }

    let result = body["result"]
        .as_object()
        .context("Trades response missing 'result' object")?;

    let rows = result
        .iter()
        .find(|(key, _)| key.as_str() != "last")
        .map(|(_, rows)| rows)
        .context("Trades response has no trade array")?
        .as_array()
        .context("Trades result entry is not an array")?;

    let mut trades = Vec::with_capacity(rows.len());
    for row in rows {
        let arr = row.as_array().context("trade entry is not an array")?;
        if arr.len() < 3 {
            anyhow::bail!("malformed trade entry with {} elements: {row}", arr.len());
        }

        let price = parse_str_f64(&arr[0])?;
        let volume = parse_str_f64(&arr[1])?;
        let time_secs = parse_str_f64(&arr[2])?;
        if !time_secs.is_finite() || time_secs < 0.0 {
            anyhow::bail!("trade time out of range: {}", arr[2]);
        }
        let timestamp_ms = (time_secs * 1000.0).round() as i64;

        trades.push(Trade::new(instrument, price, volume, timestamp_ms));
    }

    Ok(PageResponse::Page(trades))
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// One-connection-per-response HTTP server. Returns the request lines it saw.
    async fn serve_canned(
        responses: Vec<(&'static str, String)>,
    ) -> (std::net::SocketAddr, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let mut request_lines = Vec::new();
            for (status, body) in responses {
                let (mut tcp, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = tcp.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                }
                let request = String::from_utf8_lossy(&request);
                request_lines.push(request.lines().next().unwrap_or_default().to_string());

                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                tcp.write_all(response.as_bytes()).await.unwrap();
                tcp.shutdown().await.unwrap();
            }
            request_lines
        });

        (addr, handle)
    }

    #[tokio::test]
    async fn fetch_trades_maps_http_statuses() {
        let page = json!({
            "error": [],
            "result": {
                "XXBTZUSD": [["64350.1", "0.5", 1717667940.25, "b", "m", "", 7]],
                "last": "1717667940250000000"
            }
        })
        .to_string();
        let (addr, server) = serve_canned(vec![
            ("429 Too Many Requests", String::new()),
            ("500 Internal Server Error", "<html>upstream down</html>".to_string()),
            ("200 OK", page),
        ])
        .await;

        let client = KrakenRestClient::new(
            format!("http://{addr}/0/public/Trades"),
            Duration::from_secs(5),
        );
        let since_ms = 1_717_667_940_000;

        assert_eq!(
            client.fetch_trades("BTC/USD", since_ms).await.unwrap(),
            PageResponse::RateLimited
        );

        let err = client.fetch_trades("BTC/USD", since_ms).await.unwrap_err();
        assert!(err.to_string().contains("500"), "{err}");

        let PageResponse::Page(trades) = client.fetch_trades("BTC/USD", since_ms).await.unwrap()
        else {
            panic!("expected a page");
        };
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].instrument, "BTC/USD");
        assert_eq!(trades[0].timestamp_ms, 1_717_667_940_250);

        let requests = server.await.unwrap();
        assert_eq!(requests.len(), 3);
        for line in &requests {
            assert!(line.starts_with("GET /0/public/Trades?"), "{line}");
            assert!(line.contains("pair=BTC%2FUSD"), "{line}");
            assert!(line.contains("since=1717667940000000000"), "{line}");
        }
    }

    #[test]
    fn parses_trade_rows() {
        let body = json!({
            "error": [],
            "result": {
                "XXBTZUSD": [
                    ["64350.10000", "0.00150000", 1717667940.123, "b", "m", "", 1],
                    ["64351.00000", "0.25000000", 1717667941.5, "s", "l", "", 2]
                ],
                "last": "1717667941500000000"
            }
        });

        let page = parse_trades_response("BTC/USD", &body).unwrap();
        let PageResponse::Page(trades) = page else {
            panic!("expected a page");
        };
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].instrument, "BTC/USD");
        assert!((trades[0].price - 64350.1).abs() < 1e-9);
        assert_eq!(trades[0].timestamp_ms, 1_717_667_940_123);
        assert_eq!(trades[1].timestamp_ms, 1_717_667_941_500);
    }

    #[test]
    fn empty_page_is_not_an_error() {
        let body = json!({ "error": [], "result": { "XETHZUSD": [], "last": "0" } });
        assert_eq!(
            parse_trades_response("ETH/USD", &body).unwrap(),
            PageResponse::Page(vec![])
        );
    }

    #[test]
    fn throttling_maps_to_rate_limited() {
        let body = json!({ "error": ["EGeneral:Too many requests"] });
        assert_eq!(
            parse_trades_response("BTC/USD", &body).unwrap(),
            PageResponse::RateLimited
        );
    }

    #[test]
    fn other_provider_errors_propagate() {
        let body = json!({ "error": ["EQuery:Unknown asset pair"] });
        let err = parse_trades_response("NOPE/USD", &body).unwrap_err();
        assert!(err.to_string().contains("Unknown asset pair"));
    }

    #[test]
    fn malformed_rows_are_rejected() {
        let body = json!({ "error": [], "result": { "XXBTZUSD": [["1.0", "2.0"]], "last": "1" } });
        assert!(parse_trades_response("BTC/USD", &body).is_err());

        let body = json!({ "error": [], "result": { "XXBTZUSD": [["abc", "2.0", 1.0]], "last": "1" } });
        assert!(parse_trades_response("BTC/USD", &body).is_err());

        let body = json!({ "error": [] });
        assert!(parse_trades_response("BTC/USD", &body).is_err());
    }

    #[test]
    fn non_finite_or_negative_times_are_rejected() {
        for time in [json!("NaN"), json!("inf"), json!(-1.5)] {
            let body = json!({ "error": [], "result": { "XXBTZUSD": [["1.0", "2.0", time]], "last": "1" } });
            assert!(parse_trades_response("BTC/USD", &body).is_err());
        }
    }
}
