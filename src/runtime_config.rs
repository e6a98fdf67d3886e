// =============================================================================
// Pipeline Configuration — JSON file with env overrides
// =============================================================================
//
// Every tunable of the pipeline lives here. All fields carry a serde default so
// a partial (or empty) JSON file still loads; missing file falls back to
// defaults in main.rs.
//
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::market_data::{GapPolicy, WindowSettings};
use crate::types::SourceMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

/// Upper bound for `window_seconds` and `allowed_lateness_ms` (one week).
const MAX_WINDOW_SECONDS: u64 = 7 * 24 * 3600;
const MAX_ALLOWED_LATENESS_MS: i64 = MAX_WINDOW_SECONDS as i64 * 1000;

fn default_true() -> bool {
    true
}

fn default_instruments() -> Vec<String> {
    vec!["BTC/USD".to_string()]
}

fn default_last_n_days() -> u32 {
    1
}

fn default_window_seconds() -> u64 {
    60
}

fn default_max_open_windows() -> usize {
    2
}

fn default_buffer_size() -> usize {
    100
}

fn default_save_every_n_sec() -> u64 {
    10
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data/output")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("data/cache")
}

fn default_rate_limit_backoff_secs() -> u64 {
    30
}

fn default_max_fetch_workers() -> usize {
    4
}

fn default_http_timeout_secs() -> u64 {
    10
}

fn default_rest_url() -> String {
    "https://api.kraken.com/0/public/Trades".to_string()
}

fn default_ws_url() -> String {
    "wss://ws.kraken.com/v2".to_string()
}

/// Downstream store the buffered sinks write to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Partitioned JSON-lines files under `output_dir`.
    Jsonl,
    /// Dry run: batches are only logged.
    Log,
}

impl Default for SinkKind {
    fn default() -> Self {
        Self::Jsonl
    }
}

// =============================================================================
// PipelineConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    // --- Source -------------------------------------------------------------

    /// `live` (websocket) or `historical` (REST backfill).
    #[serde(default)]
    pub mode: SourceMode,

    /// Exchange symbols, e.g. `BTC/USD`.
    #[serde(default = "default_instruments")]
    pub instruments: Vec<String>,

    /// Backfill range, in whole UTC days ending at today's midnight.
    #[serde(default = "default_last_n_days")]
    pub last_n_days: u32,

    // --- Aggregation --------------------------------------------------------

    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,

    /// Extra event time a window waits for stragglers after its end.
    #[serde(default)]
    pub allowed_lateness_ms: i64,

    /// Cap on concurrently open windows per instrument.
    #[serde(default = "default_max_open_windows")]
    pub max_open_windows: usize,

    #[serde(default)]
    pub gap_policy: GapPolicy,

    // --- Buffering ----------------------------------------------------------

    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default = "default_save_every_n_sec")]
    pub save_every_n_sec: u64,

    /// Consecutive failed flushes before the sink reports an operational fault.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    #[serde(default = "default_true")]
    pub emit_trades: bool,

    #[serde(default = "default_true")]
    pub emit_candles: bool,

    #[serde(default)]
    pub sink: SinkKind,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    // --- Historical fetcher -------------------------------------------------

    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(default = "default_rate_limit_backoff_secs")]
    pub rate_limit_backoff_secs: u64,

    /// Fetch the per-instrument pages concurrently.
    #[serde(default)]
    pub parallel_fetch: bool,

    #[serde(default = "default_max_fetch_workers")]
    pub max_fetch_workers: usize,

    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    // --- Endpoints ----------------------------------------------------------

    #[serde(default = "default_rest_url")]
    pub rest_url: String,

    #[serde(default = "default_ws_url")]
    pub ws_url: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: SourceMode::Live,
            instruments: default_instruments(),
            last_n_days: default_last_n_days(),
            window_seconds: default_window_seconds(),
            allowed_lateness_ms: 0,
            max_open_windows: default_max_open_windows(),
            gap_policy: GapPolicy::default(),
            buffer_size: default_buffer_size(),
            save_every_n_sec: default_save_every_n_sec(),
            max_consecutive_failures: default_max_consecutive_failures(),
            emit_trades: true,
            emit_candles: true,
            sink: SinkKind::default(),
            output_dir: default_output_dir(),
            cache_dir: default_cache_dir(),
            rate_limit_backoff_secs: default_rate_limit_backoff_secs(),
            parallel_fetch: false,
            max_fetch_workers: default_max_fetch_workers(),
            http_timeout_secs: default_http_timeout_secs(),
            rest_url: default_rest_url(),
            ws_url: default_ws_url(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// A missing file is an error so the caller can fall back to defaults
    /// with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read pipeline config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse pipeline config from {}", path.display()))?;

        info!(
            path = %path.display(),
            mode = %config.mode,
            instruments = ?config.instruments,
            "pipeline config loaded"
        );

        Ok(config)
    }

    /// Apply `PIPELINE_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(mode) = lookup("PIPELINE_MODE") {
            self.mode = mode.parse()?;
        }
        if let Some(list) = lookup("PIPELINE_INSTRUMENTS") {
            self.instruments = list
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(days) = lookup("PIPELINE_LAST_N_DAYS") {
            self.last_n_days = days
                .trim()
                .parse()
                .with_context(|| format!("PIPELINE_LAST_N_DAYS is not a day count: {days}"))?;
        }
        Ok(())
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.instruments.is_empty() {
            anyhow::bail!("at least one instrument must be configured");
        }
        if self.window_seconds == 0 {
            anyhow::bail!("window_seconds must be positive");
        }
        if self.window_seconds > MAX_WINDOW_SECONDS {
            anyhow::bail!(
                "window_seconds {} exceeds the maximum of {MAX_WINDOW_SECONDS}",
                self.window_seconds
            );
        }
        if self.buffer_size == 0 {
            anyhow::bail!("buffer_size must be positive");
        }
        if self.allowed_lateness_ms < 0 {
            anyhow::bail!("allowed_lateness_ms cannot be negative");
        }
        if self.allowed_lateness_ms > MAX_ALLOWED_LATENESS_MS {
            anyhow::bail!(
                "allowed_lateness_ms {} exceeds the maximum of {MAX_ALLOWED_LATENESS_MS}",
                self.allowed_lateness_ms
            );
        }
        if self.max_open_windows == 0 {
            anyhow::bail!("max_open_windows must be at least 1");
        }
        if !self.emit_trades && !self.emit_candles {
            anyhow::bail!("nothing to emit: enable emit_trades and/or emit_candles");
        }
        Ok(())
    }

    pub fn window_ms(&self) -> i64 {
        i64::try_from(self.window_seconds)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000)
    }

    pub fn window_settings(&self) -> WindowSettings {
        WindowSettings {
            window_ms: self.window_ms(),
            allowed_lateness_ms: self.allowed_lateness_ms,
            max_open_windows: self.max_open_windows,
            gap_policy: self.gap_policy,
        }
    }

    pub fn save_every(&self) -> Duration {
        Duration::from_secs(self.save_every_n_sec)
    }

    pub fn rate_limit_backoff(&self) -> Duration {
        Duration::from_secs(self.rate_limit_backoff_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Worker count used by the historical fan-out (1 = sequential).
    pub fn fetch_concurrency(&self) -> usize {
        if self.parallel_fetch {
            self.max_fetch_workers.max(1)
        } else {
            1
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.mode, SourceMode::Live);
        assert_eq!(cfg.instruments, vec!["BTC/USD"]);
        assert_eq!(cfg.window_ms(), 60_000);
        assert_eq!(cfg.max_open_windows, 2);
        assert_eq!(cfg.gap_policy, GapPolicy::Skip);
        assert_eq!(cfg.fetch_concurrency(), 1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "mode": "historical", "instruments": ["ETH/USD"], "gap_policy": "carry_forward" }"#;
        let cfg: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.mode, SourceMode::Historical);
        assert_eq!(cfg.instruments, vec!["ETH/USD"]);
        assert_eq!(cfg.gap_policy, GapPolicy::CarryForward);
        assert_eq!(cfg.buffer_size, 100);
        assert_eq!(cfg.rate_limit_backoff(), Duration::from_secs(30));
    }

    #[test]
    fn invalid_mode_is_rejected() {
        let json = r#"{ "mode": "replay" }"#;
        assert!(serde_json::from_str::<PipelineConfig>(json).is_err());
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let env: HashMap<&str, &str> = [
            ("PIPELINE_MODE", "historical"),
            ("PIPELINE_INSTRUMENTS", "btc/usd, eth/usd,,"),
            ("PIPELINE_LAST_N_DAYS", "7"),
        ]
        .into_iter()
        .collect();

        let mut cfg = PipelineConfig::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.mode, SourceMode::Historical);
        assert_eq!(cfg.instruments, vec!["BTC/USD", "ETH/USD"]);
        assert_eq!(cfg.last_n_days, 7);
    }

    #[test]
    fn bad_day_override_is_an_error() {
        let mut cfg = PipelineConfig::default();
        let res = cfg.apply_overrides(|k| (k == "PIPELINE_LAST_N_DAYS").then(|| "many".to_string()));
        assert!(res.is_err());
    }

    #[test]
    fn validate_rejects_degenerate_settings() {
        let mut cfg = PipelineConfig::default();
        cfg.buffer_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.instruments.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.emit_trades = false;
        cfg.emit_candles = false;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_caps_window_and_lateness() {
        let mut cfg = PipelineConfig::default();
        cfg.window_seconds = MAX_WINDOW_SECONDS;
        cfg.allowed_lateness_ms = MAX_ALLOWED_LATENESS_MS;
        assert!(cfg.validate().is_ok());

        cfg.window_seconds = u64::MAX;
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.allowed_lateness_ms = i64::MAX;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn window_ms_saturates_instead_of_wrapping() {
        let mut cfg = PipelineConfig::default();
        assert_eq!(cfg.window_ms(), 60_000);

        cfg.window_seconds = u64::MAX;
        assert_eq!(cfg.window_ms(), i64::MAX);

        cfg.window_seconds = i64::MAX as u64 / 1000 + 1;
        assert_eq!(cfg.window_ms(), i64::MAX);
    }

    #[test]
    fn load_reads_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline_config.json");
        std::fs::write(&path, r#"{ "buffer_size": 7, "parallel_fetch": true }"#).unwrap();

        let cfg = PipelineConfig::load(&path).unwrap();
        assert_eq!(cfg.buffer_size, 7);
        assert_eq!(cfg.fetch_concurrency(), 4);
        assert!(PipelineConfig::load(dir.path().join("missing.json")).is_err());
    }
}
