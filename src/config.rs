// =============================================================================
// Server configuration — environment-driven, with defaults
// =============================================================================
//
// Everything the core needs from the outside world: the database path (DSN),
// the contractual earliest allowed game date, the default ticker set for the
// game-data endpoint, and the HTTP listen address. No per-request API keys.
// =============================================================================

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_db_path() -> String {
    "marketroom.db".to_string()
}

fn default_earliest_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 1).expect("valid constant date")
}

fn default_tickers() -> Vec<String> {
    vec![
        "AAPL".to_string(),
        "MSFT".to_string(),
        "GOOGL".to_string(),
        "AMZN".to_string(),
        "NVDA".to_string(),
    ]
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Process-wide configuration, resolved once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// SQLite database path. Historical schemas are read-only from the core;
    /// the multiplayer schema is read/write.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Contractual lower bound on game dates. Reads before this fail with
    /// OUT_OF_RANGE.
    #[serde(default = "default_earliest_date")]
    pub earliest_allowed_date: NaiveDate,

    /// Ticker set used when the game-data endpoint is called without one.
    #[serde(default = "default_tickers")]
    pub default_tickers: Vec<String>,

    /// Request deadline applied to every handler.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            earliest_allowed_date: default_earliest_date(),
            default_tickers: default_tickers(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ServerConfig {
    /// Build the config from the environment, falling back to defaults for
    /// anything unset. Malformed values are rejected rather than ignored.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("MARKETROOM_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(path) = std::env::var("MARKETROOM_DB") {
            config.db_path = path;
        }
        if let Ok(raw) = std::env::var("MARKETROOM_EARLIEST_DATE") {
            config.earliest_allowed_date = raw
                .parse()
                .map_err(|e| anyhow::anyhow!("MARKETROOM_EARLIEST_DATE {raw:?}: {e}"))?;
        }
        if let Ok(raw) = std::env::var("MARKETROOM_TICKERS") {
            let tickers: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !tickers.is_empty() {
                config.default_tickers = tickers;
            }
        }
        if let Ok(raw) = std::env::var("MARKETROOM_REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs = raw
                .parse()
                .map_err(|e| anyhow::anyhow!("MARKETROOM_REQUEST_TIMEOUT_SECS {raw:?}: {e}"))?;
        }

        Ok(config)
    }
}
