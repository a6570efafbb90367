// =============================================================================
// Test fixtures — seeded SQLite databases for store and slice tests
// =============================================================================

use chrono::NaiveDate;
use rusqlite::Connection;
use tempfile::NamedTempFile;

use crate::store::historical::HistoricalStore;
use crate::store::multiplayer::MultiplayerStore;

/// A temporary database pre-created with the historical schemas, plus insert
/// helpers mimicking what the offline pipelines write.
pub struct Fixture {
    file: NamedTempFile,
    pub earliest: NaiveDate,
}

impl Fixture {
    pub fn new() -> Self {
        let file = NamedTempFile::new().expect("temp db");
        let conn = Connection::open(file.path()).expect("open temp db");
        conn.execute_batch(
            "CREATE TABLE market_prices (
                ticker TEXT NOT NULL,
                date   TEXT NOT NULL,
                open   REAL NOT NULL,
                high   REAL NOT NULL,
                low    REAL NOT NULL,
                close  REAL NOT NULL,
                volume REAL NOT NULL,
                PRIMARY KEY (ticker, date)
            );
            CREATE TABLE feature_snapshots (
                ticker TEXT NOT NULL,
                date   TEXT NOT NULL,
                rsi_14 REAL, ema_9 REAL, ema_21 REAL, adx REAL, atr_14 REAL,
                bollinger_width REAL, roc_14 REAL, volume_ratio REAL, zscore_20 REAL,
                PRIMARY KEY (ticker, date)
            );
            CREATE TABLE news_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticker TEXT NOT NULL,
                published_at TEXT NOT NULL,
                headline TEXT NOT NULL,
                body TEXT,
                source TEXT NOT NULL,
                sentiment_score REAL
            );
            CREATE TABLE agent_recommendations (
                ticker TEXT NOT NULL,
                date   TEXT NOT NULL,
                action TEXT NOT NULL,
                confidence REAL NOT NULL,
                technical_signal TEXT NOT NULL,
                sentiment_signal TEXT NOT NULL,
                risk_level TEXT NOT NULL,
                rationale_summary TEXT NOT NULL,
                PRIMARY KEY (ticker, date)
            );",
        )
        .expect("create historical schema");

        Self {
            file,
            earliest: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
        }
    }

    pub fn path(&self) -> &str {
        self.file.path().to_str().expect("utf-8 temp path")
    }

    pub fn historical(&self) -> HistoricalStore {
        HistoricalStore::open(self.path(), self.earliest).expect("open historical store")
    }

    pub fn multiplayer(&self) -> MultiplayerStore {
        MultiplayerStore::open(self.path()).expect("open multiplayer store")
    }

    fn conn(&self) -> Connection {
        Connection::open(self.file.path()).expect("open temp db")
    }

    pub fn insert_price(
        &self,
        ticker: &str,
        date: &str,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) {
        self.conn()
            .execute(
                "INSERT INTO market_prices (ticker, date, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![ticker, date, open, high, low, close, volume],
            )
            .expect("insert price");
    }

    /// Insert a run of consecutive calendar-day bars starting at `start`,
    /// one per element of `opens`; each close is the next day's open (the
    /// last close is `last_close`).
    pub fn insert_price_run(&self, ticker: &str, start: &str, opens: &[f64], last_close: f64) {
        let start: NaiveDate = start.parse().expect("date");
        for (i, &open) in opens.iter().enumerate() {
            let date = start + chrono::Days::new(i as u64);
            let close = if i + 1 < opens.len() {
                opens[i + 1]
            } else {
                last_close
            };
            self.insert_price(
                ticker,
                &date.to_string(),
                open,
                open.max(close) * 1.01,
                open.min(close) * 0.99,
                close,
                1_000_000.0,
            );
        }
    }

    pub fn insert_news(&self, ticker: &str, published_at: &str, headline: &str) {
        self.conn()
            .execute(
                "INSERT INTO news_items (ticker, published_at, headline, body, source, sentiment_score)
                 VALUES (?1, ?2, ?3, NULL, 'wire', 0.1)",
                rusqlite::params![ticker, published_at, headline],
            )
            .expect("insert news");
    }

    pub fn insert_recommendation(&self, ticker: &str, date: &str, action: &str, confidence: f64) {
        self.conn()
            .execute(
                "INSERT INTO agent_recommendations
                 (ticker, date, action, confidence, technical_signal, sentiment_signal,
                  risk_level, rationale_summary)
                 VALUES (?1, ?2, ?3, ?4, 'BULLISH', 'NEUTRAL', 'MEDIUM', 'fixture')",
                rusqlite::params![ticker, date, action, confidence],
            )
            .expect("insert recommendation");
    }

    pub fn insert_indicators(&self, ticker: &str, date: &str, rsi_14: f64) {
        self.conn()
            .execute(
                "INSERT INTO feature_snapshots (ticker, date, rsi_14)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![ticker, date, rsi_14],
            )
            .expect("insert indicators");
    }
}
