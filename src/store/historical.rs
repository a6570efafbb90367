// =============================================================================
// Historical Store Gateway — read-only access to the ingested market dataset
// =============================================================================
//
// Prices, technical indicators, news, and recommendations keyed by
// (ticker, date). All of it was written by the offline pipelines; the core
// never mutates these tables and opens the database read-only.
//
// Transient SQLite faults (busy/locked) surface as UNAVAILABLE and are
// retried once internally with a jittered backoff capped at 200 ms.
// =============================================================================

use chrono::NaiveDate;
use rand::Rng;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use tracing::warn;

use crate::error::GameError;
use crate::types::{MarketDay, NewsItem, Recommendation, TechnicalSnapshot};

/// Read-only gateway over the historical schemas.
///
/// A connection is opened per call; SQLite handles concurrent readers without
/// contention and the core never writes through this type.
pub struct HistoricalStore {
    db_path: String,
    earliest: NaiveDate,
}

impl HistoricalStore {
    pub fn open(db_path: &str, earliest: NaiveDate) -> anyhow::Result<Self> {
        // Fail fast if the database is missing or unreadable.
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        drop(conn);
        Ok(Self {
            db_path: db_path.to_string(),
            earliest,
        })
    }

    /// The fixed contractual lower bound on game dates.
    pub fn earliest_allowed_date(&self) -> NaiveDate {
        self.earliest
    }

    // ── Connection plumbing ─────────────────────────────────────────────

    fn connect(&self) -> rusqlite::Result<Connection> {
        Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
    }

    /// Run a read, retrying once on a transient fault with jittered backoff.
    fn read<T>(
        &self,
        op: impl Fn(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, GameError> {
        match self.connect().and_then(|conn| op(&conn)) {
            Ok(v) => Ok(v),
            Err(e) if is_transient(&e) => {
                let backoff = rand::thread_rng().gen_range(20..=200);
                warn!(backoff_ms = backoff, error = %e, "transient store fault, retrying");
                std::thread::sleep(std::time::Duration::from_millis(backoff));
                self.connect()
                    .and_then(|conn| op(&conn))
                    .map_err(|e| GameError::Unavailable(format!("historical store: {e}")))
            }
            Err(e) => Err(GameError::Internal(e.into())),
        }
    }

    fn check_date(&self, date: NaiveDate) -> Result<(), GameError> {
        if date < self.earliest {
            return Err(GameError::OutOfRange(format!(
                "date {date} precedes earliest allowed date {}",
                self.earliest
            )));
        }
        Ok(())
    }

    // ── Prices ──────────────────────────────────────────────────────────

    /// Ordered OHLCV bars for `ticker` in `[from, to]` (inclusive).
    pub fn prices(
        &self,
        ticker: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<MarketDay>, GameError> {
        self.check_date(from)?;
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT date, ticker, open, high, low, close, volume
                 FROM market_prices
                 WHERE ticker = ?1 AND date >= ?2 AND date <= ?3
                 ORDER BY date ASC",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![ticker, from.to_string(), to.to_string()],
                market_day_from_row,
            )?;
            rows.collect()
        })
    }

    /// Every date for which `ticker` has a price, ascending, from the
    /// earliest allowed date on. Used for game-window resolution.
    pub fn price_dates(&self, ticker: &str) -> Result<Vec<NaiveDate>, GameError> {
        let earliest = self.earliest;
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT date FROM market_prices
                 WHERE ticker = ?1 AND date >= ?2
                 ORDER BY date ASC",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![ticker, earliest.to_string()],
                |row| {
                    let raw: String = row.get(0)?;
                    parse_date(&raw, 0)
                },
            )?;
            rows.collect()
        })
    }

    // ── Technical indicators ────────────────────────────────────────────

    /// Indicator snapshot for (ticker, date), or None when not computed.
    pub fn indicators(
        &self,
        ticker: &str,
        date: NaiveDate,
    ) -> Result<Option<TechnicalSnapshot>, GameError> {
        self.check_date(date)?;
        self.read(|conn| {
            conn.query_row(
                "SELECT rsi_14, ema_9, ema_21, adx, atr_14, bollinger_width,
                        roc_14, volume_ratio, zscore_20
                 FROM feature_snapshots
                 WHERE ticker = ?1 AND date = ?2",
                rusqlite::params![ticker, date.to_string()],
                |row| {
                    Ok(TechnicalSnapshot {
                        rsi_14: row.get(0)?,
                        ema_9: row.get(1)?,
                        ema_21: row.get(2)?,
                        adx: row.get(3)?,
                        atr_14: row.get(4)?,
                        bollinger_width: row.get(5)?,
                        roc_14: row.get(6)?,
                        volume_ratio: row.get(7)?,
                        zscore_20: row.get(8)?,
                    })
                },
            )
            .optional()
        })
    }

    // ── News ────────────────────────────────────────────────────────────

    /// News for `ticker` on `date`, newest first, with the minimum-coverage
    /// contract: when fewer than `min_count` items exist on the day, the most
    /// recent earlier items are appended until `min_count` is reached or the
    /// store is exhausted.
    pub fn news(
        &self,
        ticker: &str,
        date: NaiveDate,
        min_count: usize,
    ) -> Result<Vec<NewsItem>, GameError> {
        self.check_date(date)?;
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ticker, published_at, headline, body, source, sentiment_score
                 FROM news_items
                 WHERE ticker = ?1 AND substr(published_at, 1, 10) = ?2
                 ORDER BY published_at DESC",
            )?;
            let mut items: Vec<NewsItem> = stmt
                .query_map(
                    rusqlite::params![ticker, date.to_string()],
                    news_item_from_row,
                )?
                .collect::<rusqlite::Result<_>>()?;

            if items.len() < min_count {
                let mut stmt = conn.prepare(
                    "SELECT ticker, published_at, headline, body, source, sentiment_score
                     FROM news_items
                     WHERE ticker = ?1 AND substr(published_at, 1, 10) < ?2
                     ORDER BY published_at DESC
                     LIMIT ?3",
                )?;
                let backfill = stmt.query_map(
                    rusqlite::params![
                        ticker,
                        date.to_string(),
                        (min_count - items.len()) as i64
                    ],
                    news_item_from_row,
                )?;
                for item in backfill {
                    items.push(item?);
                }
            }

            Ok(items)
        })
    }

    // ── Recommendations ─────────────────────────────────────────────────

    /// The agent recommendation for (ticker, date), or None when absent.
    pub fn recommendation(
        &self,
        ticker: &str,
        date: NaiveDate,
    ) -> Result<Option<Recommendation>, GameError> {
        self.check_date(date)?;
        self.read(|conn| {
            conn.query_row(
                "SELECT action, confidence, technical_signal, sentiment_signal,
                        risk_level, rationale_summary
                 FROM agent_recommendations
                 WHERE ticker = ?1 AND date = ?2",
                rusqlite::params![ticker, date.to_string()],
                |row| {
                    let action: String = row.get(0)?;
                    let technical: String = row.get(2)?;
                    let sentiment: String = row.get(3)?;
                    let risk: String = row.get(4)?;
                    Ok(Recommendation {
                        action: parse_enum(&action, 0)?,
                        confidence: row.get(1)?,
                        technical_signal: parse_enum(&technical, 2)?,
                        sentiment_signal: parse_enum(&sentiment, 3)?,
                        risk_level: parse_enum(&risk, 4)?,
                        rationale_summary: row.get(5)?,
                        synthetic: false,
                    })
                },
            )
            .optional()
        })
    }
}

impl std::fmt::Debug for HistoricalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoricalStore")
            .field("db_path", &self.db_path)
            .field("earliest", &self.earliest)
            .finish()
    }
}

// =============================================================================
// Row mapping helpers
// =============================================================================

fn is_transient(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(ffi, _)
            if matches!(
                ffi.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

fn parse_date(raw: &str, idx: usize) -> rusqlite::Result<NaiveDate> {
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })
}

fn parse_enum<T: std::str::FromStr<Err = String>>(
    raw: &str,
    idx: usize,
) -> rusqlite::Result<T> {
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            e.into(),
        )
    })
}

fn market_day_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MarketDay> {
    let raw_date: String = row.get(0)?;
    Ok(MarketDay {
        date: parse_date(&raw_date, 0)?,
        ticker: row.get(1)?,
        open: row.get(2)?,
        high: row.get(3)?,
        low: row.get(4)?,
        close: row.get(5)?,
        volume: row.get(6)?,
    })
}

fn news_item_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NewsItem> {
    let raw_ts: String = row.get(1)?;
    let published_at = chrono::DateTime::parse_from_rfc3339(&raw_ts)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?
        .with_timezone(&chrono::Utc);
    Ok(NewsItem {
        ticker: row.get(0)?,
        published_at,
        headline: row.get(2)?,
        body: row.get(3)?,
        source: row.get(4)?,
        sentiment_score: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::store::testfix;
    use chrono::NaiveDate;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn prices_are_ordered_and_bounded() {
        let fix = testfix::Fixture::new();
        fix.insert_price("AAPL", "2025-03-03", 100.0, 102.0, 99.0, 101.0, 1e6);
        fix.insert_price("AAPL", "2025-03-04", 101.0, 103.0, 100.0, 102.0, 1e6);
        fix.insert_price("AAPL", "2025-03-05", 102.0, 104.0, 101.0, 103.0, 1e6);
        let store = fix.historical();

        let bars = store
            .prices("AAPL", d("2025-03-03"), d("2025-03-04"))
            .unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date, d("2025-03-03"));
        assert_eq!(bars[1].close, 102.0);
    }

    #[test]
    fn reads_before_earliest_fail_out_of_range() {
        let fix = testfix::Fixture::new();
        let store = fix.historical();
        let err = store
            .prices("AAPL", d("2024-12-31"), d("2025-01-05"))
            .unwrap_err();
        assert_eq!(err.code(), "OUT_OF_RANGE");
    }

    #[test]
    fn indicators_absent_is_none() {
        let fix = testfix::Fixture::new();
        let store = fix.historical();
        assert!(store.indicators("AAPL", d("2025-03-03")).unwrap().is_none());
    }

    #[test]
    fn news_backfills_to_min_count() {
        let fix = testfix::Fixture::new();
        // Two items on the requested day, three earlier.
        fix.insert_news("AAPL", "2025-03-05T14:00:00+00:00", "on-day late");
        fix.insert_news("AAPL", "2025-03-05T09:00:00+00:00", "on-day early");
        fix.insert_news("AAPL", "2025-03-04T12:00:00+00:00", "prior 1");
        fix.insert_news("AAPL", "2025-03-03T12:00:00+00:00", "prior 2");
        fix.insert_news("AAPL", "2025-03-01T12:00:00+00:00", "prior 3");
        let store = fix.historical();

        let items = store.news("AAPL", d("2025-03-05"), 4).unwrap();
        assert_eq!(items.len(), 4);
        // On-day items first, newest first, then backfill newest first.
        assert_eq!(items[0].headline, "on-day late");
        assert_eq!(items[1].headline, "on-day early");
        assert_eq!(items[2].headline, "prior 1");
        assert_eq!(items[3].headline, "prior 2");

        // Store exhaustion: asking for more than exists returns everything.
        let items = store.news("AAPL", d("2025-03-05"), 10).unwrap();
        assert_eq!(items.len(), 5);
    }

    #[test]
    fn recommendation_round_trips() {
        let fix = testfix::Fixture::new();
        fix.insert_recommendation("AAPL", "2025-03-05", "STRONG_BUY", 0.82);
        let store = fix.historical();

        let rec = store
            .recommendation("AAPL", d("2025-03-05"))
            .unwrap()
            .expect("present");
        assert_eq!(rec.action, crate::types::RecAction::StrongBuy);
        assert!((rec.confidence - 0.82).abs() < 1e-12);
        assert!(!rec.synthetic);

        assert!(store.recommendation("AAPL", d("2025-03-06")).unwrap().is_none());
    }
}
