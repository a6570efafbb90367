// =============================================================================
// Game Slice Builder — the deterministic per-room view of history
// =============================================================================
//
// A slice is the ordered list of `num_days` calendar days a room plays
// through, with per-ticker prices, recommendations, technicals, and news
// attached to each day. Built once per (tickers, num_days, start) triple and
// cached; identical keys yield byte-identical slices, which is what makes a
// room reproducible for every student who joins it.
//
// num_days counts calendar days requested. A day is a trading day iff every
// configured ticker has a price on it; construction requires at least
// ceil(0.6 * num_days) trading days in the window.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{Days, NaiveDate};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::GameError;
use crate::store::historical::HistoricalStore;
use crate::types::{MarketDay, NewsItem, Recommendation, TechnicalSnapshot};

/// How many days before the window start the builder will look for a
/// recommendation or indicator snapshot to carry forward into day 0.
const FILL_LOOKBACK_DAYS: u64 = 10;

/// Minimum news items attached per (ticker, day).
const MIN_NEWS_PER_DAY: usize = 10;

// =============================================================================
// Slice model
// =============================================================================

/// One playable day. Maps are keyed by ticker; `BTreeMap` keeps serialization
/// deterministic.
#[derive(Debug, Clone, Serialize)]
pub struct GameDay {
    pub day: usize,
    pub date: NaiveDate,
    pub is_trading_day: bool,
    pub prices: BTreeMap<String, MarketDay>,
    pub recommendations: BTreeMap<String, Recommendation>,
    pub technicals: BTreeMap<String, TechnicalSnapshot>,
    pub news: BTreeMap<String, Vec<NewsItem>>,
}

/// The full deterministic sequence a room plays through.
#[derive(Debug, Clone, Serialize)]
pub struct GameSlice {
    /// Sorted, upper-cased.
    pub tickers: Vec<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub days: Vec<GameDay>,
}

impl GameSlice {
    pub fn num_days(&self) -> usize {
        self.days.len()
    }

    pub fn trading_day_count(&self) -> usize {
        self.days.iter().filter(|d| d.is_trading_day).count()
    }

    /// Cache key for a resolved (tickers, num_days, start) triple.
    pub fn cache_key(tickers: &[String], num_days: usize, start: NaiveDate) -> String {
        format!("{}|{}|{}", tickers.join(","), num_days, start)
    }

    /// Opening price of `ticker` on day `k`, if `k` is a trading day.
    pub fn open_on(&self, ticker: &str, day: usize) -> Option<f64> {
        let d = self.days.get(day)?;
        if !d.is_trading_day {
            return None;
        }
        d.prices.get(ticker).map(|m| m.open)
    }

    /// Closing price of `ticker` on day `k`, or the most recent close before
    /// it (carry-forward across non-trading days).
    pub fn close_on_or_before(&self, ticker: &str, day: usize) -> Option<f64> {
        let last = day.min(self.days.len().saturating_sub(1));
        self.days[..=last]
            .iter()
            .rev()
            .find_map(|d| d.prices.get(ticker).map(|m| m.close))
    }

    /// The first trading day strictly after `day`, if any.
    pub fn next_trading_day_after(&self, day: usize) -> Option<usize> {
        self.days
            .iter()
            .skip(day + 1)
            .find(|d| d.is_trading_day)
            .map(|d| d.day)
    }

    pub fn recommendation(&self, ticker: &str, day: usize) -> Option<&Recommendation> {
        self.days.get(day)?.recommendations.get(ticker)
    }
}

// =============================================================================
// Window resolution
// =============================================================================

/// Per-ticker date coverage gathered once per build.
struct WindowData {
    per_ticker: BTreeMap<String, BTreeSet<NaiveDate>>,
    /// Dates on which every ticker has a price.
    trading: BTreeSet<NaiveDate>,
}

fn required_trading_days(num_days: usize) -> usize {
    // ceil(0.6 * num_days)
    (3 * num_days + 4) / 5
}

fn load_window_data(
    store: &HistoricalStore,
    tickers: &[String],
) -> Result<WindowData, GameError> {
    let mut per_ticker = BTreeMap::new();
    for t in tickers {
        let dates: BTreeSet<NaiveDate> = store.price_dates(t)?.into_iter().collect();
        if dates.is_empty() {
            return Err(GameError::NotFound(format!("unknown ticker: {t}")));
        }
        per_ticker.insert(t.clone(), dates);
    }

    let mut iter = per_ticker.values();
    let mut trading = iter.next().cloned().unwrap_or_default();
    for dates in iter {
        trading = trading.intersection(dates).cloned().collect();
    }

    Ok(WindowData { per_ticker, trading })
}

fn coverage(trading: &BTreeSet<NaiveDate>, start: NaiveDate, end: NaiveDate) -> usize {
    trading.range(start..=end).count()
}

/// Apply the three resolution rules from the room contract and return the
/// resolved `(start, end)` window.
fn resolve_window(
    store: &HistoricalStore,
    data: &WindowData,
    num_days: usize,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
) -> Result<(NaiveDate, NaiveDate), GameError> {
    let earliest = store.earliest_allowed_date();
    let span = Days::new(num_days as u64 - 1);
    let need = required_trading_days(num_days);

    match (start_date, end_date) {
        (Some(start), end_opt) => {
            if start < earliest {
                return Err(GameError::OutOfRange(format!(
                    "start_date {start} precedes earliest allowed date {earliest}"
                )));
            }
            let end = start + span;
            if let Some(given_end) = end_opt {
                if given_end != end {
                    return Err(GameError::InsufficientData(format!(
                        "window [{start}, {given_end}] does not span {num_days} calendar days"
                    )));
                }
            }
            let have = coverage(&data.trading, start, end);
            if have < need {
                return Err(GameError::InsufficientData(format!(
                    "window [{start}, {end}] has {have} trading days, needs {need}"
                )));
            }
            Ok((start, end))
        }
        (None, Some(_)) => {
            // The contract enumerates exactly three cases: both dates, only
            // a start, or neither. An end without a start is not one of them.
            Err(GameError::Validation(
                "end_date requires start_date".into(),
            ))
        }
        (None, None) => {
            // Most recent qualifying window: walk candidate ends backwards
            // over the common trading dates.
            for &end in data.trading.iter().rev() {
                let start = end - span;
                if start < earliest {
                    break;
                }
                if coverage(&data.trading, start, end) >= need {
                    return Ok((start, end));
                }
            }
            Err(GameError::InsufficientData(format!(
                "no {num_days}-day window with {need} common trading days"
            )))
        }
    }
}

// =============================================================================
// Assembly
// =============================================================================

fn build_slice(
    store: &HistoricalStore,
    data: &WindowData,
    tickers: &[String],
    num_days: usize,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<GameSlice, GameError> {
    // One price fetch per ticker, then indexed by date.
    let mut price_maps: BTreeMap<String, HashMap<NaiveDate, MarketDay>> = BTreeMap::new();
    for t in tickers {
        let bars = store.prices(t, start, end)?;
        price_maps.insert(t.clone(), bars.into_iter().map(|b| (b.date, b)).collect());
    }

    // Seed per-ticker carry-forward state from the days just before the
    // window, so day 0 of a room that starts mid-history is not synthetic.
    let mut last_rec: BTreeMap<String, Option<Recommendation>> = BTreeMap::new();
    let mut last_tech: BTreeMap<String, Option<TechnicalSnapshot>> = BTreeMap::new();
    for t in tickers {
        let mut rec = None;
        let mut tech = None;
        for back in 1..=FILL_LOOKBACK_DAYS {
            let date = start - Days::new(back);
            if date < store.earliest_allowed_date() {
                break;
            }
            if rec.is_none() {
                rec = store.recommendation(t, date)?;
            }
            if tech.is_none() {
                tech = store.indicators(t, date)?;
            }
            if rec.is_some() && tech.is_some() {
                break;
            }
        }
        last_rec.insert(t.clone(), rec);
        last_tech.insert(t.clone(), tech);
    }

    let mut days = Vec::with_capacity(num_days);
    for k in 0..num_days {
        let date = start + Days::new(k as u64);
        let is_trading_day = data.trading.contains(&date);

        let mut prices = BTreeMap::new();
        let mut recommendations = BTreeMap::new();
        let mut technicals = BTreeMap::new();
        let mut news = BTreeMap::new();

        for t in tickers {
            if let Some(bar) = price_maps.get(t).and_then(|m| m.get(&date)) {
                prices.insert(t.clone(), bar.clone());
            }

            // Recommendation: today's, else the carried prior value, else the
            // tagged synthetic HOLD.
            match store.recommendation(t, date)? {
                Some(rec) => {
                    last_rec.insert(t.clone(), Some(rec.clone()));
                    recommendations.insert(t.clone(), rec);
                }
                None => {
                    let rec = last_rec
                        .get(t)
                        .and_then(|r| r.clone())
                        .unwrap_or_else(Recommendation::synthetic_hold);
                    recommendations.insert(t.clone(), rec);
                }
            }

            // Technicals: same carry-forward; absence stays absent (neutral).
            match store.indicators(t, date)? {
                Some(tech) => {
                    last_tech.insert(t.clone(), Some(tech.clone()));
                    technicals.insert(t.clone(), tech);
                }
                None => {
                    if let Some(tech) = last_tech.get(t).and_then(|x| x.clone()) {
                        technicals.insert(t.clone(), tech);
                    }
                }
            }

            news.insert(t.clone(), store.news(t, date, MIN_NEWS_PER_DAY)?);
        }

        days.push(GameDay {
            day: k,
            date,
            is_trading_day,
            prices,
            recommendations,
            technicals,
            news,
        });
    }

    Ok(GameSlice {
        tickers: tickers.to_vec(),
        start_date: start,
        end_date: end,
        days,
    })
}

// =============================================================================
// Cache
// =============================================================================

/// Process-wide slice cache. Two rooms built from the same resolved triple
/// share the same `Arc<GameSlice>`.
pub struct SliceCache {
    inner: RwLock<HashMap<String, Arc<GameSlice>>>,
}

impl SliceCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve the window, then return the cached slice or build and cache it.
    pub fn get_or_build(
        &self,
        store: &HistoricalStore,
        tickers: &[String],
        num_days: usize,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> Result<Arc<GameSlice>, GameError> {
        let mut sorted: Vec<String> = tickers.to_vec();
        sorted.sort();

        let data = load_window_data(store, &sorted)?;
        let (start, end) = resolve_window(store, &data, num_days, start_date, end_date)?;

        let key = GameSlice::cache_key(&sorted, num_days, start);
        if let Some(slice) = self.inner.read().get(&key) {
            debug!(key = %key, "slice cache hit");
            return Ok(slice.clone());
        }

        let slice = Arc::new(build_slice(store, &data, &sorted, num_days, start, end)?);
        info!(
            key = %key,
            trading_days = slice.trading_day_count(),
            "game slice built"
        );
        self.inner.write().insert(key, slice.clone());
        Ok(slice)
    }
}

impl Default for SliceCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testfix::Fixture;
    use crate::types::RecAction;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    /// Mon 2025-03-03 .. Fri 2025-03-07, one ticker, with a recommendation
    /// only on the first day.
    fn week_fixture() -> Fixture {
        let fix = Fixture::new();
        fix.insert_price_run("AAPL", "2025-03-03", &[100.0, 110.0, 121.0, 121.0, 122.0], 125.0);
        fix.insert_recommendation("AAPL", "2025-03-03", "BUY", 0.7);
        fix
    }

    #[test]
    fn required_trading_days_is_ceil() {
        assert_eq!(required_trading_days(1), 1);
        assert_eq!(required_trading_days(3), 2);
        assert_eq!(required_trading_days(5), 3);
        assert_eq!(required_trading_days(10), 6);
        assert_eq!(required_trading_days(90), 54);
    }

    #[test]
    fn explicit_window_resolves() {
        let fix = week_fixture();
        let store = fix.historical();
        let cache = SliceCache::new();
        let slice = cache
            .get_or_build(&store, &["AAPL".into()], 3, Some(d("2025-03-03")), Some(d("2025-03-05")))
            .unwrap();
        assert_eq!(slice.num_days(), 3);
        assert_eq!(slice.trading_day_count(), 3);
        assert_eq!(slice.open_on("AAPL", 1), Some(110.0));
    }

    #[test]
    fn mismatched_end_date_is_insufficient_data() {
        let fix = week_fixture();
        let store = fix.historical();
        let cache = SliceCache::new();
        let err = cache
            .get_or_build(&store, &["AAPL".into()], 3, Some(d("2025-03-03")), Some(d("2025-03-06")))
            .unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_DATA");
    }

    #[test]
    fn end_without_start_is_rejected() {
        let fix = week_fixture();
        let store = fix.historical();
        let cache = SliceCache::new();
        let err = cache
            .get_or_build(&store, &["AAPL".into()], 3, None, Some(d("2025-03-05")))
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[test]
    fn early_start_is_out_of_range() {
        let fix = week_fixture();
        let store = fix.historical();
        let cache = SliceCache::new();
        let err = cache
            .get_or_build(&store, &["AAPL".into()], 3, Some(d("2024-12-30")), None)
            .unwrap_err();
        assert_eq!(err.code(), "OUT_OF_RANGE");
    }

    #[test]
    fn unknown_ticker_is_not_found() {
        let fix = week_fixture();
        let store = fix.historical();
        let cache = SliceCache::new();
        let err = cache
            .get_or_build(&store, &["ZZZZ".into()], 3, None, None)
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[test]
    fn latest_window_chosen_when_no_dates_given() {
        let fix = week_fixture();
        let store = fix.historical();
        let cache = SliceCache::new();
        let slice = cache
            .get_or_build(&store, &["AAPL".into()], 3, None, None)
            .unwrap();
        // Latest 3-day window ending on the last priced date.
        assert_eq!(slice.end_date, d("2025-03-07"));
        assert_eq!(slice.start_date, d("2025-03-05"));
    }

    #[test]
    fn coverage_floor_rejects_sparse_windows() {
        let fix = Fixture::new();
        // Only 2 trading days inside a 10-day request (< ceil(6) = 6).
        fix.insert_price("AAPL", "2025-03-03", 100.0, 101.0, 99.0, 100.5, 1e6);
        fix.insert_price("AAPL", "2025-03-10", 101.0, 102.0, 100.0, 101.5, 1e6);
        let store = fix.historical();
        let cache = SliceCache::new();
        let err = cache
            .get_or_build(&store, &["AAPL".into()], 10, Some(d("2025-03-03")), None)
            .unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_DATA");
    }

    #[test]
    fn trading_day_requires_every_ticker() {
        let fix = Fixture::new();
        fix.insert_price_run("AAPL", "2025-03-03", &[100.0, 101.0, 102.0], 103.0);
        // MSFT missing on 03-04.
        fix.insert_price("MSFT", "2025-03-03", 200.0, 201.0, 199.0, 200.5, 1e6);
        fix.insert_price("MSFT", "2025-03-05", 202.0, 203.0, 201.0, 202.5, 1e6);
        let store = fix.historical();
        let cache = SliceCache::new();
        let slice = cache
            .get_or_build(
                &store,
                &["AAPL".into(), "MSFT".into()],
                3,
                Some(d("2025-03-03")),
                None,
            )
            .unwrap();
        assert!(slice.days[0].is_trading_day);
        assert!(!slice.days[1].is_trading_day);
        assert!(slice.days[2].is_trading_day);
        // AAPL's bar is still attached on the non-trading day.
        assert!(slice.days[1].prices.contains_key("AAPL"));
        assert!(!slice.days[1].prices.contains_key("MSFT"));
        assert_eq!(slice.next_trading_day_after(0), Some(2));
    }

    #[test]
    fn recommendations_fill_forward_then_synthesize() {
        let fix = week_fixture();
        let store = fix.historical();
        let cache = SliceCache::new();
        let slice = cache
            .get_or_build(&store, &["AAPL".into()], 5, Some(d("2025-03-03")), None)
            .unwrap();

        // Day 0 has the stored BUY; later days carry it forward untagged.
        let day0 = slice.recommendation("AAPL", 0).unwrap();
        assert_eq!(day0.action, RecAction::Buy);
        assert!(!day0.synthetic);
        let day3 = slice.recommendation("AAPL", 3).unwrap();
        assert_eq!(day3.action, RecAction::Buy);
        assert!(!day3.synthetic);

        // A ticker with no recommendation anywhere gets the synthetic HOLD.
        let fix2 = Fixture::new();
        fix2.insert_price_run("MSFT", "2025-03-03", &[200.0, 201.0, 202.0], 203.0);
        let store2 = fix2.historical();
        let cache2 = SliceCache::new();
        let slice2 = cache2
            .get_or_build(&store2, &["MSFT".into()], 3, Some(d("2025-03-03")), None)
            .unwrap();
        let rec = slice2.recommendation("MSFT", 0).unwrap();
        assert_eq!(rec.action, RecAction::Hold);
        assert_eq!(rec.confidence, 0.0);
        assert!(rec.synthetic);
    }

    #[test]
    fn identical_keys_share_identical_bytes() {
        let fix = week_fixture();
        let store = fix.historical();
        let cache = SliceCache::new();
        let a = cache
            .get_or_build(&store, &["AAPL".into()], 3, Some(d("2025-03-03")), None)
            .unwrap();
        let b = cache
            .get_or_build(&store, &["AAPL".into()], 3, Some(d("2025-03-03")), None)
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        // A fresh cache (fresh process) still yields byte-identical JSON.
        let cache2 = SliceCache::new();
        let c = cache2
            .get_or_build(&store, &["AAPL".into()], 3, Some(d("2025-03-03")), None)
            .unwrap();
        assert_eq!(
            serde_json::to_vec(&*a).unwrap(),
            serde_json::to_vec(&*c).unwrap()
        );
    }

    #[test]
    fn single_day_slice_has_one_trading_day() {
        let fix = week_fixture();
        let store = fix.historical();
        let cache = SliceCache::new();
        let slice = cache
            .get_or_build(&store, &["AAPL".into()], 1, Some(d("2025-03-03")), None)
            .unwrap();
        assert_eq!(slice.num_days(), 1);
        assert_eq!(slice.trading_day_count(), 1);
        assert_eq!(slice.next_trading_day_after(0), None);
    }
}
