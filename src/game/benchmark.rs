// =============================================================================
// AI benchmark — the deterministic opponent every room plays against
// =============================================================================
//
// The AI follows the daily recommendations mechanically: it queues an
// equal-weight buy on a BUY/STRONG_BUY day when flat in the ticker, queues a
// full liquidation on SELL/STRONG_SELL, and executes at the same next-open
// prices students get. Its whole value curve is a pure function of the slice,
// so every process and every restart reproduces it exactly.
// =============================================================================

use std::collections::BTreeMap;

use crate::game::slice::GameSlice;
use crate::types::{RecAction, TradeAction};

/// Per-day portfolio values of the AI, index = day, `len == slice.num_days()`.
/// `values[0] == initial_cash`.
pub fn run_benchmark(slice: &GameSlice, initial_cash: f64) -> Vec<f64> {
    let mut cash = initial_cash;
    let mut holdings: BTreeMap<String, u64> = BTreeMap::new();
    let mut queued: Vec<(String, TradeAction)> = Vec::new();
    let mut values = Vec::with_capacity(slice.num_days());

    for day in 0..slice.num_days() {
        if day > 0 && slice.days[day].is_trading_day && !queued.is_empty() {
            execute_queued(slice, day, &mut cash, &mut holdings, &mut queued);
        }

        let holdings_value: f64 = holdings
            .iter()
            .map(|(t, &shares)| {
                shares as f64 * slice.close_on_or_before(t, day).unwrap_or(0.0)
            })
            .sum();
        values.push(cash + holdings_value);

        // Decide from today's recommendations; fills happen at the next open.
        if day + 1 < slice.num_days() {
            for t in &slice.tickers {
                if queued.iter().any(|(q, _)| q == t) {
                    continue;
                }
                let Some(rec) = slice.recommendation(t, day) else {
                    continue;
                };
                match rec.action {
                    RecAction::Buy | RecAction::StrongBuy => {
                        if !holdings.contains_key(t) {
                            queued.push((t.clone(), TradeAction::Buy));
                        }
                    }
                    RecAction::Sell | RecAction::StrongSell => {
                        if holdings.contains_key(t) {
                            queued.push((t.clone(), TradeAction::Sell));
                        }
                    }
                    RecAction::Hold => {}
                }
            }
        }
    }

    values
}

fn execute_queued(
    slice: &GameSlice,
    day: usize,
    cash: &mut f64,
    holdings: &mut BTreeMap<String, u64>,
    queued: &mut Vec<(String, TradeAction)>,
) {
    // Sells first, then buys, ticker-ascending — the same canonical order the
    // portfolio engine applies to students.
    queued.sort_by(|a, b| {
        let rank = |t: &TradeAction| match t {
            TradeAction::Sell => 0,
            TradeAction::Buy => 1,
        };
        rank(&a.1).cmp(&rank(&b.1)).then_with(|| a.0.cmp(&b.0))
    });

    let buy_count = queued
        .iter()
        .filter(|(t, a)| *a == TradeAction::Buy && slice.open_on(t, day).is_some())
        .count();

    let mut remaining = Vec::new();
    let mut budget_per_buy = 0.0;
    let mut budget_set = false;

    for (ticker, action) in queued.drain(..) {
        let Some(price) = slice.open_on(&ticker, day) else {
            remaining.push((ticker, action));
            continue;
        };
        match action {
            TradeAction::Sell => {
                if let Some(shares) = holdings.remove(&ticker) {
                    *cash += shares as f64 * price;
                }
            }
            TradeAction::Buy => {
                // Equal-weight allocation fixed after all sells have landed.
                if !budget_set {
                    budget_per_buy = *cash / buy_count.max(1) as f64;
                    budget_set = true;
                }
                let shares = (budget_per_buy / price).floor() as u64;
                let cost = shares as f64 * price;
                if shares > 0 && cost <= *cash {
                    *cash -= cost;
                    *holdings.entry(ticker).or_insert(0) += shares;
                }
            }
        }
    }

    *queued = remaining;
}

/// The AI's total return at `day`, in percent.
pub fn return_pct_at(values: &[f64], day: usize, initial_cash: f64) -> f64 {
    let day = day.min(values.len().saturating_sub(1));
    match values.get(day) {
        Some(v) if initial_cash > 0.0 => (v / initial_cash - 1.0) * 100.0,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testfix::Fixture;
    use crate::game::slice::SliceCache;

    #[test]
    fn ai_follows_a_buy_recommendation() {
        let fix = Fixture::new();
        fix.insert_price_run("AAPL", "2025-03-03", &[100.0, 110.0, 121.0], 125.0);
        fix.insert_recommendation("AAPL", "2025-03-03", "STRONG_BUY", 0.9);
        let store = fix.historical();
        let slice = SliceCache::new()
            .get_or_build(&store, &["AAPL".into()], 3, Some("2025-03-03".parse().unwrap()), None)
            .unwrap();

        let values = run_benchmark(&slice, 10_000.0);
        assert_eq!(values.len(), 3);
        assert_eq!(values[0], 10_000.0);
        // Buys 90 shares at the day-1 open of 110 (9 900), valued at the
        // day-1 close of 121.
        assert_eq!(values[1], 100.0 + 90.0 * 121.0);
        assert_eq!(values[2], 100.0 + 90.0 * 125.0);
    }

    #[test]
    fn ai_never_acts_on_hold() {
        let fix = Fixture::new();
        fix.insert_price_run("AAPL", "2025-03-03", &[100.0, 110.0, 121.0], 125.0);
        fix.insert_recommendation("AAPL", "2025-03-03", "HOLD", 0.5);
        let store = fix.historical();
        let slice = SliceCache::new()
            .get_or_build(&store, &["AAPL".into()], 3, Some("2025-03-03".parse().unwrap()), None)
            .unwrap();

        let values = run_benchmark(&slice, 10_000.0);
        assert_eq!(values, vec![10_000.0; 3]);
    }

    #[test]
    fn ai_curve_is_reproducible() {
        let fix = Fixture::new();
        fix.insert_price_run("AAPL", "2025-03-03", &[100.0, 110.0, 105.0, 112.0], 118.0);
        fix.insert_recommendation("AAPL", "2025-03-03", "BUY", 0.7);
        fix.insert_recommendation("AAPL", "2025-03-05", "SELL", 0.6);
        let store = fix.historical();
        let slice = SliceCache::new()
            .get_or_build(&store, &["AAPL".into()], 4, Some("2025-03-03".parse().unwrap()), None)
            .unwrap();

        let a = run_benchmark(&slice, 10_000.0);
        let b = run_benchmark(&slice, 10_000.0);
        assert_eq!(a, b);
        // The SELL on day 2 liquidates at the day-3 open.
        assert!(a[3] > 0.0);
    }

    #[test]
    fn return_pct_clamps_to_curve_end() {
        let values = vec![10_000.0, 10_500.0];
        assert_eq!(return_pct_at(&values, 0, 10_000.0), 0.0);
        assert!((return_pct_at(&values, 1, 10_000.0) - 5.0).abs() < 1e-12);
        assert!((return_pct_at(&values, 9, 10_000.0) - 5.0).abs() < 1e-12);
    }
}
