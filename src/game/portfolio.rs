// =============================================================================
// Portfolio Engine — executes queued trades and rolls the portfolio forward
// =============================================================================
//
// Advancing a player from day k to day k+1:
//
//   1. If day k+1 trades, execute every still-pending trade submitted before
//      it at the day-(k+1) open, re-validating against live state first.
//      Race losers are resolved to Rejected in the ledger, never executed.
//   2. Canonical order: SELL before BUY (sells free cash first), ticker
//      ascending inside each group. This ordering is part of the contract.
//   3. Append the day-(k+1) snapshot at that day's close, carrying the last
//      known close across non-trading days.
//
// All money is IEEE-754 double; share counts are exact integers; nothing is
// rounded until export.
// =============================================================================

use tracing::{debug, info};

use crate::game::rules::TradeRejection;
use crate::game::slice::GameSlice;
use crate::room::player::{Holding, Player, PortfolioSnapshot, TradeStatus};
use crate::types::TradeAction;

/// What happened during one day advance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdvanceReport {
    pub executed: usize,
    pub rejected: usize,
}

/// Advance `player` one day. The caller guarantees
/// `player.current_day + 1 < slice.num_days()`.
pub fn advance_player(player: &mut Player, slice: &GameSlice, initial_cash: f64) -> AdvanceReport {
    let next = player.current_day + 1;
    debug_assert!(next < slice.num_days());

    let mut report = AdvanceReport::default();
    if slice.days[next].is_trading_day {
        report = execute_pending(player, slice, next);
    }

    append_snapshot(player, slice, next, initial_cash);
    player.current_day = next;
    player.touch();
    report
}

/// Execute all pending trades submitted before `day` at `day`'s open.
fn execute_pending(player: &mut Player, slice: &GameSlice, day: usize) -> AdvanceReport {
    // Indices of due trades, in canonical execution order.
    let mut due: Vec<usize> = player
        .trades
        .iter()
        .enumerate()
        .filter(|(_, t)| t.status == TradeStatus::Pending && t.day_submitted < day)
        .map(|(i, _)| i)
        .collect();
    due.sort_by(|&a, &b| {
        let ta = &player.trades[a];
        let tb = &player.trades[b];
        let rank = |t: &TradeAction| match t {
            TradeAction::Sell => 0,
            TradeAction::Buy => 1,
        };
        rank(&ta.action)
            .cmp(&rank(&tb.action))
            .then_with(|| ta.ticker.cmp(&tb.ticker))
    });

    let mut report = AdvanceReport::default();
    for idx in due {
        let (ticker, action, shares) = {
            let t = &player.trades[idx];
            (t.ticker.clone(), t.action, t.shares)
        };

        let Some(price) = slice.open_on(&ticker, day) else {
            // No open for this ticker today; the trade stays pending for the
            // next trading day.
            continue;
        };

        let outcome = match action {
            TradeAction::Sell => apply_sell(player, &ticker, shares, price),
            TradeAction::Buy => apply_buy(player, &ticker, shares, price),
        };

        let record = &mut player.trades[idx];
        match outcome {
            Ok(total) => {
                record.status = TradeStatus::Executed;
                record.day_executed = Some(day);
                record.price = Some(price);
                record.total = Some(total);
                report.executed += 1;
                info!(
                    player = %player.player_id,
                    ticker = %ticker,
                    action = %action,
                    shares,
                    price,
                    day,
                    "trade executed"
                );
            }
            Err(reason) => {
                record.status = TradeStatus::Rejected;
                record.rejection_reason = Some(reason.code().to_string());
                report.rejected += 1;
                debug!(
                    player = %player.player_id,
                    ticker = %ticker,
                    reason = reason.code(),
                    "queued trade rejected at execution"
                );
            }
        }
    }
    report
}

fn apply_sell(
    player: &mut Player,
    ticker: &str,
    shares: u64,
    price: f64,
) -> Result<f64, TradeRejection> {
    let held = player.holdings.get(ticker).map(|h| h.shares).unwrap_or(0);
    if held < shares {
        return Err(TradeRejection::InsufficientHoldings);
    }

    let total = shares as f64 * price;
    player.cash += total;
    if held == shares {
        player.holdings.remove(ticker);
    } else if let Some(h) = player.holdings.get_mut(ticker) {
        // avg_cost is untouched on sells.
        h.shares -= shares;
    }
    Ok(total)
}

fn apply_buy(
    player: &mut Player,
    ticker: &str,
    shares: u64,
    price: f64,
) -> Result<f64, TradeRejection> {
    let total = shares as f64 * price;
    if total > player.cash {
        return Err(TradeRejection::InsufficientCash);
    }

    player.cash -= total;
    match player.holdings.get_mut(ticker) {
        Some(h) => {
            let combined = h.shares + shares;
            h.avg_cost = (h.shares as f64 * h.avg_cost + total) / combined as f64;
            h.shares = combined;
        }
        None => {
            player.holdings.insert(
                ticker.to_string(),
                Holding {
                    shares,
                    avg_cost: price,
                },
            );
        }
    }
    Ok(total)
}

/// Value the portfolio at `day`'s close and append the snapshot.
fn append_snapshot(player: &mut Player, slice: &GameSlice, day: usize, initial_cash: f64) {
    let holdings_value: f64 = player
        .holdings
        .iter()
        .map(|(t, h)| {
            h.shares as f64 * slice.close_on_or_before(t, day).unwrap_or(h.avg_cost)
        })
        .sum();

    let portfolio_value = player.cash + holdings_value;
    let snapshot = PortfolioSnapshot {
        day,
        portfolio_value,
        cash: player.cash,
        holdings_value,
        return_pct: (portfolio_value / initial_cash - 1.0) * 100.0,
        return_usd: portfolio_value - initial_cash,
    };

    player.portfolio_value = portfolio_value;
    player.total_return_pct = snapshot.return_pct;
    player.portfolio_history.push(snapshot);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::player::TradeRecord;
    use crate::store::testfix::Fixture;
    use crate::game::slice::SliceCache;
    use std::sync::Arc;

    /// Opens 100 / 110 / 121, final close 125, BUY recommendation on day 0.
    fn three_day_slice() -> Arc<GameSlice> {
        let fix = Fixture::new();
        fix.insert_price_run("AAPL", "2025-03-03", &[100.0, 110.0, 121.0], 125.0);
        fix.insert_recommendation("AAPL", "2025-03-03", "BUY", 0.7);
        let store = fix.historical();
        SliceCache::new()
            .get_or_build(&store, &["AAPL".into()], 3, Some("2025-03-03".parse().unwrap()), None)
            .unwrap()
    }

    fn pending(day: usize, ticker: &str, action: TradeAction, shares: u64) -> TradeRecord {
        TradeRecord {
            day_submitted: day,
            day_executed: None,
            ticker: ticker.into(),
            action,
            shares,
            price: None,
            total: None,
            status: TradeStatus::Pending,
            rejection_reason: None,
        }
    }

    #[test]
    fn solo_playthrough_math() {
        let slice = three_day_slice();
        let mut player = Player::new("ROOM01", "Alice", None, 10_000.0);
        player.trades.push(pending(0, "AAPL", TradeAction::Buy, 10));

        // Day 0 -> 1: buy fills at the day-1 open of 110.
        let report = advance_player(&mut player, &slice, 10_000.0);
        assert_eq!(report.executed, 1);
        assert_eq!(player.cash, 10_000.0 - 10.0 * 110.0);
        let h = player.holdings.get("AAPL").unwrap();
        assert_eq!(h.shares, 10);
        assert_eq!(h.avg_cost, 110.0);
        assert_eq!(player.portfolio_history.len(), 2);

        // Day 1 -> 2: value at the day-2 close of 125.
        advance_player(&mut player, &slice, 10_000.0);
        assert_eq!(player.portfolio_value, 8_900.0 + 10.0 * 125.0);
        assert!((player.total_return_pct - 1.5).abs() < 1e-9);
        assert_eq!(player.portfolio_history.len(), 3);
        assert_eq!(player.current_day, 2);
    }

    #[test]
    fn sells_execute_before_buys_and_free_cash() {
        let fix = Fixture::new();
        fix.insert_price_run("AAPL", "2025-03-03", &[100.0, 110.0, 121.0], 125.0);
        fix.insert_price_run("MSFT", "2025-03-03", &[200.0, 220.0, 242.0], 250.0);
        fix.insert_recommendation("AAPL", "2025-03-03", "BUY", 0.7);
        let store = fix.historical();
        let slice = SliceCache::new()
            .get_or_build(
                &store,
                &["AAPL".into(), "MSFT".into()],
                3,
                Some("2025-03-03".parse().unwrap()),
                None,
            )
            .unwrap();

        let mut player = Player::new("ROOM01", "Alice", None, 100.0);
        player.holdings.insert("MSFT".into(), Holding { shares: 10, avg_cost: 180.0 });
        // The AAPL buy (1 100 at the day-1 open) is only affordable once the
        // MSFT sell (2 200) lands first, despite M > A in ticker order.
        player.trades.push(pending(0, "AAPL", TradeAction::Buy, 10));
        player.trades.push(pending(0, "MSFT", TradeAction::Sell, 10));

        let report = advance_player(&mut player, &slice, 100.0);
        assert_eq!(report.executed, 2);
        assert_eq!(report.rejected, 0);
        assert_eq!(player.cash, 100.0 + 2_200.0 - 1_100.0);
        assert!(!player.holdings.contains_key("MSFT"));
        assert_eq!(player.holdings.get("AAPL").unwrap().shares, 10);
        assert_eq!(player.holdings.get("AAPL").unwrap().avg_cost, 110.0);
    }

    #[test]
    fn cash_race_rejects_with_insufficient_cash() {
        let fix = Fixture::new();
        fix.insert_price_run("AAPL", "2025-03-03", &[100.0, 110.0, 121.0], 125.0);
        fix.insert_price_run("MSFT", "2025-03-03", &[200.0, 220.0, 242.0], 250.0);
        fix.insert_recommendation("AAPL", "2025-03-03", "BUY", 0.7);
        fix.insert_recommendation("MSFT", "2025-03-03", "BUY", 0.7);
        let store = fix.historical();
        let slice = SliceCache::new()
            .get_or_build(
                &store,
                &["AAPL".into(), "MSFT".into()],
                3,
                Some("2025-03-03".parse().unwrap()),
                None,
            )
            .unwrap();

        let mut player = Player::new("ROOM01", "Alice", None, 1_200.0);
        player.trades.push(pending(0, "MSFT", TradeAction::Buy, 5)); // 1100 at day-1 open
        player.trades.push(pending(0, "AAPL", TradeAction::Buy, 10)); // 1100 at day-1 open

        let report = advance_player(&mut player, &slice, 1_200.0);
        // Ticker-ascending: AAPL fills first, MSFT loses the race.
        assert_eq!(report.executed, 1);
        assert_eq!(report.rejected, 1);
        assert!(player.holdings.contains_key("AAPL"));
        assert!(!player.holdings.contains_key("MSFT"));
        let msft = player.trades.iter().find(|t| t.ticker == "MSFT").unwrap();
        assert_eq!(msft.status, TradeStatus::Rejected);
        assert_eq!(msft.rejection_reason.as_deref(), Some("INSUFFICIENT_CASH"));
        assert!(player.cash >= 0.0);
    }

    #[test]
    fn buys_average_cost_and_sells_leave_it() {
        let slice = three_day_slice();
        let mut player = Player::new("ROOM01", "Alice", None, 100_000.0);
        player.trades.push(pending(0, "AAPL", TradeAction::Buy, 10));
        advance_player(&mut player, &slice, 100_000.0); // 10 @ 110

        player.trades.push(pending(1, "AAPL", TradeAction::Buy, 10));
        advance_player(&mut player, &slice, 100_000.0); // 10 @ 121

        let h = player.holdings.get("AAPL").unwrap();
        assert_eq!(h.shares, 20);
        assert!((h.avg_cost - 115.5).abs() < 1e-12);
    }

    #[test]
    fn holding_removed_at_zero_shares() {
        let slice = three_day_slice();
        let mut player = Player::new("ROOM01", "Alice", None, 10_000.0);
        player.holdings.insert("AAPL".into(), Holding { shares: 5, avg_cost: 100.0 });
        player.trades.push(pending(0, "AAPL", TradeAction::Sell, 5));
        advance_player(&mut player, &slice, 10_000.0);
        assert!(player.holdings.is_empty());
    }

    #[test]
    fn trades_wait_for_a_trading_day() {
        let fix = Fixture::new();
        // Day 1 (03-04) has no bar: trades submitted day 0 fill at day 2's open.
        fix.insert_price("AAPL", "2025-03-03", 100.0, 101.0, 99.0, 100.0, 1e6);
        fix.insert_price("AAPL", "2025-03-05", 120.0, 122.0, 119.0, 121.0, 1e6);
        fix.insert_recommendation("AAPL", "2025-03-03", "BUY", 0.7);
        let store = fix.historical();
        let slice = SliceCache::new()
            .get_or_build(&store, &["AAPL".into()], 3, Some("2025-03-03".parse().unwrap()), None)
            .unwrap();

        let mut player = Player::new("ROOM01", "Alice", None, 10_000.0);
        player.trades.push(pending(0, "AAPL", TradeAction::Buy, 10));

        advance_player(&mut player, &slice, 10_000.0);
        assert_eq!(player.trades[0].status, TradeStatus::Pending);
        // The non-trading day's snapshot carries the last close forward.
        assert_eq!(player.portfolio_history[1].portfolio_value, 10_000.0);

        advance_player(&mut player, &slice, 10_000.0);
        let t = &player.trades[0];
        assert_eq!(t.status, TradeStatus::Executed);
        assert_eq!(t.day_executed, Some(2));
        assert_eq!(t.price, Some(120.0));
        assert_eq!(player.cash, 10_000.0 - 1_200.0);
    }
}
