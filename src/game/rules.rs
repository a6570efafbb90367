// =============================================================================
// Trade Rule Engine — pure validation of a pending trade
// =============================================================================
//
// `validate` is side-effect free: callers queue accepted trades for execution
// at the next trading day's open, and the portfolio engine re-runs the same
// checks at execution time so concurrent submissions cannot overdraw cash or
// holdings.
// =============================================================================

use serde::Serialize;
use thiserror::Error;

use crate::game::slice::GameSlice;
use crate::room::player::Player;
use crate::types::{RoomStatus, TradeAction};

/// The closed set of reasons a trade can be refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
pub enum TradeRejection {
    #[error("today's recommendation does not permit buying this ticker")]
    NotABuyDay,
    #[error("not enough shares held to sell")]
    InsufficientHoldings,
    #[error("not enough cash to cover the buy at the next open")]
    InsufficientCash,
    #[error("shares must be a positive number")]
    NonPositiveShares,
    #[error("shares must be a whole number")]
    NonIntegerShares,
    #[error("a trade for this ticker was already submitted today")]
    DuplicateSameDay,
    #[error("the game is not in progress")]
    GameNotActive,
}

impl TradeRejection {
    /// Stable machine code for the client.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotABuyDay => "NOT_A_BUY_DAY",
            Self::InsufficientHoldings => "INSUFFICIENT_HOLDINGS",
            Self::InsufficientCash => "INSUFFICIENT_CASH",
            Self::NonPositiveShares => "NON_POSITIVE_SHARES",
            Self::NonIntegerShares => "NON_INTEGER_SHARES",
            Self::DuplicateSameDay => "DUPLICATE_SAME_DAY",
            Self::GameNotActive => "GAME_NOT_ACTIVE",
        }
    }
}

/// A trade as submitted by the client. `shares` arrives as a JSON number so
/// that fractional requests can be rejected with the right reason instead of
/// failing deserialization.
#[derive(Debug, Clone)]
pub struct PendingTrade {
    pub ticker: String,
    pub action: TradeAction,
    pub shares: f64,
}

/// The price a buy will execute at, as far as it is knowable at submission:
/// the next trading day's open, falling back to the most recent close when
/// the slice has no further trading day (such a trade never executes).
pub fn estimated_execution_price(slice: &GameSlice, ticker: &str, day: usize) -> Option<f64> {
    match slice.next_trading_day_after(day) {
        Some(next) => slice.open_on(ticker, next),
        None => slice.close_on_or_before(ticker, day),
    }
}

/// Validate `trade` for `player` on day `day`. Returns the whole-share count
/// on success. Pure.
pub fn validate(
    player: &Player,
    day: usize,
    trade: &PendingTrade,
    slice: &GameSlice,
    room_status: RoomStatus,
) -> Result<u64, TradeRejection> {
    if room_status != RoomStatus::InProgress || player.is_finished {
        return Err(TradeRejection::GameNotActive);
    }

    if !(trade.shares > 0.0) {
        return Err(TradeRejection::NonPositiveShares);
    }
    if trade.shares.fract() != 0.0 {
        return Err(TradeRejection::NonIntegerShares);
    }
    let shares = trade.shares as u64;

    if player.has_trade_on(day, &trade.ticker) {
        return Err(TradeRejection::DuplicateSameDay);
    }

    match trade.action {
        TradeAction::Buy => {
            let permits = slice
                .recommendation(&trade.ticker, day)
                .map(|r| r.action.permits_buy())
                .unwrap_or(false);
            if !permits {
                return Err(TradeRejection::NotABuyDay);
            }
            // A buy with no price on any reachable day can never clear the
            // execution-time cash re-check; it must not enter the queue.
            let price = estimated_execution_price(slice, &trade.ticker, day)
                .ok_or(TradeRejection::InsufficientCash)?;
            if shares as f64 * price > player.cash {
                return Err(TradeRejection::InsufficientCash);
            }
        }
        TradeAction::Sell => {
            let held = player
                .holdings
                .get(&trade.ticker)
                .map(|h| h.shares)
                .unwrap_or(0);
            if held < shares {
                return Err(TradeRejection::InsufficientHoldings);
            }
        }
    }

    Ok(shares)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::player::Holding;
    use crate::store::testfix::Fixture;
    use crate::game::slice::SliceCache;
    use std::sync::Arc;

    fn slice_with_rec(action: &str) -> Arc<GameSlice> {
        let fix = Fixture::new();
        fix.insert_price_run("AAPL", "2025-03-03", &[100.0, 110.0, 121.0], 125.0);
        fix.insert_recommendation("AAPL", "2025-03-03", action, 0.7);
        let store = fix.historical();
        SliceCache::new()
            .get_or_build(&store, &["AAPL".into()], 3, Some("2025-03-03".parse().unwrap()), None)
            .unwrap()
    }

    fn buy(shares: f64) -> PendingTrade {
        PendingTrade {
            ticker: "AAPL".into(),
            action: TradeAction::Buy,
            shares,
        }
    }

    fn sell(shares: f64) -> PendingTrade {
        PendingTrade {
            ticker: "AAPL".into(),
            action: TradeAction::Sell,
            shares,
        }
    }

    #[test]
    fn buy_allowed_on_buy_day() {
        let slice = slice_with_rec("BUY");
        let player = Player::new("ROOM01", "Alice", None, 10_000.0);
        assert_eq!(validate(&player, 0, &buy(10.0), &slice, RoomStatus::InProgress), Ok(10));
    }

    #[test]
    fn buy_blocked_on_hold_day() {
        let slice = slice_with_rec("HOLD");
        let player = Player::new("ROOM01", "Alice", None, 10_000.0);
        assert_eq!(
            validate(&player, 0, &buy(1.0), &slice, RoomStatus::InProgress),
            Err(TradeRejection::NotABuyDay)
        );
    }

    #[test]
    fn zero_negative_and_fractional_shares() {
        let slice = slice_with_rec("BUY");
        let player = Player::new("ROOM01", "Alice", None, 10_000.0);
        assert_eq!(
            validate(&player, 0, &buy(0.0), &slice, RoomStatus::InProgress),
            Err(TradeRejection::NonPositiveShares)
        );
        assert_eq!(
            validate(&player, 0, &buy(-3.0), &slice, RoomStatus::InProgress),
            Err(TradeRejection::NonPositiveShares)
        );
        assert_eq!(
            validate(&player, 0, &sell(1.5), &slice, RoomStatus::InProgress),
            Err(TradeRejection::NonIntegerShares)
        );
    }

    #[test]
    fn sell_requires_holdings() {
        let slice = slice_with_rec("BUY");
        let mut player = Player::new("ROOM01", "Alice", None, 10_000.0);
        assert_eq!(
            validate(&player, 0, &sell(5.0), &slice, RoomStatus::InProgress),
            Err(TradeRejection::InsufficientHoldings)
        );
        player.holdings.insert("AAPL".into(), Holding { shares: 5, avg_cost: 100.0 });
        assert_eq!(validate(&player, 0, &sell(5.0), &slice, RoomStatus::InProgress), Ok(5));
        assert_eq!(
            validate(&player, 0, &sell(6.0), &slice, RoomStatus::InProgress),
            Err(TradeRejection::InsufficientHoldings)
        );
    }

    #[test]
    fn buy_cost_checked_against_next_open() {
        let slice = slice_with_rec("BUY");
        // Next open after day 0 is 110; 91 shares would cost 10 010.
        let player = Player::new("ROOM01", "Alice", None, 10_000.0);
        assert_eq!(validate(&player, 0, &buy(90.0), &slice, RoomStatus::InProgress), Ok(90));
        assert_eq!(
            validate(&player, 0, &buy(91.0), &slice, RoomStatus::InProgress),
            Err(TradeRejection::InsufficientCash)
        );
    }

    #[test]
    fn unpriceable_buy_is_rejected() {
        use std::collections::BTreeMap;
        use crate::game::slice::GameDay;
        use crate::types::{RecAction, Recommendation, RiskLevel, SignalLabel};

        // A day that recommends buying a ticker the window has no bars for:
        // there is no open to price the fill and no close to fall back on.
        let mut recommendations = BTreeMap::new();
        recommendations.insert(
            "GHOST".to_string(),
            Recommendation {
                action: RecAction::Buy,
                confidence: 0.6,
                technical_signal: SignalLabel::Bullish,
                sentiment_signal: SignalLabel::Neutral,
                risk_level: RiskLevel::Medium,
                rationale_summary: "fixture".into(),
                synthetic: false,
            },
        );
        let slice = GameSlice {
            tickers: vec!["GHOST".into()],
            start_date: "2025-03-03".parse().unwrap(),
            end_date: "2025-03-03".parse().unwrap(),
            days: vec![GameDay {
                day: 0,
                date: "2025-03-03".parse().unwrap(),
                is_trading_day: false,
                prices: BTreeMap::new(),
                recommendations,
                technicals: BTreeMap::new(),
                news: BTreeMap::new(),
            }],
        };

        let player = Player::new("ROOM01", "Alice", None, 10_000.0);
        let trade = PendingTrade {
            ticker: "GHOST".into(),
            action: TradeAction::Buy,
            shares: 1.0,
        };
        assert_eq!(
            validate(&player, 0, &trade, &slice, RoomStatus::InProgress),
            Err(TradeRejection::InsufficientCash)
        );
    }

    #[test]
    fn duplicate_same_day_per_ticker() {
        let slice = slice_with_rec("BUY");
        let mut player = Player::new("ROOM01", "Alice", None, 10_000.0);
        player.trades.push(crate::room::player::TradeRecord {
            day_submitted: 0,
            day_executed: None,
            ticker: "AAPL".into(),
            action: TradeAction::Buy,
            shares: 1,
            price: None,
            total: None,
            status: crate::room::player::TradeStatus::Pending,
            rejection_reason: None,
        });
        assert_eq!(
            validate(&player, 0, &buy(1.0), &slice, RoomStatus::InProgress),
            Err(TradeRejection::DuplicateSameDay)
        );
        // A different day for the same ticker is fine.
        assert_eq!(validate(&player, 1, &buy(1.0), &slice, RoomStatus::InProgress), Ok(1));
    }

    #[test]
    fn game_must_be_active() {
        let slice = slice_with_rec("BUY");
        let player = Player::new("ROOM01", "Alice", None, 10_000.0);
        assert_eq!(
            validate(&player, 0, &buy(1.0), &slice, RoomStatus::Waiting),
            Err(TradeRejection::GameNotActive)
        );
        assert_eq!(
            validate(&player, 0, &buy(1.0), &slice, RoomStatus::Finished),
            Err(TradeRejection::GameNotActive)
        );
    }
}
