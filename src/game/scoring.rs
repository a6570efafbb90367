// =============================================================================
// Scoring Engine — points and letter grade from a finished (or running) game
// =============================================================================
//
//   score = clamp(return_component, 0, 500)
//         + discipline_component            (50 per disciplined trade, cap 10)
//         + beat_ai_bonus                   (0..200)
//         + drawdown_penalty                (-200..0)
//
// Grades are point-based; difficulty shifts every threshold by -100 (easy)
// or +100 (hard) around the medium ladder A>=700 B>=550 C>=400 D>=250.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::game::slice::GameSlice;
use crate::room::player::{PortfolioSnapshot, TradeRecord, TradeStatus};
use crate::types::{Difficulty, TradeAction};

/// Trading days after execution over which a buy must be profitable to count
/// as disciplined.
const DISCIPLINE_WINDOW_DAYS: usize = 5;
/// Cap on disciplined trades counted.
const DISCIPLINE_CAP: usize = 10;

/// The components behind a player's score, reported alongside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub return_component: f64,
    pub discipline_component: f64,
    pub beat_ai_bonus: f64,
    pub drawdown_penalty: f64,
    pub max_drawdown_pct: f64,
    pub total: i64,
}

/// Compute score, grade, and breakdown for one player.
pub fn score_player(
    history: &[PortfolioSnapshot],
    trades: &[TradeRecord],
    slice: &GameSlice,
    ai_return_pct: f64,
    difficulty: Difficulty,
) -> (i64, String, ScoreBreakdown) {
    let total_return_pct = history.last().map(|s| s.return_pct).unwrap_or(0.0);

    let return_component =
        (500.0 * (total_return_pct / 50.0).max(0.0)).round().min(500.0);

    let disciplined = trades
        .iter()
        .filter(|t| is_disciplined(t, slice))
        .count()
        .min(DISCIPLINE_CAP);
    let discipline_component = 50.0 * disciplined as f64;

    let beat_ai_bonus = 200.0 * ((total_return_pct - ai_return_pct) / 20.0).clamp(0.0, 1.0);

    let max_drawdown_pct = max_drawdown(history);
    let drawdown_penalty = -200.0 * (max_drawdown_pct / 40.0).clamp(0.0, 1.0);

    let total =
        (return_component + discipline_component + beat_ai_bonus + drawdown_penalty).round()
            as i64;

    let breakdown = ScoreBreakdown {
        return_component,
        discipline_component,
        beat_ai_bonus,
        drawdown_penalty,
        max_drawdown_pct,
        total,
    };
    (total, grade_for(total, difficulty).to_string(), breakdown)
}

/// An executed BUY whose post-execution 5-day return is positive. The window
/// is clipped at the end of the slice.
fn is_disciplined(trade: &TradeRecord, slice: &GameSlice) -> bool {
    if trade.action != TradeAction::Buy || trade.status != TradeStatus::Executed {
        return false;
    }
    let (Some(day_executed), Some(price)) = (trade.day_executed, trade.price) else {
        return false;
    };
    // Submission-time validation already requires a BUY/STRONG_BUY day; keep
    // the check so restored ledgers are judged by the same rule.
    let permitted = slice
        .recommendation(&trade.ticker, trade.day_submitted)
        .map(|r| r.action.permits_buy())
        .unwrap_or(false);
    if !permitted {
        return false;
    }

    let horizon = (day_executed + DISCIPLINE_WINDOW_DAYS).min(slice.num_days() - 1);
    match slice.close_on_or_before(&trade.ticker, horizon) {
        Some(later) => later > price,
        None => false,
    }
}

/// Largest peak-to-trough loss across the portfolio history, in percent.
fn max_drawdown(history: &[PortfolioSnapshot]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst = 0.0f64;
    for snap in history {
        peak = peak.max(snap.portfolio_value);
        if peak > 0.0 {
            worst = worst.max((peak - snap.portfolio_value) / peak * 100.0);
        }
    }
    worst
}

fn grade_for(score: i64, difficulty: Difficulty) -> &'static str {
    let shift: i64 = match difficulty {
        Difficulty::Easy => -100,
        Difficulty::Medium => 0,
        Difficulty::Hard => 100,
    };
    if score >= 700 + shift {
        "A"
    } else if score >= 550 + shift {
        "B"
    } else if score >= 400 + shift {
        "C"
    } else if score >= 250 + shift {
        "D"
    } else {
        "F"
    }
}
