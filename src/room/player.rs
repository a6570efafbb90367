// =============================================================================
// Player Registry — per-room players with join/resume semantics
// =============================================================================
//
// A player is created on join and destroyed with its room. Names are unique
// per room case-insensitively; joining with an existing name is a resume and
// hands back the same player_id and state. Each player's record sits behind
// its own lock so students in an async room advance independently; room
// transitions sweep them one by one under the room serializer.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::game::scoring::ScoreBreakdown;
use crate::types::TradeAction;

// ---------------------------------------------------------------------------
// Player model
// ---------------------------------------------------------------------------

/// A position in one ticker. Absent from the holdings map iff shares == 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Holding {
    pub shares: u64,
    pub avg_cost: f64,
}

/// Lifecycle of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Pending,
    Executed,
    Rejected,
}

/// One entry in the append-only trade ledger. Entries are never removed;
/// execution fills in `day_executed`, `price`, and `total`, and a race loser
/// is resolved to `Rejected` with its reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub day_submitted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_executed: Option<usize>,
    pub ticker: String,
    pub action: TradeAction,
    pub shares: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    pub status: TradeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

/// End-of-day portfolio valuation, appended once per advanced day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub day: usize,
    pub portfolio_value: f64,
    pub cash: f64,
    pub holdings_value: f64,
    pub return_pct: f64,
    pub return_usd: f64,
}

/// A student in a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    pub player_id: String,
    pub room_code: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub current_day: usize,
    pub cash: f64,
    pub holdings: BTreeMap<String, Holding>,
    pub trades: Vec<TradeRecord>,
    pub portfolio_history: Vec<PortfolioSnapshot>,
    pub portfolio_value: f64,
    pub total_return_pct: f64,
    pub score: i64,
    pub grade: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score_breakdown: Option<ScoreBreakdown>,
    pub is_ready: bool,
    pub last_sync_day: usize,
    pub is_finished: bool,
    pub joined_at: DateTime<Utc>,
    pub last_action_at: DateTime<Utc>,
}

impl Player {
    /// Create a fresh player at day 0 with the day-0 snapshot already
    /// appended, so `portfolio_history.len() == current_day + 1` holds from
    /// the start.
    pub fn new(room_code: &str, name: &str, email: Option<String>, initial_cash: f64) -> Self {
        let now = Utc::now();
        Self {
            player_id: Uuid::new_v4().to_string(),
            room_code: room_code.to_string(),
            name: name.to_string(),
            email,
            current_day: 0,
            cash: initial_cash,
            holdings: BTreeMap::new(),
            trades: Vec::new(),
            portfolio_history: vec![PortfolioSnapshot {
                day: 0,
                portfolio_value: initial_cash,
                cash: initial_cash,
                holdings_value: 0.0,
                return_pct: 0.0,
                return_usd: 0.0,
            }],
            portfolio_value: initial_cash,
            total_return_pct: 0.0,
            score: 0,
            grade: "F".to_string(),
            score_breakdown: None,
            is_ready: false,
            last_sync_day: 0,
            is_finished: false,
            joined_at: now,
            last_action_at: now,
        }
    }

    /// Stamp `last_action_at`; every mutation path calls this.
    pub fn touch(&mut self) {
        self.last_action_at = Utc::now();
    }

    /// Whether the ledger already holds an entry for (day_submitted, ticker).
    pub fn has_trade_on(&self, day: usize, ticker: &str) -> bool {
        self.trades
            .iter()
            .any(|t| t.day_submitted == day && t.ticker == ticker)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The players of one room. Owned by the room; destroyed with it.
pub struct PlayerRegistry {
    by_id: RwLock<HashMap<String, Arc<RwLock<Player>>>>,
    /// lowercased name -> player_id
    by_name: RwLock<HashMap<String, String>>,
}

/// Outcome of a join call.
pub struct JoinOutcome {
    pub player: Arc<RwLock<Player>>,
    pub resumed: bool,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self {
            by_id: RwLock::new(HashMap::new()),
            by_name: RwLock::new(HashMap::new()),
        }
    }

    /// Join a room, or resume the existing record when the name (compared
    /// case-insensitively) is already taken.
    pub fn join(
        &self,
        room_code: &str,
        name: &str,
        email: Option<String>,
        initial_cash: f64,
    ) -> JoinOutcome {
        let key = name.trim().to_lowercase();

        // Fast path: resume.
        if let Some(existing) = self.lookup_by_name(&key) {
            existing.write().touch();
            return JoinOutcome {
                player: existing,
                resumed: true,
            };
        }

        let mut by_name = self.by_name.write();
        // Re-check under the write lock; a concurrent join may have won.
        if let Some(id) = by_name.get(&key) {
            let existing = self.by_id.read().get(id).cloned();
            if let Some(existing) = existing {
                existing.write().touch();
                return JoinOutcome {
                    player: existing,
                    resumed: true,
                };
            }
        }

        let player = Player::new(room_code, name.trim(), email, initial_cash);
        let id = player.player_id.clone();
        info!(room = %room_code, player = %id, name = %player.name, "player joined");

        let arc = Arc::new(RwLock::new(player));
        by_name.insert(key, id.clone());
        self.by_id.write().insert(id, arc.clone());
        JoinOutcome {
            player: arc,
            resumed: false,
        }
    }

    /// Re-insert a player loaded from the multiplayer store.
    pub fn restore(&self, player: Player) {
        let key = player.name.to_lowercase();
        let id = player.player_id.clone();
        self.by_name.write().insert(key, id.clone());
        self.by_id
            .write()
            .insert(id, Arc::new(RwLock::new(player)));
    }

    pub fn get(&self, player_id: &str) -> Option<Arc<RwLock<Player>>> {
        self.by_id.read().get(player_id).cloned()
    }

    fn lookup_by_name(&self, lowercased: &str) -> Option<Arc<RwLock<Player>>> {
        let id = self.by_name.read().get(lowercased).cloned()?;
        self.by_id.read().get(&id).cloned()
    }

    /// Snapshot of every player handle, in joined order is not guaranteed;
    /// callers sort as needed.
    pub fn all(&self) -> Vec<Arc<RwLock<Player>>> {
        self.by_id.read().values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.by_id.read().len()
    }

    pub fn ready_count(&self) -> usize {
        self.by_id
            .read()
            .values()
            .filter(|p| p.read().is_ready)
            .count()
    }
}

impl Default for PlayerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PlayerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerRegistry")
            .field("players", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_player_starts_with_day_zero_snapshot() {
        let p = Player::new("ABC123", "Alice", None, 10_000.0);
        assert_eq!(p.current_day, 0);
        assert_eq!(p.portfolio_history.len(), 1);
        assert_eq!(p.portfolio_history[0].portfolio_value, 10_000.0);
        assert_eq!(p.portfolio_value, 10_000.0);
        assert!(p.holdings.is_empty());
        assert!(!p.is_finished);
    }

    #[test]
    fn join_then_rejoin_resumes_case_insensitively() {
        let reg = PlayerRegistry::new();
        let first = reg.join("ABC123", "Alice", None, 10_000.0);
        assert!(!first.resumed);
        let id = first.player.read().player_id.clone();

        let second = reg.join("ABC123", "alice", None, 10_000.0);
        assert!(second.resumed);
        assert_eq!(second.player.read().player_id, id);
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn distinct_names_get_distinct_players() {
        let reg = PlayerRegistry::new();
        let a = reg.join("ABC123", "Alice", None, 10_000.0);
        let b = reg.join("ABC123", "Bob", None, 10_000.0);
        assert_ne!(
            a.player.read().player_id,
            b.player.read().player_id
        );
        assert_eq!(reg.count(), 2);
    }
}
