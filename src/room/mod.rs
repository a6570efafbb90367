// =============================================================================
// Room — per-game state machine: waiting -> in_progress -> finished
// =============================================================================
//
// A room owns its players, its immutable game slice, and the AI benchmark
// curve. Lifecycle transitions (start, advance-day, end-game, set-timer,
// auto-tick) are serialized by the room's state lock; repeating a transition
// that has already taken effect is a no-op that returns the current record.
// Every transition resets player readiness, stamps day_started_at, and on
// finish freezes every player's score.
//
// In async mode the room-level current_day is advisory (the max across
// players); each player advances their own clock.
// =============================================================================

pub mod player;
pub mod scheduler;

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::info;

use crate::error::GameError;
use crate::game::benchmark;
use crate::game::portfolio;
use crate::game::rules::{self, PendingTrade};
use crate::game::scoring;
use crate::game::slice::GameSlice;
use crate::types::{GameConfig, GameMode, RoomStatus};

use player::{Player, PlayerRegistry, TradeRecord, TradeStatus};

// =============================================================================
// Room record
// =============================================================================

/// The mutable room record, guarded by the room's serializer lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomState {
    pub room_code: String,
    pub created_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_name: Option<String>,
    pub mode: GameMode,
    pub status: RoomStatus,
    pub config: GameConfig,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Authoritative in sync modes; advisory (max player day) in async.
    pub current_day: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_started_at: Option<DateTime<Utc>>,
    /// Seconds per day in sync_auto; None = untimed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_time_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_ended_at: Option<DateTime<Utc>>,
    pub ai_current_day: usize,
    pub ai_portfolio_value: f64,
    pub ai_total_return_pct: f64,
    pub created_at: DateTime<Utc>,
}

/// Polling record for clients; `time_remaining` is always computed
/// server-side from `day_started_at` and never trusted from the client.
#[derive(Debug, Clone, Serialize)]
pub struct RoomPoll {
    pub status: RoomStatus,
    pub mode: GameMode,
    pub current_day: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_time_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_remaining: Option<u64>,
    pub waiting_for_teacher: bool,
    pub ready_count: usize,
    pub total_players: usize,
}

/// One leaderboard row. Ordering: score desc, portfolio value desc,
/// joined_at asc.
#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub player_id: String,
    pub player_name: String,
    pub score: i64,
    pub grade: String,
    pub portfolio_value: f64,
    pub total_return_pct: f64,
    pub current_day: usize,
    pub is_finished: bool,
}

/// Generate a 6-character room code (uppercase alphanumerics).
pub fn generate_room_code() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

// =============================================================================
// Room
// =============================================================================

pub struct Room {
    pub code: String,
    /// Immutable once built; shared with every reader.
    pub slice: Arc<GameSlice>,
    /// AI benchmark value per day, derived from the slice at creation.
    pub ai_values: Vec<f64>,
    state: RwLock<RoomState>,
    pub players: PlayerRegistry,
    /// Wakes the sync_auto scheduler task on set-timer, manual advance,
    /// end-game, and finish.
    pub timer: Notify,
}

impl Room {
    pub fn new(
        code: String,
        created_by: String,
        room_name: Option<String>,
        mode: GameMode,
        config: GameConfig,
        slice: Arc<GameSlice>,
        day_time_limit: Option<u64>,
    ) -> Self {
        let ai_values = benchmark::run_benchmark(&slice, config.initial_cash);
        let state = RoomState {
            room_code: code.clone(),
            created_by,
            room_name,
            mode,
            status: RoomStatus::Waiting,
            config,
            start_date: slice.start_date,
            end_date: slice.end_date,
            current_day: 0,
            day_started_at: None,
            day_time_limit,
            game_started_at: None,
            game_ended_at: None,
            ai_current_day: 0,
            ai_portfolio_value: ai_values[0],
            ai_total_return_pct: 0.0,
            created_at: Utc::now(),
        };
        Self {
            code,
            slice,
            ai_values,
            state: RwLock::new(state),
            players: PlayerRegistry::new(),
            timer: Notify::new(),
        }
    }

    /// Rebuild a room from its persisted record; the slice is rebuilt from
    /// the same resolved key, so the AI curve comes out identical.
    pub fn restore(state: RoomState, slice: Arc<GameSlice>) -> Self {
        let ai_values = benchmark::run_benchmark(&slice, state.config.initial_cash);
        Self {
            code: state.room_code.clone(),
            slice,
            ai_values,
            state: RwLock::new(state),
            players: PlayerRegistry::new(),
            timer: Notify::new(),
        }
    }

    /// Snapshot of the room record.
    pub fn snapshot(&self) -> RoomState {
        self.state.read().clone()
    }

    fn num_days(&self) -> usize {
        self.slice.num_days()
    }

    // ── Join ────────────────────────────────────────────────────────────

    /// Join (or resume) a player. Joining a finished room is refused; a
    /// resume of an existing name succeeds at any stage.
    pub fn join(
        &self,
        name: &str,
        email: Option<String>,
    ) -> Result<(Arc<RwLock<Player>>, bool), GameError> {
        if name.trim().is_empty() {
            return Err(GameError::Validation("player_name must be non-empty".into()));
        }
        let (status, initial_cash) = {
            let state = self.state.read();
            (state.status, state.config.initial_cash)
        };

        let outcome = {
            // A fresh join of a finished room is a conflict, but a resume of
            // an existing name is still served.
            if status == RoomStatus::Finished {
                let key = name.trim().to_lowercase();
                match self.players.all().into_iter().find(|p| {
                    p.read().name.to_lowercase() == key
                }) {
                    Some(existing) => {
                        return Ok((existing, true));
                    }
                    None => {
                        return Err(GameError::Conflict(format!(
                            "room {} is finished",
                            self.code
                        )));
                    }
                }
            }
            self.players.join(&self.code, name, email, initial_cash)
        };
        Ok((outcome.player, outcome.resumed))
    }

    // ── Transitions ─────────────────────────────────────────────────────

    /// `start`: waiting -> in_progress. Teacher only. Idempotent once taken.
    pub fn start(&self, started_by: &str) -> Result<RoomState, GameError> {
        let mut state = self.state.write();
        if started_by != state.created_by {
            return Err(GameError::Forbidden(format!(
                "only {} may start this room",
                state.created_by
            )));
        }
        if state.status != RoomStatus::Waiting {
            return Ok(state.clone());
        }

        let now = Utc::now();
        state.status = RoomStatus::InProgress;
        state.current_day = 0;
        state.game_started_at = Some(now);
        state.day_started_at = Some(now);
        state.ai_current_day = 0;
        state.ai_portfolio_value = self.ai_values[0];
        state.ai_total_return_pct = 0.0;
        self.reset_ready();
        info!(room = %self.code, mode = %state.mode, "game started");

        self.timer.notify_one();
        Ok(state.clone())
    }

    /// `advance-day` (sync / sync_auto): move every player to the next day,
    /// or finish the room when the last day is done. `initiated_by` is None
    /// for the scheduler's auto-tick, which additionally re-checks the
    /// deadline under the lock so a concurrent manual advance makes it a
    /// no-op (exactly-once).
    pub fn advance_day(
        &self,
        initiated_by: Option<&str>,
        new_limit: Option<u64>,
    ) -> Result<RoomState, GameError> {
        let mut state = self.state.write();
        match state.status {
            RoomStatus::Finished => return Ok(state.clone()),
            RoomStatus::Waiting => {
                return Err(GameError::Conflict(format!(
                    "room {} has not started",
                    self.code
                )))
            }
            RoomStatus::InProgress => {}
        }
        if state.mode == GameMode::Async {
            return Err(GameError::Validation(
                "async rooms advance per player, not per room".into(),
            ));
        }
        match initiated_by {
            Some(who) if who != state.created_by => {
                return Err(GameError::Forbidden(format!(
                    "only {} may advance this room",
                    state.created_by
                )));
            }
            Some(_) => {}
            None => {
                // Auto-tick: only fire if the recorded deadline has truly
                // passed; a manual advance that won the race reset it.
                let due = match (state.day_started_at, state.day_time_limit) {
                    (Some(started), Some(limit)) => {
                        started + chrono::Duration::seconds(limit as i64) <= Utc::now()
                    }
                    _ => false,
                };
                if !due {
                    return Ok(state.clone());
                }
            }
        }

        if let Some(limit) = new_limit {
            state.day_time_limit = Some(limit);
        }

        let next = state.current_day + 1;
        if next >= self.num_days() {
            self.finish_locked(&mut state);
            self.timer.notify_one();
            return Ok(state.clone());
        }

        state.current_day = next;
        state.day_started_at = Some(Utc::now());
        state.ai_current_day = next;
        state.ai_portfolio_value = self.ai_values[next];
        state.ai_total_return_pct =
            benchmark::return_pct_at(&self.ai_values, next, state.config.initial_cash);

        self.sweep_players_to(next, &state);
        info!(room = %self.code, day = next, "day advanced");

        self.timer.notify_one();
        Ok(state.clone())
    }

    /// `end-game`: in_progress -> finished. Teacher only. Idempotent once
    /// finished.
    pub fn end_game(&self, ended_by: &str) -> Result<RoomState, GameError> {
        let mut state = self.state.write();
        if ended_by != state.created_by {
            return Err(GameError::Forbidden(format!(
                "only {} may end this room",
                state.created_by
            )));
        }
        match state.status {
            RoomStatus::Finished => Ok(state.clone()),
            RoomStatus::Waiting => Err(GameError::Conflict(format!(
                "room {} has not started",
                self.code
            ))),
            RoomStatus::InProgress => {
                self.finish_locked(&mut state);
                self.timer.notify_one();
                Ok(state.clone())
            }
        }
    }

    /// `set-timer` (sync_auto only): change the per-day limit and restart the
    /// current day's clock.
    pub fn set_timer(&self, duration_seconds: u64) -> Result<RoomState, GameError> {
        let mut state = self.state.write();
        if state.mode != GameMode::SyncAuto {
            return Err(GameError::Validation(
                "timers only apply to sync_auto rooms".into(),
            ));
        }
        if state.status != RoomStatus::InProgress {
            return Err(GameError::Conflict(format!(
                "room {} is not in progress",
                self.code
            )));
        }
        state.day_time_limit = Some(duration_seconds);
        state.day_started_at = Some(Utc::now());
        self.reset_ready();
        info!(room = %self.code, seconds = duration_seconds, "day timer set");

        self.timer.notify_one();
        Ok(state.clone())
    }

    /// Finish the room: freeze status, stamp the end, finish and rescore
    /// every player where they stand. Caller holds the state write lock.
    fn finish_locked(&self, state: &mut RoomState) {
        state.status = RoomStatus::Finished;
        state.game_ended_at = Some(Utc::now());
        state.ai_current_day = self.num_days() - 1;
        state.ai_portfolio_value = *self.ai_values.last().expect("non-empty curve");
        state.ai_total_return_pct = benchmark::return_pct_at(
            &self.ai_values,
            self.num_days() - 1,
            state.config.initial_cash,
        );

        for handle in self.players.all() {
            let mut p = handle.write();
            p.is_ready = false;
            p.is_finished = true;
            self.rescore_locked(&mut p, state.config.initial_cash, state.config.difficulty);
        }
        info!(room = %self.code, "game finished");
    }

    /// Advance every unfinished player to `day`. Caller holds the state
    /// write lock (the room serializer), so the sweep is atomic with the
    /// transition.
    fn sweep_players_to(&self, day: usize, state: &RoomState) {
        for handle in self.players.all() {
            let mut p = handle.write();
            if p.is_finished {
                continue;
            }
            while p.current_day < day {
                portfolio::advance_player(&mut p, &self.slice, state.config.initial_cash);
            }
            p.last_sync_day = day;
            p.is_ready = false;
            self.rescore_locked(&mut p, state.config.initial_cash, state.config.difficulty);
        }
    }

    fn reset_ready(&self) {
        for handle in self.players.all() {
            handle.write().is_ready = false;
        }
    }

    /// Recompute score/grade/breakdown against the AI's return at the
    /// player's own day. Caller holds the player's write lock.
    fn rescore_locked(
        &self,
        p: &mut Player,
        initial_cash: f64,
        difficulty: crate::types::Difficulty,
    ) {
        let ai_return = benchmark::return_pct_at(&self.ai_values, p.current_day, initial_cash);
        let (score, grade, breakdown) =
            scoring::score_player(&p.portfolio_history, &p.trades, &self.slice, ai_return, difficulty);
        p.score = score;
        p.grade = grade;
        p.score_breakdown = Some(breakdown);
    }

    // ── Player commands ─────────────────────────────────────────────────

    /// Validate and queue a trade for the player's current day. The trade
    /// executes at the next trading day's open.
    pub fn submit_trade(
        &self,
        player_id: &str,
        trade: PendingTrade,
    ) -> Result<TradeRecord, GameError> {
        let status = self.state.read().status;
        let handle = self
            .players
            .get(player_id)
            .ok_or_else(|| GameError::NotFound(format!("unknown player: {player_id}")))?;

        let mut p = handle.write();
        let day = p.current_day;
        let shares = rules::validate(&p, day, &trade, &self.slice, status)?;

        let record = TradeRecord {
            day_submitted: day,
            day_executed: None,
            ticker: trade.ticker,
            action: trade.action,
            shares,
            price: None,
            total: None,
            status: TradeStatus::Pending,
            rejection_reason: None,
        };
        p.trades.push(record.clone());
        p.touch();
        info!(
            room = %self.code,
            player = %player_id,
            ticker = %record.ticker,
            action = %record.action,
            shares,
            day,
            "trade queued"
        );
        Ok(record)
    }

    /// Advance one player's own clock (async rooms only).
    pub fn advance_player(&self, player_id: &str) -> Result<Player, GameError> {
        let (status, mode, initial_cash) = {
            let state = self.state.read();
            (state.status, state.mode, state.config.initial_cash)
        };
        if status != RoomStatus::InProgress {
            return Err(GameError::Conflict(format!(
                "room {} is not in progress",
                self.code
            )));
        }
        if mode != GameMode::Async {
            return Err(GameError::Validation(
                "players advance with the room in sync modes".into(),
            ));
        }

        let handle = self
            .players
            .get(player_id)
            .ok_or_else(|| GameError::NotFound(format!("unknown player: {player_id}")))?;

        let difficulty = self.snapshot().config.difficulty;
        let snapshot = {
            let mut p = handle.write();
            if p.is_finished {
                return Err(GameError::Conflict("player has finished the game".into()));
            }
            if p.current_day + 1 < self.num_days() {
                portfolio::advance_player(&mut p, &self.slice, initial_cash);
            } else {
                p.is_finished = true;
                p.touch();
            }
            self.rescore_locked(&mut p, initial_cash, difficulty);
            p.clone()
        };

        // Advisory room bookkeeping; finishes the room once everyone is done.
        self.refresh_async_progress();
        Ok(snapshot)
    }

    /// Mark a player ready for the current day (sync modes).
    pub fn mark_ready(&self, player_id: &str) -> Result<usize, GameError> {
        let state = self.state.read();
        if state.status != RoomStatus::InProgress {
            return Err(GameError::Conflict(format!(
                "room {} is not in progress",
                self.code
            )));
        }
        if state.mode == GameMode::Async {
            return Err(GameError::Validation(
                "readiness only applies to sync rooms".into(),
            ));
        }
        drop(state);

        let handle = self
            .players
            .get(player_id)
            .ok_or_else(|| GameError::NotFound(format!("unknown player: {player_id}")))?;
        {
            let mut p = handle.write();
            p.is_ready = true;
            p.touch();
        }
        Ok(self.players.ready_count())
    }

    /// Update the advisory day for an async room and finish it when every
    /// player is done.
    fn refresh_async_progress(&self) {
        let players = self.players.all();
        let max_day = players
            .iter()
            .map(|h| h.read().current_day)
            .max()
            .unwrap_or(0);
        let all_finished =
            !players.is_empty() && players.iter().all(|h| h.read().is_finished);

        let mut state = self.state.write();
        if state.status != RoomStatus::InProgress {
            return;
        }
        state.current_day = max_day;
        state.ai_current_day = max_day;
        state.ai_portfolio_value = self.ai_values[max_day.min(self.ai_values.len() - 1)];
        state.ai_total_return_pct =
            benchmark::return_pct_at(&self.ai_values, max_day, state.config.initial_cash);
        if all_finished {
            self.finish_locked(&mut state);
            self.timer.notify_one();
        }
    }

    // ── Reads ───────────────────────────────────────────────────────────

    /// The polling record. Pure read; computes `time_remaining` from the
    /// recorded `day_started_at`.
    pub fn poll(&self) -> RoomPoll {
        let state = self.state.read();
        let total_players = self.players.count();
        let ready_count = self.players.ready_count();

        let time_remaining = match (state.status, state.day_started_at, state.day_time_limit) {
            (RoomStatus::InProgress, Some(started), Some(limit)) => {
                let elapsed = (Utc::now() - started).num_seconds().max(0) as u64;
                Some(limit.saturating_sub(elapsed))
            }
            _ => None,
        };

        let waiting_for_teacher = state.mode == GameMode::Sync
            && state.status == RoomStatus::InProgress
            && total_players > 0
            && ready_count == total_players;

        RoomPoll {
            status: state.status,
            mode: state.mode,
            current_day: state.current_day,
            day_started_at: state.day_started_at,
            day_time_limit: state.day_time_limit,
            time_remaining,
            waiting_for_teacher,
            ready_count,
            total_players,
        }
    }

    /// Sorted leaderboard snapshot: score desc, portfolio value desc,
    /// joined_at asc.
    pub fn leaderboard(&self) -> Vec<LeaderboardEntry> {
        let mut rows: Vec<(i64, f64, DateTime<Utc>, LeaderboardEntry)> = self
            .players
            .all()
            .into_iter()
            .map(|handle| {
                let p = handle.read();
                (
                    p.score,
                    p.portfolio_value,
                    p.joined_at,
                    LeaderboardEntry {
                        rank: 0,
                        player_id: p.player_id.clone(),
                        player_name: p.name.clone(),
                        score: p.score,
                        grade: p.grade.clone(),
                        portfolio_value: p.portfolio_value,
                        total_return_pct: round2(p.total_return_pct),
                        current_day: p.current_day,
                        is_finished: p.is_finished,
                    },
                )
            })
            .collect();

        rows.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| a.2.cmp(&b.2))
        });

        rows.into_iter()
            .enumerate()
            .map(|(i, (_, _, _, mut entry))| {
                entry.rank = i + 1;
                entry
            })
            .collect()
    }

    /// Snapshot of every player record, joined order first.
    pub fn player_snapshots(&self) -> Vec<Player> {
        let mut players: Vec<Player> = self
            .players
            .all()
            .into_iter()
            .map(|h| h.read().clone())
            .collect();
        players.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
        players
    }

    /// Check the recorded deadline; used by the scheduler to decide when to
    /// wake next. Returns None when no auto-tick is pending.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        let state = self.state.read();
        if state.status != RoomStatus::InProgress || state.mode != GameMode::SyncAuto {
            return None;
        }
        match (state.day_started_at, state.day_time_limit) {
            (Some(started), Some(limit)) => {
                Some(started + chrono::Duration::seconds(limit as i64))
            }
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.read().status == RoomStatus::Finished
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Room")
            .field("code", &self.code)
            .field("status", &state.status)
            .field("mode", &state.mode)
            .field("current_day", &state.current_day)
            .field("players", &self.players.count())
            .finish()
    }
}

/// Two-decimal rounding applied to externally reported percentages.
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
