// =============================================================================
// Multiplayer store — the core's own read/write state
// =============================================================================
//
// Rooms and players are upserted after each committed mutation (the in-memory
// record stays authoritative for the process lifetime; writes are
// write-behind and never hold a lock across I/O). Trade and snapshot ledgers
// are append-only: rows are never deleted, execution merely fills in the
// terminal fields of an existing entry.
//
// Restart path: unfinished rooms are reloaded, their slices rebuilt from the
// same resolved key, and sync_auto schedulers re-armed from the persisted
// day_started_at.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection};

use crate::room::player::{Player, PortfolioSnapshot, TradeRecord, TradeStatus};
use crate::room::RoomState;

pub struct MultiplayerStore {
    db_path: String,
}

impl MultiplayerStore {
    /// Open the store and create the multiplayer schema if absent.
    pub fn open(db_path: &str) -> Result<Self> {
        let store = Self {
            db_path: db_path.to_string(),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection> {
        Connection::open(&self.db_path)
            .with_context(|| format!("open multiplayer store at {}", self.db_path))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS mp_rooms (
                room_code TEXT PRIMARY KEY,
                created_by TEXT NOT NULL,
                room_name TEXT,
                mode TEXT NOT NULL,
                status TEXT NOT NULL,
                config TEXT NOT NULL,
                start_date TEXT NOT NULL,
                end_date TEXT NOT NULL,
                current_day INTEGER NOT NULL,
                day_started_at TEXT,
                day_time_limit INTEGER,
                game_started_at TEXT,
                game_ended_at TEXT,
                ai_current_day INTEGER NOT NULL,
                ai_portfolio_value REAL NOT NULL,
                ai_total_return_pct REAL NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS mp_players (
                player_id TEXT PRIMARY KEY,
                room_code TEXT NOT NULL,
                name TEXT NOT NULL,
                email TEXT,
                current_day INTEGER NOT NULL,
                cash REAL NOT NULL,
                holdings TEXT NOT NULL,
                portfolio_value REAL NOT NULL,
                total_return_pct REAL NOT NULL,
                score INTEGER NOT NULL,
                grade TEXT NOT NULL,
                score_breakdown TEXT,
                is_ready INTEGER NOT NULL,
                last_sync_day INTEGER NOT NULL,
                is_finished INTEGER NOT NULL,
                joined_at TEXT NOT NULL,
                last_action_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_mp_players_room
                ON mp_players (room_code);
            CREATE TABLE IF NOT EXISTS mp_trades (
                player_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                day_submitted INTEGER NOT NULL,
                day_executed INTEGER,
                ticker TEXT NOT NULL,
                action TEXT NOT NULL,
                shares INTEGER NOT NULL,
                price REAL,
                total REAL,
                status TEXT NOT NULL,
                rejection_reason TEXT,
                PRIMARY KEY (player_id, seq)
            );
            CREATE TABLE IF NOT EXISTS mp_snapshots (
                player_id TEXT NOT NULL,
                day INTEGER NOT NULL,
                portfolio_value REAL NOT NULL,
                cash REAL NOT NULL,
                holdings_value REAL NOT NULL,
                return_pct REAL NOT NULL,
                return_usd REAL NOT NULL,
                PRIMARY KEY (player_id, day)
            );",
        )
        .context("create multiplayer schema")?;
        Ok(())
    }

    // ── Rooms ───────────────────────────────────────────────────────────

    pub fn save_room(&self, state: &RoomState) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO mp_rooms
             (room_code, created_by, room_name, mode, status, config,
              start_date, end_date, current_day, day_started_at,
              day_time_limit, game_started_at, game_ended_at,
              ai_current_day, ai_portfolio_value, ai_total_return_pct, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                     ?14, ?15, ?16, ?17)",
            params![
                state.room_code,
                state.created_by,
                state.room_name,
                state.mode.to_string(),
                state.status.to_string(),
                serde_json::to_string(&state.config)?,
                state.start_date.to_string(),
                state.end_date.to_string(),
                state.current_day as i64,
                state.day_started_at.map(|t| t.to_rfc3339()),
                state.day_time_limit.map(|v| v as i64),
                state.game_started_at.map(|t| t.to_rfc3339()),
                state.game_ended_at.map(|t| t.to_rfc3339()),
                state.ai_current_day as i64,
                state.ai_portfolio_value,
                state.ai_total_return_pct,
                state.created_at.to_rfc3339(),
            ],
        )
        .with_context(|| format!("save room {}", state.room_code))?;
        Ok(())
    }

    pub fn load_rooms(&self) -> Result<Vec<RoomState>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT room_code, created_by, room_name, mode, status, config,
                    start_date, end_date, current_day, day_started_at,
                    day_time_limit, game_started_at, game_ended_at,
                    ai_current_day, ai_portfolio_value, ai_total_return_pct,
                    created_at
             FROM mp_rooms ORDER BY created_at ASC",
        )?;
        let rooms = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, i64>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, Option<i64>>(10)?,
                    row.get::<_, Option<String>>(11)?,
                    row.get::<_, Option<String>>(12)?,
                    row.get::<_, i64>(13)?,
                    row.get::<_, f64>(14)?,
                    row.get::<_, f64>(15)?,
                    row.get::<_, String>(16)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rooms
            .into_iter()
            .map(|r| {
                Ok(RoomState {
                    room_code: r.0,
                    created_by: r.1,
                    room_name: r.2,
                    mode: r.3.parse().map_err(anyhow::Error::msg)?,
                    status: r.4.parse().map_err(anyhow::Error::msg)?,
                    config: serde_json::from_str(&r.5)?,
                    start_date: parse_date(&r.6)?,
                    end_date: parse_date(&r.7)?,
                    current_day: r.8 as usize,
                    day_started_at: parse_opt_ts(r.9.as_deref())?,
                    day_time_limit: r.10.map(|v| v as u64),
                    game_started_at: parse_opt_ts(r.11.as_deref())?,
                    game_ended_at: parse_opt_ts(r.12.as_deref())?,
                    ai_current_day: r.13 as usize,
                    ai_portfolio_value: r.14,
                    ai_total_return_pct: r.15,
                    created_at: parse_ts(&r.16)?,
                })
            })
            .collect()
    }

    // ── Players ─────────────────────────────────────────────────────────

    /// Upsert the player row and its ledgers in one transaction. Trade rows
    /// are keyed by their position in the ledger, so execution-time updates
    /// land on the same row; snapshot rows are immutable once written.
    pub fn save_player(&self, p: &Player) -> Result<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT OR REPLACE INTO mp_players
             (player_id, room_code, name, email, current_day, cash, holdings,
              portfolio_value, total_return_pct, score, grade, score_breakdown,
              is_ready, last_sync_day, is_finished, joined_at, last_action_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                     ?14, ?15, ?16, ?17)",
            params![
                p.player_id,
                p.room_code,
                p.name,
                p.email,
                p.current_day as i64,
                p.cash,
                serde_json::to_string(&p.holdings)?,
                p.portfolio_value,
                p.total_return_pct,
                p.score,
                p.grade,
                p.score_breakdown
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                p.is_ready as i64,
                p.last_sync_day as i64,
                p.is_finished as i64,
                p.joined_at.to_rfc3339(),
                p.last_action_at.to_rfc3339(),
            ],
        )?;

        for (seq, t) in p.trades.iter().enumerate() {
            tx.execute(
                "INSERT OR REPLACE INTO mp_trades
                 (player_id, seq, day_submitted, day_executed, ticker, action,
                  shares, price, total, status, rejection_reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    p.player_id,
                    seq as i64,
                    t.day_submitted as i64,
                    t.day_executed.map(|d| d as i64),
                    t.ticker,
                    t.action.to_string(),
                    t.shares as i64,
                    t.price,
                    t.total,
                    trade_status_str(t.status),
                    t.rejection_reason,
                ],
            )?;
        }

        for s in &p.portfolio_history {
            tx.execute(
                "INSERT OR IGNORE INTO mp_snapshots
                 (player_id, day, portfolio_value, cash, holdings_value,
                  return_pct, return_usd)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    p.player_id,
                    s.day as i64,
                    s.portfolio_value,
                    s.cash,
                    s.holdings_value,
                    s.return_pct,
                    s.return_usd,
                ],
            )?;
        }

        tx.commit()
            .with_context(|| format!("save player {}", p.player_id))?;
        Ok(())
    }

    pub fn load_players(&self, room_code: &str) -> Result<Vec<Player>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT player_id, room_code, name, email, current_day, cash,
                    holdings, portfolio_value, total_return_pct, score, grade,
                    score_breakdown, is_ready, last_sync_day, is_finished,
                    joined_at, last_action_at
             FROM mp_players WHERE room_code = ?1 ORDER BY joined_at ASC",
        )?;
        let rows = stmt
            .query_map(params![room_code], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, f64>(7)?,
                    row.get::<_, f64>(8)?,
                    row.get::<_, i64>(9)?,
                    row.get::<_, String>(10)?,
                    row.get::<_, Option<String>>(11)?,
                    row.get::<_, i64>(12)?,
                    row.get::<_, i64>(13)?,
                    row.get::<_, i64>(14)?,
                    row.get::<_, String>(15)?,
                    row.get::<_, String>(16)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut players = Vec::with_capacity(rows.len());
        for r in rows {
            let player_id = r.0.clone();
            players.push(Player {
                player_id: r.0,
                room_code: r.1,
                name: r.2,
                email: r.3,
                current_day: r.4 as usize,
                cash: r.5,
                holdings: serde_json::from_str(&r.6)?,
                trades: self.load_trades(&conn, &player_id)?,
                portfolio_history: self.load_snapshots(&conn, &player_id)?,
                portfolio_value: r.7,
                total_return_pct: r.8,
                score: r.9,
                grade: r.10,
                score_breakdown: r
                    .11
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()?,
                is_ready: r.12 != 0,
                last_sync_day: r.13 as usize,
                is_finished: r.14 != 0,
                joined_at: parse_ts(&r.15)?,
                last_action_at: parse_ts(&r.16)?,
            });
        }
        Ok(players)
    }

    fn load_trades(&self, conn: &Connection, player_id: &str) -> Result<Vec<TradeRecord>> {
        let mut stmt = conn.prepare(
            "SELECT day_submitted, day_executed, ticker, action, shares, price,
                    total, status, rejection_reason
             FROM mp_trades WHERE player_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map(params![player_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<f64>>(5)?,
                    row.get::<_, Option<f64>>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, Option<String>>(8)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|t| {
                Ok(TradeRecord {
                    day_submitted: t.0 as usize,
                    day_executed: t.1.map(|d| d as usize),
                    ticker: t.2,
                    action: t.3.parse().map_err(anyhow::Error::msg)?,
                    shares: t.4 as u64,
                    price: t.5,
                    total: t.6,
                    status: trade_status_parse(&t.7)?,
                    rejection_reason: t.8,
                })
            })
            .collect()
    }

    fn load_snapshots(
        &self,
        conn: &Connection,
        player_id: &str,
    ) -> Result<Vec<PortfolioSnapshot>> {
        let mut stmt = conn.prepare(
            "SELECT day, portfolio_value, cash, holdings_value, return_pct, return_usd
             FROM mp_snapshots WHERE player_id = ?1 ORDER BY day ASC",
        )?;
        let rows = stmt
            .query_map(params![player_id], |row| {
                Ok(PortfolioSnapshot {
                    day: row.get::<_, i64>(0)? as usize,
                    portfolio_value: row.get(1)?,
                    cash: row.get(2)?,
                    holdings_value: row.get(3)?,
                    return_pct: row.get(4)?,
                    return_usd: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

impl std::fmt::Debug for MultiplayerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplayerStore")
            .field("db_path", &self.db_path)
            .finish()
    }
}

// =============================================================================
// Parse helpers
// =============================================================================

fn parse_date(raw: &str) -> Result<NaiveDate> {
    raw.parse().with_context(|| format!("bad date: {raw}"))
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("bad timestamp: {raw}"))?
        .with_timezone(&Utc))
}

fn parse_opt_ts(raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    raw.map(parse_ts).transpose()
}

fn trade_status_str(status: TradeStatus) -> &'static str {
    match status {
        TradeStatus::Pending => "pending",
        TradeStatus::Executed => "executed",
        TradeStatus::Rejected => "rejected",
    }
}

fn trade_status_parse(raw: &str) -> Result<TradeStatus> {
    match raw {
        "pending" => Ok(TradeStatus::Pending),
        "executed" => Ok(TradeStatus::Executed),
        "rejected" => Ok(TradeStatus::Rejected),
        other => anyhow::bail!("unknown trade status: {other}"),
    }
}
