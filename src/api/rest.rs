// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Requests and responses are JSON,
// UTF-8; timestamps RFC 3339, dates YYYY-MM-DD, money as JSON numbers,
// shares as integers. Breaking changes go to `/api/v2/`.
//
// Reads are idempotent and never recompute or fetch: the game-data endpoint
// serves from the slice cache, room state and leaderboard from in-memory
// records. Writes are commands; the server record returned is authoritative.
//
// CORS is configured permissively for classroom deployments; every request
// carries the configured deadline via the timeout layer.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    error_handling::HandleErrorLayer,
    extract::{Json, Path, Query, State},
    routing::{get, post, put},
    Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::{BoxError, ServiceBuilder};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app_state::AppState;
use crate::error::GameError;
use crate::game::rules::PendingTrade;
use crate::game::slice::GameSlice;
use crate::room::player::Player;
use crate::room::{scheduler, LeaderboardEntry, Room, RoomPoll, RoomState};
use crate::types::{GameConfig, GameMode, NewsItem, TechnicalSnapshot, TradeAction};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS, tracing, timeout, and shared
/// state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    // Every handler runs under the configured deadline; a missed deadline
    // surfaces as the TIMEOUT error kind without mutating state.
    let timeout = ServiceBuilder::new()
        .layer(HandleErrorLayer::new(handle_middleware_error))
        .timeout(Duration::from_secs(state.config.request_timeout_secs));

    Router::new()
        // ── Health & game data ──────────────────────────────────────
        .route("/api/v1/health", get(health))
        .route("/api/v1/game/data", get(game_data))
        // ── Rooms ───────────────────────────────────────────────────
        .route("/api/v1/multiplayer/rooms", post(create_room))
        .route("/api/v1/multiplayer/rooms/join", post(join_room))
        .route("/api/v1/multiplayer/rooms/:code", get(get_room))
        .route("/api/v1/multiplayer/rooms/:code/state", get(room_state))
        .route("/api/v1/multiplayer/rooms/:code/leaderboard", get(leaderboard))
        .route("/api/v1/multiplayer/rooms/:code/start", post(start_room))
        .route("/api/v1/multiplayer/rooms/:code/advance-day", post(advance_day))
        .route("/api/v1/multiplayer/rooms/:code/set-timer", post(set_timer))
        .route("/api/v1/multiplayer/rooms/:code/end-game", post(end_game))
        // ── Players ─────────────────────────────────────────────────
        .route("/api/v1/multiplayer/players/:id", put(update_player))
        .route("/api/v1/multiplayer/players/:id/ready", post(mark_ready))
        .route("/api/v1/multiplayer/players/:id/trades", post(submit_trade))
        .route("/api/v1/multiplayer/players/:id/advance", post(advance_player))
        // ── Middleware & state ──────────────────────────────────────
        .layer(TraceLayer::new_for_http())
        .layer(timeout)
        .layer(cors)
        .with_state(state)
}

async fn handle_middleware_error(err: BoxError) -> GameError {
    if err.is::<tower::timeout::error::Elapsed>() {
        GameError::Timeout
    } else {
        GameError::Internal(anyhow::anyhow!(err.to_string()))
    }
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Game data (async sessions pull the full slice)
// =============================================================================

const DEFAULT_GAME_DAYS: usize = 30;

#[derive(Deserialize)]
struct GameDataQuery {
    #[serde(default)]
    days: Option<usize>,
    #[serde(default)]
    tickers: Option<String>,
    #[serde(default)]
    start_date: Option<NaiveDate>,
    #[serde(default)]
    end_date: Option<NaiveDate>,
}

#[derive(Serialize)]
struct DayRecommendation {
    ticker: String,
    recommendation: String,
    confidence: f64,
    technical_signal: crate::types::SignalLabel,
    sentiment_signal: crate::types::SignalLabel,
    risk_level: crate::types::RiskLevel,
    rationale_summary: String,
    synthetic: bool,
}

#[derive(Serialize)]
struct DayPrices {
    open: f64,
    high: f64,
    low: f64,
    close: f64,
}

#[derive(Serialize)]
struct GameDataDay {
    day: usize,
    date: NaiveDate,
    is_trading_day: bool,
    recommendations: Vec<DayRecommendation>,
    prices: BTreeMap<String, DayPrices>,
    news: Vec<NewsItem>,
    technical_indicators: BTreeMap<String, TechnicalSnapshot>,
}

#[derive(Serialize)]
struct GameDataResponse {
    days: Vec<GameDataDay>,
    tickers: Vec<String>,
    start_date: NaiveDate,
    end_date: NaiveDate,
    total_days: usize,
}

async fn game_data(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GameDataQuery>,
) -> Result<Json<GameDataResponse>, GameError> {
    let days = query.days.unwrap_or(DEFAULT_GAME_DAYS).min(GameConfig::MAX_DAYS);
    if days == 0 {
        return Err(GameError::Validation("days must be at least 1".into()));
    }

    let tickers: Vec<String> = match &query.tickers {
        Some(csv) => csv
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect(),
        None => state.config.default_tickers.clone(),
    };
    if tickers.is_empty() {
        return Err(GameError::Validation("tickers must be non-empty".into()));
    }

    let slice = state.slices.get_or_build(
        &state.historical,
        &tickers,
        days,
        query.start_date,
        query.end_date,
    )?;
    Ok(Json(slice_response(&slice)))
}

fn slice_response(slice: &GameSlice) -> GameDataResponse {
    let days = slice
        .days
        .iter()
        .map(|d| {
            let recommendations = d
                .recommendations
                .iter()
                .map(|(ticker, rec)| DayRecommendation {
                    ticker: ticker.clone(),
                    recommendation: rec.action.to_string(),
                    confidence: rec.confidence,
                    technical_signal: rec.technical_signal,
                    sentiment_signal: rec.sentiment_signal,
                    risk_level: rec.risk_level,
                    rationale_summary: rec.rationale_summary.clone(),
                    synthetic: rec.synthetic,
                })
                .collect();

            let prices = d
                .prices
                .iter()
                .map(|(ticker, bar)| {
                    (
                        ticker.clone(),
                        DayPrices {
                            open: bar.open,
                            high: bar.high,
                            low: bar.low,
                            close: bar.close,
                        },
                    )
                })
                .collect();

            // Flatten per-ticker news, newest first.
            let mut news: Vec<NewsItem> =
                d.news.values().flat_map(|items| items.iter().cloned()).collect();
            news.sort_by(|a, b| b.published_at.cmp(&a.published_at));

            GameDataDay {
                day: d.day,
                date: d.date,
                is_trading_day: d.is_trading_day,
                recommendations,
                prices,
                news,
                technical_indicators: d.technicals.clone(),
            }
        })
        .collect();

    GameDataResponse {
        days,
        tickers: slice.tickers.clone(),
        start_date: slice.start_date,
        end_date: slice.end_date,
        total_days: slice.num_days(),
    }
}

// =============================================================================
// Rooms
// =============================================================================

/// Room record plus its players, the shape every room read and transition
/// returns.
#[derive(Serialize)]
struct RoomDoc {
    #[serde(flatten)]
    room: RoomState,
    players: Vec<Player>,
}

fn room_doc(room: &Room) -> RoomDoc {
    RoomDoc {
        room: room.snapshot(),
        players: room.player_snapshots(),
    }
}

#[derive(Deserialize)]
struct CreateRoomRequest {
    created_by: String,
    #[serde(default)]
    room_name: Option<String>,
    game_mode: GameMode,
    config: GameConfig,
    #[serde(default)]
    start_date: Option<NaiveDate>,
    #[serde(default)]
    end_date: Option<NaiveDate>,
    #[serde(default)]
    day_duration_seconds: Option<u64>,
}

async fn create_room(
    State(state): State<Arc<AppState>>,
    Json(mut req): Json<CreateRoomRequest>,
) -> Result<Json<RoomDoc>, GameError> {
    if req.created_by.trim().is_empty() {
        return Err(GameError::Validation("created_by must be non-empty".into()));
    }
    req.config.normalize().map_err(GameError::Validation)?;

    let slice = state.slices.get_or_build(
        &state.historical,
        &req.config.tickers,
        req.config.num_days,
        req.start_date,
        req.end_date,
    )?;

    let code = state.fresh_room_code();
    let room = Arc::new(Room::new(
        code.clone(),
        req.created_by.trim().to_string(),
        req.room_name,
        req.game_mode,
        req.config,
        slice,
        req.day_duration_seconds,
    ));
    state.insert_room(room.clone());
    state.persist_room(&room);

    if req.game_mode == GameMode::SyncAuto {
        scheduler::spawn(state.clone(), room.clone());
    }

    info!(room = %code, mode = %req.game_mode, "room created");
    Ok(Json(room_doc(&room)))
}

#[derive(Deserialize)]
struct JoinRoomRequest {
    room_code: String,
    player_name: String,
    #[serde(default)]
    player_email: Option<String>,
}

async fn join_room(
    State(state): State<Arc<AppState>>,
    Json(req): Json<JoinRoomRequest>,
) -> Result<Json<Player>, GameError> {
    let room = state
        .room(&req.room_code)
        .ok_or_else(|| GameError::NotFound(format!("unknown room: {}", req.room_code)))?;

    let (player, resumed) = room.join(&req.player_name, req.player_email)?;
    let snapshot = player.read().clone();
    state.register_player(&snapshot.player_id, &room.code);
    state.persist_player(&snapshot);

    info!(
        room = %room.code,
        player = %snapshot.player_id,
        resumed,
        "join handled"
    );
    Ok(Json(snapshot))
}

async fn get_room(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Json<RoomDoc>, GameError> {
    let room = lookup_room(&state, &code)?;
    Ok(Json(room_doc(&room)))
}

async fn room_state(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Json<RoomPoll>, GameError> {
    let room = lookup_room(&state, &code)?;
    Ok(Json(room.poll()))
}

async fn leaderboard(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Json<Vec<LeaderboardEntry>>, GameError> {
    let room = lookup_room(&state, &code)?;
    Ok(Json(room.leaderboard()))
}

#[derive(Deserialize)]
struct StartRequest {
    started_by: String,
}

async fn start_room(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    Json(req): Json<StartRequest>,
) -> Result<Json<RoomDoc>, GameError> {
    let room = lookup_room(&state, &code)?;
    room.start(req.started_by.trim())?;
    state.persist_room_with_players(&room);
    Ok(Json(room_doc(&room)))
}

#[derive(Deserialize)]
struct AdvanceDayRequest {
    initiated_by: String,
    #[serde(default)]
    day_time_limit: Option<u64>,
}

async fn advance_day(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    Json(req): Json<AdvanceDayRequest>,
) -> Result<Json<RoomDoc>, GameError> {
    let room = lookup_room(&state, &code)?;
    room.advance_day(Some(req.initiated_by.trim()), req.day_time_limit)?;
    state.persist_room_with_players(&room);
    Ok(Json(room_doc(&room)))
}

#[derive(Deserialize)]
struct SetTimerRequest {
    duration_seconds: u64,
}

async fn set_timer(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    Json(req): Json<SetTimerRequest>,
) -> Result<Json<RoomDoc>, GameError> {
    let room = lookup_room(&state, &code)?;
    room.set_timer(req.duration_seconds)?;
    state.persist_room(&room);
    Ok(Json(room_doc(&room)))
}

#[derive(Deserialize)]
struct EndGameRequest {
    ended_by: String,
}

async fn end_game(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    Json(req): Json<EndGameRequest>,
) -> Result<Json<RoomDoc>, GameError> {
    let room = lookup_room(&state, &code)?;
    room.end_game(req.ended_by.trim())?;
    state.persist_room_with_players(&room);
    Ok(Json(room_doc(&room)))
}

fn lookup_room(state: &AppState, code: &str) -> Result<Arc<Room>, GameError> {
    state
        .room(code)
        .ok_or_else(|| GameError::NotFound(format!("unknown room: {code}")))
}

fn lookup_player_room(state: &AppState, player_id: &str) -> Result<Arc<Room>, GameError> {
    state
        .room_of_player(player_id)
        .ok_or_else(|| GameError::NotFound(format!("unknown player: {player_id}")))
}

// =============================================================================
// Player commands
// =============================================================================

#[derive(Deserialize)]
struct TradeRequest {
    ticker: String,
    action: TradeAction,
    shares: f64,
}

async fn submit_trade(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<TradeRequest>,
) -> Result<Json<crate::room::player::TradeRecord>, GameError> {
    let room = lookup_player_room(&state, &id)?;
    let record = room.submit_trade(
        &id,
        PendingTrade {
            ticker: req.ticker.trim().to_uppercase(),
            action: req.action,
            shares: req.shares,
        },
    )?;

    if let Some(player) = room.players.get(&id) {
        let snapshot = player.read().clone();
        state.persist_player(&snapshot);
    }
    Ok(Json(record))
}

async fn advance_player(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Player>, GameError> {
    let room = lookup_player_room(&state, &id)?;
    let player = room.advance_player(&id)?;
    state.persist_player(&player);
    state.persist_room(&room);
    Ok(Json(player))
}

async fn mark_ready(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, GameError> {
    let room = lookup_player_room(&state, &id)?;
    let ready_count = room.mark_ready(&id)?;
    if let Some(player) = room.players.get(&id) {
        let snapshot = player.read().clone();
        state.persist_player(&snapshot);
    }
    Ok(Json(json!({
        "ready_count": ready_count,
        "total_players": room.players.count(),
    })))
}

/// One trade command inside the PUT patch body.
#[derive(Deserialize)]
struct TradePatch {
    ticker: String,
    action: TradeAction,
    shares: f64,
    #[serde(default)]
    day_submitted: Option<usize>,
}

/// The client's post-day patch. Only the current day's trade commands are
/// honoured; every client-computed field (cash, score, history, ...) is
/// accepted for wire compatibility and ignored — the server recomputes and
/// returns the authoritative record.
#[derive(Deserialize)]
struct PlayerPatchRequest {
    #[serde(default)]
    trades: Vec<TradePatch>,
    #[serde(flatten)]
    _ignored: serde_json::Map<String, serde_json::Value>,
}

#[derive(Serialize)]
struct PlayerPatchResponse {
    player: Player,
    /// Trade commands from the patch that failed validation, with reasons.
    rejected: Vec<serde_json::Value>,
}

async fn update_player(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<PlayerPatchRequest>,
) -> Result<Json<PlayerPatchResponse>, GameError> {
    let room = lookup_player_room(&state, &id)?;

    let (current_day, mode) = {
        let handle = room
            .players
            .get(&id)
            .ok_or_else(|| GameError::NotFound(format!("unknown player: {id}")))?;
        let day = handle.read().current_day;
        (day, room.snapshot().mode)
    };

    let mut rejected = Vec::new();
    for patch in req.trades {
        // Trades for other days are stale echoes of earlier submissions.
        if patch.day_submitted.unwrap_or(current_day) != current_day {
            continue;
        }
        let ticker = patch.ticker.trim().to_uppercase();
        match room.submit_trade(
            &id,
            PendingTrade {
                ticker: ticker.clone(),
                action: patch.action,
                shares: patch.shares,
            },
        ) {
            Ok(_) => {}
            Err(GameError::Rule(reason)) => {
                rejected.push(json!({ "ticker": ticker, "reason": reason.code() }));
            }
            Err(other) => return Err(other),
        }
    }

    // The patch is the client's "my day is done"; in async mode that
    // advances the player's own clock.
    let player = if mode == GameMode::Async {
        room.advance_player(&id)?
    } else {
        room.players
            .get(&id)
            .ok_or_else(|| GameError::NotFound(format!("unknown player: {id}")))?
            .read()
            .clone()
    };

    state.persist_player(&player);
    state.persist_room(&room);
    Ok(Json(PlayerPatchResponse { player, rejected }))
}
