// =============================================================================
// marketroom — Main Entry Point
// =============================================================================
//
// The authoritative game core for the classroom trading simulator: it slices
// the historical dataset into per-room game timelines, runs multiplayer rooms
// in three clock modes, validates and executes trades, scores players, and
// serves the polling read API.
//
// All market data is ingested offline; nothing in the request path calls out.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod config;
mod error;
mod game;
mod room;
mod store;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::ServerConfig;
use crate::room::{scheduler, Room};
use crate::store::historical::HistoricalStore;
use crate::store::multiplayer::MultiplayerStore;
use crate::types::{GameMode, RoomStatus};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        marketroom — classroom game core starting        ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = ServerConfig::from_env()?;
    info!(
        db = %config.db_path,
        earliest = %config.earliest_allowed_date,
        tickers = ?config.default_tickers,
        "configuration resolved"
    );

    // ── 2. Stores ────────────────────────────────────────────────────────
    // The multiplayer store opens first so a fresh database gets its schema
    // before the read-only gateway probes the file.
    let multiplayer = MultiplayerStore::open(&config.db_path)?;
    let historical = HistoricalStore::open(&config.db_path, config.earliest_allowed_date)?;

    // ── 3. Shared state & shutdown channel ───────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let state = Arc::new(AppState::new(config, historical, multiplayer, shutdown_rx));

    // ── 4. Restore persisted rooms ───────────────────────────────────────
    restore_rooms(&state);

    // ── 5. Start the API server ──────────────────────────────────────────
    let bind_addr = state.config.bind_addr.clone();
    let api_state = state.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("Failed to bind API server");
        info!(addr = %bind_addr, "API server listening");
        axum::serve(listener, app)
            .await
            .expect("API server failed");
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    // Drain the per-room scheduler tasks; any transition already inside the
    // room lock completes and persists before the process exits.
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;

    for room in state.rooms_snapshot() {
        state.persist_room_with_players(&room);
    }

    info!("marketroom shut down complete.");
    Ok(())
}

/// Reload every persisted room, rebuild its slice from the same resolved key
/// (deterministic, so the AI curve and game data come out identical), and
/// re-arm sync_auto schedulers from the recorded day_started_at. Overdue
/// rooms tick immediately.
fn restore_rooms(state: &Arc<AppState>) {
    let rooms = match state.multiplayer.load_rooms() {
        Ok(rooms) => rooms,
        Err(e) => {
            error!(error = %e, "failed to load persisted rooms");
            return;
        }
    };
    if rooms.is_empty() {
        return;
    }

    let mut restored = 0usize;
    for room_state in rooms {
        let code = room_state.room_code.clone();
        let mode = room_state.mode;
        let status = room_state.status;

        let slice = match state.slices.get_or_build(
            &state.historical,
            &room_state.config.tickers,
            room_state.config.num_days,
            Some(room_state.start_date),
            Some(room_state.end_date),
        ) {
            Ok(slice) => slice,
            Err(e) => {
                warn!(room = %code, error = %e, "skipping room, slice rebuild failed");
                continue;
            }
        };

        let room = Arc::new(Room::restore(room_state, slice));
        match state.multiplayer.load_players(&code) {
            Ok(players) => {
                for p in players {
                    state.register_player(&p.player_id, &code);
                    room.players.restore(p);
                }
            }
            Err(e) => warn!(room = %code, error = %e, "failed to load players"),
        }

        state.insert_room(room.clone());
        if mode == GameMode::SyncAuto && status != RoomStatus::Finished {
            scheduler::spawn(state.clone(), room);
        }
        restored += 1;
    }
    info!(count = restored, "persisted rooms restored");
}
