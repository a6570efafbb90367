// =============================================================================
// Central Application State — marketroom game core
// =============================================================================
//
// The single source of truth for the process. Handlers and the per-room
// scheduler tasks all hold `Arc<AppState>`; rooms own their players and are
// reached through the registry here.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking (polling clients use it
//     as a cheap change hint).
//   - parking_lot::RwLock for the room registry and the player index.
//   - Persistence is write-behind: snapshot under the lock, release, write.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::warn;

use crate::config::ServerConfig;
use crate::game::slice::SliceCache;
use crate::room::{generate_room_code, Room};
use crate::store::historical::HistoricalStore;
use crate::store::multiplayer::MultiplayerStore;

/// Central application state shared across all tasks via `Arc<AppState>`.
pub struct AppState {
    pub config: ServerConfig,

    // ── Stores ──────────────────────────────────────────────────────────
    pub historical: HistoricalStore,
    pub multiplayer: MultiplayerStore,

    // ── Derived caches ──────────────────────────────────────────────────
    pub slices: SliceCache,

    // ── Rooms ───────────────────────────────────────────────────────────
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    /// player_id -> room_code, maintained on join and restore.
    player_rooms: RwLock<HashMap<String, String>>,

    // ── Version tracking ────────────────────────────────────────────────
    /// Monotonically increasing; bumped on every committed mutation.
    pub state_version: AtomicU64,

    // ── Shutdown ────────────────────────────────────────────────────────
    /// Flipped to true once; scheduler tasks drain when it changes.
    pub shutdown: watch::Receiver<bool>,

    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        historical: HistoricalStore,
        multiplayer: MultiplayerStore,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            historical,
            multiplayer,
            slices: SliceCache::new(),
            rooms: RwLock::new(HashMap::new()),
            player_rooms: RwLock::new(HashMap::new()),
            state_version: AtomicU64::new(1),
            shutdown,
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Room registry ───────────────────────────────────────────────────

    /// A room code no existing room uses.
    pub fn fresh_room_code(&self) -> String {
        let rooms = self.rooms.read();
        loop {
            let code = generate_room_code();
            if !rooms.contains_key(&code) {
                return code;
            }
        }
    }

    pub fn insert_room(&self, room: Arc<Room>) {
        self.rooms.write().insert(room.code.clone(), room);
        self.increment_version();
    }

    /// Look up a room by code, case-insensitively.
    pub fn room(&self, code: &str) -> Option<Arc<Room>> {
        self.rooms.read().get(&code.trim().to_uppercase()).cloned()
    }

    pub fn rooms_snapshot(&self) -> Vec<Arc<Room>> {
        self.rooms.read().values().cloned().collect()
    }

    // ── Player index ────────────────────────────────────────────────────

    pub fn register_player(&self, player_id: &str, room_code: &str) {
        self.player_rooms
            .write()
            .insert(player_id.to_string(), room_code.to_string());
    }

    /// The room a player belongs to.
    pub fn room_of_player(&self, player_id: &str) -> Option<Arc<Room>> {
        let code = self.player_rooms.read().get(player_id).cloned()?;
        self.room(&code)
    }

    // ── Write-behind persistence ────────────────────────────────────────
    //
    // Failures are logged and do not fail the request; the in-memory record
    // stays authoritative for the process lifetime.

    pub fn persist_room(&self, room: &Room) {
        let snapshot = room.snapshot();
        if let Err(e) = self.multiplayer.save_room(&snapshot) {
            warn!(room = %room.code, error = %e, "room persistence failed");
        }
        self.increment_version();
    }

    pub fn persist_player(&self, player: &crate::room::player::Player) {
        if let Err(e) = self.multiplayer.save_player(player) {
            warn!(player = %player.player_id, error = %e, "player persistence failed");
        }
        self.increment_version();
    }

    /// Persist the room record and every player in it; used after sweeping
    /// transitions (advance-day, end-game, auto-tick).
    pub fn persist_room_with_players(&self, room: &Room) {
        let snapshot = room.snapshot();
        let players = room.player_snapshots();
        if let Err(e) = self.multiplayer.save_room(&snapshot) {
            warn!(room = %room.code, error = %e, "room persistence failed");
        }
        for p in &players {
            if let Err(e) = self.multiplayer.save_player(p) {
                warn!(player = %p.player_id, error = %e, "player persistence failed");
            }
        }
        self.increment_version();
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("rooms", &self.rooms.read().len())
            .field("state_version", &self.current_state_version())
            .finish()
    }
}
