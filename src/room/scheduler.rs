// =============================================================================
// Clock Scheduler — one cooperative auto-advance task per sync_auto room
// =============================================================================
//
// The task sleeps until `day_started_at + day_time_limit`, wakes, and asks
// the room to advance. The deadline is always recomputed from the room's
// recorded `day_started_at`, never from the previous wake, so the clock
// cannot drift. The room serializer makes concurrent triggers (timer wake
// plus a teacher click) yield exactly one increment: the loser re-reads the
// state and its attempt becomes a no-op.
//
// Cancellation: `set-timer`, manual advance, `end-game`, and room finish all
// nudge `room.timer`; process shutdown flips the watch channel and the task
// drains. Failed ticks are logged and retried on the next wake.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::room::Room;

/// Backoff before re-attempting after a failed tick, so a persistent error
/// cannot spin the task hot.
const TICK_RETRY: Duration = Duration::from_secs(1);

/// Spawn the auto-advance task for a sync_auto room.
pub fn spawn(state: Arc<AppState>, room: Arc<Room>) {
    tokio::spawn(run(state, room));
}

async fn run(state: Arc<AppState>, room: Arc<Room>) {
    let mut shutdown = state.shutdown.clone();
    info!(room = %room.code, "auto-advance scheduler armed");

    loop {
        if room.is_finished() {
            break;
        }

        match room.next_deadline() {
            Some(deadline) => {
                // An overdue deadline (e.g. after a restart) fires at once.
                let wait = (deadline - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        tick(&state, &room).await;
                    }
                    _ = room.timer.notified() => {
                        debug!(room = %room.code, "timer nudged, rescheduling");
                    }
                    _ = shutdown.changed() => break,
                }
            }
            None => {
                // Untimed or not in progress: nothing to do until nudged.
                tokio::select! {
                    _ = room.timer.notified() => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    info!(room = %room.code, "auto-advance scheduler stopped");
}

async fn tick(state: &Arc<AppState>, room: &Arc<Room>) {
    // The auto path re-checks the deadline under the room lock; if a manual
    // advance won the race this is a no-op.
    match room.advance_day(None, None) {
        Ok(snapshot) => {
            debug!(
                room = %room.code,
                day = snapshot.current_day,
                status = %snapshot.status,
                "auto-tick applied"
            );
            state.persist_room_with_players(room);
        }
        Err(e) => {
            warn!(room = %room.code, error = %e, "auto-tick failed, will retry");
            tokio::time::sleep(TICK_RETRY).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::room::Room;
    use crate::store::historical::HistoricalStore;
    use crate::store::testfix::Fixture;
    use crate::game::slice::SliceCache;
    use crate::types::{Difficulty, GameConfig, GameMode, RoomStatus};
    use tokio::sync::watch;

    fn auto_room(fix: &Fixture, num_days: usize, limit_secs: u64) -> Arc<Room> {
        fix.insert_price_run(
            "AAPL",
            "2025-03-03",
            &[100.0, 102.0, 104.0, 106.0, 108.0][..num_days],
            110.0,
        );
        fix.insert_recommendation("AAPL", "2025-03-03", "BUY", 0.7);
        let store = fix.historical();
        let slice = SliceCache::new()
            .get_or_build(
                &store,
                &["AAPL".into()],
                num_days,
                Some("2025-03-03".parse().unwrap()),
                None,
            )
            .unwrap();
        Arc::new(Room::new(
            "AUTO01".into(),
            "teacher".into(),
            None,
            GameMode::SyncAuto,
            GameConfig {
                initial_cash: 10_000.0,
                num_days,
                tickers: vec!["AAPL".into()],
                difficulty: Difficulty::Medium,
            },
            slice,
            Some(limit_secs),
        ))
    }

    fn app_state(fix: &Fixture) -> (Arc<AppState>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let historical = HistoricalStore::open(fix.path(), fix.earliest).unwrap();
        let multiplayer = fix.multiplayer();
        let state = Arc::new(AppState::new(
            ServerConfig::default(),
            historical,
            multiplayer,
            rx,
        ));
        (state, tx)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn auto_room_advances_to_finish() {
        let fix = Fixture::new();
        let room = auto_room(&fix, 3, 1);
        let (state, _tx) = app_state(&fix);

        room.join("Alice", None).unwrap();
        room.start("teacher").unwrap();
        spawn(state.clone(), room.clone());

        // 3 days at 1 s each: well inside 5 s the room must have advanced at
        // least twice and be in progress or finished.
        tokio::time::sleep(Duration::from_secs(4)).await;
        let snapshot = room.snapshot();
        assert!(snapshot.current_day >= 2 || snapshot.status == RoomStatus::Finished);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(room.snapshot().status, RoomStatus::Finished);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_drains_the_task() {
        let fix = Fixture::new();
        let room = auto_room(&fix, 5, 3600);
        let (state, tx) = app_state(&fix);

        room.start("teacher").unwrap();
        spawn(state.clone(), room.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;

        tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // The room is untouched and still valid for a restart.
        let snapshot = room.snapshot();
        assert_eq!(snapshot.status, RoomStatus::InProgress);
        assert_eq!(snapshot.current_day, 0);
    }
}
