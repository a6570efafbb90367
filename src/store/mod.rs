// =============================================================================
// Persistent store — SQLite schemas shared with the offline pipelines
// =============================================================================
//
// SQLite has no namespaced schemas, so the five logical schemas map to
// table-name prefixes:
//
//   market_data  -> market_prices
//   features     -> feature_snapshots
//   news         -> news_items
//   agents       -> agent_recommendations
//   multiplayer  -> mp_rooms / mp_players / mp_trades / mp_snapshots
//
// The first four are populated offline and opened read-only by the core; the
// multiplayer schema is the core's own read/write state.
// =============================================================================

pub mod historical;
pub mod multiplayer;

#[cfg(test)]
pub mod testfix;
