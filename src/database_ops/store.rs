use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{Entry, Player, StoredMap, TotdMap};

/// Write/read operations the sync engine needs from storage.
#[async_trait::async_trait]
pub trait TotdStore: Send + Sync {
    /// Insert, or update the mutable fields (name, medals, laps, urls, date,
    /// author). `map_uid` and `map_id` never change once stored.
    async fn upsert_map(&self, map: &TotdMap) -> Result<()>;

    async fn player_exists(&self, account_id: &str) -> Result<bool>;

    /// Insert-ignore.
    async fn upsert_player(&self, player: &Player) -> Result<()>;

    /// Insert-ignore for many rows; returns how many were new.
    async fn upsert_players(&self, players: &[Player]) -> Result<u64>;

    /// Insert, or overwrite time/rank/recorded_at/is_at of the same
    /// (map_uid, player_id) pair.
    async fn upsert_entry(&self, entry: &Entry) -> Result<()>;

    /// Oldest watermark first (never-refreshed maps lead), ties by map UID.
    async fn select_maps_ordered_by_watermark(&self, limit: Option<i64>) -> Result<Vec<StoredMap>>;

    /// Entries held by `player_id` with `is_at = true`.
    async fn count_entries(&self, player_id: &str) -> Result<i64>;

    async fn update_player_aggregate(&self, player_id: &str, at_count: i64) -> Result<()>;

    async fn update_map_watermark(&self, map_uid: &str, at: DateTime<Utc>) -> Result<()>;

    async fn update_map_achievers(&self, map_uid: &str, at_count: i32) -> Result<()>;

    /// Rewrites each player's cached count from its entries.
    async fn recompute_player_aggregates(&self, player_ids: &[String]) -> Result<()> {
        for id in player_ids {
            let count = self.count_entries(id).await?;
            self.update_player_aggregate(id, count).await?;
        }
        Ok(())
    }
}
