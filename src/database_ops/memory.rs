use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use super::store::TotdStore;
use crate::error::{Result, SyncError};
use crate::model::{Entry, Player, StoredMap, TotdMap, UNKNOWN_AUTHOR_ID, UNKNOWN_AUTHOR_NAME};

#[derive(Default)]
struct Tables {
    players: BTreeMap<String, Player>,
    maps: BTreeMap<String, StoredMap>,
    entries: BTreeMap<(String, String), Entry>,
}

/// In-process store with the same conflict rules as the Postgres schema.
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Starts with the reserved unknown-author row, as the migration does.
    pub fn new() -> Self {
        let mut tables = Tables::default();
        tables.players.insert(
            UNKNOWN_AUTHOR_ID.to_string(),
            Player {
                account_id: UNKNOWN_AUTHOR_ID.to_string(),
                display_name: UNKNOWN_AUTHOR_NAME.to_string(),
                at_count: 0,
            },
        );
        Self {
            tables: Mutex::new(tables),
        }
    }

    pub async fn map(&self, map_uid: &str) -> Option<StoredMap> {
        self.tables.lock().await.maps.get(map_uid).cloned()
    }

    pub async fn player(&self, account_id: &str) -> Option<Player> {
        self.tables.lock().await.players.get(account_id).cloned()
    }

    pub async fn entries(&self) -> Vec<Entry> {
        self.tables.lock().await.entries.values().cloned().collect()
    }

    pub async fn map_count(&self) -> usize {
        self.tables.lock().await.maps.len()
    }

    pub async fn player_count(&self) -> usize {
        self.tables.lock().await.players.len()
    }
}

#[async_trait::async_trait]
impl TotdStore for MemoryStore {
    async fn upsert_map(&self, map: &TotdMap) -> Result<()> {
        let mut t = self.tables.lock().await;
        if !t.players.contains_key(&map.author_account_id) {
            return Err(SyncError::StorageMessage(format!(
                "map {} references unknown author {}",
                map.map_uid, map.author_account_id
            )));
        }
        if let Some(other) = t
            .maps
            .values()
            .find(|m| m.map_id == map.map_id && m.map_uid != map.map_uid)
        {
            return Err(SyncError::StorageMessage(format!(
                "map_id {} already belongs to {}",
                map.map_id, other.map_uid
            )));
        }
        if let Some(row) = t.maps.get_mut(&map.map_uid) {
            row.name = map.name.clone();
            row.author = map.author_account_id.clone();
            row.author_time = map.author_time;
            row.gold_time = map.gold_time;
            row.silver_time = map.silver_time;
            row.bronze_time = map.bronze_time;
            row.laps = map.laps;
            row.thumbnail_url = map.thumbnail_url.clone();
            row.download_url = map.download_url.clone();
            row.year = map.year;
            row.month = map.month as i32;
            row.day = map.day as i32;
            return Ok(());
        }
        t.maps.insert(
            map.map_uid.clone(),
            StoredMap {
                map_uid: map.map_uid.clone(),
                map_id: map.map_id.clone(),
                name: map.name.clone(),
                author: map.author_account_id.clone(),
                author_time: map.author_time,
                gold_time: map.gold_time,
                silver_time: map.silver_time,
                bronze_time: map.bronze_time,
                laps: map.laps,
                thumbnail_url: map.thumbnail_url.clone(),
                download_url: map.download_url.clone(),
                year: map.year,
                month: map.month as i32,
                day: map.day as i32,
                at_count: 0,
                last_leaderboard_update: None,
            },
        );
        Ok(())
    }

    async fn player_exists(&self, account_id: &str) -> Result<bool> {
        Ok(self.tables.lock().await.players.contains_key(account_id))
    }

    async fn upsert_player(&self, player: &Player) -> Result<()> {
        self.tables
            .lock()
            .await
            .players
            .entry(player.account_id.clone())
            .or_insert_with(|| player.clone());
        Ok(())
    }

    async fn upsert_players(&self, players: &[Player]) -> Result<u64> {
        let mut t = self.tables.lock().await;
        let mut inserted = 0;
        for p in players {
            if !t.players.contains_key(&p.account_id) {
                t.players.insert(p.account_id.clone(), p.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn upsert_entry(&self, entry: &Entry) -> Result<()> {
        let mut t = self.tables.lock().await;
        if !t.maps.contains_key(&entry.map_uid) {
            return Err(SyncError::StorageMessage(format!(
                "entry references unknown map {}",
                entry.map_uid
            )));
        }
        if !t.players.contains_key(&entry.player_id) {
            return Err(SyncError::StorageMessage(format!(
                "entry references unknown player {}",
                entry.player_id
            )));
        }
        t.entries.insert(
            (entry.map_uid.clone(), entry.player_id.clone()),
            entry.clone(),
        );
        Ok(())
    }

    async fn select_maps_ordered_by_watermark(&self, limit: Option<i64>) -> Result<Vec<StoredMap>> {
        let t = self.tables.lock().await;
        let mut maps: Vec<StoredMap> = t.maps.values().cloned().collect();
        // None sorts before Some, matching NULLS FIRST; BTreeMap already yields UID order
        maps.sort_by(|a, b| {
            a.last_leaderboard_update
                .cmp(&b.last_leaderboard_update)
                .then_with(|| a.map_uid.cmp(&b.map_uid))
        });
        if let Some(n) = limit {
            maps.truncate(n.max(0) as usize);
        }
        Ok(maps)
    }

    async fn count_entries(&self, player_id: &str) -> Result<i64> {
        let t = self.tables.lock().await;
        Ok(t.entries
            .values()
            .filter(|e| e.player_id == player_id && e.is_at)
            .count() as i64)
    }

    async fn update_player_aggregate(&self, player_id: &str, at_count: i64) -> Result<()> {
        if let Some(p) = self.tables.lock().await.players.get_mut(player_id) {
            p.at_count = at_count as i32;
        }
        Ok(())
    }

    async fn update_map_watermark(&self, map_uid: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(m) = self.tables.lock().await.maps.get_mut(map_uid) {
            m.last_leaderboard_update = Some(at);
        }
        Ok(())
    }

    async fn update_map_achievers(&self, map_uid: &str, at_count: i32) -> Result<()> {
        if let Some(m) = self.tables.lock().await.maps.get_mut(map_uid) {
            m.at_count = at_count;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn map(uid: &str) -> TotdMap {
        TotdMap {
            map_uid: uid.into(),
            map_id: format!("id-{uid}"),
            name: uid.into(),
            author_account_id: UNKNOWN_AUTHOR_ID.into(),
            author_time: 15000,
            gold_time: 16000,
            silver_time: 18000,
            bronze_time: 23000,
            laps: 1,
            thumbnail_url: None,
            download_url: None,
            year: 2024,
            month: 3,
            day: 1,
        }
    }

    #[tokio::test]
    async fn entry_upsert_replaces_in_place() {
        let store = MemoryStore::new();
        store.upsert_map(&map("A")).await.unwrap();
        store.upsert_player(&Player::bare("P1")).await.unwrap();

        let now = Utc::now();
        store
            .upsert_entry(&Entry::new("A", "P1", 16000, Some(5), now, 15000))
            .await
            .unwrap();
        store
            .upsert_entry(&Entry::new("A", "P1", 15500, Some(3), now, 15000))
            .await
            .unwrap();

        let entries = store.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].time, 15500);
        assert_eq!(entries[0].rank, Some(3));
    }

    #[tokio::test]
    async fn watermark_order_puts_never_refreshed_first_and_breaks_ties_by_uid() {
        let store = MemoryStore::new();
        for uid in ["D", "C", "B", "A"] {
            store.upsert_map(&map(uid)).await.unwrap();
        }
        let t0 = Utc::now() - Duration::hours(2);
        store.update_map_watermark("A", t0 + Duration::hours(1)).await.unwrap();
        store.update_map_watermark("B", t0).await.unwrap();
        store.update_map_watermark("C", t0).await.unwrap();

        let order: Vec<String> = store
            .select_maps_ordered_by_watermark(Some(3))
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.map_uid)
            .collect();
        assert_eq!(order, vec!["D", "B", "C"]);
    }

    #[tokio::test]
    async fn player_insert_ignores_existing_rows() {
        let store = MemoryStore::new();
        store
            .upsert_player(&Player {
                account_id: "P1".into(),
                display_name: "Named".into(),
                at_count: 4,
            })
            .await
            .unwrap();
        let inserted = store
            .upsert_players(&[Player::bare("P1"), Player::bare("P2")])
            .await
            .unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(store.player("P1").await.unwrap().display_name, "Named");
    }

    #[tokio::test]
    async fn entries_need_known_player() {
        let store = MemoryStore::new();
        store.upsert_map(&map("A")).await.unwrap();
        let err = store
            .upsert_entry(&Entry::new("A", "ghost", 1, None, Utc::now(), 15000))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::StorageMessage(_)));
    }
}
