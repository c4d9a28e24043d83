use serde_json::{Map, Value};
use std::path::Path;
use tracing::{info, warn};

use super::store::TotdStore;
use crate::error::Result;
use crate::model::Player;

pub const IMPORT_BATCH: usize = 20_000;

/// Parses a `{ "displayName": "accountId", ... }` dump. Entries whose value
/// is not a non-empty string are dropped.
pub fn parse_player_dump(raw: &str) -> Result<Vec<Player>> {
    let obj: Map<String, Value> = serde_json::from_str(raw)?;
    let mut players = Vec::with_capacity(obj.len());
    let mut dropped = 0usize;
    for (name, id) in obj {
        match id.as_str().map(str::trim) {
            Some(id) if !id.is_empty() => players.push(Player {
                account_id: id.to_string(),
                display_name: name,
                at_count: 0,
            }),
            _ => dropped += 1,
        }
    }
    if dropped > 0 {
        warn!(dropped, "player dump: entries without an account id were ignored");
    }
    Ok(players)
}

/// Loads a player dump into storage with insert-ignore semantics.
/// Returns the number of rows that were new.
pub async fn import_players(store: &dyn TotdStore, path: &Path) -> Result<u64> {
    let raw = tokio::fs::read_to_string(path).await?;
    let players = parse_player_dump(&raw)?;
    let total = players.len();
    info!(total, file = %path.display(), "importing players");

    let mut inserted = 0;
    for (idx, batch) in players.chunks(IMPORT_BATCH).enumerate() {
        inserted += store.upsert_players(batch).await?;
        info!(
            batch = idx + 1,
            done = ((idx + 1) * IMPORT_BATCH).min(total),
            total,
            "player import progress"
        );
    }
    info!(inserted, total, "player import finished");
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory::MemoryStore;
    use crate::error::SyncError;
    use std::io::Write;

    #[test]
    fn dump_skips_non_string_ids() {
        let players =
            parse_player_dump(r#"{"Alice": "acc-1", "Bob": 12, "Carol": "  "}"#).unwrap();
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].display_name, "Alice");
        assert_eq!(players[0].account_id, "acc-1");
    }

    #[test]
    fn dump_must_be_an_object() {
        assert!(matches!(parse_player_dump("[1,2]"), Err(SyncError::Decode(_))));
    }

    #[tokio::test]
    async fn import_is_insert_ignore() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"Alice": "acc-1", "Bob": "acc-2"}}"#).unwrap();

        let store = MemoryStore::new();
        store
            .upsert_player(&Player {
                account_id: "acc-1".into(),
                display_name: "Alice (old)".into(),
                at_count: 3,
            })
            .await
            .unwrap();

        let inserted = import_players(&store, file.path()).await.unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(store.player("acc-1").await.unwrap().at_count, 3);
        assert_eq!(store.player("acc-2").await.unwrap().display_name, "Bob");
        // sentinel author plus the two imported accounts
        assert_eq!(store.player_count().await, 3);
    }
}
