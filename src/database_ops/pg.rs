use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, QueryBuilder, Row};
use tracing::{debug, instrument};

use super::store::TotdStore;
use crate::error::Result;
use crate::model::{Entry, Player, StoredMap, TotdMap};
use crate::util::db::Db;

/// Rows per multi-VALUES insert; keeps bind count under the Postgres limit.
const PLAYER_INSERT_CHUNK: usize = 5_000;

const MAP_COLUMNS: &str = "map_uid, map_id, name, author, author_time, gold_time, silver_time, \
     bronze_time, laps, thumbnail_url, download_url, year, month, day, at_count, \
     last_leaderboard_update";

#[derive(Clone)]
pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

fn stored_map_from_row(r: &PgRow) -> std::result::Result<StoredMap, sqlx::Error> {
    Ok(StoredMap {
        map_uid: r.try_get("map_uid")?,
        map_id: r.try_get("map_id")?,
        name: r.try_get("name")?,
        author: r.try_get("author")?,
        author_time: r.try_get("author_time")?,
        gold_time: r.try_get("gold_time")?,
        silver_time: r.try_get("silver_time")?,
        bronze_time: r.try_get("bronze_time")?,
        laps: r.try_get("laps")?,
        thumbnail_url: r.try_get("thumbnail_url")?,
        download_url: r.try_get("download_url")?,
        year: r.try_get("year")?,
        month: r.try_get("month")?,
        day: r.try_get("day")?,
        at_count: r.try_get("at_count")?,
        last_leaderboard_update: r.try_get("last_leaderboard_update")?,
    })
}

#[async_trait::async_trait]
impl TotdStore for PgStore {
    #[instrument(skip(self, map), fields(map_uid = %map.map_uid))]
    async fn upsert_map(&self, map: &TotdMap) -> Result<()> {
        sqlx::query(
            "INSERT INTO maps (map_uid, map_id, name, author, author_time, gold_time, silver_time, \
                 bronze_time, laps, thumbnail_url, download_url, year, month, day) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14) \
             ON CONFLICT (map_uid) DO UPDATE SET \
                 name = EXCLUDED.name, author = EXCLUDED.author, \
                 author_time = EXCLUDED.author_time, gold_time = EXCLUDED.gold_time, \
                 silver_time = EXCLUDED.silver_time, bronze_time = EXCLUDED.bronze_time, \
                 laps = EXCLUDED.laps, thumbnail_url = EXCLUDED.thumbnail_url, \
                 download_url = EXCLUDED.download_url, \
                 year = EXCLUDED.year, month = EXCLUDED.month, day = EXCLUDED.day",
        )
        .persistent(false)
        .bind(&map.map_uid)
        .bind(&map.map_id)
        .bind(&map.name)
        .bind(&map.author_account_id)
        .bind(map.author_time)
        .bind(map.gold_time)
        .bind(map.silver_time)
        .bind(map.bronze_time)
        .bind(map.laps)
        .bind(map.thumbnail_url.as_deref())
        .bind(map.download_url.as_deref())
        .bind(map.year)
        .bind(map.month as i32)
        .bind(map.day as i32)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    async fn player_exists(&self, account_id: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM players WHERE account_id = $1)")
                .persistent(false)
                .bind(account_id)
                .fetch_one(&self.db.pool)
                .await?;
        Ok(exists)
    }

    async fn upsert_player(&self, player: &Player) -> Result<()> {
        sqlx::query(
            "INSERT INTO players (account_id, display_name, at_count) VALUES ($1,$2,$3) \
             ON CONFLICT (account_id) DO NOTHING",
        )
        .persistent(false)
        .bind(&player.account_id)
        .bind(&player.display_name)
        .bind(player.at_count)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self, players), fields(rows = players.len()))]
    async fn upsert_players(&self, players: &[Player]) -> Result<u64> {
        let mut inserted = 0;
        for chunk in players.chunks(PLAYER_INSERT_CHUNK) {
            let mut qb: QueryBuilder<'_, sqlx::Postgres> =
                QueryBuilder::new("INSERT INTO players (account_id, display_name, at_count) ");
            qb.push_values(chunk, |mut b, p| {
                b.push_bind(&p.account_id)
                    .push_bind(&p.display_name)
                    .push_bind(p.at_count);
            });
            qb.push(" ON CONFLICT (account_id) DO NOTHING");
            let res = qb.build().persistent(false).execute(&self.db.pool).await?;
            inserted += res.rows_affected();
        }
        debug!(inserted, "players batch upserted");
        Ok(inserted)
    }

    async fn upsert_entry(&self, entry: &Entry) -> Result<()> {
        sqlx::query(
            "INSERT INTO entries (map_uid, player_id, time, rank, recorded_at, is_at) \
             VALUES ($1,$2,$3,$4,$5,$6) \
             ON CONFLICT (map_uid, player_id) DO UPDATE SET \
                 time = EXCLUDED.time, rank = EXCLUDED.rank, \
                 recorded_at = EXCLUDED.recorded_at, is_at = EXCLUDED.is_at",
        )
        .persistent(false)
        .bind(&entry.map_uid)
        .bind(&entry.player_id)
        .bind(entry.time)
        .bind(entry.rank)
        .bind(entry.recorded_at)
        .bind(entry.is_at)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    async fn select_maps_ordered_by_watermark(&self, limit: Option<i64>) -> Result<Vec<StoredMap>> {
        let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new("SELECT ");
        qb.push(MAP_COLUMNS)
            .push(" FROM maps ORDER BY last_leaderboard_update ASC NULLS FIRST, map_uid ASC");
        if let Some(n) = limit {
            qb.push(" LIMIT ").push_bind(n.max(0));
        }
        let rows = qb.build().persistent(false).fetch_all(&self.db.pool).await?;
        let maps = rows
            .iter()
            .map(stored_map_from_row)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(maps)
    }

    async fn count_entries(&self, player_id: &str) -> Result<i64> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM entries WHERE player_id = $1 AND is_at = true",
        )
        .persistent(false)
        .bind(player_id)
        .fetch_one(&self.db.pool)
        .await?;
        Ok(n)
    }

    async fn update_player_aggregate(&self, player_id: &str, at_count: i64) -> Result<()> {
        sqlx::query("UPDATE players SET at_count = $2 WHERE account_id = $1")
            .persistent(false)
            .bind(player_id)
            .bind(at_count as i32)
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }

    async fn update_map_watermark(&self, map_uid: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE maps SET last_leaderboard_update = $2 WHERE map_uid = $1")
            .persistent(false)
            .bind(map_uid)
            .bind(at)
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }

    async fn update_map_achievers(&self, map_uid: &str, at_count: i32) -> Result<()> {
        sqlx::query("UPDATE maps SET at_count = $2 WHERE map_uid = $1")
            .persistent(false)
            .bind(map_uid)
            .bind(at_count)
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }

    /// One statement for the whole set instead of a count/update pair per player.
    #[instrument(skip(self, player_ids), fields(players = player_ids.len()))]
    async fn recompute_player_aggregates(&self, player_ids: &[String]) -> Result<()> {
        if player_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "UPDATE players p SET at_count = COALESCE(( \
                 SELECT COUNT(*)::int FROM entries e \
                 WHERE e.player_id = p.account_id AND e.is_at = true), 0) \
             WHERE p.account_id = ANY($1)",
        )
        .persistent(false)
        .bind(player_ids)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }
}
