//! Batch reconciliation of upstream catalog and leaderboard data into storage.
//!
//! Every cycle is a sequential sweep. A failure on one month or map is logged
//! and the sweep moves on; configuration and authentication failures end the
//! run. Interrupted runs resume naturally: refresh always starts from the
//! oldest watermark.

use async_trait::async_trait;
use chrono::Utc;
use itertools::Itertools;
use std::collections::BTreeSet;
use tracing::{info, instrument, warn};

use crate::config::SyncConfig;
use crate::database_ops::TotdStore;
use crate::error::Result;
use crate::model::{Entry, Player, StoredMap, TotdMap, UNKNOWN_AUTHOR_ID, UNKNOWN_AUTHOR_NAME};
use crate::nadeo::MonthCatalog;

/// Read side of the upstream API as the engine consumes it.
#[async_trait]
pub trait TotdUpstream: Send + Sync {
    async fn fetch_month(&self, months_back: u32) -> Result<MonthCatalog>;

    async fn count_achievers(&self, map_uid: &str, author_time: i32) -> Result<i32>;

    async fn crawl_achievers(
        &self,
        map_uid: &str,
        author_time: i32,
        achiever_count: i32,
        cap: u32,
    ) -> Result<Vec<Entry>>;

    async fn records_for_players(
        &self,
        map_uid: &str,
        map_id: &str,
        author_time: i32,
        account_ids: &[String],
    ) -> Result<Vec<Entry>>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    pub months_fetched: usize,
    pub months_failed: usize,
    pub maps_upserted: usize,
    pub maps_skipped: usize,
    pub maps_failed: usize,
    pub authors_substituted: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshSummary {
    pub maps_selected: usize,
    pub maps_refreshed: usize,
    pub maps_failed: usize,
    pub entries_written: usize,
    pub players_recomputed: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecheckSummary {
    pub players: usize,
    pub maps_scanned: usize,
    pub maps_failed: usize,
    pub entries_written: usize,
}

pub struct SyncEngine<'a> {
    upstream: &'a dyn TotdUpstream,
    store: &'a dyn TotdStore,
    cfg: SyncConfig,
}

impl<'a> SyncEngine<'a> {
    pub fn new(upstream: &'a dyn TotdUpstream, store: &'a dyn TotdStore, cfg: SyncConfig) -> Self {
        Self {
            upstream,
            store,
            cfg,
        }
    }

    /// Walks months from the current one backwards and upserts every
    /// resolved map. `months` overrides the configured history depth.
    #[instrument(skip(self))]
    pub async fn ingest_maps(&self, months: Option<u32>) -> Result<IngestSummary> {
        let months = months.unwrap_or(self.cfg.months_back);
        let mut summary = IngestSummary::default();

        self.store
            .upsert_player(&Player {
                account_id: UNKNOWN_AUTHOR_ID.to_string(),
                display_name: UNKNOWN_AUTHOR_NAME.to_string(),
                at_count: 0,
            })
            .await?;

        let mut empty_streak = 0u32;
        for months_back in 0..months {
            let catalog = match self.upstream.fetch_month(months_back).await {
                Ok(c) => c,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(months_back, error = %e, "ingest: month fetch failed; skipping");
                    summary.months_failed += 1;
                    continue;
                }
            };

            if catalog.is_empty() {
                empty_streak += 1;
                if empty_streak >= self.cfg.empty_month_streak {
                    info!(months_back, empty_streak, "ingest: reached months before the campaign; stopping");
                    break;
                }
                continue;
            }
            empty_streak = 0;
            summary.months_fetched += 1;
            summary.maps_skipped += catalog.skipped;

            for map in catalog.maps {
                let uid = map.map_uid.clone();
                match self.ingest_map(map).await {
                    Ok(MapOutcome::Stored { substituted }) => {
                        summary.maps_upserted += 1;
                        if substituted {
                            summary.authors_substituted += 1;
                        }
                    }
                    Ok(MapOutcome::Rejected) => summary.maps_skipped += 1,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(map_uid = %uid, error = %e, "ingest: map upsert failed; skipping");
                        summary.maps_failed += 1;
                    }
                }
            }
        }

        info!(?summary, "ingest: done");
        Ok(summary)
    }

    async fn ingest_map(&self, mut map: TotdMap) -> Result<MapOutcome> {
        if !map.medals_are_ordered() {
            warn!(map_uid = %map.map_uid, "ingest: medal thresholds out of order; not stored");
            return Ok(MapOutcome::Rejected);
        }
        let mut substituted = false;
        if !self.store.player_exists(&map.author_account_id).await? {
            map.author_account_id = UNKNOWN_AUTHOR_ID.to_string();
            substituted = true;
        }
        self.store.upsert_map(&map).await?;
        Ok(MapOutcome::Stored { substituted })
    }

    /// Refreshes the stalest maps: achiever count, achiever entries, then the
    /// watermark. Aggregates of every player touched are recomputed at the end.
    #[instrument(skip(self))]
    pub async fn refresh_leaderboards(&self, limit: Option<i64>) -> Result<RefreshSummary> {
        let limit = limit.unwrap_or(self.cfg.refresh_limit).max(0);
        let maps = self.store.select_maps_ordered_by_watermark(Some(limit)).await?;
        let mut summary = RefreshSummary {
            maps_selected: maps.len(),
            ..Default::default()
        };
        let mut touched = BTreeSet::new();

        for map in &maps {
            match self.refresh_map(map, &mut touched).await {
                Ok(written) => {
                    summary.maps_refreshed += 1;
                    summary.entries_written += written;
                }
                Err(e) if e.is_fatal() => {
                    self.settle_aggregates(&touched).await;
                    return Err(e);
                }
                Err(e) => {
                    warn!(map_uid = %map.map_uid, error = %e, "refresh: map failed; skipping");
                    summary.maps_failed += 1;
                }
            }
        }

        let players: Vec<String> = touched.into_iter().collect();
        self.store.recompute_player_aggregates(&players).await?;
        summary.players_recomputed = players.len();

        info!(?summary, "refresh: done");
        Ok(summary)
    }

    async fn refresh_map(&self, map: &StoredMap, touched: &mut BTreeSet<String>) -> Result<usize> {
        let count = self
            .upstream
            .count_achievers(&map.map_uid, map.author_time)
            .await?;
        self.store.update_map_achievers(&map.map_uid, count).await?;

        let candidates = self
            .upstream
            .crawl_achievers(
                &map.map_uid,
                map.author_time,
                count,
                self.cfg.max_records_per_map,
            )
            .await?;
        let written = self.write_entries(map, candidates, touched).await?;

        self.store.update_map_watermark(&map.map_uid, Utc::now()).await?;
        info!(map_uid = %map.map_uid, achievers = count, written, "refresh: map updated");
        Ok(written)
    }

    /// Re-crawls every stored map for the given accounts only, then rewrites
    /// their cached achiever counts. Watermarks are left alone.
    #[instrument(skip(self, account_ids), fields(players = account_ids.len()))]
    pub async fn recheck_players(&self, account_ids: &[String]) -> Result<RecheckSummary> {
        let ids: Vec<String> = account_ids
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unique()
            .map(str::to_string)
            .collect();
        let mut summary = RecheckSummary {
            players: ids.len(),
            ..Default::default()
        };
        if ids.is_empty() {
            return Ok(summary);
        }

        let bare: Vec<Player> = ids.iter().map(Player::bare).collect();
        self.store.upsert_players(&bare).await?;

        let maps = self.store.select_maps_ordered_by_watermark(None).await?;
        let mut touched = BTreeSet::new();
        for map in &maps {
            summary.maps_scanned += 1;
            let outcome = match self
                .upstream
                .records_for_players(&map.map_uid, &map.map_id, map.author_time, &ids)
                .await
            {
                Ok(candidates) => self.write_entries(map, candidates, &mut touched).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(written) => summary.entries_written += written,
                Err(e) if e.is_fatal() => {
                    self.settle_aggregates(&ids.iter().cloned().collect::<BTreeSet<_>>())
                        .await;
                    return Err(e);
                }
                Err(e) => {
                    warn!(map_uid = %map.map_uid, error = %e, "recheck: map failed; skipping");
                    summary.maps_failed += 1;
                }
            }
        }

        self.store.recompute_player_aggregates(&ids).await?;
        info!(?summary, "recheck: done");
        Ok(summary)
    }

    /// Bare player rows first so entries never point at a missing player,
    /// then one entry per (map, player).
    async fn write_entries(
        &self,
        map: &StoredMap,
        candidates: Vec<Entry>,
        touched: &mut BTreeSet<String>,
    ) -> Result<usize> {
        if candidates.is_empty() {
            return Ok(0);
        }
        let players: Vec<Player> = candidates
            .iter()
            .map(|e| e.player_id.as_str())
            .unique()
            .map(Player::bare)
            .collect();
        self.store.upsert_players(&players).await?;

        let mut written = 0;
        for candidate in candidates {
            let entry = Entry {
                map_uid: map.map_uid.clone(),
                is_at: candidate.time <= map.author_time,
                ..candidate
            };
            self.store.upsert_entry(&entry).await?;
            touched.insert(entry.player_id);
            written += 1;
        }
        Ok(written)
    }

    /// Best-effort recompute on the way out of an aborted run.
    async fn settle_aggregates(&self, players: &BTreeSet<String>) {
        if players.is_empty() {
            return;
        }
        let ids: Vec<String> = players.iter().cloned().collect();
        if let Err(e) = self.store.recompute_player_aggregates(&ids).await {
            warn!(error = %e, "aggregate recompute after abort failed");
        }
    }
}

enum MapOutcome {
    Stored { substituted: bool },
    Rejected,
}
