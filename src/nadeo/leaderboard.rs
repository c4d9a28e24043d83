use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashSet;
use tracing::{debug, warn};

use super::client::{Api, NadeoClient};
use super::models::{NadeoLeaderboard, NadeoLeaderboardRow, NadeoMapRecord};
use crate::error::Result;
use crate::model::Entry;

pub const TOP_PAGE_SIZE: u32 = 100;
/// Upstream refuses top-slice offsets at or past this value.
pub const TOP_OFFSET_LIMIT: u32 = 10_000;

pub fn surround_path(map_uid: &str, score: i32) -> String {
    format!(
        "/api/token/leaderboard/group/Personal_Best/map/{}/surround/0/0?score={score}&onlyWorld=true",
        urlencoding::encode(map_uid)
    )
}

pub fn top_path(map_uid: &str, offset: u32) -> String {
    format!(
        "/api/token/leaderboard/group/Personal_Best/map/{}/top?length={TOP_PAGE_SIZE}&offset={offset}&onlyWorld=true",
        urlencoding::encode(map_uid)
    )
}

pub fn records_path(map_id: &str, account_ids: &[String]) -> String {
    format!(
        "/v2/mapRecords/?accountIdList={}&mapId={}",
        account_ids.join(","),
        urlencoding::encode(map_id)
    )
}

fn first_zone(lb: &NadeoLeaderboard) -> &[NadeoLeaderboardRow] {
    lb.tops.first().map(|z| z.top.as_slice()).unwrap_or(&[])
}

/// Achiever count from a surround slice centered on the author time.
///
/// The top row sits at the threshold, so its position counts everyone at or
/// under it. When upstream hands back the first row *slower* than the author
/// time nobody else is at the threshold and that row is not an achiever.
pub fn achievers_from_surround(lb: &NadeoLeaderboard, author_time: i32) -> i32 {
    let Some(row) = first_zone(lb).first() else {
        return 0;
    };
    match row.score {
        Some(score) if score > author_time => (row.position - 1).max(0),
        _ => row.position.max(0),
    }
}

fn epoch_or_now(ts: Option<i64>) -> DateTime<Utc> {
    ts.and_then(|s| Utc.timestamp_opt(s, 0).single())
        .unwrap_or_else(Utc::now)
}

/// Entry candidates from one top-slice page. The flag is true once a row
/// slower than the author time was seen, which ends the crawl.
pub fn candidates_from_top(
    map_uid: &str,
    author_time: i32,
    rows: &[NadeoLeaderboardRow],
) -> (Vec<Entry>, bool) {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let (Some(account_id), Some(score)) = (row.account_id.as_deref(), row.score) else {
            continue;
        };
        if score > author_time {
            return (out, true);
        }
        out.push(Entry::new(
            map_uid,
            account_id,
            score,
            Some(row.position),
            epoch_or_now(row.timestamp),
            author_time,
        ));
    }
    (out, false)
}

/// Entry candidates from a records lookup. Only the requested accounts are
/// kept and an account listed twice keeps its first row.
pub fn entries_from_records(
    map_uid: &str,
    author_time: i32,
    requested: &HashSet<&str>,
    records: Vec<NadeoMapRecord>,
) -> Vec<Entry> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|r| requested.contains(r.account_id.as_str()))
        .filter(|r| seen.insert(r.account_id.clone()))
        .map(|r| {
            let recorded_at = r
                .timestamp
                .as_deref()
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);
            Entry::new(
                map_uid,
                r.account_id,
                r.record_score.time,
                None,
                recorded_at,
                author_time,
            )
        })
        .collect()
}

pub struct LeaderboardCrawler<'a> {
    client: &'a NadeoClient,
    records_batch: usize,
}

impl<'a> LeaderboardCrawler<'a> {
    pub fn new(client: &'a NadeoClient, records_batch: usize) -> Self {
        Self {
            client,
            records_batch: records_batch.max(1),
        }
    }

    pub async fn count_achievers(&self, map_uid: &str, author_time: i32) -> Result<i32> {
        let lb: NadeoLeaderboard = self
            .client
            .get_json(Api::Live, &surround_path(map_uid, author_time))
            .await?;
        let count = achievers_from_surround(&lb, author_time);
        debug!(map_uid, author_time, count, "leaderboard: achiever count");
        Ok(count)
    }

    /// Pages the top slice until `achiever_count` rows (bounded by `cap`) are
    /// collected, a row misses the author time, or upstream runs dry.
    pub async fn crawl_achievers(
        &self,
        map_uid: &str,
        author_time: i32,
        achiever_count: i32,
        cap: u32,
    ) -> Result<Vec<Entry>> {
        let target = (achiever_count.max(0) as u32).min(cap) as usize;
        let mut out: Vec<Entry> = Vec::with_capacity(target.min(1_000));
        let mut offset = 0u32;

        while out.len() < target {
            if offset >= TOP_OFFSET_LIMIT {
                warn!(map_uid, collected = out.len(), target, "leaderboard: offset limit reached");
                break;
            }
            let page: NadeoLeaderboard = self
                .client
                .get_json(Api::Live, &top_path(map_uid, offset))
                .await?;
            let rows = first_zone(&page);
            let (batch, passed_threshold) = candidates_from_top(map_uid, author_time, rows);
            out.extend(batch);
            if passed_threshold || rows.len() < TOP_PAGE_SIZE as usize {
                break;
            }
            offset += TOP_PAGE_SIZE;
        }

        out.truncate(target);
        debug!(map_uid, collected = out.len(), target, "leaderboard: crawl done");
        Ok(out)
    }

    /// Personal bests for the given accounts. Accounts without a record on
    /// the map are simply absent from the result.
    pub async fn records_for_players(
        &self,
        map_uid: &str,
        map_id: &str,
        author_time: i32,
        account_ids: &[String],
    ) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        for chunk in account_ids.chunks(self.records_batch) {
            let records: Vec<NadeoMapRecord> = self
                .client
                .get_json(Api::Core, &records_path(map_id, chunk))
                .await?;
            let requested: HashSet<&str> = chunk.iter().map(String::as_str).collect();
            out.extend(entries_from_records(map_uid, author_time, &requested, records));
        }
        Ok(out)
    }
}
