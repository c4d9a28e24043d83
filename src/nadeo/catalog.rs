use itertools::Itertools;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::client::{Api, NadeoClient};
use super::models::{NadeoCampaignMonth, NadeoCampaignMonths, NadeoMapDetail, NadeoMapList};
use crate::error::Result;
use crate::model::TotdMap;

/// Upstream accepts at most this many UIDs per multi-detail call.
pub const MULTI_DETAIL_CHUNK: usize = 100;

/// One calendar day's assigned map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayAssignment {
    pub day: u32,
    pub map_uid: String,
}

/// Resolved maps for one campaign month.
#[derive(Debug, Clone, Default)]
pub struct MonthCatalog {
    pub year: i32,
    pub month: u32,
    /// Days listed by upstream, including future days without a map yet.
    pub days_listed: usize,
    pub maps: Vec<TotdMap>,
    /// Assigned days whose map could not be resolved or failed validation.
    pub skipped: usize,
}

impl MonthCatalog {
    /// True for months before the campaign existed.
    pub fn is_empty(&self) -> bool {
        self.days_listed == 0
    }
}

pub fn month_path(months_back: u32) -> String {
    format!("/api/token/campaign/month?length=1&offset={months_back}&royal=false")
}

pub fn map_detail_path(map_uid: &str) -> String {
    format!("/api/token/map/{}", urlencoding::encode(map_uid))
}

pub fn multi_detail_path(map_uids: &[String]) -> String {
    let list = map_uids.iter().map(|u| urlencoding::encode(u)).join(",");
    format!("/api/token/map/get-multiple?mapUidList={list}")
}

/// Day assignments with a non-empty UID. Days without `monthDay` take their
/// 1-based position in the list.
pub fn month_assignments(month: &NadeoCampaignMonth) -> Vec<DayAssignment> {
    month
        .days
        .iter()
        .enumerate()
        .filter_map(|(idx, d)| {
            let uid = d.map_uid.trim();
            if uid.is_empty() {
                return None;
            }
            Some(DayAssignment {
                day: d.month_day.unwrap_or(idx as u32 + 1),
                map_uid: uid.to_string(),
            })
        })
        .collect()
}

/// Merges day assignments with resolved details. Unresolved UIDs and maps
/// whose medal thresholds are out of order are logged and counted as skipped.
pub fn resolve_month(
    year: i32,
    month: u32,
    days_listed: usize,
    assignments: &[DayAssignment],
    details: &HashMap<String, NadeoMapDetail>,
) -> MonthCatalog {
    let mut out = MonthCatalog {
        year,
        month,
        days_listed,
        ..Default::default()
    };

    for a in assignments {
        let Some(d) = details.get(&a.map_uid) else {
            warn!(map_uid = %a.map_uid, year, month, day = a.day, "catalog: map detail not returned; skipping");
            out.skipped += 1;
            continue;
        };
        let map = TotdMap {
            map_uid: a.map_uid.clone(),
            map_id: d.map_id.clone(),
            name: d.name.clone(),
            author_account_id: d.author.clone(),
            author_time: d.author_time,
            gold_time: d.gold_time,
            silver_time: d.silver_time,
            bronze_time: d.bronze_time,
            laps: d.nb_laps,
            thumbnail_url: d.thumbnail_url.clone(),
            download_url: d.download_url.clone(),
            year,
            month,
            day: a.day,
        };
        if !map.medals_are_ordered() {
            warn!(
                map_uid = %map.map_uid,
                author = map.author_time,
                gold = map.gold_time,
                silver = map.silver_time,
                bronze = map.bronze_time,
                "catalog: medal thresholds out of order; skipping"
            );
            out.skipped += 1;
            continue;
        }
        out.maps.push(map);
    }
    out
}

/// Decodes multi-detail elements one by one. Elements that fail to decode
/// are logged and dropped; their UIDs go through the single-detail fallback.
pub fn decode_details(raw: Vec<Value>) -> Vec<NadeoMapDetail> {
    raw.into_iter()
        .filter_map(|v| {
            let uid = v.get("uid").and_then(Value::as_str).unwrap_or("?").to_string();
            match serde_json::from_value::<NadeoMapDetail>(v) {
                Ok(d) => Some(d),
                Err(e) => {
                    warn!(map_uid = %uid, error = %e, "catalog: malformed map detail; dropping");
                    None
                }
            }
        })
        .collect()
}

pub struct CatalogFetcher<'a> {
    client: &'a NadeoClient,
}

impl<'a> CatalogFetcher<'a> {
    pub fn new(client: &'a NadeoClient) -> Self {
        Self { client }
    }

    pub async fn fetch_month(&self, months_back: u32) -> Result<MonthCatalog> {
        let listing: NadeoCampaignMonths =
            self.client.get_json(Api::Live, &month_path(months_back)).await?;
        let Some(month) = listing.month_list.into_iter().next() else {
            debug!(months_back, "catalog: no month listed");
            return Ok(MonthCatalog::default());
        };

        let assignments = month_assignments(&month);
        let uids: Vec<String> = assignments.iter().map(|a| a.map_uid.clone()).unique().collect();

        let mut details: HashMap<String, NadeoMapDetail> = HashMap::with_capacity(uids.len());
        for chunk in uids.chunks(MULTI_DETAIL_CHUNK) {
            let list: NadeoMapList =
                match self.client.get_json(Api::Live, &multi_detail_path(chunk)).await {
                    Ok(list) => list,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(uids = chunk.len(), error = %e, "catalog: multi-detail lookup failed; trying maps one by one");
                        continue;
                    }
                };
            details.extend(decode_details(list.map_list).into_iter().map(|d| (d.uid.clone(), d)));
        }

        // Anything multi-detail dropped or mangled is asked for on its own.
        let missing: Vec<String> = uids
            .iter()
            .filter(|u| !details.contains_key(u.as_str()))
            .cloned()
            .collect();
        for uid in missing {
            match self.client.get_json::<NadeoMapDetail>(Api::Live, &map_detail_path(&uid)).await {
                Ok(d) => {
                    details.insert(uid, d);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(map_uid = %uid, error = %e, "catalog: single map lookup failed"),
            }
        }

        let catalog = resolve_month(month.year, month.month, month.days.len(), &assignments, &details);
        info!(
            months_back,
            year = catalog.year,
            month = catalog.month,
            resolved = catalog.maps.len(),
            skipped = catalog.skipped,
            "catalog: month fetched"
        );
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nadeo::testing::{client_for, quick_config, StubServer};
    use serde_json::json;

    fn detail_json(uid: &str, at: i32) -> Value {
        json!({
            "uid": uid, "mapId": format!("id-{uid}"), "name": format!("Map {uid}"),
            "author": "author-acc", "authorTime": at, "goldTime": at + 1000,
            "silverTime": at + 3000, "bronzeTime": at + 6000, "nbLaps": 1
        })
    }

    fn month_json(uids: &[String]) -> String {
        let days: Vec<Value> = uids.iter().map(|u| json!({ "mapUid": u })).collect();
        json!({ "monthList": [{ "month": 3, "year": 2024, "days": days }] }).to_string()
    }

    fn requested_uids(path: &str) -> Vec<String> {
        path.split_once("mapUidList=")
            .map(|(_, list)| list.split(',').map(str::to_string).collect())
            .unwrap_or_default()
    }

    fn detail(uid: &str, at: i32) -> NadeoMapDetail {
        serde_json::from_value(json!({
            "uid": uid, "mapId": format!("id-{uid}"), "name": format!("Map {uid}"),
            "author": "author-acc", "authorTime": at, "goldTime": at + 1000,
            "silverTime": at + 3000, "bronzeTime": at + 6000, "nbLaps": 1
        }))
        .unwrap()
    }

    #[test]
    fn empty_future_days_are_filtered_and_month_is_tagged() {
        let listing: NadeoCampaignMonths = serde_json::from_value(json!({
            "monthList": [{"month": 3, "year": 2024, "days": [
                {"mapUid": "A"}, {"mapUid": ""}, {"mapUid": "B"}
            ]}]
        }))
        .unwrap();
        let month = &listing.month_list[0];
        let assignments = month_assignments(month);
        assert_eq!(assignments.len(), 2);
        assert_eq!(assignments[1].day, 3);

        let details: HashMap<_, _> = [("A", 15000), ("B", 42000)]
            .into_iter()
            .map(|(u, at)| (u.to_string(), detail(u, at)))
            .collect();
        let catalog = resolve_month(month.year, month.month, month.days.len(), &assignments, &details);

        assert_eq!(catalog.maps.len(), 2);
        assert_eq!(catalog.skipped, 0);
        assert!(catalog.maps.iter().all(|m| m.month == 3 && m.year == 2024));
        assert_eq!(catalog.maps[0].map_uid, "A");
        assert_eq!(catalog.maps[1].map_uid, "B");
    }

    #[test]
    fn explicit_month_day_wins_over_position() {
        let listing: NadeoCampaignMonths = serde_json::from_value(json!({
            "monthList": [{"month": 1, "year": 2023, "days": [
                {"monthDay": 7, "mapUid": "X"}
            ]}]
        }))
        .unwrap();
        let assignments = month_assignments(&listing.month_list[0]);
        assert_eq!(assignments, vec![DayAssignment { day: 7, map_uid: "X".into() }]);
    }

    #[test]
    fn unresolved_and_misordered_maps_are_skipped() {
        let assignments = vec![
            DayAssignment { day: 1, map_uid: "A".into() },
            DayAssignment { day: 2, map_uid: "GONE".into() },
            DayAssignment { day: 3, map_uid: "BAD".into() },
        ];
        let mut bad = detail("BAD", 20000);
        bad.gold_time = 19000;
        let details: HashMap<_, _> = [("A".to_string(), detail("A", 15000)), ("BAD".to_string(), bad)]
            .into_iter()
            .collect();

        let catalog = resolve_month(2024, 5, 3, &assignments, &details);
        assert_eq!(catalog.maps.len(), 1);
        assert_eq!(catalog.skipped, 2);
        assert!(!catalog.is_empty());
    }

    #[test]
    fn multi_detail_path_joins_uids_with_commas() {
        let path = multi_detail_path(&["A".to_string(), "B c".to_string()]);
        assert_eq!(path, "/api/token/map/get-multiple?mapUidList=A,B%20c");
        assert_eq!(
            month_path(2),
            "/api/token/campaign/month?length=1&offset=2&royal=false"
        );
    }

    #[test]
    fn decode_details_drops_only_malformed_elements() {
        let mut broken = detail_json("B", 20000);
        broken.as_object_mut().unwrap().remove("goldTime");
        let decoded = decode_details(vec![detail_json("A", 15000), broken]);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].uid, "A");
    }

    #[tokio::test]
    async fn malformed_detail_falls_back_to_single_lookup() {
        let server = StubServer::start(|path| {
            if path.starts_with("/api/token/campaign/month") {
                (200, month_json(&["A".to_string(), "B".to_string(), "C".to_string()]))
            } else if path.starts_with("/api/token/map/get-multiple") {
                let mut broken = detail_json("B", 20000);
                broken.as_object_mut().unwrap().remove("goldTime");
                let mut broken_c = detail_json("C", 30000);
                broken_c.as_object_mut().unwrap().remove("mapId");
                (200, json!({ "mapList": [detail_json("A", 15000), broken, broken_c] }).to_string())
            } else if path == "/api/token/map/B" {
                (200, detail_json("B", 20000).to_string())
            } else {
                (404, "{}".to_string())
            }
        })
        .await;
        let (client, _) = client_for(&server.base, quick_config());

        let catalog = CatalogFetcher::new(&client).fetch_month(0).await.unwrap();

        let uids: Vec<&str> = catalog.maps.iter().map(|m| m.map_uid.as_str()).collect();
        assert_eq!(uids, vec!["A", "B"]);
        assert_eq!(catalog.skipped, 1);
        assert!(server.paths().contains(&"/api/token/map/C".to_string()));
    }

    #[tokio::test]
    async fn failed_multi_detail_chunk_resolves_maps_one_by_one() {
        let server = StubServer::start(|path| {
            if path.starts_with("/api/token/campaign/month") {
                (200, month_json(&["A".to_string(), "B".to_string()]))
            } else if path.starts_with("/api/token/map/get-multiple") {
                (502, "{}".to_string())
            } else if let Some(uid) = path.strip_prefix("/api/token/map/") {
                (200, detail_json(uid, 15000).to_string())
            } else {
                (404, "{}".to_string())
            }
        })
        .await;
        let (client, _) = client_for(&server.base, quick_config());

        let catalog = CatalogFetcher::new(&client).fetch_month(0).await.unwrap();
        assert_eq!(catalog.maps.len(), 2);
        assert_eq!(catalog.skipped, 0);
    }

    #[tokio::test]
    async fn details_are_requested_in_chunks_of_one_hundred() {
        let uids: Vec<String> = (0..150).map(|i| format!("M{i:03}")).collect();
        let listing = month_json(&uids);
        let server = StubServer::start(move |path| {
            if path.starts_with("/api/token/campaign/month") {
                (200, listing.clone())
            } else if path.starts_with("/api/token/map/get-multiple") {
                // the multi endpoint silently omits M149
                let list: Vec<Value> = requested_uids(path)
                    .iter()
                    .filter(|u| u.as_str() != "M149")
                    .map(|u| detail_json(u, 15000))
                    .collect();
                (200, json!({ "mapList": list }).to_string())
            } else if path == "/api/token/map/M149" {
                (200, detail_json("M149", 15000).to_string())
            } else {
                (404, "{}".to_string())
            }
        })
        .await;
        let (client, _) = client_for(&server.base, quick_config());

        let catalog = CatalogFetcher::new(&client).fetch_month(0).await.unwrap();
        assert_eq!(catalog.maps.len(), 150);
        assert_eq!(catalog.skipped, 0);

        let multi: Vec<Vec<String>> = server
            .paths()
            .iter()
            .filter(|p| p.starts_with("/api/token/map/get-multiple"))
            .map(|p| requested_uids(p))
            .collect();
        assert_eq!(multi.len(), 2);
        assert_eq!(multi[0].len(), MULTI_DETAIL_CHUNK);
        assert_eq!(multi[1].len(), 50);
        assert!(server.paths().contains(&"/api/token/map/M149".to_string()));
    }
}
