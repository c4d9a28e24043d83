//! Domain records shared by the fetchers, the sync engine and storage.

use chrono::{DateTime, Utc};

/// Reserved player row that stands in for map authors missing from storage.
pub const UNKNOWN_AUTHOR_ID: &str = "00000000-0000-0000-0000-000000000000";
pub const UNKNOWN_AUTHOR_NAME: &str = "Unknown author";
/// Display name given to players created lazily from leaderboard payloads.
pub const UNKNOWN_DISPLAY_NAME: &str = "Unknown";

/// A Track of the Day map as resolved from the catalog, tagged with its day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TotdMap {
    pub map_uid: String,
    pub map_id: String,
    pub name: String,
    pub author_account_id: String,
    pub author_time: i32,
    pub gold_time: i32,
    pub silver_time: i32,
    pub bronze_time: i32,
    pub laps: i32,
    pub thumbnail_url: Option<String>,
    pub download_url: Option<String>,
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl TotdMap {
    /// author <= gold <= silver <= bronze
    pub fn medals_are_ordered(&self) -> bool {
        self.author_time <= self.gold_time
            && self.gold_time <= self.silver_time
            && self.silver_time <= self.bronze_time
    }
}

/// A map row as held in storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMap {
    pub map_uid: String,
    pub map_id: String,
    pub name: String,
    pub author: String,
    pub author_time: i32,
    pub gold_time: i32,
    pub silver_time: i32,
    pub bronze_time: i32,
    pub laps: i32,
    pub thumbnail_url: Option<String>,
    pub download_url: Option<String>,
    pub year: i32,
    pub month: i32,
    pub day: i32,
    pub at_count: i32,
    pub last_leaderboard_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Player {
    pub account_id: String,
    pub display_name: String,
    pub at_count: i32,
}

impl Player {
    /// Bare row used to satisfy foreign references before entries are written.
    pub fn bare(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            display_name: UNKNOWN_DISPLAY_NAME.to_string(),
            at_count: 0,
        }
    }
}

/// One player's result on one map. `rank` is `None` when the source
/// endpoint does not report a leaderboard position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub map_uid: String,
    pub player_id: String,
    pub time: i32,
    pub rank: Option<i32>,
    pub recorded_at: DateTime<Utc>,
    pub is_at: bool,
}

impl Entry {
    pub fn new(
        map_uid: impl Into<String>,
        player_id: impl Into<String>,
        time: i32,
        rank: Option<i32>,
        recorded_at: DateTime<Utc>,
        author_time: i32,
    ) -> Self {
        Self {
            map_uid: map_uid.into(),
            player_id: player_id.into(),
            time,
            rank,
            recorded_at,
            is_at: time <= author_time,
        }
    }
}
