// ---------- Nadeo API Shapes (minimal) ----------
// Only the fields the pipeline inspects are modeled; everything else is ignored.
// Optional/defaulted fields reflect omissions seen in upstream responses.

use serde::Deserialize;

/// Token audience requested from the identity service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Audience {
    /// Live services: campaigns, map info, leaderboards.
    Live,
    /// Core services: map records by account.
    Core,
}

impl Audience {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "NadeoLiveServices",
            Self::Core => "NadeoServices",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NadeoTokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UbiSessionResponse {
    pub ticket: String,
    pub expiration: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NadeoCampaignMonths {
    #[serde(default)]
    pub month_list: Vec<NadeoCampaignMonth>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NadeoCampaignMonth {
    pub year: i32,
    pub month: u32,
    #[serde(default)]
    pub days: Vec<NadeoCampaignDay>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NadeoCampaignDay {
    pub month_day: Option<u32>,
    #[serde(default)]
    pub map_uid: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NadeoMapList {
    /// Kept raw so one malformed element does not sink the whole chunk.
    #[serde(default)]
    pub map_list: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NadeoMapDetail {
    pub uid: String,
    pub map_id: String,
    pub name: String,
    pub author: String,
    pub author_time: i32,
    pub gold_time: i32,
    pub silver_time: i32,
    pub bronze_time: i32,
    #[serde(default = "default_laps")]
    pub nb_laps: i32,
    pub thumbnail_url: Option<String>,
    pub download_url: Option<String>,
}

fn default_laps() -> i32 {
    1
}

#[derive(Debug, Default, Deserialize)]
pub struct NadeoLeaderboard {
    #[serde(default)]
    pub tops: Vec<NadeoZoneTop>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NadeoZoneTop {
    #[serde(default)]
    pub top: Vec<NadeoLeaderboardRow>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NadeoLeaderboardRow {
    pub account_id: Option<String>,
    pub position: i32,
    pub score: Option<i32>,
    /// Epoch seconds.
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NadeoMapRecord {
    pub account_id: String,
    pub record_score: NadeoRecordScore,
    /// RFC 3339.
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NadeoRecordScore {
    pub time: i32,
}
