//! Trackmania live/core services: authentication, paced requests, catalog
//! and leaderboard reads.

pub mod auth;
pub mod catalog;
pub mod client;
pub mod leaderboard;
pub mod models;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;

use crate::config::NadeoConfig;
use crate::error::Result;
use crate::model::Entry;
use crate::sync_engine::TotdUpstream;

pub use auth::{AuthMode, TokenCache, TokenManager, TokenSource};
pub use catalog::{CatalogFetcher, MonthCatalog};
pub use client::{Api, NadeoClient};
pub use leaderboard::LeaderboardCrawler;

/// Live upstream for the sync engine.
pub struct NadeoUpstream {
    client: NadeoClient,
    records_batch: usize,
}

impl NadeoUpstream {
    pub fn new(client: NadeoClient, records_batch: usize) -> Self {
        Self {
            client,
            records_batch,
        }
    }

    pub fn from_config(cfg: &NadeoConfig, records_batch: usize) -> Result<Self> {
        let client = NadeoClient::from_config(cfg, TokenCache::new())?;
        Ok(Self::new(client, records_batch))
    }

    pub fn auth_mode(&self) -> AuthMode {
        self.client.tokens().mode()
    }

    fn crawler(&self) -> LeaderboardCrawler<'_> {
        LeaderboardCrawler::new(&self.client, self.records_batch)
    }
}

#[async_trait]
impl TotdUpstream for NadeoUpstream {
    async fn fetch_month(&self, months_back: u32) -> Result<MonthCatalog> {
        CatalogFetcher::new(&self.client).fetch_month(months_back).await
    }

    async fn count_achievers(&self, map_uid: &str, author_time: i32) -> Result<i32> {
        self.crawler().count_achievers(map_uid, author_time).await
    }

    async fn crawl_achievers(
        &self,
        map_uid: &str,
        author_time: i32,
        achiever_count: i32,
        cap: u32,
    ) -> Result<Vec<Entry>> {
        self.crawler()
            .crawl_achievers(map_uid, author_time, achiever_count, cap)
            .await
    }

    async fn records_for_players(
        &self,
        map_uid: &str,
        map_id: &str,
        author_time: i32,
        account_ids: &[String],
    ) -> Result<Vec<Entry>> {
        self.crawler()
            .records_for_players(map_uid, map_id, author_time, account_ids)
            .await
    }
}
