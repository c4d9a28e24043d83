use std::fmt;

use crate::error::{Result, SyncError};
use crate::util::env::env_opt;

pub const DEFAULT_LIVE_API_BASE: &str = "https://live-services.trackmania.nadeo.live";
pub const DEFAULT_CORE_API_BASE: &str = "https://prod.trackmania.core.nadeo.online";
pub const DEFAULT_UBI_API_BASE: &str = "https://public-ubiservices.ubi.com";

/// Login/password pair for one account.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct NadeoConfig {
    pub service: Option<Credentials>,
    pub personal: Option<Credentials>,
    pub user_agent: Option<String>,
    pub live_base: String,
    pub core_base: String,
    pub ubi_base: String,
    pub request_delay_ms: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub http_timeout_secs: u64,
}

impl Default for NadeoConfig {
    fn default() -> Self {
        Self {
            service: None,
            personal: None,
            user_agent: None,
            live_base: DEFAULT_LIVE_API_BASE.to_string(),
            core_base: DEFAULT_CORE_API_BASE.to_string(),
            ubi_base: DEFAULT_UBI_API_BASE.to_string(),
            request_delay_ms: 1500,
            max_retries: 0,
            backoff_ms: 2000,
            http_timeout_secs: 30,
        }
    }
}

impl NadeoConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(env_opt)
    }

    /// Builds the config from any key lookup. Blank values must be reported as `None`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        cfg.service = credentials_pair(&lookup, "NADEO_SERVER_USERNAME", "NADEO_SERVER_PASSWORD")?;
        cfg.personal = credentials_pair(&lookup, "NADEO_UBI_EMAIL", "NADEO_UBI_PASSWORD")?;
        cfg.user_agent = lookup("NADEO_USER_AGENT").map(|s| s.trim().to_string());
        if let Some(v) = lookup("NADEO_LIVE_API_BASE") {
            cfg.live_base = normalize_base(&v);
        }
        if let Some(v) = lookup("NADEO_CORE_API_BASE") {
            cfg.core_base = normalize_base(&v);
        }
        if let Some(v) = lookup("NADEO_UBI_API_BASE") {
            cfg.ubi_base = normalize_base(&v);
        }
        if let Some(n) = lookup("NADEO_REQUEST_DELAY_MS").and_then(|v| v.trim().parse().ok()) {
            cfg.request_delay_ms = n;
        }
        if let Some(n) = lookup("NADEO_MAX_RETRIES").and_then(|v| v.trim().parse().ok()) {
            cfg.max_retries = n;
        }
        if let Some(n) = lookup("NADEO_BACKOFF_MS").and_then(|v| v.trim().parse().ok()) {
            cfg.backoff_ms = n;
        }
        if let Some(n) = lookup("NADEO_HTTP_TIMEOUT_SECS").and_then(|v| v.trim().parse::<u64>().ok())
        {
            cfg.http_timeout_secs = n.max(1);
        }
        Ok(cfg)
    }

    /// Startup validation. Nothing touches the network or storage before this passes.
    pub fn validate(&self) -> Result<()> {
        if self.user_agent.as_deref().map_or(true, str::is_empty) {
            return Err(SyncError::configuration(
                "NADEO_USER_AGENT is required (client name and contact information)",
            ));
        }
        if self.service.is_none() && self.personal.is_none() {
            return Err(SyncError::configuration(
                "no credentials configured; set NADEO_SERVER_USERNAME/NADEO_SERVER_PASSWORD \
                 or NADEO_UBI_EMAIL/NADEO_UBI_PASSWORD",
            ));
        }
        Ok(())
    }
}

fn credentials_pair<F>(lookup: &F, login_key: &str, password_key: &str) -> Result<Option<Credentials>>
where
    F: Fn(&str) -> Option<String>,
{
    match (lookup(login_key), lookup(password_key)) {
        (Some(login), Some(password)) => Ok(Some(Credentials {
            login: login.trim().to_string(),
            password,
        })),
        (None, None) => Ok(None),
        (Some(_), None) => Err(SyncError::configuration(format!(
            "{login_key} is set but {password_key} is missing"
        ))),
        (None, Some(_)) => Err(SyncError::configuration(format!(
            "{password_key} is set but {login_key} is missing"
        ))),
    }
}

fn normalize_base(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_string()
}

/// Knobs for the sync engine's batch sweeps.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub months_back: u32,
    pub empty_month_streak: u32,
    pub refresh_limit: i64,
    pub max_records_per_map: u32,
    pub recheck_batch: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            months_back: 100,
            empty_month_streak: 3,
            refresh_limit: 1000,
            max_records_per_map: 10_000,
            recheck_batch: 50,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        use crate::util::env::env_parse;
        let defaults = Self::default();
        Self {
            months_back: env_parse("TOTD_MONTHS_BACK", defaults.months_back),
            empty_month_streak: env_parse("TOTD_EMPTY_MONTH_STREAK", defaults.empty_month_streak)
                .max(1),
            refresh_limit: env_parse("TOTD_REFRESH_LIMIT", defaults.refresh_limit).max(1),
            max_records_per_map: env_parse(
                "TOTD_MAX_RECORDS_PER_MAP",
                defaults.max_records_per_map,
            ),
            recheck_batch: env_parse("TOTD_RECHECK_BATCH", defaults.recheck_batch).clamp(1, 200),
        }
    }
}
