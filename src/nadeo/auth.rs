//! Nadeo token acquisition and caching.
//!
//! Two credential flavours are supported and picked once at startup:
//! - Service account: Basic-auth exchange straight for a bearer token.
//! - Personal (Ubisoft) account: Basic-auth exchange for a Ubisoft session
//!   ticket, then ticket exchange for the bearer token. The ticket is cached
//!   on its own expiry, independently of the tokens minted from it.
//!
//! Tokens are cached per audience in a [`TokenCache`] owned by the caller and
//! handed to the client at construction. The cache lives for the process and
//! is empty after a restart.
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::models::{Audience, NadeoTokenResponse, UbiSessionResponse};
use crate::config::{Credentials, NadeoConfig};
use crate::error::{Result, SyncError};

/// Ubisoft application id used by Nadeo's own launcher for session tickets.
const UBI_APP_ID: &str = "86263886-327a-4328-ac69-527f0d20a237";
/// Refresh this long before the upstream expiry.
const REFRESH_MARGIN_SECS: i64 = 30;
const FALLBACK_TOKEN_TTL_MINS: i64 = 55;
const FALLBACK_TICKET_TTL_MINS: i64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Service,
    Personal,
}

/// Credential set the token manager exchanges, selected once from config.
#[derive(Debug, Clone)]
pub enum TokenSource {
    Service(Credentials),
    Personal(Credentials),
}

impl TokenSource {
    /// Personal credentials win when configured; service credentials otherwise.
    pub fn from_config(cfg: &NadeoConfig) -> Result<Self> {
        match (&cfg.personal, &cfg.service) {
            (Some(personal), _) => Ok(Self::Personal(personal.clone())),
            (None, Some(service)) => Ok(Self::Service(service.clone())),
            (None, None) => Err(SyncError::configuration(
                "no Nadeo credentials configured",
            )),
        }
    }

    pub fn mode(&self) -> AuthMode {
        match self {
            Self::Service(_) => AuthMode::Service,
            Self::Personal(_) => AuthMode::Personal,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct IssuedTicket {
    pub ticket: String,
    pub expires_at: DateTime<Utc>,
}

fn still_valid(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now + Duration::seconds(REFRESH_MARGIN_SECS) < expires_at
}

/// Upstream identity endpoints. Implemented over HTTP by [`HttpIdentity`].
#[async_trait]
pub trait IdentityExchange: Send + Sync {
    async fn basic_token(&self, creds: &Credentials, audience: Audience) -> Result<IssuedToken>;
    async fn ubi_ticket(&self, creds: &Credentials) -> Result<IssuedTicket>;
    async fn ticket_token(&self, ticket: &str, audience: Audience) -> Result<IssuedToken>;
}

#[derive(Default)]
pub struct TokenCache {
    tokens: Mutex<HashMap<Audience, IssuedToken>>,
    ticket: Mutex<Option<IssuedTicket>>,
}

impl TokenCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn cached_token(&self, audience: Audience) -> Option<String> {
        let guard = self.tokens.lock().await;
        guard
            .get(&audience)
            .filter(|t| still_valid(t.expires_at, Utc::now()))
            .map(|t| t.access_token.clone())
    }

    async fn cached_ticket(&self) -> Option<String> {
        let guard = self.ticket.lock().await;
        guard
            .as_ref()
            .filter(|t| still_valid(t.expires_at, Utc::now()))
            .map(|t| t.ticket.clone())
    }

    async fn clear_ticket(&self) {
        self.ticket.lock().await.take();
    }

    /// Drop the token for one audience (expiry or 401).
    pub async fn invalidate(&self, audience: Audience) {
        self.tokens.lock().await.remove(&audience);
    }
}

pub struct TokenManager {
    source: TokenSource,
    exchange: Arc<dyn IdentityExchange>,
    cache: Arc<TokenCache>,
}

impl TokenManager {
    pub fn new(
        source: TokenSource,
        exchange: Arc<dyn IdentityExchange>,
        cache: Arc<TokenCache>,
    ) -> Self {
        Self {
            source,
            exchange,
            cache,
        }
    }

    pub fn mode(&self) -> AuthMode {
        self.source.mode()
    }

    /// Bearer token for `audience`, exchanging only when the cached one is stale.
    pub async fn get_token(&self, audience: Audience) -> Result<String> {
        if let Some(token) = self.cache.cached_token(audience).await {
            return Ok(token);
        }
        let issued = match &self.source {
            TokenSource::Service(creds) => self.exchange.basic_token(creds, audience).await?,
            TokenSource::Personal(creds) => {
                let ticket = self.ticket(creds).await?;
                match self.exchange.ticket_token(&ticket, audience).await {
                    Ok(issued) => issued,
                    Err(e @ SyncError::Authentication(_)) => {
                        // rejected ticket must not outlive this attempt
                        self.cache.clear_ticket().await;
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                }
            }
        };
        info!(
            audience = audience.as_str(),
            mode = ?self.mode(),
            expires_at = %issued.expires_at,
            "nadeo: access token issued"
        );
        let token = issued.access_token.clone();
        self.cache.tokens.lock().await.insert(audience, issued);
        Ok(token)
    }

    async fn ticket(&self, creds: &Credentials) -> Result<String> {
        if let Some(ticket) = self.cache.cached_ticket().await {
            return Ok(ticket);
        }
        let issued = self.exchange.ubi_ticket(creds).await?;
        debug!(expires_at = %issued.expires_at, "nadeo: ubisoft ticket issued");
        let ticket = issued.ticket.clone();
        *self.cache.ticket.lock().await = Some(issued);
        Ok(ticket)
    }

    pub async fn invalidate(&self, audience: Audience) {
        self.cache.invalidate(audience).await;
    }
}

/// Reads the `exp` claim without verifying the signature; the token is only
/// inspected for scheduling a refresh.
pub(crate) fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    #[derive(Deserialize)]
    struct Claims {
        exp: i64,
    }
    let mut validation = Validation::new(Algorithm::RS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    let data =
        jsonwebtoken::decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation).ok()?;
    DateTime::from_timestamp(data.claims.exp, 0)
}

fn token_from_response(resp: NadeoTokenResponse) -> IssuedToken {
    let expires_at = jwt_expiry(&resp.access_token).unwrap_or_else(|| {
        warn!("nadeo: access token carries no readable exp claim; assuming fallback ttl");
        Utc::now() + Duration::minutes(FALLBACK_TOKEN_TTL_MINS)
    });
    IssuedToken {
        access_token: resp.access_token,
        expires_at,
    }
}

fn ticket_from_response(resp: UbiSessionResponse) -> IssuedTicket {
    let expires_at = resp
        .expiration
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc::now() + Duration::minutes(FALLBACK_TICKET_TTL_MINS));
    IssuedTicket {
        ticket: resp.ticket,
        expires_at,
    }
}

/// HTTP implementation of the identity endpoints.
pub struct HttpIdentity {
    http: Client,
    core_base: String,
    ubi_base: String,
}

impl HttpIdentity {
    pub fn new(http: Client, cfg: &NadeoConfig) -> Self {
        Self {
            http,
            core_base: cfg.core_base.clone(),
            ubi_base: cfg.ubi_base.clone(),
        }
    }

    async fn read_token(resp: reqwest::Response, what: &str) -> Result<IssuedToken> {
        let status = resp.status();
        if !status.is_success() {
            return Err(SyncError::authentication(format!(
                "{what} rejected (status={status})"
            )));
        }
        let body: NadeoTokenResponse = resp.json().await?;
        Ok(token_from_response(body))
    }
}

#[async_trait]
impl IdentityExchange for HttpIdentity {
    async fn basic_token(&self, creds: &Credentials, audience: Audience) -> Result<IssuedToken> {
        let url = format!("{}/v2/authentication/token/basic", self.core_base);
        let resp = self
            .http
            .post(&url)
            .basic_auth(&creds.login, Some(&creds.password))
            .json(&json!({ "audience": audience.as_str() }))
            .send()
            .await?;
        Self::read_token(resp, "service token exchange").await
    }

    async fn ubi_ticket(&self, creds: &Credentials) -> Result<IssuedTicket> {
        let url = format!("{}/v3/profiles/sessions", self.ubi_base);
        let resp = self
            .http
            .post(&url)
            .basic_auth(&creds.login, Some(&creds.password))
            .header("Ubi-AppId", UBI_APP_ID)
            .json(&json!({}))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SyncError::authentication(format!(
                "ubisoft ticket exchange rejected (status={status})"
            )));
        }
        let body: UbiSessionResponse = resp.json().await?;
        Ok(ticket_from_response(body))
    }

    async fn ticket_token(&self, ticket: &str, audience: Audience) -> Result<IssuedToken> {
        let url = format!("{}/v2/authentication/token/ubiservices", self.core_base);
        let resp = self
            .http
            .post(&url)
            .header("Authorization", format!("ubi_v1 t={ticket}"))
            .json(&json!({ "audience": audience.as_str() }))
            .send()
            .await?;
        Self::read_token(resp, "ticket token exchange").await
    }
}
