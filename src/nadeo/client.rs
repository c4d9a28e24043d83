use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use super::auth::{HttpIdentity, TokenCache, TokenManager, TokenSource};
use super::models::Audience;
use crate::config::NadeoConfig;
use crate::error::{Result, SyncError};

/// Which upstream host a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Api {
    Live,
    Core,
}

impl Api {
    fn audience(self) -> Audience {
        match self {
            Self::Live => Audience::Live,
            Self::Core => Audience::Core,
        }
    }
}

/// Holds back the next request until a fixed delay has passed since the
/// previous one completed, successful or not.
pub struct RequestPacer {
    interval: Duration,
    next_allowed: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_allowed: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let next_allowed = *self.next_allowed.lock().await;
        if let Some(at) = next_allowed {
            let now = Instant::now();
            if at > now {
                sleep(at - now).await;
            }
        }
    }

    pub async fn completed(&self) {
        *self.next_allowed.lock().await = Some(Instant::now() + self.interval);
    }
}

/// Upper bound for a single retry wait.
const MAX_BACKOFF_MS: u64 = 60_000;

/// Exponential backoff: `base`, `2*base`, `4*base`, ... capped at [`MAX_BACKOFF_MS`].
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64 << attempt.min(20);
    Duration::from_millis(base_ms.saturating_mul(factor).min(MAX_BACKOFF_MS))
}

enum Fetched {
    Body(Value),
    Unauthorized,
    Status(StatusCode),
}

/// Single choke point for every authenticated upstream GET.
pub struct NadeoClient {
    http: Client,
    tokens: TokenManager,
    live_base: String,
    core_base: String,
    pacer: RequestPacer,
    max_retries: u32,
    backoff_ms: u64,
}

impl NadeoClient {
    /// Validates config, selects the token source and builds the HTTP stack.
    pub fn from_config(cfg: &NadeoConfig, cache: Arc<TokenCache>) -> Result<Self> {
        cfg.validate()?;
        let user_agent = cfg
            .user_agent
            .clone()
            .ok_or_else(|| SyncError::configuration("NADEO_USER_AGENT is required"))?;
        let http = Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(cfg.http_timeout_secs))
            .build()?;
        let source = TokenSource::from_config(cfg)?;
        let identity = Arc::new(HttpIdentity::new(http.clone(), cfg));
        let tokens = TokenManager::new(source, identity, cache);
        Ok(Self::new(http, tokens, cfg))
    }

    pub fn new(http: Client, tokens: TokenManager, cfg: &NadeoConfig) -> Self {
        Self {
            http,
            tokens,
            live_base: cfg.live_base.clone(),
            core_base: cfg.core_base.clone(),
            pacer: RequestPacer::new(Duration::from_millis(cfg.request_delay_ms)),
            max_retries: cfg.max_retries,
            backoff_ms: cfg.backoff_ms,
        }
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    fn url(&self, api: Api, path: &str) -> String {
        let base = match api {
            Api::Live => &self.live_base,
            Api::Core => &self.core_base,
        };
        format!("{base}{path}")
    }

    /// GET `path` and return the JSON body. With `NADEO_MAX_RETRIES=0` (the
    /// default) a failure is returned as-is and the caller skips the unit.
    pub async fn request(&self, api: Api, path: &str) -> Result<Value> {
        let mut attempt = 0u32;
        loop {
            match self.send_once(api, path).await {
                Ok(body) => return Ok(body),
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    let wait = backoff_delay(self.backoff_ms, attempt);
                    warn!(path, attempt, wait_ms = wait.as_millis() as u64, error = %err, "nadeo: transient failure; backing off");
                    sleep(wait).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn get_json<T>(&self, api: Api, path: &str) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let body = self.request(api, path).await?;
        serde_json::from_value(body).map_err(|e| SyncError::decode(format!("{path}: {e}")))
    }

    async fn send_once(&self, api: Api, path: &str) -> Result<Value> {
        let audience = api.audience();
        let mut refreshed = false;
        loop {
            let token = self.tokens.get_token(audience).await?;
            self.pacer.wait().await;
            let fetched = self.fetch(&self.url(api, path), &token).await;
            self.pacer.completed().await;

            match fetched? {
                Fetched::Body(body) => {
                    debug!(path, "nadeo: request ok");
                    return Ok(body);
                }
                Fetched::Unauthorized => {
                    self.tokens.invalidate(audience).await;
                    if refreshed {
                        return Err(SyncError::authentication(format!(
                            "fresh token rejected by {path}"
                        )));
                    }
                    warn!(path, "nadeo: token rejected; re-authenticating once");
                    refreshed = true;
                }
                Fetched::Status(status) => {
                    return Err(SyncError::UpstreamApi {
                        status: status.as_u16(),
                        path: path.to_string(),
                    });
                }
            }
        }
    }

    async fn fetch(&self, url: &str, token: &str) -> Result<Fetched> {
        let resp = self
            .http
            .get(url)
            .header(AUTHORIZATION, format!("nadeo_v1 t={token}"))
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Ok(Fetched::Unauthorized);
        }
        if !status.is_success() {
            return Ok(Fetched::Status(status));
        }
        Ok(Fetched::Body(resp.json::<Value>().await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nadeo::testing::{client_for, quick_config, StubServer};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn pacer_delays_request_after_completion() {
        let delay = Duration::from_millis(60);
        let pacer = RequestPacer::new(delay);

        // Nothing has completed yet, so the first call goes straight through.
        let start = Instant::now();
        pacer.wait().await;
        assert!(start.elapsed() < delay);

        pacer.completed().await;
        let start = Instant::now();
        pacer.wait().await;
        let elapsed = start.elapsed();
        assert!(
            elapsed >= delay - Duration::from_millis(5),
            "expected wait of about {:?}, but got {:?}",
            delay,
            elapsed
        );
    }

    #[tokio::test]
    async fn zero_delay_never_sleeps() {
        let pacer = RequestPacer::new(Duration::ZERO);
        pacer.completed().await;
        let start = Instant::now();
        pacer.wait().await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn from_config_refuses_missing_user_agent() {
        let cfg = NadeoConfig {
            service: Some(crate::config::Credentials {
                login: "svc".into(),
                password: "pw".into(),
            }),
            ..Default::default()
        };
        let err = match NadeoClient::from_config(&cfg, TokenCache::new()) {
            Ok(_) => panic!("client must not build without a user agent"),
            Err(e) => e,
        };
        assert!(matches!(err, SyncError::Configuration(_)));
    }

    #[test]
    fn backoff_doubles_and_is_capped() {
        assert_eq!(backoff_delay(2000, 0), Duration::from_millis(2000));
        assert_eq!(backoff_delay(2000, 1), Duration::from_millis(4000));
        assert_eq!(backoff_delay(2000, 2), Duration::from_millis(8000));
        assert_eq!(backoff_delay(2000, 10), Duration::from_millis(MAX_BACKOFF_MS));
        assert_eq!(backoff_delay(u64::MAX, 40), Duration::from_millis(MAX_BACKOFF_MS));
    }

    #[tokio::test]
    async fn non_success_status_becomes_upstream_api_error() {
        let server = StubServer::start(|_| (404, r#"{"error":"nope"}"#.to_string())).await;
        let (client, _) = client_for(&server.base, quick_config());

        let err = client.request(Api::Live, "/api/token/map/X").await.unwrap_err();
        match err {
            SyncError::UpstreamApi { status, path } => {
                assert_eq!(status, 404);
                assert_eq!(path, "/api/token/map/X");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!SyncError::UpstreamApi { status: 404, path: String::new() }.is_fatal());
    }

    #[tokio::test]
    async fn requests_carry_nadeo_token_header() {
        let server = StubServer::start(|_| (200, r#"{"ok":true}"#.to_string())).await;
        let (client, exchange) = client_for(&server.base, quick_config());

        let body = client.request(Api::Core, "/v2/ping").await.unwrap();
        assert_eq!(body["ok"], true);
        client.request(Api::Core, "/v2/ping").await.unwrap();

        let hits = server.hits();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].authorization.as_deref(), Some("nadeo_v1 t=token-0"));
        assert_eq!(hits[1].authorization.as_deref(), Some("nadeo_v1 t=token-0"));
        assert_eq!(exchange.issued.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unauthorized_reauthenticates_once_and_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let server = StubServer::start(move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                (401, "{}".to_string())
            } else {
                (200, r#"{"ok":true}"#.to_string())
            }
        })
        .await;
        let (client, exchange) = client_for(&server.base, quick_config());

        client.request(Api::Live, "/api/token/map/A").await.unwrap();

        let hits = server.hits();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].authorization.as_deref(), Some("nadeo_v1 t=token-0"));
        assert_eq!(hits[1].authorization.as_deref(), Some("nadeo_v1 t=token-1"));
        assert_eq!(exchange.issued.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_unauthorized_is_an_authentication_error() {
        let server = StubServer::start(|_| (401, "{}".to_string())).await;
        let (client, exchange) = client_for(&server.base, quick_config());

        let err = client.request(Api::Live, "/api/token/map/A").await.unwrap_err();
        assert!(matches!(err, SyncError::Authentication(_)));
        assert!(err.is_fatal());
        assert_eq!(server.hits().len(), 2);
        assert_eq!(exchange.issued.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn pacing_applies_after_a_failed_request() {
        let delay = Duration::from_millis(80);
        let server = StubServer::start(|path| {
            if path.ends_with("/fail") {
                (500, "{}".to_string())
            } else {
                (200, "{}".to_string())
            }
        })
        .await;
        let cfg = NadeoConfig {
            request_delay_ms: delay.as_millis() as u64,
            ..quick_config()
        };
        let (client, _) = client_for(&server.base, cfg);

        assert!(client.request(Api::Live, "/fail").await.is_err());
        client.request(Api::Live, "/ok").await.unwrap();

        let hits = server.hits();
        assert_eq!(hits.len(), 2);
        let gap = hits[1].at.duration_since(hits[0].at);
        assert!(gap >= delay - Duration::from_millis(5), "gap was {gap:?}");
    }

    #[tokio::test]
    async fn transient_failures_are_retried_when_enabled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let server = StubServer::start(move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                (503, "{}".to_string())
            } else {
                (200, r#"{"ok":true}"#.to_string())
            }
        })
        .await;
        let cfg = NadeoConfig {
            max_retries: 2,
            ..quick_config()
        };
        let (client, _) = client_for(&server.base, cfg);

        client.request(Api::Live, "/api/token/map/A").await.unwrap();
        assert_eq!(server.hits().len(), 3);
    }
}
