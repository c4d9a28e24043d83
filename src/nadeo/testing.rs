//! Loopback HTTP stub and client wiring for exercising the Nadeo readers
//! end to end in tests.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::Client;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::Instant;

use super::auth::{IdentityExchange, IssuedTicket, IssuedToken, TokenCache, TokenManager, TokenSource};
use super::client::NadeoClient;
use super::models::Audience;
use crate::config::{Credentials, NadeoConfig};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct Hit {
    /// Path plus query string.
    pub path: String,
    pub authorization: Option<String>,
    pub at: Instant,
}

/// Answers every GET with whatever the handler returns for its path.
pub struct StubServer {
    pub base: String,
    hits: Arc<Mutex<Vec<Hit>>>,
}

impl StubServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&str) -> (u16, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(handler);

        let log = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let handler = handler.clone();
                let log = log.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        match sock.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let head = String::from_utf8_lossy(&buf).to_string();
                    let path = head.split_whitespace().nth(1).unwrap_or("").to_string();
                    let authorization = head.lines().find_map(|l| {
                        let (k, v) = l.split_once(':')?;
                        k.eq_ignore_ascii_case("authorization")
                            .then(|| v.trim().to_string())
                    });
                    log.lock().unwrap().push(Hit {
                        path: path.clone(),
                        authorization,
                        at: Instant::now(),
                    });

                    let (status, body) = (*handler)(&path);
                    let resp = format!(
                        "HTTP/1.1 {status} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = sock.write_all(resp.as_bytes()).await;
                    let _ = sock.shutdown().await;
                });
            }
        });

        Self {
            base: format!("http://{addr}"),
            hits,
        }
    }

    pub fn hits(&self) -> Vec<Hit> {
        self.hits.lock().unwrap().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.hits().into_iter().map(|h| h.path).collect()
    }
}

/// Integer value of `key` in a request path's query string.
pub fn query_u32(path: &str, key: &str) -> Option<u32> {
    let query = path.split_once('?')?.1;
    query
        .split('&')
        .find_map(|kv| kv.strip_prefix(key)?.strip_prefix('='))
        .and_then(|v| v.parse().ok())
}

/// Hands out `token-0`, `token-1`, ... each valid for an hour.
#[derive(Default)]
pub struct SequentialExchange {
    pub issued: AtomicUsize,
}

impl SequentialExchange {
    fn next(&self) -> IssuedToken {
        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        IssuedToken {
            access_token: format!("token-{n}"),
            expires_at: Utc::now() + Duration::hours(1),
        }
    }
}

#[async_trait]
impl IdentityExchange for SequentialExchange {
    async fn basic_token(&self, _: &Credentials, _: Audience) -> Result<IssuedToken> {
        Ok(self.next())
    }

    async fn ubi_ticket(&self, _: &Credentials) -> Result<IssuedTicket> {
        Ok(IssuedTicket {
            ticket: "ticket".into(),
            expires_at: Utc::now() + Duration::hours(2),
        })
    }

    async fn ticket_token(&self, _: &str, _: Audience) -> Result<IssuedToken> {
        Ok(self.next())
    }
}

/// Client pointed at `base` for both live and core services, service-account auth.
pub fn client_for(base: &str, cfg: NadeoConfig) -> (NadeoClient, Arc<SequentialExchange>) {
    let exchange = Arc::new(SequentialExchange::default());
    let creds = Credentials {
        login: "svc".into(),
        password: "pw".into(),
    };
    let tokens = TokenManager::new(TokenSource::Service(creds), exchange.clone(), TokenCache::new());
    let cfg = NadeoConfig {
        live_base: base.to_string(),
        core_base: base.to_string(),
        ..cfg
    };
    (NadeoClient::new(Client::new(), tokens, &cfg), exchange)
}

/// No pacing and no retries unless a test asks for them.
pub fn quick_config() -> NadeoConfig {
    NadeoConfig {
        request_delay_ms: 0,
        max_retries: 0,
        backoff_ms: 1,
        ..Default::default()
    }
}
