//! HTTP fetch seam between the poll engine and the backing store.
//!
//! The engine only ever needs "GET this URL, give me the body and one
//! response header, tell me success or failure". Everything else about
//! the transport (connections, TLS, redirects) stays behind this trait.

use std::time::Duration;

use async_trait::async_trait;

use super::error::WatchError;

/// Response header carrying the store's current index, consulted on the
/// first successful full fetch to seed the wait index.
pub const ETCD_INDEX_HEADER: &str = "X-Etcd-Index";

/// Body plus the one response header the engine cares about.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub body: String,
    pub etcd_index: Option<u64>,
}

/// Minimal GET transport.
///
/// Production uses [`HttpFetcher`]; tests substitute scripted
/// implementations.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn get(&self, url: &str) -> Result<FetchResponse, WatchError>;
}

/// reqwest-backed fetcher with a per-request timeout.
///
/// The timeout bounds long polls too: a request that outlives it is a
/// transport failure and goes through the engine's backoff.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(request_timeout: Duration) -> Result<Self, WatchError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| WatchError::InitFailed {
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn get(&self, url: &str) -> Result<FetchResponse, WatchError> {
        let transport = |e: reqwest::Error| WatchError::Transport {
            url: url.to_string(),
            reason: e.to_string(),
        };

        let response = self.client.get(url).send().await.map_err(transport)?;
        let etcd_index = response
            .headers()
            .get(ETCD_INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let status = response.status();
        let body = response.text().await.map_err(transport)?;

        if !status.is_success() {
            return Err(WatchError::Transport {
                url: url.to_string(),
                reason: format!("status {status}"),
            });
        }

        Ok(FetchResponse { body, etcd_index })
    }
}
