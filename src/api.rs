// API client: builds catalog requests, consults the response cache, takes a
// rate-limiter permit per network attempt, retries transient failures with
// doubling backoff, and validates every response shape before anything is
// cached. The transport sits behind a trait so tests script responses
// instead of hitting the network.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::AUTHORIZATION;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::ResponseCache;
use crate::error::CatalogError;
use crate::limiter::{AcquireMode, RateLimiter};
use crate::query::{CatalogQuery, CatalogResult};

/// Cooperative cancellation flag, set from the SIGINT handler and polled by
/// the client between attempts. Cloning shares the flag.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Read and clear in one step.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// A raw response as the transport saw it, before any validation.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// Transport-level failure: connect error, timeout, broken stream. Always
/// transient-class; protocol-level errors arrive as `HttpResponse` statuses.
#[derive(Debug, Clone)]
pub struct TransportError(pub String);

pub trait Transport: Send + Sync {
    fn get(
        &self,
        url: &str,
        params: &[(String, String)],
        token: Option<&str>,
    ) -> Result<HttpResponse, TransportError>;
}

/// Production transport over a blocking reqwest client.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("cratedig/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(HttpTransport { client })
    }
}

impl Transport for HttpTransport {
    fn get(
        &self,
        url: &str,
        params: &[(String, String)],
        token: Option<&str>,
    ) -> Result<HttpResponse, TransportError> {
        let mut req = self.client.get(url).query(params);
        if let Some(token) = token {
            req = req.header(AUTHORIZATION, format!("Discogs token={token}"));
        }
        let resp = req.send().map_err(|e| {
            if e.is_timeout() {
                TransportError("request timed out".into())
            } else {
                TransportError(e.to_string())
            }
        })?;

        let status = resp.status().as_u16();
        let mut headers = BTreeMap::new();
        for (name, value) in resp.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
            }
        }
        let body = resp.text().map_err(|e| TransportError(e.to_string()))?;
        Ok(HttpResponse { status, headers, body })
    }
}

/// Everything the client needs at construction. Passed in explicitly so
/// tests can build isolated clients; there is no process-wide singleton.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            base_url: "https://api.discogs.com".into(),
            token: None,
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
            timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    /// Read base URL and credentials from the environment
    /// (`CRATEDIG_API_URL`, `DISCOGS_TOKEN`).
    pub fn from_env() -> Self {
        let mut config = ClientConfig::default();
        if let Ok(url) = std::env::var("CRATEDIG_API_URL") {
            config.base_url = url.trim_end_matches('/').to_string();
        }
        config.token = std::env::var("DISCOGS_TOKEN").ok().filter(|t| !t.is_empty());
        config
    }
}

pub struct ApiClient {
    config: ClientConfig,
    transport: Box<dyn Transport>,
    cache: ResponseCache,
    limiter: RateLimiter,
    cancel: CancelFlag,
}

impl ApiClient {
    pub fn new(
        config: ClientConfig,
        transport: Box<dyn Transport>,
        cache: ResponseCache,
        limiter: RateLimiter,
        cancel: CancelFlag,
    ) -> Self {
        ApiClient { config, transport, cache, limiter, cancel }
    }

    /// Production wiring: reqwest transport, cache at `cache_path`, the
    /// remote API's published quota.
    pub fn from_env(cache_path: std::path::PathBuf, cancel: CancelFlag) -> Result<Self> {
        let config = ClientConfig::from_env();
        let transport = Box::new(HttpTransport::new(config.timeout)?);
        let cache = ResponseCache::open(cache_path)?;
        Ok(ApiClient::new(config, transport, cache, RateLimiter::discogs_default(), cancel))
    }

    pub fn has_token(&self) -> bool {
        self.config.token.is_some()
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Run a catalog query: cache hit short-circuits, otherwise fetch under
    /// the rate limiter, validate, cache, return. A failed or cancelled
    /// fetch never writes to the cache.
    pub fn execute(
        &self,
        query: &CatalogQuery,
        mode: AcquireMode,
    ) -> Result<CatalogResult, CatalogError> {
        let fingerprint = query.fingerprint(&self.config.base_url);

        if let Some(entry) = self.cache.get(&fingerprint) {
            match query.parse(&entry.body) {
                Ok(result) => return Ok(result),
                Err(e) => {
                    // Entries are validated before caching, so this means
                    // the expected shape changed underneath us. Refetch.
                    warn!(key = %fingerprint, error = %e, "cached entry no longer parses, refetching");
                    self.cache.invalidate(&fingerprint);
                }
            }
        }

        let url = format!("{}{}", self.config.base_url, query.path());
        let params = query.params();
        let resp = self.fetch_with_retry(&url, &params, mode, &query.describe())?;
        let result = query.parse(&resp.body)?;

        if self.cancel.is_set() {
            // Cancelled mid-flight: drop the result, keep the cache
            // untouched. The consumed permit is not refunded.
            return Err(CatalogError::Interrupted);
        }

        self.cache.put(
            &fingerprint,
            resp.body,
            retained_headers(&resp.headers),
            query.entity.cache_ttl(),
        );
        Ok(result)
    }

    /// Verify the configured token against the identity endpoint. Uncached:
    /// this is a liveness check, not catalog data.
    pub fn identity(&self, mode: AcquireMode) -> Result<String, CatalogError> {
        let url = format!("{}/oauth/identity", self.config.base_url);
        let resp = self.fetch_with_retry(&url, &[], mode, "identity")?;
        let value: Value = serde_json::from_str(&resp.body)
            .map_err(|e| CatalogError::Malformed(format!("identity response: {e}")))?;
        value
            .get("username")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CatalogError::Malformed("identity response missing `username`".into()))
    }

    /// One rate-limited GET with retries. Transient failures (transport
    /// errors, 5xx) back off with doubled delays up to `max_attempts`;
    /// client errors map straight onto the taxonomy and are never retried.
    fn fetch_with_retry(
        &self,
        url: &str,
        params: &[(String, String)],
        mode: AcquireMode,
        what: &str,
    ) -> Result<HttpResponse, CatalogError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            if self.cancel.is_set() {
                return Err(CatalogError::Interrupted);
            }
            attempt += 1;
            self.limiter.acquire(mode)?;

            let reason = match self.transport.get(url, params, self.config.token.as_deref()) {
                Err(TransportError(reason)) => reason,
                Ok(resp) => match resp.status {
                    200..=299 => {
                        debug!(%url, attempt, "fetch succeeded");
                        return Ok(resp);
                    }
                    400 => {
                        return Err(CatalogError::InvalidArgs(format!(
                            "query rejected by the API: {}",
                            body_snippet(&resp.body)
                        )))
                    }
                    401 | 403 => return Err(CatalogError::Unauthorized),
                    404 => return Err(CatalogError::NotFound(what.to_string())),
                    429 => {
                        let retry_after = resp
                            .headers
                            .get("retry-after")
                            .and_then(|v| v.parse::<u64>().ok())
                            .map(Duration::from_secs);
                        self.limiter.exhaust_window(retry_after);
                        return Err(CatalogError::RateLimitExceeded { retry_after });
                    }
                    s @ 400..=499 => {
                        return Err(CatalogError::InvalidArgs(format!(
                            "request failed with status {s}"
                        )))
                    }
                    s => format!("server returned status {s}"),
                },
            };

            if attempt >= max_attempts {
                warn!(%url, attempts = attempt, %reason, "giving up on transient failure");
                return Err(CatalogError::Transient { attempts: attempt, reason });
            }
            let delay = backoff_delay(self.config.base_delay, self.config.max_delay, attempt);
            debug!(%url, attempt, delay_ms = delay.as_millis() as u64, %reason, "transient failure, backing off");
            std::thread::sleep(delay);
        }
    }
}

/// Doubling backoff: base, 2*base, 4*base... capped.
fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << (attempt - 1).min(16);
    base.checked_mul(factor).map(|d| d.min(cap)).unwrap_or(cap)
}

/// Header subset worth persisting next to a cached body.
fn retained_headers(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    const KEEP: [&str; 4] = [
        "content-type",
        "x-discogs-ratelimit",
        "x-discogs-ratelimit-remaining",
        "retry-after",
    ];
    headers
        .iter()
        .filter(|(k, _)| KEEP.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn body_snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() > 120 {
        let cut: String = trimmed.chars().take(120).collect();
        format!("{cut}…")
    } else {
        trimmed.to_string()
    }
}

/// Test support: a scripted transport shared by client, dispatcher and
/// session tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Pops one canned response per call; an exhausted script reads as a
    /// transport failure.
    pub struct FakeTransport {
        script: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
        calls: AtomicUsize,
        pub seen_params: Mutex<Vec<Vec<(String, String)>>>,
    }

    impl FakeTransport {
        pub fn new(script: Vec<Result<HttpResponse, TransportError>>) -> Arc<Self> {
            Arc::new(FakeTransport {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                seen_params: Mutex::new(Vec::new()),
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Transport for Arc<FakeTransport> {
        fn get(
            &self,
            _url: &str,
            params: &[(String, String)],
            _token: Option<&str>,
        ) -> Result<HttpResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_params.lock().unwrap().push(params.to_vec());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError("script exhausted".into())))
        }
    }

    pub fn ok(body: &str) -> Result<HttpResponse, TransportError> {
        Ok(HttpResponse { status: 200, headers: BTreeMap::new(), body: body.into() })
    }

    pub fn status(code: u16) -> Result<HttpResponse, TransportError> {
        Ok(HttpResponse { status: code, headers: BTreeMap::new(), body: String::new() })
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{ok, status, FakeTransport};
    use super::*;
    use crate::query::EntityType;
    use tempfile::tempdir;

    fn artist_body() -> String {
        serde_json::json!({
            "pagination": { "page": 1, "pages": 2, "items": 42 },
            "results": [
                { "id": 23755, "title": "Miles Davis", "uri": "/artist/23755" }
            ]
        })
        .to_string()
    }

    fn client_with(
        transport: Arc<FakeTransport>,
        dir: &std::path::Path,
    ) -> (ApiClient, CancelFlag) {
        let config = ClientConfig {
            base_url: "https://api.test".into(),
            token: Some("t".into()),
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            timeout: Duration::from_secs(1),
        };
        let cache = ResponseCache::open(dir.join("cache.json")).unwrap();
        let limiter = RateLimiter::new(100, Duration::from_secs(60), Duration::from_secs(1));
        let cancel = CancelFlag::new();
        let client =
            ApiClient::new(config, Box::new(transport), cache, limiter, cancel.clone());
        (client, cancel)
    }

    #[test]
    fn cold_query_fetches_once_and_caches() {
        let dir = tempdir().unwrap();
        let transport = FakeTransport::new(vec![ok(&artist_body())]);
        let (client, _) = client_with(transport.clone(), dir.path());

        let query = CatalogQuery::new(EntityType::Artist, "Miles Davis");
        let result = client.execute(&query, AcquireMode::FailFast).unwrap();

        assert_eq!(transport.calls(), 1);
        assert_eq!(client.cache().len(), 1);
        assert!(!result.items.is_empty());
        assert_eq!(result.items[0].title, "Miles Davis");
    }

    #[test]
    fn warm_repeat_hits_cache_with_zero_network_calls() {
        let dir = tempdir().unwrap();
        let transport = FakeTransport::new(vec![ok(&artist_body())]);
        let (client, _) = client_with(transport.clone(), dir.path());

        let query = CatalogQuery::new(EntityType::Artist, "Miles Davis");
        let first = client.execute(&query, AcquireMode::FailFast).unwrap();
        let second = client.execute(&query, AcquireMode::FailFast).unwrap();

        assert_eq!(transport.calls(), 1);
        assert_eq!(first, second);
    }

    #[test]
    fn malformed_response_is_not_cached() {
        let dir = tempdir().unwrap();
        let body = serde_json::json!({
            "pagination": { "items": 1 },
            "results": [ { "title": "missing id" } ]
        })
        .to_string();
        let transport = FakeTransport::new(vec![ok(&body)]);
        let (client, _) = client_with(transport, dir.path());

        let query = CatalogQuery::new(EntityType::Artist, "x");
        assert!(matches!(
            client.execute(&query, AcquireMode::FailFast),
            Err(CatalogError::Malformed(_))
        ));
        assert_eq!(client.cache().len(), 0);
    }

    #[test]
    fn transient_failures_retry_exactly_max_attempts() {
        let dir = tempdir().unwrap();
        let transport = FakeTransport::new(vec![
            Err(TransportError("connection reset".into())),
            status(502),
            status(503),
            status(503), // must never be reached
        ]);
        let (client, _) = client_with(transport.clone(), dir.path());

        let query = CatalogQuery::new(EntityType::Release, "x");
        match client.execute(&query, AcquireMode::FailFast) {
            Err(CatalogError::Transient { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected Transient, got {other:?}"),
        }
        assert_eq!(transport.calls(), 3);
        assert_eq!(client.cache().len(), 0);
    }

    #[test]
    fn transient_then_success_recovers() {
        let dir = tempdir().unwrap();
        let transport = FakeTransport::new(vec![status(500), ok(&artist_body())]);
        let (client, _) = client_with(transport.clone(), dir.path());

        let query = CatalogQuery::new(EntityType::Artist, "x");
        assert!(client.execute(&query, AcquireMode::FailFast).is_ok());
        assert_eq!(transport.calls(), 2);
        assert_eq!(client.cache().len(), 1);
    }

    #[test]
    fn client_errors_are_never_retried() {
        let dir = tempdir().unwrap();
        let transport = FakeTransport::new(vec![status(404), status(200)]);
        let (client, _) = client_with(transport.clone(), dir.path());

        let query = CatalogQuery::new(EntityType::Label, "nope");
        assert!(matches!(
            client.execute(&query, AcquireMode::FailFast),
            Err(CatalogError::NotFound(_))
        ));
        assert_eq!(transport.calls(), 1);
    }

    #[test]
    fn unauthorized_maps_from_401() {
        let dir = tempdir().unwrap();
        let transport = FakeTransport::new(vec![status(401)]);
        let (client, _) = client_with(transport, dir.path());

        let query = CatalogQuery::new(EntityType::Artist, "x");
        assert!(matches!(
            client.execute(&query, AcquireMode::FailFast),
            Err(CatalogError::Unauthorized)
        ));
    }

    #[test]
    fn server_429_exhausts_local_window() {
        let dir = tempdir().unwrap();
        let mut resp = HttpResponse { status: 429, headers: BTreeMap::new(), body: String::new() };
        resp.headers.insert("retry-after".into(), "30".into());
        let transport = FakeTransport::new(vec![Ok(resp)]);

        let config = ClientConfig {
            base_url: "https://api.test".into(),
            token: None,
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            timeout: Duration::from_secs(1),
        };
        let cache = ResponseCache::open(dir.path().join("cache.json")).unwrap();
        let limiter = RateLimiter::new(10, Duration::from_secs(60), Duration::from_secs(1));
        let client = ApiClient::new(config, Box::new(transport), cache, limiter, CancelFlag::new());

        let query = CatalogQuery::new(EntityType::Marketplace, "x");
        match client.execute(&query, AcquireMode::FailFast) {
            Err(CatalogError::RateLimitExceeded { retry_after }) => {
                assert_eq!(retry_after, Some(Duration::from_secs(30)));
            }
            other => panic!("expected RateLimitExceeded, got {other:?}"),
        }
        // The server signal zeroed the local budget too.
        assert!(matches!(
            client.execute(&query, AcquireMode::FailFast),
            Err(CatalogError::RateLimitExceeded { .. })
        ));
    }

    #[test]
    fn cancelled_call_makes_no_network_call_and_no_cache_write() {
        let dir = tempdir().unwrap();
        let transport = FakeTransport::new(vec![ok(&artist_body())]);
        let (client, cancel) = client_with(transport.clone(), dir.path());

        cancel.set();
        let query = CatalogQuery::new(EntityType::Artist, "x");
        assert!(matches!(
            client.execute(&query, AcquireMode::FailFast),
            Err(CatalogError::Interrupted)
        ));
        assert_eq!(transport.calls(), 0);
        assert_eq!(client.cache().len(), 0);
    }

    #[test]
    fn pagination_cursor_becomes_page_param_and_pages_are_cached_separately() {
        let dir = tempdir().unwrap();
        let page2 = serde_json::json!({
            "pagination": { "page": 2, "pages": 2, "items": 42 },
            "results": [ { "id": 99, "title": "Miles Davis Quintet" } ]
        })
        .to_string();
        let transport = FakeTransport::new(vec![ok(&artist_body()), ok(&page2)]);
        let (client, _) = client_with(transport.clone(), dir.path());

        let query = CatalogQuery::new(EntityType::Artist, "Miles Davis");
        let first = client.execute(&query, AcquireMode::FailFast).unwrap();
        let cursor = first.next_cursor.clone().unwrap();
        let second = client
            .execute(&query.with_cursor(cursor), AcquireMode::FailFast)
            .unwrap();

        assert_eq!(transport.calls(), 2);
        assert_eq!(client.cache().len(), 2);
        assert_eq!(second.next_cursor, None);
        // Boundary items are disjoint across the page fetch.
        let first_ids: Vec<u64> = first.items.iter().map(|s| s.id).collect();
        assert!(second.items.iter().all(|s| !first_ids.contains(&s.id)));
        // The cursor travelled as the `page` parameter.
        let seen = transport.seen_params.lock().unwrap();
        assert!(seen[1].contains(&("page".to_string(), "2".to_string())));
    }

    #[test]
    fn identity_parses_username() {
        let dir = tempdir().unwrap();
        let transport =
            FakeTransport::new(vec![ok(&serde_json::json!({ "username": "diggory" }).to_string())]);
        let (client, _) = client_with(transport, dir.path());
        assert_eq!(client.identity(AcquireMode::FailFast).unwrap(), "diggory");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_millis(350);
        assert_eq!(backoff_delay(base, cap, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, cap, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, cap, 3), cap);
    }
}
