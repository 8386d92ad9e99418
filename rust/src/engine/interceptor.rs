// Request interception: applies the caching policy to every outgoing request.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, Url};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::cache::{CacheStore, CachedEntry};
use super::channel::{ClientChannel, SessionId};
use super::manifest::request_identity;
use super::policy::{CachePolicy, CacheStrategy};
use super::stats::StatsCollector;
use crate::config::OFFLINE_BODY;
use crate::error::EngineError;
use crate::source::traits::{FetchRequest, FetchResponse, NetworkSource};

/// Where an intercepted response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Served {
    Network,
    Cache,
    OfflineDocument,
    /// Synthetic 503, nothing could serve the request.
    Unavailable,
    Bypassed,
    /// Not intercepted at all (non-GET, foreign origin, non-http scheme).
    PassThrough,
}

#[derive(Debug, Clone)]
pub struct InterceptedResponse {
    pub response: FetchResponse,
    pub served: Served,
}

impl InterceptedResponse {
    fn new(response: FetchResponse, served: Served) -> Self {
        Self { response, served }
    }
}

/// The deterministic response returned on total unavailability.
pub fn offline_response() -> FetchResponse {
    FetchResponse::new(503, "text/plain", OFFLINE_BODY)
}

pub struct RequestInterceptor {
    policy: CachePolicy,
    store: Arc<CacheStore>,
    channel: Arc<ClientChannel>,
    source: Arc<dyn NetworkSource>,
    stats: Arc<StatsCollector>,
    timeout: Duration,
    offline_url: Url,
    ignore_query: bool,
    shutdown: CancellationToken,
}

impl RequestInterceptor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        policy: CachePolicy,
        store: Arc<CacheStore>,
        channel: Arc<ClientChannel>,
        source: Arc<dyn NetworkSource>,
        stats: Arc<StatsCollector>,
        timeout: Duration,
        offline_url: Url,
        ignore_query: bool,
    ) -> Self {
        Self {
            policy,
            store,
            channel,
            source,
            stats,
            timeout,
            offline_url,
            ignore_query,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Stop launching background revalidations and cancel those in flight.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Serve one request. Only bypassed and passed-through requests can return
    /// an error, and only the network error itself.
    pub async fn handle(
        &self,
        request: FetchRequest,
        session: Option<SessionId>,
    ) -> Result<InterceptedResponse, EngineError> {
        if !self.should_intercept(&request) {
            debug!("pass through method={} url={}", request.method, request.url);
            let response = self.fetch_untimed(&request).await?;
            return Ok(InterceptedResponse::new(response, Served::PassThrough));
        }

        let strategy = self.policy.classify(&request.url, &request.headers);
        debug!("intercept url={} strategy={:?}", request.url, strategy);
        self.stats.record_served();

        match strategy {
            CacheStrategy::Bypass => {
                self.stats.record_bypass();
                let response = self.fetch_untimed(&request).await?;
                Ok(InterceptedResponse::new(response, Served::Bypassed))
            }
            CacheStrategy::NetworkFirst => Ok(self.network_first(&request, session).await),
            CacheStrategy::CacheFirst => Ok(self.cache_first(&request, session).await),
        }
    }

    fn should_intercept(&self, request: &FetchRequest) -> bool {
        if request.method != Method::GET {
            return false;
        }
        if !matches!(request.url.scheme(), "http" | "https") {
            return false;
        }
        self.policy.is_same_origin(&request.url) || self.policy.is_trusted_origin(&request.url)
    }

    async fn network_first(
        &self,
        request: &FetchRequest,
        session: Option<SessionId>,
    ) -> InterceptedResponse {
        let identity = request_identity(&request.url, self.ignore_query);

        match self.fetch_with_timeout(request).await {
            Ok(response) => {
                self.write_through(&identity, &response);
                InterceptedResponse::new(response, Served::Network)
            }
            Err(e) => {
                debug!("network first fallback url={}: {}", request.url, e);
                if let Some(entry) = self.lookup(session, &identity) {
                    self.stats.record_cache_hit();
                    return InterceptedResponse::new(entry.to_response(), Served::Cache);
                }
                self.stats.record_cache_miss();

                let offline_identity = request_identity(&self.offline_url, self.ignore_query);
                if let Some(entry) = self.lookup(session, &offline_identity) {
                    self.stats.record_offline_fallback();
                    return InterceptedResponse::new(entry.to_response(), Served::OfflineDocument);
                }
                self.unavailable()
            }
        }
    }

    async fn cache_first(
        &self,
        request: &FetchRequest,
        session: Option<SessionId>,
    ) -> InterceptedResponse {
        let identity = request_identity(&request.url, self.ignore_query);

        if let Some(entry) = self.lookup(session, &identity) {
            self.stats.record_cache_hit();
            self.spawn_revalidation(request.clone(), identity);
            return InterceptedResponse::new(entry.to_response(), Served::Cache);
        }
        self.stats.record_cache_miss();

        match self.fetch_with_timeout(request).await {
            Ok(response) => {
                self.write_through(&identity, &response);
                InterceptedResponse::new(response, Served::Network)
            }
            Err(e) => {
                debug!("cache first miss and network failed url={}: {}", request.url, e);
                self.unavailable()
            }
        }
    }

    /// Refresh a cached entry off the response path. Failures are discarded.
    fn spawn_revalidation(&self, request: FetchRequest, identity: String) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let source = Arc::clone(&self.source);
        let store = Arc::clone(&self.store);
        let stats = Arc::clone(&self.stats);
        let timeout = self.timeout;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            stats.record_network_fetch();
            let fetched = tokio::select! {
                r = tokio::time::timeout(timeout, source.fetch(&request)) => r,
                _ = shutdown.cancelled() => return,
            };
            let response = match fetched {
                Ok(Ok(r)) if r.is_cacheable() => r,
                Ok(Ok(r)) => {
                    debug!("revalidation url={} skipped status={}", request.url, r.status);
                    return;
                }
                _ => {
                    stats.record_network_failure();
                    debug!("revalidation url={} failed, discarded", request.url);
                    return;
                }
            };
            if let Some(active) = store.active_generation() {
                let entry = CachedEntry::capture(identity.clone(), &response);
                if store.replace(&active, &identity, entry).is_ok() {
                    stats.record_revalidation();
                    debug!("revalidated {} in {}", identity, active);
                }
            }
        });
    }

    /// Lagging sessions read from the generation their page came from while it
    /// still exists; everyone else reads from the Active generation.
    fn lookup(&self, session: Option<SessionId>, identity: &str) -> Option<CachedEntry> {
        let active = self.store.active_generation();
        let controlling = session.and_then(|id| self.channel.controlling_generation(id));

        if let Some(name) = controlling.filter(|c| Some(c) != active.as_ref()) {
            if let Some(entry) = self.store.lookup(&name, identity) {
                return Some(entry);
            }
        }
        active.and_then(|name| self.store.lookup(&name, identity))
    }

    fn write_through(&self, identity: &str, response: &FetchResponse) {
        if !response.is_cacheable() {
            return;
        }
        if let Some(active) = self.store.active_generation() {
            let entry = CachedEntry::capture(identity.to_string(), response);
            if let Err(e) = self.store.replace(&active, identity, entry) {
                debug!("write-through {} into {} failed: {}", identity, active, e);
            }
        }
    }

    fn unavailable(&self) -> InterceptedResponse {
        self.stats.record_unavailable();
        InterceptedResponse::new(offline_response(), Served::Unavailable)
    }

    async fn fetch_with_timeout(&self, request: &FetchRequest) -> Result<FetchResponse, EngineError> {
        self.stats.record_network_fetch();
        match tokio::time::timeout(self.timeout, self.source.fetch(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                self.stats.record_network_failure();
                Err(EngineError::Network {
                    url: request.url.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                self.stats.record_network_failure();
                Err(EngineError::NetworkTimeout {
                    url: request.url.to_string(),
                    millis: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn fetch_untimed(&self, request: &FetchRequest) -> Result<FetchResponse, EngineError> {
        self.stats.record_network_fetch();
        self.source.fetch(request).await.map_err(|e| {
            self.stats.record_network_failure();
            EngineError::Network {
                url: request.url.to_string(),
                reason: e.to_string(),
            }
        })
    }
}
