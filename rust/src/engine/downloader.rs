// Bounded-concurrency manifest fetcher. Populates a generation in parallel.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::stats::StatsCollector;
use crate::error::EngineError;
use crate::source::traits::{FetchRequest, FetchResponse, NetworkSource};

pub type FetchedEntry = (String, Url, Result<FetchResponse, EngineError>);

pub struct Downloader {
    source: Arc<dyn NetworkSource>,
    semaphore: Arc<Semaphore>,
    stats: Arc<StatsCollector>,
    timeout: Duration,
    max_retries: u32,
}

impl Downloader {
    pub fn new(
        source: Arc<dyn NetworkSource>,
        max_concurrency: u32,
        timeout: Duration,
        max_retries: u32,
        stats: Arc<StatsCollector>,
    ) -> Self {
        Self {
            source,
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1) as usize)),
            stats,
            timeout,
            max_retries,
        }
    }

    /// Fetch every `(path, url)` pair. Results come back in input order; a
    /// failure on one entry never affects the others.
    pub async fn fetch_all(&self, entries: Vec<(String, Url)>) -> Vec<FetchedEntry> {
        let mut handles = Vec::with_capacity(entries.len());
        for (path, url) in entries {
            let source = Arc::clone(&self.source);
            let semaphore = Arc::clone(&self.semaphore);
            let stats = Arc::clone(&self.stats);
            let timeout = self.timeout;
            let max_retries = self.max_retries;
            let task_url = url.clone();
            let task_path = path.clone();
            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|e| {
                    EngineError::ManifestFetch {
                        path: task_path.clone(),
                        reason: e.to_string(),
                    }
                })?;
                stats.increment_workers();
                let result = Self::fetch_with_retry(
                    &task_path,
                    &task_url,
                    source.as_ref(),
                    &stats,
                    timeout,
                    max_retries,
                )
                .await;
                stats.decrement_workers();
                result
            });
            handles.push((path, url, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (path, url, handle) in handles {
            let result = match handle.await {
                Ok(r) => r,
                Err(e) => Err(EngineError::ManifestFetch {
                    path: path.clone(),
                    reason: format!("fetch task aborted: {}", e),
                }),
            };
            results.push((path, url, result));
        }
        results
    }

    async fn fetch_with_retry(
        path: &str,
        url: &Url,
        source: &dyn NetworkSource,
        stats: &StatsCollector,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<FetchResponse, EngineError> {
        let request = FetchRequest::get(url.clone());
        let mut last_reason = String::new();

        for attempt in 0..=max_retries {
            stats.record_network_fetch();
            match tokio::time::timeout(timeout, source.fetch(&request)).await {
                Ok(Ok(response)) if response.is_cacheable() => {
                    stats.record_downloaded(response.body.len() as u64);
                    debug!("manifest {} fetched ({} bytes)", path, response.body.len());
                    return Ok(response);
                }
                Ok(Ok(response)) => {
                    last_reason = format!("HTTP {}", response.status);
                }
                Ok(Err(e)) => {
                    stats.record_network_failure();
                    last_reason = e.to_string();
                }
                Err(_) => {
                    stats.record_network_failure();
                    last_reason = format!("timeout after {} ms", timeout.as_millis());
                }
            }

            if attempt < max_retries {
                warn!(
                    "manifest {} fetch failed (attempt {}): {}",
                    path, attempt, last_reason
                );
                tokio::time::sleep(Duration::from_millis(500 * (attempt as u64 + 1))).await;
            }
        }

        Err(EngineError::ManifestFetch {
            path: path.to_string(),
            reason: last_reason,
        })
    }
}
