// Diagnostics counters.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

struct StatsSample {
    at: Instant,
    served_responses: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub network_fetches: u64,
    pub network_failures: u64,
    pub offline_fallbacks: u64,
    pub unavailable_responses: u64,
    pub bypassed: u64,
    pub revalidations: u64,
    pub downloaded_bytes: u64,
    pub active_workers: u32,
    pub responses_per_sec: u64,
    pub cache_hit_rate: f64,
}

pub struct StatsCollector {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    network_fetches: AtomicU64,
    network_failures: AtomicU64,
    offline_fallbacks: AtomicU64,
    unavailable_responses: AtomicU64,
    bypassed: AtomicU64,
    revalidations: AtomicU64,
    downloaded_bytes: AtomicU64,
    served_responses: AtomicU64,
    active_workers: AtomicU32,
    last_sample: Mutex<StatsSample>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            network_fetches: AtomicU64::new(0),
            network_failures: AtomicU64::new(0),
            offline_fallbacks: AtomicU64::new(0),
            unavailable_responses: AtomicU64::new(0),
            bypassed: AtomicU64::new(0),
            revalidations: AtomicU64::new(0),
            downloaded_bytes: AtomicU64::new(0),
            served_responses: AtomicU64::new(0),
            active_workers: AtomicU32::new(0),
            last_sample: Mutex::new(StatsSample {
                at: Instant::now(),
                served_responses: 0,
            }),
        }
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_network_fetch(&self) {
        self.network_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_network_failure(&self) {
        self.network_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_offline_fallback(&self) {
        self.offline_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unavailable(&self) {
        self.unavailable_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bypass(&self) {
        self.bypassed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_revalidation(&self) {
        self.revalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_downloaded(&self, bytes: u64) {
        self.downloaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_served(&self) {
        self.served_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_workers(&self) {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_workers(&self) {
        self.active_workers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let now = Instant::now();
        let current_served = self.served_responses.load(Ordering::Relaxed);

        let responses_per_sec = {
            let mut sample = self.last_sample.lock();
            let elapsed = now.duration_since(sample.at).as_secs_f64();
            let rate = if elapsed > 0.1 {
                (current_served.saturating_sub(sample.served_responses) as f64 / elapsed) as u64
            } else {
                0
            };
            sample.at = now;
            sample.served_responses = current_served;
            rate
        };

        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let cache_hit_rate = if hits + misses > 0 {
            hits as f64 / (hits + misses) as f64
        } else {
            0.0
        };

        StatsSnapshot {
            cache_hits: hits,
            cache_misses: misses,
            network_fetches: self.network_fetches.load(Ordering::Relaxed),
            network_failures: self.network_failures.load(Ordering::Relaxed),
            offline_fallbacks: self.offline_fallbacks.load(Ordering::Relaxed),
            unavailable_responses: self.unavailable_responses.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            revalidations: self.revalidations.load(Ordering::Relaxed),
            downloaded_bytes: self.downloaded_bytes.load(Ordering::Relaxed),
            active_workers: self.active_workers.load(Ordering::Relaxed),
            responses_per_sec,
            cache_hit_rate,
        }
    }

    pub fn network_fetches(&self) -> u64 {
        self.network_fetches.load(Ordering::Relaxed)
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}
