use std::path::Path;
use std::time::Duration;

use regex::Regex;
use reqwest::Url;
use serde::Deserialize;

use crate::error::EngineError;

/// Network fetch timeout in milliseconds.
pub const NETWORK_TIMEOUT_MS: u64 = 8_000;

/// Prefix joined with the numeric version to form a generation name.
pub const DEFAULT_CACHE_PREFIX: &str = "pwa-v";

/// Body of the synthetic response returned when nothing can serve a request.
pub const OFFLINE_BODY: &str = "Offline";

/// Marker header attached to the synthetic unavailable response.
pub const OFFLINE_MARKER_HEADER: &str = "x-offline-shell";

/// Header a page uses to tell the proxy which session issued a request.
pub const SESSION_HEADER: &str = "x-client-session";

/// Paths that are never read from or written to any generation.
pub const BUILTIN_DENY_PATTERNS: &[&str] = &[
    r"\.db$",
    r"\.sqlite$",
    r"\.sqlite3$",
    r"\.db-wal$",
    r"\.db-shm$",
    r"\.db-journal$",
    r"/api/",
    r"/__",
];

/// Top-level configuration for the offline shell worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Origin the worker is scoped to, e.g. `http://127.0.0.1:8080`.
    pub origin: String,
    /// Path prefix under which the application lives. Always ends with `/`.
    pub base_path: String,
    pub cache_prefix: String,
    /// Deployed version; embedded in the generation name.
    pub version: u32,
    /// Assets that must be attempted before a generation is ready, relative to `base_path`.
    pub manifest: Vec<String>,
    /// Document served when markup is unreachable, relative to `base_path`.
    pub offline_document: String,
    pub network_timeout_ms: u64,
    /// Promote a freshly installed generation without waiting for `SKIP_WAITING`.
    pub skip_waiting_on_install: bool,
    /// Drop the query string when computing request identities.
    pub ignore_query: bool,
    pub precache_concurrency: u32,
    pub precache_retries: u32,
    /// Foreign origins allowed through uncached (push-token exchange).
    pub trusted_origins: Vec<String>,
    /// Extra deny-list regexes appended to [`BUILTIN_DENY_PATTERNS`].
    pub deny_patterns: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            origin: "http://127.0.0.1".to_string(),
            base_path: "/".to_string(),
            cache_prefix: DEFAULT_CACHE_PREFIX.to_string(),
            version: 1,
            manifest: vec![
                String::new(),
                "index.html".to_string(),
                "styles.css".to_string(),
                "manifest.json".to_string(),
            ],
            offline_document: "index.html".to_string(),
            network_timeout_ms: NETWORK_TIMEOUT_MS,
            skip_waiting_on_install: true,
            ignore_query: true,
            precache_concurrency: 4,
            precache_retries: 0,
            trusted_origins: vec![
                "https://www.gstatic.com".to_string(),
                "https://fcm.googleapis.com".to_string(),
                "https://firebaseinstallations.googleapis.com".to_string(),
            ],
            deny_patterns: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| EngineError::Config(format!("invalid config json: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    /// Reject configurations the worker cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        self.origin_url()?;
        if !self.base_path.starts_with('/') || !self.base_path.ends_with('/') {
            return Err(EngineError::Config(format!(
                "base_path must start and end with '/': {}",
                self.base_path
            )));
        }
        if self.precache_concurrency == 0 {
            return Err(EngineError::Config(
                "precache_concurrency must be > 0".to_string(),
            ));
        }
        for origin in &self.trusted_origins {
            Url::parse(origin).map_err(|e| {
                EngineError::Config(format!("invalid trusted origin {}: {}", origin, e))
            })?;
        }
        self.compiled_deny_patterns()?;
        Ok(())
    }

    pub fn origin_url(&self) -> Result<Url, EngineError> {
        Url::parse(&self.origin)
            .map_err(|e| EngineError::Config(format!("invalid origin {}: {}", self.origin, e)))
    }

    /// Name of the generation this configuration deploys.
    pub fn generation_name(&self) -> String {
        generation_name(&self.cache_prefix, self.version)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    /// Manifest entries resolved to absolute paths under `base_path`.
    pub fn manifest_paths(&self) -> Vec<String> {
        self.manifest
            .iter()
            .map(|entry| format!("{}{}", self.base_path, entry.trim_start_matches('/')))
            .collect()
    }

    pub fn offline_document_path(&self) -> String {
        format!(
            "{}{}",
            self.base_path,
            self.offline_document.trim_start_matches('/')
        )
    }

    pub fn compiled_deny_patterns(&self) -> Result<Vec<Regex>, EngineError> {
        BUILTIN_DENY_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .chain(self.deny_patterns.iter().cloned())
            .map(|p| {
                Regex::new(&p)
                    .map_err(|e| EngineError::Config(format!("invalid deny pattern {}: {}", p, e)))
            })
            .collect()
    }
}

pub fn generation_name(prefix: &str, version: u32) -> String {
    format!("{}{}", prefix, version)
}
