// Per-request caching policy, a pure function of the request.

use std::collections::HashSet;

use regex::Regex;
use reqwest::header::HeaderMap;
use reqwest::Url;

use super::manifest::{request_identity, AssetManifest};
use crate::config::EngineConfig;
use crate::detect::content::{detect_content_class, ContentClass};
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStrategy {
    /// Straight to network, never touches any generation.
    Bypass,
    NetworkFirst,
    CacheFirst,
}

/// Immutable classification rules built once at worker start-up.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    origin: Url,
    base_path: String,
    deny: Vec<Regex>,
    trusted_origins: Vec<Url>,
    manifest_identities: HashSet<String>,
    ignore_query: bool,
}

impl CachePolicy {
    pub fn new(config: &EngineConfig, manifest: &AssetManifest) -> Result<Self, EngineError> {
        let trusted_origins = config
            .trusted_origins
            .iter()
            .map(|o| {
                Url::parse(o)
                    .map_err(|e| EngineError::Config(format!("invalid trusted origin {}: {}", o, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            origin: config.origin_url()?,
            base_path: config.base_path.clone(),
            deny: config.compiled_deny_patterns()?,
            trusted_origins,
            manifest_identities: manifest.identities(),
            ignore_query: config.ignore_query,
        })
    }

    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.origin.origin()
    }

    pub fn is_trusted_origin(&self, url: &Url) -> bool {
        let origin = url.origin();
        self.trusted_origins.iter().any(|t| t.origin() == origin)
    }

    pub fn is_denied(&self, path: &str) -> bool {
        self.deny.iter().any(|re| re.is_match(path))
    }

    /// Decide the retrieval strategy for a request.
    pub fn classify(&self, url: &Url, headers: &HeaderMap) -> CacheStrategy {
        if !self.is_same_origin(url) {
            // Trusted vendors and anything else foreign are never cached.
            return CacheStrategy::Bypass;
        }

        let path = url.path();
        if self.is_denied(path) {
            return CacheStrategy::Bypass;
        }

        let class = detect_content_class(path, headers);
        if class == ContentClass::Markup || path == self.base_path || is_navigation(headers) {
            return CacheStrategy::NetworkFirst;
        }

        // Manifest-pinned assets are refreshed by generation turnover.
        if self
            .manifest_identities
            .contains(&request_identity(url, self.ignore_query))
        {
            return CacheStrategy::CacheFirst;
        }

        if class.is_structural() {
            CacheStrategy::NetworkFirst
        } else {
            CacheStrategy::CacheFirst
        }
    }
}

fn is_navigation(headers: &HeaderMap) -> bool {
    headers
        .get("sec-fetch-mode")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("navigate"))
        .unwrap_or(false)
}
