// Static asset manifest and request-identity normalization.

use std::collections::HashSet;

use reqwest::Url;

/// Normalize a URL into the key used to address cache entries.
///
/// Fragments are always dropped; the query string is dropped unless the
/// origin varies responses by query.
pub fn request_identity(url: &Url, ignore_query: bool) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    if ignore_query {
        normalized.set_query(None);
    }
    normalized.to_string()
}

/// Ordered list of paths that must be attempted before a generation is ready.
#[derive(Debug, Clone)]
pub struct AssetManifest {
    origin: Url,
    paths: Vec<String>,
    ignore_query: bool,
}

impl AssetManifest {
    pub fn new(origin: Url, paths: Vec<String>, ignore_query: bool) -> Self {
        // Keep first occurrence order, drop duplicates.
        let mut seen = HashSet::new();
        let paths = paths
            .into_iter()
            .filter(|p| seen.insert(p.clone()))
            .collect();
        Self {
            origin,
            paths,
            ignore_query,
        }
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Absolute URLs of every manifest entry, in manifest order. Entries that do
    /// not join onto the origin are skipped.
    pub fn urls(&self) -> Vec<(String, Url)> {
        self.paths
            .iter()
            .filter_map(|p| self.origin.join(p).ok().map(|u| (p.clone(), u)))
            .collect()
    }

    /// Request identities of every manifest entry.
    pub fn identities(&self) -> HashSet<String> {
        self.urls()
            .iter()
            .map(|(_, url)| request_identity(url, self.ignore_query))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_ignores_query_and_fragment() {
        let url = Url::parse("http://127.0.0.1:8080/styles.css?v=3#top").unwrap();
        assert_eq!(
            request_identity(&url, true),
            "http://127.0.0.1:8080/styles.css"
        );
        assert_eq!(
            request_identity(&url, false),
            "http://127.0.0.1:8080/styles.css?v=3"
        );
    }

    #[test]
    fn test_manifest_dedup_and_order() {
        let origin = Url::parse("http://127.0.0.1:8080").unwrap();
        let manifest = AssetManifest::new(
            origin,
            vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/".to_string(),
                "/styles.css".to_string(),
            ],
            true,
        );
        assert_eq!(manifest.paths(), &["/", "/index.html", "/styles.css"]);
        let urls = manifest.urls();
        assert_eq!(urls[2].1.as_str(), "http://127.0.0.1:8080/styles.css");
        assert!(manifest
            .identities()
            .contains("http://127.0.0.1:8080/index.html"));
    }
}
