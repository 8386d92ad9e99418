// Generation-partitioned response cache.

use std::collections::{BTreeMap, HashMap, HashSet};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use super::downloader::Downloader;
use super::manifest::{request_identity, AssetManifest};
use crate::error::EngineError;
use crate::source::traits::FetchResponse;

/// Name and numeric version of one deployed cache snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GenerationId {
    pub name: String,
    pub version: u32,
}

impl GenerationId {
    pub fn new(prefix: &str, version: u32) -> Self {
        Self {
            name: crate::config::generation_name(prefix, version),
            version,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStatus {
    Building,
    Ready,
    Active,
    Superseded,
}

impl GenerationStatus {
    fn can_become(self, next: GenerationStatus) -> bool {
        use GenerationStatus::*;
        matches!(
            (self, next),
            (Building, Ready) | (Ready, Active) | (Active, Superseded)
        )
    }
}

/// A captured GET response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
    pub identity: String,
    pub status: u16,
    pub content_type: String,
    pub payload: Bytes,
    /// Diagnostics only. Entries never expire by age.
    pub captured_at: DateTime<Utc>,
}

impl CachedEntry {
    pub fn capture(identity: String, response: &FetchResponse) -> Self {
        Self {
            identity,
            status: response.status,
            content_type: response.content_type.clone(),
            payload: response.body.clone(),
            captured_at: Utc::now(),
        }
    }

    pub fn to_response(&self) -> FetchResponse {
        FetchResponse::new(self.status, self.content_type.clone(), self.payload.clone())
    }
}

struct Generation {
    status: GenerationStatus,
    created_at: DateTime<Utc>,
    entries: HashMap<String, CachedEntry>,
}

/// Snapshot of a generation returned by [`CacheStore::open_generation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationHandle {
    pub name: String,
    pub status: GenerationStatus,
    pub created_at: DateTime<Utc>,
    pub entry_count: usize,
}

/// Result of attempting one manifest entry during population.
#[derive(Debug)]
pub struct PrecacheOutcome {
    pub path: String,
    pub result: Result<(), EngineError>,
}

impl PrecacheOutcome {
    pub fn is_stored(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Default)]
pub struct CacheStore {
    generations: RwLock<BTreeMap<String, Generation>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the bucket for `name`, or return the existing one.
    pub fn open_generation(&self, name: &str) -> GenerationHandle {
        let mut generations = self.generations.write();
        let generation = generations.entry(name.to_string()).or_insert_with(|| {
            debug!("open generation={} (new)", name);
            Generation {
                status: GenerationStatus::Building,
                created_at: Utc::now(),
                entries: HashMap::new(),
            }
        });
        GenerationHandle {
            name: name.to_string(),
            status: generation.status,
            created_at: generation.created_at,
            entry_count: generation.entries.len(),
        }
    }

    /// Fetch and store every manifest entry. A failed entry is logged and
    /// reported; it never fails the whole population.
    pub async fn put_all(
        &self,
        name: &str,
        manifest: &AssetManifest,
        downloader: &Downloader,
        ignore_query: bool,
    ) -> Result<Vec<PrecacheOutcome>, EngineError> {
        if !self.generations.read().contains_key(name) {
            return Err(EngineError::Storage(format!("unknown generation {}", name)));
        }

        let fetched = downloader.fetch_all(manifest.urls()).await;
        let mut outcomes = Vec::with_capacity(fetched.len());
        for (path, url, result) in fetched {
            let result = match result {
                Ok(response) => {
                    let identity = request_identity(&url, ignore_query);
                    self.replace(name, &identity, CachedEntry::capture(identity.clone(), &response))
                }
                Err(e) => Err(e),
            };
            match &result {
                Ok(()) => debug!("precache generation={} path={} stored", name, path),
                Err(e) => warn!("precache generation={} path={} failed: {}", name, path, e),
            }
            outcomes.push(PrecacheOutcome { path, result });
        }

        let stored = outcomes.iter().filter(|o| o.is_stored()).count();
        info!(
            "precache generation={} stored={}/{}",
            name,
            stored,
            outcomes.len()
        );
        Ok(outcomes)
    }

    pub fn lookup(&self, name: &str, identity: &str) -> Option<CachedEntry> {
        let generations = self.generations.read();
        generations.get(name)?.entries.get(identity).cloned()
    }

    /// Overwrite the entry for `identity` in place.
    pub fn replace(&self, name: &str, identity: &str, entry: CachedEntry) -> Result<(), EngineError> {
        let mut generations = self.generations.write();
        let generation = generations
            .get_mut(name)
            .ok_or_else(|| EngineError::Storage(format!("unknown generation {}", name)))?;
        if generation.status == GenerationStatus::Superseded {
            return Err(EngineError::Storage(format!(
                "generation {} is superseded and read-only",
                name
            )));
        }
        generation.entries.insert(identity.to_string(), entry);
        Ok(())
    }

    pub fn list_generations(&self) -> Vec<String> {
        self.generations.read().keys().cloned().collect()
    }

    /// Drop a whole generation. Deleting the Active generation is an invariant
    /// violation and aborts the call.
    pub fn delete_generation(&self, name: &str) -> Result<bool, EngineError> {
        let mut generations = self.generations.write();
        match generations.get(name).map(|g| g.status) {
            None => Ok(false),
            Some(GenerationStatus::Active) => {
                error!("refusing to delete active generation={}", name);
                Err(EngineError::InvariantViolation(format!(
                    "attempted to delete active generation {}",
                    name
                )))
            }
            Some(_) => {
                generations.remove(name);
                info!("deleted generation={}", name);
                Ok(true)
            }
        }
    }

    /// Remove every entry from a generation, keeping the generation itself.
    pub fn clear_entries(&self, name: &str) -> Result<usize, EngineError> {
        let mut generations = self.generations.write();
        let generation = generations
            .get_mut(name)
            .ok_or_else(|| EngineError::Storage(format!("unknown generation {}", name)))?;
        let removed = generation.entries.len();
        generation.entries.clear();
        Ok(removed)
    }

    /// Move a generation along its lifecycle. At most one generation may be Active.
    pub fn set_status(&self, name: &str, next: GenerationStatus) -> Result<(), EngineError> {
        let mut generations = self.generations.write();

        if next == GenerationStatus::Active {
            if let Some((other, _)) = generations
                .iter()
                .find(|(n, g)| n.as_str() != name && g.status == GenerationStatus::Active)
            {
                error!("generation={} cannot activate while {} is active", name, other);
                return Err(EngineError::InvariantViolation(format!(
                    "{} cannot become active while {} is active",
                    name, other
                )));
            }
        }

        let generation = generations
            .get_mut(name)
            .ok_or_else(|| EngineError::Storage(format!("unknown generation {}", name)))?;
        if !generation.status.can_become(next) {
            return Err(EngineError::InvariantViolation(format!(
                "generation {} cannot move from {:?} to {:?}",
                name, generation.status, next
            )));
        }
        generation.status = next;
        debug!("generation={} status={:?}", name, next);
        Ok(())
    }

    pub fn status(&self, name: &str) -> Option<GenerationStatus> {
        self.generations.read().get(name).map(|g| g.status)
    }

    pub fn active_generation(&self) -> Option<String> {
        self.generations
            .read()
            .iter()
            .find(|(_, g)| g.status == GenerationStatus::Active)
            .map(|(n, _)| n.clone())
    }

    pub fn generations_with_status(&self, status: GenerationStatus) -> Vec<String> {
        self.generations
            .read()
            .iter()
            .filter(|(_, g)| g.status == status)
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn identities(&self, name: &str) -> HashSet<String> {
        self.generations
            .read()
            .get(name)
            .map(|g| g.entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn entry_count(&self, name: &str) -> usize {
        self.generations
            .read()
            .get(name)
            .map(|g| g.entries.len())
            .unwrap_or(0)
    }

    pub fn total_entries(&self) -> usize {
        self.generations
            .read()
            .values()
            .map(|g| g.entries.len())
            .sum()
    }
}
