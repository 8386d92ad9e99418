// Install/activate state machine. Owns generation turnover and reload coordination.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::cache::{CacheStore, GenerationId, GenerationStatus};
use super::channel::{ClientChannel, SessionId};
use super::downloader::Downloader;
use super::manifest::AssetManifest;
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Installing,
    Waiting,
    Activating,
    Active,
    Superseded,
}

impl LifecycleState {
    fn can_follow(self, previous: Option<LifecycleState>) -> bool {
        use LifecycleState::*;
        matches!(
            (previous, self),
            (None, Installing)
                | (Some(Installing), Waiting)
                | (Some(Waiting), Activating)
                | (Some(Activating), Active)
                | (Some(Active), Superseded)
                // A generation stuck claiming sessions can still be replaced.
                | (Some(Activating), Superseded)
        )
    }
}

/// Which observation reported a generation transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadSignal {
    ActivationComplete,
    ControllerChange,
}

/// Guards against duplicate or overlapping reload triggers.
#[derive(Debug, Default)]
pub struct PendingReload {
    in_progress: bool,
    generation: Option<String>,
}

impl PendingReload {
    /// Check-and-set. Returns `true` only for the first signal of an episode.
    pub fn try_begin(&mut self, generation: &str) -> bool {
        if self.generation.as_deref() == Some(generation) {
            return false;
        }
        self.in_progress = true;
        self.generation = Some(generation.to_string());
        true
    }

    pub fn finish(&mut self) {
        self.in_progress = false;
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress
    }
}

/// Mutable coordinator state, owned explicitly rather than held in globals.
#[derive(Debug, Default)]
pub struct WorkerState {
    active: Option<GenerationId>,
    incoming: Option<GenerationId>,
    phases: BTreeMap<String, LifecycleState>,
    pending_reload: PendingReload,
}

impl WorkerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transition(&mut self, name: &str, next: LifecycleState) -> Result<(), EngineError> {
        let previous = self.phases.get(name).copied();
        if !next.can_follow(previous) {
            return Err(EngineError::InvariantViolation(format!(
                "generation {} cannot move from {:?} to {:?}",
                name, previous, next
            )));
        }
        self.phases.insert(name.to_string(), next);
        info!("lifecycle generation={} {:?} -> {:?}", name, previous, next);
        Ok(())
    }

    pub fn phase(&self, name: &str) -> Option<LifecycleState> {
        self.phases.get(name).copied()
    }

    pub fn active(&self) -> Option<&GenerationId> {
        self.active.as_ref()
    }

    pub fn incoming(&self) -> Option<&GenerationId> {
        self.incoming.as_ref()
    }

    pub fn pending_reload(&self) -> &PendingReload {
        &self.pending_reload
    }

    fn forget(&mut self, name: &str) {
        self.phases.remove(name);
    }

    fn count_in(&self, state: LifecycleState) -> usize {
        self.phases.values().filter(|p| **p == state).count()
    }
}

#[derive(Debug, Clone)]
pub struct ActivationReport {
    pub generation: GenerationId,
    pub superseded: Option<String>,
    pub deleted: Vec<String>,
    /// False when sessions could not be claimed; the coordinator stays in Activating.
    pub claimed: bool,
    pub reloads_triggered: usize,
}

#[derive(Debug)]
pub struct InstallReport {
    pub generation: GenerationId,
    pub stored: Vec<String>,
    pub failed: Vec<String>,
    pub activation: Option<ActivationReport>,
}

pub struct LifecycleCoordinator {
    store: Arc<CacheStore>,
    channel: Arc<ClientChannel>,
    downloader: Arc<Downloader>,
    manifest: AssetManifest,
    cache_prefix: String,
    ignore_query: bool,
    skip_waiting_on_install: bool,
    state: Mutex<WorkerState>,
}

impl LifecycleCoordinator {
    pub fn new(
        store: Arc<CacheStore>,
        channel: Arc<ClientChannel>,
        downloader: Arc<Downloader>,
        manifest: AssetManifest,
        cache_prefix: String,
        ignore_query: bool,
        skip_waiting_on_install: bool,
    ) -> Self {
        Self {
            store,
            channel,
            downloader,
            manifest,
            cache_prefix,
            ignore_query,
            skip_waiting_on_install,
            state: Mutex::new(WorkerState::new()),
        }
    }

    /// Build and populate a new generation, then promote it straight away when
    /// configured to skip waiting.
    pub async fn install(&self, version: u32) -> Result<InstallReport, EngineError> {
        let generation = GenerationId::new(&self.cache_prefix, version);

        let discarded = {
            let mut state = self.state.lock();
            if let Some(active) = &state.active {
                if version <= active.version {
                    return Err(EngineError::StaleVersion {
                        requested: version,
                        active: active.version,
                    });
                }
            }
            let discarded = match state.incoming.take() {
                Some(prev) if state.phase(&prev.name) != Some(LifecycleState::Waiting) => {
                    let name = prev.name.clone();
                    state.incoming = Some(prev);
                    return Err(EngineError::InstallInProgress(name));
                }
                Some(prev) if version <= prev.version => {
                    let waiting = prev.version;
                    state.incoming = Some(prev);
                    return Err(EngineError::StaleVersion {
                        requested: version,
                        active: waiting,
                    });
                }
                Some(prev) => {
                    state.forget(&prev.name);
                    Some(prev)
                }
                None => None,
            };
            state.transition(&generation.name, LifecycleState::Installing)?;
            state.incoming = Some(generation.clone());
            discarded
        };

        if let Some(prev) = discarded {
            info!("discarding waiting generation={} for {}", prev.name, generation.name);
            self.store.delete_generation(&prev.name)?;
        }

        info!("installing generation={}", generation.name);
        self.store.open_generation(&generation.name);
        let outcomes = match self
            .store
            .put_all(&generation.name, &self.manifest, &self.downloader, self.ignore_query)
            .await
        {
            Ok(outcomes) => outcomes,
            Err(e) => {
                let mut state = self.state.lock();
                state.forget(&generation.name);
                state.incoming = None;
                return Err(e);
            }
        };

        let (stored, failed): (Vec<_>, Vec<_>) = outcomes.into_iter().partition(|o| o.is_stored());
        let stored: Vec<String> = stored.into_iter().map(|o| o.path).collect();
        let failed: Vec<String> = failed.into_iter().map(|o| o.path).collect();
        if !failed.is_empty() {
            warn!(
                "generation={} ready with partial coverage, missing {:?}",
                generation.name, failed
            );
        }

        self.store.set_status(&generation.name, GenerationStatus::Ready)?;
        let has_active = {
            let mut state = self.state.lock();
            state.transition(&generation.name, LifecycleState::Waiting)?;
            state.active.is_some()
        };
        if has_active {
            self.channel.announce_update(&generation);
        }

        let activation = if self.skip_waiting_on_install {
            self.activate_waiting()?
        } else {
            None
        };

        Ok(InstallReport {
            generation,
            stored,
            failed,
            activation,
        })
    }

    /// Explicit request to short-circuit Waiting. Also retries a pending claim
    /// when a previous activation left the coordinator in Activating.
    pub fn skip_waiting(&self) -> Result<Option<ActivationReport>, EngineError> {
        let stuck = {
            let state = self.state.lock();
            state
                .active
                .as_ref()
                .filter(|a| state.phase(&a.name) == Some(LifecycleState::Activating))
                .cloned()
        };
        if let Some(generation) = stuck {
            info!("retrying claim for generation={}", generation.name);
            let mut report = self.finish_activation(generation, None, Vec::new());
            if report.claimed {
                report.deleted.extend(self.cleanup()?);
            }
            return Ok(Some(report));
        }
        self.activate_waiting()
    }

    fn activate_waiting(&self) -> Result<Option<ActivationReport>, EngineError> {
        let (generation, previous) = {
            let mut state = self.state.lock();
            let generation = match &state.incoming {
                Some(g) if state.phase(&g.name) == Some(LifecycleState::Waiting) => g.clone(),
                _ => {
                    debug!("skip waiting: nothing is waiting");
                    return Ok(None);
                }
            };
            state.transition(&generation.name, LifecycleState::Activating)?;
            state.incoming = None;
            (generation, state.active.clone())
        };

        info!("activating generation={}", generation.name);

        // Keep only the new generation and the one it immediately supersedes.
        let mut deleted = Vec::new();
        for name in self.store.list_generations() {
            let keep = name == generation.name
                || previous.as_ref().map(|p| p.name == name).unwrap_or(false);
            if !keep && self.store.delete_generation(&name)? {
                deleted.push(name);
            }
        }

        if let Some(prev) = &previous {
            self.store
                .set_status(&prev.name, GenerationStatus::Superseded)?;
        }
        self.store.set_status(&generation.name, GenerationStatus::Active)?;

        {
            let mut state = self.state.lock();
            if let Some(prev) = &previous {
                state.transition(&prev.name, LifecycleState::Superseded)?;
            }
            for name in &deleted {
                state.forget(name);
            }
            state.active = Some(generation.clone());
            debug_assert!(state.count_in(LifecycleState::Active) <= 1);
        }

        let superseded = previous.map(|p| p.name);
        let mut report = self.finish_activation(generation, superseded, deleted);
        report.deleted.extend(self.cleanup()?);
        Ok(Some(report))
    }

    /// Claim sessions (retrying once), then announce and coordinate reloads.
    fn finish_activation(
        &self,
        generation: GenerationId,
        superseded: Option<String>,
        deleted: Vec<String>,
    ) -> ActivationReport {
        let claimed = match self.channel.claim_all(&generation.name) {
            Ok(_) => true,
            Err(first) => {
                warn!("claim for {} failed, retrying once: {}", generation.name, first);
                match self.channel.claim_all(&generation.name) {
                    Ok(_) => true,
                    Err(second) => {
                        error!(
                            "claim for {} failed after retry, staying in Activating: {}",
                            generation.name, second
                        );
                        false
                    }
                }
            }
        };

        let mut report = ActivationReport {
            generation: generation.clone(),
            superseded,
            deleted,
            claimed,
            reloads_triggered: 0,
        };
        if !claimed {
            return report;
        }

        {
            let mut state = self.state.lock();
            if let Err(e) = state.transition(&generation.name, LifecycleState::Active) {
                error!("{}", e);
                return report;
            }
        }

        self.channel.announce_ready(&generation);
        report.reloads_triggered =
            self.coordinate_reload(ReloadSignal::ActivationComplete, &generation);
        info!(
            "generation={} active, reloads triggered={}",
            generation.name, report.reloads_triggered
        );
        report
    }

    /// Force-reload sessions running pages from an older generation. Whichever
    /// signal arrives first for a transition wins; later ones are ignored.
    pub fn coordinate_reload(&self, signal: ReloadSignal, generation: &GenerationId) -> usize {
        let begun = self.state.lock().pending_reload.try_begin(&generation.name);
        if !begun {
            debug!(
                "reload for {} already initiated, ignoring {:?}",
                generation.name, signal
            );
            return 0;
        }

        let new_identities = self.store.identities(&generation.name);
        let mut triggered = 0;
        for (id, old) in self.channel.lagging_sessions(&generation.name) {
            // A vanished generation cannot be proven consistent with the new one.
            let overlaps = match self.store.status(&old) {
                Some(_) => !self
                    .store
                    .identities(&old)
                    .is_disjoint(&new_identities),
                None => true,
            };
            if overlaps && self.channel.force_reload(id, generation) {
                triggered += 1;
            }
        }

        debug!(
            "reload signal={:?} generation={} triggered={}",
            signal, generation.name, triggered
        );
        if triggered == 0 {
            self.state.lock().pending_reload.finish();
        }
        triggered
    }

    /// A page observed its controller change.
    pub fn on_controller_changed(&self) -> usize {
        let active = self.state.lock().active.clone();
        match active {
            Some(generation) => self.coordinate_reload(ReloadSignal::ControllerChange, &generation),
            None => 0,
        }
    }

    /// A page finished reloading onto the Active generation.
    pub fn on_session_reloaded(&self, session: SessionId) -> Result<Vec<String>, EngineError> {
        let active = match self.state.lock().active.clone() {
            Some(a) => a,
            None => return Ok(Vec::new()),
        };
        self.channel.mark_reloaded(session, &active.name)?;
        if !self.channel.has_outstanding_reloads(&active.name) {
            self.state.lock().pending_reload.finish();
        }
        self.cleanup()
    }

    /// Delete Superseded generations no session is still running a page from.
    pub fn cleanup(&self) -> Result<Vec<String>, EngineError> {
        let mut deleted = Vec::new();
        for name in self.store.generations_with_status(GenerationStatus::Superseded) {
            if self.channel.controlled_by(&name) > 0 {
                debug!("keeping superseded generation={} for lagging sessions", name);
                continue;
            }
            if self.store.delete_generation(&name)? {
                deleted.push(name);
            }
        }
        if !deleted.is_empty() {
            let mut state = self.state.lock();
            for name in &deleted {
                state.forget(name);
            }
        }
        Ok(deleted)
    }

    /// Drop every entry of the Active generation. Returns the number removed.
    pub fn clear_active(&self) -> Result<usize, EngineError> {
        match self.active() {
            Some(generation) => {
                let removed = self.store.clear_entries(&generation.name)?;
                info!("cleared {} entries from {}", removed, generation.name);
                Ok(removed)
            }
            None => Ok(0),
        }
    }

    pub fn active(&self) -> Option<GenerationId> {
        self.state.lock().active.clone()
    }

    pub fn waiting(&self) -> Option<GenerationId> {
        let state = self.state.lock();
        state
            .incoming
            .as_ref()
            .filter(|g| state.phase(&g.name) == Some(LifecycleState::Waiting))
            .cloned()
    }

    pub fn phase(&self, name: &str) -> Option<LifecycleState> {
        self.state.lock().phase(name)
    }

    pub fn reload_in_progress(&self) -> bool {
        self.state.lock().pending_reload.in_progress()
    }
}
