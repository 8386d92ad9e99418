// Worker <-> page session message bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::cache::GenerationId;
use crate::error::EngineError;

pub type SessionId = u64;

/// Veto consulted before sessions are claimed for a generation. Returning
/// `Err` holds the generation in Activating until a later claim succeeds.
pub type ClaimGuard = Arc<dyn Fn(&str) -> Result<(), String> + Send + Sync>;

/// Messages a page session sends to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    SkipWaiting,
    GetVersion,
    ClearCache,
    CheckUpdate,
    /// The page observed its controller change.
    ControllerChanged,
    /// The page finished reloading onto the current generation.
    Reloaded,
}

/// Messages the worker sends to a page session, either as notifications or
/// as the reply to a [`ClientMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    #[serde(rename = "SW_READY", rename_all = "camelCase")]
    Ready { version: String, version_number: u32 },
    #[serde(rename = "SW_ACTIVATED", rename_all = "camelCase")]
    ForceReload {
        version: String,
        version_number: u32,
        timestamp: i64,
        force_reload: bool,
    },
    #[serde(rename = "SW_UPDATED", rename_all = "camelCase")]
    Updated { version: String, version_number: u32 },
    #[serde(rename_all = "camelCase")]
    Version {
        version: Option<String>,
        version_number: Option<u32>,
    },
    CacheCleared { success: bool },
    #[serde(rename_all = "camelCase")]
    UpdateStatus {
        has_update: bool,
        current_version: Option<u32>,
    },
    Ack,
}

/// A connected page instance.
struct ClientSession {
    /// Generation whose assets the loaded page came from.
    controlling_generation: Option<String>,
    claimed_by: Option<String>,
    ready_sent_for: Option<String>,
    reload_sent_for: Option<String>,
    outbox: mpsc::UnboundedSender<WorkerMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub controlling_generation: Option<String>,
    pub claimed_by: Option<String>,
    pub reload_sent_for: Option<String>,
}

pub struct ClientChannel {
    sessions: RwLock<HashMap<SessionId, ClientSession>>,
    next_id: AtomicU64,
    claim_guard: RwLock<Option<ClaimGuard>>,
}

impl ClientChannel {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            claim_guard: RwLock::new(None),
        }
    }

    /// Install or remove the claim veto.
    pub fn set_claim_guard(&self, guard: Option<ClaimGuard>) {
        *self.claim_guard.write() = guard;
    }

    /// Register a page. Returns its id and the receiving end of its outbox.
    pub fn register(
        &self,
        controlling_generation: Option<String>,
    ) -> (SessionId, mpsc::UnboundedReceiver<WorkerMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        debug!(
            "session {} registered controlling={:?}",
            id, controlling_generation
        );
        self.sessions.write().insert(
            id,
            ClientSession {
                controlling_generation,
                claimed_by: None,
                ready_sent_for: None,
                reload_sent_for: None,
                outbox: tx,
            },
        );
        (id, rx)
    }

    pub fn unregister(&self, id: SessionId) -> bool {
        let removed = self.sessions.write().remove(&id).is_some();
        if removed {
            debug!("session {} unregistered", id);
        }
        removed
    }

    pub fn session(&self, id: SessionId) -> Option<SessionSnapshot> {
        self.sessions.read().get(&id).map(|s| SessionSnapshot {
            id,
            controlling_generation: s.controlling_generation.clone(),
            claimed_by: s.claimed_by.clone(),
            reload_sent_for: s.reload_sent_for.clone(),
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn controlling_generation(&self, id: SessionId) -> Option<String> {
        self.sessions
            .read()
            .get(&id)
            .and_then(|s| s.controlling_generation.clone())
    }

    /// Number of sessions whose loaded page came from `generation`.
    pub fn controlled_by(&self, generation: &str) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|s| s.controlling_generation.as_deref() == Some(generation))
            .count()
    }

    /// Sessions still running a page from a generation other than `active`.
    pub fn lagging_sessions(&self, active: &str) -> Vec<(SessionId, String)> {
        self.sessions
            .read()
            .iter()
            .filter_map(|(id, s)| match &s.controlling_generation {
                Some(g) if g != active => Some((*id, g.clone())),
                _ => None,
            })
            .collect()
    }

    /// Whether any lagging session has been told to reload and has not yet done so.
    pub fn has_outstanding_reloads(&self, active: &str) -> bool {
        self.sessions.read().values().any(|s| {
            s.reload_sent_for.as_deref() == Some(active)
                && s.controlling_generation.as_deref() != Some(active)
        })
    }

    /// Route every session through `generation`. Uncontrolled pages adopt it as
    /// their controlling generation; pages from older generations keep theirs
    /// until they reload. Sessions whose outbox is gone are pruned and reported.
    pub fn claim_all(&self, generation: &str) -> Result<usize, EngineError> {
        let guard = self.claim_guard.read().clone();
        if let Some(guard) = guard {
            guard(generation).map_err(|reason| EngineError::ActivationClaim {
                generation: generation.to_string(),
                reason,
            })?;
        }

        let mut sessions = self.sessions.write();
        let mut dead = Vec::new();
        for (id, session) in sessions.iter_mut() {
            if session.outbox.is_closed() {
                dead.push(*id);
                continue;
            }
            session.claimed_by = Some(generation.to_string());
            if session.controlling_generation.is_none() {
                session.controlling_generation = Some(generation.to_string());
            }
        }

        if dead.is_empty() {
            info!("claimed {} session(s) for {}", sessions.len(), generation);
            return Ok(sessions.len());
        }

        for id in &dead {
            sessions.remove(id);
        }
        Err(EngineError::ActivationClaim {
            generation: generation.to_string(),
            reason: format!("sessions {:?} disconnected during claim", dead),
        })
    }

    /// Send `SW_READY` once per session for `generation`.
    pub fn announce_ready(&self, generation: &GenerationId) -> usize {
        let mut sessions = self.sessions.write();
        let mut sent = 0;
        for (id, session) in sessions.iter_mut() {
            if session.ready_sent_for.as_deref() == Some(generation.name.as_str()) {
                continue;
            }
            session.ready_sent_for = Some(generation.name.clone());
            let msg = WorkerMessage::Ready {
                version: generation.name.clone(),
                version_number: generation.version,
            };
            if session.outbox.send(msg).is_ok() {
                sent += 1;
            } else {
                debug!("session {} outbox closed, ready dropped", id);
            }
        }
        sent
    }

    /// Tell every session a newer generation is installed and waiting.
    pub fn announce_update(&self, generation: &GenerationId) -> usize {
        let sessions = self.sessions.read();
        sessions
            .values()
            .filter(|s| {
                s.outbox
                    .send(WorkerMessage::Updated {
                        version: generation.name.clone(),
                        version_number: generation.version,
                    })
                    .is_ok()
            })
            .count()
    }

    /// Send a forced-reload directive. Idempotent per generation: a second call
    /// for the same session and generation is a no-op returning `false`.
    pub fn force_reload(&self, id: SessionId, generation: &GenerationId) -> bool {
        let mut sessions = self.sessions.write();
        let session = match sessions.get_mut(&id) {
            Some(s) => s,
            None => return false,
        };
        if session.reload_sent_for.as_deref() == Some(generation.name.as_str())
            || session.controlling_generation.as_deref() == Some(generation.name.as_str())
        {
            return false;
        }

        let msg = WorkerMessage::ForceReload {
            version: generation.name.clone(),
            version_number: generation.version,
            timestamp: Utc::now().timestamp_millis(),
            force_reload: true,
        };
        match session.outbox.send(msg) {
            Ok(()) => {
                session.reload_sent_for = Some(generation.name.clone());
                info!("session {} told to reload onto {}", id, generation.name);
                true
            }
            Err(_) => {
                warn!("session {} outbox closed, reload not delivered", id);
                false
            }
        }
    }

    /// Record that a session reloaded onto `generation`.
    pub fn mark_reloaded(&self, id: SessionId, generation: &str) -> Result<(), EngineError> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(&id).ok_or(EngineError::UnknownSession(id))?;
        session.controlling_generation = Some(generation.to_string());
        session.claimed_by = Some(generation.to_string());
        debug!("session {} now controlled by {}", id, generation);
        Ok(())
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.read().contains_key(&id)
    }
}

impl Default for ClientChannel {
    fn default() -> Self {
        Self::new()
    }
}
