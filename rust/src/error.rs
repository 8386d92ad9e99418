// Fault taxonomy for the cache-and-update coordinator.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("manifest fetch failed for {path}: {reason}")]
    ManifestFetch { path: String, reason: String },

    #[error("network timeout after {millis} ms: {url}")]
    NetworkTimeout { url: String, millis: u64 },

    #[error("network error for {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("failed to claim sessions for {generation}: {reason}")]
    ActivationClaim { generation: String, reason: String },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("generation {0} is already installing")]
    InstallInProgress(String),

    #[error("version {requested} is not newer than active version {active}")]
    StaleVersion { requested: u32, active: u32 },

    #[error("unknown session: {0}")]
    UnknownSession(u64),

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Whether the interceptor should walk its fallback chain for this fault.
    pub fn triggers_fallback(&self) -> bool {
        matches!(
            self,
            EngineError::NetworkTimeout { .. }
                | EngineError::Network { .. }
                | EngineError::Storage(_)
        )
    }
}
