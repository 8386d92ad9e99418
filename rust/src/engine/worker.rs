// The worker: owns every coordinator component and dispatches session messages.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use super::cache::CacheStore;
use super::channel::{ClientChannel, ClientMessage, SessionId, WorkerMessage};
use super::downloader::Downloader;
use super::interceptor::{InterceptedResponse, RequestInterceptor};
use super::lifecycle::{InstallReport, LifecycleCoordinator};
use super::manifest::AssetManifest;
use super::policy::CachePolicy;
use super::stats::{StatsCollector, StatsSnapshot};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::source::traits::{FetchRequest, NetworkSource};

pub struct ShellWorker {
    config: EngineConfig,
    store: Arc<CacheStore>,
    channel: Arc<ClientChannel>,
    coordinator: LifecycleCoordinator,
    interceptor: RequestInterceptor,
    stats: Arc<StatsCollector>,
}

impl ShellWorker {
    pub fn new(config: EngineConfig, source: Arc<dyn NetworkSource>) -> Result<Self, EngineError> {
        config.validate()?;
        let origin = config.origin_url()?;
        let manifest = AssetManifest::new(origin.clone(), config.manifest_paths(), config.ignore_query);
        let policy = CachePolicy::new(&config, &manifest)?;
        let offline_url = origin.join(&config.offline_document_path()).map_err(|e| {
            EngineError::Config(format!("invalid offline document path: {}", e))
        })?;

        let store = Arc::new(CacheStore::new());
        let channel = Arc::new(ClientChannel::new());
        let stats = Arc::new(StatsCollector::new());
        let downloader = Arc::new(Downloader::new(
            Arc::clone(&source),
            config.precache_concurrency,
            config.network_timeout(),
            config.precache_retries,
            Arc::clone(&stats),
        ));

        let coordinator = LifecycleCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&channel),
            downloader,
            manifest,
            config.cache_prefix.clone(),
            config.ignore_query,
            config.skip_waiting_on_install,
        );
        let interceptor = RequestInterceptor::new(
            policy,
            Arc::clone(&store),
            Arc::clone(&channel),
            source,
            Arc::clone(&stats),
            config.network_timeout(),
            offline_url,
            config.ignore_query,
        );

        Ok(Self {
            config,
            store,
            channel,
            coordinator,
            interceptor,
            stats,
        })
    }

    /// Install the configured version.
    pub async fn start(&self) -> Result<InstallReport, EngineError> {
        info!(
            "worker starting origin={} generation={}",
            self.config.origin,
            self.config.generation_name()
        );
        self.coordinator.install(self.config.version).await
    }

    /// Install a newly deployed version.
    pub async fn deploy(&self, version: u32) -> Result<InstallReport, EngineError> {
        self.coordinator.install(version).await
    }

    pub async fn fetch(
        &self,
        request: FetchRequest,
        session: Option<SessionId>,
    ) -> Result<InterceptedResponse, EngineError> {
        self.interceptor.handle(request, session).await
    }

    /// Register a page that loaded from the Active generation (or uncontrolled
    /// when nothing is active yet).
    pub fn connect(&self) -> (SessionId, mpsc::UnboundedReceiver<WorkerMessage>) {
        let controlling = self.coordinator.active().map(|g| g.name);
        self.channel.register(controlling)
    }

    /// Register a page that loaded from a specific generation.
    pub fn connect_from(
        &self,
        generation: Option<String>,
    ) -> (SessionId, mpsc::UnboundedReceiver<WorkerMessage>) {
        self.channel.register(generation)
    }

    pub fn disconnect(&self, session: SessionId) -> bool {
        self.channel.unregister(session)
    }

    /// Handle one inbound message. Returns the reply for the same transaction,
    /// if the message has one.
    pub fn handle_message(
        &self,
        session: SessionId,
        message: ClientMessage,
    ) -> Result<Option<WorkerMessage>, EngineError> {
        if !self.channel.contains(session) {
            return Err(EngineError::UnknownSession(session));
        }
        debug!("session {} sent {:?}", session, message);

        match message {
            ClientMessage::SkipWaiting => {
                self.coordinator.skip_waiting()?;
                Ok(Some(WorkerMessage::Ack))
            }
            ClientMessage::GetVersion => {
                let active = self.coordinator.active();
                Ok(Some(WorkerMessage::Version {
                    version: active.as_ref().map(|g| g.name.clone()),
                    version_number: active.map(|g| g.version),
                }))
            }
            ClientMessage::ClearCache => {
                let success = self.coordinator.clear_active().is_ok();
                Ok(Some(WorkerMessage::CacheCleared { success }))
            }
            ClientMessage::CheckUpdate => Ok(Some(WorkerMessage::UpdateStatus {
                has_update: self.coordinator.waiting().is_some(),
                current_version: self.coordinator.active().map(|g| g.version),
            })),
            ClientMessage::ControllerChanged => {
                self.coordinator.on_controller_changed();
                Ok(None)
            }
            ClientMessage::Reloaded => {
                self.coordinator.on_session_reloaded(session)?;
                Ok(None)
            }
        }
    }

    pub fn shutdown(&self) {
        self.interceptor.shutdown();
        info!("worker shut down");
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn channel(&self) -> &Arc<ClientChannel> {
        &self.channel
    }

    pub fn coordinator(&self) -> &LifecycleCoordinator {
        &self.coordinator
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}
