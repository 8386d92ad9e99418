use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::engine::channel::{ClientMessage, WorkerMessage};
use crate::engine::lifecycle::InstallReport;
use crate::engine::stats::StatsSnapshot;
use crate::engine::worker::ShellWorker;
use crate::server::handler::ProxyServer;
use crate::source::http_source::HttpSource;
use crate::source::traits::NetworkSource;

use super::simple::init_tracing;

/// Information about a connected page session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: u64,
    pub proxy_url: String,
    pub controlling_generation: Option<String>,
}

/// Running worker plus its HTTP front end.
pub struct ProxyEngine {
    server: ProxyServer,
    worker: Arc<ShellWorker>,
}

/// Start the worker against the real network, install the configured version
/// and begin serving on a local port.
pub async fn init_engine(config: EngineConfig) -> Result<(ProxyEngine, InstallReport)> {
    init_engine_with_source(config, Arc::new(HttpSource::new())).await
}

pub async fn init_engine_with_source(
    config: EngineConfig,
    source: Arc<dyn NetworkSource>,
) -> Result<(ProxyEngine, InstallReport)> {
    init_tracing();
    let worker = Arc::new(ShellWorker::new(config, source)?);
    let report = worker.start().await?;
    let server = ProxyServer::start(Arc::clone(&worker)).await?;
    Ok((ProxyEngine { server, worker }, report))
}

impl ProxyEngine {
    /// Connect an in-process page session.
    pub fn create_session(&self) -> (SessionInfo, mpsc::UnboundedReceiver<WorkerMessage>) {
        let (session_id, rx) = self.worker.connect();
        let info = SessionInfo {
            session_id,
            proxy_url: self.server.base_url(),
            controlling_generation: self.worker.channel().controlling_generation(session_id),
        };
        (info, rx)
    }

    pub fn close_session(&self, session_id: u64) -> bool {
        self.worker.disconnect(session_id)
    }

    pub fn post_message(
        &self,
        session_id: u64,
        message: ClientMessage,
    ) -> Result<Option<WorkerMessage>> {
        Ok(self.worker.handle_message(session_id, message)?)
    }

    /// Roll out a newly deployed version.
    pub async fn deploy(&self, version: u32) -> Result<InstallReport> {
        Ok(self.worker.deploy(version).await?)
    }

    /// Return a snapshot of worker statistics.
    pub fn watch_stats(&self) -> StatsSnapshot {
        self.worker.stats()
    }

    pub fn proxy_url(&self) -> String {
        self.server.base_url()
    }

    pub fn worker(&self) -> &Arc<ShellWorker> {
        &self.worker
    }

    /// Shut down the server and the worker's background work.
    pub fn dispose(self) {
        self.server.shutdown();
    }
}
