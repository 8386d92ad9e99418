// Shared test helpers: an in-memory network and worker configuration.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use offline_proxy_engine::config::EngineConfig;
use offline_proxy_engine::engine::channel::WorkerMessage;
use offline_proxy_engine::source::traits::{FetchRequest, FetchResponse, NetworkSource};

pub const ORIGIN: &str = "http://app.test";

/// Network stub keyed by path. Records every fetch it sees.
pub struct StubNetwork {
    routes: Mutex<HashMap<String, FetchResponse>>,
    online: AtomicBool,
    delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<String>>,
}

impl StubNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
            delay: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// A network serving the default shell: `/`, `/index.html`, `/styles.css`.
    pub fn with_shell(tag: &str) -> Arc<Self> {
        let net = Self::new();
        net.serve_shell(tag);
        net
    }

    pub fn serve_shell(&self, tag: &str) {
        self.serve("/", "text/html", &format!("<html>{} root</html>", tag));
        self.serve("/index.html", "text/html", &format!("<html>{} index</html>", tag));
        self.serve("/styles.css", "text/css", &format!("body{{/*{}*/}}", tag));
    }

    pub fn serve(&self, path: &str, content_type: &str, body: &str) {
        self.routes.lock().insert(
            path.to_string(),
            FetchResponse::new(200, content_type.to_string(), body.to_string()),
        );
    }

    pub fn remove(&self, path: &str) {
        self.routes.lock().remove(path);
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    pub fn calls_for(&self, path: &str) -> usize {
        self.calls.lock().iter().filter(|p| p.as_str() == path).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    /// Poll until `path` has been fetched at least `n` times.
    pub async fn wait_for_calls(&self, path: &str, n: usize) -> bool {
        for _ in 0..200 {
            if self.calls_for(path) >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

#[async_trait]
impl NetworkSource for StubNetwork {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        self.calls.lock().push(request.url.path().to_string());

        let delay = *self.delay.lock();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(anyhow!("network unreachable"));
        }

        let route = self.routes.lock().get(request.url.path()).cloned();
        Ok(route.unwrap_or_else(|| FetchResponse::new(404, "text/plain", "not found")))
    }
}

pub fn test_config(version: u32) -> EngineConfig {
    EngineConfig {
        origin: ORIGIN.to_string(),
        version,
        manifest: vec![
            String::new(),
            "index.html".to_string(),
            "styles.css".to_string(),
        ],
        network_timeout_ms: 200,
        ..EngineConfig::default()
    }
}

pub fn identity(path: &str) -> String {
    format!("{}{}", ORIGIN, path)
}

pub fn url(path: &str) -> reqwest::Url {
    reqwest::Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

pub fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<WorkerMessage>) -> Vec<WorkerMessage> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

pub fn count_reloads(messages: &[WorkerMessage]) -> usize {
    messages
        .iter()
        .filter(|m| matches!(m, WorkerMessage::ForceReload { .. }))
        .count()
}
