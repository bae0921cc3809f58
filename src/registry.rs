//! Process-wide table of scans, keyed by scan id.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::BaseConfig;
use crate::controller::{ScanController, ScanDeps};
use crate::error::{ControlError, SetupError};
use crate::settings::EngineSettings;
use crate::source::HttpListFetcher;
use crate::transport::EdgeTransport;
use crate::types::{ScanId, ScanRequest, ScanSnapshot};

pub struct ScanRegistry {
    scans: RwLock<HashMap<ScanId, ScanController>>,
    deps: ScanDeps,
    settings: Arc<EngineSettings>,
}

impl ScanRegistry {
    pub fn new(deps: ScanDeps, settings: EngineSettings) -> Self {
        Self {
            scans: RwLock::new(HashMap::new()),
            deps,
            settings: Arc::new(settings),
        }
    }

    /// Registry wired to the network: [`EdgeTransport`] and [`HttpListFetcher`].
    pub fn with_network(settings: EngineSettings) -> reqwest::Result<Self> {
        let deps = ScanDeps {
            transport: Arc::new(EdgeTransport::new(&settings)),
            fetcher: Arc::new(HttpListFetcher::new(settings.fetch_timeout())?),
        };
        Ok(Self::new(deps, settings))
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Validates the request and base config, then launches the scan. Nothing is
    /// registered when this fails.
    pub async fn start(&self, request: ScanRequest) -> Result<ScanId, SetupError> {
        request.validate()?;
        let base: BaseConfig = request.base_config.parse()?;

        let mut scans = self.scans.write().await;
        let mut id = ScanId::new();
        while scans.contains_key(&id) {
            id = ScanId::new();
        }
        info!(scan_id = %id, source = request.source.name(), concurrency = request.concurrency, "starting scan");
        let controller = ScanController::launch(id, request, base, self.deps.clone(), self.settings.clone());
        scans.insert(id, controller);
        Ok(id)
    }

    /// Looks a scan up by its textual id. Malformed ids are simply not found.
    pub async fn get(&self, id: &str) -> Result<ScanController, ControlError> {
        let not_found = || ControlError::NotFound(id.to_string());
        let key: ScanId = id.parse().map_err(|_| not_found())?;
        self.scans.read().await.get(&key).cloned().ok_or_else(not_found)
    }

    pub async fn status(&self, id: &str) -> Result<ScanSnapshot, ControlError> {
        Ok(self.get(id).await?.snapshot().await)
    }

    pub async fn pause(&self, id: &str) -> Result<(), ControlError> {
        self.get(id).await?.pause().await
    }

    pub async fn resume(&self, id: &str) -> Result<(), ControlError> {
        self.get(id).await?.resume().await
    }

    pub async fn stop(&self, id: &str) -> Result<(), ControlError> {
        self.get(id).await?.stop().await
    }

    pub async fn len(&self) -> usize {
        self.scans.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.scans.read().await.is_empty()
    }

    /// Forgets scans that finished longer ago than the retention window.
    pub async fn sweep(&self) -> usize {
        let retention = self.settings.retention();
        let now = Instant::now();
        let controllers: Vec<ScanController> = self.scans.read().await.values().cloned().collect();
        let mut expired = Vec::new();
        for c in controllers {
            if let Some(done) = c.finished_at().await {
                if now.saturating_duration_since(done) >= retention {
                    expired.push(c.id());
                }
            }
        }
        if expired.is_empty() {
            return 0;
        }
        let mut scans = self.scans.write().await;
        for id in &expired {
            scans.remove(id);
        }
        debug!(removed = expired.len(), "swept finished scans");
        expired.len()
    }

    /// Runs [`sweep`](Self::sweep) every `every` until the registry is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(registry) = weak.upgrade() else { break };
                registry.sweep().await;
            }
        })
    }

    /// Stops every scan that is still live.
    pub async fn shutdown(&self) {
        let controllers: Vec<ScanController> = self.scans.read().await.values().cloned().collect();
        for c in &controllers {
            let _ = c.stop().await;
        }
        info!(scans = controllers.len(), "registry shut down");
    }
}
