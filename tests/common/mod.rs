//! Scripted collaborators shared by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use edge_scan_rs::controller::{ScanController, ScanDeps};
use edge_scan_rs::error::{SourceError, TransportError};
use edge_scan_rs::registry::ScanRegistry;
use edge_scan_rs::settings::EngineSettings;
use edge_scan_rs::source::ListFetcher;
use edge_scan_rs::transport::{Dial, RoundTrip, Transfer, Transport};
use edge_scan_rs::types::{ScanRequest, ScanStatus, SourceSelector, Thresholds};

pub const BASE: &str =
    "vless://0b7c-uuid@edge.example.com:443?encryption=none&security=tls&sni=edge.example.com&type=ws&host=edge.example.com&path=%2F#base";

/// Behaviour of one host.
#[derive(Clone, Debug)]
pub struct Plan {
    /// Reported latencies, cycled per round trip.
    pub latencies: Vec<u64>,
    pub fail: Option<TransportError>,
    /// Real time each round trip takes.
    pub delay: Duration,
    pub download_mbps: f64,
    pub upload: Result<f64, TransportError>,
    /// Real time each download or upload takes.
    pub transfer_delay: Duration,
    /// Location reported by the edge trace.
    pub location: &'static str,
    pub panic: bool,
}

impl Default for Plan {
    fn default() -> Self {
        Self {
            latencies: vec![100],
            fail: None,
            delay: Duration::ZERO,
            download_mbps: 50.0,
            upload: Ok(20.0),
            transfer_delay: Duration::ZERO,
            location: "DE",
            panic: false,
        }
    }
}

impl Plan {
    pub fn latency(ms: u64) -> Self {
        Self { latencies: vec![ms], ..Self::default() }
    }

    pub fn failing(e: TransportError) -> Self {
        Self { fail: Some(e), ..Self::default() }
    }

    pub fn slow(delay_ms: u64) -> Self {
        Self { delay: Duration::from_millis(delay_ms), ..Self::default() }
    }
}

#[derive(Default)]
pub struct ScriptedTransport {
    plans: HashMap<String, Plan>,
    default: Plan,
    calls: Mutex<HashMap<String, usize>>,
    pub dials: Mutex<Vec<Dial>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub round_trips: AtomicUsize,
    pub downloads: AtomicUsize,
    pub uploads: AtomicUsize,
    transfers_in_flight: AtomicUsize,
    pub max_transfers_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(default: Plan) -> Self {
        Self { default, ..Self::default() }
    }

    pub fn with(mut self, host: &str, plan: Plan) -> Self {
        self.plans.insert(host.to_string(), plan);
        self
    }

    fn plan(&self, dial: &Dial) -> &Plan {
        self.plans.get(&dial.host.to_string()).unwrap_or(&self.default)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn transfer(&self, dial: &Dial) {
        let now = self.transfers_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _busy = Busy(&self.transfers_in_flight);
        self.max_transfers_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = self.plan(dial).transfer_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

struct Busy<'a>(&'a AtomicUsize);

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn round_trip(&self, dial: &Dial, _timeout: Duration) -> Result<RoundTrip, TransportError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _busy = Busy(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        self.dials.lock().unwrap().push(dial.clone());

        let plan = self.plan(dial).clone();
        if !plan.delay.is_zero() {
            tokio::time::sleep(plan.delay).await;
        }
        if plan.panic {
            panic!("scripted transport panic for {}", dial.host);
        }
        if let Some(e) = plan.fail {
            return Err(e);
        }
        let n = {
            let mut calls = self.calls.lock().unwrap();
            let slot = calls.entry(dial.host.to_string()).or_insert(0);
            *slot += 1;
            *slot - 1
        };
        let latency = plan.latencies[n % plan.latencies.len()];
        Ok(RoundTrip {
            latency: Duration::from_millis(latency),
            datacenter: Some("FRA".into()),
            location: Some(plan.location.to_string()),
            asn: None,
            peer: None,
        })
    }

    async fn download(&self, dial: &Dial, _bytes: u64, _timeout: Duration) -> Result<Transfer, TransportError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.transfer(dial).await;
        let mbps = self.plan(dial).download_mbps;
        Ok(Transfer { bytes: (mbps * 125_000.0) as u64, elapsed: Duration::from_secs(1) })
    }

    async fn upload(&self, dial: &Dial, _bytes: u64, _timeout: Duration) -> Result<Transfer, TransportError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.transfer(dial).await;
        let mbps = self.plan(dial).upload.clone()?;
        Ok(Transfer { bytes: (mbps * 125_000.0) as u64, elapsed: Duration::from_secs(1) })
    }
}

#[derive(Default)]
pub struct MockFetcher {
    bodies: HashMap<String, Result<String, SourceError>>,
}

impl MockFetcher {
    pub fn with(mut self, url: &str, body: Result<String, SourceError>) -> Self {
        self.bodies.insert(url.to_string(), body);
        self
    }
}

#[async_trait]
impl ListFetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<String, SourceError> {
        self.bodies.get(url).cloned().unwrap_or_else(|| {
            Err(SourceError::Fetch { url: url.to_string(), reason: "HTTP 404 Not Found".into() })
        })
    }
}

/// Fetcher whose every call panics.
pub struct PanickingFetcher;

#[async_trait]
impl ListFetcher for PanickingFetcher {
    async fn fetch(&self, url: &str) -> Result<String, SourceError> {
        panic!("list fetcher blew up on {url}");
    }
}

pub fn test_settings() -> EngineSettings {
    EngineSettings {
        jitter_rounds: 1,
        stop_grace_ms: 300,
        round_trip_timeout_ms: 2_000,
        transfer_timeout_ms: 2_000,
        ..EngineSettings::default()
    }
}

pub fn registry(transport: Arc<ScriptedTransport>) -> ScanRegistry {
    registry_with(transport, MockFetcher::default())
}

pub fn registry_with(transport: Arc<ScriptedTransport>, fetcher: MockFetcher) -> ScanRegistry {
    let deps = ScanDeps { transport, fetcher: Arc::new(fetcher) };
    ScanRegistry::new(deps, test_settings())
}

/// Manual-list request without throughput minima.
pub fn manual_request(entries: &str) -> ScanRequest {
    let mut req = ScanRequest::new(BASE, SourceSelector::ManualList { entries: entries.into() });
    req.thresholds = Thresholds { min_download_mbps: 0.0, min_upload_mbps: 0.0, ..Thresholds::default() };
    req.stop_after = 1_000;
    req
}

/// `n` distinct addresses under 10.0.0.0/16, comma separated.
pub fn hosts(n: usize) -> String {
    (1..=n).map(|i| format!("10.0.{}.{}", i / 250, i % 250 + 1)).collect::<Vec<_>>().join(",")
}

pub async fn finish(controller: &ScanController) -> ScanStatus {
    tokio::time::timeout(Duration::from_secs(20), controller.wait_terminal())
        .await
        .expect("scan did not finish in time")
}
