//! Engine tuning knobs, loadable from a TOML file.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// TCP connect (and TLS handshake) limit inside one exchange.
    pub connect_timeout_ms: u64,
    /// Whole reachability/latency round trip.
    pub round_trip_timeout_ms: u64,
    /// Extra round trips used to measure jitter.
    pub jitter_rounds: usize,
    pub transfer_timeout_ms: u64,
    pub download_bytes: u64,
    pub upload_bytes: u64,
    /// Throughput measurements allowed to run at once within a scan.
    pub throughput_slots: usize,
    /// Host used for throughput requests.
    pub speed_host: String,
    pub trace_path: String,
    /// How long a stopped scan waits for in-flight probes before abandoning them.
    pub stop_grace_ms: u64,
    pub log_capacity: usize,
    /// Log lines included in a status snapshot.
    pub log_tail: usize,
    /// How long finished scans stay queryable.
    pub retention_secs: u64,
    pub cidr_expansion_limit: usize,
    pub fetch_timeout_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3_000,
            round_trip_timeout_ms: 5_000,
            jitter_rounds: 4,
            transfer_timeout_ms: 15_000,
            download_bytes: 1_000_000,
            upload_bytes: 500_000,
            throughput_slots: 1,
            speed_host: "speed.cloudflare.com".into(),
            trace_path: "/cdn-cgi/trace".into(),
            stop_grace_ms: 3_000,
            log_capacity: 200,
            log_tail: 100,
            retention_secs: 3_600,
            cidr_expansion_limit: 1_024,
            fetch_timeout_ms: 10_000,
        }
    }
}

impl EngineSettings {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).context("invalid engine settings")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine settings: {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn round_trip_timeout(&self) -> Duration {
        Duration::from_millis(self.round_trip_timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}
