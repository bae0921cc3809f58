use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ::time::{format_description::well_known, OffsetDateTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bypass::{BypassSweep, BypassVariant};
use crate::error::SetupError;

/// Opaque scan identifier, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanId(Uuid);

impl ScanId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ScanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ScanId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AddressFamily {
    #[default]
    Any,
    V4,
    V6,
}

impl AddressFamily {
    pub fn admits(self, ip: &IpAddr) -> bool {
        match self {
            AddressFamily::Any => true,
            AddressFamily::V4 => ip.is_ipv4(),
            AddressFamily::V6 => ip.is_ipv6(),
        }
    }

    pub fn of(ip: &IpAddr) -> Self {
        if ip.is_ipv4() {
            AddressFamily::V4
        } else {
            AddressFamily::V6
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CdnProvider {
    #[default]
    Cloudflare,
    Fastly,
}

/// Where the candidate pool of a scan comes from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSelector {
    OfficialRanges {
        #[serde(default)]
        provider: CdnProvider,
        #[serde(default = "default_sample_size")]
        sample_size: usize,
        #[serde(default)]
        seed: Option<u64>,
    },
    ManualList {
        entries: String,
    },
    ExternalUrl {
        url: String,
    },
    SeedHistory {
        candidates: Vec<String>,
    },
}

impl SourceSelector {
    pub fn name(&self) -> &'static str {
        match self {
            SourceSelector::OfficialRanges { .. } => "official ranges",
            SourceSelector::ManualList { .. } => "manual list",
            SourceSelector::ExternalUrl { .. } => "external url",
            SourceSelector::SeedHistory { .. } => "seed history",
        }
    }
}

fn default_sample_size() -> usize {
    1000
}

/// Per-probe acceptance limits. Maxima fail on `>`, minima fail on `<`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct Thresholds {
    pub max_latency_ms: u64,
    pub max_jitter_ms: u64,
    /// 0 disables the download measurement.
    pub min_download_mbps: f64,
    /// 0 disables the upload measurement.
    pub min_upload_mbps: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_latency_ms: 1000,
            max_jitter_ms: 500,
            min_download_mbps: 0.1,
            min_upload_mbps: 0.1,
        }
    }
}

/// Input of StartScan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScanRequest {
    /// `vless://` or `trojan://` link used as the connection template.
    pub base_config: String,
    pub source: SourceSelector,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_stop_after")]
    pub stop_after: usize,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub family: AddressFamily,
    /// Ports to test on every host; empty means the base config port.
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub strict_tls: bool,
    #[serde(default)]
    pub bypass: Option<BypassSweep>,
    /// Two-letter country code; accepted endpoints whose edge reports another
    /// location are recorded as `wrong_geo`.
    #[serde(default)]
    pub target_country: Option<String>,
}

/// Upper bound on workers per scan.
pub const MAX_CONCURRENCY: usize = 1024;

/// Upper bound on addresses sampled from official ranges.
pub const MAX_SAMPLE_SIZE: usize = 1_000_000;

fn default_concurrency() -> usize {
    8
}

fn default_stop_after() -> usize {
    10
}

impl ScanRequest {
    pub fn new(base_config: impl Into<String>, source: SourceSelector) -> Self {
        Self {
            base_config: base_config.into(),
            source,
            concurrency: default_concurrency(),
            stop_after: default_stop_after(),
            thresholds: Thresholds::default(),
            family: AddressFamily::Any,
            ports: Vec::new(),
            strict_tls: false,
            bypass: None,
            target_country: None,
        }
    }

    pub fn validate(&self) -> Result<(), SetupError> {
        let invalid = |msg: &str| Err(SetupError::InvalidRequest(msg.to_string()));
        if self.concurrency == 0 {
            return invalid("concurrency must be at least 1");
        }
        if self.concurrency > MAX_CONCURRENCY {
            return Err(SetupError::InvalidRequest(format!("concurrency must be at most {MAX_CONCURRENCY}")));
        }
        if let SourceSelector::OfficialRanges { sample_size, .. } = &self.source {
            if *sample_size == 0 || *sample_size > MAX_SAMPLE_SIZE {
                return Err(SetupError::InvalidRequest(format!(
                    "sample_size must be between 1 and {MAX_SAMPLE_SIZE}"
                )));
            }
        }
        if let Some(cc) = &self.target_country {
            if cc.len() != 2 || !cc.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(SetupError::InvalidRequest(format!("target_country must be a two-letter code, got `{cc}`")));
            }
        }
        if self.stop_after == 0 {
            return invalid("stop_after must be at least 1");
        }
        let t = &self.thresholds;
        for (name, v) in [("min_download_mbps", t.min_download_mbps), ("min_upload_mbps", t.min_upload_mbps)] {
            if !v.is_finite() || v < 0.0 {
                return Err(SetupError::InvalidRequest(format!("{name} must be a finite value >= 0")));
            }
        }
        if self.ports.contains(&0) {
            return invalid("port 0 is not a valid target port");
        }
        if let Some(sweep) = &self.bypass {
            if sweep.variants().is_empty() {
                return invalid("bypass sweep produces no variants");
            }
        }
        Ok(())
    }
}

/// Address part of a candidate: an IP literal or a host name left for the transport to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Host {
    Ip(IpAddr),
    Name(String),
}

impl Host {
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Host::Ip(ip) => Some(*ip),
            Host::Name(_) => None,
        }
    }

    /// `host:port` form, with brackets around IPv6 literals.
    pub fn authority(&self, port: u16) -> String {
        match self {
            Host::Ip(IpAddr::V6(v6)) => format!("[{v6}]:{port}"),
            Host::Ip(IpAddr::V4(v4)) => format!("{v4}:{port}"),
            Host::Name(name) => format!("{name}:{port}"),
        }
    }

    /// Host as it appears inside a URL authority.
    pub fn url_host(&self) -> String {
        match self {
            Host::Ip(IpAddr::V6(v6)) => format!("[{v6}]"),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Ip(ip) => ip.fmt(f),
            Host::Name(name) => f.write_str(name),
        }
    }
}

impl FromStr for Host {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let bare = s.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return Ok(Host::Ip(ip));
        }
        if is_hostname(s) {
            return Ok(Host::Name(s.to_ascii_lowercase()));
        }
        Err(format!("not an address or host name: {s}"))
    }
}

impl From<Host> for String {
    fn from(h: Host) -> Self {
        h.to_string()
    }
}

impl TryFrom<String> for Host {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

fn is_hostname(s: &str) -> bool {
    if s.is_empty() || s.len() > 253 || !s.contains('.') {
        return false;
    }
    // All-numeric strings are malformed IPs, not names.
    if !s.chars().any(|c| c.is_ascii_alphabetic()) {
        return false;
    }
    s.trim_end_matches('.').split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// One unit of work: an address, optionally pinned to a port and shaped by a bypass variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    pub host: Host,
    pub port: Option<u16>,
    pub variant: Option<BypassVariant>,
}

impl Candidate {
    pub fn new(host: Host) -> Self {
        Self { host, port: None, variant: None }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_variant(mut self, variant: BypassVariant) -> Self {
        self.variant = Some(variant);
        self
    }

    pub fn label(&self, default_port: u16) -> String {
        let base = self.host.authority(self.port.unwrap_or(default_port));
        match &self.variant {
            Some(v) => format!("{base} | {v}"),
            None => base,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Ok,
    Timeout,
    Unreachable,
    HighLatency,
    HighJitter,
    LowDownload,
    LowUpload,
    /// Certificate failed strict verification, usually an interception sign.
    Compromised,
    /// Passed every limit but the edge is outside the requested country.
    WrongGeo,
    Error,
}

impl ProbeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProbeStatus::Ok => "ok",
            ProbeStatus::Timeout => "timeout",
            ProbeStatus::Unreachable => "unreachable",
            ProbeStatus::HighLatency => "high_latency",
            ProbeStatus::HighJitter => "high_jitter",
            ProbeStatus::LowDownload => "low_download",
            ProbeStatus::LowUpload => "low_upload",
            ProbeStatus::Compromised => "compromised",
            ProbeStatus::WrongGeo => "wrong_geo",
            ProbeStatus::Error => "error",
        }
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of testing one candidate. `link` is only ever set for `Ok`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub candidate: String,
    pub address: String,
    pub port: u16,
    pub status: ProbeStatus,
    pub latency_ms: Option<u64>,
    pub jitter_ms: Option<u64>,
    pub download_mbps: Option<f64>,
    pub upload_mbps: Option<f64>,
    pub datacenter: Option<String>,
    pub location: Option<String>,
    pub asn: Option<String>,
    pub family: Option<AddressFamily>,
    pub server_name: Option<String>,
    pub variant: Option<BypassVariant>,
    pub detail: Option<String>,
    pub link: Option<String>,
    pub timestamp: String,
}

impl ProbeResult {
    pub fn is_ok(&self) -> bool {
        self.status == ProbeStatus::Ok
    }
}

/// Failure counters by outcome category.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCounters {
    pub timeout: u64,
    pub unreachable: u64,
    pub high_latency: u64,
    pub high_jitter: u64,
    pub low_download: u64,
    pub low_upload: u64,
    pub compromised: u64,
    pub wrong_geo: u64,
    pub error: u64,
}

impl OutcomeCounters {
    pub fn record(&mut self, status: ProbeStatus) {
        let slot = match status {
            ProbeStatus::Ok => return,
            ProbeStatus::Timeout => &mut self.timeout,
            ProbeStatus::Unreachable => &mut self.unreachable,
            ProbeStatus::HighLatency => &mut self.high_latency,
            ProbeStatus::HighJitter => &mut self.high_jitter,
            ProbeStatus::LowDownload => &mut self.low_download,
            ProbeStatus::LowUpload => &mut self.low_upload,
            ProbeStatus::Compromised => &mut self.compromised,
            ProbeStatus::WrongGeo => &mut self.wrong_geo,
            ProbeStatus::Error => &mut self.error,
        };
        *slot += 1;
    }

    pub fn total(&self) -> u64 {
        self.timeout
            + self.unreachable
            + self.high_latency
            + self.high_jitter
            + self.low_download
            + self.low_upload
            + self.compromised
            + self.wrong_geo
            + self.error
    }
}

/// Scan lifecycle. `Completed`, `Stopped` and `Error` are terminal.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Starting,
    Running,
    Paused,
    Completed,
    Stopped,
    Error,
}

impl ScanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ScanStatus::Completed | ScanStatus::Stopped | ScanStatus::Error)
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScanStatus::Starting => "starting",
            ScanStatus::Running => "running",
            ScanStatus::Paused => "paused",
            ScanStatus::Completed => "completed",
            ScanStatus::Stopped => "stopped",
            ScanStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Point-in-time copy of a scan's state, returned by GetStatus.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScanSnapshot {
    pub scan_id: ScanId,
    pub status: ScanStatus,
    pub completed: u64,
    pub total: u64,
    pub found_good: u64,
    pub in_flight: u64,
    pub counters: OutcomeCounters,
    pub logs: Vec<String>,
    pub results: Vec<ProbeResult>,
    pub error: Option<String>,
}

pub(crate) fn now_iso_like() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
