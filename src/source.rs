//! Candidate sources.
//!
//! Each [`SourceSelector`] variant has one [`CandidateSource`] implementation that
//! produces hosts. [`expand`] then crosses the hosts with the request's ports and bypass
//! variants into a lazy, finite [`CandidatePool`].

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use ipnet::IpNet;
use tracing::debug;

use crate::bypass::BypassVariant;
use crate::config::BaseConfig;
use crate::error::SourceError;
use crate::ranges::{expand_cidr_to_ips, official_ranges, RangeSampler};
use crate::types::{AddressFamily, Candidate, CdnProvider, Host, SourceSelector};

/// Hosts produced by a source, with the number it will yield and the entries it could not parse.
pub struct HostStream {
    iter: Box<dyn Iterator<Item = Host> + Send>,
    len: usize,
    skipped: usize,
}

impl HostStream {
    pub fn from_vec(hosts: Vec<Host>, skipped: usize) -> Self {
        let len = hosts.len();
        Self { iter: Box::new(hosts.into_iter()), len, skipped }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl Iterator for HostStream {
    type Item = Host;

    fn next(&mut self) -> Option<Host> {
        self.iter.next()
    }
}

#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn hosts(&self, family: AddressFamily) -> Result<HostStream, SourceError>;
}

/// Fetches a remote text resource for the external-url source.
#[async_trait]
pub trait ListFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, SourceError>;
}

pub struct HttpListFetcher {
    client: reqwest::Client,
}

impl HttpListFetcher {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("edge-scan-rs/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ListFetcher for HttpListFetcher {
    async fn fetch(&self, url: &str) -> Result<String, SourceError> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(SourceError::InvalidUrl(url.to_string()));
        }
        let fail = |reason: String| SourceError::Fetch { url: url.to_string(), reason };
        let resp = self.client.get(url).send().await.map_err(|e| fail(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(fail(format!("HTTP {status}")));
        }
        resp.text().await.map_err(|e| fail(e.to_string()))
    }
}

pub struct OfficialRanges {
    pub provider: CdnProvider,
    pub sample_size: usize,
    pub seed: Option<u64>,
}

#[async_trait]
impl CandidateSource for OfficialRanges {
    async fn hosts(&self, family: AddressFamily) -> Result<HostStream, SourceError> {
        let sampler = RangeSampler::new(official_ranges(self.provider, family), self.sample_size, self.seed);
        let len = sampler.planned();
        Ok(HostStream { iter: Box::new(sampler.map(Host::Ip)), len, skipped: 0 })
    }
}

pub struct ManualList {
    pub entries: String,
    pub cidr_limit: usize,
}

#[async_trait]
impl CandidateSource for ManualList {
    async fn hosts(&self, family: AddressFamily) -> Result<HostStream, SourceError> {
        let parsed = parse_address_list(&self.entries, family, self.cidr_limit);
        Ok(HostStream::from_vec(parsed.hosts, parsed.skipped))
    }
}

pub struct ExternalList {
    pub url: String,
    pub fetcher: Arc<dyn ListFetcher>,
    pub cidr_limit: usize,
}

#[async_trait]
impl CandidateSource for ExternalList {
    async fn hosts(&self, family: AddressFamily) -> Result<HostStream, SourceError> {
        let body = self.fetcher.fetch(&self.url).await?;
        let parsed = parse_fetched_list(&body, family, self.cidr_limit);
        debug!(url = %self.url, hosts = parsed.hosts.len(), skipped = parsed.skipped, "fetched candidate list");
        Ok(HostStream::from_vec(parsed.hosts, parsed.skipped))
    }
}

/// Caller-ranked list (history, community lists); taken as given.
pub struct SeedHistory {
    pub candidates: Vec<String>,
    pub cidr_limit: usize,
}

#[async_trait]
impl CandidateSource for SeedHistory {
    async fn hosts(&self, family: AddressFamily) -> Result<HostStream, SourceError> {
        let parsed = parse_address_list(&self.candidates.join("\n"), family, self.cidr_limit);
        Ok(HostStream::from_vec(parsed.hosts, parsed.skipped))
    }
}

pub fn source_for(
    selector: &SourceSelector,
    fetcher: Arc<dyn ListFetcher>,
    cidr_limit: usize,
) -> Box<dyn CandidateSource> {
    match selector {
        SourceSelector::OfficialRanges { provider, sample_size, seed } => Box::new(OfficialRanges {
            provider: *provider,
            sample_size: *sample_size,
            seed: *seed,
        }),
        SourceSelector::ManualList { entries } => Box::new(ManualList { entries: entries.clone(), cidr_limit }),
        SourceSelector::ExternalUrl { url } => Box::new(ExternalList { url: url.clone(), fetcher, cidr_limit }),
        SourceSelector::SeedHistory { candidates } => Box::new(SeedHistory {
            candidates: candidates.clone(),
            cidr_limit,
        }),
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct ParsedList {
    pub hosts: Vec<Host>,
    /// Entries that were neither an address, a CIDR, a host name nor a share link.
    pub skipped: usize,
}

/// Parse a newline/comma separated list of addresses, host names, CIDRs, `ip:port`
/// pairs and `vless://`/`trojan://` links. Duplicates are dropped, input order is kept,
/// IP literals outside `family` are filtered out.
pub fn parse_address_list(text: &str, family: AddressFamily, cidr_limit: usize) -> ParsedList {
    let mut out = ParsedList::default();
    let mut seen = HashSet::new();
    let mut push = |host: Host, out: &mut ParsedList| {
        if let Some(ip) = host.ip() {
            if !family.admits(&ip) {
                return;
            }
        }
        if seen.insert(host.clone()) {
            out.hosts.push(host);
        }
    };

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.starts_with("vless://") || line.starts_with("trojan://") {
            match line.parse::<BaseConfig>().ok().and_then(|c| c.host.parse::<Host>().ok()) {
                Some(host) => push(host, &mut out),
                None => out.skipped += 1,
            }
            continue;
        }
        let line = line.split('#').next().unwrap_or("");
        for token in line.split([',', ' ', '\t', ';']).map(str::trim).filter(|t| !t.is_empty()) {
            if token.contains('/') {
                match token.parse::<IpNet>() {
                    Ok(net) if family.admits(&net.network()) => {
                        for ip in expand_cidr_to_ips(net, cidr_limit) {
                            push(Host::Ip(ip), &mut out);
                        }
                    }
                    Ok(_) => {}
                    Err(_) => out.skipped += 1,
                }
                continue;
            }
            if let Ok(sa) = token.parse::<SocketAddr>() {
                push(Host::Ip(sa.ip()), &mut out);
                continue;
            }
            if let Some(host) = parse_host_token(token) {
                push(host, &mut out);
            } else {
                out.skipped += 1;
            }
        }
    }
    out
}

fn parse_host_token(token: &str) -> Option<Host> {
    if let Ok(h) = token.parse::<Host>() {
        return Some(h);
    }
    // host.name:port
    let (name, port) = token.rsplit_once(':')?;
    port.parse::<u16>().ok()?;
    match name.parse::<Host>().ok()? {
        Host::Name(n) => Some(Host::Name(n)),
        Host::Ip(_) => None,
    }
}

/// Parse a fetched body: a JSON list (`["..."]` or `{"addresses": [...]}`), a base64
/// subscription, or a plain list.
pub fn parse_fetched_list(body: &str, family: AddressFamily, cidr_limit: usize) -> ParsedList {
    let trimmed = body.trim();
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
            let entries = json_entries(&value);
            return parse_address_list(&entries.join("\n"), family, cidr_limit);
        }
    }
    if let Some(decoded) = decode_subscription(trimmed) {
        return parse_address_list(&decoded, family, cidr_limit);
    }
    parse_address_list(trimmed, family, cidr_limit)
}

fn json_entries(value: &serde_json::Value) -> Vec<String> {
    let strings = |v: &serde_json::Value| -> Vec<String> {
        v.as_array()
            .map(|a| a.iter().filter_map(|s| s.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    };
    match value {
        serde_json::Value::Array(_) => strings(value),
        serde_json::Value::Object(map) => ["addresses", "ipv6_addresses", "ips"]
            .iter()
            .filter_map(|k| map.get(*k))
            .flat_map(strings)
            .collect(),
        _ => Vec::new(),
    }
}

fn decode_subscription(body: &str) -> Option<String> {
    if body.is_empty()
        || !body
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=' | '\r' | '\n'))
    {
        return None;
    }
    let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(compact.as_bytes())
        .or_else(|_| base64::engine::general_purpose::STANDARD_NO_PAD.decode(compact.trim_end_matches('=')))
        .ok()?;
    String::from_utf8(bytes).ok()
}

/// Lazy cross product of hosts × ports × variants.
pub struct CandidatePool {
    iter: Box<dyn Iterator<Item = Candidate> + Send>,
    total: u64,
    yielded: u64,
}

impl CandidatePool {
    /// Candidates this pool will yield. Corrected downward once the pool runs dry.
    pub fn total(&self) -> u64 {
        self.total
    }
}

impl Iterator for CandidatePool {
    type Item = Candidate;

    fn next(&mut self) -> Option<Candidate> {
        match self.iter.next() {
            Some(c) => {
                self.yielded += 1;
                Some(c)
            }
            None => {
                self.total = self.yielded;
                None
            }
        }
    }
}

pub fn expand(hosts: HostStream, ports: &[u16], variants: &[BypassVariant]) -> CandidatePool {
    let ports: Vec<Option<u16>> = if ports.is_empty() {
        vec![None]
    } else {
        ports.iter().copied().map(Some).collect()
    };
    let variants: Vec<Option<BypassVariant>> = if variants.is_empty() {
        vec![None]
    } else {
        variants.iter().cloned().map(Some).collect()
    };
    let per_host = ports.len().saturating_mul(variants.len());
    let total = u64::try_from(hosts.len()).unwrap_or(u64::MAX).saturating_mul(per_host as u64);

    let iter = hosts.flat_map(move |host| {
        let mut batch = Vec::with_capacity(per_host);
        for port in &ports {
            for variant in &variants {
                batch.push(Candidate { host: host.clone(), port: *port, variant: variant.clone() });
            }
        }
        batch
    });
    CandidatePool { iter: Box::new(iter), total, yielded: 0 }
}
