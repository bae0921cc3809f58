//! Bounded test procedure for one candidate.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time;
use tracing::debug;

use crate::bypass::BypassVariant;
use crate::config::BaseConfig;
use crate::error::TransportError;
use crate::settings::EngineSettings;
use crate::transport::{Dial, RoundTrip, Transfer, Transport};
use crate::types::{now_iso_like, AddressFamily, Candidate, ProbeResult, ProbeStatus, Thresholds};

pub struct Prober {
    transport: Arc<dyn Transport>,
    base: Arc<BaseConfig>,
    thresholds: Thresholds,
    strict_tls: bool,
    jitter_rounds: usize,
    round_trip_timeout: Duration,
    transfer_timeout: Duration,
    download_bytes: u64,
    upload_bytes: u64,
    /// Shared by every worker of a scan so concurrent transfers don't split the link.
    throughput: Arc<Semaphore>,
    target_country: Option<String>,
}

impl Prober {
    pub fn new(
        transport: Arc<dyn Transport>,
        base: Arc<BaseConfig>,
        thresholds: Thresholds,
        strict_tls: bool,
        settings: &EngineSettings,
    ) -> Self {
        Self {
            transport,
            base,
            thresholds,
            strict_tls,
            jitter_rounds: settings.jitter_rounds,
            round_trip_timeout: settings.round_trip_timeout(),
            transfer_timeout: settings.transfer_timeout(),
            download_bytes: settings.download_bytes,
            upload_bytes: settings.upload_bytes,
            throughput: Arc::new(Semaphore::new(settings.throughput_slots.max(1))),
            target_country: None,
        }
    }

    /// Demotes otherwise accepted endpoints whose edge location is not `country`.
    pub fn with_target_country(mut self, country: Option<String>) -> Self {
        self.target_country = country.map(|c| c.trim().to_ascii_uppercase());
        self
    }

    pub fn dial_for(&self, candidate: &Candidate) -> Dial {
        let tls = self.base.uses_tls();
        let (server_name, http_host) = match &candidate.variant {
            // Same substitution as the emitted link.
            Some(BypassVariant::Sni { server_name }) if self.base.network() == "ws" => {
                (Some(server_name.clone()), server_name.clone())
            }
            Some(BypassVariant::Sni { server_name }) => (Some(server_name.clone()), self.base.http_host()),
            _ => (self.base.server_name(), self.base.http_host()),
        };
        Dial {
            host: candidate.host.clone(),
            port: candidate.port.unwrap_or(self.base.port),
            server_name,
            http_host,
            tls,
            strict_tls: tls && self.strict_tls,
            variant: candidate.variant.clone(),
        }
    }

    /// Runs reachability, latency, jitter and (when asked for) throughput checks, stopping
    /// at the first failed one. Never fails; every outcome is a [`ProbeResult`].
    pub async fn test(&self, candidate: &Candidate) -> ProbeResult {
        let dial = self.dial_for(candidate);
        let mut result = self.blank(candidate, &dial);
        self.run(candidate, &dial, &mut result).await;
        result.timestamp = now_iso_like();
        debug!(candidate = %result.candidate, status = %result.status, "probe finished");
        result
    }

    /// Result for a candidate whose probe could not run to an outcome.
    pub fn failed(&self, candidate: &Candidate, status: ProbeStatus, detail: String) -> ProbeResult {
        let dial = self.dial_for(candidate);
        let mut result = self.blank(candidate, &dial);
        fail(&mut result, status, detail);
        result.timestamp = now_iso_like();
        result
    }

    fn blank(&self, candidate: &Candidate, dial: &Dial) -> ProbeResult {
        ProbeResult {
            candidate: candidate.label(self.base.port),
            address: candidate.host.to_string(),
            port: dial.port,
            status: ProbeStatus::Ok,
            latency_ms: None,
            jitter_ms: None,
            download_mbps: None,
            upload_mbps: None,
            datacenter: None,
            location: None,
            asn: None,
            family: candidate.host.ip().map(|ip| AddressFamily::of(&ip)),
            server_name: dial.server_name.clone(),
            variant: candidate.variant.clone(),
            detail: None,
            link: None,
            timestamp: String::new(),
        }
    }

    async fn run(&self, candidate: &Candidate, dial: &Dial, result: &mut ProbeResult) {
        let t = &self.thresholds;

        let first = match self.round_trip(dial).await {
            Ok(rt) => rt,
            Err(e) => return fail(result, status_for(&e), e.to_string()),
        };
        let latency = millis(first.latency);
        result.latency_ms = Some(latency);
        result.datacenter = first.datacenter;
        result.location = first.location;
        result.asn = first.asn;
        if latency > t.max_latency_ms {
            return fail(result, ProbeStatus::HighLatency, format!("{latency} ms > {} ms", t.max_latency_ms));
        }

        if self.jitter_rounds > 0 {
            let mut samples = vec![latency];
            let mut last_err = None;
            for _ in 0..self.jitter_rounds {
                match self.round_trip(dial).await {
                    Ok(rt) => samples.push(millis(rt.latency)),
                    Err(e) => last_err = Some(e),
                }
            }
            if samples.len() == 1 {
                let detail = last_err.map(|e| e.to_string()).unwrap_or_default();
                return fail(result, ProbeStatus::Timeout, format!("jitter rounds failed: {detail}"));
            }
            let max = samples.iter().copied().max().unwrap_or(latency);
            let min = samples.iter().copied().min().unwrap_or(latency);
            let jitter = max - min;
            result.jitter_ms = Some(jitter);
            if jitter > t.max_jitter_ms {
                return fail(result, ProbeStatus::HighJitter, format!("{jitter} ms > {} ms", t.max_jitter_ms));
            }
        } else {
            result.jitter_ms = Some(0);
        }

        // One transfer slot per probe covers both directions.
        let _slot = if t.min_download_mbps > 0.0 || t.min_upload_mbps > 0.0 {
            self.throughput.acquire().await.ok()
        } else {
            None
        };
        if t.min_download_mbps > 0.0 {
            let mbps = match self.transfer(self.transport.download(dial, self.download_bytes, self.transfer_timeout)).await {
                Ok(tr) => tr.mbps(),
                Err(TransportError::Timeout) => return fail(result, ProbeStatus::Timeout, "download timed out".into()),
                Err(_) => 0.0,
            };
            result.download_mbps = Some(mbps);
            if mbps < t.min_download_mbps {
                return fail(result, ProbeStatus::LowDownload, format!("{mbps:.2} Mbps < {}", t.min_download_mbps));
            }
        }
        if t.min_upload_mbps > 0.0 {
            let mbps = match self.transfer(self.transport.upload(dial, self.upload_bytes, self.transfer_timeout)).await {
                Ok(tr) => tr.mbps(),
                Err(TransportError::Timeout) => return fail(result, ProbeStatus::Timeout, "upload timed out".into()),
                Err(_) => 0.0,
            };
            result.upload_mbps = Some(mbps);
            if mbps < t.min_upload_mbps {
                return fail(result, ProbeStatus::LowUpload, format!("{mbps:.2} Mbps < {}", t.min_upload_mbps));
            }
        }

        if let Some(want) = &self.target_country {
            let matches = result.location.as_deref().is_some_and(|loc| loc.eq_ignore_ascii_case(want));
            if !matches {
                let detail = format!("edge in {}, want {want}", result.location.as_deref().unwrap_or("unknown"));
                return fail(result, ProbeStatus::WrongGeo, detail);
            }
        }

        result.status = ProbeStatus::Ok;
        result.link = Some(self.base.materialize(candidate));
    }

    async fn round_trip(&self, dial: &Dial) -> Result<RoundTrip, TransportError> {
        time::timeout(self.round_trip_timeout, self.transport.round_trip(dial, self.round_trip_timeout))
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    async fn transfer(
        &self,
        fut: impl std::future::Future<Output = Result<Transfer, TransportError>>,
    ) -> Result<Transfer, TransportError> {
        time::timeout(self.transfer_timeout, fut)
            .await
            .map_err(|_| TransportError::Timeout)?
    }
}

fn fail(result: &mut ProbeResult, status: ProbeStatus, detail: String) {
    result.status = status;
    if !detail.is_empty() {
        result.detail = Some(detail);
    }
}

fn status_for(e: &TransportError) -> ProbeStatus {
    match e {
        TransportError::Timeout => ProbeStatus::Timeout,
        TransportError::Unreachable(_) => ProbeStatus::Unreachable,
        TransportError::Rejected(_) => ProbeStatus::Compromised,
        TransportError::Protocol(_) => ProbeStatus::Error,
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis().min(u128::from(u64::MAX)) as u64
}
