//! Network exchanges used by the probe.
//!
//! [`Transport`] is the seam between the probe logic and the network. [`EdgeTransport`]
//! speaks HTTP/1.1 directly over a TCP (optionally TLS) stream so it can pin the edge
//! address, override the server name and fragment the ClientHello.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tracing::trace;
use trust_dns_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::TokioAsyncResolver;

use crate::bypass::{BypassVariant, FragmentingStream};
use crate::error::TransportError;
use crate::settings::EngineSettings;
use crate::types::Host;

/// Where and how to connect for one candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Dial {
    pub host: Host,
    pub port: u16,
    /// TLS server name; falls back to the host when absent.
    pub server_name: Option<String>,
    pub http_host: String,
    pub tls: bool,
    pub strict_tls: bool,
    pub variant: Option<BypassVariant>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoundTrip {
    pub latency: Duration,
    pub datacenter: Option<String>,
    pub location: Option<String>,
    pub asn: Option<String>,
    pub peer: Option<SocketAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transfer {
    pub bytes: u64,
    pub elapsed: Duration,
}

impl Transfer {
    pub fn mbps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        (self.bytes as f64 * 8.0) / secs / 1_000_000.0
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// One request/response exchange; `latency` covers connect through the response head.
    async fn round_trip(&self, dial: &Dial, timeout: Duration) -> Result<RoundTrip, TransportError>;

    async fn download(&self, dial: &Dial, bytes: u64, timeout: Duration) -> Result<Transfer, TransportError>;

    async fn upload(&self, dial: &Dial, bytes: u64, timeout: Duration) -> Result<Transfer, TransportError>;
}

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// Issuer organizations accepted under strict verification.
const TRUSTED_ISSUERS: &[&str] = &[
    "Cloudflare",
    "Google Trust Services",
    "Let's Encrypt",
    "DigiCert",
    "GlobalSign",
];

const MAX_HEAD: usize = 16 * 1024;
const UPLOAD_CHUNK: usize = 64 * 1024;

pub struct EdgeTransport {
    connect_timeout: Duration,
    trace_path: String,
    speed_host: String,
}

impl EdgeTransport {
    pub fn new(settings: &EngineSettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout(),
            trace_path: settings.trace_path.clone(),
            speed_host: settings.speed_host.clone(),
        }
    }

    /// Throughput runs against the speed-test host over the candidate's address, so the
    /// TLS server name and the Host header both name that host.
    fn speed_dial(&self, dial: &Dial) -> Dial {
        let mut speed = dial.clone();
        speed.http_host = self.speed_host.clone();
        if speed.tls {
            speed.server_name = Some(self.speed_host.clone());
        }
        speed
    }

    async fn connect(&self, dial: &Dial) -> Result<(Box<dyn Io>, SocketAddr), TransportError> {
        if let Some(BypassVariant::DnsTunnel { nameserver, domain }) = &dial.variant {
            let name = domain.as_deref().unwrap_or(&dial.http_host);
            dns_gate(nameserver, name, self.connect_timeout).await?;
        }

        let addr = match &dial.host {
            Host::Ip(ip) => SocketAddr::new(*ip, dial.port),
            Host::Name(name) => tokio::net::lookup_host((name.as_str(), dial.port))
                .await?
                .next()
                .ok_or_else(|| TransportError::Unreachable(format!("{name}: no addresses")))?,
        };
        let tcp = time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)??;
        let _ = tcp.set_nodelay(true);

        let stream = match &dial.variant {
            Some(BypassVariant::Fragment { length, interval }) => FragmentingStream::new(tcp, *length, *interval),
            _ => FragmentingStream::passthrough(tcp),
        };
        trace!(%addr, fragmenting = stream.is_fragmenting(), "connected");
        if !dial.tls {
            return Ok((Box::new(stream), addr));
        }

        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(!dial.strict_tls)
            .danger_accept_invalid_hostnames(!dial.strict_tls)
            .build()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let connector = tokio_native_tls::TlsConnector::from(connector);
        let domain = dial.server_name.clone().unwrap_or_else(|| dial.host.to_string());
        let tls = time::timeout(self.connect_timeout, connector.connect(&domain, stream))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| handshake_error(e, dial.strict_tls))?;

        if dial.strict_tls {
            let cert = tls
                .get_ref()
                .peer_certificate()
                .map_err(|e| TransportError::Protocol(e.to_string()))?
                .ok_or_else(|| TransportError::Rejected("no peer certificate".into()))?;
            let der = cert.to_der().map_err(|e| TransportError::Protocol(e.to_string()))?;
            verify_issuer(&der)?;
        }
        Ok((Box::new(tls), addr))
    }
}

#[async_trait]
impl Transport for EdgeTransport {
    async fn round_trip(&self, dial: &Dial, timeout: Duration) -> Result<RoundTrip, TransportError> {
        time::timeout(timeout, async {
            let start = Instant::now();
            let (mut io, peer) = self.connect(dial).await?;
            let req = format!(
                "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: edge-scan-rs\r\nAccept: */*\r\nConnection: close\r\n\r\n",
                self.trace_path, dial.http_host
            );
            io.write_all(req.as_bytes()).await?;
            io.flush().await?;
            let (head, mut body) = read_head(&mut io).await?;
            let latency = start.elapsed();
            check_status(&head)?;

            let mut rest = Vec::new();
            let _ = (&mut io).take(MAX_HEAD as u64).read_to_end(&mut rest).await;
            body.extend_from_slice(&rest);
            let text = String::from_utf8_lossy(&body);
            trace!(%peer, latency_ms = latency.as_millis() as u64, "trace round trip");
            Ok::<_, TransportError>(RoundTrip {
                latency,
                datacenter: trace_field(&text, "colo"),
                location: trace_field(&text, "loc"),
                asn: trace_field(&text, "asn"),
                peer: Some(peer),
            })
        })
        .await
        .map_err(|_| TransportError::Timeout)?
    }

    async fn download(&self, dial: &Dial, bytes: u64, timeout: Duration) -> Result<Transfer, TransportError> {
        let dial = self.speed_dial(dial);
        time::timeout(timeout, async {
            let (mut io, _) = self.connect(&dial).await?;
            let req = format!(
                "GET /__down?bytes={bytes} HTTP/1.1\r\nHost: {}\r\nUser-Agent: edge-scan-rs\r\nConnection: close\r\n\r\n",
                dial.http_host
            );
            let start = Instant::now();
            io.write_all(req.as_bytes()).await?;
            let (head, body) = read_head(&mut io).await?;
            check_status(&head)?;

            let mut received = body.len() as u64;
            let mut buf = vec![0u8; UPLOAD_CHUNK];
            while received < bytes {
                let n = io.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                received += n as u64;
            }
            Ok::<_, TransportError>(Transfer { bytes: received, elapsed: start.elapsed() })
        })
        .await
        .map_err(|_| TransportError::Timeout)?
    }

    async fn upload(&self, dial: &Dial, bytes: u64, timeout: Duration) -> Result<Transfer, TransportError> {
        let dial = self.speed_dial(dial);
        time::timeout(timeout, async {
            let (mut io, _) = self.connect(&dial).await?;
            let req = format!(
                "POST /__up HTTP/1.1\r\nHost: {}\r\nUser-Agent: edge-scan-rs\r\nContent-Type: application/octet-stream\r\nContent-Length: {bytes}\r\nConnection: close\r\n\r\n",
                dial.http_host
            );
            let start = Instant::now();
            io.write_all(req.as_bytes()).await?;
            let zeros = vec![0u8; UPLOAD_CHUNK];
            let mut sent = 0u64;
            while sent < bytes {
                let n = (bytes - sent).min(UPLOAD_CHUNK as u64) as usize;
                io.write_all(&zeros[..n]).await?;
                sent += n as u64;
            }
            io.flush().await?;
            let (head, _) = read_head(&mut io).await?;
            let elapsed = start.elapsed();
            check_status(&head)?;
            Ok::<_, TransportError>(Transfer { bytes: sent, elapsed })
        })
        .await
        .map_err(|_| TransportError::Timeout)?
    }
}

fn handshake_error(e: native_tls::Error, strict: bool) -> TransportError {
    let msg = e.to_string();
    if strict && msg.to_ascii_lowercase().contains("certificate") {
        TransportError::Rejected(msg)
    } else {
        TransportError::Protocol(msg)
    }
}

/// Accepts certificates issued by a known CDN or public CA, or carrying a Cloudflare subject.
pub fn verify_issuer(der: &[u8]) -> Result<(), TransportError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| TransportError::Rejected(format!("unparseable certificate: {e}")))?;
    let orgs: Vec<&str> = cert
        .issuer()
        .iter_organization()
        .filter_map(|a| a.as_str().ok())
        .collect();
    if orgs.iter().any(|o| TRUSTED_ISSUERS.iter().any(|t| o.contains(t))) {
        return Ok(());
    }
    let cdn_subject = cert
        .subject()
        .iter_common_name()
        .filter_map(|a| a.as_str().ok())
        .any(|cn| cn.to_ascii_lowercase().contains("cloudflare"));
    if cdn_subject {
        return Ok(());
    }
    Err(TransportError::Rejected(format!("untrusted issuer: {}", orgs.join(", "))))
}

/// Resolves `domain` through `nameserver`; the candidate is only dialed if this succeeds.
async fn dns_gate(nameserver: &str, domain: &str, timeout: Duration) -> Result<(), TransportError> {
    let server = parse_nameserver(nameserver)
        .ok_or_else(|| TransportError::Protocol(format!("invalid nameserver: {nameserver}")))?;
    let group = NameServerConfigGroup::from_ips_clear(&[server.ip()], server.port(), true);
    let config = ResolverConfig::from_parts(None, vec![], group);
    let mut opts = ResolverOpts::default();
    opts.timeout = timeout;
    opts.attempts = 1;
    let resolver = TokioAsyncResolver::tokio(config, opts);

    match time::timeout(timeout, resolver.lookup_ip(domain)).await {
        Err(_) => Err(TransportError::Timeout),
        Ok(Ok(lookup)) if lookup.iter().next().is_some() => Ok(()),
        Ok(Ok(_)) => Err(TransportError::Unreachable(format!("{domain}: no records via {nameserver}"))),
        Ok(Err(e)) => match e.kind() {
            ResolveErrorKind::Timeout => Err(TransportError::Timeout),
            _ => Err(TransportError::Unreachable(format!("dns via {nameserver}: {e}"))),
        },
    }
}

/// `1.1.1.1`, `1.1.1.1:5353`, `2606:4700::1111` or `[2606:4700::1111]:53`.
pub(crate) fn parse_nameserver(s: &str) -> Option<SocketAddr> {
    let s = s.trim();
    if let Ok(sa) = s.parse::<SocketAddr>() {
        return Some(sa);
    }
    s.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, 53))
}

/// Reads until the end of the response head; returns the head and any body bytes read past it.
async fn read_head<R: AsyncRead + Unpin + ?Sized>(io: &mut R) -> Result<(String, Vec<u8>), TransportError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(pos) = find_head_end(&buf) {
            let head = String::from_utf8_lossy(&buf[..pos]).into_owned();
            let body = buf[pos + 4..].to_vec();
            return Ok((head, body));
        }
        if buf.len() > MAX_HEAD {
            return Err(TransportError::Protocol("response head too large".into()));
        }
        let n = io.read(&mut chunk).await?;
        if n == 0 {
            return Err(if buf.is_empty() {
                TransportError::Unreachable("connection closed before response".into())
            } else {
                TransportError::Protocol("truncated response head".into())
            });
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

pub(crate) fn status_code(head: &str) -> Option<u16> {
    let line = head.lines().next()?;
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

fn check_status(head: &str) -> Result<u16, TransportError> {
    match status_code(head) {
        Some(code) if (200..400).contains(&code) => Ok(code),
        Some(code) => Err(TransportError::Protocol(format!("HTTP {code}"))),
        None => Err(TransportError::Protocol("not an HTTP response".into())),
    }
}

/// Value of `key=` in a `/cdn-cgi/trace` body.
pub(crate) fn trace_field(body: &str, key: &str) -> Option<String> {
    body.lines().find_map(|line| {
        let (k, v) = line.trim().split_once('=')?;
        (k == key && !v.is_empty()).then(|| v.to_string())
    })
}
