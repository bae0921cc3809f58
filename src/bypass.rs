//! Bypass variants: TLS ClientHello fragmentation, SNI override and DNS-tunnel nameservers.
//!
//! A [`BypassSweep`] on a scan request expands every host into one candidate per
//! [`BypassVariant`]. The transport applies the variant to every exchange it makes for
//! that candidate; [`FragmentingStream`] implements the fragment variant on the socket.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

/// Inclusive `lo-hi` range, written as `"10-20"` or a single `"5"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FragmentSpan {
    pub lo: u64,
    pub hi: u64,
}

impl FragmentSpan {
    pub fn new(lo: u64, hi: u64) -> Self {
        Self { lo: lo.min(hi), hi: lo.max(hi) }
    }

    pub fn pick(&self, rng: &mut impl Rng) -> u64 {
        if self.lo == self.hi {
            self.lo
        } else {
            rng.gen_range(self.lo..=self.hi)
        }
    }
}

impl fmt::Display for FragmentSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.lo, self.hi)
    }
}

impl FromStr for FragmentSpan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let num = |v: &str| {
            v.trim()
                .parse::<u64>()
                .map_err(|e| format!("invalid fragment span {s:?}: {e}"))
        };
        match s.split_once('-') {
            Some((a, b)) => {
                let (lo, hi) = (num(a)?, num(b)?);
                if lo > hi {
                    return Err(format!("invalid fragment span {s:?}: start > end"));
                }
                Ok(Self { lo, hi })
            }
            None => {
                let v = num(s)?;
                Ok(Self { lo: v, hi: v })
            }
        }
    }
}

impl TryFrom<String> for FragmentSpan {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<FragmentSpan> for String {
    fn from(s: FragmentSpan) -> Self {
        s.to_string()
    }
}

/// A connection-shaping parameter set tested together with an address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BypassVariant {
    /// Split the TLS ClientHello into pieces of `length` bytes sent `interval` ms apart.
    Fragment { length: FragmentSpan, interval: FragmentSpan },
    /// Use this TLS server name instead of the base config's.
    Sni { server_name: String },
    /// Resolve `domain` through `nameserver` before dialing.
    DnsTunnel { nameserver: String, domain: Option<String> },
}

impl fmt::Display for BypassVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BypassVariant::Fragment { length, interval } => write!(f, "frag {length} / {interval}"),
            BypassVariant::Sni { server_name } => write!(f, "sni {server_name}"),
            BypassVariant::DnsTunnel { nameserver, domain } => match domain {
                Some(d) => write!(f, "dns {nameserver} ({d})"),
                None => write!(f, "dns {nameserver}"),
            },
        }
    }
}

/// Bypass-discovery mode of a scan request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BypassSweep {
    /// Every length paired with every interval.
    Fragment { lengths: Vec<FragmentSpan>, intervals: Vec<FragmentSpan> },
    Sni { server_names: Vec<String> },
    DnsTunnel {
        nameservers: Vec<String>,
        #[serde(default)]
        domain: Option<String>,
    },
}

impl BypassSweep {
    pub fn variants(&self) -> Vec<BypassVariant> {
        match self {
            BypassSweep::Fragment { lengths, intervals } => lengths
                .iter()
                .flat_map(|&length| {
                    intervals
                        .iter()
                        .map(move |&interval| BypassVariant::Fragment { length, interval })
                })
                .collect(),
            BypassSweep::Sni { server_names } => server_names
                .iter()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| BypassVariant::Sni { server_name: s.to_string() })
                .collect(),
            BypassSweep::DnsTunnel { nameservers, domain } => nameservers
                .iter()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|ns| BypassVariant::DnsTunnel {
                    nameserver: ns.to_string(),
                    domain: domain.clone(),
                })
                .collect(),
        }
    }
}

/// Stream wrapper that splits outgoing bytes into small, delayed writes until the peer
/// first answers. Wrapped around a TCP stream below TLS this fragments the ClientHello.
/// A passthrough instance forwards everything untouched.
pub struct FragmentingStream<S> {
    inner: S,
    shape: Option<(FragmentSpan, FragmentSpan)>,
    delay: Option<Pin<Box<Sleep>>>,
    rng: StdRng,
}

impl<S> FragmentingStream<S> {
    pub fn new(inner: S, length: FragmentSpan, interval: FragmentSpan) -> Self {
        Self {
            inner,
            shape: Some((length, interval)),
            delay: None,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn passthrough(inner: S) -> Self {
        Self { inner, shape: None, delay: None, rng: StdRng::from_entropy() }
    }

    pub fn is_fragmenting(&self) -> bool {
        self.shape.is_some()
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for FragmentingStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let Some((length, interval)) = this.shape else {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        };
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if let Some(delay) = this.delay.as_mut() {
            ready!(delay.as_mut().poll(cx));
            this.delay = None;
        }
        let chunk = (length.pick(&mut this.rng) as usize).clamp(1, buf.len());
        let written = ready!(Pin::new(&mut this.inner).poll_write(cx, &buf[..chunk]))?;
        let pause = interval.pick(&mut this.rng);
        if pause > 0 {
            this.delay = Some(Box::pin(tokio::time::sleep(Duration::from_millis(pause))));
        }
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for FragmentingStream<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        if buf.filled().len() > before && this.shape.is_some() {
            // The server answered, so the hello is through; stop shaping.
            this.shape = None;
            this.delay = None;
        }
        Poll::Ready(Ok(()))
    }
}
