//! Base tunnel configuration (`vless://` / `trojan://` share links).
//!
//! The link is only taken apart far enough to learn where and how to dial, and to put
//! an accepted candidate back into the same template. Query parameters keep their
//! original order and encoding.

use std::fmt;
use std::str::FromStr;

use crate::bypass::BypassVariant;
use crate::error::ConfigError;
use crate::types::{Candidate, Host};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelProtocol {
    Vless,
    Trojan,
}

impl TunnelProtocol {
    pub fn scheme(self) -> &'static str {
        match self {
            TunnelProtocol::Vless => "vless",
            TunnelProtocol::Trojan => "trojan",
        }
    }
}

impl fmt::Display for TunnelProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseConfig {
    pub protocol: TunnelProtocol,
    /// UUID for vless, password for trojan.
    pub credential: String,
    pub host: String,
    pub port: u16,
    params: Vec<(String, String)>,
    pub remark: Option<String>,
}

impl FromStr for BaseConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (protocol, rest) = if let Some(rest) = s.strip_prefix("vless://") {
            (TunnelProtocol::Vless, rest)
        } else if let Some(rest) = s.strip_prefix("trojan://") {
            (TunnelProtocol::Trojan, rest)
        } else {
            let scheme = s.split("://").next().unwrap_or(s);
            return Err(ConfigError::UnsupportedScheme(scheme.chars().take(32).collect()));
        };

        let (rest, remark) = match rest.split_once('#') {
            Some((r, m)) if !m.is_empty() => (r, Some(m.to_string())),
            Some((r, _)) => (r, None),
            None => (rest, None),
        };
        let (userinfo_host, query) = match rest.split_once('?') {
            Some((a, q)) => (a, q),
            None => (rest, ""),
        };
        let (credential, authority) = userinfo_host
            .rsplit_once('@')
            .ok_or(ConfigError::MissingCredential)?;
        if credential.is_empty() {
            return Err(ConfigError::MissingCredential);
        }
        let authority = authority.trim_end_matches('/');
        let (host, port) = split_authority(authority)?;

        let params = query
            .split('&')
            .filter(|p| !p.is_empty())
            .filter_map(|p| {
                let (k, v) = p.split_once('=').unwrap_or((p, ""));
                (!k.is_empty()).then(|| (k.to_string(), v.to_string()))
            })
            .collect();

        Ok(Self {
            protocol,
            credential: credential.to_string(),
            host,
            port,
            params,
            remark,
        })
    }
}

fn split_authority(authority: &str) -> Result<(String, u16), ConfigError> {
    let (host, port) = if let Some(v6) = authority.strip_prefix('[') {
        let (h, tail) = v6.split_once(']').ok_or(ConfigError::MissingHost)?;
        let port = tail.strip_prefix(':').unwrap_or("");
        (h, port)
    } else {
        authority.rsplit_once(':').unwrap_or((authority, ""))
    };
    if host.is_empty() {
        return Err(ConfigError::MissingHost);
    }
    let port = match port {
        "" => 443,
        p => match p.parse::<u16>() {
            Ok(0) | Err(_) => return Err(ConfigError::InvalidPort(p.to_string())),
            Ok(v) => v,
        },
    };
    Ok((host.to_string(), port))
}

impl BaseConfig {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// Transport network (`tcp`, `ws`, `grpc`, ...).
    pub fn network(&self) -> &str {
        self.param("type").unwrap_or("tcp")
    }

    /// True when the link asks for TLS or REALITY on the outer connection.
    pub fn uses_tls(&self) -> bool {
        matches!(self.param("security"), Some("tls") | Some("reality"))
    }

    /// TLS server name: `sni`, then `host`, then the link host when it is a name.
    pub fn server_name(&self) -> Option<String> {
        self.param("sni")
            .or_else(|| self.param("host"))
            .map(str::to_string)
            .or_else(|| match self.host.parse::<Host>() {
                Ok(Host::Name(n)) => Some(n),
                _ => None,
            })
    }

    /// Value for the HTTP `Host` header when probing through this config.
    pub fn http_host(&self) -> String {
        self.param("host")
            .or_else(|| self.param("sni"))
            .map(str::to_string)
            .unwrap_or_else(|| self.host.clone())
    }

    /// Rebuilds the link with the candidate's address, port and variant substituted in.
    pub fn materialize(&self, candidate: &Candidate) -> String {
        let port = candidate.port.unwrap_or(self.port);
        let mut params = self.params.clone();
        match &candidate.variant {
            Some(BypassVariant::Sni { server_name }) => {
                set_param(&mut params, "sni", server_name);
                if self.network() == "ws" {
                    set_param(&mut params, "host", server_name);
                }
            }
            Some(BypassVariant::Fragment { length, interval }) => {
                set_param(&mut params, "fragment", &format!("tlshello,{length},{interval}"));
            }
            Some(BypassVariant::DnsTunnel { nameserver, .. }) => {
                set_param(&mut params, "dns", nameserver);
            }
            None => {}
        }
        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let remark = format!("edge-{}-{}", candidate.host, port).replace(':', "_");

        let mut out = format!(
            "{}://{}@{}:{}",
            self.protocol,
            self.credential,
            candidate.host.url_host(),
            port
        );
        if !query.is_empty() {
            out.push('?');
            out.push_str(&query);
        }
        out.push('#');
        out.push_str(&remark);
        out
    }
}

fn set_param(params: &mut Vec<(String, String)>, key: &str, value: &str) {
    match params.iter_mut().find(|(k, _)| k == key) {
        Some(slot) => slot.1 = value.to_string(),
        None => params.push((key.to_string(), value.to_string())),
    }
}
