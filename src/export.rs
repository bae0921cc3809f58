//! Export of accepted endpoints as client configurations.

use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::{BaseConfig, TunnelProtocol};
use crate::types::ProbeResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    /// Newline-joined share links, base64 encoded.
    #[default]
    Base64,
    /// sing-box outbound list with a selector in front.
    Singbox,
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExportFormat::Base64 => "base64",
            ExportFormat::Singbox => "singbox",
        })
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "base64" | "sub" | "subscription" => Ok(ExportFormat::Base64),
            "singbox" | "sing-box" => Ok(ExportFormat::Singbox),
            other => Err(format!("unknown export format: {other}")),
        }
    }
}

/// Renders accepted results in `format`. Results without a link are skipped.
pub fn render(format: ExportFormat, results: &[ProbeResult], base: &BaseConfig) -> String {
    match format {
        ExportFormat::Base64 => base64_subscription(results),
        ExportFormat::Singbox => {
            serde_json::to_string_pretty(&singbox_config(results, base)).unwrap_or_else(|_| String::from("{}"))
        }
    }
}

pub fn base64_subscription(results: &[ProbeResult]) -> String {
    let links: Vec<&str> = results.iter().filter_map(|r| r.link.as_deref()).collect();
    base64::engine::general_purpose::STANDARD.encode(links.join("\n"))
}

pub fn singbox_config(results: &[ProbeResult], base: &BaseConfig) -> Value {
    let outbounds: Vec<Value> = results
        .iter()
        .filter(|r| r.link.is_some())
        .map(|r| singbox_outbound(r, base))
        .collect();
    let tags: Vec<Value> = outbounds.iter().filter_map(|o| o.get("tag").cloned()).collect();

    let mut all = vec![json!({ "type": "selector", "tag": "select", "outbounds": tags })];
    all.extend(outbounds);
    json!({ "outbounds": all })
}

fn singbox_outbound(r: &ProbeResult, base: &BaseConfig) -> Value {
    let mut o = Map::new();
    o.insert("type".into(), json!(base.protocol.scheme()));
    o.insert("tag".into(), json!(format!("edge-{}-{}", r.address, r.port)));
    o.insert("server".into(), json!(r.address));
    o.insert("server_port".into(), json!(r.port));
    match base.protocol {
        TunnelProtocol::Vless => o.insert("uuid".into(), json!(base.credential)),
        TunnelProtocol::Trojan => o.insert("password".into(), json!(base.credential)),
    };

    let server_name = r.server_name.clone().or_else(|| base.server_name()).unwrap_or_default();
    match base.param("security") {
        Some("tls") => {
            o.insert("tls".into(), json!({ "enabled": true, "server_name": server_name, "insecure": true }));
        }
        Some("reality") => {
            let mut tls = json!({
                "enabled": true,
                "server_name": server_name,
                "reality": {
                    "enabled": true,
                    "public_key": base.param("pbk").unwrap_or_default(),
                    "short_id": base.param("sid").unwrap_or_default(),
                }
            });
            if let Some(fp) = base.param("fp") {
                tls["utls"] = json!({ "enabled": true, "fingerprint": fp });
            }
            o.insert("tls".into(), tls);
        }
        _ => {}
    }

    match base.network() {
        "ws" => {
            let path = percent_decode(base.param("path").unwrap_or("/"));
            o.insert(
                "transport".into(),
                json!({ "type": "ws", "path": path, "headers": { "Host": base.http_host() } }),
            );
        }
        "grpc" => {
            o.insert(
                "transport".into(),
                json!({ "type": "grpc", "service_name": base.param("serviceName").unwrap_or_default() }),
            );
        }
        _ => {}
    }
    Value::Object(o)
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(b) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Candidate, ProbeStatus};

    const LINK: &str = "vless://uuid-1@worker.example.com:443?security=tls&sni=worker.example.com&type=ws&host=worker.example.com&path=%2Fws%3Fed%3D2048#r";

    fn accepted(base: &BaseConfig, addr: &str) -> ProbeResult {
        let cand = Candidate::new(addr.parse().unwrap());
        ProbeResult {
            candidate: cand.label(443),
            address: addr.into(),
            port: 443,
            status: ProbeStatus::Ok,
            latency_ms: Some(80),
            jitter_ms: Some(4),
            download_mbps: None,
            upload_mbps: None,
            datacenter: None,
            location: None,
            asn: None,
            family: None,
            server_name: base.server_name(),
            variant: None,
            detail: None,
            link: Some(base.materialize(&cand)),
            timestamp: String::new(),
        }
    }

    #[test]
    fn subscription_decodes_to_links() {
        let base: BaseConfig = LINK.parse().unwrap();
        let results = vec![accepted(&base, "104.16.0.1"), accepted(&base, "104.16.0.2")];
        let encoded = base64_subscription(&results);
        let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
        let text = String::from_utf8(decoded).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("vless://uuid-1@104.16.0.1:443?"));
    }

    #[test]
    fn singbox_has_selector_and_ws_transport() {
        let base: BaseConfig = LINK.parse().unwrap();
        let cfg = singbox_config(&[accepted(&base, "104.16.0.1")], &base);
        let outbounds = cfg["outbounds"].as_array().unwrap();
        assert_eq!(outbounds.len(), 2);
        assert_eq!(outbounds[0]["type"], "selector");
        assert_eq!(outbounds[0]["outbounds"][0], "edge-104.16.0.1-443");

        let o = &outbounds[1];
        assert_eq!(o["type"], "vless");
        assert_eq!(o["uuid"], "uuid-1");
        assert_eq!(o["server_port"], 443);
        assert_eq!(o["tls"]["server_name"], "worker.example.com");
        assert_eq!(o["transport"]["path"], "/ws?ed=2048");
        assert_eq!(o["transport"]["headers"]["Host"], "worker.example.com");
    }

    #[test]
    fn format_names() {
        assert_eq!("sing-box".parse::<ExportFormat>().unwrap(), ExportFormat::Singbox);
        assert_eq!("BASE64".parse::<ExportFormat>().unwrap(), ExportFormat::Base64);
        assert!("clash".parse::<ExportFormat>().is_err());
        assert_eq!(percent_decode("%2F%zz"), "/%zz");
    }
}
