use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

/// HTTPS ports served by Cloudflare edges.
pub const CDN_TLS_PORTS: &[u16] = &[443, 2053, 2083, 2087, 2096, 8443];

/// Plain-HTTP ports served by Cloudflare edges.
pub const CDN_PLAIN_PORTS: &[u16] = &[80, 8080, 8880, 2052, 2082, 2086, 2095];

/// Parse an edge port list into deduplicated ports, keeping first-seen order.
///
/// Entries are separated by newlines or commas:
/// - single port number: `443`
/// - inclusive range: `2083-2087`
/// - `tls` or `http`: every Cloudflare edge port of that kind
/// - comments: everything after `#` on a line is ignored
pub fn parse_ports_str(s: &str) -> Result<Vec<u16>> {
    let mut ports = PortSet::default();

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        for item in line.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            match item.to_ascii_lowercase().as_str() {
                "tls" | "https" => ports.extend(CDN_TLS_PORTS.iter().copied()),
                "http" | "plain" => ports.extend(CDN_PLAIN_PORTS.iter().copied()),
                _ => match item.split_once('-') {
                    Some((a, b)) => {
                        let first = parse_port_str(a.trim())
                            .with_context(|| format!("line {line_no}: bad range start `{a}`"))?;
                        let last = parse_port_str(b.trim())
                            .with_context(|| format!("line {line_no}: bad range end `{b}`"))?;
                        if first > last {
                            bail!("line {line_no}: empty port range {first}-{last}");
                        }
                        ports.extend(first..=last);
                    }
                    None => ports.push(
                        parse_port_str(item).with_context(|| format!("line {line_no}: bad port `{item}`"))?,
                    ),
                },
            }
        }
    }

    Ok(ports.order)
}

#[derive(Default)]
struct PortSet {
    seen: std::collections::HashSet<u16>,
    order: Vec<u16>,
}

impl PortSet {
    fn push(&mut self, port: u16) {
        if self.seen.insert(port) {
            self.order.push(port);
        }
    }

    fn extend(&mut self, ports: impl IntoIterator<Item = u16>) {
        for p in ports {
            self.push(p);
        }
    }
}

/// Load a port list from a file path. Errors if the file cannot be read or parsed.
pub fn load_ports_from_path(path: impl AsRef<Path>) -> Result<Vec<u16>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read ports file: {}", path.as_ref().display()))?;
    parse_ports_str(&content)
}

/// Edge ports matching the base config's transport security.
pub fn default_ports(tls: bool) -> Vec<u16> {
    if tls {
        CDN_TLS_PORTS.to_vec()
    } else {
        CDN_PLAIN_PORTS.to_vec()
    }
}

fn parse_port_str(s: &str) -> Result<u16> {
    match s.parse::<u16>() {
        Ok(0) => bail!("port 0 cannot be scanned"),
        Ok(p) => Ok(p),
        Err(e) => bail!("{e}"),
    }
}
