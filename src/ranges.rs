//! Published CDN address blocks and address sampling inside them.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::types::{AddressFamily, CdnProvider};

const CLOUDFLARE_V4: &[&str] = &[
    "173.245.48.0/20", "103.21.244.0/22", "103.22.200.0/22", "103.31.4.0/22",
    "141.101.64.0/18", "108.162.192.0/18", "190.93.240.0/20", "188.114.96.0/20",
    "197.234.240.0/22", "198.41.128.0/17", "162.158.0.0/15", "104.16.0.0/13",
    "104.24.0.0/14", "172.64.0.0/13", "131.0.72.0/22",
];

const CLOUDFLARE_V6: &[&str] = &[
    "2400:cb00::/32", "2606:4700::/32", "2803:f800::/32", "2405:b500::/32",
    "2405:8100::/32", "2a06:98c0::/29", "2c0f:f248::/32",
];

const FASTLY_V4: &[&str] = &[
    "23.235.32.0/20", "43.249.72.0/22", "103.244.50.0/24", "103.245.222.0/23",
    "103.245.224.0/24", "104.156.80.0/20", "140.248.64.0/18", "140.248.128.0/17",
    "146.75.0.0/16", "151.101.0.0/16", "157.52.64.0/18", "167.82.0.0/17",
    "167.82.128.0/20", "167.82.160.0/20", "167.82.224.0/20", "172.111.64.0/18",
    "185.31.16.0/22", "199.27.72.0/21", "199.232.0.0/16",
];

const FASTLY_V6: &[&str] = &["2a04:4e40::/32", "2a04:4e42::/32"];

/// Published blocks of `provider` admitted by `family`.
pub fn official_ranges(provider: CdnProvider, family: AddressFamily) -> Vec<IpNet> {
    let (v4, v6) = match provider {
        CdnProvider::Cloudflare => (CLOUDFLARE_V4, CLOUDFLARE_V6),
        CdnProvider::Fastly => (FASTLY_V4, FASTLY_V6),
    };
    v4.iter()
        .chain(v6.iter())
        .filter_map(|s| s.parse::<IpNet>().ok())
        .filter(|n| family.admits(&n.network()))
        .collect()
}

/// Lazily yields up to `count` distinct random addresses: a block is picked uniformly,
/// then an address uniformly inside it.
pub struct RangeSampler {
    nets: Vec<IpNet>,
    remaining: usize,
    seen: HashSet<IpAddr>,
    rng: StdRng,
}

/// Consecutive duplicate draws tolerated before the sampler gives up.
const MAX_DUPLICATE_DRAWS: usize = 64;

impl RangeSampler {
    pub fn new(nets: Vec<IpNet>, count: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let remaining = if nets.is_empty() { 0 } else { count };
        Self { nets, remaining, seen: HashSet::new(), rng }
    }

    /// Upper bound on the number of addresses this sampler yields.
    pub fn planned(&self) -> usize {
        self.remaining
    }
}

impl Iterator for RangeSampler {
    type Item = IpAddr;

    fn next(&mut self) -> Option<IpAddr> {
        if self.remaining == 0 {
            return None;
        }
        for _ in 0..MAX_DUPLICATE_DRAWS {
            let net = *self.nets.choose(&mut self.rng)?;
            let ip = random_in(&net, &mut self.rng);
            if self.seen.insert(ip) {
                self.remaining -= 1;
                return Some(ip);
            }
        }
        // Blocks exhausted.
        self.remaining = 0;
        None
    }
}

fn random_in(net: &IpNet, rng: &mut impl Rng) -> IpAddr {
    match net {
        IpNet::V4(n) => {
            let host_bits = 32 - u32::from(n.prefix_len());
            let base = u32::from(n.network());
            let offset = if host_bits == 32 { rng.gen::<u32>() } else { rng.gen_range(0..(1u32 << host_bits)) };
            IpAddr::V4(Ipv4Addr::from(base | offset))
        }
        IpNet::V6(n) => {
            let host_bits = 128 - u32::from(n.prefix_len());
            let base = u128::from(n.network());
            let offset = if host_bits == 128 { rng.gen::<u128>() } else { rng.gen_range(0..(1u128 << host_bits)) };
            IpAddr::V6(Ipv6Addr::from(base | offset))
        }
    }
}

/// Expand a CIDR into individual host addresses, at most `limit` of them.
///
/// For IPv4, excludes the network and broadcast addresses (except /31 and /32).
pub fn expand_cidr_to_ips(cidr: IpNet, limit: usize) -> Vec<IpAddr> {
    cidr.hosts().take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipnet::Ipv4Net;

    #[test]
    fn family_filter_applies_to_blocks() {
        let v4 = official_ranges(CdnProvider::Cloudflare, AddressFamily::V4);
        assert_eq!(v4.len(), CLOUDFLARE_V4.len());
        assert!(v4.iter().all(|n| n.network().is_ipv4()));

        let v6 = official_ranges(CdnProvider::Fastly, AddressFamily::V6);
        assert!(!v6.is_empty());
        assert!(v6.iter().all(|n| n.network().is_ipv6()));

        let all = official_ranges(CdnProvider::Cloudflare, AddressFamily::Any);
        assert_eq!(all.len(), CLOUDFLARE_V4.len() + CLOUDFLARE_V6.len());
    }

    #[test]
    fn sampler_stays_inside_blocks() {
        let nets = official_ranges(CdnProvider::Cloudflare, AddressFamily::Any);
        let ips: Vec<IpAddr> = RangeSampler::new(nets.clone(), 200, Some(7)).collect();
        assert_eq!(ips.len(), 200);
        assert!(ips.iter().all(|ip| nets.iter().any(|n| n.contains(ip))));
        let unique: HashSet<_> = ips.iter().collect();
        assert_eq!(unique.len(), 200);
    }

    #[test]
    fn seeded_sampler_is_deterministic() {
        let nets = official_ranges(CdnProvider::Cloudflare, AddressFamily::V4);
        let a: Vec<IpAddr> = RangeSampler::new(nets.clone(), 20, Some(42)).collect();
        let b: Vec<IpAddr> = RangeSampler::new(nets, 20, Some(42)).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn sampler_stops_when_block_is_exhausted() {
        let net: IpNet = "10.0.0.0/30".parse().unwrap();
        let ips: Vec<IpAddr> = RangeSampler::new(vec![net], 50, Some(1)).collect();
        assert_eq!(ips.len(), 4);
    }

    #[test]
    fn empty_blocks_yield_nothing() {
        let mut s = RangeSampler::new(Vec::new(), 10, None);
        assert_eq!(s.planned(), 0);
        assert_eq!(s.next(), None);
    }

    #[test]
    fn expand_small_cidr_excludes_network_and_broadcast() {
        let net = Ipv4Net::new(Ipv4Addr::new(192, 168, 1, 0), 30).unwrap();
        let hosts = expand_cidr_to_ips(IpNet::V4(net), 100);
        assert_eq!(
            hosts,
            vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)), IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2))]
        );
    }

    #[test]
    fn expansion_is_capped() {
        let net: IpNet = "104.16.0.0/13".parse().unwrap();
        assert_eq!(expand_cidr_to_ips(net, 16).len(), 16);
    }
}
