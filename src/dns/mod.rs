//! DNS interception
//!
//! [`DnsPolicy`] decides per query whether to forge an answer pointing at the
//! proxy or to resolve truthfully through an [`UpstreamResolver`].
//! [`DnsServer`] is the UDP transport in front of it.

mod policy;
mod server;
mod upstream;

pub use policy::{canonical_ipv6, AnswerData, DnsAnswer, DnsPolicy, DnsQuery};
pub use server::{respond, DnsServer, ANSWER_TTL};
pub use upstream::{UdpUpstream, UpstreamResolver};

use std::net::{IpAddr, SocketAddr};

const RESOLV_CONF: &str = "/etc/resolv.conf";

/// First nameserver listed in /etc/resolv.conf, if any
pub fn system_nameserver() -> Option<SocketAddr> {
    let content = std::fs::read_to_string(RESOLV_CONF).ok()?;
    parse_resolv_conf(&content)
}

fn parse_resolv_conf(content: &str) -> Option<SocketAddr> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("nameserver") => fields.next(),
                _ => None,
            }
        })
        // Scoped IPv6 entries (fe80::1%eth0) are skipped
        .find_map(|value| value.parse::<IpAddr>().ok())
        .map(|ip| SocketAddr::new(ip, 53))
}
