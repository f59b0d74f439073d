//! Configuration parsing and management

use hyper::http::uri::Authority;
use hyper::Uri;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// CA material and the proxy's own hostname
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Listener and DNS settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Certificate authority and default identity settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IdentityConfig {
    /// Path to the CA certificate (PEM)
    #[serde(default = "default_ca_cert")]
    pub ca_cert: String,

    /// Path to the CA private key (PEM)
    #[serde(default = "default_ca_key")]
    pub ca_key: String,

    /// Externally reachable hostname, used for the default certificate
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            ca_cert: default_ca_cert(),
            ca_key: default_ca_key(),
            hostname: default_hostname(),
        }
    }
}

fn default_ca_cert() -> String {
    "ca-cert.pem".to_string()
}

fn default_ca_key() -> String {
    "ca-key.pem".to_string()
}

fn default_hostname() -> String {
    "localhost".to_string()
}

/// Network configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    /// Externally reachable IPv4 address. Listeners bind here and forged
    /// A answers point here.
    #[serde(default = "default_bind")]
    pub bind: Ipv4Addr,

    #[serde(default = "default_https_ports")]
    pub https_ports: Vec<u16>,

    #[serde(default = "default_http_ports")]
    pub http_ports: Vec<u16>,

    #[serde(default = "default_dns_port")]
    pub dns_port: u16,

    /// Domain suffixes resolved truthfully and never intercepted
    #[serde(default = "default_honest")]
    pub honest: Vec<String>,

    /// Upstream DNS server for honest queries. Defaults to the first
    /// nameserver in /etc/resolv.conf.
    #[serde(default)]
    pub upstream_dns: Option<String>,

    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,

    /// Skip certificate verification when forwarding to HTTPS origins
    #[serde(default)]
    pub insecure: bool,

    /// HTTP proxy for outgoing requests, `host:port` or `http://host:port`
    #[serde(default)]
    pub upstream_proxy: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            https_ports: default_https_ports(),
            http_ports: default_http_ports(),
            dns_port: default_dns_port(),
            honest: default_honest(),
            upstream_dns: None,
            upstream_timeout_ms: default_upstream_timeout_ms(),
            insecure: false,
            upstream_proxy: None,
        }
    }
}

fn default_bind() -> Ipv4Addr {
    Ipv4Addr::LOCALHOST
}

fn default_https_ports() -> Vec<u16> {
    vec![443, 8443]
}

fn default_http_ports() -> Vec<u16> {
    vec![80, 8080]
}

fn default_dns_port() -> u16 {
    53
}

fn default_honest() -> Vec<String> {
    vec!["local".to_string()]
}

fn default_upstream_timeout_ms() -> u64 {
    5000
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log DNS queries, minted certificates and forwarded requests at info
    #[serde(default)]
    pub verbose: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            verbose: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "Failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::config(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        for suffix in &self.network.honest {
            if suffix.trim().is_empty() {
                return Err(Error::config("honest domain suffixes must not be empty"));
            }
            if suffix.starts_with('.') {
                return Err(Error::config(format!(
                    "honest domain suffix {:?} must not start with '.'",
                    suffix
                )));
            }
        }

        let ports = self
            .network
            .https_ports
            .iter()
            .chain(self.network.http_ports.iter());
        for port in ports {
            if *port == 0 {
                return Err(Error::config("listener ports must not be 0"));
            }
        }

        if self.network.upstream_timeout_ms == 0 {
            return Err(Error::config("upstream_timeout_ms must be greater than 0"));
        }

        if let Some(ref upstream) = self.network.upstream_dns {
            parse_nameserver(upstream)?;
        }
        self.upstream_proxy()?;

        Ok(())
    }

    /// Socket address for the DNS listener
    pub fn dns_listen_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.network.bind), self.network.dns_port)
    }

    /// Upper bound for a single upstream DNS exchange
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.network.upstream_timeout_ms)
    }

    /// Resolve the upstream nameserver, falling back to the system resolver
    /// configuration and then to a public resolver.
    pub fn upstream_dns_addr(&self) -> Result<SocketAddr> {
        match &self.network.upstream_dns {
            Some(addr) => parse_nameserver(addr),
            None => Ok(crate::dns::system_nameserver()
                .unwrap_or_else(|| SocketAddr::from(([1, 1, 1, 1], 53)))),
        }
    }

    /// Authority of the outgoing HTTP proxy, if one is configured
    pub fn upstream_proxy(&self) -> Result<Option<Authority>> {
        self.network
            .upstream_proxy
            .as_deref()
            .map(parse_upstream_proxy)
            .transpose()
    }
}

/// Parse `host[:port]` or `http://host[:port]`. Credentials are not
/// supported.
pub fn parse_upstream_proxy(value: &str) -> Result<Authority> {
    let invalid = || Error::config(format!("Invalid upstream proxy '{}'", value));

    let uri = value.parse::<Uri>().map_err(|_| invalid())?;
    if let Some(scheme) = uri.scheme_str() {
        if scheme != "http" {
            return Err(Error::config(format!(
                "Upstream proxy '{}' must use http, not {}",
                value, scheme
            )));
        }
    }

    let authority = uri.authority().cloned().ok_or_else(invalid)?;
    if authority.as_str().contains('@') {
        return Err(Error::config(format!(
            "Upstream proxy '{}' must not carry credentials",
            value
        )));
    }
    Ok(authority)
}

/// Parse `ip` or `ip:port` (`[v6]:port` for IPv6), defaulting to port 53
pub fn parse_nameserver(value: &str) -> Result<SocketAddr> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    value
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, 53))
        .map_err(|_| Error::config(format!("Invalid upstream DNS address '{}'", value)))
}
