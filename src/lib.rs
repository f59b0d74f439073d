//! Semiproxy - a semi-transparent interception proxy
//!
//! A DNS responder points every name that is not explicitly honest at the
//! proxy's own address. HTTPS connections arriving there are terminated with
//! a leaf certificate minted on demand for the SNI hostname and signed by a
//! locally trusted CA, then forwarded to the real origin.
//!
//! # Example
//!
//! ```no_run
//! use semiproxy::{Config, Proxy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("semiproxy.toml")?;
//!     let proxy = Proxy::start(&config).await?;
//!     proxy.serve(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     }).await?;
//!     Ok(())
//! }
//! ```

pub mod bootstrap;
pub mod config;
pub mod dns;
pub mod error;
pub mod proxy;
pub mod tls;

pub use bootstrap::Proxy;
pub use config::Config;
pub use dns::{DnsPolicy, DnsServer, UdpUpstream, UpstreamResolver};
pub use error::{Error, Result};
pub use proxy::{Forwarder, ProxyListener};
pub use tls::{CertificateAuthority, GeneratedCa, IdentityManager, SniAcceptor};
