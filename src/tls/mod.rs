//! Certificate authority emulation
//!
//! Loads the operator's CA, mints per-domain leaf certificates on demand and
//! hands TLS listeners a server context chosen by SNI.

mod ca;
mod cache;
mod identity;
mod mint;
mod upstream;

pub use ca::{CertificateAuthority, GeneratedCa};
pub use cache::CertificateCache;
pub use identity::{IdentityManager, ServerOptions, SniAcceptor};
pub use mint::{mint_certificate, LeafCertificate, LEAF_VALIDITY_DAYS};
pub use upstream::client_config;
