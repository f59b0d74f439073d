//! SNI context provisioning
//!
//! [`IdentityManager`] owns the CA store, the certificate cache and the
//! default identity, and turns a server name into a ready-to-use rustls
//! [`ServerConfig`]. [`SniAcceptor`] is the handshake-time hook: it reads the
//! ClientHello, asks the manager for a context and finishes the handshake.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::Acceptor;
use rustls::ServerConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;

use super::ca::CertificateAuthority;
use super::cache::CertificateCache;
use super::mint::{mint_certificate, LeafCertificate};
use crate::config::IdentityConfig;
use crate::error::{Error, Result};

/// Issues and caches leaf certificates and builds TLS contexts from them
pub struct IdentityManager {
    ca: Arc<CertificateAuthority>,
    cache: CertificateCache,
    default_identity: Arc<LeafCertificate>,
    default_context: Arc<ServerConfig>,
    verbose: bool,
    mints: AtomicUsize,
}

impl std::fmt::Debug for IdentityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityManager")
            .field("default_identity", &self.default_identity.domain())
            .field("cache_size", &self.cache.len())
            .finish()
    }
}

impl IdentityManager {
    /// Load CA certificate and key, generate the shared leaf key, then mint
    /// and cache the default identity for `config.hostname`.
    ///
    /// Any failure is reported as [`Error::Initialization`].
    pub async fn init(config: &IdentityConfig, verbose: bool) -> Result<Self> {
        let ca = CertificateAuthority::load(&config.ca_cert, &config.ca_key)
            .await
            .map_err(|e| Error::initialization(e.to_string()))?;
        Self::with_authority(ca, &config.hostname, verbose)
            .await
            .map_err(|e| Error::initialization(format!("default identity: {}", e)))
    }

    /// Build a manager around an already loaded CA store
    pub async fn with_authority(
        ca: CertificateAuthority,
        hostname: &str,
        verbose: bool,
    ) -> Result<Self> {
        let ca = Arc::new(ca);
        let cache = CertificateCache::new();

        let default_identity = mint_blocking(ca.clone(), hostname).await?;
        let default_identity = cache.insert(hostname, default_identity);
        let default_context = build_context(&ca, &default_identity)?;

        tracing::info!(hostname = %hostname, "Default identity ready");

        Ok(Self {
            ca,
            cache,
            default_identity,
            default_context,
            verbose,
            mints: AtomicUsize::new(1),
        })
    }

    /// Mint a fresh certificate for `domain`, bypassing the cache.
    ///
    /// Signing runs on the blocking pool so handshakes for other domains
    /// keep progressing.
    pub async fn mint_certificate(&self, domain: &str) -> Result<LeafCertificate> {
        if self.verbose {
            tracing::info!(domain = %domain, "Minting certificate");
        } else {
            tracing::debug!(domain = %domain, "Minting certificate");
        }
        self.mints.fetch_add(1, Ordering::Relaxed);
        mint_blocking(self.ca.clone(), domain).await
    }

    /// Cached certificate for `domain`, minting it on first use
    pub async fn get_certificate(&self, domain: &str) -> Result<Arc<LeafCertificate>> {
        if let Some(cert) = self.cache.get(domain) {
            tracing::debug!(domain = %domain, "Using cached certificate");
            return Ok(cert);
        }
        self.cache
            .get_or_mint(domain, || self.mint_certificate(domain))
            .await
    }

    /// TLS context presenting `domain`'s certificate with the shared leaf
    /// key and the CA as chain
    pub async fn get_context(&self, domain: &str) -> Result<Arc<ServerConfig>> {
        let cert = self.get_certificate(domain).await?;
        build_context(&self.ca, &cert)
    }

    /// TLS context for connections that present no server name
    pub fn default_context(&self) -> Arc<ServerConfig> {
        self.default_context.clone()
    }

    /// Material for a TLS listener: trust anchor, default certificate,
    /// private key and the SNI hook
    pub fn server_options(self: &Arc<Self>) -> ServerOptions {
        ServerOptions {
            trust_anchor: self.ca.cert_der().clone(),
            default_certificate: self.default_identity.clone(),
            private_key: self.ca.leaf_key_der(),
            sni: SniAcceptor::new(self.clone()),
        }
    }

    pub fn authority(&self) -> &CertificateAuthority {
        &self.ca
    }

    pub fn default_identity(&self) -> &Arc<LeafCertificate> {
        &self.default_identity
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    /// Number of certificates signed so far, the default identity included
    pub fn mint_count(&self) -> usize {
        self.mints.load(Ordering::Relaxed)
    }
}

/// Everything a TLS listener needs from the identity subsystem
pub struct ServerOptions {
    pub trust_anchor: CertificateDer<'static>,
    pub default_certificate: Arc<LeafCertificate>,
    pub private_key: PrivateKeyDer<'static>,
    pub sni: SniAcceptor,
}

/// Completes server-side TLS handshakes with a certificate chosen from the
/// client's SNI.
///
/// A failure to produce a certificate fails only the handshake at hand.
#[derive(Clone)]
pub struct SniAcceptor {
    identity: Arc<IdentityManager>,
}

impl SniAcceptor {
    pub fn new(identity: Arc<IdentityManager>) -> Self {
        Self { identity }
    }

    /// Context for a ClientHello carrying `server_name`, or the default
    /// identity when there is none
    pub async fn resolve(&self, server_name: Option<&str>) -> Result<Arc<ServerConfig>> {
        match server_name {
            Some(name) => self.identity.get_context(name).await,
            None => Ok(self.identity.default_context()),
        }
    }

    /// Run the handshake on `stream`. Returns the TLS stream and the server
    /// name the client asked for.
    pub async fn accept<IO>(&self, stream: IO) -> Result<(TlsStream<IO>, Option<String>)>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let start = LazyConfigAcceptor::new(Acceptor::default(), stream)
            .await
            .map_err(|e| Error::tls(format!("Failed to read ClientHello: {}", e)))?;

        let server_name = start.client_hello().server_name().map(str::to_string);
        tracing::debug!(sni = ?server_name, "ClientHello received");

        let config = self.resolve(server_name.as_deref()).await?;
        let tls = start
            .into_stream(config)
            .await
            .map_err(|e| Error::tls(format!("TLS handshake failed: {}", e)))?;

        Ok((tls, server_name))
    }
}

async fn mint_blocking(ca: Arc<CertificateAuthority>, domain: &str) -> Result<LeafCertificate> {
    let domain = domain.to_string();
    tokio::task::spawn_blocking(move || mint_certificate(&ca, &domain))
        .await
        .map_err(|e| Error::generation(format!("Minting task failed: {}", e)))?
}

fn build_context(ca: &CertificateAuthority, cert: &LeafCertificate) -> Result<Arc<ServerConfig>> {
    let chain = vec![cert.der().clone(), ca.cert_der().clone()];

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, ca.leaf_key_der())
        .map_err(|e| Error::tls(format!("Failed to build server config: {}", e)))?;

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}
