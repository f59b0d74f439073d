//! Error types for semiproxy

use std::io;

/// Main error type for the proxy
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Fatal: a startup stage failed and no listener may accept connections.
    #[error("Initialization failed: {0}")]
    Initialization(String),

    /// Contained to a single DNS query, which is answered with zero records.
    #[error("Upstream resolution failed: {0}")]
    UpstreamResolution(String),

    /// Contained to a single TLS handshake.
    #[error("Certificate generation failed: {0}")]
    CertificateGeneration(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Proxy error: {0}")]
    Proxy(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn initialization(msg: impl Into<String>) -> Self {
        Error::Initialization(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Error::UpstreamResolution(msg.into())
    }

    pub fn generation(msg: impl Into<String>) -> Self {
        Error::CertificateGeneration(msg.into())
    }

    pub fn certificate(msg: impl Into<String>) -> Self {
        Error::Certificate(msg.into())
    }

    pub fn tls(msg: impl Into<String>) -> Self {
        Error::Tls(msg.into())
    }

    pub fn proxy(msg: impl Into<String>) -> Self {
        Error::Proxy(msg.into())
    }

    /// Whether this error must abort startup.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Initialization(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
