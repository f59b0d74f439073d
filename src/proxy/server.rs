//! HTTP and HTTPS listeners

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use super::forward::{Forwarder, Scheme};
use crate::error::{Error, Result};
use crate::tls::SniAcceptor;

/// A bound listener that forwards every request it receives.
///
/// HTTPS listeners terminate TLS with a certificate picked from the
/// client's SNI before any HTTP is read.
pub struct ProxyListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    sni: Option<SniAcceptor>,
    forwarder: Arc<Forwarder>,
}

impl ProxyListener {
    pub async fn bind_http(addr: SocketAddr, forwarder: Arc<Forwarder>) -> Result<Self> {
        Self::bind(addr, None, forwarder).await
    }

    pub async fn bind_https(
        addr: SocketAddr,
        sni: SniAcceptor,
        forwarder: Arc<Forwarder>,
    ) -> Result<Self> {
        Self::bind(addr, Some(sni), forwarder).await
    }

    async fn bind(
        addr: SocketAddr,
        sni: Option<SniAcceptor>,
        forwarder: Arc<Forwarder>,
    ) -> Result<Self> {
        let scheme = if sni.is_some() {
            Scheme::Https
        } else {
            Scheme::Http
        };
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            Error::initialization(format!("Failed to bind {} listener on {}: {}", scheme, addr, e))
        })?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            sni,
            forwarder,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn scheme(&self) -> Scheme {
        if self.sni.is_some() {
            Scheme::Https
        } else {
            Scheme::Http
        }
    }

    /// Accept connections until `shutdown` resolves
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send) -> Result<()> {
        tokio::pin!(shutdown);
        let scheme = self.scheme();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::debug!(address = %self.local_addr, %scheme, "Listener stopping");
                    return Ok(());
                }
                result = self.listener.accept() => {
                    let (stream, client_addr) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    tracing::trace!(client = %client_addr, %scheme, "New connection");

                    let forwarder = self.forwarder.clone();
                    match self.sni.clone() {
                        None => {
                            tokio::spawn(serve_http(stream, scheme, forwarder, client_addr));
                        }
                        Some(sni) => {
                            tokio::spawn(async move {
                                match sni.accept(stream).await {
                                    Ok((tls, _server_name)) => {
                                        serve_http(tls, scheme, forwarder, client_addr).await;
                                    }
                                    Err(e) => {
                                        tracing::debug!(client = %client_addr, error = %e, "TLS handshake failed");
                                    }
                                }
                            });
                        }
                    }
                }
            }
        }
    }
}

/// Serve HTTP/1.1 or HTTP/2 on one established connection
async fn serve_http<S>(stream: S, scheme: Scheme, forwarder: Arc<Forwarder>, client_addr: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let forwarder = forwarder.clone();
        async move { forwarder.handle(scheme, req).await }
    });

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder.http1().preserve_header_case(true).half_close(true);

    if let Err(e) = builder
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        tracing::debug!(client = %client_addr, error = %e, "Connection error");
    }
}
