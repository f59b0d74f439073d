//! Forwarding intercepted requests to their real origin

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::Incoming;
use hyper::http::uri::{Authority, PathAndQuery};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::response::error_response;
use crate::error::{Error, Result};

/// Headers scoped to a single connection, never forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Scheme of the listener a request arrived on, reused towards the origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => f.write_str("http"),
            Scheme::Https => f.write_str("https"),
        }
    }
}

/// Where a request is headed: `scheme://authority/path?query`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: Scheme,
    pub authority: Authority,
    pub path_and_query: PathAndQuery,
}

impl Target {
    /// Origin of `req`, taken from the Host header or, for HTTP/2, the
    /// request authority
    pub fn from_request<B>(scheme: Scheme, req: &Request<B>) -> Result<Self> {
        let authority = match req.headers().get(hyper::header::HOST) {
            Some(host) => host
                .to_str()
                .ok()
                .and_then(|host| host.parse::<Authority>().ok())
                .ok_or_else(|| Error::proxy("Invalid Host header"))?,
            None => req
                .uri()
                .authority()
                .cloned()
                .ok_or_else(|| Error::proxy("Request has no Host header"))?,
        };

        let path_and_query = req
            .uri()
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));

        Ok(Self {
            scheme,
            authority,
            path_and_query,
        })
    }

    /// Host without IPv6 brackets
    pub fn host(&self) -> &str {
        self.authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
    }

    pub fn port(&self) -> u16 {
        self.authority
            .port_u16()
            .unwrap_or_else(|| self.scheme.default_port())
    }

    pub fn url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.authority, self.path_and_query)
    }

    fn absolute_uri(&self) -> Result<Uri> {
        Uri::builder()
            .scheme(self.scheme.to_string().as_str())
            .authority(self.authority.clone())
            .path_and_query(self.path_and_query.clone())
            .build()
            .map_err(|e| Error::proxy(format!("Failed to build URI for {}: {}", self.url(), e)))
    }
}

/// Sends each intercepted request to its origin and relays the response.
///
/// Redirects are passed back to the client, never followed.
pub struct Forwarder {
    client_tls: Arc<ClientConfig>,
    verbose: bool,
    connect_override: Option<SocketAddr>,
    upstream_proxy: Option<Authority>,
}

impl Forwarder {
    pub fn new(client_tls: Arc<ClientConfig>, verbose: bool) -> Self {
        Self {
            client_tls,
            verbose,
            connect_override: None,
            upstream_proxy: None,
        }
    }

    /// Open every origin connection to `addr` instead of resolving the
    /// target host. TLS still uses the target host as server name. Ignored
    /// when an upstream proxy is set.
    pub fn with_connect_override(mut self, addr: SocketAddr) -> Self {
        self.connect_override = Some(addr);
        self
    }

    /// Send every request through the HTTP proxy at `proxy`. Plain HTTP
    /// goes in absolute form; HTTPS is tunnelled with CONNECT.
    pub fn with_upstream_proxy(mut self, proxy: Authority) -> Self {
        self.upstream_proxy = Some(proxy);
        self
    }

    /// Forward `req`, turning any failure into a 500 `ERROR:` response
    pub async fn handle(
        &self,
        scheme: Scheme,
        req: Request<Incoming>,
    ) -> std::result::Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        let target = match Target::from_request(scheme, &req) {
            Ok(target) => target,
            Err(e) => {
                tracing::debug!(error = %e, "Rejecting request without a usable host");
                return Ok(error_response(&e.to_string()));
            }
        };

        if self.verbose {
            tracing::info!("{}:{}", req.method(), target.url());
        } else {
            tracing::debug!(method = %req.method(), url = %target.url(), "Forwarding request");
        }

        match self.forward(&target, req).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                tracing::warn!(url = %target.url(), error = %e, "Failed to forward request");
                Ok(error_response(&e.to_string()))
            }
        }
    }

    async fn forward(
        &self,
        target: &Target,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>> {
        match (target.scheme, &self.upstream_proxy) {
            (Scheme::Http, None) => {
                let tcp = self.connect(target).await?;
                send_http1(TokioIo::new(tcp), target, req, false).await
            }
            (Scheme::Http, Some(proxy)) => {
                let tcp = connect_proxy(proxy).await?;
                send_http1(TokioIo::new(tcp), target, req, true).await
            }
            (Scheme::Https, None) => {
                let tcp = self.connect(target).await?;
                self.send_tls(tcp, target, req).await
            }
            (Scheme::Https, Some(proxy)) => {
                let tcp = connect_proxy(proxy).await?;
                let tunnel = open_tunnel(tcp, proxy, target).await?;
                self.send_tls(tunnel, target, req).await
            }
        }
    }

    /// TLS handshake with the origin over `io`, then HTTP/2 or HTTP/1.1 as
    /// negotiated through ALPN
    async fn send_tls<IO>(
        &self,
        io: IO,
        target: &Target,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let server_name = ServerName::try_from(target.host().to_string()).map_err(|e| {
            Error::proxy(format!("Invalid server name '{}': {}", target.host(), e))
        })?;
        let tls = TlsConnector::from(self.client_tls.clone())
            .connect(server_name, io)
            .await
            .map_err(|e| Error::tls(format!("TLS connection to {} failed: {}", target.host(), e)))?;

        let negotiated_h2 = tls.get_ref().1.alpn_protocol() == Some(b"h2".as_slice());
        tracing::debug!(host = %target.host(), h2 = negotiated_h2, "Origin TLS handshake complete");

        if negotiated_h2 {
            send_http2(TokioIo::new(tls), target, req).await
        } else {
            send_http1(TokioIo::new(tls), target, req, false).await
        }
    }

    async fn connect(&self, target: &Target) -> Result<TcpStream> {
        let result = match self.connect_override {
            Some(addr) => TcpStream::connect(addr).await,
            None => TcpStream::connect((target.host(), target.port())).await,
        };
        result.map_err(|e| {
            Error::proxy(format!(
                "Failed to connect to {}:{}: {}",
                target.host(),
                target.port(),
                e
            ))
        })
    }
}

async fn connect_proxy(proxy: &Authority) -> Result<TcpStream> {
    let host = proxy.host().trim_start_matches('[').trim_end_matches(']');
    let port = proxy.port_u16().unwrap_or(80);
    TcpStream::connect((host, port))
        .await
        .map_err(|e| Error::proxy(format!("Failed to connect to upstream proxy {}: {}", proxy, e)))
}

/// Ask the proxy on `tcp` for a `CONNECT host:port` tunnel to `target`
async fn open_tunnel(
    tcp: TcpStream,
    proxy: &Authority,
    target: &Target,
) -> Result<TokioIo<Upgraded>> {
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tcp))
        .await
        .map_err(|e| Error::proxy(format!("Handshake with upstream proxy {} failed: {}", proxy, e)))?;

    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            tracing::debug!(error = %e, "Upstream proxy connection error");
        }
    });

    let destination = format!("{}:{}", target.authority.host(), target.port());
    let req = Request::connect(destination.as_str())
        .header(hyper::header::HOST, destination.as_str())
        .body(Empty::<Bytes>::new())
        .map_err(|e| Error::proxy(format!("Failed to build CONNECT request: {}", e)))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| Error::proxy(format!("CONNECT {} via {} failed: {}", destination, proxy, e)))?;
    if resp.status() != StatusCode::OK {
        return Err(Error::proxy(format!(
            "Upstream proxy {} refused CONNECT {}: {}",
            proxy,
            destination,
            resp.status()
        )));
    }

    let upgraded = hyper::upgrade::on(resp)
        .await
        .map_err(|e| Error::proxy(format!("CONNECT tunnel to {} failed: {}", destination, e)))?;
    tracing::debug!(proxy = %proxy, destination = %destination, "Tunnel established");
    Ok(TokioIo::new(upgraded))
}

/// Copy `parts` onto a new request for `uri`, dropping hop-by-hop headers.
/// HTTP/2 carries the authority in the URI, so `host` is only set for HTTP/1.
fn rebuild(
    parts: hyper::http::request::Parts,
    body: Incoming,
    uri: Uri,
    host: Option<&Authority>,
) -> Result<Request<Incoming>> {
    let mut builder = Request::builder().method(parts.method).uri(uri);

    for (name, value) in &parts.headers {
        if !HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            builder = builder.header(name, value);
        }
    }
    if let Some(host) = host {
        if !parts.headers.contains_key(hyper::header::HOST) {
            builder = builder.header(hyper::header::HOST, host.as_str());
        }
    }

    builder
        .body(body)
        .map_err(|e| Error::proxy(format!("Failed to build request: {}", e)))
}

/// Send `req` over HTTP/1.1. `absolute_form` puts the full URL in the
/// request line, as a forward proxy expects.
async fn send_http1<IO>(
    io: TokioIo<IO>,
    target: &Target,
    req: Request<Incoming>,
    absolute_form: bool,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| Error::proxy(format!("HTTP handshake failed: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "Origin connection error");
        }
    });

    let (parts, body) = req.into_parts();
    let uri = if absolute_form {
        target.absolute_uri()?
    } else {
        Uri::from(target.path_and_query.clone())
    };
    let req = rebuild(parts, body, uri, Some(&target.authority))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| Error::proxy(format!("Request to {} failed: {}", target.url(), e)))?;

    Ok(resp.map(|body| body.boxed()))
}

async fn send_http2<IO>(
    io: TokioIo<IO>,
    target: &Target,
    req: Request<Incoming>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http2::handshake(TokioExecutor::new(), io)
        .await
        .map_err(|e| Error::proxy(format!("HTTP/2 handshake failed: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "Origin HTTP/2 connection error");
        }
    });

    let (mut parts, body) = req.into_parts();
    parts.headers.remove(hyper::header::HOST);
    let uri = target.absolute_uri()?;
    let req = rebuild(parts, body, uri, None)?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| Error::proxy(format!("HTTP/2 request to {} failed: {}", target.url(), e)))?;

    Ok(resp.map(|body| body.boxed()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use semiproxy_test_support::test_report;

    #[test]
    fn test_target_from_host_header() {
        let t = test_report!("Target comes from the Host header");
        let req = Request::builder()
            .uri("/search?q=rust")
            .header("host", "example.com:8080")
            .body(())
            .unwrap();

        let target = Target::from_request(Scheme::Http, &req).unwrap();
        t.assert_eq("host", &target.host(), &"example.com");
        t.assert_eq("port", &target.port(), &8080u16);
        t.assert_eq("url", &target.url(), &"http://example.com:8080/search?q=rust".to_string());
    }

    #[test]
    fn test_target_default_port() {
        let t = test_report!("Missing port falls back to the scheme default");
        let req = Request::builder()
            .uri("/")
            .header("host", "example.com")
            .body(())
            .unwrap();

        let target = Target::from_request(Scheme::Https, &req).unwrap();
        t.assert_eq("port", &target.port(), &443u16);
        t.assert_eq("url", &target.url(), &"https://example.com/".to_string());
    }

    #[test]
    fn test_target_from_authority() {
        let t = test_report!("HTTP/2 style request without Host uses the authority");
        let req = Request::builder()
            .uri("https://api.example.com/v1")
            .body(())
            .unwrap();

        let target = Target::from_request(Scheme::Https, &req).unwrap();
        t.assert_eq("host", &target.host(), &"api.example.com");
        t.assert_eq("path", &target.path_and_query.as_str(), &"/v1");
    }

    #[test]
    fn test_target_requires_host() {
        let t = test_report!("Request without any host is rejected");
        let req = Request::builder().uri("/").body(()).unwrap();
        t.assert_true("error", Target::from_request(Scheme::Http, &req).is_err());
    }

    #[test]
    fn test_ipv6_host_unbracketed() {
        let t = test_report!("IPv6 literal hosts lose their brackets");
        let req = Request::builder()
            .uri("/")
            .header("host", "[::1]:8443")
            .body(())
            .unwrap();
        let target = Target::from_request(Scheme::Https, &req).unwrap();
        t.assert_eq("host", &target.host(), &"::1");
        t.assert_eq("port", &target.port(), &8443u16);
    }
}
