//! Shared infrastructure for integration tests.
#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use hyper::body::Incoming;
use hyper::http::uri::Authority;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ServerConfig};
use semiproxy::error::{Error, Result};
use semiproxy::tls::{mint_certificate, CertificateAuthority, GeneratedCa, IdentityManager};
use semiproxy::{Config, Forwarder, Proxy, UpstreamResolver};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing_subscriber::EnvFilter;

pub const PROXY_HOSTNAME: &str = "proxy.lan";

// ---------------------------------------------------------------------------
// TestCa
// ---------------------------------------------------------------------------

/// A throwaway CA saved into a tempdir
pub struct TestCa {
    pub ca: CertificateAuthority,
    pub cert_der: CertificateDer<'static>,
    pub dir: TempDir,
    pub cert_path: String,
    pub key_path: String,
}

impl TestCa {
    pub fn generate() -> Self {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let generated = GeneratedCa::generate().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("ca-cert.pem");
        let key_path = dir.path().join("ca-key.pem");
        generated.save(&cert_path, &key_path).unwrap();

        let ca = CertificateAuthority::from_files(&cert_path, &key_path).unwrap();
        let cert_der = ca.cert_der().clone();

        Self {
            ca,
            cert_der,
            cert_path: cert_path.to_str().unwrap().to_string(),
            key_path: key_path.to_str().unwrap().to_string(),
            dir,
        }
    }

    /// Client config trusting only this CA, offering h2 and http/1.1
    pub fn client_tls_config(&self) -> Arc<ClientConfig> {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(self.cert_der.clone()).unwrap();
        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Arc::new(config)
    }

    /// Same as [`Self::client_tls_config`] but never sends SNI
    pub fn client_tls_config_without_sni(&self) -> Arc<ClientConfig> {
        let mut config = (*self.client_tls_config()).clone();
        config.enable_sni = false;
        Arc::new(config)
    }

    /// Server config for an origin named `hostname`, signed by this CA
    pub fn origin_tls_config(&self, hostname: &str, alpn: &[&[u8]]) -> Arc<ServerConfig> {
        let leaf = mint_certificate(&self.ca, hostname).unwrap();
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                vec![leaf.der().clone(), self.cert_der.clone()],
                self.ca.leaf_key_der(),
            )
            .unwrap();
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        Arc::new(config)
    }

    /// A config pointing at this CA with every listener on an ephemeral port
    pub fn proxy_config(&self) -> Config {
        let mut config = Config::default();
        config.identity.ca_cert = self.cert_path.clone();
        config.identity.ca_key = self.key_path.clone();
        config.identity.hostname = PROXY_HOSTNAME.to_string();
        config.network.bind = Ipv4Addr::LOCALHOST;
        config.network.dns_port = 0;
        config.network.https_ports = vec![0];
        config.network.http_ports = vec![0];
        config.network.honest = vec!["local".to_string()];
        config
    }
}

// ---------------------------------------------------------------------------
// MockUpstream
// ---------------------------------------------------------------------------

/// Canned upstream resolver. Lookups without a canned answer fail.
#[derive(Clone, Default)]
pub struct MockUpstream {
    records: Arc<HashMap<(String, RecordType), Vec<RData>>>,
    lookups: Arc<Mutex<Vec<(String, RecordType)>>>,
}

impl MockUpstream {
    pub fn with_records(records: Vec<(&str, RecordType, Vec<RData>)>) -> Self {
        let records = records
            .into_iter()
            .map(|(name, record_type, data)| ((name.to_string(), record_type), data))
            .collect();
        Self {
            records: Arc::new(records),
            lookups: Arc::default(),
        }
    }

    pub fn lookups(&self) -> Vec<(String, RecordType)> {
        self.lookups.lock().unwrap().clone()
    }
}

impl UpstreamResolver for MockUpstream {
    async fn resolve(&self, name: &str, record_type: RecordType) -> Result<Vec<RData>> {
        self.lookups
            .lock()
            .unwrap()
            .push((name.to_string(), record_type));
        self.records
            .get(&(name.to_string(), record_type))
            .cloned()
            .ok_or_else(|| Error::upstream(format!("no canned answer for {}", name)))
    }
}

// ---------------------------------------------------------------------------
// TestProxy
// ---------------------------------------------------------------------------

/// A fully started proxy serving in the background
pub struct TestProxy {
    pub dns_addr: SocketAddr,
    pub https_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub identity: Arc<IdentityManager>,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestProxy {
    pub async fn start(config: &Config, upstream: MockUpstream, forwarder: Forwarder) -> Self {
        let proxy = Proxy::start_with(config, upstream, forwarder).await.unwrap();

        let dns_addr = proxy.dns_addr().unwrap();
        let https_addr = proxy.https_addrs()[0];
        let http_addr = proxy.http_addrs()[0];
        let identity = proxy.identity().clone();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(proxy.serve(async move {
            let _ = shutdown_rx.await;
        }));

        Self {
            dns_addr,
            https_addr,
            http_addr,
            identity,
            shutdown_tx,
        }
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Forwarder that trusts `ca` for origin TLS and connects to `origin`
/// whatever host a request names
pub fn forwarder_to(ca: &TestCa, origin: SocketAddr) -> Forwarder {
    let client = semiproxy::tls::client_config(false, &[ca.cert_der.clone()]);
    Forwarder::new(client, true).with_connect_override(origin)
}

// ---------------------------------------------------------------------------
// TestOrigin
// ---------------------------------------------------------------------------

/// An origin server answering every request with
/// `"<method> <path> host=<host> via=<version>"`
pub struct TestOrigin {
    pub addr: SocketAddr,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestOrigin {
    pub async fn http() -> Self {
        Self::start(None).await
    }

    pub async fn https(ca: &TestCa, hostname: &str, alpn: &[&[u8]]) -> Self {
        Self::start(Some(TlsAcceptor::from(ca.origin_tls_config(hostname, alpn)))).await
    }

    async fn start(tls: Option<TlsAcceptor>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    result = listener.accept() => {
                        let Ok((stream, _)) = result else { continue };
                        let tls = tls.clone();
                        tokio::spawn(async move {
                            match tls {
                                Some(acceptor) => {
                                    if let Ok(stream) = acceptor.accept(stream).await {
                                        serve_origin(stream).await;
                                    }
                                }
                                None => serve_origin(stream).await,
                            }
                        });
                    }
                }
            }
        });

        Self { addr, shutdown_tx }
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn serve_origin<S>(stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(|req: Request<Incoming>| async move {
        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().authority().map(|a| a.to_string()))
            .unwrap_or_default();
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_default();
        let body = format!(
            "{} {} host={} via={:?}",
            req.method(),
            path,
            host,
            req.version()
        );
        Ok::<_, hyper::Error>(Response::new(
            Full::new(Bytes::from(body)).map_err(|e| -> hyper::Error { match e {} }).boxed(),
        ))
    });

    let _ = auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(stream), service)
        .await;
}

// ---------------------------------------------------------------------------
// StubProxy
// ---------------------------------------------------------------------------

/// A forward proxy that records the request line of every connection and
/// relays it to one fixed origin, whatever destination the request names.
/// Without an origin it answers everything with 403.
pub struct StubProxy {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl StubProxy {
    pub async fn start(origin: SocketAddr) -> Self {
        Self::spawn(Some(origin)).await
    }

    pub async fn refusing() -> Self {
        Self::spawn(None).await
    }

    async fn spawn(origin: Option<SocketAddr>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let recorded = requests.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    result = listener.accept() => {
                        let Ok((stream, _)) = result else { continue };
                        tokio::spawn(relay(stream, origin, recorded.clone()));
                    }
                }
            }
        });

        Self {
            addr,
            requests,
            shutdown_tx,
        }
    }

    pub fn authority(&self) -> Authority {
        self.addr.to_string().parse().unwrap()
    }

    /// First line of each request received, in arrival order
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn relay(
    mut client: TcpStream,
    origin: Option<SocketAddr>,
    requests: Arc<Mutex<Vec<String>>>,
) {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = head.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        match client.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    };

    let request_line = String::from_utf8_lossy(&head)
        .lines()
        .next()
        .unwrap_or_default()
        .to_string();
    requests.lock().unwrap().push(request_line.clone());

    let Some(origin) = origin else {
        let _ = client
            .write_all(b"HTTP/1.1 403 Forbidden\r\ncontent-length: 0\r\n\r\n")
            .await;
        return;
    };
    let Ok(mut upstream) = TcpStream::connect(origin).await else {
        return;
    };

    let forwarded = if request_line.starts_with("CONNECT ") {
        if client
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await
            .is_err()
        {
            return;
        }
        &head[head_end..]
    } else {
        &head[..]
    };
    if upstream.write_all(forwarded).await.is_err() {
        return;
    }
    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
}

// ---------------------------------------------------------------------------
// LogCapture
// ---------------------------------------------------------------------------

/// Collects formatted tracing output emitted on the current thread while
/// alive. Tasks spawned on a current-thread runtime are covered too.
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    _guard: tracing::subscriber::DefaultGuard,
}

impl LogCapture {
    pub fn new(level: &str) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(level))
            .with_writer(move || CaptureWriter(sink.clone()))
            .with_ansi(false)
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        Self {
            buffer,
            _guard: guard,
        }
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).to_string()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.contents().contains(needle)
    }
}

struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Clients
// ---------------------------------------------------------------------------

/// TLS connection to `addr`, sending `sni` as server name
pub async fn tls_connect(
    addr: SocketAddr,
    config: Arc<ClientConfig>,
    sni: &str,
) -> std::io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr).await?;
    let server_name = ServerName::try_from(sni.to_string()).unwrap();
    TlsConnector::from(config).connect(server_name, tcp).await
}

/// DER of the leaf certificate the server presented
pub fn presented_leaf(tls: &tokio_rustls::client::TlsStream<TcpStream>) -> CertificateDer<'static> {
    tls.get_ref().1.peer_certificates().unwrap()[0].clone().into_owned()
}

/// Send one HTTP/1.1 GET over `io` and return status and body
pub async fn http1_get<IO>(io: IO, host: &str, path: &str) -> (StatusCode, String)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .unwrap();
    tokio::spawn(conn);

    let req = Request::builder()
        .uri(path)
        .header(hyper::header::HOST, host)
        .body(Empty::<Bytes>::new())
        .unwrap();
    let resp = sender.send_request(req).await.unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).to_string())
}

/// Send one HTTP/2 GET for `url` over `io` and return status and body
pub async fn http2_get<IO>(io: IO, url: &str) -> (StatusCode, String)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) =
        hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(io))
            .await
            .unwrap();
    tokio::spawn(conn);

    let req = Request::builder()
        .uri(url)
        .body(Empty::<Bytes>::new())
        .unwrap();
    let resp = sender.send_request(req).await.unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).to_string())
}

/// Send a single DNS question to `server` and wait for the reply
pub async fn dns_query(server: SocketAddr, name: &str, record_type: RecordType) -> Message {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut request = Message::new();
    request
        .set_id(7)
        .set_recursion_desired(true)
        .add_query(Query::query(Name::from_ascii(name).unwrap(), record_type));
    socket
        .send_to(&request.to_vec().unwrap(), server)
        .await
        .unwrap();

    let mut buf = vec![0u8; 4096];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("DNS reply timed out")
        .unwrap();
    Message::from_vec(&buf[..len]).unwrap()
}
