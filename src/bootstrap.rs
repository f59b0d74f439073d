//! Ordered startup and the running proxy
//!
//! Stages run strictly one after another: DNS listener, identity material,
//! every HTTPS listener, every HTTP listener. Listeners within one family
//! bind concurrently. The first failure aborts startup with
//! [`Error::Initialization`] naming the stage, and nothing accepts
//! connections until every stage has succeeded.

use futures_util::future::{try_join_all, FutureExt};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::config::Config;
use crate::dns::{DnsPolicy, DnsServer, UdpUpstream, UpstreamResolver};
use crate::error::{Error, Result};
use crate::proxy::{Forwarder, ProxyListener};
use crate::tls::{self, IdentityManager};

/// Every listener bound and the identity subsystem ready, not yet serving
pub struct Proxy<U = UdpUpstream> {
    dns: DnsServer<U>,
    identity: Arc<IdentityManager>,
    https: Vec<ProxyListener>,
    http: Vec<ProxyListener>,
}

impl Proxy<UdpUpstream> {
    /// Start with the configured upstream nameserver and origin TLS policy
    pub async fn start(config: &Config) -> Result<Self> {
        let upstream = UdpUpstream::new(config.upstream_dns_addr()?, config.upstream_timeout());
        tracing::debug!(upstream = %upstream.server(), "Using upstream nameserver");

        let client_tls = tls::client_config(config.network.insecure, &[]);
        let mut forwarder = Forwarder::new(client_tls, config.logging.verbose);
        if let Some(proxy) = config.upstream_proxy()? {
            tracing::debug!(proxy = %proxy, "Forwarding through upstream proxy");
            forwarder = forwarder.with_upstream_proxy(proxy);
        }

        Self::start_with(config, upstream, forwarder).await
    }
}

impl<U: UpstreamResolver> Proxy<U> {
    pub async fn start_with(config: &Config, upstream: U, forwarder: Forwarder) -> Result<Self> {
        let network = &config.network;
        let verbose = config.logging.verbose;

        let policy = Arc::new(DnsPolicy::new(
            network.honest.clone(),
            network.bind,
            verbose,
            upstream,
        ));
        let dns = DnsServer::bind(config.dns_listen_addr(), policy)
            .await
            .map_err(stage("DNS listener"))?;
        tracing::debug!(address = %dns.local_addr()?, "DNS listener bound");

        let identity = IdentityManager::init(&config.identity, verbose)
            .await
            .map_err(stage("identity"))?;
        let identity = Arc::new(identity);

        let forwarder = Arc::new(forwarder);
        let sni = identity.server_options().sni;

        let https = try_join_all(network.https_ports.iter().map(|&port| {
            ProxyListener::bind_https(listen_addr(config, port), sni.clone(), forwarder.clone())
        }))
        .await
        .map_err(stage("HTTPS listeners"))?;

        let http = try_join_all(network.http_ports.iter().map(|&port| {
            ProxyListener::bind_http(listen_addr(config, port), forwarder.clone())
        }))
        .await
        .map_err(stage("HTTP listeners"))?;

        let proxy = Self {
            dns,
            identity,
            https,
            http,
        };
        tracing::info!(
            dns = %proxy.dns_addr()?,
            https = ?proxy.https_addrs(),
            http = ?proxy.http_addrs(),
            "system ready"
        );
        Ok(proxy)
    }

    pub fn dns_addr(&self) -> Result<SocketAddr> {
        self.dns.local_addr()
    }

    pub fn https_addrs(&self) -> Vec<SocketAddr> {
        self.https.iter().map(ProxyListener::local_addr).collect()
    }

    pub fn http_addrs(&self) -> Vec<SocketAddr> {
        self.http.iter().map(ProxyListener::local_addr).collect()
    }

    pub fn identity(&self) -> &Arc<IdentityManager> {
        &self.identity
    }

    /// Serve DNS and every listener until `shutdown` resolves
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let shutdown = shutdown.boxed().shared();

        let mut tasks = vec![tokio::spawn(self.dns.serve(shutdown.clone()))];
        for listener in self.https.into_iter().chain(self.http) {
            tasks.push(tokio::spawn(listener.serve(shutdown.clone())));
        }

        for result in try_join_all(tasks)
            .await
            .map_err(|e| Error::proxy(format!("Listener task failed: {}", e)))?
        {
            result?;
        }

        tracing::info!("All listeners stopped");
        Ok(())
    }
}

fn listen_addr(config: &Config, port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(config.network.bind), port)
}

/// Label a startup failure with the stage it happened in
fn stage(name: &'static str) -> impl Fn(Error) -> Error {
    move |e| match e {
        Error::Initialization(msg) => Error::initialization(format!("{}: {}", name, msg)),
        other => Error::initialization(format!("{}: {}", name, other)),
    }
}
