//! Semiproxy CLI - a semi-transparent HTTP/HTTPS interception proxy

use clap::{Parser, Subcommand};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use semiproxy::{Config, GeneratedCa, Proxy};

#[derive(Parser)]
#[command(name = "semiproxy")]
#[command(about = "A semi transparent HTTP/HTTPS proxy using DNS to capture requests")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the DNS responder and the HTTP/HTTPS listeners
    Run {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// CA certificate (overrides config)
        #[arg(long = "cacert")]
        ca_cert: Option<String>,

        /// CA private key (overrides config)
        #[arg(long = "cakey")]
        ca_key: Option<String>,

        /// Externally reachable hostname
        #[arg(short = 'n', long)]
        hostname: Option<String>,

        /// Externally reachable IPv4 address
        #[arg(short = 'a', long)]
        bind: Option<Ipv4Addr>,

        /// HTTPS server ports
        #[arg(short = 's', long = "https")]
        https: Vec<u16>,

        /// HTTP server ports
        #[arg(short = 'p', long = "http")]
        http: Vec<u16>,

        /// DNS server port
        #[arg(short = 'o', long = "dns")]
        dns: Option<u16>,

        /// Domains which will not be proxied
        #[arg(short = 'd', long)]
        honest: Vec<String>,

        /// Upstream nameserver for honest domains, `ip` or `ip:port`
        #[arg(long)]
        upstream_dns: Option<String>,

        /// HTTP proxy to use for outgoing requests, `host:port`
        #[arg(short = 'x', long = "proxy")]
        upstream_proxy: Option<String>,

        /// Log DNS queries, minted certificates and request URLs
        #[arg(short, long)]
        verbose: bool,

        /// Allow insecure HTTPS connections to origins
        #[arg(short, long)]
        insecure: bool,

        /// Log level (error, warn, info, debug, trace)
        #[arg(short, long)]
        log_level: Option<String>,
    },

    /// Generate a new CA certificate
    GenerateCa {
        /// Output directory
        #[arg(short, long, default_value = ".")]
        out: PathBuf,

        /// Certificate filename
        #[arg(long, default_value = "ca-cert.pem")]
        cert_name: String,

        /// Key filename
        #[arg(long, default_value = "ca-key.pem")]
        key_name: String,
    },

    /// Validate a configuration file
    ValidateConfig {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            ca_cert,
            ca_key,
            hostname,
            bind,
            https,
            http,
            dns,
            honest,
            upstream_dns,
            upstream_proxy,
            verbose,
            insecure,
            log_level,
        } => {
            let mut cfg = match config {
                Some(ref path) => Config::from_file(path)?,
                None => Config::parse("")?,
            };

            if let Some(cert) = ca_cert {
                cfg.identity.ca_cert = cert;
            }
            if let Some(key) = ca_key {
                cfg.identity.ca_key = key;
            }
            if let Some(name) = hostname {
                cfg.identity.hostname = name;
            }
            if let Some(addr) = bind {
                cfg.network.bind = addr;
            }
            if !https.is_empty() {
                cfg.network.https_ports = https;
            }
            if !http.is_empty() {
                cfg.network.http_ports = http;
            }
            if let Some(port) = dns {
                cfg.network.dns_port = port;
            }
            if !honest.is_empty() {
                cfg.network.honest = honest;
            }
            if upstream_dns.is_some() {
                cfg.network.upstream_dns = upstream_dns;
            }
            if upstream_proxy.is_some() {
                cfg.network.upstream_proxy = upstream_proxy;
            }
            if let Some(level) = log_level {
                cfg.logging.level = level;
            }
            cfg.logging.verbose |= verbose;
            cfg.network.insecure |= insecure;
            cfg.validate()?;

            let filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&cfg.logging.level));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();

            std::panic::set_hook(Box::new(|info| {
                tracing::error!(panic = %info, "Uncaught panic");
            }));

            if let Some(ref path) = config {
                tracing::info!(path = %path.display(), "Loaded configuration");
            }

            let proxy = match Proxy::start(&cfg).await {
                Ok(proxy) => proxy,
                Err(e) => {
                    tracing::error!(error = %e, "Initialization failed");
                    std::process::exit(1);
                }
            };

            let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                tracing::info!("Shutting down...");
                let _ = shutdown_tx.send(());
            });

            proxy
                .serve(async move {
                    let _ = shutdown_rx.await;
                })
                .await?;
        }

        Commands::GenerateCa {
            out,
            cert_name,
            key_name,
        } => {
            std::fs::create_dir_all(&out)?;

            let cert_path = out.join(&cert_name);
            let key_path = out.join(&key_name);

            println!("Generating CA certificate...");

            let ca = GeneratedCa::generate()?;
            ca.save(&cert_path, &key_path)?;

            println!("CA certificate generated successfully!");
            println!();
            println!("  Certificate: {}", cert_path.display());
            println!("  Private key: {}", key_path.display());
            println!();
            println!("To use with the proxy:");
            println!(
                "  semiproxy run --cacert {} --cakey {}",
                cert_path.display(),
                key_path.display()
            );
            println!();
            println!("Intercepted clients must trust the certificate, e.g. on Ubuntu/Debian:");
            println!(
                "  sudo cp {} /usr/local/share/ca-certificates/semiproxy.crt",
                cert_path.display()
            );
            println!("  sudo update-ca-certificates");
        }

        Commands::ValidateConfig { config } => {
            println!("Validating configuration: {}", config.display());

            let cfg = Config::from_file(&config)?;

            println!("Configuration is valid!");
            println!();
            println!("  CA cert: {}", cfg.identity.ca_cert);
            println!("  CA key: {}", cfg.identity.ca_key);
            println!("  Hostname: {}", cfg.identity.hostname);
            println!("  Bind address: {}", cfg.network.bind);
            println!("  HTTPS ports: {:?}", cfg.network.https_ports);
            println!("  HTTP ports: {:?}", cfg.network.http_ports);
            println!("  DNS: {}", cfg.dns_listen_addr());
            println!("  Honest domains: {}", cfg.network.honest.join(", "));
            println!("  Upstream DNS: {}", cfg.upstream_dns_addr()?);
            println!("  Upstream timeout: {:?}", cfg.upstream_timeout());
            match cfg.upstream_proxy()? {
                Some(proxy) => println!("  Upstream proxy: {}", proxy),
                None => println!("  Upstream proxy: none"),
            }
            println!(
                "  Origin TLS: {}",
                if cfg.network.insecure {
                    "not verified"
                } else {
                    "verified"
                }
            );
            println!("  Log level: {}", cfg.logging.level);
            println!("  Verbose: {}", cfg.logging.verbose);
        }
    }

    Ok(())
}
