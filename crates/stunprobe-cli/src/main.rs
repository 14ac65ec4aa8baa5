//! stunprobe CLI
//!
//! Classic STUN NAT discovery: run the classifier against a server, or run
//! the binding responder and shared-secret service.

mod config;

use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use config::{Config, split_host_port};
use stunprobe_discovery::tls::server_acceptor;
use stunprobe_discovery::{
    BindingResponder, DiscoveryInfo, IntegrityVerifier, ProbeConfig, ResponderConfig,
    SharedSecret, SharedSecretServer, StunClient, StunServerAddress, TlsChannelFactory,
};

/// stunprobe - classic STUN NAT discovery
#[derive(Parser)]
#[command(name = "stunprobe")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Turn debug logging on
    #[arg(short, long)]
    debug: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify the NAT between this host and a STUN server
    Client {
        /// STUN server to query; the domain when --dns is given
        #[arg(short, long)]
        server: Option<String>,

        /// STUN server port
        #[arg(short, long)]
        port: Option<u16>,

        /// Discover servers through this DNS server
        #[arg(long)]
        dns: Option<IpAddr>,

        /// Trusted roots (PEM); when set a shared secret is requested first
        #[arg(long)]
        ca: Option<PathBuf>,

        /// Port of the shared-secret service
        #[arg(long)]
        tls_port: Option<u16>,

        /// Sign probes with the shared secret
        #[arg(long)]
        sign: bool,

        /// Explain the detected scenario
        #[arg(long)]
        detailed: bool,
    },

    /// Run the binding responder, and the shared-secret service when TLS
    /// material is configured
    Server {
        /// Services address
        #[arg(long)]
        address: Option<IpAddr>,

        /// Services port
        #[arg(short, long)]
        port: Option<u16>,

        /// STUN server (host:port) used to learn our public address
        #[arg(long)]
        public_address_server: Option<String>,

        /// Alternate responder address
        #[arg(long)]
        alternate_address: Option<IpAddr>,

        /// Alternate responder port
        #[arg(long)]
        alternate_port: Option<u16>,

        /// Remote shared-secret server (host:port) that verifies integrity
        #[arg(long)]
        remote_server: Option<String>,

        /// Server certificate chain (PEM)
        #[arg(long)]
        cert: Option<PathBuf>,

        /// Server private key (PEM)
        #[arg(long)]
        key: Option<PathBuf>,

        /// Trusted roots (PEM) for the remote shared-secret server
        #[arg(long)]
        ca: Option<PathBuf>,
    },

    /// Run a responder that acts as the alternate peer of another server
    Forwarder {
        /// Bind address
        #[arg(short, long)]
        bind: SocketAddr,

        /// Public IP advertised in responses
        #[arg(long)]
        public_address: Option<IpAddr>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    let level = if cli.debug {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(level).init();

    match cli.command {
        Commands::Client {
            server,
            port,
            dns,
            ca,
            tls_port,
            sign,
            detailed,
        } => {
            if let Some(server) = server {
                config.client.server = server;
            }
            if let Some(port) = port {
                config.client.port = port;
            }
            if let Some(dns) = dns {
                config.discovery.dns_server = Some(dns.to_string());
            }
            if ca.is_some() {
                config.tls.ca = ca;
            }
            if let Some(tls_port) = tls_port {
                config.client.tls_port = tls_port;
            }
            config.client.sign_requests |= sign;
            config.validate()?;

            run_client(&config, detailed).await?;
        }
        Commands::Server {
            address,
            port,
            public_address_server,
            alternate_address,
            alternate_port,
            remote_server,
            cert,
            key,
            ca,
        } => {
            if let Some(address) = address {
                config.server.address = address.to_string();
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if public_address_server.is_some() {
                config.server.public_address_server = public_address_server;
            }
            if let Some(alternate) = alternate_address {
                config.server.alternate_address = Some(alternate.to_string());
            }
            if let Some(alternate_port) = alternate_port {
                config.server.alternate_port = alternate_port;
            }
            if remote_server.is_some() {
                config.server.remote_secret_server = remote_server;
            }
            if cert.is_some() {
                config.tls.cert = cert;
            }
            if key.is_some() {
                config.tls.key = key;
            }
            if ca.is_some() {
                config.tls.ca = ca;
            }
            config.validate()?;

            run_server(&config).await?;
        }
        Commands::Forwarder {
            bind,
            public_address,
        } => {
            config.validate()?;
            run_forwarder(bind, public_address).await?;
        }
    }

    Ok(())
}

/// Classify against every configured or discovered server
async fn run_client(config: &Config, detailed: bool) -> anyhow::Result<()> {
    let servers = match &config.discovery.dns_server {
        Some(dns) => {
            let dns: IpAddr = dns.parse()?;
            let found = StunClient::discover_servers(&config.client.server, dns).await;
            if found.is_empty() {
                anyhow::bail!("No STUN servers found for {}", config.client.server);
            }
            found
        }
        None => vec![StunServerAddress {
            host: config.client.server.clone(),
            port: config.client.port,
            priority: 0,
            weight: 0,
        }],
    };

    let channel = config
        .tls
        .ca
        .as_deref()
        .map(TlsChannelFactory::from_root_pem)
        .transpose()?;

    let probe_config = ProbeConfig {
        local_bind: config.local_bind()?,
        sign_requests: config.client.sign_requests,
        tls_port: config.client.tls_port,
        ..ProbeConfig::default()
    };

    for server in servers {
        println!("STUN server: {server}");
        let client = StunClient::with_config(server.host.clone(), server.port, probe_config.clone());

        let secret = match &channel {
            Some(channel) => obtain_secret(&client, channel).await,
            None => None,
        };

        let info = client.bind(secret.as_ref()).await;
        print_info(&info, detailed);
    }

    Ok(())
}

async fn obtain_secret(client: &StunClient, channel: &TlsChannelFactory) -> Option<SharedSecret> {
    match client.request_shared_secret(channel).await {
        Ok(secret) => {
            println!("Shared secret: username {}", secret.username());
            Some(secret)
        }
        Err(e) => {
            println!("The client tried to obtain a shared secret from the server but failed:");
            println!("- {e}");
            println!("The client will continue without a shared secret");
            None
        }
    }
}

fn print_info(info: &DiscoveryInfo, detailed: bool) {
    println!("Last test was: {}", info.last_test());
    if detailed {
        println!("{}", info.to_string_detailed());
    } else {
        println!("{info}");
    }
}

/// Run the responder (and shared-secret service) until interrupted
async fn run_server(config: &Config) -> anyhow::Result<()> {
    let service_addr = config.service_addr()?;

    let secret_server = match (&config.tls.cert, &config.tls.key) {
        (Some(cert), Some(key)) => {
            let acceptor = server_acceptor(cert, key)?;
            Some(SharedSecretServer::start(service_addr, acceptor).await?)
        }
        _ => None,
    };

    let public_address = match &config.server.public_address_server {
        Some(server) => {
            let (host, port) = split_host_port(server)?;
            let info = StunClient::new(host, port).bind_remote_address_only(None).await;
            if info.error_code() != 0 {
                println!("{info}");
                anyhow::bail!("Public address discovery failed");
            }
            info.public_ip()
        }
        None => None,
    };

    let verifier = match (&config.server.remote_secret_server, &secret_server) {
        (Some(remote), _) => remote_verifier(config, remote).await?,
        (None, Some(server)) => IntegrityVerifier::Local(server.registry()),
        (None, None) => IntegrityVerifier::None,
    };

    let responder = BindingResponder::start_with_config(
        service_addr,
        ResponderConfig {
            public_address,
            alternate: config.alternate_endpoint()?,
            verifier,
            ..ResponderConfig::default()
        },
    )
    .await?;

    println!("Binding responder on {}", responder.local_addr());
    if let Some(server) = &secret_server {
        println!("Shared secret service on {}", server.local_addr());
    }

    wait_for_shutdown(|| {
        responder.is_running() && secret_server.as_ref().is_none_or(SharedSecretServer::is_running)
    })
    .await;

    responder.stop();
    if let Some(server) = &secret_server {
        server.stop();
    }
    Ok(())
}

async fn remote_verifier(config: &Config, remote: &str) -> anyhow::Result<IntegrityVerifier> {
    let Some(ca) = &config.tls.ca else {
        anyhow::bail!("A remote shared secret server needs trusted roots (--ca)");
    };
    let (host, port) = split_host_port(remote)?;
    let addr = tokio::net::lookup_host((host.as_str(), port))
        .await?
        .next()
        .ok_or_else(|| anyhow::anyhow!("Cannot resolve {}", remote))?;

    Ok(IntegrityVerifier::Remote {
        addr,
        server_name: config.tls.server_name.clone().unwrap_or(host),
        channel: TlsChannelFactory::from_root_pem(ca)?,
    })
}

/// Run an alternate-peer responder until interrupted
async fn run_forwarder(bind: SocketAddr, public_address: Option<IpAddr>) -> anyhow::Result<()> {
    let responder = BindingResponder::start_with_config(
        bind,
        ResponderConfig {
            public_address,
            ..ResponderConfig::default()
        },
    )
    .await?;
    println!("Forwarder on {}", responder.local_addr());

    wait_for_shutdown(|| responder.is_running()).await;
    responder.stop();
    Ok(())
}

/// Block until Ctrl+C or until `alive` reports a service has died
async fn wait_for_shutdown(alive: impl Fn() -> bool) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    loop {
        tokio::select! {
            _ = &mut interrupted => {
                tracing::info!("Interrupted, shutting down");
                return;
            }
            _ = ticker.tick() => {
                if !alive() {
                    tracing::warn!("A service stopped unexpectedly");
                    return;
                }
            }
        }
    }
}
