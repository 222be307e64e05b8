//! Accept loop pairing each client with a freshly dialed upstream and a
//! relay per direction.

use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use regex::Regex;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use wiretap_core::error::ConfigError;
use wiretap_core::rules::RewriteRule;
use wiretap_core::traffic::TrafficLog;

use crate::relay::{Direction, Relay, RelayReader, RelayWriter};
use crate::router::{RouterConfig, StreamRouter, compile_trigger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamTransport {
    Tcp,
    Tls,
}

impl FromStr for UpstreamTransport {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s {
            "tcp" => Ok(UpstreamTransport::Tcp),
            "tls" => Ok(UpstreamTransport::Tls),
            other => Err(ConfigError::UnknownTransport(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub bind_host: String,
    pub bind_port: u16,
    pub transport: UpstreamTransport,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub router: Option<RouterConfig>,
    pub rules: Vec<RewriteRule>,
}

/// The accept loop. Owns the listener; every accepted client gets a fresh
/// upstream connection, a fresh stop token, its own router instance (the
/// switch latch is per pair) and two relays.
pub struct ProxySupervisor {
    config: ProxyConfig,
    listener: TcpListener,
    log: Arc<dyn TrafficLog>,
    trigger: Option<Regex>,
    shutdown: CancellationToken,
}

fn tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

impl ProxySupervisor {
    /// Bind the listener and validate the trigger pattern up front so a bad
    /// configuration fails at startup, not at switch time.
    pub async fn bind(
        config: ProxyConfig,
        log: Arc<dyn TrafficLog>,
    ) -> Result<Self, io::Error> {
        let trigger = match &config.router {
            Some(router) => Some(
                compile_trigger(&router.trigger).map_err(io::Error::other)?,
            ),
            None => None,
        };
        let listener =
            TcpListener::bind((config.bind_host.as_str(), config.bind_port)).await?;
        Ok(Self {
            config,
            listener,
            log,
            trigger,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Dial the upstream and return boxed halves, so plain TCP and TLS
    /// connections relay identically.
    async fn dial_upstream(&self) -> io::Result<(RelayReader, RelayWriter)> {
        let host = self.config.upstream_host.as_str();
        let port = self.config.upstream_port;
        let stream = TcpStream::connect((host, port)).await?;
        match self.config.transport {
            UpstreamTransport::Tcp => {
                let (read_half, write_half) = stream.into_split();
                Ok((Box::new(read_half), Box::new(write_half)))
            }
            UpstreamTransport::Tls => {
                let server_name = ServerName::try_from(host.to_string())
                    .map_err(io::Error::other)?;
                let tls = tls_connector().connect(server_name, stream).await?;
                let (read_half, write_half) = tokio::io::split(tls);
                Ok((Box::new(read_half), Box::new(write_half)))
            }
        }
    }

    pub async fn run(self) -> io::Result<()> {
        let rules = Arc::new(self.config.rules.clone());
        let mut connection_id = 0u64;

        loop {
            let (client, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = self.listener.accept() => accepted?,
            };
            connection_id += 1;
            let label = format!("conn-{connection_id}");
            info!(
                "{label}: accepted {peer}, dialing {}:{}",
                self.config.upstream_host, self.config.upstream_port
            );

            let (upstream_in, upstream_out) = match self.dial_upstream().await {
                Ok(halves) => halves,
                Err(err) => {
                    // The original tool dies here; closing just this client
                    // keeps the listener useful while the upstream flaps.
                    error!("{label}: upstream dial failed: {err}");
                    continue;
                }
            };

            let (client_in, client_out) = client.into_split();
            let stop = CancellationToken::new();
            let router = match (&self.config.router, &self.trigger) {
                (Some(config), Some(trigger)) => Some(Arc::new(StreamRouter::with_trigger(
                    config,
                    trigger.clone(),
                ))),
                _ => None,
            };

            let c2r = Relay::new(
                Box::new(client_in),
                upstream_out,
                Direction::C2R,
                label.clone(),
                self.log.clone(),
                stop.clone(),
                rules.clone(),
                router.clone(),
            );
            let r2c = Relay::new(
                upstream_in,
                Box::new(client_out),
                Direction::R2C,
                label,
                self.log.clone(),
                stop,
                rules.clone(),
                router,
            );
            tokio::spawn(c2r.run());
            tokio::spawn(r2c.run());
        }
    }
}
