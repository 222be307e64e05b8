use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wiretap_core::error::ConfigError;
use wiretap_core::rules::{RewriteRule, unescape};
use wiretap_core::traffic::TracingTrafficLog;
use wiretap_proxy::{ProxyConfig, ProxySupervisor, RouterConfig, UpstreamTransport};

#[derive(Parser)]
#[command(
    name = "wiretap",
    about = "Interactive TCP intercepting proxy for development and debugging",
    version
)]
struct Cli {
    /// Address to listen on
    bind_host: String,
    bind_port: u16,

    /// Upstream transport: tcp or tls
    transport: String,

    /// Upstream endpoint to dial per accepted client
    upstream_host: String,
    upstream_port: u16,

    /// Switch upstreams when a whole server message matches REGEX:
    /// the client moves to HOST:PORT, the original upstream is bridged
    /// to HOST:MSGPORT
    #[arg(
        long = "transfer-connection",
        num_args = 4,
        value_names = ["HOST", "PORT", "MSGPORT", "REGEX"]
    )]
    transfer_connection: Option<Vec<String>>,

    /// Literal search/replace pairs applied to every relayed chunk;
    /// \n, \r, \t and \\ are unescaped
    #[arg(trailing_var_arg = true, value_names = ["SEARCH REPLACE"])]
    rules: Vec<String>,
}

fn parse_port(token: &str) -> Result<u16, ConfigError> {
    token
        .parse()
        .map_err(|_| ConfigError::InvalidPort(token.to_string()))
}

fn build_config(cli: Cli) -> Result<ProxyConfig, ConfigError> {
    let transport: UpstreamTransport = cli.transport.parse()?;

    let router = match cli.transfer_connection {
        Some(tokens) => {
            let [host, port, msg_port, trigger] = &tokens[..] else {
                // clap enforces num_args = 4; this is unreachable in practice.
                return Err(ConfigError::InvalidTrigger("expected 4 values".to_string()));
            };
            Some(RouterConfig {
                target_host: host.clone(),
                primary_port: parse_port(port)?,
                side_port: parse_port(msg_port)?,
                trigger: trigger.clone(),
            })
        }
        None => None,
    };

    if cli.rules.len() % 2 != 0 {
        return Err(ConfigError::DanglingRule(
            cli.rules.last().cloned().unwrap_or_default(),
        ));
    }
    let rules = cli
        .rules
        .chunks(2)
        .map(|pair| RewriteRule::new(unescape(&pair[0]), unescape(&pair[1])))
        .collect();

    Ok(ProxyConfig {
        bind_host: cli.bind_host,
        bind_port: cli.bind_port,
        transport,
        upstream_host: cli.upstream_host,
        upstream_port: cli.upstream_port,
        router,
        rules,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::try_parse().unwrap_or_else(|err| {
        let _ = err.print();
        std::process::exit(1);
    });
    let config = build_config(cli).unwrap_or_else(|err| {
        eprintln!("wiretap: {err}");
        std::process::exit(1);
    });

    let supervisor = ProxySupervisor::bind(config, Arc::new(TracingTrafficLog)).await?;
    info!("listening on {}", supervisor.local_addr()?);
    supervisor.run().await?;
    Ok(())
}
