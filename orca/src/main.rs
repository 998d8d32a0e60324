use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use orca_common::LogLevel;
use orca_core::logging::{init_logging, LogLevelHandle};
use orca_core::{EtcdClient, EtcdTlsOptions, Services};
use orca_protocol_ssh::run_server;
use tracing::*;

#[derive(Parser)]
#[clap(author, version, about = "SSH access gateway", long_about = None)]
struct Cli {
    /// Address to listen on
    #[clap(long, env = "ORCA_BIND", default_value = ":2022")]
    bind: String,

    /// Comma-separated etcd endpoints
    #[clap(
        long,
        env = "ORCA_ETCD_MACHINES",
        default_value = "http://localhost:4001"
    )]
    etcd_machines: String,

    /// PEM client key for etcd TLS
    #[clap(long, env = "ORCA_ETCD_KEY")]
    etcd_key: Option<PathBuf>,

    /// PEM client certificate for etcd TLS
    #[clap(long, env = "ORCA_ETCD_CERT")]
    etcd_cert: Option<PathBuf>,

    /// PEM CA bundle for etcd TLS
    #[clap(long, env = "ORCA_ETCD_CA")]
    etcd_ca: Option<PathBuf>,

    /// Zone this gateway serves
    #[clap(long, env = "ORCA_ZONE", default_value = "intranet")]
    zone: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_levels = init_logging(LogLevel::Info);

    if let Err(error) = run(cli, log_levels).await {
        error!(?error, "Fatal error");
        std::process::exit(1);
    }
}

async fn run(cli: Cli, log_levels: LogLevelHandle) -> Result<()> {
    let machines: Vec<String> = cli
        .etcd_machines
        .split(',')
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .collect();
    let tls = EtcdTlsOptions {
        ca: read_pem(&cli.etcd_ca)?,
        cert: read_pem(&cli.etcd_cert)?,
        key: read_pem(&cli.etcd_key)?,
    };
    let kv = EtcdClient::new(machines, tls).context("setting up the etcd client")?;

    let services = Services::new(kv, cli.zone.clone())
        .await
        .context("bootstrapping zone configuration")?;
    log_levels.apply(services.gateway_snapshot().await.log_level);

    let address = parse_bind(&cli.bind)?;

    tokio::select! {
        result = run_server(services, log_levels, address) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Exiting");
            Ok(())
        }
    }
}

fn read_pem(path: &Option<PathBuf>) -> Result<Option<Vec<u8>>> {
    match path {
        None => Ok(None),
        Some(path) => Ok(Some(
            std::fs::read(path).with_context(|| format!("reading {}", path.display()))?,
        )),
    }
}

/// `:2022` means every interface, like the original env surface.
fn parse_bind(bind: &str) -> Result<SocketAddr> {
    let bind = if bind.starts_with(':') {
        format!("0.0.0.0{bind}")
    } else {
        bind.to_string()
    };
    bind.parse()
        .with_context(|| format!("invalid bind address {bind}"))
}

#[cfg(test)]
mod tests {
    use super::parse_bind;

    #[test]
    fn bind_shorthand() {
        assert_eq!(parse_bind(":2022").unwrap().port(), 2022);
        assert!(parse_bind(":2022").unwrap().ip().is_unspecified());
        assert_eq!(
            parse_bind("127.0.0.1:2200").unwrap(),
            "127.0.0.1:2200".parse().unwrap()
        );
    }
}
