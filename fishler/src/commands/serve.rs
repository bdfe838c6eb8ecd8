use std::net::ToSocketAddrs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use fishler_core::Services;
use fishler_protocol_ssh::SshProtocolServer;
use tokio::signal::unix::{signal, SignalKind};
use tracing::*;

use crate::config::load_config;
use crate::logging::init_logging;
use crate::Cli;

#[derive(Args, Default)]
pub struct ServeArgs {
    /// The IP to listen on for SSH connections.
    #[arg(long)]
    pub ip: Option<String>,

    /// The port to listen on for SSH connections.
    #[arg(long)]
    pub port: Option<u16>,

    /// The version banner the SSH server advertises.
    #[arg(long)]
    pub banner: Option<String>,

    /// If non-zero, sleep at most this many seconds before allowing
    /// authentication to continue.
    #[arg(long)]
    pub random_sleep_count: Option<u64>,

    /// The amount of memory (in MB) each sandbox gets.
    #[arg(long)]
    pub docker_memory_limit: Option<i64>,

    /// The amount of disk space (in MB) each session may write.
    #[arg(long)]
    pub docker_disk_limit: Option<u64>,

    /// Terminate a session after this much idle time (e.g. "5m"); 0 disables.
    #[arg(long)]
    pub ssh_idle_timeout: Option<String>,

    /// Terminate a session after this much total time (e.g. "1h"); 0 disables.
    #[arg(long)]
    pub ssh_max_timeout: Option<String>,

    /// Directory holding id_rsa / id_rsa.pub for the SSH server.
    #[arg(long)]
    pub crypto_basepath: Option<PathBuf>,

    /// The hostname used inside the sandbox.
    #[arg(long)]
    pub docker_hostname: Option<String>,

    /// The sandbox image reference.
    #[arg(long)]
    pub docker_imagename: Option<String>,

    /// Telemetry endpoint (host:port); unset disables the uplink.
    #[arg(long)]
    pub uplink_server_address: Option<String>,

    /// Extra bind mount in docker -v syntax; repeatable.
    #[arg(long = "volumn", short = 'v')]
    pub volumn: Vec<String>,

    /// Exclusive: CSV file of valid user,password rows.
    #[arg(long)]
    pub account_file: Option<String>,

    /// Exclusive: file with one valid password (for any account) per line.
    #[arg(long)]
    pub password_file: Option<String>,

    /// Exclusive: a single valid user,password account.
    #[arg(long)]
    pub account: Option<String>,

    /// Exclusive: a single password valid for any account.
    #[arg(long)]
    pub password: Option<String>,

    /// Exclusive: any username/password combination authenticates.
    #[arg(long)]
    pub any_account: bool,

    /// Exclusive: no username/password combination ever authenticates.
    #[arg(long)]
    pub no_account: bool,
}

pub async fn command(cli: &Cli, args: &ServeArgs) -> Result<()> {
    let config = load_config(cli, args)?;
    init_logging(&config)?;

    let version = env!("CARGO_PKG_VERSION");
    info!(%version, "Fishler");

    let address = config
        .listen_address()
        .to_socket_addrs()
        .context("resolving listen address")?
        .next()
        .context("listen address resolves to nothing")?;

    let services = Services::new(config).await?;

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        result = SshProtocolServer::new(&services).run(address) => {
            result?;
        }
        _ = sigint.recv() => {
            info!("SIGINT received");
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received");
        }
    }

    services.shutdown().await;
    info!("Exiting");
    Ok(())
}
