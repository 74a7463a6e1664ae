mod accept;
mod addr;
mod commands;
mod config;
mod idle;
mod registry;
mod resp;
mod server;
mod ssh;
mod stats;
#[cfg(test)]
mod testutil;
mod tunnel;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::accept::AcceptError;
use crate::addr::Endpoint;
use crate::commands::{BuildInfo, GithubReleases};
use crate::config::Config;
use crate::registry::{TcpBind, TunnelRegistry};
use crate::server::{Server, ServerError};
use crate::ssh::{MetaConfig, RusshConnect};
use crate::stats::{MetricSink, StatsMap};

/// Local daemon multiplexing on-demand SSH port-forward tunnels behind a
/// Redis-style control socket.
#[derive(Parser, Debug)]
#[command(name = "culvert", version, about)]
struct Cli {
    /// Address the control server binds (default 127.0.0.1).
    #[arg(long)]
    addr: Option<String>,

    /// Port the control server binds (default 7070).
    #[arg(long)]
    port: Option<u16>,

    /// Seconds of inactivity before a tunnel shuts down (default 1800).
    #[arg(long)]
    tunnel_idle_timeout: Option<u64>,

    /// Seconds allowed for each control reply write (default 30, 0 disables).
    #[arg(long)]
    write_timeout: Option<u64>,

    /// Seconds allowed for establishing an SSH session (default 30).
    #[arg(long)]
    ssh_dial_timeout: Option<u64>,

    /// Known-hosts file for host key verification (default ~/.ssh/known_hosts).
    #[arg(long)]
    known_hosts_file: Option<PathBuf>,

    /// Optional TOML configuration file supplying defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log at debug level.
    #[arg(long)]
    debug: bool,

    /// Print a launchd property-list skeleton and exit.
    #[arg(long)]
    generate_launchd_plist: bool,
}

fn resolve_config(cli: &Cli) -> Result<Config, String> {
    let mut config = match &cli.config {
        Some(path) => Config::try_load(path)?,
        None => Config::default(),
    };

    if let Some(addr) = &cli.addr {
        config.addr = addr.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(secs) = cli.tunnel_idle_timeout {
        config.tunnel_idle_timeout_secs = secs;
    }
    if let Some(secs) = cli.write_timeout {
        config.write_timeout_secs = secs;
    }
    if let Some(secs) = cli.ssh_dial_timeout {
        config.ssh_dial_timeout_secs = secs;
    }
    if let Some(path) = &cli.known_hosts_file {
        config.known_hosts_file = Some(path.clone());
    }
    if cli.debug {
        config.debug = true;
    }
    Ok(config)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.generate_launchd_plist {
        let program = std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "culvert".to_string());
        print!("{}", config::launchd_plist(&program));
        return;
    }

    let config = match resolve_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("culvert: {e}");
            std::process::exit(2);
        }
    };

    let log_level = if config.debug {
        log::Level::Debug
    } else {
        log::Level::Info
    };
    simple_logger::init_with_level(log_level).unwrap();

    let build = BuildInfo::current();
    log::info!("culvert {} ({})", build.version, build.git_hash);

    let root = CancellationToken::new();

    // Drain reported errors into the log for the daemon's whole lifetime.
    let (err_tx, mut err_rx) = tokio::sync::mpsc::channel(64);
    tokio::spawn(async move {
        while let Some(err) = err_rx.recv().await {
            log::warn!("{err}");
        }
    });

    let stats: Arc<dyn MetricSink> = Arc::new(StatsMap::new());
    let meta = MetaConfig {
        known_hosts_file: config.known_hosts(),
        ssh_dial_timeout: Duration::from_secs(config.ssh_dial_timeout_secs),
    };
    let registry = Arc::new(TunnelRegistry::new(
        meta,
        Arc::new(RusshConnect),
        Arc::new(TcpBind),
        Duration::from_secs(config.tunnel_idle_timeout_secs),
        Some(err_tx.clone()),
        Some(Arc::clone(&stats)),
        root.clone(),
    ));
    let server = Server::new(
        Endpoint::new(&config.addr, config.port),
        Duration::from_secs(config.write_timeout_secs),
        registry,
        build,
        Some(stats),
        Arc::new(GithubReleases),
        Some(err_tx),
    );

    let shutdown = root.clone();
    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        log::info!("shutdown signal received, draining tunnels...");
        shutdown.cancel();
    });

    match server.listen_and_serve(root).await {
        ServerError::Accept(AcceptError::Stopped) => {
            log::info!("culvert shut down");
        }
        err => {
            log::error!("{err}");
            std::process::exit(1);
        }
    }
}
