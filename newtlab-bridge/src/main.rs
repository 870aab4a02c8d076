//! newtlab-bridge - standalone dataplane bridge worker process (C6).
//!
//! Spawned by the orchestrator, one process per worker host, and left
//! running independently of the orchestrator's own lifetime. Reads its link
//! table from a `BridgeConfig` JSON file, splices bytes between each link's
//! two TCP sockets, and serves live counters over a Unix socket (always) and
//! a TCP port (when running on a remote host).

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use newtlab_core::bridge::{self, BridgeConfig, RunningBridgeHandle};

#[derive(Parser)]
#[command(name = "newtlab-bridge", disable_version_flag = true)]
struct Args {
    /// Path to the BridgeConfig JSON document.
    #[arg(long)]
    config: PathBuf,

    /// Where to write this process's PID.
    #[arg(long)]
    pidfile: PathBuf,

    /// Unix socket path the stats endpoint listens on.
    #[arg(long)]
    sock: PathBuf,
}

/// `--version` is handled separately from clap's own flag so the output is
/// a bare semver string: `Transport::ensure_worker_binary` compares it
/// directly against the locally built version, with no binary name prefix.
fn print_version_and_exit_if_requested() {
    if std::env::args().any(|a| a == "--version") {
        println!("{}", env!("CARGO_PKG_VERSION"));
        std::process::exit(0);
    }
}

#[tokio::main]
async fn main() {
    print_version_and_exit_if_requested();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(
            "newtlab_bridge=info".parse().expect("static directive"),
        ))
        .init();

    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!(error = %e, "newtlab-bridge exiting with error");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let body = std::fs::read_to_string(&args.config)?;
    let config: BridgeConfig = serde_json::from_str(&body)?;
    let link_count = config.links.len();
    let stats_addr = config.stats_addr.clone();

    info!(links = link_count, config = %args.config.display(), "starting bridge");
    let running = bridge::start(config).await?;

    bridge::write_pid_file(&args.pidfile)?;

    let handle = Arc::new(RunningBridgeHandle::new(&running));

    let unix_handle = handle.clone();
    let sock_path = args.sock.clone();
    let unix_task = tokio::spawn(async move {
        if let Err(e) = bridge::serve_stats_unix(&sock_path, unix_handle).await {
            error!(error = %e, "unix stats server exited");
        }
    });

    let tcp_task = if !stats_addr.is_empty() {
        let tcp_handle = handle.clone();
        info!(addr = %stats_addr, "serving stats over tcp");
        Some(tokio::spawn(async move {
            if let Err(e) = bridge::serve_stats_tcp(&stats_addr, tcp_handle).await {
                error!(error = %e, "tcp stats server exited");
            }
        }))
    } else {
        None
    };

    wait_for_shutdown_signal().await;
    info!("received shutdown signal, draining links");

    running.shutdown().await;
    unix_task.abort();
    if let Some(task) = tcp_task {
        task.abort();
    }

    Ok(())
}

async fn wait_for_shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}
