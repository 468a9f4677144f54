// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use msd_daemon::configfs::KernelConfigFs;
use msd_daemon::{
    AuthorizationGate, DaemonConfig, DaemonContext, DaemonServer, DisabledGate, Gadget,
    SelinuxGate,
};
use msd_logging::{CliLogLevel, CliLoggingArgs};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "USB mass storage gadget daemon", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "MSDD_CONFIG")]
    config: Option<PathBuf>,

    /// Abstract socket name to listen on
    #[arg(long, conflicts_with = "socket_path")]
    socket_name: Option<String>,

    /// Listen on a filesystem socket instead of the abstract namespace
    #[arg(long)]
    socket_path: Option<PathBuf>,

    /// configfs directory of the USB gadget
    #[arg(long)]
    gadget_root: Option<PathBuf>,

    /// USB device controller to bind the gadget to
    #[arg(long)]
    udc: Option<String>,

    /// Accept connections without verifying SELinux (development hosts only)
    #[arg(long)]
    disable_selinux: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,

    #[command(flatten)]
    logging: CliLoggingArgs,
}

impl Args {
    fn apply_overrides(&self, config: &mut DaemonConfig) {
        if let Some(name) = &self.socket_name {
            config.socket.name = name.clone();
            config.socket.path = None;
        }
        if let Some(path) = &self.socket_path {
            config.socket.path = Some(path.clone());
        }
        if let Some(root) = &self.gadget_root {
            config.gadget.root = root.clone();
        }
        if let Some(udc) = &self.udc {
            config.gadget.udc = Some(udc.clone());
        }
        if self.disable_selinux {
            config.selinux.enforce = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = DaemonConfig::load(args.config.as_deref())?;
    args.apply_overrides(&mut config);
    config.validate()?;

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    args.logging.clone().init("msd-daemon", CliLogLevel::Info)?;

    let span = tracing::info_span!("daemon", component = "msdd");
    let _enter = span.enter();

    info!(operation = "start_daemon", socket = %config.socket.location(), gadget_root = %config.gadget.root.display(), "Starting mass storage daemon");

    if let Err(e) = run(config).await {
        error!(operation = "start_daemon", error = %format!("{e:#}"), "Daemon failed");
        return Err(e);
    }
    Ok(())
}

async fn run(config: DaemonConfig) -> Result<()> {
    let fs = KernelConfigFs::open(&config.gadget.root, config.gadget.verify_fs_magic)
        .with_context(|| format!("Failed to open gadget: {}", config.gadget.root.display()))?;
    let gadget = Gadget::new(Box::new(fs), config.gadget.clone());
    if let Err(e) = gadget.cleanup_stale_staging() {
        warn!(operation = "cleanup", error = %format!("{e:#}"), "Failed to remove stale staging functions");
    }

    let location = config.socket.location();
    let gate: Box<dyn AuthorizationGate> = if config.selinux.enforce {
        Box::new(SelinuxGate::new(
            &config.selinux,
            config.gadget.verify_fs_magic,
            location.clone(),
        ))
    } else {
        warn!(operation = "start_daemon", "SELinux checks disabled by configuration");
        Box::new(DisabledGate)
    };

    let context = Arc::new(DaemonContext::new(gadget, gate));
    let mut server = DaemonServer::new(location, context)?;

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "Server error");
                return Err(e);
            }
        }
        _ = sigint.recv() => {
            info!(operation = "shutdown", signal = "SIGINT", "Received SIGINT, shutting down");
            server.shutdown().await?;
        }
        _ = sigterm.recv() => {
            info!(operation = "shutdown", signal = "SIGTERM", "Received SIGTERM, shutting down");
            server.shutdown().await?;
        }
    }

    Ok(())
}
