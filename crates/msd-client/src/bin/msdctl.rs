// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use msd_client::{
    ActiveDevice, ClientConfig, DEFAULT_SOCKET_NAME, DeviceRequest, DeviceType, MsdClient,
};
use msd_logging::{CliLogLevel, CliLoggingArgs};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "msdctl", about = "Control utility for the mass storage daemon")]
struct Cli {
    /// Abstract socket name of the daemon
    #[arg(long, env = "MSDCTL_SOCKET_NAME", default_value = DEFAULT_SOCKET_NAME, conflicts_with = "socket_path")]
    socket_name: String,

    /// Filesystem socket of the daemon (development setups)
    #[arg(long, env = "MSDCTL_SOCKET_PATH")]
    socket_path: Option<PathBuf>,

    /// Read and write timeout in milliseconds
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,

    /// Print JSON output
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    logging: CliLoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the USB functions linked into the gadget configuration
    GetFunctions,
    /// Replace the exposed devices; no files disables mass storage
    SetMassStorage(SetArgs),
    /// Show the exposed devices
    GetMassStorage,
}

#[derive(Parser, Debug)]
struct SetArgs {
    /// Backing file; repeat for multiple LUNs
    #[arg(short = 'f', long = "file")]
    files: Vec<PathBuf>,

    /// Device type for the file at the same position
    #[arg(short = 't', long = "type", value_enum)]
    types: Vec<DeviceTypeArg>,
}

impl SetArgs {
    fn check_counts(&self) -> Result<()> {
        if self.files.len() != self.types.len() {
            bail!(
                "{} file(s) but {} type(s) given; pass one --type per --file",
                self.files.len(),
                self.types.len()
            );
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, ValueEnum, Eq, PartialEq)]
enum DeviceTypeArg {
    #[value(name = "cdrom")]
    Cdrom,
    #[value(name = "disk-ro")]
    DiskRo,
    #[value(name = "disk-rw")]
    DiskRw,
}

impl From<DeviceTypeArg> for DeviceType {
    fn from(arg: DeviceTypeArg) -> Self {
        match arg {
            DeviceTypeArg::Cdrom => DeviceType::Cdrom,
            DeviceTypeArg::DiskRo => DeviceType::DiskRo,
            DeviceTypeArg::DiskRw => DeviceType::DiskRw,
        }
    }
}

#[derive(Serialize)]
struct FunctionPrint<'a> {
    config: &'a str,
    function: &'a str,
}

#[derive(Serialize)]
struct DevicePrint {
    /// Order among active devices; LUNs without a backing file are not counted.
    position: usize,
    file: String,
    #[serde(rename = "type")]
    device_type: DeviceType,
}

fn main() {
    if let Err(err) = run() {
        let _ = writeln!(io::stderr(), "{err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    cli.logging.clone().init("msdctl", CliLogLevel::Warn)?;

    let timeout = Duration::from_millis(cli.timeout_ms);
    let builder = ClientConfig::builder().read_timeout(timeout).write_timeout(timeout);
    let config = match &cli.socket_path {
        Some(path) => builder.socket_path(path),
        None => builder.socket_name(cli.socket_name.clone()),
    }
    .build();

    if let Command::SetMassStorage(args) = &cli.command {
        args.check_counts()?;
    }

    let mut client = MsdClient::connect(&config)?;

    match cli.command {
        Command::GetFunctions => do_get_functions(&mut client, cli.json)?,
        Command::SetMassStorage(args) => do_set_mass_storage(&mut client, args)?,
        Command::GetMassStorage => do_get_mass_storage(&mut client, cli.json)?,
    }

    Ok(())
}

fn do_get_functions(client: &mut MsdClient, json: bool) -> Result<()> {
    let functions = client.get_functions()?;
    let mut stdout = io::stdout();

    if json {
        let print: Vec<_> = functions
            .iter()
            .map(|(config, function)| FunctionPrint { config, function })
            .collect();
        writeln!(stdout, "{}", serde_json::to_string_pretty(&print)?)?;
    } else {
        for (config, function) in &functions {
            writeln!(stdout, "{config} -> {function}")?;
        }
    }
    Ok(())
}

fn do_set_mass_storage(client: &mut MsdClient, args: SetArgs) -> Result<()> {
    let opened = args
        .files
        .iter()
        .zip(&args.types)
        .map(|(path, ty)| {
            let device_type = DeviceType::from(*ty);
            open_backing_file(path, device_type).map(|file| (file, device_type))
        })
        .collect::<Result<Vec<_>>>()?;

    let devices: Vec<_> = opened
        .iter()
        .map(|(file, device_type)| DeviceRequest {
            fd: file.as_fd(),
            device_type: *device_type,
        })
        .collect();

    client.set_mass_storage(&devices)?;

    if devices.is_empty() {
        writeln!(io::stdout(), "Mass storage disabled")?;
    } else {
        writeln!(io::stdout(), "Exposing {} device(s)", devices.len())?;
    }
    Ok(())
}

fn do_get_mass_storage(client: &mut MsdClient, json: bool) -> Result<()> {
    let devices = client.get_mass_storage()?;
    let mut stdout = io::stdout();

    if json {
        let print: Vec<_> = devices.iter().enumerate().map(device_print).collect();
        writeln!(stdout, "{}", serde_json::to_string_pretty(&print)?)?;
    } else if devices.is_empty() {
        writeln!(stdout, "No mass storage devices active")?;
    } else {
        for (position, device) in devices.iter().enumerate() {
            writeln!(stdout, "#{position}: {} ({})", device.file.display(), device.device_type)?;
        }
    }
    Ok(())
}

fn device_print((position, device): (usize, &ActiveDevice)) -> DevicePrint {
    DevicePrint {
        position,
        file: device.file.display().to_string(),
        device_type: device.device_type,
    }
}

fn open_backing_file(path: &Path, device_type: DeviceType) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(device_type.writable())
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))
}
