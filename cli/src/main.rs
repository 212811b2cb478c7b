use std::{fs, path::PathBuf, process::ExitCode};

use clap::{Args, Parser, Subcommand};
use clap_num::maybe_hex;
use parse_size::Config;

use dfuse::{DfuDevice, DownloadConfig, find_dfu_devices};
use log::{debug, info};
use detach::*;
use error::CliError;
use list::*;
use status::*;
use write::*;

mod detach;
mod error;
mod list;
mod status;
mod write;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Clone, Copy, Default)]
struct DeviceFilter {
    /// vendor ID (ex: "0483")
    #[clap(short, long, value_parser=hex_u16)]
    vendor: Option<u16>,
    /// product ID (ex: "df11")
    #[clap(short, long, value_parser=hex_u16)]
    product: Option<u16>,
}

#[derive(Subcommand)]
enum Commands {
    /// list DFU devices
    List {
        #[command(flatten)]
        filter: DeviceFilter,
    },
    /// show the status of a device in programming mode
    Status {
        #[command(flatten)]
        filter: DeviceFilter,
    },
    /// ask the application to restart into its bootloader
    Detach {
        #[command(flatten)]
        filter: DeviceFilter,
    },
    /// write a raw binary image to the device
    Write {
        /// binary file to write
        file: PathBuf,
        #[command(flatten)]
        filter: DeviceFilter,
        /// start address (ex: 0x90000000)
        #[clap(short, long, value_parser=maybe_hex::<u32>)]
        address: Option<u32>,
        /// bytes per transfer (ex: 1K, 2048)
        #[clap(short, long, value_parser=parse_chunk_size)]
        chunk_size: Option<u16>,
        /// skip erasing before writing
        #[clap(long)]
        no_erase: bool,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::List {
            filter: DeviceFilter::default(),
        }
    }
}

fn hex_u16(s: &str) -> Result<u16, String> {
    <u16>::from_str_radix(s, 16).map_err(|e| format!("{e}"))
}

/// Transfer sizes are binary: "1K" is 1024 bytes.
fn parse_chunk_size(s: &str) -> Result<u16, String> {
    let len = Config::new()
        .with_binary()
        .parse_size(s)
        .map_err(|e| format!("{e}"))?;
    match u16::try_from(len) {
        Ok(0) => Err("chunk size must not be zero".into()),
        Ok(len) => Ok(len),
        Err(e) => Err(format!("{e}")),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::init();

    if let Err(err) = match &cli.command.unwrap_or_default() {
        Commands::List { filter } => {
            list_dfu_devices(filter.vendor, filter.product)
        }
        Commands::Status { filter } => {
            get_dfu_device(filter).and_then(|device| show_status(&device))
        }
        Commands::Detach { filter } => {
            get_dfu_device(filter).and_then(|device| detach(&device))
        }
        Commands::Write {
            file,
            filter,
            address,
            chunk_size,
            no_erase,
        } => write_file(file, filter, *address, *chunk_size, *no_erase),
    } {
        eprintln!("Error: {err}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn get_dfu_device(filter: &DeviceFilter) -> Result<DfuDevice, CliError> {
    let mut devices = find_dfu_devices(filter.vendor, filter.product)?;
    if devices.len() > 1 {
        return Err(CliError::ManyDfuDevices);
    }
    let device = devices.pop().ok_or(CliError::NoDfuDevice)?;
    info!(
        "Using device {:04x}:{:04x} on bus {}",
        device.vendor_id(),
        device.product_id(),
        device.bus_id()
    );
    Ok(device)
}

/// Without `--address` the image goes to the board's flash base.
fn download_config(
    address: Option<u32>,
    chunk_size: Option<u16>,
    no_erase: bool,
) -> DownloadConfig {
    let mut config = DownloadConfig::default().with_erase_first(!no_erase);
    if let Some(addr) = address {
        config = config.with_start_address(addr);
    }
    if let Some(size) = chunk_size {
        config = config.with_chunk_size(size);
    }
    config
}

fn write_file(
    file: &PathBuf,
    filter: &DeviceFilter,
    address: Option<u32>,
    chunk_size: Option<u16>,
    no_erase: bool,
) -> Result<(), CliError> {
    let device = get_dfu_device(filter)?;
    let data = fs::read(file)?;
    let config = download_config(address, chunk_size, no_erase);
    debug!("{config:?}");
    download(&data, &device, &config)
}
