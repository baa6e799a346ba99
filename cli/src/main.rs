use std::{fs, path::PathBuf, process::ExitCode};

use clap::{Args, Parser, Subcommand};
use clap_num::maybe_hex;
use dfufile::*;
use futures::executor::block_on;
use parse_size::parse_size;

use detach::*;
use error::CliError;
use list::*;
use read::*;
use udfu::{DfuDevice, InterfaceSelector, find_dfu_devices};
use write::*;

mod detach;
mod error;
mod list;
mod progress;
mod read;
mod write;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct DeviceArgs {
    /// vendor ID (ex: "0483")
    #[clap(short, long, value_parser=hex_u16)]
    vendor: Option<u16>,
    /// product ID (ex: "df11")
    #[clap(short, long, value_parser=hex_u16)]
    product: Option<u16>,
}

#[derive(Args)]
struct InterfaceArgs {
    /// interface number
    #[clap(short, long)]
    interface: Option<u8>,
    /// alternate setting
    #[clap(short, long)]
    alt: Option<u8>,
    /// interface or memory region name (ex: "Internal Flash")
    #[clap(short, long)]
    name: Option<String>,
}

impl InterfaceArgs {
    fn selector(&self) -> InterfaceSelector {
        match (self.interface, self.alt, &self.name) {
            (_, _, Some(name)) => InterfaceSelector::Name(name.clone()),
            (None, None, None) => InterfaceSelector::First,
            (interface, alt, None) => InterfaceSelector::Setting {
                interface: interface.unwrap_or(0),
                alt_setting: alt.unwrap_or(0),
            },
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// list DFU devices
    List {
        #[command(flatten)]
        device: DeviceArgs,
    },
    /// read from device
    Read {
        /// file to write
        file: PathBuf,
        #[command(flatten)]
        device: DeviceArgs,
        #[command(flatten)]
        interface: InterfaceArgs,
        /// start address on DfuSe devices (ex: 0x08000000)
        #[clap(short, long, value_parser=maybe_hex::<u32>)]
        start_address: Option<u32>,
        /// length (ex: 64K, 2MB)
        #[clap(short, long, value_parser=parse_length)]
        length: Option<u32>,
    },
    /// write to device
    Write {
        /// file to write (raw binary, DFU or DfuSe file)
        file: PathBuf,
        #[command(flatten)]
        device: DeviceArgs,
        #[command(flatten)]
        interface: InterfaceArgs,
        /// start address of raw images on DfuSe devices (ex: 0x08000000)
        #[clap(short, long, value_parser=maybe_hex::<u32>)]
        start_address: Option<u32>,
        /// override the device transfer size (ex: 512, 2K)
        #[clap(long, value_parser=parse_transfer_size)]
        transfer_size: Option<u16>,
        /// download attempts
        #[clap(long, default_value_t = 3)]
        retries: u32,
        /// reset the device once the update is complete
        #[clap(long)]
        reset: bool,
        /// ignore the vendor / product IDs of the file suffix
        #[clap(long)]
        force: bool,
    },
    /// switch a device from runtime to DFU mode
    Detach {
        #[command(flatten)]
        device: DeviceArgs,
    },
    /// inspect DFU file
    Inspect {
        /// DFU file
        file: PathBuf,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::List {
            device: DeviceArgs {
                vendor: None,
                product: None,
            },
        }
    }
}

fn hex_u16(s: &str) -> Result<u16, String> {
    <u16>::from_str_radix(s, 16).map_err(|e| format!("{e}"))
}

fn parse_length(s: &str) -> Result<u32, String> {
    let len = parse_size(s).map_err(|e| format!("{e}"))?;
    len.try_into().map_err(|e| format!("{e}"))
}

fn parse_transfer_size(s: &str) -> Result<u16, String> {
    let len = parse_size(s).map_err(|e| format!("{e}"))?;
    match u16::try_from(len) {
        Ok(0) => Err("transfer size must not be 0".into()),
        Ok(len) => Ok(len),
        Err(e) => Err(format!("{e}")),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::init();

    let result = block_on(async {
        match &cli.command.unwrap_or_default() {
            Commands::List { device } => {
                list_dfu_devices(device.vendor, device.product).await
            }
            Commands::Read {
                file,
                device,
                interface,
                start_address,
                length,
            } => {
                let options = ReadOptions {
                    selector: interface.selector(),
                    start_address: *start_address,
                    length: *length,
                };
                read_file(file, device, &options).await
            }
            Commands::Write {
                file,
                device,
                interface,
                start_address,
                transfer_size,
                retries,
                reset,
                force,
            } => {
                let options = WriteOptions {
                    selector: interface.selector(),
                    start_address: *start_address,
                    transfer_size: *transfer_size,
                    retries: *retries,
                    reset: *reset,
                    force: *force,
                };
                write_file(file, device, &options).await
            }
            Commands::Detach { device } => {
                detach_cmd(device.vendor, device.product).await
            }
            Commands::Inspect { file } => show_dfu_file(file),
        }
    });

    if let Err(err) = result {
        eprintln!("Error: {err}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn get_dfu_device(device: &DeviceArgs) -> Result<DfuDevice, CliError> {
    let mut devices = find_dfu_devices(device.vendor, device.product).await?;
    if devices.len() > 1 {
        return Err(CliError::ManyDFUDevices);
    }
    devices.pop().ok_or(CliError::NoDFUDevice)
}

async fn read_file(
    file: &PathBuf,
    device: &DeviceArgs,
    options: &ReadOptions,
) -> Result<(), CliError> {
    let device = get_dfu_device(device).await?;
    let data = upload(&device, options).await?;
    fs::write(file, &data)?;
    println!("Saved {} bytes to {}", data.len(), file.display());
    Ok(())
}

async fn write_file(
    file: &PathBuf,
    device: &DeviceArgs,
    options: &WriteOptions,
) -> Result<(), CliError> {
    let device = get_dfu_device(device).await?;
    let data = fs::read(file)?;
    download(&data, &device, options).await
}

fn show_dfu_file(file: &PathBuf) -> Result<(), CliError> {
    let data = fs::read(file)?;
    let dfu_file = DfuFile::decode(&data)?;

    match &dfu_file.suffix {
        Some(suffix) => {
            println!(
                "Suffix: ID {:04x}:{:04x}, device {:#06x}, DFU {:#06x}",
                suffix.vendor_id,
                suffix.product_id,
                suffix.device,
                suffix.dfu_version
            );
            match verify_crc(&data) {
                Ok(()) => println!("CRC: {:#010x} (ok)", suffix.crc),
                Err(err) => println!("CRC: {err}"),
            }
        }
        None => println!("No DFU suffix"),
    }

    match &dfu_file.payload {
        Payload::Raw(data) => println!("Raw image: {} bytes", data.len()),
        Payload::Dfuse(targets) => {
            println!("DfuSe image, {} target(s):", targets.len());
            for target in targets {
                println!(
                    "  alt={} name=\"{}\" ({} bytes)",
                    target.alt_setting,
                    target.name.as_deref().unwrap_or(""),
                    target.size()
                );
                for element in &target.elements {
                    println!(
                        "    - 0x{:08x}: {:7} bytes",
                        element.address,
                        element.data.len()
                    );
                }
            }
        }
    }
    Ok(())
}
