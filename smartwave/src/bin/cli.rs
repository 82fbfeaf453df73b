//! Command-line interface for SmartWave devices.
//!
//! Connects to the device named with `--port` (or the first one found),
//! runs one command and disconnects.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use smartwave::i2c::I2cOptions;
use smartwave::tracing::{self, prelude::*};
use smartwave::transport::candidate_ports;
use smartwave::{
    Bitstream, Config, Connection, FirmwareImage, Gpio, GpioOptions, OutputType, PinId,
    UpdateProgress,
};

#[derive(Parser)]
#[command(name = "smartwave-cli", version, about = "Talk to a SmartWave device")]
struct Cli {
    /// Serial port of the device; the first SmartWave found when omitted
    #[arg(short, long, global = true)]
    port: Option<String>,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Deadline for transfers, in milliseconds
    #[arg(long, global = true, default_value_t = 1000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List serial ports with SmartWave USB ids
    List,
    /// Print hardware, firmware and bitstream versions
    Info,
    #[command(subcommand)]
    I2c(I2cCommand),
    #[command(subcommand)]
    Gpio(GpioCommand),
    #[command(subcommand)]
    Fpga(FpgaCommand),
    #[command(subcommand)]
    Update(UpdateCommand),
}

#[derive(Args)]
struct I2cPins {
    #[arg(long)]
    scl: Option<PinId>,
    #[arg(long)]
    sda: Option<PinId>,
    /// Bus clock in Hz
    #[arg(long)]
    clock: Option<u32>,
}

#[derive(Subcommand)]
enum I2cCommand {
    /// List addresses that acknowledge
    Scan {
        #[command(flatten)]
        pins: I2cPins,
        /// Lowest address scanned
        #[arg(long, value_parser = parse_u8, default_value = "0x00")]
        from: u8,
        /// Highest address scanned
        #[arg(long, value_parser = parse_u8, default_value = "0x7f")]
        to: u8,
    },
    /// Read bytes, optionally after writing a register address
    Read {
        #[command(flatten)]
        pins: I2cPins,
        #[arg(value_parser = parse_u8)]
        address: u8,
        length: u8,
        #[arg(long, value_parser = parse_u8)]
        register: Option<u8>,
    },
    /// Write bytes
    Write {
        #[command(flatten)]
        pins: I2cPins,
        #[arg(value_parser = parse_u8)]
        address: u8,
        #[arg(value_parser = parse_u8, required = true)]
        data: Vec<u8>,
    },
}

#[derive(Subcommand)]
enum GpioCommand {
    /// Drive a pin push-pull
    Set { pin: PinId, level: u8 },
    /// Print a pin's input level
    Get { pin: PinId },
    /// Print level changes until interrupted
    Watch { pin: PinId },
}

#[derive(Subcommand)]
enum FpgaCommand {
    Read {
        #[arg(value_parser = parse_u32)]
        address: u32,
    },
    Write {
        #[arg(value_parser = parse_u32)]
        address: u32,
        #[arg(value_parser = parse_u32)]
        value: u32,
    },
}

#[derive(Subcommand)]
enum UpdateCommand {
    /// Flash microcontroller firmware (cropped image or raw dump)
    Firmware { image: PathBuf },
    /// Flash the FPGA bitstream
    Bitstream {
        image: PathBuf,
        #[arg(long)]
        clock_divider: Option<u16>,
    },
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("{}: {}", s, e))
}

fn parse_u8(s: &str) -> Result<u8, String> {
    let value = parse_u32(s)?;
    u8::try_from(value).map_err(|_| format!("{} does not fit in a byte", s))
}

fn print_progress(progress: UpdateProgress) {
    info!(
        state = %progress.state,
        percent = progress.percent(),
        sent = progress.sent,
        total = progress.total,
        "Update progress"
    );
}

async fn connect(cli: &Cli) -> Result<Connection> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::default().with_env_overrides().validated()?,
    };
    let connection = match &cli.port {
        Some(port) => Connection::connect(port, config).await,
        None => Connection::scan_and_connect(config).await,
    };
    connection.context("no SmartWave reachable")
}

async fn i2c_bus(connection: &Connection, pins: &I2cPins) -> Result<smartwave::I2cConfig> {
    let options = I2cOptions {
        scl: pins.scl,
        sda: pins.sda,
        clock_hz: pins.clock,
        ..Default::default()
    };
    Ok(smartwave::I2cConfig::new(connection, options).await?)
}

async fn run(cli: Cli) -> Result<()> {
    let timeout = Duration::from_millis(cli.timeout_ms);

    if let Command::List = cli.command {
        for port in candidate_ports()? {
            println!("{}", port);
        }
        return Ok(());
    }

    let connection = connect(&cli).await?;
    match &cli.command {
        Command::List => {}
        Command::Info => {
            let info = connection.request_info().await?;
            println!("port:     {}", connection.port());
            println!("hardware: {}", info.hardware);
            println!("firmware: {}", info.firmware);
            println!("fpga:     {}", info.fpga);
            println!("flash id: {:016x}", info.flash_id);
        }
        Command::I2c(I2cCommand::Scan { pins, from, to }) => {
            let bus = i2c_bus(&connection, pins).await?;
            for address in bus.scan_addresses(*from..=*to, timeout).await? {
                println!("0x{:02x}", address);
            }
            bus.release().await?;
        }
        Command::I2c(I2cCommand::Read {
            pins,
            address,
            length,
            register,
        }) => {
            let bus = i2c_bus(&connection, pins).await?;
            let result = match register {
                Some(reg) => bus
                    .read_register(*address, &[*reg], *length, timeout)
                    .await?
                    .pop(),
                None => Some(bus.read(*address, *length, timeout).await?),
            };
            bus.release().await?;
            match result {
                Some(r) if r.address_ack => println!("{}", hex::encode(&r.data)),
                _ => bail!("0x{:02x} did not acknowledge", address),
            }
        }
        Command::I2c(I2cCommand::Write {
            pins,
            address,
            data,
        }) => {
            let bus = i2c_bus(&connection, pins).await?;
            let result = bus.write(*address, data, timeout).await?;
            bus.release().await?;
            if !result.acknowledged() {
                bail!("0x{:02x} did not acknowledge every byte", address);
            }
        }
        Command::Gpio(GpioCommand::Set { pin, level }) => {
            let gpio = Gpio::new(
                &connection,
                GpioOptions {
                    pin: Some(*pin),
                    level: *level != 0,
                    output: OutputType::PushPull,
                    ..Default::default()
                },
            )
            .await?;
            connection.trigger().await?;
            info!(pin = %gpio.pin(), level, "Pin driven");
        }
        Command::Gpio(GpioCommand::Get { pin }) => {
            println!("{}", u8::from(connection.input_level(*pin)));
        }
        Command::Gpio(GpioCommand::Watch { pin }) => {
            let gpio = Gpio::new(
                &connection,
                GpioOptions {
                    pin: Some(*pin),
                    output: OutputType::Disable,
                    ..Default::default()
                },
            )
            .await?;
            let pin = gpio.pin();
            gpio.on_level_change(move |level| println!("{} {}", pin, u8::from(level)));
            tokio::signal::ctrl_c().await?;
            gpio.release().await?;
        }
        Command::Fpga(FpgaCommand::Read { address }) => {
            let value = connection.read_fpga_register(*address).await?;
            println!("0x{:08x}", value);
        }
        Command::Fpga(FpgaCommand::Write { address, value }) => {
            connection.write_fpga_register(*address, *value).await?;
        }
        Command::Update(UpdateCommand::Firmware { image }) => {
            let image = FirmwareImage::load(image)
                .with_context(|| format!("reading {}", image.display()))?;
            connection.update_firmware(&image, print_progress).await?;
        }
        Command::Update(UpdateCommand::Bitstream {
            image,
            clock_divider,
        }) => {
            let mut bitstream = Bitstream::load(image)
                .with_context(|| format!("reading {}", image.display()))?;
            if let Some(divider) = clock_divider {
                bitstream = bitstream.with_clock_divider(*divider);
            }
            connection.update_bitstream(&bitstream, print_progress).await?;
        }
    }

    if connection.is_connected() {
        connection.disconnect().await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init_journald_or_stdout();
    run(Cli::parse()).await
}
