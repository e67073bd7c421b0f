//! Command-line interface for queued-i2c.
//!
//! Runs single bus operations through a [`TransactionQueue`], in the spirit
//! of the i2c-tools utilities. `--simulate` swaps the hardware for an
//! in-memory bus with two demo devices at 0x0f and 0xf0.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{self, SignalKind};
use tokio_util::sync::CancellationToken;

use queued_i2c::config::Config;
use queued_i2c::tracing::{self, prelude::*};
use queued_i2c::transport::{sim::SimBus, Transport};
use queued_i2c::{Bit, BusChannel, Functionality, TransactionQueue};
use tracing_subscriber::filter::LevelFilter;

/// Queued access to an I2C/SMBus bus
#[derive(Parser, Debug)]
#[command(name = "qi2c", author, version, about, long_about = None)]
struct Args {
    /// Bus number, as in /dev/i2c-N (overrides config and QI2C_CHANNEL)
    #[arg(short, long, global = true)]
    channel: Option<u32>,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use an in-memory bus instead of hardware
    #[arg(long, global = true)]
    simulate: bool,

    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List adapter functionality
    Funcs,

    /// Probe for responding addresses
    Scan,

    /// Read a byte from a register
    ReadByte {
        #[arg(value_parser = parse_u8)]
        address: u8,
        #[arg(value_parser = parse_u8)]
        command: u8,
    },

    /// Read a 16-bit word from a register
    ReadWord {
        #[arg(value_parser = parse_u8)]
        address: u8,
        #[arg(value_parser = parse_u8)]
        command: u8,
    },

    /// Read consecutive bytes starting at a register
    ReadBlock {
        #[arg(value_parser = parse_u8)]
        address: u8,
        #[arg(value_parser = parse_u8)]
        command: u8,
        length: usize,
    },

    /// Read a byte without selecting a register
    ReceiveByte {
        #[arg(value_parser = parse_u8)]
        address: u8,
    },

    /// Write a byte to a register
    WriteByte {
        #[arg(value_parser = parse_u8)]
        address: u8,
        #[arg(value_parser = parse_u8)]
        command: u8,
        #[arg(value_parser = parse_u8)]
        value: u8,
    },

    /// Write a 16-bit word to a register
    WriteWord {
        #[arg(value_parser = parse_u8)]
        address: u8,
        #[arg(value_parser = parse_u8)]
        command: u8,
        #[arg(value_parser = parse_u16)]
        value: u16,
    },

    /// Write hex-encoded bytes starting at a register
    WriteBlock {
        #[arg(value_parser = parse_u8)]
        address: u8,
        #[arg(value_parser = parse_u8)]
        command: u8,
        /// Data as hex, e.g. 0a0b0c
        data: String,
    },

    /// Write a byte without selecting a register
    SendByte {
        #[arg(value_parser = parse_u8)]
        address: u8,
        #[arg(value_parser = parse_u8)]
        value: u8,
    },

    /// Send an SMBus quick command
    WriteQuick {
        #[arg(value_parser = parse_u8)]
        address: u8,
        /// 0 or 1
        #[arg(value_parser = clap::value_parser!(u8).range(0..=1))]
        bit: u8,
    },

    /// Print all 256 registers of a device
    Dump {
        #[arg(value_parser = parse_u8)]
        address: u8,
    },
}

/// Accepts decimal or 0x-prefixed hex.
fn parse_u8(s: &str) -> Result<u8, String> {
    parse_number(s).and_then(|n| u8::try_from(n).map_err(|e| e.to_string()))
}

fn parse_u16(s: &str) -> Result<u16, String> {
    parse_number(s).and_then(|n| u16::try_from(n).map_err(|e| e.to_string()))
}

fn parse_number(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(digits) => u32::from_str_radix(digits, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number {s:?}: {e}"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    tracing::init(if args.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    });

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("qi2c: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::from_env()?,
    };
    if let Some(channel) = args.channel {
        config.bus.channel = channel;
    }
    debug!(?config, simulate = args.simulate, "Configuration loaded.");

    let transport = transport(&config, args.simulate)?;
    let channel = BusChannel::new(config.bus.channel, transport);
    let queue = TransactionQueue::spawn_with(channel, &config.queue);

    let running = CancellationToken::new();
    let mut sigint = unix::signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = unix::signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let watcher = running.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {},
            _ = sigterm.recv() => {},
        }
        trace!("Signal received.");
        watcher.cancel();
    });

    queue
        .open()
        .await
        .with_context(|| format!("opening bus {}", config.bus.channel))?;

    let result = tokio::select! {
        _ = running.cancelled() => Err(anyhow::anyhow!("interrupted")),
        result = execute(&queue, args.command) => result,
    };

    // The worker may still be busy with an interrupted operation; closing
    // then waits behind it, so skip it and let process exit drop the handle.
    if !running.is_cancelled() {
        queue.close().await?;
    }
    result
}

fn transport(config: &Config, simulate: bool) -> Result<Arc<dyn Transport>> {
    if simulate {
        return Ok(Arc::new(
            SimBus::new(config.bus.channel)
                .with_device(0x0f, (0..=255u8).rev().collect::<Vec<_>>())
                .with_device(0xf0, (0..=255u8).collect::<Vec<_>>()),
        ));
    }

    #[cfg(target_os = "linux")]
    {
        use queued_i2c::transport::linux::LinuxTransport;
        Ok(Arc::new(LinuxTransport::new(&config.bus.device_dir)))
    }
    #[cfg(not(target_os = "linux"))]
    {
        anyhow::bail!("no hardware transport on this platform, use --simulate")
    }
}

async fn execute(queue: &TransactionQueue, command: Command) -> Result<()> {
    match command {
        Command::Funcs => {
            let functionality = queue.capabilities().await?;
            print_funcs(functionality);
        }
        Command::Scan => {
            let addresses = queue.scan().await?;
            if addresses.is_empty() {
                println!("No devices found.");
            }
            for address in addresses {
                println!("0x{address:02x}");
            }
        }
        Command::ReadByte { address, command } => {
            println!("0x{:02x}", queue.read_byte(address, command).await?);
        }
        Command::ReadWord { address, command } => {
            println!("0x{:04x}", queue.read_word(address, command).await?);
        }
        Command::ReadBlock {
            address,
            command,
            length,
        } => {
            let data = queue.read_block(address, command, length).await?;
            println!("{}", hex::encode(&data));
        }
        Command::ReceiveByte { address } => {
            println!("0x{:02x}", queue.receive_byte(address).await?);
        }
        Command::WriteByte {
            address,
            command,
            value,
        } => {
            queue.write_byte(address, command, value).await?;
        }
        Command::WriteWord {
            address,
            command,
            value,
        } => {
            queue.write_word(address, command, value).await?;
        }
        Command::WriteBlock {
            address,
            command,
            data,
        } => {
            let digits = data.strip_prefix("0x").unwrap_or(&data);
            let data = hex::decode(digits).with_context(|| format!("invalid hex {data:?}"))?;
            let written = queue.write_block(address, command, data).await?;
            println!("{written} bytes written");
        }
        Command::SendByte { address, value } => {
            queue.send_byte(address, value).await?;
        }
        Command::WriteQuick { address, bit } => {
            queue.write_quick(address, Bit::from(bit == 1)).await?;
        }
        Command::Dump { address } => {
            dump(queue, address).await?;
        }
    }
    Ok(())
}

fn print_funcs(functionality: Functionality) {
    for (name, flag) in Functionality::all().iter_names() {
        let supported = if functionality.contains(flag) { "yes" } else { "no" };
        println!("{name:<24} 0x{:08x} {supported}", flag.bits());
    }
}

/// i2cdump-style table. Registers that fail to read show as `XX`; a
/// missing device fails the whole dump.
async fn dump(queue: &TransactionQueue, address: u8) -> Result<()> {
    let mut table = String::from("    ");
    for column in 0..16 {
        table.push_str(&format!(" {column:2x}"));
    }
    table.push('\n');

    for row in 0..16u8 {
        table.push_str(&format!("{:02x}:", row << 4));
        for column in 0..16u8 {
            let register = (row << 4) | column;
            match queue.read_byte(address, register).await {
                Ok(value) => table.push_str(&format!(" {value:02x}")),
                Err(e @ queued_i2c::BusError::RemoteDevice { .. }) => {
                    return Err(e).with_context(|| format!("dumping 0x{address:02x}"));
                }
                Err(e) => {
                    debug!(register, error = %e, "Register read failed.");
                    table.push_str(" XX");
                }
            }
        }
        table.push('\n');
    }

    print!("{table}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_numbers() {
        assert_eq!(parse_u8("0x48"), Ok(0x48));
        assert_eq!(parse_u8("72"), Ok(72));
        assert_eq!(parse_u16("0XBEEF"), Ok(0xbeef));
        assert!(parse_u8("0x100").is_err());
        assert!(parse_u8("sensor").is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Args::try_parse_from(["qi2c", "read-word", "0x48", "0", "--simulate", "-c", "3"])
            .unwrap();
        assert!(args.simulate);
        assert_eq!(args.channel, Some(3));
        assert!(matches!(
            args.command,
            Command::ReadWord {
                address: 0x48,
                command: 0
            }
        ));
    }

    #[tokio::test]
    async fn test_dump_simulated_device() {
        let config = Config::default();
        let channel = BusChannel::new(config.bus.channel, transport(&config, true).unwrap());
        let queue = TransactionQueue::spawn(channel);
        queue.open().await.unwrap();

        dump(&queue, 0xf0).await.unwrap();
        assert!(dump(&queue, 0x20).await.is_err());
    }
}
