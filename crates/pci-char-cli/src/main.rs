//! `pcichar`: poke PCI(e) registers from the command line.
//!
//! ```text
//! USAGE:
//!   pcichar list [--ids LIST]                    Functions, IDs, owning drivers
//!   pcichar bars <addr>                          BAR table of one function
//!   pcichar read <addr> <bar> <offset> [-n N]    Read N 32-bit words
//!   pcichar write <addr> <bar> <offset> <word>…  Write 32-bit words
//!   pcichar detach <addr>                        Unbind the kernel driver (root)
//! ```
//!
//! `read` and `write` claim the function for the duration of the command
//! and release it on exit. Numbers accept `0x` hex or decimal.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pci_char::{DriverConfig, PciBus, PciCharDriver, SeekMode, SysfsBus};
use pci_char_model::{BarIndex, BarKind, PciAddress, PciId};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pcichar", about = "Generic PCI(e) BAR register access", version)]
struct Cli {
    /// PCI device directory (default: $PCI_CHAR_SYSFS_ROOT or /sys/bus/pci/devices).
    #[arg(long, global = true)]
    sysfs_root: Option<PathBuf>,

    /// Publish endpoint nodes under this directory while a device is claimed.
    #[arg(long, global = true)]
    node_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List PCI functions.
    List {
        /// Only show functions matching these IDs (e.g. 10ee:7014,1172:e001).
        #[arg(long)]
        ids: Option<String>,
    },
    /// Show the BAR table of one function.
    Bars {
        /// PCI address (e.g. 0000:01:00.0 or 01:00.0).
        addr: PciAddress,
    },
    /// Read 32-bit words from a memory BAR.
    Read {
        /// PCI address.
        addr: PciAddress,
        /// BAR slot (0-5).
        bar: u8,
        /// Byte offset, word aligned.
        #[arg(value_parser = parse_u64)]
        offset: u64,
        /// Number of words.
        #[arg(short = 'n', long, default_value_t = 1)]
        words: usize,
    },
    /// Write 32-bit words to a memory BAR.
    Write {
        /// PCI address.
        addr: PciAddress,
        /// BAR slot (0-5).
        bar: u8,
        /// Byte offset, word aligned.
        #[arg(value_parser = parse_u64)]
        offset: u64,
        /// Words to write, in order.
        #[arg(required = true, value_parser = parse_u32)]
        values: Vec<u32>,
    },
    /// Unbind whatever kernel driver owns a function (requires root).
    Detach {
        /// PCI address.
        addr: PciAddress,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    let mut config = DriverConfig::from_env()?;
    if let Some(root) = cli.sysfs_root {
        config.sysfs_root = root;
    }
    if let Some(root) = cli.node_root {
        config.node_root = Some(root);
    }

    match cli.command {
        Cmd::List { ids } => cmd_list(&config, ids.as_deref())?,
        Cmd::Bars { addr } => cmd_bars(&config, addr)?,
        Cmd::Read {
            addr,
            bar,
            offset,
            words,
        } => cmd_read(&config, addr, bar, offset, words)?,
        Cmd::Write {
            addr,
            bar,
            offset,
            values,
        } => cmd_write(&config, addr, bar, offset, &values)?,
        Cmd::Detach { addr } => cmd_detach(&config, addr)?,
    }

    Ok(())
}

fn cmd_list(config: &DriverConfig, ids: Option<&str>) -> Result<()> {
    let filter = match ids {
        Some(list) => {
            let (ids, errors) = PciId::parse_list(list);
            if let Some(e) = errors.into_iter().next() {
                bail!(e);
            }
            Some(ids)
        }
        None => None,
    };

    let bus = SysfsBus::new(&config.sysfs_root);
    let devices = bus.devices()?;

    let mut shown = 0;
    for dev in &devices {
        if let Some(ids) = &filter {
            if !ids.iter().any(|id| id.matches(&dev.ids)) {
                continue;
            }
        }
        println!(
            "{}  {:04x}:{:04x}  class {:06x}  {}",
            dev.address,
            dev.ids.vendor,
            dev.ids.device,
            dev.ids.class,
            dev.kernel_driver.as_deref().unwrap_or("-")
        );
        shown += 1;
    }

    if shown == 0 {
        println!("No matching PCI functions under {}", config.sysfs_root.display());
    }
    Ok(())
}

fn cmd_bars(config: &DriverConfig, addr: PciAddress) -> Result<()> {
    let bus = SysfsBus::new(&config.sysfs_root);
    let table = bus
        .resources(addr)
        .with_context(|| format!("Cannot read BARs of {addr}"))?;

    for (bar, res) in table.iter() {
        let kind = match res.kind() {
            BarKind::Empty => {
                println!("{bar}: -");
                continue;
            }
            BarKind::Io => "io",
            BarKind::Memory => "mem",
        };
        let mut attrs = Vec::new();
        if res.is_64bit() {
            attrs.push("64-bit");
        }
        if res.is_prefetchable() {
            attrs.push("prefetchable");
        }
        println!(
            "{bar}: {kind:<3} {:#014x}-{:#014x}  {:>10} bytes  {}  {}",
            res.start,
            res.end,
            res.len(),
            attrs.join(","),
            addr.endpoint_path(bar)
        );
    }
    Ok(())
}

/// Claim `addr` and hand back the driver owning it
fn claim(config: &DriverConfig, addr: PciAddress) -> Result<PciCharDriver<SysfsBus>> {
    let config = DriverConfig {
        ids: String::new(),
        ..config.clone()
    };
    let bus = Arc::new(SysfsBus::new(&config.sysfs_root));
    let driver = PciCharDriver::init(bus, &config)?;
    driver
        .bind(addr)
        .with_context(|| format!("Cannot claim {addr}"))?;
    tracing::debug!("Claimed {addr}: {:?}", driver.controller().lengths(addr));
    Ok(driver)
}

fn bar_index(bar: u8) -> Result<BarIndex> {
    BarIndex::new(bar).with_context(|| format!("BAR index {bar} out of range 0-5"))
}

fn cmd_read(
    config: &DriverConfig,
    addr: PciAddress,
    bar: u8,
    offset: u64,
    words: usize,
) -> Result<()> {
    let bar = bar_index(bar)?;
    let driver = claim(config, addr)?;
    let mut session = driver.open_path(&addr.endpoint_path(bar))?;

    session.seek(SeekMode::Absolute(offset))?;
    let count = words.checked_mul(4).context("word count too large")?;
    let data = session.read(count)?;

    for (i, chunk) in data.chunks_exact(4).enumerate() {
        let value = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        println!("{:#010x}: {value:#010x}", offset + 4 * i as u64);
    }
    if data.len() < count {
        eprintln!(
            "Short read: {} of {words} words ({} is {:#x} bytes)",
            data.len() / 4,
            session.path(),
            session.len()
        );
    }
    Ok(())
}

fn cmd_write(
    config: &DriverConfig,
    addr: PciAddress,
    bar: u8,
    offset: u64,
    values: &[u32],
) -> Result<()> {
    let bar = bar_index(bar)?;
    let driver = claim(config, addr)?;
    let mut session = driver.open_path(&addr.endpoint_path(bar))?;

    session.seek(SeekMode::Absolute(offset))?;
    let data: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
    let written = session.write(&data)?;

    println!("Wrote {} words to {} at {offset:#x}", written / 4, session.path());
    if written < data.len() {
        bail!("short write: {} of {} words", written / 4, values.len());
    }
    Ok(())
}

fn cmd_detach(config: &DriverConfig, addr: PciAddress) -> Result<()> {
    let bus = SysfsBus::new(&config.sysfs_root);
    let info = bus.device_info(addr)?;
    match info.kernel_driver {
        Some(driver) => {
            println!("Unbinding {addr} from {driver} ...");
            bus.unbind_kernel_driver(addr)?;
            println!("Done. Claim it with: pcichar read {addr} <bar> <offset>");
        }
        None => println!("{addr} has no kernel driver"),
    }
    Ok(())
}

fn parse_u64(s: &str) -> std::result::Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("{s:?}: {e}"))
}

fn parse_u32(s: &str) -> std::result::Result<u32, String> {
    let value = parse_u64(s)?;
    u32::try_from(value).map_err(|_| format!("{s:?} does not fit in 32 bits"))
}
