//! Generic register access to PCI(e) memory BARs.
//!
//! Claims a PCI function from userspace, maps every memory BAR, and exposes
//! each one as a seekable endpoint that reads and writes raw 32-bit
//! registers. Meant for FPGA/ASIC bring-up, where there is no driver yet.
//!
//! # Layers
//!
//! ```text
//! PciCharDriver   dynamic IDs, bind / unbind           (binding authority)
//!   Controller    Unbound → Probing → Active → Removing
//!     mapper      enable, reserve, map  ─┐
//!     registry    identities, names      │ AccessHandle (revocable)
//!       Session   seek / read / write  ◀─┘
//! PciBus          SysfsBus (hardware) │ SimBus (in-memory)
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use pci_char::{DriverConfig, PciCharDriver, SeekMode, SysfsBus};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DriverConfig::from_env()?;
//! let bus = Arc::new(SysfsBus::new(&config.sysfs_root));
//! let driver = PciCharDriver::init(bus, &config)?;
//! driver.new_id("10ee:7014")?;
//!
//! let mut bar0 = driver.open_path("pci-char/01:00.00/bar0")?;
//! bar0.seek(SeekMode::Absolute(0x10))?;
//! bar0.write(&0xCAFE_BABEu32.to_ne_bytes())?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod bus;
pub mod config;
mod driver;
mod error;
mod handle;
pub mod lifecycle;
pub mod mapper;
mod mmap;
pub mod nodes;
pub mod registry;
mod session;
pub mod sim;
mod sysfs;

pub use bus::{DeviceInfo, PciBus, RegisterWindow};
pub use config::DriverConfig;
pub use driver::PciCharDriver;
pub use error::{PciCharError, Result};
pub use handle::{AccessHandle, Transfer, WORD};
pub use lifecycle::{Controller, DeviceInstance, DeviceState};
pub use mapper::{BarMap, Region};
pub use mmap::MmapWindow;
pub use nodes::{DirectoryPublisher, NodePublisher, NullPublisher};
pub use registry::{EndpointId, EndpointInfo, EndpointRegistry, IdentityRange};
pub use session::{SeekMode, Session};
pub use sim::{SimBar, SimBus, SimDevice, SimFaults, SimWindow};
pub use sysfs::{SysfsBus, DEFAULT_SYSFS_ROOT};

/// Re-exported addressing model
pub use pci_char_model as model;
