//! Bus abstraction
//!
//! Everything the driver needs from the platform goes through [`PciBus`]:
//! enumeration, enabling, resource reservation, and mapping. Two
//! implementations ship with the crate:
//!
//! - [`SysfsBus`](crate::SysfsBus) drives real hardware through
//!   `/sys/bus/pci/devices`.
//! - [`SimBus`](crate::SimBus) keeps devices in memory for CI and for
//!   exercising every failure path without hardware.

use crate::error::Result;
use pci_char_model::{BarIndex, BarMask, BarResource, DeviceIds, PciAddress, ResourceTable};
use std::fmt::Debug;

/// One function visible on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Bus address
    pub address: PciAddress,

    /// Identification registers
    pub ids: DeviceIds,

    /// Name of the kernel driver bound to the function, if any
    pub kernel_driver: Option<String>,
}

/// Platform services used by the BAR mapper and the binding authority
pub trait PciBus: Debug + Send + Sync {
    /// Enumerate all functions
    ///
    /// # Errors
    ///
    /// Returns error if the bus cannot be scanned.
    fn devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Enable the function for memory-space decoding
    ///
    /// # Errors
    ///
    /// Returns `DeviceEnable` if the device cannot be activated.
    fn enable_device(&self, address: PciAddress) -> Result<()>;

    /// Undo [`enable_device`](Self::enable_device)
    fn disable_device(&self, address: PciAddress);

    /// The six BAR resources of the function
    ///
    /// # Errors
    ///
    /// Returns error if the resource table cannot be read or parsed.
    fn resources(&self, address: PciAddress) -> Result<ResourceTable>;

    /// Reserve every BAR in `mask` exclusively, all or nothing
    ///
    /// # Errors
    ///
    /// Returns `RegionConflict` if any region is owned elsewhere; in that
    /// case nothing is reserved.
    fn request_regions(&self, address: PciAddress, mask: BarMask) -> Result<()>;

    /// Release a reservation made by [`request_regions`](Self::request_regions)
    fn release_regions(&self, address: PciAddress, mask: BarMask);

    /// Map one reserved memory BAR over its full length
    ///
    /// Dropping the returned window unmaps it.
    ///
    /// # Errors
    ///
    /// Returns `Mapping` if the mapping cannot be established.
    fn map_region(
        &self,
        address: PciAddress,
        bar: BarIndex,
        resource: &BarResource,
    ) -> Result<Box<dyn RegisterWindow>>;
}

/// A mapped BAR
///
/// Implementations bounds-check every access; callers additionally go
/// through [`AccessHandle`](crate::AccessHandle), which enforces alignment and
/// revocation.
pub trait RegisterWindow: Debug + Send + Sync {
    /// Length of the window in bytes
    fn len(&self) -> u64;

    /// Whether the window spans no bytes
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Uncached 32-bit load at byte `offset`
    ///
    /// # Errors
    ///
    /// Returns `Fault` if `offset + 4` exceeds the window.
    fn read_u32(&self, offset: u64) -> Result<u32>;

    /// Uncached 32-bit store at byte `offset`
    ///
    /// # Errors
    ///
    /// Returns `Fault` if `offset + 4` exceeds the window.
    fn write_u32(&self, offset: u64, value: u32) -> Result<()>;
}
