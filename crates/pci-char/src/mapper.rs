//! BAR mapper
//!
//! Claims a bound function's memory BARs and maps each one:
//!
//! ```text
//! enable_device ──▶ request_regions(all memory BARs) ──▶ map_region(0..6)
//!      │                    │                                │
//!  disable_device    release_regions                 revoke (descending)
//! ```
//!
//! Each step is paired with its inverse inside a `Claim` guard. The guard
//! unwinds whatever was acquired when it is dropped without being committed,
//! so every early return rolls back in reverse order.

use crate::bus::PciBus;
use crate::error::Result;
use crate::handle::AccessHandle;
use pci_char_model::{BarIndex, BarKind, BarMask, PciAddress, BAR_COUNT};
use std::sync::Arc;

/// One BAR slot of a claimed device
#[derive(Debug, Clone, Default)]
pub struct Region {
    length: u64,
    handle: Option<Arc<AccessHandle>>,
}

impl Region {
    fn mapped(handle: Arc<AccessHandle>) -> Self {
        Self {
            length: handle.len(),
            handle: Some(handle),
        }
    }

    /// Byte size of the mapped window, 0 for absent and I/O slots
    #[must_use]
    pub const fn length(&self) -> u64 {
        self.length
    }

    /// Whether the slot is mapped
    #[must_use]
    pub const fn is_mapped(&self) -> bool {
        self.length > 0
    }

    /// Access handle of a mapped slot
    #[must_use]
    pub const fn handle(&self) -> Option<&Arc<AccessHandle>> {
        self.handle.as_ref()
    }

    fn teardown(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.revoke();
        }
        self.length = 0;
    }
}

/// The claimed, mapped BARs of one function
#[derive(Debug)]
pub struct BarMap {
    address: PciAddress,
    reserved: BarMask,
    regions: [Region; BAR_COUNT],
}

impl BarMap {
    /// Function the regions belong to
    #[must_use]
    pub const fn address(&self) -> PciAddress {
        self.address
    }

    /// Slots reserved (and mapped) for the driver
    #[must_use]
    pub const fn reserved(&self) -> BarMask {
        self.reserved
    }

    /// All six slots
    #[must_use]
    pub const fn regions(&self) -> &[Region; BAR_COUNT] {
        &self.regions
    }

    /// One slot
    #[must_use]
    pub const fn region(&self, bar: BarIndex) -> &Region {
        &self.regions[bar.as_usize()]
    }

    /// Mapped slots in ascending order
    pub fn mapped(&self) -> impl Iterator<Item = (BarIndex, &Region)> {
        BarIndex::all()
            .zip(self.regions.iter())
            .filter(|(_, r)| r.is_mapped())
    }
}

/// Acquired state pending commit; unwinds on drop
struct Claim<'a> {
    bus: &'a dyn PciBus,
    address: PciAddress,
    enabled: bool,
    reserved: BarMask,
    handles: Vec<(BarIndex, Arc<AccessHandle>)>,
}

impl<'a> Claim<'a> {
    fn new(bus: &'a dyn PciBus, address: PciAddress) -> Self {
        Self {
            bus,
            address,
            enabled: false,
            reserved: BarMask::EMPTY,
            handles: Vec::new(),
        }
    }

    fn commit(mut self) -> BarMap {
        let mut regions: [Region; BAR_COUNT] = Default::default();
        for (bar, handle) in self.handles.drain(..) {
            regions[bar.as_usize()] = Region::mapped(handle);
        }
        let map = BarMap {
            address: self.address,
            reserved: self.reserved,
            regions,
        };
        self.enabled = false;
        self.reserved = BarMask::EMPTY;
        map
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        while let Some((bar, handle)) = self.handles.pop() {
            tracing::warn!("Rolling back mapping of {bar} on {}", self.address);
            handle.revoke();
        }
        if !self.reserved.is_empty() {
            tracing::warn!("Releasing regions {} of {}", self.reserved, self.address);
            self.bus.release_regions(self.address, self.reserved);
        }
        if self.enabled {
            tracing::warn!("Disabling {} after failed claim", self.address);
            self.bus.disable_device(self.address);
        }
    }
}

/// Enable `address`, reserve its memory BARs, and map each one
///
/// I/O-space and empty slots yield a [`Region`] of length 0. On any failure
/// everything acquired so far is undone, mappings in descending order.
///
/// # Errors
///
/// - `DeviceEnable` if the bus cannot activate the device
/// - `RegionConflict` if any memory BAR is owned elsewhere
/// - `Mapping` if a BAR cannot be mapped
pub fn discover_and_map(bus: &dyn PciBus, address: PciAddress) -> Result<BarMap> {
    let mut claim = Claim::new(bus, address);

    bus.enable_device(address)?;
    claim.enabled = true;

    let resources = bus.resources(address)?;
    for (bar, res) in resources.iter() {
        match res.kind() {
            BarKind::Io => tracing::debug!("{address} {bar}: I/O space, skipped"),
            BarKind::Empty => tracing::trace!("{address} {bar}: empty"),
            BarKind::Memory => tracing::debug!(
                "{address} {bar}: memory {:#x}..{:#x} ({:#x} bytes{})",
                res.start,
                res.end,
                res.len(),
                if res.is_prefetchable() { ", prefetchable" } else { "" }
            ),
        }
    }

    let mask = resources.memory_bars();
    if !mask.is_empty() {
        bus.request_regions(address, mask)?;
        claim.reserved = mask;
    }

    for bar in mask.iter() {
        let window = bus.map_region(address, bar, resources.get(bar))?;
        let handle = Arc::new(AccessHandle::new(bar, window));
        tracing::debug!("Mapped {bar} of {address} ({:#x} bytes)", handle.len());
        claim.handles.push((bar, handle));
    }

    let map = claim.commit();
    tracing::info!(
        "Claimed {address}: {} memory BARs mapped",
        map.reserved().count()
    );
    Ok(map)
}

/// Unmap every region, release the reservation, and disable the device
///
/// Already-open sessions see `StaleHandle` from here on.
pub fn unmap(bus: &dyn PciBus, mut map: BarMap) {
    let address = map.address;
    for region in &mut map.regions {
        region.teardown();
    }
    if !map.reserved.is_empty() {
        bus.release_regions(address, map.reserved);
    }
    bus.disable_device(address);
    tracing::info!("Released {address}");
}
