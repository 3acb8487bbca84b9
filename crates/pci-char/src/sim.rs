//! Simulated PCI bus
//!
//! Implements [`PciBus`] entirely in memory. This enables:
//!
//! 1. **CI without hardware**: probe, publish, transfer, and remove run the
//!    exact same code paths as on a real bus.
//!
//! 2. **Failure injection**: every acquisition step (enable, reserve, map)
//!    can be made to fail, which is the only practical way to exercise the
//!    rollback paths.
//!
//! 3. **Leak accounting**: the bus counts live mappings, reservations, and
//!    enable state per device, so tests can prove that teardown is complete.
//!
//! BAR contents are plain words shared by every mapping of the same BAR,
//! the way device registers outlive any one mapping of them.

use crate::bus::{DeviceInfo, PciBus, RegisterWindow};
use crate::error::{PciCharError, Result};
use pci_char_model::{
    BarIndex, BarMask, BarResource, DeviceIds, PciAddress, ResourceTable, BAR_COUNT,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Base of the fake physical address space handed out to simulated BARs
const SIM_MMIO_BASE: u64 = 0xf000_0000;
/// Spacing between simulated BARs
const SIM_BAR_STRIDE: u64 = 0x0100_0000;

/// What a simulated BAR slot decodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimBar {
    /// Unimplemented slot
    #[default]
    Empty,
    /// I/O port BAR of the given length
    Io(u64),
    /// Memory BAR of the given length
    Memory(u64),
}

/// Failures to inject on the next acquisition steps
#[derive(Debug, Clone, Copy, Default)]
pub struct SimFaults {
    /// `enable_device` fails
    pub fail_enable: bool,
    /// `map_region` fails for this slot
    pub fail_map: Option<BarIndex>,
}

/// A simulated PCI function
#[derive(Debug)]
pub struct SimDevice {
    info: DeviceInfo,
    bars: [SimBar; BAR_COUNT],
    storage: [Option<Arc<[AtomicU32]>>; BAR_COUNT],
    enabled: bool,
    reserved: BarMask,
    foreign: BarMask,
    faults: SimFaults,
    live_mappings: Arc<AtomicUsize>,
}

impl SimDevice {
    /// A function with no BARs
    #[must_use]
    pub fn new(address: PciAddress, ids: DeviceIds) -> Self {
        Self {
            info: DeviceInfo {
                address,
                ids,
                kernel_driver: None,
            },
            bars: [SimBar::Empty; BAR_COUNT],
            storage: Default::default(),
            enabled: false,
            reserved: BarMask::EMPTY,
            foreign: BarMask::EMPTY,
            faults: SimFaults::default(),
            live_mappings: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Populate slot `bar`
    ///
    /// Slots `>= 6` are ignored.
    #[must_use]
    pub fn with_bar(mut self, bar: u8, kind: SimBar) -> Self {
        if let Some(bar) = BarIndex::new(bar) {
            self.storage[bar.as_usize()] = match kind {
                SimBar::Memory(len) => Some(new_storage(len)),
                SimBar::Io(_) | SimBar::Empty => None,
            };
            self.bars[bar.as_usize()] = kind;
        }
        self
    }

    /// Pretend a kernel driver is bound to the function
    #[must_use]
    pub fn with_kernel_driver(mut self, name: &str) -> Self {
        self.info.kernel_driver = Some(name.to_string());
        self
    }

    fn resources(&self) -> ResourceTable {
        let mut slots = [BarResource::EMPTY; BAR_COUNT];
        for (i, (slot, bar)) in slots.iter_mut().zip(self.bars.iter()).enumerate() {
            let start = SIM_MMIO_BASE + SIM_BAR_STRIDE * i as u64;
            *slot = match *bar {
                SimBar::Memory(len) if len > 0 => BarResource::memory(start, len),
                SimBar::Io(len) if len > 0 => BarResource::io(0x1000 + 0x100 * i as u64, len),
                _ => BarResource::EMPTY,
            };
        }
        ResourceTable::new(slots)
    }
}

fn new_storage(len: u64) -> Arc<[AtomicU32]> {
    let words = usize::try_from(len / 4).unwrap_or(0);
    (0..words).map(|_| AtomicU32::new(0)).collect()
}

/// In-memory PCI bus
#[derive(Debug, Default)]
pub struct SimBus {
    devices: Mutex<BTreeMap<PciAddress, SimDevice>>,
}

impl SimBus {
    /// An empty bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hot-add a function
    pub fn add(&self, device: SimDevice) {
        tracing::debug!("sim: add {} ({})", device.info.address, device.info.ids);
        self.lock().insert(device.info.address, device);
    }

    /// Set the faults to inject for `address`
    pub fn set_faults(&self, address: PciAddress, faults: SimFaults) {
        if let Some(dev) = self.lock().get_mut(&address) {
            dev.faults = faults;
        }
    }

    /// Mark slots of `address` as reserved by another owner
    pub fn claim_foreign(&self, address: PciAddress, mask: BarMask) {
        if let Some(dev) = self.lock().get_mut(&address) {
            dev.foreign = mask;
        }
    }

    /// Whether `address` is enabled
    #[must_use]
    pub fn is_enabled(&self, address: PciAddress) -> bool {
        self.lock().get(&address).is_some_and(|d| d.enabled)
    }

    /// Slots of `address` reserved by the driver
    #[must_use]
    pub fn reserved(&self, address: PciAddress) -> BarMask {
        self.lock()
            .get(&address)
            .map_or(BarMask::EMPTY, |d| d.reserved)
    }

    /// Number of windows of `address` currently mapped
    #[must_use]
    pub fn live_mappings(&self, address: PciAddress) -> usize {
        self.lock()
            .get(&address)
            .map_or(0, |d| d.live_mappings.load(Ordering::SeqCst))
    }

    /// Read a register the way the hardware sees it, bypassing any mapping
    #[must_use]
    pub fn peek(&self, address: PciAddress, bar: u8, offset: u64) -> Option<u32> {
        let devices = self.lock();
        let storage = devices.get(&address)?.storage.get(usize::from(bar))?.as_ref()?;
        let word = storage.get(usize::try_from(offset / 4).ok()?)?;
        Some(word.load(Ordering::SeqCst))
    }

    /// Set a register from the hardware side
    pub fn poke(&self, address: PciAddress, bar: u8, offset: u64, value: u32) -> bool {
        let devices = self.lock();
        devices
            .get(&address)
            .and_then(|d| d.storage.get(usize::from(bar))?.as_ref())
            .and_then(|s| s.get(usize::try_from(offset / 4).ok()?))
            .map(|word| word.store(value, Ordering::SeqCst))
            .is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<PciAddress, SimDevice>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_device<T>(
        &self,
        address: PciAddress,
        f: impl FnOnce(&mut SimDevice) -> Result<T>,
    ) -> Result<T> {
        let mut devices = self.lock();
        let dev = devices
            .get_mut(&address)
            .ok_or_else(|| PciCharError::device_enable(address, "no such device on bus"))?;
        f(dev)
    }
}

impl PciBus for SimBus {
    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.lock().values().map(|d| d.info.clone()).collect())
    }

    fn enable_device(&self, address: PciAddress) -> Result<()> {
        self.with_device(address, |dev| {
            if dev.faults.fail_enable {
                return Err(PciCharError::device_enable(address, "injected enable failure"));
            }
            dev.enabled = true;
            Ok(())
        })
    }

    fn disable_device(&self, address: PciAddress) {
        let _ = self.with_device(address, |dev| {
            dev.enabled = false;
            Ok(())
        });
    }

    fn resources(&self, address: PciAddress) -> Result<ResourceTable> {
        self.with_device(address, |dev| Ok(dev.resources()))
    }

    fn request_regions(&self, address: PciAddress, mask: BarMask) -> Result<()> {
        self.with_device(address, |dev| {
            if let Some(driver) = &dev.info.kernel_driver {
                return Err(PciCharError::region_conflict(
                    address,
                    format!("bound to kernel driver {driver}"),
                ));
            }
            let held = dev.foreign.bits() | dev.reserved.bits();
            let taken = BarMask::from_bits(mask.bits() & held);
            if !taken.is_empty() {
                return Err(PciCharError::region_conflict(
                    address,
                    format!("slots {taken} owned elsewhere"),
                ));
            }
            dev.reserved = BarMask::from_bits(dev.reserved.bits() | mask.bits());
            Ok(())
        })
    }

    fn release_regions(&self, address: PciAddress, mask: BarMask) {
        let _ = self.with_device(address, |dev| {
            dev.reserved = BarMask::from_bits(dev.reserved.bits() & !mask.bits());
            Ok(())
        });
    }

    fn map_region(
        &self,
        address: PciAddress,
        bar: BarIndex,
        resource: &BarResource,
    ) -> Result<Box<dyn RegisterWindow>> {
        self.with_device(address, |dev| {
            if dev.faults.fail_map == Some(bar) {
                return Err(PciCharError::mapping(address, bar, "injected mapping failure"));
            }
            if !dev.reserved.contains(bar) {
                return Err(PciCharError::mapping(address, bar, "region not reserved"));
            }
            let storage = dev.storage[bar.as_usize()]
                .clone()
                .ok_or_else(|| PciCharError::mapping(address, bar, "not a memory BAR"))?;

            dev.live_mappings.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(SimWindow {
                len: resource.len(),
                storage,
                live: Some(Arc::clone(&dev.live_mappings)),
            }) as Box<dyn RegisterWindow>)
        })
    }
}

/// Simulated mapping of one BAR
#[derive(Debug)]
pub struct SimWindow {
    len: u64,
    storage: Arc<[AtomicU32]>,
    live: Option<Arc<AtomicUsize>>,
}

impl SimWindow {
    /// A detached window of `len` bytes, not attached to any bus
    #[must_use]
    pub fn new(len: u64) -> Self {
        Self {
            len,
            storage: new_storage(len),
            live: None,
        }
    }

    fn word(&self, offset: u64) -> Result<&AtomicU32> {
        if offset % 4 != 0 {
            return Err(PciCharError::fault(offset, "unaligned access"));
        }
        usize::try_from(offset / 4)
            .ok()
            .and_then(|i| self.storage.get(i))
            .ok_or_else(|| {
                PciCharError::fault(offset, format!("out of bounds: limit={:#x}", self.len))
            })
    }
}

impl RegisterWindow for SimWindow {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_u32(&self, offset: u64) -> Result<u32> {
        Ok(self.word(offset)?.load(Ordering::SeqCst))
    }

    fn write_u32(&self, offset: u64, value: u32) -> Result<()> {
        self.word(offset)?.store(value, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for SimWindow {
    fn drop(&mut self) {
        if let Some(live) = &self.live {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
