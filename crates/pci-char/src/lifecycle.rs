//! Device lifecycle
//!
//! Per-device state machine:
//!
//! ```text
//!            probe ok                      remove
//! Unbound ──▶ Probing ──▶ Active ──▶ Removing ──▶ Unbound
//!               │
//!               └── probe failed: rolled back ──▶ Unbound
//! ```
//!
//! Probe is map then publish. Remove is the strict reverse:
//!
//! 1. unpublish (no new opens)
//! 2. unmap (revokes handles, releases regions, disables the device)
//! 3. release the identity range
//! 4. drop the instance
//!
//! The device table is locked only to move between states, never across
//! bus operations, so probes of different devices run in parallel.

use crate::bus::PciBus;
use crate::error::{PciCharError, Result};
use crate::mapper::{self, BarMap};
use crate::registry::{EndpointRegistry, IdentityRange};
use pci_char_model::{PciAddress, BAR_COUNT};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Lifecycle state of one function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Not claimed
    Unbound,
    /// Claim in progress
    Probing,
    /// Claimed, endpoints published
    Active,
    /// Teardown in progress
    Removing,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unbound => "unbound",
            Self::Probing => "probing",
            Self::Active => "active",
            Self::Removing => "removing",
        };
        f.write_str(s)
    }
}

/// A claimed device
#[derive(Debug)]
pub struct DeviceInstance {
    map: BarMap,
    range: IdentityRange,
}

impl DeviceInstance {
    /// Function address
    #[must_use]
    pub const fn address(&self) -> PciAddress {
        self.map.address()
    }

    /// Identity range of the published endpoints
    #[must_use]
    pub const fn range(&self) -> IdentityRange {
        self.range
    }

    /// Mapped length of every slot, 0 where unmapped
    #[must_use]
    pub fn lengths(&self) -> [u64; BAR_COUNT] {
        let regions = self.map.regions();
        std::array::from_fn(|i| regions[i].length())
    }
}

#[derive(Debug)]
enum Entry {
    Probing,
    Active(DeviceInstance),
    Removing,
}

impl Entry {
    const fn state(&self) -> DeviceState {
        match self {
            Self::Probing => DeviceState::Probing,
            Self::Active(_) => DeviceState::Active,
            Self::Removing => DeviceState::Removing,
        }
    }
}

/// Claims and releases devices
#[derive(Debug)]
pub struct Controller<B: PciBus> {
    bus: Arc<B>,
    registry: Arc<EndpointRegistry>,
    devices: Mutex<BTreeMap<PciAddress, Entry>>,
}

impl<B: PciBus> Controller<B> {
    /// Controller claiming devices on `bus` into `registry`
    pub fn new(bus: Arc<B>, registry: Arc<EndpointRegistry>) -> Self {
        Self {
            bus,
            registry,
            devices: Mutex::new(BTreeMap::new()),
        }
    }

    /// The bus devices are claimed on
    pub fn bus(&self) -> &Arc<B> {
        &self.bus
    }

    /// Registry endpoints are published in
    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// Claim `address` and publish its endpoints
    ///
    /// On failure everything acquired is released and the device stays
    /// unbound.
    ///
    /// # Errors
    ///
    /// - `AlreadyBound` if the device is probing, active, or removing
    /// - any BAR mapper or registry error
    pub fn probe(&self, address: PciAddress) -> Result<IdentityRange> {
        {
            let mut devices = self.lock();
            if let Some(entry) = devices.get(&address) {
                return Err(PciCharError::AlreadyBound {
                    address,
                    state: entry.state().to_string(),
                });
            }
            devices.insert(address, Entry::Probing);
        }
        tracing::debug!("Probing {address}");

        match self.claim(address) {
            Ok(instance) => {
                let range = instance.range();
                self.lock().insert(address, Entry::Active(instance));
                tracing::info!("Bound {address} (endpoints {range})");
                Ok(range)
            }
            Err(e) => {
                self.lock().remove(&address);
                tracing::warn!("Probe of {address} failed: {e}");
                Err(e)
            }
        }
    }

    fn claim(&self, address: PciAddress) -> Result<DeviceInstance> {
        let bus: &dyn PciBus = &*self.bus;
        let map = mapper::discover_and_map(bus, address)?;
        match self.registry.publish(&map) {
            Ok(range) => Ok(DeviceInstance { map, range }),
            Err(e) => {
                mapper::unmap(bus, map);
                Err(e)
            }
        }
    }

    /// Withdraw `address`'s endpoints and release the device
    ///
    /// # Errors
    ///
    /// Returns `NotBound` unless the device is active.
    pub fn remove(&self, address: PciAddress) -> Result<()> {
        let instance = {
            let mut devices = self.lock();
            match devices.get(&address) {
                Some(Entry::Active(_)) => {}
                _ => return Err(PciCharError::NotBound { address }),
            }
            match devices.insert(address, Entry::Removing) {
                Some(Entry::Active(instance)) => instance,
                _ => return Err(PciCharError::NotBound { address }),
            }
        };
        tracing::debug!("Removing {address}");

        let DeviceInstance { map, range } = instance;
        self.registry.unpublish(range);
        mapper::unmap(&*self.bus, map);
        self.registry.release_range(range);

        self.lock().remove(&address);
        tracing::info!("Unbound {address}");
        Ok(())
    }

    /// Current state of `address`
    pub fn state(&self, address: PciAddress) -> DeviceState {
        self.lock()
            .get(&address)
            .map_or(DeviceState::Unbound, Entry::state)
    }

    /// Identity range of an active device
    pub fn range(&self, address: PciAddress) -> Option<IdentityRange> {
        match self.lock().get(&address) {
            Some(Entry::Active(instance)) => Some(instance.range()),
            _ => None,
        }
    }

    /// Mapped slot lengths of an active device
    pub fn lengths(&self, address: PciAddress) -> Option<[u64; BAR_COUNT]> {
        match self.lock().get(&address) {
            Some(Entry::Active(instance)) => Some(instance.lengths()),
            _ => None,
        }
    }

    /// Addresses of all active devices
    pub fn active_devices(&self) -> Vec<PciAddress> {
        self.lock()
            .iter()
            .filter(|(_, e)| matches!(e, Entry::Active(_)))
            .map(|(a, _)| *a)
            .collect()
    }

    /// Remove every active device
    pub fn shutdown(&self) {
        for address in self.active_devices() {
            if let Err(e) = self.remove(address) {
                tracing::debug!("Skipping {address} during shutdown: {e}");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<PciAddress, Entry>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::NullPublisher;
    use crate::sim::{SimBar, SimBus, SimDevice, SimFaults};
    use pci_char_model::{BarIndex, DeviceIds};

    fn addr() -> PciAddress {
        PciAddress::new(1, 0, 1).unwrap()
    }

    fn controller(dev: SimDevice) -> Controller<SimBus> {
        let bus = SimBus::new();
        bus.add(dev);
        let registry = EndpointRegistry::new(Box::new(NullPublisher), 240, 4);
        Controller::new(Arc::new(bus), Arc::new(registry))
    }

    fn device() -> SimDevice {
        SimDevice::new(addr(), DeviceIds::new(0x10ee, 0x7014))
            .with_bar(0, SimBar::Memory(4096))
            .with_bar(3, SimBar::Memory(256))
    }

    #[test]
    fn test_state_transitions() {
        let ctl = controller(device());
        assert_eq!(ctl.state(addr()), DeviceState::Unbound);

        ctl.probe(addr()).unwrap();
        assert_eq!(ctl.state(addr()), DeviceState::Active);
        assert_eq!(ctl.lengths(addr()).unwrap(), [4096, 0, 0, 256, 0, 0]);
        assert_eq!(ctl.active_devices(), vec![addr()]);

        ctl.remove(addr()).unwrap();
        assert_eq!(ctl.state(addr()), DeviceState::Unbound);
        assert!(ctl.registry().endpoints().is_empty());
        assert_eq!(ctl.bus().live_mappings(addr()), 0);
    }

    #[test]
    fn test_double_probe_and_stray_remove() {
        let ctl = controller(device());
        assert!(matches!(ctl.remove(addr()), Err(PciCharError::NotBound { .. })));

        ctl.probe(addr()).unwrap();
        let err = ctl.probe(addr()).unwrap_err();
        assert!(matches!(err, PciCharError::AlreadyBound { ref state, .. } if state == "active"));
        assert_eq!(ctl.registry().ranges_in_use(), 1);
        ctl.shutdown();
        assert!(ctl.active_devices().is_empty());
    }

    #[test]
    fn test_failed_probe_leaves_device_rebindable() {
        let ctl = controller(device());
        ctl.bus().set_faults(
            addr(),
            SimFaults {
                fail_map: BarIndex::new(3),
                ..SimFaults::default()
            },
        );
        assert!(ctl.probe(addr()).is_err());
        assert_eq!(ctl.state(addr()), DeviceState::Unbound);
        assert_eq!(ctl.registry().ranges_in_use(), 0);

        ctl.bus().set_faults(addr(), SimFaults::default());
        ctl.probe(addr()).unwrap();
        assert_eq!(ctl.state(addr()), DeviceState::Active);
    }
}
