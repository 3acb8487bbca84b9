//! Sysfs PCI bus
//!
//! Drives real hardware through `/sys/bus/pci/devices/{addr}/`:
//!
//! | Attribute | Use |
//! |-----------|-----|
//! | `vendor`, `device`, `subsystem_*`, `class` | enumeration and ID matching |
//! | `driver` (symlink) | a bound kernel driver means the regions are taken |
//! | `enable` | memory-space enable / disable |
//! | `resource` | BAR table (start, end, flags) |
//! | `resourceN` | mmap target for BAR N; also the exclusive reservation lock |
//!
//! Reservations are advisory `flock`s on the `resourceN` files, so two
//! processes running this driver never own the same BAR.

use crate::bus::{DeviceInfo, PciBus, RegisterWindow};
use crate::error::{PciCharError, Result};
use crate::mmap::MmapWindow;
use pci_char_model::{BarIndex, BarMask, BarResource, DeviceIds, PciAddress, ResourceTable};
use rustix::fs::{flock, FlockOperation};
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Default location of PCI functions in sysfs
pub const DEFAULT_SYSFS_ROOT: &str = "/sys/bus/pci/devices";

/// What this process holds on one function
#[derive(Debug, Default)]
struct Claim {
    enabled_here: bool,
    locks: BTreeMap<BarIndex, File>,
}

/// PCI bus backed by sysfs
#[derive(Debug)]
pub struct SysfsBus {
    root: PathBuf,
    claims: Mutex<HashMap<PciAddress, Claim>>,
}

impl Default for SysfsBus {
    fn default() -> Self {
        Self::new(DEFAULT_SYSFS_ROOT)
    }
}

impl SysfsBus {
    /// Bus rooted at `root` (normally [`DEFAULT_SYSFS_ROOT`])
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            claims: Mutex::new(HashMap::new()),
        }
    }

    /// Sysfs root this bus scans
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of one function
    #[must_use]
    pub fn device_dir(&self, address: PciAddress) -> PathBuf {
        self.root.join(address.to_string())
    }

    /// Identification and driver binding of one function
    ///
    /// # Errors
    ///
    /// Returns error if the ID attributes cannot be read.
    pub fn device_info(&self, address: PciAddress) -> Result<DeviceInfo> {
        let dir = self.device_dir(address);
        let read_u16 = |attr: &str| -> Result<u16> {
            let value = read_hex_sysfs(&dir.join(attr))?;
            u16::try_from(value).map_err(|_| {
                PciCharError::config(format!("{attr} of {address} out of range: {value:#x}"))
            })
        };

        let ids = DeviceIds {
            vendor: read_u16("vendor")?,
            device: read_u16("device")?,
            subvendor: read_u16("subsystem_vendor").unwrap_or(0),
            subdevice: read_u16("subsystem_device").unwrap_or(0),
            class: read_hex_sysfs(&dir.join("class")).unwrap_or(0),
        };

        Ok(DeviceInfo {
            address,
            ids,
            kernel_driver: kernel_driver(&dir),
        })
    }

    /// Detach whatever kernel driver is bound to `address`
    ///
    /// Requires root. A function without a driver is left untouched.
    ///
    /// # Errors
    ///
    /// Returns error if the `driver/unbind` write fails.
    pub fn unbind_kernel_driver(&self, address: PciAddress) -> Result<()> {
        let dir = self.device_dir(address);
        let Some(driver) = kernel_driver(&dir) else {
            tracing::debug!("{address} has no kernel driver");
            return Ok(());
        };

        std::fs::write(dir.join("driver/unbind"), address.to_string()).map_err(|e| {
            PciCharError::region_conflict(address, format!("cannot unbind {driver}: {e}"))
        })?;

        tracing::info!("Unbound {address} from {driver}");
        Ok(())
    }

    fn claims(&self) -> std::sync::MutexGuard<'_, HashMap<PciAddress, Claim>> {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PciBus for SysfsBus {
    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| {
            PciCharError::config(format!("Cannot read {}: {e}", self.root.display()))
        })?;

        let mut devices = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Ok(address) = name.to_string_lossy().parse::<PciAddress>() else {
                tracing::trace!("Skipping {}", name.to_string_lossy());
                continue;
            };

            match self.device_info(address) {
                Ok(info) => devices.push(info),
                Err(e) => tracing::warn!("Cannot identify {address}: {e}"),
            }
        }

        // Sort to ensure consistent ordering
        devices.sort_by_key(|d| d.address);
        Ok(devices)
    }

    fn enable_device(&self, address: PciAddress) -> Result<()> {
        let enable_path = self.device_dir(address).join("enable");

        let enabled_here = match std::fs::read_to_string(&enable_path) {
            Ok(content) if content.trim() != "0" => {
                tracing::debug!("Device {address} already enabled");
                false
            }
            Ok(_) => {
                std::fs::write(&enable_path, "1").map_err(|e| {
                    PciCharError::device_enable(address, format!("cannot write enable: {e}"))
                })?;
                tracing::debug!("Enabled device {address}");
                true
            }
            Err(e) => {
                return Err(PciCharError::device_enable(
                    address,
                    format!("cannot read {}: {e}", enable_path.display()),
                ))
            }
        };

        self.claims().entry(address).or_default().enabled_here = enabled_here;
        Ok(())
    }

    fn disable_device(&self, address: PciAddress) {
        let Some(claim) = self.claims().remove(&address) else {
            return;
        };
        if !claim.locks.is_empty() {
            tracing::warn!("Disabling {address} with {} regions still reserved", claim.locks.len());
        }
        if claim.enabled_here {
            let enable_path = self.device_dir(address).join("enable");
            if let Err(e) = std::fs::write(&enable_path, "0") {
                tracing::warn!("Cannot disable {address}: {e}");
            } else {
                tracing::debug!("Disabled device {address}");
            }
        }
    }

    fn resources(&self, address: PciAddress) -> Result<ResourceTable> {
        let path = self.device_dir(address).join("resource");
        let content = std::fs::read_to_string(&path)?;
        Ok(ResourceTable::parse(&content)?)
    }

    fn request_regions(&self, address: PciAddress, mask: BarMask) -> Result<()> {
        let dir = self.device_dir(address);
        if let Some(driver) = kernel_driver(&dir) {
            return Err(PciCharError::region_conflict(
                address,
                format!("bound to kernel driver {driver}"),
            ));
        }

        // Locks taken so far are dropped (and released) on any early return.
        let mut locks = BTreeMap::new();
        for bar in mask.iter() {
            let path = dir.join(format!("resource{}", bar.get()));
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| {
                    let reason = format!("cannot open {}: {e}", path.display());
                    PciCharError::region_conflict(address, reason)
                })?;

            flock(&file, FlockOperation::NonBlockingLockExclusive).map_err(|e| {
                let reason = format!("{bar} held by another process: {e}");
                PciCharError::region_conflict(address, reason)
            })?;

            locks.insert(bar, file);
        }

        tracing::debug!("Reserved regions {mask} of {address}");
        self.claims().entry(address).or_default().locks.extend(locks);
        Ok(())
    }

    fn release_regions(&self, address: PciAddress, mask: BarMask) {
        if let Some(claim) = self.claims().get_mut(&address) {
            for bar in mask.iter() {
                claim.locks.remove(&bar);
            }
        }
        tracing::debug!("Released regions {mask} of {address}");
    }

    fn map_region(
        &self,
        address: PciAddress,
        bar: BarIndex,
        resource: &BarResource,
    ) -> Result<Box<dyn RegisterWindow>> {
        let file = {
            let claims = self.claims();
            let locked = claims
                .get(&address)
                .and_then(|c| c.locks.get(&bar))
                .ok_or_else(|| PciCharError::mapping(address, bar, "region not reserved"))?;
            locked
                .try_clone()
                .map_err(|e| PciCharError::mapping(address, bar, e.to_string()))?
        };

        let len = resource.len();
        let file_len = file
            .metadata()
            .map_err(|e| PciCharError::mapping(address, bar, format!("cannot stat: {e}")))?
            .len();
        if file_len < len {
            return Err(PciCharError::mapping(
                address,
                bar,
                format!("resource file is {file_len:#x} bytes, BAR is {len:#x}"),
            ));
        }

        let window = MmapWindow::new(file, len, address, bar)?;
        Ok(Box::new(window))
    }
}

/// Name of the kernel driver bound to the function in `dir`
fn kernel_driver(dir: &Path) -> Option<String> {
    std::fs::read_link(dir.join("driver"))
        .ok()
        .and_then(|target| target.file_name().map(|n| n.to_string_lossy().to_string()))
}

/// Read a hexadecimal value from sysfs
fn read_hex_sysfs(path: &Path) -> Result<u32> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| PciCharError::config(format!("Cannot read {}: {e}", path.display())))?;

    let trimmed = content.trim().trim_start_matches("0x");

    u32::from_str_radix(trimmed, 16)
        .map_err(|e| PciCharError::config(format!("Invalid hex value in {}: {e}", path.display())))
}
