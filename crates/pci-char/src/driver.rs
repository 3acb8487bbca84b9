//! Binding authority
//!
//! Decides which functions the driver claims. Functions are matched against
//! a list of dynamic IDs, given at init time or added one at a time:
//!
//! ```text
//! vendor:device[:subvendor[:subdevice[:class[:class_mask]]]]
//! ```
//!
//! Adding an ID probes every matching function that no driver owns yet.
//! `bind`/`unbind` claim and release single functions explicitly.

use crate::bus::PciBus;
use crate::config::DriverConfig;
use crate::error::Result;
use crate::lifecycle::{Controller, DeviceState};
use crate::registry::{EndpointId, EndpointRegistry, IdentityRange};
use crate::session::Session;
use pci_char_model::{PciAddress, PciId};
use std::sync::{Arc, Mutex, PoisonError};

/// A running driver instance
#[derive(Debug)]
pub struct PciCharDriver<B: PciBus> {
    controller: Controller<B>,
    ids: Mutex<Vec<PciId>>,
}

impl<B: PciBus> PciCharDriver<B> {
    /// Start the driver on `bus` and add every ID in `config.ids`
    ///
    /// Malformed ID entries are logged and skipped; a probe that fails
    /// leaves its device unbound without failing init.
    ///
    /// # Errors
    ///
    /// Returns `Config` if `config` is invalid.
    pub fn init(bus: Arc<B>, config: &DriverConfig) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(EndpointRegistry::from_config(config));
        let driver = Self {
            controller: Controller::new(bus, registry),
            ids: Mutex::new(Vec::new()),
        };

        let (ids, errors) = PciId::parse_list(&config.ids);
        for e in errors {
            tracing::warn!("Ignoring {e}");
        }
        for id in ids {
            driver.add_id(id);
        }

        tracing::info!(
            "pci-char ready: {} IDs, {} devices bound",
            driver.ids().len(),
            driver.controller.active_devices().len()
        );
        Ok(driver)
    }

    /// Parse and add one dynamic ID, probing matching functions
    ///
    /// Returns the functions that were bound.
    ///
    /// # Errors
    ///
    /// Returns `Parse` for a malformed ID.
    pub fn new_id(&self, id: &str) -> Result<Vec<PciAddress>> {
        let id: PciId = id.trim().parse()?;
        Ok(self.add_id(id))
    }

    fn add_id(&self, id: PciId) -> Vec<PciAddress> {
        {
            let mut ids = self.lock_ids();
            if ids.contains(&id) {
                tracing::debug!("ID {id} already registered");
            } else {
                tracing::info!("Added ID {id}");
                ids.push(id);
            }
        }

        let devices = match self.controller.bus().devices() {
            Ok(devices) => devices,
            Err(e) => {
                tracing::warn!("Cannot scan bus for {id}: {e}");
                return Vec::new();
            }
        };

        let mut bound = Vec::new();
        for dev in devices.iter().filter(|d| id.matches(&d.ids)) {
            if let Some(driver) = &dev.kernel_driver {
                tracing::debug!("{} owned by {driver}, skipped", dev.address);
                continue;
            }
            if self.controller.state(dev.address) != DeviceState::Unbound {
                continue;
            }
            match self.controller.probe(dev.address) {
                Ok(_) => bound.push(dev.address),
                Err(e) => tracing::warn!("Cannot bind {}: {e}", dev.address),
            }
        }
        bound
    }

    /// Explicitly claim `address`
    ///
    /// # Errors
    ///
    /// Returns `AlreadyBound` or any probe error.
    pub fn bind(&self, address: PciAddress) -> Result<IdentityRange> {
        self.controller.probe(address)
    }

    /// Explicitly release `address`
    ///
    /// # Errors
    ///
    /// Returns `NotBound` unless the device is active.
    pub fn unbind(&self, address: PciAddress) -> Result<()> {
        self.controller.remove(address)
    }

    /// Registered dynamic IDs
    pub fn ids(&self) -> Vec<PciId> {
        self.lock_ids().clone()
    }

    /// Lifecycle controller
    pub const fn controller(&self) -> &Controller<B> {
        &self.controller
    }

    /// Endpoint registry
    pub fn registry(&self) -> &EndpointRegistry {
        self.controller.registry()
    }

    /// Open an endpoint by identity
    ///
    /// # Errors
    ///
    /// See [`EndpointRegistry::open`].
    pub fn open(&self, id: EndpointId) -> Result<Session> {
        self.registry().open(id)
    }

    /// Open an endpoint by namespace path
    ///
    /// # Errors
    ///
    /// See [`EndpointRegistry::open_path`].
    pub fn open_path(&self, path: &str) -> Result<Session> {
        self.registry().open_path(path)
    }

    /// Release every device and forget all IDs
    pub fn shutdown(&self) {
        self.controller.shutdown();
        self.lock_ids().clear();
    }

    fn lock_ids(&self) -> std::sync::MutexGuard<'_, Vec<PciId>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<B: PciBus> Drop for PciCharDriver<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
