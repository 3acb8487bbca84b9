//! Endpoint registry
//!
//! Binds endpoint identities to mapped regions. A claimed device gets one
//! identity range (a "major"); each mapped BAR becomes endpoint
//! `major:slot`, named twice:
//!
//! | Name | Example (01:00.1, BAR 3) |
//! |------|--------------------------|
//! | node name | `b1d0f1_bar3` |
//! | namespace path | `pci-char/01:00.01/bar3` |
//!
//! The lookup table sits behind one reader/writer lock. `publish` inserts a
//! device's endpoints and `unpublish` removes them under a single write
//! lock, while `open` resolves an identity and clones its access handle
//! under the read lock. Once `unpublish` returns no new session can reach
//! the device, and every session opened before holds a handle that the
//! following unmap revokes.

use crate::config::DriverConfig;
use crate::error::{PciCharError, Result};
use crate::handle::AccessHandle;
use crate::mapper::BarMap;
use crate::nodes::{DirectoryPublisher, NodePublisher, NullPublisher};
use crate::session::Session;
use pci_char_model::{BarIndex, PciAddress, BAR_COUNT};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Externally visible identity of one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointId {
    /// Identity range of the owning device
    pub major: u32,
    /// BAR slot
    pub minor: u8,
}

impl EndpointId {
    /// Identity `major:minor`
    #[must_use]
    pub const fn new(major: u32, minor: u8) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// Identities reserved for one device, one per BAR slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentityRange {
    major: u32,
}

impl IdentityRange {
    /// Range base
    #[must_use]
    pub const fn major(self) -> u32 {
        self.major
    }

    /// Identity of slot `bar` in this range
    #[must_use]
    pub const fn endpoint(self, bar: BarIndex) -> EndpointId {
        EndpointId::new(self.major, bar.get())
    }
}

impl fmt::Display for IdentityRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:0-{}", self.major, BAR_COUNT - 1)
    }
}

/// Description of one published endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    /// Identity
    pub id: EndpointId,
    /// Owning device
    pub address: PciAddress,
    /// BAR slot
    pub bar: BarIndex,
    /// Window length in bytes
    pub length: u64,
    /// Flat node name
    pub name: String,
    /// Namespace path
    pub path: String,
}

/// A published endpoint
#[derive(Debug)]
pub(crate) struct Endpoint {
    pub(crate) info: EndpointInfo,
    pub(crate) handle: Arc<AccessHandle>,
}

#[derive(Debug, Default)]
struct Table {
    endpoints: BTreeMap<EndpointId, Arc<Endpoint>>,
    paths: HashMap<String, EndpointId>,
    devices: HashMap<u32, PciAddress>,
}

/// Namespace of published endpoints
#[derive(Debug)]
pub struct EndpointRegistry {
    publisher: Box<dyn NodePublisher>,
    identity_base: u32,
    ranges: Mutex<Vec<bool>>,
    table: RwLock<Table>,
}

impl EndpointRegistry {
    /// Registry handing out majors `identity_base..identity_base + max_devices`
    #[must_use]
    pub fn new(publisher: Box<dyn NodePublisher>, identity_base: u32, max_devices: usize) -> Self {
        Self {
            publisher,
            identity_base,
            ranges: Mutex::new(vec![false; max_devices]),
            table: RwLock::new(Table::default()),
        }
    }

    /// Registry sized and published per `config`
    #[must_use]
    pub fn from_config(config: &DriverConfig) -> Self {
        let publisher: Box<dyn NodePublisher> = match &config.node_root {
            Some(root) => Box::new(DirectoryPublisher::new(root)),
            None => Box::new(NullPublisher),
        };
        Self::new(publisher, config.identity_base, config.max_devices)
    }

    /// Number of devices that can be published at once
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.lock_ranges().len()
    }

    /// Number of identity ranges currently allocated
    #[must_use]
    pub fn ranges_in_use(&self) -> usize {
        self.lock_ranges().iter().filter(|used| **used).count()
    }

    /// Allocate an identity range for `map` and publish one endpoint per
    /// mapped region
    ///
    /// If creating endpoint `k` fails, endpoints `0..k` and the range are
    /// released before the error is returned.
    ///
    /// # Errors
    ///
    /// - `IdentityRangeExhausted` if no range is free
    /// - `EndpointCreation` if a node cannot be created
    pub fn publish(&self, map: &BarMap) -> Result<IdentityRange> {
        let range = self.allocate_range()?;
        let address = map.address();

        let mut created: Vec<Arc<Endpoint>> = Vec::new();
        for (bar, region) in map.mapped() {
            let Some(handle) = region.handle() else {
                continue;
            };
            let info = EndpointInfo {
                id: range.endpoint(bar),
                address,
                bar,
                length: region.length(),
                name: address.node_name(bar),
                path: address.endpoint_path(bar),
            };

            if let Err(e) = self.publisher.create(info.id, &info.path) {
                tracing::warn!(
                    "Endpoint {} failed, rolling back {} created",
                    info.path,
                    created.len()
                );
                for endpoint in created.iter().rev() {
                    self.publisher.remove(endpoint.info.id, &endpoint.info.path);
                }
                self.release_range(range);
                return Err(e);
            }

            created.push(Arc::new(Endpoint {
                info,
                handle: Arc::clone(handle),
            }));
        }

        let mut table = self.write_table();
        table.devices.insert(range.major, address);
        for endpoint in created {
            tracing::info!(
                "Published {} as {} ({:#x} bytes)",
                endpoint.info.path,
                endpoint.info.id,
                endpoint.info.length
            );
            table.paths.insert(endpoint.info.path.clone(), endpoint.info.id);
            table.endpoints.insert(endpoint.info.id, endpoint);
        }
        Ok(range)
    }

    /// Withdraw every endpoint of `range`
    ///
    /// After this returns, [`open`](Self::open) cannot reach the device.
    /// The range itself stays allocated until
    /// [`release_range`](Self::release_range).
    pub fn unpublish(&self, range: IdentityRange) {
        let removed: Vec<Arc<Endpoint>> = {
            let mut table = self.write_table();
            table.devices.remove(&range.major);
            let ids: Vec<EndpointId> = table
                .endpoints
                .range(EndpointId::new(range.major, 0)..=EndpointId::new(range.major, u8::MAX))
                .map(|(id, _)| *id)
                .collect();
            let mut removed = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(endpoint) = table.endpoints.remove(&id) {
                    table.paths.remove(&endpoint.info.path);
                    removed.push(endpoint);
                }
            }
            removed
        };

        for endpoint in removed.iter().rev() {
            self.publisher.remove(endpoint.info.id, &endpoint.info.path);
            tracing::info!("Unpublished {}", endpoint.info.path);
        }
    }

    /// Return `range` to the pool
    pub fn release_range(&self, range: IdentityRange) {
        let index = range.major.wrapping_sub(self.identity_base);
        let mut ranges = self.lock_ranges();
        if let Some(slot) = usize::try_from(index).ok().and_then(|i| ranges.get_mut(i)) {
            *slot = false;
            tracing::debug!("Released identity range {range}");
        }
    }

    /// Open a session on endpoint `id`
    ///
    /// # Errors
    ///
    /// - `NoSuchEndpoint` if the slot is outside `0..6` or the range is not
    ///   published
    /// - `RegionNotMapped` if the device is published but the slot has no
    ///   memory BAR
    pub fn open(&self, id: EndpointId) -> Result<Session> {
        let Some(bar) = BarIndex::new(id.minor) else {
            return Err(PciCharError::no_such_endpoint(id));
        };

        let table = self.read_table();
        if let Some(endpoint) = table.endpoints.get(&id) {
            return Ok(Session::new(Arc::clone(endpoint)));
        }
        match table.devices.get(&id.major) {
            Some(&address) => Err(PciCharError::RegionNotMapped { address, bar }),
            None => Err(PciCharError::no_such_endpoint(id)),
        }
    }

    /// Open a session by namespace path, e.g. `pci-char/01:00.01/bar3`
    ///
    /// # Errors
    ///
    /// Returns `NoSuchEndpoint` if no endpoint is published at `path`.
    pub fn open_path(&self, path: &str) -> Result<Session> {
        let table = self.read_table();
        let endpoint = table
            .paths
            .get(path)
            .and_then(|id| table.endpoints.get(id))
            .ok_or_else(|| PciCharError::no_such_endpoint(path))?;
        Ok(Session::new(Arc::clone(endpoint)))
    }

    /// Description of endpoint `id`, if published
    #[must_use]
    pub fn lookup(&self, id: EndpointId) -> Option<EndpointInfo> {
        self.read_table().endpoints.get(&id).map(|e| e.info.clone())
    }

    /// All published endpoints, ordered by identity
    #[must_use]
    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        self.read_table()
            .endpoints
            .values()
            .map(|e| e.info.clone())
            .collect()
    }

    fn allocate_range(&self) -> Result<IdentityRange> {
        let mut ranges = self.lock_ranges();
        let capacity = ranges.len();
        let (index, slot) = ranges
            .iter_mut()
            .enumerate()
            .find(|(_, used)| !**used)
            .ok_or(PciCharError::IdentityRangeExhausted { capacity })?;

        let major = u32::try_from(index)
            .ok()
            .and_then(|i| self.identity_base.checked_add(i))
            .ok_or(PciCharError::IdentityRangeExhausted { capacity })?;
        *slot = true;

        let range = IdentityRange { major };
        tracing::debug!("Allocated identity range {range}");
        Ok(range)
    }

    fn lock_ranges(&self) -> std::sync::MutexGuard<'_, Vec<bool>> {
        self.ranges.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_table(&self) -> std::sync::RwLockReadGuard<'_, Table> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_table(&self) -> std::sync::RwLockWriteGuard<'_, Table> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }
}
