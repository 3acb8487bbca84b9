//! Driver configuration
//!
//! Values come from [`DriverConfig::default`], then environment variables,
//! then (in the CLI) command-line flags:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `PCI_CHAR_IDS` | `ids` (comma-separated `vendor:device[:...]` list) |
//! | `PCI_CHAR_SYSFS_ROOT` | `sysfs_root` |
//! | `PCI_CHAR_NODE_ROOT` | `node_root` |
//! | `PCI_CHAR_MAX_DEVICES` | `max_devices` |

use crate::error::{PciCharError, Result};
use crate::sysfs::DEFAULT_SYSFS_ROOT;
use std::path::PathBuf;

/// Environment variable holding the initial dynamic ID list
pub const ENV_IDS: &str = "PCI_CHAR_IDS";
/// Environment variable overriding the sysfs root
pub const ENV_SYSFS_ROOT: &str = "PCI_CHAR_SYSFS_ROOT";
/// Environment variable enabling node publishing under a directory
pub const ENV_NODE_ROOT: &str = "PCI_CHAR_NODE_ROOT";
/// Environment variable sizing the identity pool
pub const ENV_MAX_DEVICES: &str = "PCI_CHAR_MAX_DEVICES";

/// First identity range handed out
pub const DEFAULT_IDENTITY_BASE: u32 = 240;
/// Default number of devices that can be bound at once
pub const DEFAULT_MAX_DEVICES: usize = 16;

/// Configuration for [`PciCharDriver`](crate::PciCharDriver)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Dynamic IDs added at init, comma-separated
    pub ids: String,
    /// Directory holding one entry per PCI function
    pub sysfs_root: PathBuf,
    /// Where endpoint nodes are created; `None` keeps them in-process
    pub node_root: Option<PathBuf>,
    /// First identity range value
    pub identity_base: u32,
    /// Size of the identity pool
    pub max_devices: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            ids: String::new(),
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
            node_root: None,
            identity_base: DEFAULT_IDENTITY_BASE,
            max_devices: DEFAULT_MAX_DEVICES,
        }
    }
}

impl DriverConfig {
    /// Defaults overridden by `PCI_CHAR_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns `Config` if `PCI_CHAR_MAX_DEVICES` is not a positive integer.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source
    ///
    /// # Errors
    ///
    /// Returns `Config` if the device limit is not a positive integer.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(ids) = lookup(ENV_IDS) {
            config.ids = ids;
        }
        if let Some(root) = lookup(ENV_SYSFS_ROOT) {
            config.sysfs_root = PathBuf::from(root);
        }
        if let Some(root) = lookup(ENV_NODE_ROOT).filter(|r| !r.is_empty()) {
            config.node_root = Some(PathBuf::from(root));
        }
        if let Some(max) = lookup(ENV_MAX_DEVICES) {
            config.max_devices = max
                .trim()
                .parse()
                .map_err(|e| PciCharError::config(format!("{ENV_MAX_DEVICES}={max:?}: {e}")))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `Config` for an empty identity pool or one that overflows.
    pub fn validate(&self) -> Result<()> {
        if self.max_devices == 0 {
            return Err(PciCharError::config("max_devices must be at least 1"));
        }
        let fits = u32::try_from(self.max_devices)
            .ok()
            .and_then(|n| self.identity_base.checked_add(n))
            .is_some();
        if !fits {
            return Err(PciCharError::config(format!(
                "identity pool {}+{} overflows",
                self.identity_base, self.max_devices
            )));
        }
        Ok(())
    }
}
