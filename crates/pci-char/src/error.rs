//! Error types for pci-char operations

use pci_char_model::{BarIndex, ParseError, PciAddress};
use thiserror::Error;

/// Result type alias for pci-char operations
pub type Result<T> = std::result::Result<T, PciCharError>;

/// Errors that can occur while claiming devices or accessing endpoints
#[derive(Debug, Error)]
pub enum PciCharError {
    /// The bus could not activate the device for memory-space decoding
    #[error("Cannot enable {address}: {reason}")]
    DeviceEnable {
        /// Device that failed to enable
        address: PciAddress,
        /// Reason for failure
        reason: String,
    },

    /// A memory BAR is already owned by someone else
    #[error("BAR regions of {address} already claimed: {reason}")]
    RegionConflict {
        /// Device whose regions are taken
        address: PciAddress,
        /// Who holds them, if known
        reason: String,
    },

    /// A BAR could not be mapped
    #[error("Cannot map {bar} of {address}: {reason}")]
    Mapping {
        /// Device being mapped
        address: PciAddress,
        /// Slot that failed
        bar: BarIndex,
        /// Reason for failure
        reason: String,
    },

    /// No endpoint identity range is free
    #[error("Endpoint identity ranges exhausted ({capacity} in use)")]
    IdentityRangeExhausted {
        /// Size of the identity pool
        capacity: usize,
    },

    /// An endpoint node could not be created
    #[error("Cannot create endpoint {path}: {reason}")]
    EndpointCreation {
        /// Namespace path of the endpoint
        path: String,
        /// Reason for failure
        reason: String,
    },

    /// The endpoint identity does not name a published endpoint
    #[error("No such endpoint: {endpoint}")]
    NoSuchEndpoint {
        /// Identity or path that was looked up
        endpoint: String,
    },

    /// The BAR behind the endpoint is absent or not memory space
    #[error("{bar} of {address} is not mapped")]
    RegionNotMapped {
        /// Device owning the slot
        address: PciAddress,
        /// Slot without a mapping
        bar: BarIndex,
    },

    /// Seek target is unaligned or outside the window
    #[error("Invalid seek to {position} (window length {length:#x})")]
    InvalidSeek {
        /// Requested position
        position: i128,
        /// Window length
        length: u64,
    },

    /// Transfer size is not a whole number of 32-bit words
    #[error("Invalid transfer size {size}: must be a multiple of 4")]
    InvalidSize {
        /// Requested size in bytes
        size: usize,
    },

    /// No word of the transfer could be moved
    #[error("Transfer fault at offset {offset:#x}: {reason}")]
    Fault {
        /// Cursor position of the failing word
        offset: u64,
        /// Reason for failure
        reason: String,
    },

    /// The mapping was torn down by a concurrent removal
    #[error("Access handle for {bar} is stale (device removed)")]
    StaleHandle {
        /// Slot whose mapping is gone
        bar: BarIndex,
    },

    /// Transfer cancelled before the first word
    #[error("Transfer interrupted at offset {offset:#x}")]
    Interrupted {
        /// Cursor position when cancelled
        offset: u64,
    },

    /// Probe requested for a device that is already claimed or being claimed
    #[error("Device {address} is already bound ({state})")]
    AlreadyBound {
        /// Device address
        address: PciAddress,
        /// Current lifecycle state
        state: String,
    },

    /// Remove requested for a device that is not active
    #[error("Device {address} is not bound")]
    NotBound {
        /// Device address
        address: PciAddress,
    },

    /// Malformed dynamic ID, address, or resource table
    #[error("Parse error: {source}")]
    Parse {
        /// Underlying parse error
        #[from]
        source: ParseError,
    },

    /// Invalid configuration value
    #[error("Configuration error: {reason}")]
    Config {
        /// Reason for failure
        reason: String,
    },

    /// I/O error while talking to sysfs or the node directory
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl PciCharError {
    /// Create a device enable error
    pub fn device_enable(address: PciAddress, reason: impl Into<String>) -> Self {
        Self::DeviceEnable {
            address,
            reason: reason.into(),
        }
    }

    /// Create a region conflict error
    pub fn region_conflict(address: PciAddress, reason: impl Into<String>) -> Self {
        Self::RegionConflict {
            address,
            reason: reason.into(),
        }
    }

    /// Create a mapping error
    pub fn mapping(address: PciAddress, bar: BarIndex, reason: impl Into<String>) -> Self {
        Self::Mapping {
            address,
            bar,
            reason: reason.into(),
        }
    }

    /// Create an endpoint creation error
    pub fn endpoint_creation(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::EndpointCreation {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a no such endpoint error
    pub fn no_such_endpoint(endpoint: impl ToString) -> Self {
        Self::NoSuchEndpoint {
            endpoint: endpoint.to_string(),
        }
    }

    /// Create a transfer fault error
    pub fn fault(offset: u64, reason: impl Into<String>) -> Self {
        Self::Fault {
            offset,
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Whether the error means the endpoint's device has gone away
    #[must_use]
    pub const fn is_stale(&self) -> bool {
        matches!(self, Self::StaleHandle { .. })
    }
}
