//! Dynamic device IDs.
//!
//! The driver has no static ID table. Devices are claimed only through IDs
//! supplied at startup (comma-separated list) or at runtime, in the same
//! format the kernel accepts for `new_id`:
//!
//! ```text
//! vendor:device[:subvendor[:subdevice[:class[:class_mask]]]]
//! 10ee:7014
//! 10ee:7014:ffffffff:ffffffff:058000:ffff00
//! ```

use crate::error::ParseError;
use std::fmt;
use std::str::FromStr;

/// Wildcard for vendor/device/subvendor/subdevice fields.
pub const PCI_ANY_ID: u32 = 0xffff_ffff;

/// Identification registers of one function, as read from config space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceIds {
    /// Vendor ID.
    pub vendor: u16,
    /// Device ID.
    pub device: u16,
    /// Subsystem vendor ID.
    pub subvendor: u16,
    /// Subsystem device ID.
    pub subdevice: u16,
    /// 24-bit class code (base, sub, prog-if).
    pub class: u32,
}

impl DeviceIds {
    /// IDs with zeroed subsystem and class fields.
    #[must_use]
    pub const fn new(vendor: u16, device: u16) -> Self {
        Self {
            vendor,
            device,
            subvendor: 0,
            subdevice: 0,
            class: 0,
        }
    }
}

impl fmt::Display for DeviceIds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.device)
    }
}

/// One dynamic ID entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciId {
    /// Vendor ID or [`PCI_ANY_ID`].
    pub vendor: u32,
    /// Device ID or [`PCI_ANY_ID`].
    pub device: u32,
    /// Subsystem vendor ID or [`PCI_ANY_ID`].
    pub subvendor: u32,
    /// Subsystem device ID or [`PCI_ANY_ID`].
    pub subdevice: u32,
    /// Class code to compare after masking.
    pub class: u32,
    /// Mask applied to the device's class code.
    pub class_mask: u32,
}

impl PciId {
    /// Match exactly `vendor:device`, any subsystem, any class.
    #[must_use]
    pub const fn new(vendor: u16, device: u16) -> Self {
        Self {
            vendor: vendor as u32,
            device: device as u32,
            subvendor: PCI_ANY_ID,
            subdevice: PCI_ANY_ID,
            class: 0,
            class_mask: 0,
        }
    }

    /// Whether `ids` is claimed by this entry.
    #[must_use]
    pub const fn matches(&self, ids: &DeviceIds) -> bool {
        const fn field(want: u32, have: u16) -> bool {
            want == PCI_ANY_ID || want == have as u32
        }

        field(self.vendor, ids.vendor)
            && field(self.device, ids.device)
            && field(self.subvendor, ids.subvendor)
            && field(self.subdevice, ids.subdevice)
            && (ids.class & self.class_mask) == self.class
    }

    /// Parse a comma-separated list, splitting good entries from bad ones.
    ///
    /// Empty entries are skipped silently. Malformed entries are returned
    /// alongside the parsed IDs so the caller can report them and carry on.
    #[must_use]
    pub fn parse_list(list: &str) -> (Vec<Self>, Vec<ParseError>) {
        let mut ids = Vec::new();
        let mut rejected = Vec::new();
        for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            match entry.parse() {
                Ok(id) => ids.push(id),
                Err(e) => rejected.push(e),
            }
        }
        (ids, rejected)
    }
}

impl fmt::Display for PciId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04X}:{:04X} sub={:04X}:{:04X} cls={:08X}/{:08X}",
            self.vendor, self.device, self.subvendor, self.subdevice, self.class, self.class_mask
        )
    }
}

impl FromStr for PciId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields = s
            .trim()
            .split(':')
            .map(|field| {
                u32::from_str_radix(field.trim_start_matches("0x"), 16)
                    .map_err(|e| ParseError::new("id", s, e.to_string()))
            })
            .collect::<Result<Vec<u32>, _>>()?;

        match fields.as_slice() {
            [vendor, device, rest @ ..] if rest.len() <= 4 => {
                let field = |i: usize, default: u32| rest.get(i).copied().unwrap_or(default);
                Ok(Self {
                    vendor: *vendor,
                    device: *device,
                    subvendor: field(0, PCI_ANY_ID),
                    subdevice: field(1, PCI_ANY_ID),
                    class: field(2, 0),
                    class_mask: field(3, 0),
                })
            }
            [_, _, ..] => Err(ParseError::new("id", s, "at most 6 fields")),
            _ => Err(ParseError::new("id", s, "need at least vendor:device")),
        }
    }
}
