//! PCI function addresses and the endpoint names derived from them.

use crate::bar::BarIndex;
use crate::error::ParseError;
use std::fmt;
use std::str::FromStr;

/// Namespace directory under which endpoint nodes are published.
pub const NAMESPACE: &str = "pci-char";

/// Address of one PCI function: `domain:bus:slot.function`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciAddress {
    /// PCI segment / domain.
    pub domain: u16,
    /// Bus number.
    pub bus: u8,
    /// Device (slot) number, `0..32`.
    pub slot: u8,
    /// Function number, `0..8`.
    pub function: u8,
}

impl PciAddress {
    /// Build an address in domain 0.
    ///
    /// Returns `None` if `slot >= 32` or `function >= 8`.
    #[must_use]
    pub const fn new(bus: u8, slot: u8, function: u8) -> Option<Self> {
        Self::with_domain(0, bus, slot, function)
    }

    /// Build an address in an explicit domain.
    #[must_use]
    pub const fn with_domain(domain: u16, bus: u8, slot: u8, function: u8) -> Option<Self> {
        if slot < 32 && function < 8 {
            Some(Self {
                domain,
                bus,
                slot,
                function,
            })
        } else {
            None
        }
    }

    /// Encoded device/function byte (`PCI_DEVFN`).
    #[must_use]
    pub const fn devfn(&self) -> u8 {
        (self.slot << 3) | self.function
    }

    /// Node name of one BAR endpoint, e.g. `b1d0f1_bar3`.
    #[must_use]
    pub fn node_name(&self, bar: BarIndex) -> String {
        format!(
            "b{:x}d{:x}f{:x}_bar{}",
            self.bus,
            self.slot,
            self.function,
            bar.get()
        )
    }

    /// Namespace path of one BAR endpoint, e.g. `pci-char/01:00.01/bar3`.
    #[must_use]
    pub fn endpoint_path(&self, bar: BarIndex) -> String {
        format!(
            "{NAMESPACE}/{:02x}:{:02x}.{:02x}/bar{}",
            self.bus,
            self.slot,
            self.function,
            bar.get()
        )
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.slot, self.function
        )
    }
}

impl FromStr for PciAddress {
    type Err = ParseError;

    /// Accepts `DDDD:BB:SS.F` and the short form `BB:SS.F` (domain 0).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason: &str| ParseError::new("address", s, reason);
        let hex_u8 = |field: &str| {
            u8::from_str_radix(field, 16).map_err(|e| ParseError::new("address", s, e.to_string()))
        };

        let (head, function) = s.trim().rsplit_once('.').ok_or_else(|| err("missing '.'"))?;
        let parts: Vec<&str> = head.split(':').collect();
        let (domain, bus, slot) = match parts.as_slice() {
            [bus, slot] => (0, *bus, *slot),
            [domain, bus, slot] => (
                u16::from_str_radix(domain, 16)
                    .map_err(|e| ParseError::new("address", s, e.to_string()))?,
                *bus,
                *slot,
            ),
            _ => return Err(err("expected [domain:]bus:slot.function")),
        };

        Self::with_domain(domain, hex_u8(bus)?, hex_u8(slot)?, hex_u8(function)?)
            .ok_or_else(|| err("slot or function out of range"))
    }
}
