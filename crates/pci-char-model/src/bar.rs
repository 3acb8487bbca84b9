//! BAR slots and the sysfs `resource` table.
//!
//! Linux exposes the resources of a PCI function in
//! `/sys/bus/pci/devices/{addr}/resource`, one line per resource:
//!
//! ```text
//! line  start              end                flags
//! ────  ────────────────── ────────────────── ──────────────────
//!  0    0x00000000f7000000 0x00000000f7000fff 0x0000000000040200   BAR0, 4 KB MMIO
//!  1    0x000000000000e000 0x000000000000e07f 0x0000000000040101   BAR1, I/O ports
//!  2    0x0000000000000000 0x0000000000000000 0x0000000000000000   empty
//!  ...
//!  6    expansion ROM, 7..  bridge windows (ignored)
//! ```
//!
//! Only the first [`BAR_COUNT`] lines are BARs. A slot is usable as an
//! endpoint only when its flags carry [`flags::IORESOURCE_MEM`].

use crate::error::ParseError;
use std::fmt;

/// Number of BAR slots in a type 0 configuration header.
pub const BAR_COUNT: usize = 6;

/// Resource flag bits (`include/linux/ioport.h`).
pub mod flags {
    /// I/O port space.
    pub const IORESOURCE_IO: u64 = 0x0000_0100;
    /// Memory space.
    pub const IORESOURCE_MEM: u64 = 0x0000_0200;
    /// Prefetchable memory.
    pub const IORESOURCE_PREFETCH: u64 = 0x0000_2000;
    /// 64-bit memory BAR.
    pub const IORESOURCE_MEM_64: u64 = 0x0010_0000;
}

/// Index of a BAR slot, always in `0..6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BarIndex(u8);

impl BarIndex {
    /// Create a slot index, `None` if `index >= 6`.
    #[must_use]
    pub const fn new(index: u8) -> Option<Self> {
        if (index as usize) < BAR_COUNT {
            Some(Self(index))
        } else {
            None
        }
    }

    /// All six slots in ascending order.
    pub fn all() -> impl DoubleEndedIterator<Item = Self> {
        (0..BAR_COUNT as u8).map(Self)
    }

    /// Slot number.
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Slot number as an array index.
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BarIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bar{}", self.0)
    }
}

/// Set of BAR slots, bit `n` for slot `n` (the `pci_select_bars` mask).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct BarMask(u8);

impl BarMask {
    /// The empty set.
    pub const EMPTY: Self = Self(0);

    /// Build from raw bits; bits above slot 5 are dropped.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0x3f)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether `bar` is in the set.
    #[must_use]
    pub const fn contains(self, bar: BarIndex) -> bool {
        self.0 & (1 << bar.0) != 0
    }

    /// Add `bar` to the set.
    #[must_use]
    pub const fn with(self, bar: BarIndex) -> Self {
        Self(self.0 | (1 << bar.0))
    }

    /// Whether the set is empty.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of slots in the set.
    #[must_use]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Slots in the set, ascending.
    pub fn iter(self) -> impl DoubleEndedIterator<Item = BarIndex> {
        BarIndex::all().filter(move |bar| self.contains(*bar))
    }
}

impl fmt::Display for BarMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// What a BAR slot decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarKind {
    /// Slot not implemented or not assigned.
    Empty,
    /// I/O port space. Never mapped.
    Io,
    /// Memory space, mappable for register access.
    Memory,
}

/// One resource line: physical range and flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BarResource {
    /// First physical address.
    pub start: u64,
    /// Last physical address (inclusive).
    pub end: u64,
    /// `IORESOURCE_*` flags.
    pub flags: u64,
}

impl BarResource {
    /// An empty slot.
    pub const EMPTY: Self = Self {
        start: 0,
        end: 0,
        flags: 0,
    };

    /// A memory BAR of `len` bytes at `start`.
    #[must_use]
    pub const fn memory(start: u64, len: u64) -> Self {
        if len == 0 {
            return Self::EMPTY;
        }
        Self {
            start,
            end: start.saturating_add(len - 1),
            flags: flags::IORESOURCE_MEM,
        }
    }

    /// An I/O port BAR of `len` bytes at `start`.
    #[must_use]
    pub const fn io(start: u64, len: u64) -> Self {
        if len == 0 {
            return Self::EMPTY;
        }
        Self {
            start,
            end: start.saturating_add(len - 1),
            flags: flags::IORESOURCE_IO,
        }
    }

    /// Parse one `start end flags` line (hex, `0x` prefix optional).
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] if the line does not hold three hex fields,
    /// if `end < start` on a non-empty line, or if the range spans the whole
    /// 64-bit address space.
    pub fn parse_line(line: &str) -> Result<Self, ParseError> {
        let mut fields = line.split_whitespace().map(|field| {
            u64::from_str_radix(field.trim_start_matches("0x"), 16)
                .map_err(|e| ParseError::new("resource", line, e.to_string()))
        });

        let mut next = || {
            fields
                .next()
                .unwrap_or_else(|| Err(ParseError::new("resource", line, "expected 3 fields")))
        };
        let start = next()?;
        let end = next()?;
        let flags = next()?;

        let resource = Self { start, end, flags };
        if !resource.is_unassigned() && end < start {
            return Err(ParseError::new("resource", line, "end precedes start"));
        }
        if (end - start).checked_add(1).is_none() {
            return Err(ParseError::new("resource", line, "range spans the address space"));
        }
        Ok(resource)
    }

    const fn is_unassigned(&self) -> bool {
        self.start == 0 && self.end == 0
    }

    /// Length in bytes, 0 for an empty slot.
    #[must_use]
    pub const fn len(&self) -> u64 {
        if self.is_unassigned() {
            0
        } else {
            self.end.saturating_sub(self.start).saturating_add(1)
        }
    }

    /// Whether the slot spans no bytes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Classify the slot.
    #[must_use]
    pub const fn kind(&self) -> BarKind {
        if self.is_empty() {
            BarKind::Empty
        } else if self.flags & flags::IORESOURCE_MEM != 0 {
            BarKind::Memory
        } else if self.flags & flags::IORESOURCE_IO != 0 {
            BarKind::Io
        } else {
            BarKind::Empty
        }
    }

    /// Whether the BAR is prefetchable memory.
    #[must_use]
    pub const fn is_prefetchable(&self) -> bool {
        self.flags & flags::IORESOURCE_PREFETCH != 0
    }

    /// Whether the BAR is a 64-bit memory BAR.
    #[must_use]
    pub const fn is_64bit(&self) -> bool {
        self.flags & flags::IORESOURCE_MEM_64 != 0
    }
}

/// The six BAR resources of one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceTable([BarResource; BAR_COUNT]);

impl ResourceTable {
    /// Build from explicit slots.
    #[must_use]
    pub const fn new(slots: [BarResource; BAR_COUNT]) -> Self {
        Self(slots)
    }

    /// Parse the contents of a sysfs `resource` file.
    ///
    /// Lines past the sixth (expansion ROM, bridge windows) are ignored;
    /// missing lines are treated as empty slots.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] if any of the first six lines is malformed.
    pub fn parse(content: &str) -> Result<Self, ParseError> {
        let mut slots = [BarResource::EMPTY; BAR_COUNT];
        for (slot, line) in slots
            .iter_mut()
            .zip(content.lines().filter(|l| !l.trim().is_empty()))
        {
            *slot = BarResource::parse_line(line)?;
        }
        Ok(Self(slots))
    }

    /// Resource of `bar`.
    #[must_use]
    pub const fn get(&self, bar: BarIndex) -> &BarResource {
        &self.0[bar.as_usize()]
    }

    /// Slots holding memory-space BARs (`pci_select_bars(dev, IORESOURCE_MEM)`).
    #[must_use]
    pub fn memory_bars(&self) -> BarMask {
        BarIndex::all()
            .filter(|bar| self.get(*bar).kind() == BarKind::Memory)
            .fold(BarMask::EMPTY, BarMask::with)
    }

    /// Iterate `(slot, resource)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (BarIndex, &BarResource)> {
        BarIndex::all().zip(self.0.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
0x00000000f7000000 0x00000000f7000fff 0x0000000000040200
0x000000000000e000 0x000000000000e07f 0x0000000000040101
0x0000000000000000 0x0000000000000000 0x0000000000000000
0x00000000f6000000 0x00000000f60000ff 0x0000000000140204
0x0000000000000000 0x0000000000000000 0x0000000000000000
0x0000000000000000 0x0000000000000000 0x0000000000000000
0x00000000f7100000 0x00000000f717ffff 0x0000000000046200
";

    #[test]
    fn test_parse_resource_table() {
        let table = ResourceTable::parse(SAMPLE).unwrap();
        let bar0 = table.get(BarIndex::new(0).unwrap());
        assert_eq!(bar0.len(), 4096);
        assert_eq!(bar0.kind(), BarKind::Memory);

        let bar1 = table.get(BarIndex::new(1).unwrap());
        assert_eq!(bar1.kind(), BarKind::Io);

        let bar3 = table.get(BarIndex::new(3).unwrap());
        assert_eq!(bar3.len(), 256);
        assert!(bar3.is_64bit());
        assert!(!bar3.is_prefetchable());

        assert_eq!(table.get(BarIndex::new(2).unwrap()).kind(), BarKind::Empty);
        assert_eq!(table.memory_bars(), BarMask::from_bits(0b1001));
    }

    #[test]
    fn test_short_table_fills_empty() {
        let table = ResourceTable::parse("0x1000 0x1fff 0x200\n").unwrap();
        assert_eq!(table.memory_bars().count(), 1);
        assert!(table.get(BarIndex::new(5).unwrap()).is_empty());
    }

    #[test]
    fn test_malformed_line() {
        assert!(BarResource::parse_line("0x1000 zz 0x200").is_err());
        assert!(BarResource::parse_line("0x1000 0x2000").is_err());
        assert!(BarResource::parse_line("0x2000 0x1000 0x200").is_err());
    }

    #[test]
    fn test_full_address_space_range_rejected() {
        let err = ResourceTable::parse("0x0 0xffffffffffffffff 0x200\n").unwrap_err();
        assert_eq!(err.what(), "resource");

        // Built directly, the length saturates instead of overflowing.
        let full = BarResource {
            start: 0,
            end: u64::MAX,
            flags: flags::IORESOURCE_MEM,
        };
        assert_eq!(full.len(), u64::MAX);
    }

    #[test]
    fn test_zero_length_constructors_are_empty() {
        assert_eq!(BarResource::memory(0xf000_0000, 0), BarResource::EMPTY);
        assert_eq!(BarResource::io(0x1000, 0).kind(), BarKind::Empty);
        assert_eq!(BarResource::memory(0xf000_0000, 256).len(), 256);
    }

    #[test]
    fn test_bar_index_bounds() {
        assert!(BarIndex::new(5).is_some());
        assert!(BarIndex::new(6).is_none());
        assert_eq!(BarIndex::all().count(), BAR_COUNT);
        assert_eq!(BarIndex::new(3).unwrap().to_string(), "bar3");
    }

    #[test]
    fn test_mask_iteration() {
        let mask = BarMask::from_bits(0xff);
        assert_eq!(mask.bits(), 0x3f);
        let slots: Vec<u8> = BarMask::from_bits(0b10_0101).iter().map(BarIndex::get).collect();
        assert_eq!(slots, vec![0, 2, 5]);
        let reversed: Vec<u8> = BarMask::from_bits(0b10_0101)
            .iter()
            .rev()
            .map(BarIndex::get)
            .collect();
        assert_eq!(reversed, vec![5, 2, 0]);
    }
}
