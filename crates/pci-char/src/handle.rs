//! Revocable access handles
//!
//! An [`AccessHandle`] owns the [`RegisterWindow`] of one mapped BAR. Sessions
//! and the device instance share it through an `Arc`; the mapping itself
//! lives behind a reader/writer lock:
//!
//! ```text
//!  Session A ──┐                         ┌── read lock held for one transfer
//!  Session B ──┼──▶ Arc<AccessHandle> ───┤
//!  Instance  ──┘     RwLock<Option<W>>   └── revoke(): write lock, drop W (munmap)
//! ```
//!
//! `revoke` waits for in-flight transfers to finish, then unmaps. Any later
//! transfer sees `None` and fails with `StaleHandle`, so no access can reach
//! an unmapped window.

use crate::bus::RegisterWindow;
use crate::error::{PciCharError, Result};
use pci_char_model::BarIndex;
use std::sync::{PoisonError, RwLock, RwLockReadGuard};

/// Width of every register access
pub const WORD: u64 = 4;

/// Shared, revocable reference to one mapped BAR
#[derive(Debug)]
pub struct AccessHandle {
    bar: BarIndex,
    len: u64,
    window: RwLock<Option<Box<dyn RegisterWindow>>>,
}

impl AccessHandle {
    /// Wrap a freshly mapped window
    #[must_use]
    pub fn new(bar: BarIndex, window: Box<dyn RegisterWindow>) -> Self {
        Self {
            bar,
            len: window.len(),
            window: RwLock::new(Some(window)),
        }
    }

    /// Slot this handle maps
    #[must_use]
    pub const fn bar(&self) -> BarIndex {
        self.bar
    }

    /// Length of the window in bytes, fixed at creation
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    /// Whether the window spans no bytes
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the mapping is still present
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.window
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Begin a transfer, pinning the mapping until the guard is dropped
    ///
    /// # Errors
    ///
    /// Returns `StaleHandle` if the handle has been revoked.
    pub fn transfer(&self) -> Result<Transfer<'_>> {
        let guard = self.window.read().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            return Err(PciCharError::StaleHandle { bar: self.bar });
        }
        Ok(Transfer {
            handle: self,
            guard,
        })
    }

    /// Unmap the window
    ///
    /// Blocks until in-flight transfers complete. Returns `false` if the
    /// handle was already revoked.
    pub fn revoke(&self) -> bool {
        let window = self
            .window
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        // Dropping the window outside the lock releases the mapping.
        window.is_some()
    }
}

/// A pinned mapping, valid for the duration of one transfer call
#[derive(Debug)]
pub struct Transfer<'a> {
    handle: &'a AccessHandle,
    guard: RwLockReadGuard<'a, Option<Box<dyn RegisterWindow>>>,
}

impl Transfer<'_> {
    fn window(&self, offset: u64) -> Result<&dyn RegisterWindow> {
        if offset % WORD != 0 {
            return Err(PciCharError::fault(offset, "unaligned register access"));
        }
        if offset.checked_add(WORD).map_or(true, |end| end > self.handle.len) {
            return Err(PciCharError::fault(
                offset,
                format!("beyond end of window ({:#x} bytes)", self.handle.len),
            ));
        }
        self.guard
            .as_deref()
            .ok_or(PciCharError::StaleHandle {
                bar: self.handle.bar,
            })
    }

    /// Read one word at `offset`
    ///
    /// # Errors
    ///
    /// Returns `Fault` if `offset` is unaligned or the word lies outside the
    /// window.
    pub fn read_u32(&self, offset: u64) -> Result<u32> {
        self.window(offset)?.read_u32(offset)
    }

    /// Write one word at `offset`
    ///
    /// # Errors
    ///
    /// Returns `Fault` if `offset` is unaligned or the word lies outside the
    /// window.
    pub fn write_u32(&self, offset: u64, value: u32) -> Result<()> {
        self.window(offset)?.write_u32(offset, value)
    }

    /// Whether a full word fits at `offset`
    #[must_use]
    pub fn fits(&self, offset: u64) -> bool {
        offset
            .checked_add(WORD)
            .is_some_and(|end| end <= self.handle.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimWindow;

    fn handle(len: u64) -> AccessHandle {
        AccessHandle::new(BarIndex::new(0).unwrap(), Box::new(SimWindow::new(len)))
    }

    #[test]
    fn test_transfer_roundtrip() {
        let h = handle(64);
        let t = h.transfer().unwrap();
        t.write_u32(8, 0x1234_5678).unwrap();
        assert_eq!(t.read_u32(8).unwrap(), 0x1234_5678);
    }

    #[test]
    fn test_alignment_and_bounds() {
        let h = handle(64);
        let t = h.transfer().unwrap();
        assert!(matches!(t.read_u32(2), Err(PciCharError::Fault { .. })));
        assert!(matches!(t.read_u32(64), Err(PciCharError::Fault { .. })));
        assert!(t.read_u32(60).is_ok());
        assert!(t.fits(60));
        assert!(!t.fits(61));
        assert!(!t.fits(u64::MAX));
    }

    #[test]
    fn test_revoke_makes_handle_stale() {
        let h = handle(16);
        assert!(h.is_live());
        assert!(h.revoke());
        assert!(!h.is_live());
        assert!(!h.revoke());
        assert!(h.transfer().unwrap_err().is_stale());
        assert_eq!(h.len(), 16);
    }
}
