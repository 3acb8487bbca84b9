//! Memory-mapped BAR window
//!
//! The only place in the crate that touches raw pointers into device memory.
//! Every access is bounds-checked and goes through a volatile 32-bit load or
//! store; the mapping is released in `Drop`.

use crate::bus::RegisterWindow;
use crate::error::{PciCharError, Result};
use pci_char_model::{BarIndex, PciAddress};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::File;
use std::os::unix::io::AsFd;
use std::ptr::NonNull;

/// `mmap`ed view of one `resourceN` file
#[derive(Debug)]
pub struct MmapWindow {
    ptr: NonNull<u8>,
    size: usize,
    _file: File,
    address: PciAddress,
    bar: BarIndex,
}

impl MmapWindow {
    /// Map `len` bytes of `file` shared and read/write
    ///
    /// # Errors
    ///
    /// Returns `Mapping` if `len` is zero, does not fit the address space,
    /// or `mmap` fails.
    pub fn new(file: File, len: u64, address: PciAddress, bar: BarIndex) -> Result<Self> {
        let size = usize::try_from(len).map_err(|_| {
            PciCharError::mapping(address, bar, format!("{len:#x} bytes exceed address space"))
        })?;
        if size == 0 {
            return Err(PciCharError::mapping(address, bar, "BAR size is 0"));
        }

        // SAFETY: mmap of a freshly opened resource file:
        // - fd is valid (owned by `file`, kept alive in the struct)
        // - size is non-zero
        // - PROT_READ|PROT_WRITE with MAP_SHARED so stores reach the device
        // - offset 0 is the start of the BAR
        // - the mapping is only released in Drop
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                0,
            )
        }
        .map_err(|e| PciCharError::mapping(address, bar, format!("mmap failed: {e}")))?;

        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| PciCharError::mapping(address, bar, "mmap returned null"))?;

        tracing::debug!("Mapped {bar} of {address} ({size:#x} bytes at {ptr:p})");

        Ok(Self {
            ptr,
            size,
            _file: file,
            address,
            bar,
        })
    }

    fn word_ptr(&self, offset: u64, op: &str) -> Result<*mut u32> {
        let end = offset.checked_add(4).unwrap_or(u64::MAX);
        if offset % 4 != 0 || end > self.size as u64 {
            return Err(PciCharError::fault(
                offset,
                format!("out of bounds {op}: limit={:#x}", self.size),
            ));
        }

        // Bounds checked above, so the cast cannot truncate.
        #[allow(clippy::cast_possible_truncation)]
        let offset = offset as usize;

        // SAFETY: offset + 4 <= size, so the pointer stays inside the mapping.
        #[allow(clippy::cast_ptr_alignment)]
        let ptr = unsafe { self.ptr.as_ptr().add(offset).cast::<u32>() };
        Ok(ptr)
    }
}

impl RegisterWindow for MmapWindow {
    fn len(&self) -> u64 {
        self.size as u64
    }

    fn read_u32(&self, offset: u64) -> Result<u32> {
        let ptr = self.word_ptr(offset, "read")?;

        // SAFETY: Volatile read from memory-mapped hardware register.
        // - ptr is inside the live mapping (word_ptr)
        // - 4-byte aligned: mapping is page aligned and offset % 4 == 0
        // - volatile: MMIO loads have side effects and must not be merged
        let value = unsafe { ptr.read_volatile() };

        tracing::trace!("Read u32 @ {offset:#x} = {value:#x}");
        Ok(value)
    }

    fn write_u32(&self, offset: u64, value: u32) -> Result<()> {
        let ptr = self.word_ptr(offset, "write")?;

        tracing::trace!("Write u32 @ {offset:#x} = {value:#x}");

        // SAFETY: Volatile write to memory-mapped hardware register.
        // - ptr is inside the live mapping (word_ptr)
        // - 4-byte aligned: mapping is page aligned and offset % 4 == 0
        // - volatile: MMIO stores trigger hardware and must not be elided
        unsafe { ptr.write_volatile(value) };
        Ok(())
    }
}

impl Drop for MmapWindow {
    fn drop(&mut self) {
        tracing::debug!("Unmapping {} of {} ({:#x} bytes)", self.bar, self.address, self.size);

        // SAFETY: ptr and size are exactly what mmap returned in new(), and
        // Drop runs once.
        unsafe {
            if let Err(e) = munmap(self.ptr.as_ptr().cast(), self.size) {
                tracing::error!("munmap failed during drop: {e}");
            }
        }
    }
}

// SAFETY: Send - the window owns its mapping exclusively; moving it between
// threads does not invalidate the mapping (mmap'd memory is process-wide).
unsafe impl Send for MmapWindow {}

// SAFETY: Sync - all accesses are bounds-checked single-word volatile
// operations; concurrent register accesses are ordered by the hardware, and
// no Rust-visible state is mutated through &self.
unsafe impl Sync for MmapWindow {}
