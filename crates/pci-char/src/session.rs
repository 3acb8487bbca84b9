//! Endpoint I/O
//!
//! A [`Session`] is one open of an endpoint: a cursor into the window plus a
//! reference to the endpoint's access handle. Transfers move whole 32-bit
//! words in native byte order, one uncached access per word.
//!
//! Transfers stop at the window end. A read or write that would run past
//! `length` moves the words that fit and returns the short count; if no
//! word fits it fails with `Fault`.

use crate::error::{PciCharError, Result};
use crate::handle::WORD;
use crate::registry::{Endpoint, EndpointId, EndpointInfo};
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Seek origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    /// From the start of the window
    Absolute(u64),
    /// From the current cursor
    Relative(i64),
}

/// One open endpoint
///
/// Not shareable between threads without external locking; open one
/// session per thread instead.
#[derive(Debug)]
pub struct Session {
    endpoint: Arc<Endpoint>,
    cursor: u64,
    cancel: Option<Arc<AtomicBool>>,
}

impl Session {
    pub(crate) fn new(endpoint: Arc<Endpoint>) -> Self {
        tracing::trace!("open {}", endpoint.info.path);
        Self {
            endpoint,
            cursor: 0,
            cancel: None,
        }
    }

    /// Endpoint identity
    #[must_use]
    pub fn id(&self) -> EndpointId {
        self.endpoint.info.id
    }

    /// Namespace path
    #[must_use]
    pub fn path(&self) -> &str {
        &self.endpoint.info.path
    }

    /// Full endpoint description
    #[must_use]
    pub fn info(&self) -> &EndpointInfo {
        &self.endpoint.info
    }

    /// Window length in bytes
    #[must_use]
    pub fn len(&self) -> u64 {
        self.endpoint.info.length
    }

    /// Whether the window spans no bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current cursor
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.cursor
    }

    /// Stop transfers at the next word boundary once `flag` is set
    pub fn set_cancel_flag(&mut self, flag: Arc<AtomicBool>) {
        self.cancel = Some(flag);
    }

    /// Move the cursor
    ///
    /// The target must be word aligned and leave room for one word:
    /// `0 <= pos <= len - 4`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSeek` otherwise; the cursor is unchanged.
    pub fn seek(&mut self, mode: SeekMode) -> Result<u64> {
        let length = self.len();
        let position = match mode {
            SeekMode::Absolute(offset) => i128::from(offset),
            SeekMode::Relative(delta) => i128::from(self.cursor) + i128::from(delta),
        };

        let last_word = i128::from(length) - i128::from(WORD);
        if position < 0 || position % i128::from(WORD) != 0 || position > last_word {
            return Err(PciCharError::InvalidSeek { position, length });
        }

        self.cursor = u64::try_from(position)
            .map_err(|_| PciCharError::InvalidSeek { position, length })?;
        tracing::trace!("{}: seek to {:#x}", self.path(), self.cursor);
        Ok(self.cursor)
    }

    /// Read up to `count` bytes from the cursor
    ///
    /// At most the rest of the window is read, so an oversized `count`
    /// returns a short result instead of allocating `count` bytes.
    ///
    /// # Errors
    ///
    /// See [`read_into`](Self::read_into).
    pub fn read(&mut self, count: usize) -> Result<Bytes> {
        check_size(count)?;
        if count == 0 {
            return Ok(Bytes::new());
        }

        // Only what fits before the window end is ever transferred.
        let remaining = self.len().saturating_sub(self.cursor) / WORD * WORD;
        let count = count.min(usize::try_from(remaining).unwrap_or(usize::MAX));
        if count == 0 {
            self.endpoint.handle.transfer()?;
            return Err(PciCharError::fault(self.cursor, "end of window"));
        }

        let mut buf = BytesMut::zeroed(count);
        let n = self.read_into(&mut buf)?;
        buf.truncate(n);
        Ok(buf.freeze())
    }

    /// Fill `buf` with consecutive words from the cursor
    ///
    /// Returns the number of bytes read; fewer than `buf.len()` if the window
    /// end is reached, a word faults, or the transfer is cancelled after the
    /// first word.
    ///
    /// # Errors
    ///
    /// - `InvalidSize` if `buf.len()` is not a multiple of 4 (nothing is read)
    /// - `StaleHandle` if the device has been removed
    /// - `Fault` if not even one word could be read
    /// - `Interrupted` if cancelled before the first word
    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        check_size(buf.len())?;
        if buf.is_empty() {
            return Ok(0);
        }

        let endpoint = Arc::clone(&self.endpoint);
        let transfer = endpoint.handle.transfer()?;
        let mut done = 0;
        for chunk in buf.chunks_exact_mut(4) {
            let step = self.step(done, |offset| {
                if transfer.fits(offset) {
                    transfer.read_u32(offset)
                } else {
                    Err(PciCharError::fault(offset, "end of window"))
                }
            })?;
            let Some(word) = step else {
                break;
            };
            chunk.copy_from_slice(bytemuck::bytes_of(&word));
            done += chunk.len();
        }
        Ok(done)
    }

    /// Write `data` as consecutive words from the cursor
    ///
    /// Returns the number of bytes written, with the same short-count rules
    /// as [`read_into`](Self::read_into).
    ///
    /// # Errors
    ///
    /// Same as [`read_into`](Self::read_into).
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        check_size(data.len())?;
        if data.is_empty() {
            return Ok(0);
        }

        let endpoint = Arc::clone(&self.endpoint);
        let transfer = endpoint.handle.transfer()?;
        let mut done = 0;
        for chunk in data.chunks_exact(4) {
            let word: u32 = bytemuck::pod_read_unaligned(chunk);
            let step = self.step(done, |offset| {
                if transfer.fits(offset) {
                    transfer.write_u32(offset, word)
                } else {
                    Err(PciCharError::fault(offset, "end of window"))
                }
            })?;
            if step.is_none() {
                break;
            }
            done += chunk.len();
        }
        Ok(done)
    }

    /// Close the session
    pub fn close(self) {
        tracing::trace!("close {}", self.path());
    }

    /// Move one word at the cursor
    ///
    /// `Ok(None)` ends a transfer that already moved `done` bytes; errors
    /// are only returned while `done == 0`.
    fn step<T>(&mut self, done: usize, op: impl FnOnce(u64) -> Result<T>) -> Result<Option<T>> {
        if self.cancel.as_ref().is_some_and(|c| c.load(Ordering::Relaxed)) {
            tracing::debug!("{}: cancelled at {:#x}", self.path(), self.cursor);
            return if done == 0 {
                Err(PciCharError::Interrupted {
                    offset: self.cursor,
                })
            } else {
                Ok(None)
            };
        }

        match op(self.cursor) {
            Ok(value) => {
                self.cursor += WORD;
                Ok(Some(value))
            }
            Err(e) if done == 0 => Err(e),
            Err(e) => {
                tracing::debug!("{}: short transfer after {done} bytes: {e}", self.path());
                Ok(None)
            }
        }
    }
}

fn check_size(size: usize) -> Result<()> {
    if size % 4 != 0 {
        return Err(PciCharError::InvalidSize { size });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::AccessHandle;
    use crate::sim::SimWindow;
    use pci_char_model::{BarIndex, PciAddress};

    fn session(len: u64) -> Session {
        let address = PciAddress::new(1, 0, 1).unwrap();
        let bar = BarIndex::new(0).unwrap();
        let handle = Arc::new(AccessHandle::new(bar, Box::new(SimWindow::new(len))));
        Session::new(Arc::new(Endpoint {
            info: EndpointInfo {
                id: EndpointId::new(240, 0),
                address,
                bar,
                length: len,
                name: address.node_name(bar),
                path: address.endpoint_path(bar),
            },
            handle,
        }))
    }

    fn words(bytes: &[u8]) -> Vec<u32> {
        bytes
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }

    #[test]
    fn test_seek_bounds() {
        let mut s = session(256);
        assert_eq!(s.seek(SeekMode::Absolute(252)).unwrap(), 252);
        assert!(s.seek(SeekMode::Absolute(256)).is_err());
        assert!(s.seek(SeekMode::Absolute(253)).is_err());
        assert_eq!(s.position(), 252);
        assert_eq!(s.seek(SeekMode::Relative(-252)).unwrap(), 0);
        assert!(matches!(
            s.seek(SeekMode::Relative(-4)),
            Err(PciCharError::InvalidSeek {
                position: -4,
                length: 256
            })
        ));
        assert!(s.seek(SeekMode::Relative(i64::MAX)).is_err());
    }

    #[test]
    fn test_write_then_read() {
        let mut s = session(64);
        s.seek(SeekMode::Absolute(8)).unwrap();
        let data: Vec<u8> = [1u32, 2, 3].iter().flat_map(|w| w.to_ne_bytes()).collect();
        assert_eq!(s.write(&data).unwrap(), 12);
        assert_eq!(s.position(), 20);

        s.seek(SeekMode::Absolute(8)).unwrap();
        assert_eq!(words(&s.read(12).unwrap()), vec![1, 2, 3]);
    }

    #[test]
    fn test_invalid_size_moves_nothing() {
        let mut s = session(64);
        assert!(matches!(s.read(6), Err(PciCharError::InvalidSize { size: 6 })));
        assert!(matches!(s.write(&[0; 3]), Err(PciCharError::InvalidSize { size: 3 })));
        assert_eq!(s.position(), 0);
    }

    #[test]
    fn test_empty_transfer() {
        let mut s = session(64);
        assert!(s.read(0).unwrap().is_empty());
        assert_eq!(s.write(&[]).unwrap(), 0);
        assert_eq!(s.position(), 0);
    }

    #[test]
    fn test_transfer_clamped_at_window_end() {
        let mut s = session(16);
        s.seek(SeekMode::Absolute(8)).unwrap();
        assert_eq!(s.write(&[0xff; 16]).unwrap(), 8);
        assert_eq!(s.position(), 16);

        let err = s.read(4).unwrap_err();
        assert!(matches!(err, PciCharError::Fault { offset: 16, .. }));

        s.seek(SeekMode::Absolute(12)).unwrap();
        assert_eq!(s.read(8).unwrap().len(), 4);
    }

    #[test]
    fn test_oversized_read_is_clamped_before_allocating() {
        let mut s = session(64);
        s.seek(SeekMode::Absolute(56)).unwrap();
        assert_eq!(s.read(1usize << 46).unwrap().len(), 8);
        assert_eq!(s.position(), 64);
        assert!(matches!(
            s.read(1usize << 46),
            Err(PciCharError::Fault { offset: 64, .. })
        ));
    }

    #[test]
    fn test_cancellation() {
        let mut s = session(64);
        let flag = Arc::new(AtomicBool::new(true));
        s.set_cancel_flag(Arc::clone(&flag));
        assert!(matches!(s.read(8), Err(PciCharError::Interrupted { offset: 0 })));

        flag.store(false, Ordering::Relaxed);
        assert_eq!(s.read(8).unwrap().len(), 8);
    }

    #[test]
    fn test_revoked_handle_is_stale() {
        let mut s = session(64);
        assert!(s.endpoint.handle.revoke());
        assert!(s.read(4).unwrap_err().is_stale());
        assert!(s.write(&[0; 4]).unwrap_err().is_stale());
        // Seek only touches the cursor.
        assert!(s.seek(SeekMode::Absolute(4)).is_ok());
        s.close();
    }
}
