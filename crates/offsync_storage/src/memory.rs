//! Journal bytes kept in memory.

use crate::backend::{cannot_grow, StorageBackend};
use crate::error::StorageResult;
use parking_lot::Mutex;
use std::sync::Arc;

/// A journal held in a shared buffer.
///
/// Clones see the same bytes, so a test can drop a store and open a new one
/// over what it wrote, or damage the bytes in between to exercise recovery.
///
/// ```rust
/// use offsync_storage::{InMemoryBackend, StorageBackend};
///
/// let mut journal = InMemoryBackend::new();
/// let reader = journal.clone();
/// journal.append(b"entry").unwrap();
/// assert_eq!(reader.read_all().unwrap(), b"entry");
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl InMemoryBackend {
    /// An empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A journal starting out with `bytes`.
    #[must_use]
    pub fn with_data(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Copy of the current bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Flips every bit of the byte at `offset`, if there is one.
    pub fn corrupt_byte(&self, offset: usize) {
        if let Some(byte) = self.bytes.lock().get_mut(offset) {
            *byte = !*byte;
        }
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_all(&self) -> StorageResult<Vec<u8>> {
        Ok(self.data())
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut bytes = self.bytes.lock();
        let start = bytes.len() as u64;
        bytes.extend_from_slice(data);
        Ok(start)
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.bytes.lock().len() as u64)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> StorageResult<()> {
        let mut bytes = self.bytes.lock();
        let size = bytes.len() as u64;
        if len > size {
            return Err(cannot_grow(len, size));
        }
        bytes.truncate(len as usize);
        Ok(())
    }
}
