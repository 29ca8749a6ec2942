//! The byte medium under the journal.

use crate::error::StorageResult;

/// Append-only bytes holding a store's journal.
///
/// The store only ever appends whole entries, reads everything back on open,
/// and cuts the tail off after a torn write. A backend never looks inside
/// the bytes.
///
/// `flush` hands appended bytes to the OS; `sync` must not return before
/// they would survive power loss. `truncate` never grows the medium.
pub trait StorageBackend: Send + Sync {
    /// Returns every byte written so far.
    fn read_all(&self) -> StorageResult<Vec<u8>>;

    /// Appends `data`, returning the offset it starts at.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Current length in bytes.
    fn size(&self) -> StorageResult<u64>;

    /// Hands buffered bytes to the OS.
    fn flush(&mut self) -> StorageResult<()>;

    /// Makes appended bytes durable.
    fn sync(&mut self) -> StorageResult<()>;

    /// Cuts the medium down to `len` bytes.
    ///
    /// # Errors
    ///
    /// Fails if `len` is larger than the current size.
    fn truncate(&mut self, len: u64) -> StorageResult<()>;
}

/// The error returned when asked to truncate past the end.
pub(crate) fn cannot_grow(len: u64, size: u64) -> crate::StorageError {
    std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("truncate to {len} bytes would grow a {size} byte journal"),
    )
    .into()
}
