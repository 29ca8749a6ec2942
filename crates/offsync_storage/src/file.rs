//! Journal bytes in a file.

use crate::backend::{cannot_grow, StorageBackend};
use crate::error::StorageResult;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A journal file.
///
/// The length is tracked alongside the handle so `size` needs no syscall.
/// `sync` calls `File::sync_all`.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: File,
    len: u64,
}

impl FileBackend {
    /// Opens the journal at `path`, creating an empty one if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            len,
        })
    }

    /// Path of the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_all(&self) -> StorageResult<Vec<u8>> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::with_capacity(self.len as usize);
        file.take(self.len).read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let start = self.len;
        self.file.write_all(data)?;
        self.len += data.len() as u64;
        Ok(start)
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.len)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.file.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> StorageResult<()> {
        if len > self.len {
            return Err(cannot_grow(len, self.len));
        }
        self.file.set_len(len)?;
        self.file.sync_all()?;
        self.len = len;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopen_sees_appended_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.log");

        {
            let mut journal = FileBackend::open(&path).unwrap();
            assert_eq!(journal.append(b"queued ").unwrap(), 0);
            assert_eq!(journal.append(b"change").unwrap(), 7);
            journal.sync().unwrap();
        }

        let journal = FileBackend::open(&path).unwrap();
        assert_eq!(journal.size().unwrap(), 13);
        assert_eq!(journal.read_all().unwrap(), b"queued change");
        assert_eq!(journal.path(), path);
    }

    #[test]
    fn append_after_truncate_lands_at_the_new_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = FileBackend::open(&dir.path().join("journal.log")).unwrap();
        journal.append(b"complete|torn").unwrap();

        journal.truncate(9).unwrap();
        assert_eq!(journal.append(b"next").unwrap(), 9);
        assert_eq!(journal.read_all().unwrap(), b"complete|next");
        assert!(journal.truncate(100).is_err());
    }
}
