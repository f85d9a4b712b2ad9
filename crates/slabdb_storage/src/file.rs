//! A database file on disk.

use crate::backend::{check_range, StorageBackend};
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// A database file accessed with positional reads and writes.
///
/// The allocator places every chunk itself, so the file never appends:
/// a commit grows the file to its new logical size, writes its chunks in
/// place, and syncs around the header flip. Syncs use `sync_data`; the
/// only metadata a commit changes is the length, which `sync_data` covers.
///
/// ```no_run
/// use slabdb_storage::{FileBackend, StorageBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open(Path::new("data.slabdb")).unwrap();
/// backend.set_len(64).unwrap();
/// backend.write_at(16, b"chunk").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: Mutex<File>,
    len: u64,
}

impl FileBackend {
    /// Opens the file at `path`, creating an empty one if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        debug!(path = %path.display(), len, "opened database file");
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            len,
        })
    }

    /// Path of the file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn read_exact_at(file: &mut File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &mut File, data: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(not(unix))]
fn read_exact_at(file: &mut File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::io::{Read, Seek, SeekFrom};
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}

#[cfg(not(unix))]
fn write_all_at(file: &mut File, data: &[u8], offset: u64) -> std::io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        if check_range(offset, len, self.len).is_none() {
            return Err(StorageError::ReadPastEnd {
                offset,
                len,
                size: self.len,
            });
        }
        let mut buf = vec![0u8; len];
        if len > 0 {
            read_exact_at(&mut self.file.lock(), &mut buf, offset)?;
        }
        Ok(buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        if check_range(offset, data.len(), self.len).is_none() {
            return Err(StorageError::WritePastEnd {
                offset,
                len: data.len(),
                size: self.len,
            });
        }
        if !data.is_empty() {
            write_all_at(self.file.get_mut(), data, offset)?;
        }
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> StorageResult<()> {
        if len != self.len {
            self.file.get_mut().set_len(len)?;
            debug!(from = self.len, to = len, "resized database file");
            self.len = len;
        }
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.len)
    }

    fn flush(&mut self) -> StorageResult<()> {
        // Positional writes go straight to the OS.
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.file.get_mut().sync_data()?;
        Ok(())
    }
}
