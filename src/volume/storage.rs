// File-backed block layer under the volume.
//
// Fixed-size pages addressed by physical page number. Reads and writes go
// through one file handle under a mutex; the volume's caches sit above
// this layer, so the lock is off the hot path.

use crate::error::{IndexError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, Default)]
pub struct StorageStats {
    pub reads: u64,
    pub writes: u64,
    pub syncs: u64,
}

pub struct IndexStorage {
    file: Mutex<File>,
    path: Mutex<PathBuf>,
    bytes_per_page: usize,
    reads: AtomicU64,
    writes: AtomicU64,
    syncs: AtomicU64,
}

impl IndexStorage {
    /// Create (or truncate) a volume file sized for `total_pages`.
    pub fn create(path: &Path, bytes_per_page: usize, total_pages: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(total_pages * bytes_per_page as u64)?;
        Ok(Self {
            file: Mutex::new(file),
            path: Mutex::new(path.to_path_buf()),
            bytes_per_page,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            syncs: AtomicU64::new(0),
        })
    }

    /// Open an existing volume file.
    pub fn open(path: &Path, bytes_per_page: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            path: Mutex::new(path.to_path_buf()),
            bytes_per_page,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            syncs: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn bytes_per_page(&self) -> usize {
        self.bytes_per_page
    }

    pub fn read_page(&self, physical_page: u32) -> Result<Vec<u8>> {
        let mut data = vec![0u8; self.bytes_per_page];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(
            physical_page as u64 * self.bytes_per_page as u64,
        ))?;
        file.read_exact(&mut data)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(data)
    }

    pub fn write_page(&self, physical_page: u32, data: &[u8]) -> Result<()> {
        if data.len() != self.bytes_per_page {
            return Err(IndexError::Buffer(format!(
                "page write of {} bytes, expected {}",
                data.len(),
                self.bytes_per_page
            )));
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(
            physical_page as u64 * self.bytes_per_page as u64,
        ))?;
        file.write_all(data)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Advisory read-ahead hint. The backing store is buffered, so this
    /// is a no-op beyond keeping the interface honest.
    pub fn prefetch(&self, _physical_page: u32, _count: u32) {}

    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_data()?;
        self.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Swap the backing file, used when the caller relocates the volume.
    pub fn replace_path(&self, path: &Path) -> Result<()> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        *self.file.lock() = file;
        *self.path.lock() = path.to_path_buf();
        Ok(())
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            syncs: self.syncs.load(Ordering::Relaxed),
        }
    }
}
