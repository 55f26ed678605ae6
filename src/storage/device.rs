//! # Device Abstraction
//!
//! A [`Device`] is a flat, growable byte store addressed by offset. The page
//! manager performs all I/O through this trait; nothing above it knows
//! whether pages live in a file, a memory map or a plain vector.
//!
//! ## Backends
//!
//! | Backend      | Use                         | Notes                      |
//! |--------------|-----------------------------|----------------------------|
//! | `FileDevice` | default on-disk databases   | positioned read/write      |
//! | `MmapDevice` | opt-in memory-mapped I/O    | grow/truncate by remapping |
//! | `MemDevice`  | in-memory databases, tests  | backed by a `Vec<u8>`      |
//!
//! ## Growth
//!
//! Writing past the current end grows the device; there is no separate
//! allocation call. `file_size()` always reflects the highest written byte
//! rounded up to the write's extent.
//!
//! ## Truncation Under Mappings
//!
//! Some platforms refuse to truncate a file while a mapping is active.
//! `is_mapped()` lets the close path detect this and skip end-of-file
//! reclamation (see the page manager).

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

use crate::config::PAGE_SIZE;

pub trait Device: Send {
    /// Current size of the backing store in bytes.
    fn file_size(&self) -> Result<u64>;

    /// Shrinks (or grows) the backing store to `size` bytes.
    fn truncate(&mut self, size: u64) -> Result<()>;

    /// Reads `buf.len()` bytes at `offset`.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf` at `offset`, growing the store if needed.
    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flushes pending writes to durable storage.
    fn flush(&mut self) -> Result<()>;

    /// True when the backing store is an active memory mapping.
    fn is_mapped(&self) -> bool {
        false
    }
}

#[cfg(unix)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, offset: u64, buf: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut pos = 0;
    while pos < buf.len() {
        let n = file.seek_read(&mut buf[pos..], offset + pos as u64)?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        pos += n;
    }
    Ok(())
}

#[cfg(windows)]
fn write_at(file: &File, offset: u64, buf: &[u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut pos = 0;
    while pos < buf.len() {
        let n = file.seek_write(&buf[pos..], offset + pos as u64)?;
        pos += n;
    }
    Ok(())
}

/// Positioned file I/O without a mapping.
pub struct FileDevice {
    file: File,
}

impl FileDevice {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create '{}'", path.display()))?;
        Ok(Self { file })
    }

    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .wrap_err_with(|| format!("failed to open '{}'", path.display()))?;
        Ok(Self { file })
    }
}

impl Device for FileDevice {
    fn file_size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.file
            .set_len(size)
            .wrap_err_with(|| format!("failed to truncate to {} bytes", size))
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        read_at(&self.file, offset, buf)
            .wrap_err_with(|| format!("read of {} bytes at offset {} failed", buf.len(), offset))
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        write_at(&self.file, offset, buf)
            .wrap_err_with(|| format!("write of {} bytes at offset {} failed", buf.len(), offset))
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_data().wrap_err("fsync failed")
    }
}

/// Memory-mapped file I/O. Reads and writes copy through the mapping; growth
/// and truncation remap.
pub struct MmapDevice {
    file: File,
    map: Option<MmapMut>,
    len: u64,
}

impl MmapDevice {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create '{}'", path.display()))?;
        Ok(Self {
            file,
            map: None,
            len: 0,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open '{}'", path.display()))?;
        let len = file.metadata()?.len();
        let map = if len > 0 {
            // SAFETY: the file stays open for the lifetime of the mapping and
            // the engine lock serializes all access to this device.
            Some(unsafe { MmapMut::map_mut(&file)? })
        } else {
            None
        };
        Ok(Self { file, map, len })
    }

    fn remap(&mut self, len: u64) -> Result<()> {
        if let Some(map) = self.map.take() {
            map.flush()?;
            drop(map);
        }
        self.file.set_len(len)?;
        self.len = len;
        if len > 0 {
            // SAFETY: see `open`.
            self.map = Some(unsafe { MmapMut::map_mut(&self.file)? });
        }
        Ok(())
    }
}

impl Device for MmapDevice {
    fn file_size(&self) -> Result<u64> {
        Ok(self.len)
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.remap(size)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let map = self
            .map
            .as_ref()
            .ok_or_else(|| eyre::eyre!("read from empty mapping"))?;
        let start = offset as usize;
        ensure!(
            start + buf.len() <= map.len(),
            "read of {} bytes at offset {} beyond mapped length {}",
            buf.len(),
            offset,
            map.len()
        );
        buf.copy_from_slice(&map[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let end = offset + buf.len() as u64;
        if end > self.len {
            self.remap(end)?;
        }
        let map = self
            .map
            .as_mut()
            .ok_or_else(|| eyre::eyre!("write to empty mapping"))?;
        let start = offset as usize;
        map[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(map) = &self.map {
            map.flush()?;
        }
        Ok(())
    }

    fn is_mapped(&self) -> bool {
        self.map.is_some()
    }
}

/// A `Vec`-backed device for in-memory databases and tests.
#[derive(Default)]
pub struct MemDevice {
    data: Vec<u8>,
}

impl MemDevice {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Device for MemDevice {
    fn file_size(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.data.resize(size as usize, 0);
        Ok(())
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        ensure!(
            start + buf.len() <= self.data.len(),
            "read of {} bytes at offset {} beyond device length {}",
            buf.len(),
            offset,
            self.data.len()
        );
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let end = offset as usize + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Zero-filled page buffer, shared by allocation paths.
pub(crate) fn zeroed_page() -> Box<[u8]> {
    vec![0u8; PAGE_SIZE].into_boxed_slice()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_write_extends_length() {
        let mut dev = MemDevice::new();
        assert_eq!(dev.file_size().unwrap(), 0);

        dev.write(PAGE_SIZE as u64, &[1, 2, 3]).unwrap();
        assert_eq!(dev.file_size().unwrap(), PAGE_SIZE as u64 + 3);

        let mut buf = [0u8; 3];
        dev.read(PAGE_SIZE as u64, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn mem_device_truncate_shrinks() {
        let mut dev = MemDevice::new();
        dev.write(0, &[7u8; 100]).unwrap();
        dev.truncate(10).unwrap();

        assert_eq!(dev.file_size().unwrap(), 10);
        assert!(dev.read(5, &mut [0u8; 10]).is_err());
    }

    #[test]
    fn file_device_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.db");

        let mut dev = FileDevice::create(&path).unwrap();
        dev.write(0, &[0xAB; PAGE_SIZE]).unwrap();
        dev.write(PAGE_SIZE as u64, &[0xCD; PAGE_SIZE]).unwrap();
        dev.flush().unwrap();
        assert_eq!(dev.file_size().unwrap(), 2 * PAGE_SIZE as u64);

        let mut buf = [0u8; PAGE_SIZE];
        dev.read(PAGE_SIZE as u64, &mut buf).unwrap();
        assert_eq!(buf[0], 0xCD);

        dev.truncate(PAGE_SIZE as u64).unwrap();
        assert_eq!(dev.file_size().unwrap(), PAGE_SIZE as u64);
    }

    #[test]
    fn mmap_device_grows_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.db");

        let mut dev = MmapDevice::create(&path).unwrap();
        assert!(!dev.is_mapped());

        dev.write(0, &[0x11; PAGE_SIZE]).unwrap();
        assert!(dev.is_mapped());
        assert_eq!(dev.file_size().unwrap(), PAGE_SIZE as u64);

        let mut buf = [0u8; 4];
        dev.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0x11; 4]);

        dev.truncate(0).unwrap();
        assert!(!dev.is_mapped());
    }
}
