#![forbid(unsafe_code)]
//! Byte-addressed image I/O.
//!
//! Provides the `ByteDevice` trait with a file-backed implementation using
//! positioned reads and writes, and an in-memory implementation for tests and
//! tooling. Every engine call opens a device for its own duration; nothing is
//! cached between calls.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use vdfs_error::{Result, VdfsError};

/// Chunk size used when zero-filling ranges.
const ZERO_CHUNK: usize = 64 * 1024;

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;

    /// Read `len` bytes at `offset` into a fresh buffer.
    fn read_vec(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; len];
        self.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Overwrite `len` bytes at `offset` with zeros.
    fn zero_range(&self, offset: u64, len: u64) -> Result<()> {
        let zeros = [0_u8; ZERO_CHUNK];
        let mut written = 0_u64;
        while written < len {
            let remaining = len - written;
            let step = usize::try_from(remaining).map_or(ZERO_CHUNK, |r| r.min(ZERO_CHUNK));
            let at = offset
                .checked_add(written)
                .ok_or_else(|| VdfsError::Format("zero range overflows u64".to_owned()))?;
            self.write_all_at(at, &zeros[..step])?;
            written += step as u64;
        }
        tracing::trace!(offset, len, "zeroed range");
        Ok(())
    }
}

fn checked_end(offset: u64, len: usize, what: &str, file_len: u64) -> Result<()> {
    let end = offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| VdfsError::Format(format!("{what} length overflows u64")))?,
        )
        .ok_or_else(|| VdfsError::Format(format!("{what} range overflows u64")))?;
    if end > file_len {
        return Err(VdfsError::Format(format!(
            "{what} out of bounds: offset={offset} len={len} file_len={file_len}"
        )));
    }
    Ok(())
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// Uses `std::os::unix::fs::FileExt`, so there is no shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open an existing image, read-write when possible.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(VdfsError::NotFound(path.display().to_string()));
        }
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path)
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        tracing::trace!(path = %path.display(), len, writable, "opened image");
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    /// Create a new zero-filled image of `len` bytes, creating parent
    /// directories. Fails if the file already exists.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Err(VdfsError::Exists(path.display().to_string()));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        // set_len extends with zeros.
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: true,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_end(offset, buf.len(), "read", self.len)?;
        self.file.read_exact_at(buf, offset)?;
        tracing::trace!(offset, len = buf.len(), "pread");
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(VdfsError::ReadOnly);
        }
        checked_end(offset, buf.len(), "write", self.len)?;
        self.file.write_all_at(buf, offset)?;
        tracing::trace!(offset, len = buf.len(), "pwrite");
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device.
#[derive(Debug)]
pub struct MemoryByteDevice {
    bytes: Mutex<Vec<u8>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
        }
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
        }
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        checked_end(offset, buf.len(), "read", bytes.len() as u64)?;
        let start =
            usize::try_from(offset).map_err(|_| VdfsError::Format("offset overflow".into()))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        checked_end(offset, buf.len(), "write", bytes.len() as u64)?;
        let start =
            usize::try_from(offset).map_err(|_| VdfsError::Format("offset overflow".into()))?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

impl<D: ByteDevice + ?Sized> ByteDevice for &D {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_all_at(offset, buf)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}
