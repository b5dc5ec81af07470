//! Memory-mapped access to served files and fetch destinations.
//!
//! Zero-length files cannot be mapped, so both types treat them as an empty
//! slice with no mapping behind it.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut, MmapOptions};
use reach_protocol::FileLayout;

use crate::error::{Result, TransferError};

/// Read-only view of a file being served.
pub struct FileMap {
    path: PathBuf,
    map: Option<Mmap>,
    size: u64,
}

impl FileMap {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| TransferError::file(path, e))?;
        let metadata = file.metadata().map_err(|e| TransferError::file(path, e))?;
        if !metadata.is_file() {
            return Err(TransferError::file(
                path,
                io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }

        let size = metadata.len();
        let map = if size == 0 {
            None
        } else {
            // SAFETY: the mapping is read-only; a served file truncated
            // underneath us is outside what this process can guard against.
            let map = unsafe { MmapOptions::new().map(&file) }
                .map_err(|e| TransferError::file(path, e))?;
            Some(map)
        };

        Ok(Self {
            path: path.to_path_buf(),
            map,
            size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    /// Payload of one packet, or `None` past the end of the file.
    pub fn packet(&self, layout: &FileLayout, packet_id: u64) -> Option<&[u8]> {
        let offset = layout.offset(packet_id)?;
        let len = layout.payload_len(packet_id)?;
        let start = usize::try_from(offset).ok()?;
        let end = usize::try_from(offset + len).ok()?;
        self.bytes().get(start..end)
    }
}

/// Writable, pre-sized destination of a fetch.
pub struct FileSink {
    path: PathBuf,
    map: Option<MmapMut>,
    size: u64,
}

impl FileSink {
    /// Create (or truncate) `path` at exactly `size` bytes, creating parent
    /// directories as needed.
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| TransferError::file(parent, e))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| TransferError::file(path, e))?;
        file.set_len(size).map_err(|e| TransferError::file(path, e))?;

        let map = if size == 0 {
            None
        } else {
            // SAFETY: the file was just created by us and is only written
            // through this mapping.
            let map = unsafe { MmapOptions::new().map_mut(&file) }
                .map_err(|e| TransferError::file(path, e))?;
            Some(map)
        };

        Ok(Self {
            path: path.to_path_buf(),
            map,
            size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Copy `data` to `offset`. Writes that would run past the end fail.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let out_of_range = || {
            TransferError::file(
                &self.path,
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("write of {} bytes at {} exceeds {} bytes", data.len(), offset, self.size),
                ),
            )
        };

        let start = usize::try_from(offset).map_err(|_| out_of_range())?;
        let end = start.checked_add(data.len()).ok_or_else(out_of_range)?;
        let map = self.map.as_mut().ok_or_else(out_of_range)?;
        let target = map.get_mut(start..end).ok_or_else(out_of_range)?;
        target.copy_from_slice(data);
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        match &self.map {
            Some(map) => map.flush().map_err(|e| TransferError::file(&self.path, e)),
            None => Ok(()),
        }
    }
}
