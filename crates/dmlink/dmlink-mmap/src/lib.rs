//! File-backed shared regions for running the link without hardware.
//!
//! On a real target the shared region is a chunk of RAM reached through a
//! debug probe. For local testing and demos the same protocol runs over a
//! memory-mapped file instead: one process plays firmware and writes the
//! region through its mapping, another plays monitor and drives the file
//! through the loopback probe backend. Both map read-write, since the protocol
//! has traffic in both directions.

use memmap2::MmapMut;
use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
};

/// A read-write mapping of a region file.
///
/// Keeps the file handle alive for the lifetime of the mapping. The base
/// pointer is stable for that lifetime, which is what lets a firmware
/// context publish `base as u64` addresses into the header and a loopback
/// probe resolve them again.
pub struct RegionFile {
    /// File handle kept alive to maintain the memory map validity
    _file: File,
    mmap: MmapMut,
}

impl RegionFile {
    /// Creates (or truncates) a region file of `len` bytes and maps it.
    ///
    /// `len` must at least hold the control header; the caller is expected
    /// to hand the mapping to a firmware context, which enforces the full
    /// minimum during region creation.
    pub fn create<P: AsRef<Path>>(path: P, len: usize) -> io::Result<Self> {
        if len < dmlink_layout::HEADER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "region file shorter than the control header",
            ));
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { _file: file, mmap })
    }

    /// Maps an existing region file read-write.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        if mmap.len() < dmlink_layout::HEADER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "region file shorter than the control header",
            ));
        }
        Ok(Self { _file: file, mmap })
    }

    /// Base pointer of the mapped region.
    #[inline]
    pub fn base(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    /// Mapped length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.len() == 0
    }
}
