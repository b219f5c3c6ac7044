//! In-process backend for tests and probe-less demos.
//!
//! Two addressing modes, matching the two ways a region can exist
//! without hardware:
//!
//! - **process memory**: addresses are real pointers in this process.
//!   This is the faithful model of a debug probe (it can reach any
//!   target RAM, including transfer chunk buffers outside the region)
//!   and is what the protocol integration tests run on.
//! - **region file**: addresses are byte offsets into a mapped region
//!   file (a firmware-side process publishes offsets by creating its
//!   context with a zero probe base). Reaches only the file, so file
//!   transfers are out; log and input traffic work across processes.

use crate::error::ProbeError;
use crate::ProbeBackend;
use dmlink_mmap::RegionFile;
use std::ptr;

enum Mode {
    Memory,
    File(RegionFile),
}

/// Loopback probe over this process's memory or a mapped region file.
pub struct LoopbackProbe {
    mode: Mode,
}

// One monitor thread drives the probe while a firmware thread owns its
// context; the probe itself holds no shared mutable state.
unsafe impl Send for LoopbackProbe {}

impl LoopbackProbe {
    /// Identity addressing: probe addresses are process addresses.
    ///
    /// # Safety
    ///
    /// The caller guarantees that every address the monitor will touch
    /// (the region it is pointed at, plus any chunk buffer a transfer
    /// publishes) stays valid while the probe is in use. That holds for
    /// the intended setup, a firmware context alive in the same
    /// process, and nothing else.
    pub unsafe fn over_process_memory() -> Self {
        Self { mode: Mode::Memory }
    }

    /// File-offset addressing over a mapped region file.
    pub fn over_region_file(region: RegionFile) -> Self {
        Self { mode: Mode::File(region) }
    }
}

impl ProbeBackend for LoopbackProbe {
    fn read_memory(&mut self, addr: u64, len: usize) -> Result<Vec<u8>, ProbeError> {
        let mut out = vec![0u8; len];
        match &mut self.mode {
            Mode::Memory => {
                let src = addr as usize as *const u8;
                for (i, slot) in out.iter_mut().enumerate() {
                    *slot = unsafe { ptr::read_volatile(src.add(i)) };
                }
            }
            Mode::File(region) => {
                let end = addr as usize + len;
                if addr > region.len() as u64 || end > region.len() {
                    return Err(ProbeError::AddressRange { addr, len });
                }
                let base = region.base();
                for (i, slot) in out.iter_mut().enumerate() {
                    *slot = unsafe { ptr::read_volatile(base.add(addr as usize + i)) };
                }
            }
        }
        Ok(out)
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<(), ProbeError> {
        match &mut self.mode {
            Mode::Memory => {
                let dst = addr as usize as *mut u8;
                for (i, &b) in data.iter().enumerate() {
                    unsafe { ptr::write_volatile(dst.add(i), b) };
                }
            }
            Mode::File(region) => {
                let end = addr as usize + data.len();
                if addr > region.len() as u64 || end > region.len() {
                    return Err(ProbeError::AddressRange { addr, len: data.len() });
                }
                let base = region.base();
                for (i, &b) in data.iter().enumerate() {
                    unsafe { ptr::write_volatile(base.add(addr as usize + i), b) };
                }
            }
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), ProbeError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_memory_round_trip() {
        let buf = vec![0u8; 64].into_boxed_slice();
        let addr = buf.as_ptr() as u64;

        let mut probe = unsafe { LoopbackProbe::over_process_memory() };
        probe.write_memory(addr + 8, b"DMLO").unwrap();
        let back = probe.read_memory(addr + 8, 4).unwrap();
        assert_eq!(back, b"DMLO".to_vec());
        assert_eq!(buf[8..12], *b"DMLO");
    }

    #[test]
    fn region_file_bounds_are_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let len = dmlink_layout::HEADER_LEN + 64;
        let region = RegionFile::create(dir.path().join("region"), len).unwrap();

        let mut probe = LoopbackProbe::over_region_file(region);
        probe.write_memory(4, &[1, 2, 3]).unwrap();
        assert_eq!(probe.read_memory(4, 3).unwrap(), vec![1, 2, 3]);

        assert!(matches!(
            probe.read_memory(len as u64 - 1, 2),
            Err(ProbeError::AddressRange { .. })
        ));
        assert!(matches!(
            probe.write_memory(len as u64, &[0]),
            Err(ProbeError::AddressRange { .. })
        ));
    }
}
