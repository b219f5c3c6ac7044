//! Chunked file transfer over the header transfer slots.
//!
//! Neither side can call the other, so a transfer is a flag-paced relay:
//! the firmware allocates a chunk buffer, publishes its address in
//! `ft_buf`, and then hands chunks back and forth with the host via the
//! `FILE_SEND`/`FILE_RECV` bits. A zero-length chunk terminates a
//! transfer in either direction.
//!
//! Waits are iteration-counted, not timed, because firmware may have no clock.
//! The budget lives in [`ContextConfig`](crate::ContextConfig) because a
//! port with cheap volatile reads burns through iterations much faster
//! than one polling over slow external RAM.
//!
//! The whole of `sendf`/`recvf` runs under the region lock. The chunk
//! buffer is firmware heap outside the shared region, so transfers only
//! work where the probe can reach arbitrary target RAM (real hardware,
//! or the loopback backend in identity-address mode).

use crate::context::Context;
use crate::error::TargetError;
use dmlink_layout::{flags, offsets};
use std::fs::File;
use std::io::{Read, Write};
use std::ptr;
use std::sync::atomic::{fence, Ordering};

impl Context {
    /// Streams the firmware-side file at `fw_path` to the host, which
    /// appends chunks to `pc_path`. Returns the number of payload bytes
    /// handed over.
    ///
    /// Each chunk is published as (`ft_chunk_no`, `ft_chunk_size`) plus
    /// `FILE_SEND`; the host clears the bit once it has consumed the
    /// chunk. After the last data chunk a zero-length chunk tells the
    /// host the file is complete.
    pub fn sendf(
        &mut self,
        fw_path: &str,
        pc_path: &str,
        chunk_size: u32,
    ) -> Result<u64, TargetError> {
        if !self.is_live() {
            return Err(TargetError::NotLive);
        }
        if chunk_size == 0 {
            return Err(TargetError::BadChunkSize);
        }
        let file = File::open(fw_path)?;
        let total = file.metadata()?.len();
        if total > u32::MAX as u64 {
            return Err(TargetError::FileTooLarge(total));
        }

        self.lock();
        let res = self.sendf_locked(file, total as u32, fw_path, pc_path, chunk_size);
        if res.is_err() {
            self.clear_transfer_slots();
            self.flag_clear(flags::FILE_SEND);
        }
        self.unlock();
        res
    }

    fn sendf_locked(
        &mut self,
        mut file: File,
        total: u32,
        fw_path: &str,
        pc_path: &str,
        chunk_size: u32,
    ) -> Result<u64, TargetError> {
        self.write_path(offsets::PATH_FW, fw_path)?;
        self.write_path(offsets::PATH_PC, pc_path)?;

        let mut buf = vec![0u8; chunk_size as usize];
        self.wr_u64(offsets::FT_BUF, buf.as_ptr() as usize as u64);
        self.wr_u32(offsets::FT_TOTAL, total);

        let mut sent: u64 = 0;
        let mut chunk_no: u32 = 0;
        loop {
            let n = read_full(&mut file, &mut buf)?;
            self.wr_u32(offsets::FT_CHUNK_NO, chunk_no);
            self.wr_u32(offsets::FT_CHUNK_SIZE, n as u32);
            // Chunk metadata and payload land before the announcement.
            fence(Ordering::Release);
            self.flag_set(flags::FILE_SEND);

            if !self.wait_flag_clear(flags::FILE_SEND) {
                return Err(TargetError::HostTimeout);
            }
            if n == 0 {
                break;
            }
            sent += n as u64;
            chunk_no += 1;
        }

        self.clear_transfer_slots();
        Ok(sent)
    }

    /// Receives a host-side file: the host reads `pc_path` and streams it
    /// chunk by chunk into our buffer; we append to `fw_path`. Returns
    /// the number of payload bytes written.
    pub fn recvf(
        &mut self,
        fw_path: &str,
        pc_path: &str,
        chunk_size: u32,
    ) -> Result<u64, TargetError> {
        if !self.is_live() {
            return Err(TargetError::NotLive);
        }
        if chunk_size == 0 {
            return Err(TargetError::BadChunkSize);
        }
        let file = File::create(fw_path)?;

        self.lock();
        let res = self.recvf_locked(file, fw_path, pc_path, chunk_size);
        if res.is_err() {
            self.clear_transfer_slots();
            self.flag_clear(flags::FILE_RECV);
        }
        self.unlock();
        res
    }

    fn recvf_locked(
        &mut self,
        mut file: File,
        fw_path: &str,
        pc_path: &str,
        chunk_size: u32,
    ) -> Result<u64, TargetError> {
        self.write_path(offsets::PATH_FW, fw_path)?;
        self.write_path(offsets::PATH_PC, pc_path)?;

        let buf = vec![0u8; chunk_size as usize];
        self.wr_u64(offsets::FT_BUF, buf.as_ptr() as usize as u64);
        // The initial chunk size tells the host how big our buffer is.
        self.wr_u32(offsets::FT_CHUNK_SIZE, chunk_size);
        self.wr_u32(offsets::FT_CHUNK_NO, 0);
        self.wr_u32(offsets::FT_TOTAL, 0);

        let mut written: u64 = 0;
        let mut expected: u32 = 0;
        let mut chunk = vec![0u8; chunk_size as usize];
        loop {
            fence(Ordering::Release);
            self.flag_set(flags::FILE_RECV);
            if !self.wait_flag_clear(flags::FILE_RECV) {
                return Err(TargetError::HostTimeout);
            }

            fence(Ordering::Acquire);
            let n = self.rd_u32(offsets::FT_CHUNK_SIZE);
            if n == 0 {
                break;
            }
            if n > chunk_size {
                return Err(TargetError::OversizedChunk);
            }
            let got = self.rd_u32(offsets::FT_CHUNK_NO);
            if got != expected {
                return Err(TargetError::ChunkSequence { expected, got });
            }

            // The host wrote through our published address; pull the
            // bytes with volatile reads so nothing is assumed cached.
            for (i, slot) in chunk[..n as usize].iter_mut().enumerate() {
                *slot = unsafe { ptr::read_volatile(buf.as_ptr().add(i)) };
            }
            file.write_all(&chunk[..n as usize])?;
            written += n as u64;
            expected += 1;
        }

        self.clear_transfer_slots();
        Ok(written)
    }

    /// Spins until the host drops `bit`, bounded by the transfer budget.
    fn wait_flag_clear(&self, bit: u32) -> bool {
        let mut i: u32 = 0;
        while self.rd_u32(offsets::FLAGS) & bit != 0 {
            i += 1;
            if i >= self.cfg.transfer_wait_budget {
                return false;
            }
            std::hint::spin_loop();
        }
        true
    }
}

fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match file.read(&mut buf[n..])? {
            0 => break,
            k => n += k,
        }
    }
    Ok(n)
}
