//! Host half of the file-transfer relay.
//!
//! The firmware paces everything; the host just answers edges. A raised
//! `FILE_SEND` means "a chunk is ready for you, append it"; a raised
//! `FILE_RECV` means "publish the next chunk of my requested file into
//! the buffer I gave you". Zero-length chunks terminate a transfer in
//! both directions. Clearing the flag bit is the host's acknowledgement
//! and always happens after the payload and metadata it refers to.

use crate::error::MonitorError;
use dmlink_layout::{flags, offsets, path_str, Header};
use dmlink_probe::{ProbeBackend, ProbeError};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use tracing::{debug, info, warn};

/// In-flight transfer state, at most one per direction.
pub(crate) struct TransferDriver {
    send: Option<SendState>,
    recv: Option<RecvState>,
}

/// Firmware → host: we append chunks to a host-side file.
struct SendState {
    file: File,
    path: String,
    next_chunk: u32,
    received: u64,
}

/// Host → firmware: we stream a host-side file into the firmware's
/// chunk buffer.
struct RecvState {
    file: File,
    path: String,
    chunk_no: u32,
    /// Firmware's buffer capacity, captured from the initial
    /// `ft_chunk_size` publication.
    cap: u32,
    sent: u64,
}

impl TransferDriver {
    pub(crate) fn new() -> Self {
        Self { send: None, recv: None }
    }

    /// Services one `FILE_SEND` edge: consume the published chunk and
    /// acknowledge it.
    pub(crate) fn service_send<P: ProbeBackend>(
        &mut self,
        probe: &mut P,
        region_addr: u64,
        h: &Header,
    ) -> Result<(), MonitorError> {
        if self.send.is_none() {
            let Some(path) = path_str(&h.path_pc).filter(|p| !p.is_empty()) else {
                warn!("send transfer without a usable host path, ignoring chunk");
                clear_flag_bits(probe, region_addr, flags::FILE_SEND)?;
                return Ok(());
            };
            let file = File::create(path).map_err(|source| MonitorError::TransferFile {
                path: path.to_string(),
                source,
            })?;
            info!(path, total = h.ft_total, "incoming file transfer");
            self.send = Some(SendState {
                file,
                path: path.to_string(),
                next_chunk: 0,
                received: 0,
            });
        }

        let state = self.send.as_mut().expect("send state exists");
        if h.ft_chunk_size == 0 {
            // End-of-transfer sentinel.
            info!(
                path = %state.path,
                bytes = state.received,
                chunks = state.next_chunk,
                "file transfer complete"
            );
            self.send = None;
        } else if state.next_chunk.checked_sub(1) == Some(h.ft_chunk_no) {
            // Re-observed chunk (we consumed it, firmware missed the
            // ack edge): acknowledge again without appending.
            debug!(chunk = h.ft_chunk_no, "duplicate chunk, re-acknowledging");
        } else if h.ft_chunk_no != state.next_chunk {
            warn!(
                expected = state.next_chunk,
                got = h.ft_chunk_no,
                "chunk sequence broken, dropping transfer"
            );
            self.send = None;
        } else {
            let bytes = probe.read_memory(h.ft_buf, h.ft_chunk_size as usize)?;
            state
                .file
                .write_all(&bytes)
                .map_err(|source| MonitorError::TransferFile {
                    path: state.path.clone(),
                    source,
                })?;
            state.next_chunk += 1;
            state.received += bytes.len() as u64;
            debug!(
                chunk = h.ft_chunk_no,
                size = h.ft_chunk_size,
                "chunk appended"
            );
        }

        clear_flag_bits(probe, region_addr, flags::FILE_SEND)?;
        Ok(())
    }

    /// Services one `FILE_RECV` edge: publish the next chunk (or the
    /// terminator) into the firmware's buffer and acknowledge.
    pub(crate) fn service_recv<P: ProbeBackend>(
        &mut self,
        probe: &mut P,
        region_addr: u64,
        h: &Header,
    ) -> Result<(), MonitorError> {
        if self.recv.is_none() {
            let Some(path) = path_str(&h.path_pc).filter(|p| !p.is_empty()) else {
                warn!("receive transfer without a usable host path, ignoring");
                clear_flag_bits(probe, region_addr, flags::FILE_RECV)?;
                return Ok(());
            };
            if h.ft_chunk_size == 0 {
                warn!("receive transfer with zero buffer capacity, ignoring");
                clear_flag_bits(probe, region_addr, flags::FILE_RECV)?;
                return Ok(());
            }
            let file = OpenOptions::new().read(true).open(path).map_err(|source| {
                MonitorError::TransferFile {
                    path: path.to_string(),
                    source,
                }
            })?;
            info!(path, cap = h.ft_chunk_size, "outgoing file transfer");
            self.recv = Some(RecvState {
                file,
                path: path.to_string(),
                chunk_no: 0,
                cap: h.ft_chunk_size,
                sent: 0,
            });
        }

        let state = self.recv.as_mut().expect("recv state exists");
        let mut chunk = vec![0u8; state.cap as usize];
        let n = read_full(&mut state.file, &mut chunk).map_err(|source| {
            MonitorError::TransferFile {
                path: state.path.clone(),
                source,
            }
        })?;

        if n > 0 {
            probe.write_memory(h.ft_buf, &chunk[..n])?;
        }
        probe.write_memory(
            region_addr + offsets::FT_CHUNK_NO as u64,
            &state.chunk_no.to_le_bytes(),
        )?;
        probe.write_memory(
            region_addr + offsets::FT_CHUNK_SIZE as u64,
            &(n as u32).to_le_bytes(),
        )?;

        if n == 0 {
            info!(
                path = %state.path,
                bytes = state.sent,
                chunks = state.chunk_no,
                "file transfer complete"
            );
            self.recv = None;
        } else {
            state.chunk_no += 1;
            state.sent += n as u64;
            debug!(chunk = state.chunk_no - 1, size = n, "chunk published");
        }

        clear_flag_bits(probe, region_addr, flags::FILE_RECV)?;
        Ok(())
    }
}

/// Read-modify-write OR on the shared flags word.
pub(crate) fn set_flag_bits<P: ProbeBackend>(
    probe: &mut P,
    region_addr: u64,
    bits: u32,
) -> Result<(), ProbeError> {
    let addr = region_addr + offsets::FLAGS as u64;
    let cur = read_flags_word(probe, addr)?;
    probe.write_memory(addr, &(cur | bits).to_le_bytes())
}

/// Read-modify-write AND-NOT on the shared flags word.
pub(crate) fn clear_flag_bits<P: ProbeBackend>(
    probe: &mut P,
    region_addr: u64,
    bits: u32,
) -> Result<(), ProbeError> {
    let addr = region_addr + offsets::FLAGS as u64;
    let cur = read_flags_word(probe, addr)?;
    probe.write_memory(addr, &(cur & !bits).to_le_bytes())
}

fn read_flags_word<P: ProbeBackend>(probe: &mut P, addr: u64) -> Result<u32, ProbeError> {
    let raw = probe.read_memory(addr, 4)?;
    let raw: [u8; 4] = raw
        .try_into()
        .map_err(|_| ProbeError::Protocol("short flags read".into()))?;
    Ok(u32::from_le_bytes(raw))
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
