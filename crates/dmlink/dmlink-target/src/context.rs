//! Region lifecycle, volatile header access, the lock, and `clear`.

use crate::error::TargetError;
use dmlink_layout::{flags, offsets, partition, Arenas, MAGIC};
use std::ptr;
use std::sync::atomic::{fence, Ordering};

/// Size of each staging buffer: the longest log entry (terminator
/// included) the engine assembles or reads back in one piece.
pub const MAX_ENTRY: usize = 500;

/// Tunables fixed at region creation.
#[derive(Debug, Clone, Copy)]
pub struct ContextConfig {
    /// Requested input arena size in bytes. `0` (and any value that would
    /// not leave room for an output arena) falls back to 20% of the data
    /// bytes.
    pub input_size: u32,
    /// Polling iterations to contest the `BUSY` bit before proceeding
    /// anyway. The lock is advisory; a wedged host must not wedge the
    /// firmware log path.
    pub lock_spin_budget: u32,
    /// Polling iterations to wait for the host during a file-transfer
    /// handshake before the transfer aborts. Iterations, not wall clock:
    /// ports with cheap volatile reads should raise this.
    pub transfer_wait_budget: u32,
    /// Region base address as seen from the probe, when it differs from
    /// the local pointer (e.g. a region inside a mapped file driven by
    /// the loopback backend, where addresses are file offsets). `None`
    /// publishes the local pointer, which is correct on real hardware.
    pub probe_base: Option<u64>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            input_size: 0,
            lock_spin_budget: 10_000,
            transfer_wait_budget: 1_000_000,
            probe_base: None,
        }
    }
}

/// Byte-assembly staging area shared by the read paths.
pub(crate) struct Staging {
    pub buf: [u8; MAX_ENTRY],
    /// Bytes valid in `buf`.
    pub len: usize,
    /// Next byte of `buf` to hand out.
    pub off: usize,
}

impl Staging {
    pub(crate) const fn new() -> Self {
        Self { buf: [0; MAX_ENTRY], len: 0, off: 0 }
    }

    pub(crate) fn reset(&mut self) {
        self.buf = [0; MAX_ENTRY];
        self.len = 0;
        self.off = 0;
    }

    pub(crate) fn exhausted(&self) -> bool {
        self.off >= self.len
    }
}

/// The firmware side of one shared region.
///
/// Owns the region exclusively apart from the header fields the host is
/// allowed to mutate (`out_tail`, `in_head`, and the flag bits the
/// protocol assigns to it). All multi-byte header traffic goes through
/// per-byte volatile accessors so the compiler can never cache a field
/// across a suspension point, and release/acquire fences order payload
/// bytes against the offsets and flags that publish them.
pub struct Context {
    pub(crate) base: *mut u8,
    pub(crate) len: usize,
    pub(crate) arenas: Arenas,
    pub(crate) cfg: ContextConfig,

    /// Write-assembly staging: bytes of the entry being built.
    pub(crate) write_buf: [u8; MAX_ENTRY],
    pub(crate) write_off: usize,

    /// Output read-back staging (diagnostic drain of our own log).
    pub(crate) out_stage: Staging,
    /// Input read staging.
    pub(crate) in_stage: Staging,

    /// Lock recursion depth; only the outermost release clears `BUSY`.
    pub(crate) lock_depth: u32,
}

// The context is the single firmware-side owner of the region. Moving it
// to another thread is fine; sharing it is not.
unsafe impl Send for Context {}

impl Context {
    /// Initializes `len` bytes at `base` as a fresh shared region and
    /// attaches to it.
    ///
    /// Zeroes the buffer, partitions the arenas, publishes the arena base
    /// addresses, writes the magic last (a probe must never observe the
    /// magic in front of garbage), then emits the version banner as the
    /// first log line.
    ///
    /// # Safety
    ///
    /// `base..base + len` must be valid for reads and writes for the
    /// lifetime of the context, and nothing on this side may touch it
    /// except through the returned context.
    pub unsafe fn create(
        base: *mut u8,
        len: usize,
        cfg: ContextConfig,
    ) -> Result<Self, TargetError> {
        if base.is_null() {
            return Err(TargetError::Region("null region pointer"));
        }
        let arenas = partition(len, cfg.input_size).map_err(TargetError::Region)?;

        let mut ctx = Self {
            base,
            len,
            arenas,
            cfg,
            write_buf: [0; MAX_ENTRY],
            write_off: 0,
            out_stage: Staging::new(),
            in_stage: Staging::new(),
            lock_depth: 0,
        };

        for off in 0..len {
            ctx.wr_byte(off, 0);
        }

        let probe_base = cfg.probe_base.unwrap_or(base as usize as u64);
        ctx.wr_u32(offsets::OUT_SIZE, arenas.out_size);
        ctx.wr_u64(offsets::OUT_BASE, probe_base + arenas.out_off as u64);
        ctx.wr_u32(offsets::IN_SIZE, arenas.in_size);
        ctx.wr_u64(offsets::IN_BASE, probe_base + arenas.in_off as u64);

        // Everything the host will trust must be in place before the
        // magic makes the region discoverable.
        fence(Ordering::Release);
        ctx.wr_u32(offsets::MAGIC, MAGIC);

        ctx.puts(concat!("dmlink ", env!("CARGO_PKG_VERSION"), "\n"));
        Ok(ctx)
    }

    /// Tears the region down: zeroes the magic so any attached monitor
    /// stops, then wipes rings, flags and transfer slots under the lock.
    pub fn destroy(&mut self) {
        if !self.is_live() {
            return;
        }
        self.lock();
        self.wr_u32(offsets::MAGIC, 0);
        fence(Ordering::Release);
        self.clear_locked();
        self.unlock();
        // The lock bit dies with the region.
        self.wr_u32(offsets::FLAGS, 0);
    }

    /// Whether the region still carries the magic. Every public operation
    /// checks this first and returns a sentinel instead of touching a
    /// dead region.
    #[inline]
    pub fn is_live(&self) -> bool {
        !self.base.is_null() && self.rd_u32(offsets::MAGIC) == MAGIC
    }

    /// Output arena geometry.
    #[inline]
    pub fn out_size(&self) -> u32 {
        self.arenas.out_size
    }

    /// Input arena geometry.
    #[inline]
    pub fn in_size(&self) -> u32 {
        self.arenas.in_size
    }

    // ---- lock ----------------------------------------------------------

    /// Acquires the region lock, spinning on a host-held `BUSY` bit up to
    /// the configured budget, then proceeding anyway. Re-entrant: nested
    /// acquisitions only bump the recursion counter.
    pub(crate) fn lock(&mut self) {
        if self.lock_depth > 0 {
            self.lock_depth += 1;
            return;
        }
        let mut spins: u32 = 0;
        while self.rd_u32(offsets::FLAGS) & flags::BUSY != 0 {
            spins += 1;
            if spins >= self.cfg.lock_spin_budget {
                break;
            }
            std::hint::spin_loop();
        }
        self.flag_set(flags::BUSY);
        self.lock_depth = 1;
    }

    /// Releases one level of the lock; only the outermost release clears
    /// `BUSY`.
    pub(crate) fn unlock(&mut self) {
        match self.lock_depth {
            0 => {}
            1 => {
                self.lock_depth = 0;
                self.flag_clear(flags::BUSY);
            }
            _ => self.lock_depth -= 1,
        }
    }

    // ---- clear ---------------------------------------------------------

    /// Wipes both rings and every coordination field, leaving the region
    /// live and empty. Also the handler for the host's `CLEAR_BUFFER`
    /// request (serviced from `putc`).
    pub fn clear(&mut self) -> bool {
        if !self.is_live() {
            return false;
        }
        self.lock();
        self.clear_locked();
        self.unlock();
        true
    }

    pub(crate) fn clear_locked(&mut self) {
        self.wr_u32(offsets::OUT_HEAD, 0);
        self.wr_u32(offsets::OUT_TAIL, 0);
        self.wr_u32(offsets::IN_HEAD, 0);
        self.wr_u32(offsets::IN_TAIL, 0);

        // The two arenas are adjacent by construction, so one pass covers
        // the whole data range.
        let data_len = self.arenas.out_size as usize + self.arenas.in_size as usize;
        for off in self.arenas.out_off..self.arenas.out_off + data_len {
            self.wr_byte(off, 0);
        }

        self.write_buf = [0; MAX_ENTRY];
        self.write_off = 0;
        self.out_stage.reset();
        self.in_stage.reset();

        self.clear_transfer_slots();
        self.flag_clear(
            flags::CLEAR_BUFFER
                | flags::INPUT_AVAILABLE
                | flags::INPUT_REQUESTED
                | flags::FILE_SEND
                | flags::FILE_RECV,
        );
    }

    pub(crate) fn clear_transfer_slots(&mut self) {
        self.wr_u64(offsets::FT_BUF, 0);
        self.wr_u32(offsets::FT_CHUNK_SIZE, 0);
        self.wr_u32(offsets::FT_CHUNK_NO, 0);
        self.wr_u32(offsets::FT_TOTAL, 0);
        for i in 0..dmlink_layout::PATH_MAX {
            self.wr_byte(offsets::PATH_FW + i, 0);
            self.wr_byte(offsets::PATH_PC + i, 0);
        }
    }

    // ---- flags ---------------------------------------------------------

    #[inline]
    pub(crate) fn flags_word(&self) -> u32 {
        self.rd_u32(offsets::FLAGS)
    }

    #[inline]
    pub(crate) fn flag_has(&self, bit: u32) -> bool {
        self.flags_word() & bit != 0
    }

    /// Read-modify-write OR on the flags word. Announcement bits must be
    /// set only after the payload they announce; callers fence first.
    pub(crate) fn flag_set(&mut self, bits: u32) {
        let v = self.rd_u32(offsets::FLAGS) | bits;
        self.wr_u32(offsets::FLAGS, v);
    }

    pub(crate) fn flag_clear(&mut self, bits: u32) {
        let v = self.rd_u32(offsets::FLAGS) & !bits;
        self.wr_u32(offsets::FLAGS, v);
    }

    // ---- volatile little-endian accessors ------------------------------
    //
    // Per-byte volatile traffic sidesteps alignment entirely (the packed
    // header places 64-bit fields on 4-byte offsets) and matches the
    // byte-granularity the probe uses from the other side.

    #[inline]
    pub(crate) fn rd_byte(&self, off: usize) -> u8 {
        debug_assert!(off < self.len);
        unsafe { ptr::read_volatile(self.base.add(off)) }
    }

    #[inline]
    pub(crate) fn wr_byte(&mut self, off: usize, v: u8) {
        debug_assert!(off < self.len);
        unsafe { ptr::write_volatile(self.base.add(off), v) }
    }

    pub(crate) fn rd_u32(&self, off: usize) -> u32 {
        let mut b = [0u8; 4];
        for (i, slot) in b.iter_mut().enumerate() {
            *slot = self.rd_byte(off + i);
        }
        u32::from_le_bytes(b)
    }

    pub(crate) fn wr_u32(&mut self, off: usize, v: u32) {
        for (i, byte) in v.to_le_bytes().into_iter().enumerate() {
            self.wr_byte(off + i, byte);
        }
    }

    pub(crate) fn rd_u64(&self, off: usize) -> u64 {
        let mut b = [0u8; 8];
        for (i, slot) in b.iter_mut().enumerate() {
            *slot = self.rd_byte(off + i);
        }
        u64::from_le_bytes(b)
    }

    pub(crate) fn wr_u64(&mut self, off: usize, v: u64) {
        for (i, byte) in v.to_le_bytes().into_iter().enumerate() {
            self.wr_byte(off + i, byte);
        }
    }

    /// Copies a NUL-terminated path into a header path slot.
    pub(crate) fn write_path(&mut self, slot_off: usize, path: &str) -> Result<(), TargetError> {
        let bytes = path.as_bytes();
        if bytes.len() >= dmlink_layout::PATH_MAX {
            return Err(TargetError::PathTooLong);
        }
        for (i, &b) in bytes.iter().enumerate() {
            self.wr_byte(slot_off + i, b);
        }
        for i in bytes.len()..dmlink_layout::PATH_MAX {
            self.wr_byte(slot_off + i, 0);
        }
        Ok(())
    }
}

// Note: dropping a context does not destroy the region. Contexts must be
// movable (e.g. into the process-default slot) without killing the link;
// teardown is an explicit `destroy`.

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Heap-allocated region plus an attached context for unit tests.
    pub(crate) struct TestRegion {
        pub mem: Box<[u8]>,
        pub ctx: Context,
    }

    impl TestRegion {
        pub(crate) fn new(total: usize, cfg: ContextConfig) -> Self {
            let mut mem = vec![0u8; total].into_boxed_slice();
            let ctx = unsafe { Context::create(mem.as_mut_ptr(), total, cfg) }.unwrap();
            Self { mem, ctx }
        }

        /// Raw view of the region for assertions. The context goes through
        /// volatile pointer accesses, so reading the slice directly in
        /// between operations is fine in the single-threaded tests.
        pub(crate) fn raw(&self) -> &[u8] {
            &self.mem
        }
    }
}
