//! Control header at the start of the shared region.
//!
//! The header is packed (no padding) and little-endian. Rather than a
//! `#[repr(C, packed)]` struct (references into packed fields are a trap,
//! and the firmware side needs per-byte volatile access anyway), the layout
//! is expressed as byte-offset constants plus a plain decoded view.
//!
//! Field map (offset, width):
//!
//! ```text
//! magic          0   4   fixed sentinel, "DMLO"
//! flags          4   4   coordination bits, see [`flags`]
//! out_head       8   4   output write offset (firmware-owned)
//! out_tail      12   4   output read offset (host-owned)
//! out_size      16   4   output arena capacity
//! out_base      20   8   absolute address of the output arena
//! in_head       28   4   input write offset (host-owned)
//! in_tail       32   4   input read offset (firmware-owned)
//! in_size       36   4   input arena capacity
//! in_base       40   8   absolute address of the input arena
//! ft_buf        48   8   address of the in-flight transfer chunk buffer
//! ft_chunk_size 56   4   bytes valid in the chunk; 0 = end of transfer
//! ft_chunk_no   60   4   zero-based chunk sequence number
//! ft_total      64   4   total file size when the sender knows it, else 0
//! path_fw       68 256   NUL-terminated firmware-side path
//! path_pc      324 256   NUL-terminated host-side path
//! ```

/// Region sentinel. Spells `DMLO` when the four little-endian bytes are
/// read back in value order.
pub const MAGIC: u32 = 0x444D_4C4F;

/// Fixed size of a path slot in the header, terminator included.
pub const PATH_MAX: usize = 256;

/// Total header size in bytes. The output arena starts right behind it.
pub const HEADER_LEN: usize = offsets::PATH_PC + PATH_MAX;

/// Byte offsets of every header field from the start of the region.
///
/// The firmware reads and writes single fields through these; the host
/// uses them both to patch individual fields (`write_memory` of one word)
/// and to carve up a full header snapshot.
pub mod offsets {
    pub const MAGIC: usize = 0;
    pub const FLAGS: usize = 4;
    pub const OUT_HEAD: usize = 8;
    pub const OUT_TAIL: usize = 12;
    pub const OUT_SIZE: usize = 16;
    pub const OUT_BASE: usize = 20;
    pub const IN_HEAD: usize = 28;
    pub const IN_TAIL: usize = 32;
    pub const IN_SIZE: usize = 36;
    pub const IN_BASE: usize = 40;
    pub const FT_BUF: usize = 48;
    pub const FT_CHUNK_SIZE: usize = 56;
    pub const FT_CHUNK_NO: usize = 60;
    pub const FT_TOTAL: usize = 64;
    pub const PATH_FW: usize = 68;
    pub const PATH_PC: usize = 324;
}

/// Coordination bits in the `flags` word.
///
/// Each bit has exactly one asserting side; the table in each constant's
/// doc names who sets and who clears it. Both sides must tolerate reading
/// transient combinations (e.g. `INPUT_REQUESTED | INPUT_AVAILABLE` while
/// a prompt is being satisfied).
pub mod flags {
    /// Host asks the firmware to wipe both rings. Firmware clears it once
    /// the wipe is done.
    pub const CLEAR_BUFFER: u32 = 1 << 0;
    /// Region lock bit. Set by whichever side currently holds the lock,
    /// cleared by the same side on release.
    pub const BUSY: u32 = 1 << 1;
    /// Host has written bytes into the input ring. Firmware clears it when
    /// the ring drains empty.
    pub const INPUT_AVAILABLE: u32 = 1 << 2;
    /// Firmware is blocked waiting for input.
    pub const INPUT_REQUESTED: u32 = 1 << 3;
    /// Prompt hint: the host should not echo what the user types.
    pub const INPUT_ECHO_OFF: u32 = 1 << 4;
    /// Prompt hint: the host should collect a full line, not single keys.
    pub const INPUT_LINE_MODE: u32 = 1 << 5;
    /// A transfer chunk is ready for the host to consume. Host clears it
    /// after appending the chunk.
    pub const FILE_SEND: u32 = 1 << 6;
    /// Firmware requests the next host-published chunk; host clears it
    /// after writing the chunk (or the zero-length terminator).
    pub const FILE_RECV: u32 = 1 << 7;

    /// Bits the firmware rewrites as a group when issuing an input request.
    pub const INPUT_REQUEST_MASK: u32 = INPUT_REQUESTED | INPUT_ECHO_OFF | INPUT_LINE_MODE;
}

/// Decoded header snapshot.
///
/// This is the host's working view: it reads `HEADER_LEN` bytes over the
/// probe, decodes them into this struct, and acts on plain integers from
/// then on. The firmware never materializes one of these; it goes through
/// volatile per-field access instead.
#[derive(Clone, Copy)]
pub struct Header {
    pub magic: u32,
    pub flags: u32,
    pub out_head: u32,
    pub out_tail: u32,
    pub out_size: u32,
    pub out_base: u64,
    pub in_head: u32,
    pub in_tail: u32,
    pub in_size: u32,
    pub in_base: u64,
    pub ft_buf: u64,
    pub ft_chunk_size: u32,
    pub ft_chunk_no: u32,
    pub ft_total: u32,
    pub path_fw: [u8; PATH_MAX],
    pub path_pc: [u8; PATH_MAX],
}

impl Header {
    /// Decodes a raw header snapshot.
    ///
    /// Only the length is checked here; `magic` and ring bounds are the
    /// caller's business via [`Header::validate`], because a monitor wants
    /// to distinguish "no region yet" from "region gone mid-stream".
    pub fn decode(raw: &[u8]) -> Result<Self, &'static str> {
        if raw.len() < HEADER_LEN {
            return Err("header snapshot too short");
        }
        let mut path_fw = [0u8; PATH_MAX];
        let mut path_pc = [0u8; PATH_MAX];
        path_fw.copy_from_slice(&raw[offsets::PATH_FW..offsets::PATH_FW + PATH_MAX]);
        path_pc.copy_from_slice(&raw[offsets::PATH_PC..offsets::PATH_PC + PATH_MAX]);
        Ok(Self {
            magic: read_u32(raw, offsets::MAGIC),
            flags: read_u32(raw, offsets::FLAGS),
            out_head: read_u32(raw, offsets::OUT_HEAD),
            out_tail: read_u32(raw, offsets::OUT_TAIL),
            out_size: read_u32(raw, offsets::OUT_SIZE),
            out_base: read_u64(raw, offsets::OUT_BASE),
            in_head: read_u32(raw, offsets::IN_HEAD),
            in_tail: read_u32(raw, offsets::IN_TAIL),
            in_size: read_u32(raw, offsets::IN_SIZE),
            in_base: read_u64(raw, offsets::IN_BASE),
            ft_buf: read_u64(raw, offsets::FT_BUF),
            ft_chunk_size: read_u32(raw, offsets::FT_CHUNK_SIZE),
            ft_chunk_no: read_u32(raw, offsets::FT_CHUNK_NO),
            ft_total: read_u32(raw, offsets::FT_TOTAL),
            path_fw,
            path_pc,
        })
    }

    /// Encodes the header back into its packed little-endian form.
    ///
    /// The inverse of [`Header::decode`]; mostly useful to test fixtures
    /// and the loopback paths, since live sides only ever patch single
    /// fields.
    pub fn encode(&self, out: &mut [u8]) {
        assert!(out.len() >= HEADER_LEN, "encode target too short");
        write_u32(out, offsets::MAGIC, self.magic);
        write_u32(out, offsets::FLAGS, self.flags);
        write_u32(out, offsets::OUT_HEAD, self.out_head);
        write_u32(out, offsets::OUT_TAIL, self.out_tail);
        write_u32(out, offsets::OUT_SIZE, self.out_size);
        write_u64(out, offsets::OUT_BASE, self.out_base);
        write_u32(out, offsets::IN_HEAD, self.in_head);
        write_u32(out, offsets::IN_TAIL, self.in_tail);
        write_u32(out, offsets::IN_SIZE, self.in_size);
        write_u64(out, offsets::IN_BASE, self.in_base);
        write_u64(out, offsets::FT_BUF, self.ft_buf);
        write_u32(out, offsets::FT_CHUNK_SIZE, self.ft_chunk_size);
        write_u32(out, offsets::FT_CHUNK_NO, self.ft_chunk_no);
        write_u32(out, offsets::FT_TOTAL, self.ft_total);
        out[offsets::PATH_FW..offsets::PATH_FW + PATH_MAX].copy_from_slice(&self.path_fw);
        out[offsets::PATH_PC..offsets::PATH_PC + PATH_MAX].copy_from_slice(&self.path_pc);
    }

    /// Checks that the snapshot describes a live, internally consistent
    /// region.
    ///
    /// A failure here is transient from the monitor's point of view: the
    /// firmware may be mid-initialization, mid-`clear`, or the probe read
    /// may have raced a header update. Back off and re-read.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.magic != MAGIC {
            return Err("bad magic");
        }
        if self.out_size == 0 || self.in_size == 0 {
            return Err("zero arena size");
        }
        if self.out_head >= self.out_size || self.out_tail >= self.out_size {
            return Err("output ring offset out of range");
        }
        if self.in_head >= self.in_size || self.in_tail >= self.in_size {
            return Err("input ring offset out of range");
        }
        Ok(())
    }

    /// True if `bit` (one of the [`flags`] constants) is asserted.
    #[inline]
    pub fn has(&self, bit: u32) -> bool {
        self.flags & bit != 0
    }
}

/// Borrows the NUL-terminated prefix of a header path slot as UTF-8.
///
/// Transfer paths are written by whichever side initiated the transfer;
/// garbage after the terminator is ignored. Non-UTF-8 bytes yield `None`
/// rather than a lossy conversion so the host never opens a mangled path.
pub fn path_str(slot: &[u8; PATH_MAX]) -> Option<&str> {
    let end = slot.iter().position(|&b| b == 0).unwrap_or(PATH_MAX);
    core::str::from_utf8(&slot[..end]).ok()
}

#[inline]
fn read_u32(raw: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(raw[off..off + 4].try_into().unwrap())
}

#[inline]
fn read_u64(raw: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(raw[off..off + 8].try_into().unwrap())
}

#[inline]
fn write_u32(raw: &mut [u8], off: usize, v: u32) {
    raw[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn write_u64(raw: &mut [u8], off: usize, v: u64) {
    raw[off..off + 8].copy_from_slice(&v.to_le_bytes());
}
