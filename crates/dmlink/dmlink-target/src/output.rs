//! Line assembly into the output ring, and the diagnostic read-back path.
//!
//! Writes are staged: bytes accumulate in the write-assembly buffer until
//! a newline (or a full buffer) commits them to the ring in one `flush`.
//! The ring itself is a best-effort sink: when it is full, `flush`
//! discards the oldest byte and keeps going, which can tear the oldest
//! entry. Consumers already tolerate a partial first line.
//!
//! The read-back path (`read_next`/`getc`/`gets`) drains the output ring
//! from the tail into staging. The output ring is single-reader and that
//! reader is the host; these exist for self-test and diagnostics on
//! boards running without a monitor attached, and must not be interleaved
//! with a live host drain.

use crate::context::{Context, MAX_ENTRY};
use dmlink_layout::{advance, flags, free, is_full, offsets};
use std::sync::atomic::{fence, Ordering};

impl Context {
    /// Bytes left in the write-assembly buffer before the next forced
    /// flush.
    pub fn left_entry_space(&self) -> usize {
        MAX_ENTRY - self.write_off
    }

    /// Appends one byte to the entry being assembled.
    ///
    /// Services a pending host `CLEAR_BUFFER` request first, so a wipe
    /// ordered while firmware was quiet takes effect before new output.
    /// Newlines (and a full staging buffer) commit the entry to the ring.
    ///
    /// Returns `false` (and does nothing) if the region is not live.
    pub fn putc(&mut self, c: u8) -> bool {
        if !self.is_live() {
            return false;
        }
        self.lock();
        self.putc_locked(c);
        self.unlock();
        true
    }

    /// Writes a string, committing any unterminated trailing bytes at the
    /// end. A call therefore always leaves the staging buffer empty.
    pub fn puts(&mut self, s: &str) -> bool {
        self.putsn(s.as_bytes())
    }

    /// Byte-slice variant of [`Context::puts`].
    pub fn putsn(&mut self, bytes: &[u8]) -> bool {
        if !self.is_live() {
            return false;
        }
        self.lock();
        for &b in bytes {
            self.putc_locked(b);
        }
        // putc_locked flushed on '\n'; anything still staged was an
        // unterminated tail and goes out now.
        self.flush_locked();
        self.unlock();
        true
    }

    /// Commits the staged entry to the output ring.
    pub fn flush(&mut self) -> bool {
        if !self.is_live() {
            return false;
        }
        self.lock();
        self.flush_locked();
        self.unlock();
        true
    }

    /// Free bytes in the output ring.
    pub fn get_free_space(&mut self) -> u32 {
        if !self.is_live() {
            return 0;
        }
        self.lock();
        let head = self.rd_u32(offsets::OUT_HEAD);
        let tail = self.rd_u32(offsets::OUT_TAIL);
        let n = free(head, tail, self.arenas.out_size);
        self.unlock();
        n
    }

    fn putc_locked(&mut self, c: u8) {
        if self.flag_has(flags::CLEAR_BUFFER) {
            self.clear_locked();
        }
        if self.write_off == MAX_ENTRY {
            self.flush_locked();
        }
        self.write_buf[self.write_off] = c;
        self.write_off += 1;
        if c == b'\n' || self.write_off == MAX_ENTRY {
            self.flush_locked();
        }
    }

    pub(crate) fn flush_locked(&mut self) {
        if self.write_off == 0 {
            return;
        }
        let size = self.arenas.out_size;
        let mut head = self.rd_u32(offsets::OUT_HEAD);
        let mut tail = self.rd_u32(offsets::OUT_TAIL);

        for i in 0..self.write_off {
            if is_full(head, tail, size) {
                // Re-read before discarding: the host may have drained
                // since our snapshot and freed the slot already.
                tail = self.rd_u32(offsets::OUT_TAIL);
                if is_full(head, tail, size) {
                    tail = advance(tail, 1, size);
                    self.wr_u32(offsets::OUT_TAIL, tail);
                }
            }
            let byte = self.write_buf[i];
            self.wr_byte(self.arenas.out_off + head as usize, byte);
            head = advance(head, 1, size);
        }

        // Payload before publication: the host must never chase a head
        // that points past bytes it cannot yet see.
        fence(Ordering::Release);
        self.wr_u32(offsets::OUT_HEAD, head);
        self.write_off = 0;
    }

    // ---- diagnostic read-back ------------------------------------------

    /// Pulls the next newline-terminated run (at most `MAX_ENTRY - 1`
    /// bytes) from the output ring into read staging. Returns `true` iff
    /// at least one byte moved.
    pub fn read_next(&mut self) -> bool {
        if !self.is_live() {
            return false;
        }
        self.lock();
        let moved = self.read_next_locked();
        self.unlock();
        moved
    }

    fn read_next_locked(&mut self) -> bool {
        let size = self.arenas.out_size;
        fence(Ordering::Acquire);
        let head = self.rd_u32(offsets::OUT_HEAD);
        let mut tail = self.rd_u32(offsets::OUT_TAIL);

        self.out_stage.reset();
        while tail != head && self.out_stage.len < MAX_ENTRY - 1 {
            let b = self.rd_byte(self.arenas.out_off + tail as usize);
            tail = advance(tail, 1, size);
            self.out_stage.buf[self.out_stage.len] = b;
            self.out_stage.len += 1;
            if b == b'\n' {
                break;
            }
        }
        self.wr_u32(offsets::OUT_TAIL, tail);
        self.out_stage.len > 0
    }

    /// Next byte of the drained entry, pulling the next entry from the
    /// ring once the current staging is exhausted.
    pub fn getc(&mut self) -> Option<u8> {
        if !self.is_live() {
            return None;
        }
        self.lock();
        let b = self.getc_locked();
        self.unlock();
        b
    }

    fn getc_locked(&mut self) -> Option<u8> {
        if self.out_stage.exhausted() && !self.read_next_locked() {
            return None;
        }
        let b = self.out_stage.buf[self.out_stage.off];
        self.out_stage.off += 1;
        Some(b)
    }

    /// Fills `buf` from the drained output, crossing entry boundaries as
    /// needed. Returns the byte count (0 when the ring is empty).
    pub fn gets(&mut self, buf: &mut [u8]) -> usize {
        if !self.is_live() {
            return 0;
        }
        self.lock();
        let mut n = 0;
        while n < buf.len() {
            match self.getc_locked() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        self.unlock();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testutil::TestRegion;
    use crate::context::ContextConfig;
    use dmlink_layout::Header;

    fn region(total: usize) -> TestRegion {
        let mut r = TestRegion::new(total, ContextConfig::default());
        // Unit tests want a quiet ring; the banner is covered elsewhere.
        r.ctx.clear();
        r
    }

    fn header(r: &TestRegion) -> Header {
        Header::decode(r.raw()).unwrap()
    }

    #[test]
    fn staged_bytes_only_commit_on_flush() {
        let mut r = region(1024);
        r.ctx.putc(b'h');
        r.ctx.putc(b'i');
        assert_eq!(header(&r).out_head, 0);
        assert_eq!(r.ctx.left_entry_space(), crate::MAX_ENTRY - 2);
        r.ctx.flush();
        assert_eq!(header(&r).out_head, 2);
        assert_eq!(r.ctx.left_entry_space(), crate::MAX_ENTRY);
    }

    #[test]
    fn newline_commits_the_entry() {
        let mut r = region(1024);
        r.ctx.putc(b'o');
        r.ctx.putc(b'k');
        r.ctx.putc(b'\n');
        let h = header(&r);
        assert_eq!(h.out_head, 3);
        let base = h.out_base as usize - r.mem.as_ptr() as usize;
        assert_eq!(&r.raw()[base..base + 3], b"ok\n");
    }

    #[test]
    fn used_grows_monotonically_with_writes() {
        let mut r = region(1024);
        let size = r.ctx.out_size();
        let mut last_used = 0;
        for i in 0..100u32 {
            r.ctx.putc(b'a' + (i % 26) as u8);
            r.ctx.flush();
            let h = header(&r);
            let used = dmlink_layout::used(h.out_head, h.out_tail, size);
            assert_eq!(used, last_used + 1);
            assert!(h.out_head < size && h.out_tail < size);
            last_used = used;
        }
        // Bytes land in write order.
        let h = header(&r);
        let base = h.out_base as usize - r.mem.as_ptr() as usize;
        for i in 0..100usize {
            assert_eq!(r.raw()[base + i], b'a' + (i % 26) as u8);
        }
    }

    #[test]
    fn puts_round_trips_through_read_back() {
        let mut r = region(1024);
        assert!(r.ctx.puts("hello target\n"));
        assert!(r.ctx.read_next());
        let mut buf = [0u8; 64];
        let n = r.ctx.gets(&mut buf);
        assert_eq!(&buf[..n], b"hello target\n");
        // Drained: nothing further.
        assert!(!r.ctx.read_next());
        assert_eq!(r.ctx.gets(&mut buf), 0);
    }

    #[test]
    fn getc_advances_across_entries() {
        let mut r = region(1024);
        r.ctx.puts("ab\n");
        r.ctx.puts("c\n");
        let got: Vec<u8> = std::iter::from_fn(|| r.ctx.getc()).collect();
        assert_eq!(got, b"ab\nc\n");
    }

    #[test]
    fn unterminated_tail_is_flushed_by_puts() {
        let mut r = region(1024);
        r.ctx.puts("no newline");
        assert_eq!(header(&r).out_head, 10);
    }

    #[test]
    fn overflow_discards_oldest_and_pins_used_at_max() {
        // Arena much smaller than one staged entry: the flush must lap
        // itself, advancing tail by exactly the overflow amount.
        let mut r = TestRegion::new(
            dmlink_layout::HEADER_LEN + 80,
            ContextConfig { input_size: 16, ..Default::default() },
        );
        r.ctx.clear();
        let size = r.ctx.out_size(); // 64
        assert_eq!(size, 64);

        let payload: Vec<u8> = (0..100u8).collect();
        r.ctx.putsn(&payload);

        let h = header(&r);
        let used = dmlink_layout::used(h.out_head, h.out_tail, size);
        assert_eq!(used, size - 1);
        // 100 bytes through a 63-usable ring: tail advanced by the 37
        // overwritten plus the reserved slot walking forward.
        let mut expect = Vec::new();
        for i in 0..used {
            let off = dmlink_layout::advance(h.out_tail, i, size);
            expect.push(r.raw()[h.out_base as usize - r.mem.as_ptr() as usize + off as usize]);
        }
        assert_eq!(expect, payload[100 - used as usize..].to_vec());
    }

    #[test]
    fn oversized_entry_survives_with_suffix_intact() {
        let mut r = TestRegion::new(
            dmlink_layout::HEADER_LEN + 160,
            ContextConfig { input_size: 32, ..Default::default() },
        );
        r.ctx.clear();
        let size = r.ctx.out_size();

        r.ctx.putsn(&vec![b'A'; 300]);
        r.ctx.puts("\nEND\n");

        // Whatever survived must end in the full trailing line.
        let h = header(&r);
        let base = h.out_base as usize - r.mem.as_ptr() as usize;
        let used = dmlink_layout::used(h.out_head, h.out_tail, size);
        let mut drained = Vec::new();
        for i in 0..used {
            let off = dmlink_layout::advance(h.out_tail, i, size);
            drained.push(r.raw()[base + off as usize]);
        }
        assert!(drained.ends_with(b"\nEND\n"));
    }

    #[test]
    fn clear_buffer_request_is_serviced_before_new_output() {
        let mut r = region(1024);
        r.ctx.puts("stale\n");
        r.ctx.flag_set(flags::CLEAR_BUFFER);
        r.ctx.puts("fresh\n");

        let h = header(&r);
        assert_eq!(h.flags & flags::CLEAR_BUFFER, 0);
        assert_eq!(h.out_tail, 0);
        assert_eq!(h.out_head, 6);
        let base = h.out_base as usize - r.mem.as_ptr() as usize;
        assert_eq!(&r.raw()[base..base + 6], b"fresh\n");
    }

    #[test]
    fn dead_region_returns_sentinels() {
        let mut r = region(1024);
        r.ctx.destroy();
        assert!(!r.ctx.puts("x"));
        assert!(!r.ctx.flush());
        assert_eq!(r.ctx.get_free_space(), 0);
        assert!(!r.ctx.read_next());
        assert_eq!(r.ctx.getc(), None);
    }
}
