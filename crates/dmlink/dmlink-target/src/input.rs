//! Input ring draining and the input-request handshake.
//!
//! The host owns `in_head` and writes keystrokes; firmware owns `in_tail`
//! and drains them through the same newline-framed staging scheme the
//! output side uses. `INPUT_AVAILABLE` tracks ring occupancy from the
//! host's perspective and is dropped by firmware the moment the ring runs
//! empty, so the host can tell a slow consumer from a finished one.
//!
//! A blocking read is expressed as a flag, not a call: `input_request`
//! raises `INPUT_REQUESTED` plus the prompt hints and the firmware then
//! polls `input_available` at its own pace.

use crate::context::{Context, MAX_ENTRY};
use dmlink_layout::{advance, flags, free, is_empty, offsets};
use std::sync::atomic::{fence, Ordering};

/// Prompt hints attached to an input request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputFlags {
    /// Ask the host not to echo what the user types (passwords).
    pub echo_off: bool,
    /// Ask the host to collect a whole line rather than single keys.
    pub line_mode: bool,
}

impl InputFlags {
    fn bits(self) -> u32 {
        let mut v = 0;
        if self.echo_off {
            v |= flags::INPUT_ECHO_OFF;
        }
        if self.line_mode {
            v |= flags::INPUT_LINE_MODE;
        }
        v
    }
}

impl Context {
    /// Whether any input is ready to read, staged or still in the ring.
    pub fn input_available(&mut self) -> bool {
        if !self.is_live() {
            return false;
        }
        if !self.in_stage.exhausted() {
            return true;
        }
        fence(Ordering::Acquire);
        let head = self.rd_u32(offsets::IN_HEAD);
        let tail = self.rd_u32(offsets::IN_TAIL);
        !is_empty(head, tail)
    }

    /// Free bytes in the input ring, i.e. how much the host could still
    /// inject before splitting across ticks.
    pub fn input_get_free_space(&mut self) -> u32 {
        if !self.is_live() {
            return 0;
        }
        self.lock();
        let head = self.rd_u32(offsets::IN_HEAD);
        let tail = self.rd_u32(offsets::IN_TAIL);
        let n = free(head, tail, self.arenas.in_size);
        self.unlock();
        n
    }

    /// Raises `INPUT_REQUESTED` with the given prompt hints.
    ///
    /// The request-mask bits are rewritten as a group, so repeating a
    /// request (or changing the hints) leaves exactly one request's worth
    /// of bits in the flags word.
    pub fn input_request(&mut self, f: InputFlags) -> bool {
        if !self.is_live() {
            return false;
        }
        self.lock();
        self.flag_clear(flags::INPUT_REQUEST_MASK);
        self.flag_set(flags::INPUT_REQUESTED | f.bits());
        self.unlock();
        true
    }

    /// Next input byte, or `None` when neither staging nor the ring has
    /// anything left.
    pub fn input_getc(&mut self) -> Option<u8> {
        if !self.is_live() {
            return None;
        }
        self.lock();
        let b = self.input_getc_locked();
        self.unlock();
        b
    }

    /// Fills `buf` with available input. Returns the byte count.
    pub fn input_gets(&mut self, buf: &mut [u8]) -> usize {
        if !self.is_live() {
            return 0;
        }
        self.lock();
        let mut n = 0;
        while n < buf.len() {
            match self.input_getc_locked() {
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

    fn input_getc_locked(&mut self) -> Option<u8> {
        if self.in_stage.exhausted() && !self.input_read_next_locked() {
            return None;
        }
        let b = self.in_stage.buf[self.in_stage.off];
        self.in_stage.off += 1;
        Some(b)
    }

    /// Pulls the next newline-framed run out of the input ring. Drops
    /// `INPUT_AVAILABLE` once the ring is empty and retires the
    /// outstanding request once bytes actually arrived.
    fn input_read_next_locked(&mut self) -> bool {
        let size = self.arenas.in_size;
        fence(Ordering::Acquire);
        let head = self.rd_u32(offsets::IN_HEAD);
        let mut tail = self.rd_u32(offsets::IN_TAIL);

        self.in_stage.reset();
        while tail != head && self.in_stage.len < MAX_ENTRY - 1 {
            let b = self.rd_byte(self.arenas.in_off + tail as usize);
            tail = advance(tail, 1, size);
            self.in_stage.buf[self.in_stage.len] = b;
            self.in_stage.len += 1;
            if b == b'\n' {
                break;
            }
        }
        self.wr_u32(offsets::IN_TAIL, tail);

        if tail == head {
            self.flag_clear(flags::INPUT_AVAILABLE);
        }
        if self.in_stage.len > 0 {
            self.flag_clear(flags::INPUT_REQUEST_MASK);
        }
        self.in_stage.len > 0
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
        r.ctx.clear();
        r
    }

    fn header(r: &TestRegion) -> Header {
        Header::decode(r.raw()).unwrap()
    }

    /// Plays the host: drops bytes into the input ring and publishes
    /// `in_head` plus `INPUT_AVAILABLE`, clearing `INPUT_REQUESTED` after
    /// the injection like a real monitor.
    fn inject(r: &mut TestRegion, bytes: &[u8]) {
        let h = header(r);
        let mut head = h.in_head;
        for &b in bytes {
            r.ctx
                .wr_byte(r.ctx.arenas.in_off + head as usize, b);
            head = advance(head, 1, h.in_size);
        }
        r.ctx.wr_u32(offsets::IN_HEAD, head);
        r.ctx.flag_set(flags::INPUT_AVAILABLE);
        r.ctx.flag_clear(flags::INPUT_REQUESTED);
    }

    #[test]
    fn request_sets_flag_and_hints() {
        let mut r = region(1024);
        r.ctx.input_request(InputFlags { echo_off: true, line_mode: true });
        let f = header(&r).flags;
        assert_ne!(f & flags::INPUT_REQUESTED, 0);
        assert_ne!(f & flags::INPUT_ECHO_OFF, 0);
        assert_ne!(f & flags::INPUT_LINE_MODE, 0);
    }

    #[test]
    fn request_is_idempotent_and_rewrites_hints() {
        let mut r = region(1024);
        r.ctx.input_request(InputFlags { echo_off: true, line_mode: true });
        let once = header(&r).flags;
        r.ctx.input_request(InputFlags { echo_off: true, line_mode: true });
        assert_eq!(once, header(&r).flags);

        // Changing the hints replaces the old ones.
        r.ctx.input_request(InputFlags::default());
        let f = header(&r).flags;
        assert_ne!(f & flags::INPUT_REQUESTED, 0);
        assert_eq!(f & flags::INPUT_ECHO_OFF, 0);
        assert_eq!(f & flags::INPUT_LINE_MODE, 0);
    }

    #[test]
    fn injected_line_reads_back_and_clears_flags() {
        let mut r = region(1024);
        r.ctx.input_request(InputFlags { line_mode: true, ..Default::default() });
        inject(&mut r, b"pw\n");
        assert!(r.ctx.input_available());

        let mut buf = [0u8; 16];
        let n = r.ctx.input_gets(&mut buf);
        assert_eq!(&buf[..n], b"pw\n");

        let f = header(&r).flags;
        assert_eq!(f & flags::INPUT_AVAILABLE, 0);
        assert_eq!(f & flags::INPUT_REQUESTED, 0);
        assert_eq!(f & flags::INPUT_LINE_MODE, 0);
        assert!(!r.ctx.input_available());
    }

    #[test]
    fn getc_walks_bytes_across_the_wrap() {
        let mut r = region(1024);
        let size = header(&r).in_size;
        // Park the ring near its end so the injected bytes wrap.
        let start = size - 2;
        r.ctx.wr_u32(offsets::IN_HEAD, start);
        r.ctx.wr_u32(offsets::IN_TAIL, start);
        inject(&mut r, b"abcd\n");

        let got: Vec<u8> = std::iter::from_fn(|| r.ctx.input_getc()).collect();
        assert_eq!(got, b"abcd\n");
        assert_eq!(header(&r).in_tail, advance(start, 5, size));
    }

    #[test]
    fn free_space_shrinks_with_injection() {
        let mut r = region(1024);
        let size = header(&r).in_size;
        assert_eq!(r.ctx.input_get_free_space(), size - 1);
        inject(&mut r, b"xy");
        assert_eq!(r.ctx.input_get_free_space(), size - 3);
    }

    #[test]
    fn dead_region_returns_sentinels() {
        let mut r = region(1024);
        r.ctx.destroy();
        assert!(!r.ctx.input_available());
        assert_eq!(r.ctx.input_getc(), None);
        assert!(!r.ctx.input_request(InputFlags::default()));
        assert_eq!(r.ctx.input_get_free_space(), 0);
    }
}
