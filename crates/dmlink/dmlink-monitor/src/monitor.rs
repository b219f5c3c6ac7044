//! The periodic monitor loop.
//!
//! Each tick re-reads the control header through the probe, drains new
//! output to the console, answers a pending input request, and advances
//! any file transfer in flight. The firmware is never called; every
//! interaction is a header field changing under one side's hands and
//! being noticed by the other.

use crate::console::Console;
use crate::error::MonitorError;
use crate::transfer::TransferDriver;
use dmlink_layout::{advance, flags, free, offsets, used, Header, HEADER_LEN};
use dmlink_probe::{ProbeBackend, ProbeError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Monitor behavior knobs, the file/CLI surface distilled to what the
/// loop itself needs.
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// Absolute address of the shared region on the target.
    pub region_addr: u64,
    /// Sleep between ticks.
    pub interval: Duration,
    /// Hold the region lock (`BUSY`) across each tick so firmware backs
    /// off while the host is mid-read.
    pub blocking: bool,
    /// Read the whole region in one probe round-trip per tick instead
    /// of per-step reads. Staler, but far fewer round-trips on slow
    /// probes.
    pub snapshot: bool,
    /// Prefix each drained line with a wall-clock timestamp.
    pub timestamps: bool,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            region_addr: 0,
            interval: Duration::from_millis(100),
            blocking: false,
            snapshot: false,
            timestamps: false,
        }
    }
}

/// What one tick accomplished; `run` uses it for pacing and shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No initialized region at the configured address (yet).
    NoRegion,
    /// Region alive, nothing to do.
    Idle,
    /// Bytes or flags moved.
    Active,
    /// The firmware zeroed the magic: orderly end of the session.
    Stopped,
}

/// One tick's view of target memory.
enum RegionView {
    HeaderOnly(Vec<u8>),
    Full(Vec<u8>),
}

impl RegionView {
    fn header_bytes(&self) -> &[u8] {
        match self {
            RegionView::HeaderOnly(h) => h,
            RegionView::Full(r) => &r[..HEADER_LEN],
        }
    }
}

/// Host-side monitor engine, generic over the probe backend and the
/// console implementation.
pub struct Monitor<P: ProbeBackend, C: Console> {
    probe: P,
    console: C,
    opts: MonitorOptions,

    /// Lines answered to firmware input requests before the console's
    /// own input is consulted.
    script_lines: VecDeque<String>,
    /// Input bytes accepted but not yet injected (ring was full, or the
    /// bytes arrived before a request). Drains as space appears.
    pending_input: VecDeque<u8>,

    transfer: TransferDriver,

    /// Region length learned from the first valid header; enables
    /// snapshot mode.
    region_len: Option<usize>,
    seen_live: bool,
    bad_header_streak: u32,
    at_line_start: bool,

    stop: Arc<AtomicBool>,
}

impl<P: ProbeBackend, C: Console> Monitor<P, C> {
    pub fn new(probe: P, console: C, opts: MonitorOptions) -> Self {
        Self {
            probe,
            console,
            opts,
            script_lines: VecDeque::new(),
            pending_input: VecDeque::new(),
            transfer: TransferDriver::new(),
            region_len: None,
            seen_live: false,
            bad_header_streak: 0,
            at_line_start: true,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that makes `run` return after the current tick. Hand it to a
    /// signal handler.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Queues init-script lines: each answers one firmware input request
    /// before the console is consulted.
    pub fn push_script_lines<I, S>(&mut self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script_lines.extend(lines.into_iter().map(Into::into));
    }

    /// Queues raw bytes as firmware input, injected as ring space
    /// allows (the `--input-file` path).
    pub fn queue_input(&mut self, bytes: &[u8]) {
        self.pending_input.extend(bytes);
    }

    pub fn console(&self) -> &C {
        &self.console
    }

    pub fn console_mut(&mut self) -> &mut C {
        &mut self.console
    }

    /// Runs ticks at the configured interval until the region closes,
    /// the stop flag is raised, or a fatal error surfaces. The console
    /// is restored and the probe disconnected on every path out.
    pub fn run(&mut self) -> Result<(), MonitorError> {
        let result = loop {
            if self.stop.load(Ordering::Relaxed) {
                info!("interrupted, shutting down");
                break Ok(());
            }
            match self.tick() {
                Ok(TickOutcome::Stopped) => {
                    info!("region closed by firmware");
                    break Ok(());
                }
                Ok(_) => {}
                Err(e) => break Err(e),
            }
            thread::sleep(self.opts.interval);
        };
        self.console.restore();
        if let Err(e) = self.probe.disconnect() {
            warn!(error = %e, "probe disconnect failed");
        }
        result
    }

    /// One pass over the region. Transient probe failures are logged and
    /// swallowed; the next tick retries.
    pub fn tick(&mut self) -> Result<TickOutcome, MonitorError> {
        if self.opts.blocking && self.seen_live {
            // Best effort: if the flag write fails we still run the tick.
            if let Err(e) = self.set_flag_bits(flags::BUSY) {
                warn!(error = %e, "failed to assert the region lock");
            }
        }
        let out = self.tick_inner();
        if self.opts.blocking && self.seen_live {
            if let Err(e) = self.clear_flag_bits(flags::BUSY) {
                warn!(error = %e, "failed to release the region lock");
            }
        }
        out
    }

    fn tick_inner(&mut self) -> Result<TickOutcome, MonitorError> {
        let view = match self.read_region() {
            Ok(v) => v,
            Err(e) if e.is_transient() => {
                warn!(error = %e, "transient probe failure, retrying next tick");
                return Ok(TickOutcome::Idle);
            }
            Err(e) => return Err(e.into()),
        };

        let header = match Header::decode(view.header_bytes()) {
            Ok(h) => h,
            Err(reason) => {
                warn!(reason, "short header read");
                return Ok(TickOutcome::Idle);
            }
        };

        if header.magic == 0 && self.seen_live {
            return Ok(TickOutcome::Stopped);
        }
        if let Err(reason) = header.validate() {
            // Transient by declaration: mid-initialization, mid-clear, or
            // a read racing a header update.
            self.bad_header_streak += 1;
            if self.bad_header_streak % 50 == 1 {
                debug!(reason, streak = self.bad_header_streak, "region not readable");
            }
            return Ok(TickOutcome::NoRegion);
        }
        self.bad_header_streak = 0;

        if !self.seen_live {
            self.seen_live = true;
            self.region_len =
                Some(HEADER_LEN + header.out_size as usize + header.in_size as usize);
            info!(
                out_size = header.out_size,
                in_size = header.in_size,
                addr = format_args!("{:#x}", self.opts.region_addr),
                "attached to region"
            );
        }

        let mut active = false;
        match self.drain_output(&header, &view) {
            Ok(moved) => active |= moved,
            Err(MonitorError::Probe(e)) if e.is_transient() => {
                warn!(error = %e, "output drain failed, will retry")
            }
            Err(e) => return Err(e),
        }

        active |= self.service_input(&header)?;

        if header.has(flags::FILE_SEND) {
            self.transfer
                .service_send(&mut self.probe, self.opts.region_addr, &header)?;
            active = true;
        }
        if header.has(flags::FILE_RECV) {
            self.transfer
                .service_recv(&mut self.probe, self.opts.region_addr, &header)?;
            active = true;
        }

        Ok(if active { TickOutcome::Active } else { TickOutcome::Idle })
    }

    // ---- region reads --------------------------------------------------

    fn read_region(&mut self) -> Result<RegionView, ProbeError> {
        match (self.opts.snapshot, self.region_len) {
            (true, Some(len)) => {
                let raw = self.probe.read_memory(self.opts.region_addr, len)?;
                Ok(RegionView::Full(raw))
            }
            _ => {
                let raw = self.probe.read_memory(self.opts.region_addr, HEADER_LEN)?;
                Ok(RegionView::HeaderOnly(raw))
            }
        }
    }

    // ---- output drain --------------------------------------------------

    fn drain_output(
        &mut self,
        h: &Header,
        view: &RegionView,
    ) -> Result<bool, MonitorError> {
        let size = h.out_size;
        let n = used(h.out_head, h.out_tail, size);
        if n == 0 {
            return Ok(false);
        }

        let first = n.min(size - h.out_tail);
        let mut bytes = self.read_arena(h.out_base, h.out_tail, first, view)?;
        if first < n {
            // Wrap: the rest starts back at the arena base.
            bytes.extend(self.read_arena(h.out_base, 0, n - first, view)?);
        }

        let decorated = self.decorate(&bytes);
        self.console
            .write_output(&decorated)
            .map_err(MonitorError::Console)?;

        // Publish consumption only after the bytes are safely ours.
        let new_tail = advance(h.out_tail, n, size);
        self.probe.write_memory(
            self.opts.region_addr + offsets::OUT_TAIL as u64,
            &new_tail.to_le_bytes(),
        )?;
        debug!(bytes = n, new_tail, "drained output");
        Ok(true)
    }

    /// Fetches `len` arena bytes starting at `off`, from the snapshot
    /// when the tick has one, otherwise straight from the probe.
    fn read_arena(
        &mut self,
        arena_base: u64,
        off: u32,
        len: u32,
        view: &RegionView,
    ) -> Result<Vec<u8>, ProbeError> {
        if let RegionView::Full(raw) = view {
            let rel = arena_base
                .checked_sub(self.opts.region_addr)
                .map(|r| r as usize + off as usize);
            if let Some(start) = rel {
                if start + len as usize <= raw.len() {
                    return Ok(raw[start..start + len as usize].to_vec());
                }
            }
            // Arena outside the snapshot: header must be corrupt; let the
            // probe read fail or produce what it can.
        }
        self.probe.read_memory(arena_base + off as u64, len as usize)
    }

    /// Inserts the timestamp prefix at line starts when enabled.
    fn decorate(&mut self, bytes: &[u8]) -> Vec<u8> {
        if !self.opts.timestamps {
            return bytes.to_vec();
        }
        let mut out = Vec::with_capacity(bytes.len() + 32);
        for &b in bytes {
            if self.at_line_start {
                let stamp = chrono::Local::now().format("[%H:%M:%S%.3f] ");
                out.extend(stamp.to_string().into_bytes());
            }
            out.push(b);
            self.at_line_start = b == b'\n';
        }
        out
    }

    // ---- input service -------------------------------------------------

    fn service_input(&mut self, h: &Header) -> Result<bool, MonitorError> {
        if h.has(flags::INPUT_REQUESTED) && self.pending_input.is_empty() {
            if let Some(bytes) = self.collect_input(h)? {
                self.pending_input.extend(bytes);
            }
        }
        if self.pending_input.is_empty() {
            return Ok(false);
        }
        self.inject_pending(h).map_err(MonitorError::from)
    }

    /// Gets one answer for an input request: the init script first, the
    /// console after. `None` means nothing available this tick.
    fn collect_input(&mut self, h: &Header) -> Result<Option<Vec<u8>>, MonitorError> {
        if let Some(mut line) = self.script_lines.pop_front() {
            if !line.ends_with('\n') {
                line.push('\n');
            }
            debug!(line = line.trim_end(), "answering request from init script");
            return Ok(Some(line.into_bytes()));
        }

        let echo = !h.has(flags::INPUT_ECHO_OFF);
        let line_mode = h.has(flags::INPUT_LINE_MODE);
        let result = if line_mode {
            self.console.read_line(echo).map(String::into_bytes)
        } else {
            self.console.read_key(echo).map(|k| vec![k])
        };
        match result {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(MonitorError::Console(e)),
        }
    }

    /// Writes as much pending input as fits, publishing `in_head` after
    /// the payload and the flag bits after `in_head`. The remainder (if
    /// any) waits for the firmware to drain the ring.
    fn inject_pending(&mut self, h: &Header) -> Result<bool, ProbeError> {
        let space = free(h.in_head, h.in_tail, h.in_size);
        let n = (self.pending_input.len() as u32).min(space);
        if n == 0 {
            return Ok(false);
        }
        let chunk: Vec<u8> = self.pending_input.drain(..n as usize).collect();

        let first = n.min(h.in_size - h.in_head) as usize;
        self.probe
            .write_memory(h.in_base + h.in_head as u64, &chunk[..first])?;
        if first < chunk.len() {
            self.probe.write_memory(h.in_base, &chunk[first..])?;
        }

        let new_head = advance(h.in_head, n, h.in_size);
        self.probe.write_memory(
            self.opts.region_addr + offsets::IN_HEAD as u64,
            &new_head.to_le_bytes(),
        )?;
        self.set_flag_bits(flags::INPUT_AVAILABLE)?;
        // Only now may the request be considered answered: firmware must
        // never see the request satisfied while the ring is still empty.
        self.clear_flag_bits(flags::INPUT_REQUESTED)?;
        debug!(
            injected = n,
            still_pending = self.pending_input.len(),
            "input injected"
        );
        Ok(true)
    }

    // ---- flag word helpers ---------------------------------------------

    fn set_flag_bits(&mut self, bits: u32) -> Result<(), ProbeError> {
        crate::transfer::set_flag_bits(&mut self.probe, self.opts.region_addr, bits)
    }

    fn clear_flag_bits(&mut self, bits: u32) -> Result<(), ProbeError> {
        crate::transfer::clear_flag_bits(&mut self.probe, self.opts.region_addr, bits)
    }
}
