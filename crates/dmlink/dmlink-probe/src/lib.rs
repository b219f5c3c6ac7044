//! `dmlink-probe`: memory access to a live target, behind one trait.
//!
//! The monitor never speaks a debug-server dialect itself. It needs
//! exactly four things from whatever is attached to the target: connect,
//! disconnect, read a byte range, write a byte range. Everything else
//! (telnet command grammar, remote-serial packet framing, mmap files) is
//! a backend detail behind [`ProbeBackend`].
//!
//! # Backends
//!
//! - [`TelnetProbe`]: command-console servers that dump and patch memory
//!   with `mdw`/`mww` word commands
//! - [`GdbProbe`]: remote-serial-protocol stubs (`m`/`M` packets with
//!   ack/nak framing and run-length-encoded replies)
//! - [`LoopbackProbe`]: in-process memory or a mapped region file, for
//!   tests and probe-less demos
//!
//! Addresses are 64-bit everywhere. Backends for 32-bit-only dialects
//! document how they truncate.

mod error;
mod gdb;
mod loopback;
mod telnet;

pub use error::ProbeError;
pub use gdb::GdbProbe;
pub use loopback::LoopbackProbe;
pub use telnet::TelnetProbe;

/// Contract every monitor backend fulfills.
///
/// Implementations are single-connection and not thread-safe; the
/// monitor is a single-threaded loop and drives exactly one backend.
pub trait ProbeBackend {
    /// Reads `len` bytes of target memory starting at `addr`.
    fn read_memory(&mut self, addr: u64, len: usize) -> Result<Vec<u8>, ProbeError>;

    /// Writes `data` into target memory starting at `addr`.
    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<(), ProbeError>;

    /// Tears the connection down. Safe to call more than once.
    fn disconnect(&mut self) -> Result<(), ProbeError>;
}
