//! `dmlink-monitor`: the host half of the debug-monitor link.
//!
//! Attaches to a target's shared region through any
//! [`ProbeBackend`](dmlink_probe::ProbeBackend) and turns it into a
//! terminal session: firmware log lines stream out, keystrokes stream
//! in, and file transfers ride along, all over nothing but periodic
//! `read_memory`/`write_memory`.
//!
//! ```text
//!        ┌─────────────┐  header snapshots   ┌────────┐
//!  tty ◀─│   Monitor   │ ◀────────────────── │ target │
//!  kbd ─▶│  (tick loop)│ ──────────────────▶ │ region │
//!        └─────────────┘  tail/head/flag     └────────┘
//!                         publications
//! ```
//!
//! # Internal Modules
//!
//! - `monitor`: the tick loop (snapshot, drain, inject, pace)
//! - `console`: terminal abstraction (crossterm-backed and scripted)
//! - `transfer`: host half of the chunked file-transfer relay
//! - `error`: the session-fatal error taxonomy

mod console;
mod error;
mod monitor;
mod transfer;

pub use console::{Console, ScriptedConsole, TerminalConsole};
pub use error::MonitorError;
pub use monitor::{Monitor, MonitorOptions, TickOutcome};
