//! `dmlink-target`: the firmware half of the debug-monitor link.
//!
//! A [`Context`] owns the shared region (header plus the two ring arenas)
//! and gives firmware code a line-oriented log sink, a keystroke source,
//! and host-assisted file transfers, all without ever calling the host.
//! Coordination happens purely through header fields that the host monitor
//! polls over a debug probe.
//!
//! ```text
//! ┌──────────┐   puts/flush    ┌──────────────┐    probe reads    ┌─────────┐
//! │ firmware │ ──────────────▶ │ output arena │ ────────────────▶ │ monitor │
//! │  Context │ ◀────────────── │ input arena  │ ◀──────────────── │  (host) │
//! └──────────┘  input_getc     └──────────────┘   probe writes    └─────────┘
//! ```
//!
//! The engine is single-threaded by design. The region lock (the `BUSY`
//! header bit) only serializes re-entrant calls on the same context and
//! fences off windows in which the host patches header fields; it is not a
//! general mutual-exclusion primitive.
//!
//! # Internal Modules
//!
//! - `context`: region lifecycle, the lock, volatile header access, `clear`
//! - `output`: line assembly into the output ring and diagnostic read-back
//! - `input`: input ring draining and the input-request handshake
//! - `transfer`: chunked file send/receive over the header transfer slots
//! - `default_ctx`: the process-wide ambient context slot

mod context;
mod default_ctx;
mod error;
mod input;
mod output;
mod transfer;

pub use context::{Context, ContextConfig, MAX_ENTRY};
pub use default_ctx::{install_default, take_default, with_default};
pub use error::TargetError;
pub use input::InputFlags;
