//! `dmlink-layout`: binary layout of the shared debug-monitor region.
//!
//! One contiguous block of target RAM carries everything the link needs:
//! a packed control header, then an output arena (firmware log text, read
//! by the host) and an input arena (host keystrokes, read by firmware).
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Header (580 B, packed, little-endian)                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Output arena (out_size bytes, byte ring, firmware → host)   │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Input arena (in_size bytes, byte ring, host → firmware)     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Both sides agree on this file and nothing else: the firmware accesses
//! the region through a local pointer, the host through debug-probe
//! `read_memory`/`write_memory` at the same absolute addresses. Every
//! multi-byte field is little-endian and the header carries 64-bit base
//! addresses so the layout is identical on 32-bit and 64-bit targets.
//!
//! # Internal Modules
//!
//! - `header`: field offsets, flag bits, the decoded [`Header`] view
//! - `ring`: head/tail arithmetic shared by both ring arenas
//! - `partition`: splitting a raw buffer into the two arenas

mod header;
mod partition;
mod ring;

pub use header::{Header, flags, offsets, HEADER_LEN, MAGIC, PATH_MAX, path_str};
pub use partition::{partition, Arenas, MIN_REGION_LEN};
pub use ring::{advance, free, is_empty, is_full, used};
