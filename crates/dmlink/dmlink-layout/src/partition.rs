//! Splitting a raw buffer into header plus the two arenas.
//!
//! The firmware calls this once at region creation; `clear` relies on the
//! same numbers when it wipes both arenas as one contiguous range, so this
//! module is the single source of truth for arena placement: the output
//! arena starts right behind the header and the input arena starts right
//! behind the output arena, no padding anywhere.

use crate::header::HEADER_LEN;

/// Smallest region worth creating: header plus enough data bytes that the
/// 20% fallback still yields a non-degenerate input ring (two bytes ring
/// capacity minimum per arena, one payload byte plus the reserved slot).
pub const MIN_REGION_LEN: usize = HEADER_LEN + 10;

/// Resolved arena geometry for a region of a given total size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arenas {
    /// Output arena offset from the region start. Always `HEADER_LEN`.
    pub out_off: usize,
    /// Output arena capacity in bytes.
    pub out_size: u32,
    /// Input arena offset from the region start.
    pub in_off: usize,
    /// Input arena capacity in bytes.
    pub in_size: u32,
}

/// Splits `total_len` region bytes into the two arenas.
///
/// `cfg_input` is the requested input arena size. Two cases fall back to
/// carving 20% of the available data bytes for input instead:
///
/// - `cfg_input == 0`: the caller wants the default split;
/// - `cfg_input >= total_len - HEADER_LEN`: the request leaves no room for
///   an output arena at all, so it is treated as misconfiguration rather
///   than an error: the link still has to come up on a freshly flashed
///   board whose config does not match the linker script.
pub fn partition(total_len: usize, cfg_input: u32) -> Result<Arenas, &'static str> {
    if total_len < MIN_REGION_LEN {
        return Err("region too small");
    }
    let data = total_len - HEADER_LEN;
    if data > u32::MAX as usize {
        return Err("region too large");
    }
    let data = data as u32;

    let in_size = if cfg_input == 0 || cfg_input >= data {
        data / 5
    } else {
        cfg_input
    };
    let out_size = data - in_size;
    if in_size < 2 || out_size < 2 {
        return Err("arena too small");
    }

    Ok(Arenas {
        out_off: HEADER_LEN,
        out_size,
        in_off: HEADER_LEN + out_size as usize,
        in_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arenas_are_adjacent_and_exhaustive() {
        let total = 4096;
        let a = partition(total, 512).unwrap();
        assert_eq!(a.out_off, HEADER_LEN);
        assert_eq!(a.in_off, a.out_off + a.out_size as usize);
        assert_eq!(a.in_size, 512);
        assert_eq!(
            a.out_size as usize + a.in_size as usize,
            total - HEADER_LEN
        );
    }

    #[test]
    fn oversized_request_falls_back_to_a_fifth() {
        // Requested input >= all data bytes: fall back to data / 5.
        let total = 1024 + HEADER_LEN;
        let a = partition(total, 1024).unwrap();
        assert_eq!(a.in_size, 1024 / 5);
        assert_eq!(a.out_size, 1024 - 1024 / 5);

        let a = partition(total, 5000).unwrap();
        assert_eq!(a.in_size, 1024 / 5);
    }

    #[test]
    fn zero_request_means_default_split() {
        let total = 1000 + HEADER_LEN;
        let a = partition(total, 0).unwrap();
        assert_eq!(a.in_size, 200);
        assert_eq!(a.out_size, 800);
    }

    #[test]
    fn undersized_region_is_refused() {
        assert!(partition(MIN_REGION_LEN - 1, 0).is_err());
        assert!(partition(HEADER_LEN, 0).is_err());
        assert!(partition(0, 0).is_err());
        partition(MIN_REGION_LEN, 0).unwrap();
    }
}
