//! Window law computation.
//!
//! SRIO address windows are sized in powers of two and programmed as a
//! "law": a window of law `L` spans `2^(L + 1)` bytes.  The smallest window
//! the transport uses has law [`BASE_LAW`] (4 KiB).

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

/// Law of the smallest window, [`BASE_LAW_SIZE`] bytes
pub const BASE_LAW: u32 = 11;

/// Size of a [`BASE_LAW`] window
pub const BASE_LAW_SIZE: u64 = 0x1000;

/// Law of the control window (4 MiB)
pub const CTL_LAW: u32 = 21;

/// Number of doublings needed to reach `n` from 1: `law(0) = 0`,
/// `law(1) = 1`, `law(n) = 1 + law(n / 2)`.  This is the bit length of `n`.
pub const fn law(n: u64) -> u32 {
    u64::BITS - n.leading_zeros()
}

/// Law of the smallest window covering `bytes`.
pub fn window_law(bytes: u64) -> u32 {
    let units = bytes.div_ceil(BASE_LAW_SIZE);
    BASE_LAW + law(units.saturating_sub(1))
}

/// Size in bytes of a window of law `law`.
pub const fn window_size(law: u32) -> u64 {
    1 << (law + 1)
}
