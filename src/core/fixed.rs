//! Q16.16 Fixed-Point Garbage Units
//!
//! Attack shares are fractional (10 lines split over 3 targets is 3.33 each),
//! but whatever reaches a board must be a whole number of lines. Carrying the
//! fractional part in floating point drifts across platforms, so carries are
//! kept as unsigned Q16.16 integers instead.
//!
//! ## Format: Q16.16
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Bit Layout: Q16.16 (stored in a u64)                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  [ ... IIIIIIIIIIIIIIII][FFFFFFFFFFFFFFFF]                  │
//! │        └── whole lines ─┘└── 1/65536 ths ─┘                 │
//! │                                                             │
//! │  Precision: 1/65536 of a garbage line                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`split_even`] partitions an amount exactly: the shares always sum back to
//! the original amount, so no fraction is ever created or destroyed by a split.

/// Q16.16 fixed-point garbage amount.
pub type Fixed = u64;

/// Number of fractional bits (16)
pub const FIXED_SCALE: u32 = 16;

/// 1.0 line in fixed-point (65536)
pub const FIXED_ONE: Fixed = 1 << FIXED_SCALE;

/// Mask selecting the fractional bits.
const FRACTION_MASK: Fixed = FIXED_ONE - 1;

/// Convert whole lines to fixed-point.
#[inline]
pub const fn from_lines(lines: u32) -> Fixed {
    (lines as Fixed) << FIXED_SCALE
}

/// Whole lines contained in a fixed-point amount (floor).
#[inline]
pub const fn whole_lines(f: Fixed) -> u32 {
    let whole = f >> FIXED_SCALE;
    if whole > u32::MAX as Fixed {
        u32::MAX
    } else {
        whole as u32
    }
}

/// Fractional part of a fixed-point amount.
#[inline]
pub const fn fraction(f: Fixed) -> Fixed {
    f & FRACTION_MASK
}

/// Convert fixed-point to float for display and logging.
///
/// # Warning
/// Only use for visual output. Never feed the result back into a ledger.
#[inline]
pub fn to_float(f: Fixed) -> f64 {
    f as f64 / FIXED_ONE as f64
}

/// Split `lines` into `parts` shares that sum exactly to `from_lines(lines)`.
///
/// Each share is either `floor(total / parts)` or one raw unit more; the
/// leftover raw units go to the earliest shares.
pub fn split_even(lines: u32, parts: usize) -> Vec<Fixed> {
    if parts == 0 {
        return Vec::new();
    }
    let total = from_lines(lines);
    let parts_u = parts as Fixed;
    let base = total / parts_u;
    let leftover = (total % parts_u) as usize;

    (0..parts)
        .map(|i| if i < leftover { base + 1 } else { base })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_conversion() {
        assert_eq!(from_lines(1), FIXED_ONE);
        assert_eq!(whole_lines(from_lines(7)), 7);
        assert_eq!(whole_lines(FIXED_ONE - 1), 0);
        assert_eq!(fraction(from_lines(3) + 5), 5);
    }

    #[test]
    fn test_split_even_exact_division() {
        let shares = split_even(10, 2);
        assert_eq!(shares, vec![from_lines(5), from_lines(5)]);

        let shares = split_even(4, 4);
        assert!(shares.iter().all(|s| *s == FIXED_ONE));
    }

    #[test]
    fn test_split_even_conserves_total() {
        for lines in 0..40u32 {
            for parts in 1..9usize {
                let shares = split_even(lines, parts);
                assert_eq!(shares.len(), parts);
                assert_eq!(shares.iter().sum::<Fixed>(), from_lines(lines));
                let min = *shares.iter().min().unwrap();
                let max = *shares.iter().max().unwrap();
                assert!(max - min <= 1);
            }
        }
    }

    #[test]
    fn test_split_even_fractional_share() {
        // 3 lines over 5 targets is 0.6 each
        let shares = split_even(3, 5);
        for s in &shares {
            assert_eq!(whole_lines(*s), 0);
            assert!((to_float(*s) - 0.6).abs() < 1e-4);
        }
    }

    #[test]
    fn test_split_even_no_parts() {
        assert!(split_even(5, 0).is_empty());
    }
}
