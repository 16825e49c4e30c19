//! Bit layout shared by every participating rank.
//!
//! Packed words cross address-space boundaries as raw `u64`s, so the layout
//! is fixed with explicit shifts and masks:
//!
//! ```text
//!  63            51 50           38 37                             0
//! +----------------+---------------+--------------------------------+
//! |    counter     |     rank      |             offset             |
//! +----------------+---------------+--------------------------------+
//! ```
//!
//! A [`GlobalAddress`] leaves the counter bits zero.

use common::{RmaError, Result};
use std::fmt;

/// Bits reserved for a rank; bounds the number of participating ranks.
pub const RANK_BITS: u32 = 13;
/// Bits of the external reference counter, sized like the rank field.
pub const EXTERNAL_COUNTER_BITS: u32 = RANK_BITS;
/// Remaining bits address a slot inside a rank's node array.
pub const OFFSET_BITS: u32 = 64 - RANK_BITS * 2;

pub const RANK_SHIFT: u32 = OFFSET_BITS;
pub const EXTERNAL_COUNTER_SHIFT: u32 = OFFSET_BITS + RANK_BITS;

pub const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;
pub const RANK_MASK: u64 = (1 << RANK_BITS) - 1;
pub const EXTERNAL_COUNTER_MASK: u64 = (1 << EXTERNAL_COUNTER_BITS) - 1;

/// Reserved rank meaning "no address".
pub const DUMMY_RANK: u64 = (1 << RANK_BITS) - 1;

/// Exclusive upper bound of a slot offset.
pub const OFFSET_LIMIT: u64 = 1 << OFFSET_BITS;

pub fn is_valid_rank(rank: u64) -> bool {
    rank < DUMMY_RANK
}

/// A `(rank, offset)` pair identifying a slot anywhere in the distributed
/// node arrays. The same pair addresses the payload of that slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalAddress {
    offset: u64,
    rank: u64,
}

impl GlobalAddress {
    pub fn new(rank: u64, offset: u64) -> Result<Self> {
        if !is_valid_rank(rank) {
            return Err(RmaError::FieldOverflow {
                field: "rank",
                value: rank,
                bits: RANK_BITS,
            });
        }
        if offset >= OFFSET_LIMIT {
            return Err(RmaError::FieldOverflow {
                field: "offset",
                value: offset,
                bits: OFFSET_BITS,
            });
        }
        Ok(Self { offset, rank })
    }

    pub const fn dummy() -> Self {
        Self {
            offset: 0,
            rank: DUMMY_RANK,
        }
    }

    pub fn is_dummy(&self) -> bool {
        self.rank == DUMMY_RANK
    }

    pub fn rank(&self) -> u64 {
        self.rank
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn to_bits(self) -> u64 {
        (self.rank << RANK_SHIFT) | self.offset
    }

    /// Counter bits, if any, are ignored.
    pub fn from_bits(bits: u64) -> Self {
        Self {
            offset: bits & OFFSET_MASK,
            rank: (bits >> RANK_SHIFT) & RANK_MASK,
        }
    }
}

impl Default for GlobalAddress {
    fn default() -> Self {
        Self::dummy()
    }
}

impl fmt::Debug for GlobalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_dummy() {
            return write!(f, "GlobalAddress(dummy)");
        }
        write!(f, "GlobalAddress(rank {}, offset {})", self.rank, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_widths_fill_one_word() {
        assert_eq!(OFFSET_BITS + RANK_BITS + EXTERNAL_COUNTER_BITS, 64);
        assert_eq!(DUMMY_RANK, 8191);
        assert_eq!(OFFSET_BITS, 38);
    }

    #[test]
    fn packing_is_bit_exact() {
        let addr = GlobalAddress::new(3, 0x2a).unwrap();
        assert_eq!(addr.to_bits(), (3u64 << 38) | 0x2a);
        assert_eq!(GlobalAddress::from_bits(addr.to_bits()), addr);
        assert_eq!(GlobalAddress::dummy().to_bits(), 8191u64 << 38);
    }

    #[test]
    fn from_bits_drops_counter() {
        let bits = (5u64 << EXTERNAL_COUNTER_SHIFT) | (1 << RANK_SHIFT) | 9;
        let addr = GlobalAddress::from_bits(bits);
        assert_eq!((addr.rank(), addr.offset()), (1, 9));
    }

    #[test]
    fn rejects_out_of_range_fields() {
        assert!(GlobalAddress::new(DUMMY_RANK, 0).is_err());
        assert!(GlobalAddress::new(0, OFFSET_LIMIT).is_err());
        assert!(GlobalAddress::new(DUMMY_RANK - 1, OFFSET_LIMIT - 1).is_ok());
        assert!(GlobalAddress::default().is_dummy());
        assert!(!is_valid_rank(DUMMY_RANK));
    }
}
