use crate::address::{
    GlobalAddress, DUMMY_RANK, EXTERNAL_COUNTER_BITS, EXTERNAL_COUNTER_MASK,
    EXTERNAL_COUNTER_SHIFT, OFFSET_BITS, OFFSET_LIMIT, OFFSET_MASK, RANK_BITS, RANK_MASK,
    RANK_SHIFT,
};
use common::{RmaError, Result};
use std::fmt;

/// Largest external counter value. Keeping it below the dummy sentinel caps
/// the number of concurrent holders of one head reference at `2^13 - 2`.
pub const EXTERNAL_COUNTER_MAX: u64 = DUMMY_RANK - 1;

/// Tagged pointer `{offset, rank, external counter}` packed into one word so
/// that a single remote compare-and-swap can install a node together with
/// its external reference count.
///
/// Equality compares all three fields.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CountedNodePtr(u64);

impl CountedNodePtr {
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn to_bits(self) -> u64 {
        self.0
    }

    /// Pointer to `address` held by exactly one reference.
    pub fn to_node(address: GlobalAddress) -> Result<Self> {
        let mut ptr = Self::default();
        ptr.set_rank(address.rank())?;
        ptr.set_offset(address.offset())?;
        ptr.inc_external_counter()?;
        Ok(ptr)
    }

    pub fn offset(&self) -> u64 {
        self.0 & OFFSET_MASK
    }

    pub fn rank(&self) -> u64 {
        (self.0 >> RANK_SHIFT) & RANK_MASK
    }

    pub fn external_counter(&self) -> u64 {
        (self.0 >> EXTERNAL_COUNTER_SHIFT) & EXTERNAL_COUNTER_MASK
    }

    pub fn is_dummy(&self) -> bool {
        self.rank() >= DUMMY_RANK
    }

    pub fn address(&self) -> GlobalAddress {
        GlobalAddress::from_bits(self.0)
    }

    pub fn set_offset(&mut self, offset: u64) -> Result<()> {
        if offset >= OFFSET_LIMIT {
            return Err(RmaError::FieldOverflow {
                field: "offset",
                value: offset,
                bits: OFFSET_BITS,
            });
        }
        self.0 = (self.0 & !OFFSET_MASK) | offset;
        Ok(())
    }

    /// The dummy rank itself is rejected; a null pointer is only built by
    /// [`CountedNodePtr::default`].
    pub fn set_rank(&mut self, rank: u64) -> Result<()> {
        if rank >= DUMMY_RANK {
            return Err(RmaError::FieldOverflow {
                field: "rank",
                value: rank,
                bits: RANK_BITS,
            });
        }
        self.0 = (self.0 & !(RANK_MASK << RANK_SHIFT)) | (rank << RANK_SHIFT);
        Ok(())
    }

    pub fn set_external_counter(&mut self, counter: u64) -> Result<()> {
        if counter > EXTERNAL_COUNTER_MAX {
            return Err(RmaError::FieldOverflow {
                field: "external counter",
                value: counter,
                bits: EXTERNAL_COUNTER_BITS,
            });
        }
        self.0 = (self.0 & !(EXTERNAL_COUNTER_MASK << EXTERNAL_COUNTER_SHIFT))
            | (counter << EXTERNAL_COUNTER_SHIFT);
        Ok(())
    }

    pub fn inc_external_counter(&mut self) -> Result<()> {
        self.set_external_counter(self.external_counter() + 1)
    }
}

impl Default for CountedNodePtr {
    /// Null pointer: dummy rank, offset and counter zero.
    fn default() -> Self {
        Self(DUMMY_RANK << RANK_SHIFT)
    }
}

impl fmt::Debug for CountedNodePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountedNodePtr")
            .field("rank", &self.rank())
            .field("offset", &self.offset())
            .field("ext_cnt", &self.external_counter())
            .finish()
    }
}
