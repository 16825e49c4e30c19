use crate::counted::CountedNodePtr;
use std::mem::{offset_of, size_of};
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

/// Per-slot record of the distributed node array.
///
/// The first word holds the `acquired` flag (bit 0 of a `u32`, the other
/// bits stay zero) and the signed internal reference counter; the second
/// word is the packed [`CountedNodePtr`] to the next node. Remote ranks
/// address the fields by the byte offsets below, so the layout is part of
/// the shared-memory contract.
#[repr(C)]
pub struct Node {
    acquired: AtomicU32,
    internal_counter: AtomicI32,
    next: AtomicU64,
}

pub const ACQUIRED_OFFSET: usize = offset_of!(Node, acquired);
pub const INTERNAL_COUNTER_OFFSET: usize = offset_of!(Node, internal_counter);
pub const NEXT_OFFSET: usize = offset_of!(Node, next);
pub const NODE_SIZE: usize = size_of::<Node>();

const _: () = assert!(ACQUIRED_OFFSET == 0);
const _: () = assert!(INTERNAL_COUNTER_OFFSET == 4);
const _: () = assert!(NEXT_OFFSET == 8);
const _: () = assert!(NODE_SIZE == 16);

pub const FREE: u32 = 0;
pub const ACQUIRED: u32 = 1;

impl Node {
    pub fn new() -> Self {
        Self {
            acquired: AtomicU32::new(FREE),
            internal_counter: AtomicI32::new(0),
            next: AtomicU64::new(CountedNodePtr::default().to_bits()),
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired.load(Ordering::SeqCst) & ACQUIRED != 0
    }

    pub fn next(&self) -> CountedNodePtr {
        CountedNodePtr::from_bits(self.next.load(Ordering::SeqCst))
    }
}

impl Default for Node {
    fn default() -> Self {
        Self::new()
    }
}
