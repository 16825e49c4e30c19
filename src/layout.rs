use crate::counted::CountedNodePtr;
use crate::node::{Node, ACQUIRED_OFFSET, INTERNAL_COUNTER_OFFSET, NEXT_OFFSET, NODE_SIZE};
use std::alloc::{Layout, LayoutError};
use std::mem::size_of;
use std::sync::atomic::AtomicU64;

/// Memory layout helpers for the remote-accessible regions of the stack.
///
/// A node array region is a plain `[Node; capacity]`. The head region holds
/// a single packed [`CountedNodePtr`].
#[derive(Clone, Copy, Debug)]
pub struct NodeArrayLayout {
    pub layout: Layout,
    pub capacity: usize,
}

/// Compute the memory layout for a node array with the given capacity.
pub fn node_array_layout(capacity: usize) -> Result<NodeArrayLayout, LayoutError> {
    let nodes = Layout::array::<Node>(capacity)?;
    Ok(NodeArrayLayout {
        layout: nodes.pad_to_align(),
        capacity,
    })
}

/// Return a pointer to the node at `idx`.
///
/// # Safety
/// - `base` must point to a region of at least `layout.layout.size()` bytes
///   with the alignment `layout.layout.align()`.
/// - `idx` must be in `0..layout.capacity`.
pub unsafe fn node_ptr(base: *mut u8, layout: NodeArrayLayout, idx: usize) -> *mut Node {
    assert!(idx < layout.capacity, "node index out of range");
    (base as *mut Node).add(idx)
}

/// Write a free, unlinked node into every slot.
///
/// # Safety
/// Same requirements as [`node_ptr`]; the region must not be visible to other
/// ranks yet.
pub unsafe fn init_node_array(base: *mut u8, layout: NodeArrayLayout) {
    for idx in 0..layout.capacity {
        node_ptr(base, layout, idx).write(Node::new());
    }
}

pub fn head_layout() -> Layout {
    Layout::new::<AtomicU64>()
}

/// Store the null pointer into a fresh head region.
///
/// # Safety
/// `base` must point to at least `head_layout().size()` bytes aligned to
/// `head_layout().align()`, not yet visible to other ranks.
pub unsafe fn init_head(base: *mut u8) {
    (base as *mut AtomicU64).write(AtomicU64::new(CountedNodePtr::default().to_bits()));
}

// Absolute target addresses of node fields, given the array base address
// published by the owning rank.

pub fn node_address(base: u64, offset: u64) -> u64 {
    base + offset * NODE_SIZE as u64
}

pub fn acquired_address(base: u64, offset: u64) -> u64 {
    node_address(base, offset) + ACQUIRED_OFFSET as u64
}

pub fn internal_counter_address(base: u64, offset: u64) -> u64 {
    node_address(base, offset) + INTERNAL_COUNTER_OFFSET as u64
}

pub fn next_address(base: u64, offset: u64) -> u64 {
    node_address(base, offset) + NEXT_OFFSET as u64
}

/// Layout of a payload array holding one `T` per node slot.
pub fn payload_array_layout<T>(capacity: usize) -> Result<Layout, LayoutError> {
    Ok(Layout::array::<T>(capacity)?.pad_to_align())
}

pub fn payload_address<T>(base: u64, offset: u64) -> u64 {
    base + offset * size_of::<T>() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc, dealloc};

    #[test]
    fn node_array_is_initialized_in_place() {
        let capacity = 4usize;
        let layout = node_array_layout(capacity).expect("layout");
        assert_eq!(layout.layout.size(), capacity * NODE_SIZE);

        unsafe {
            let base = alloc(layout.layout);
            assert!(!base.is_null(), "allocation failed");
            init_node_array(base, layout);
            for idx in 0..capacity {
                let node = &*node_ptr(base, layout, idx);
                assert!(!node.is_acquired());
                assert!(node.next().is_dummy());
            }
            dealloc(base, layout.layout);
        }
    }

    #[test]
    fn field_addresses() {
        assert_eq!(node_address(0x1000, 3), 0x1030);
        assert_eq!(acquired_address(0x1000, 3), 0x1030);
        assert_eq!(internal_counter_address(0x1000, 3), 0x1034);
        assert_eq!(next_address(0x1000, 3), 0x1038);
        assert_eq!(payload_address::<u32>(0x2000, 5), 0x2014);
    }

    #[test]
    fn payload_layout_size() {
        let layout = payload_array_layout::<[u16; 3]>(10).expect("layout");
        assert_eq!(layout.size(), 60);
    }
}
