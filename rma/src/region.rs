use common::{RmaError, Result, Status};
use std::io;
use std::mem;
use std::ptr::{self, NonNull};
use tracing::trace;

/// Remote-accessible memory allocated outside of the Rust allocator.
///
/// The memory is an anonymous shared mapping: page aligned, zero filled and
/// still valid across `fork`. Unmapping happens on [`Region::free`] or on drop.
pub struct Region {
    ptr: NonNull<u8>,
    len: usize,
}

// The region is plain memory; every concurrent access goes through atomics
// or through the ownership discipline of the structure placed in it.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    #[track_caller]
    pub fn alloc(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(RmaError::runtime("allocate RMA memory", Status::Arg));
        }
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let status = match io::Error::last_os_error().raw_os_error() {
                Some(libc::ENOMEM) => Status::NoMem,
                Some(libc::EINVAL) => Status::Arg,
                _ => Status::Other,
            };
            return Err(RmaError::runtime("allocate RMA memory", status));
        }
        let Some(ptr) = NonNull::new(addr as *mut u8) else {
            return Err(RmaError::runtime("allocate RMA memory", Status::NoMem));
        };
        trace!(address = ptr.as_ptr() as u64, len, "region mapped");
        Ok(Self { ptr, len })
    }

    /// Absolute address of the first byte, as used by window operations.
    pub fn address(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Unmap the region, reporting a failure instead of ignoring it.
    #[track_caller]
    pub fn free(self) -> Result<()> {
        let rc = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
        mem::forget(self);
        if rc != 0 {
            return Err(RmaError::runtime("free RMA memory", Status::Other));
        }
        Ok(())
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_is_zeroed_and_writable() {
        let region = Region::alloc(64).expect("alloc");
        assert_eq!(region.len(), 64);
        let bytes = unsafe { std::slice::from_raw_parts_mut(region.as_ptr(), region.len()) };
        assert!(bytes.iter().all(|b| *b == 0));
        bytes[63] = 7;
        assert_eq!(bytes[63], 7);
        region.free().expect("free");
    }

    #[test]
    fn empty_region_is_rejected() {
        let err = Region::alloc(0).err().expect("must fail");
        assert_eq!(err.status(), Some(Status::Arg));
    }
}
