use crate::info::{Info, NO_LOCKS};
use crate::region::Region;
use crate::world::{Comm, Rank};
use common::{RmaError, Result, Status};
use smallvec::SmallVec;
use smol_str::format_smolstr;
use std::mem::{align_of, size_of};
use std::ptr;
use std::sync::atomic::{fence, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use tracing::{debug, trace};

#[derive(Clone, Copy, Debug)]
struct Attachment {
    base: u64,
    len: usize,
}

type Attachments = SmallVec<[Attachment; 2]>;

struct WindowShared {
    // Attachment table per rank. Detaching takes the write lock, so memory
    // is never unmapped under an access holding the read lock.
    tables: Vec<RwLock<Attachments>>,
}

/// Dynamic window: every rank attaches any number of regions and addresses
/// them by absolute address.
pub struct Window {
    comm: Comm,
    shared: Arc<WindowShared>,
    no_locks: bool,
}

/// Passive-target access epoch on one rank of a window.
///
/// Dropping the epoch unlocks the target.
pub struct Epoch<'win> {
    window: &'win Window,
    target: Rank,
    guard: Option<RwLockReadGuard<'win, Attachments>>,
}

fn resolve(table: &Attachments, addr: u64, len: usize, align: usize) -> Result<*mut u8, Status> {
    if addr % align as u64 != 0 {
        return Err(Status::RmaAttach);
    }
    let end = addr.checked_add(len as u64).ok_or(Status::RmaRange)?;
    table
        .iter()
        .find(|a| addr >= a.base && end <= a.base + a.len as u64)
        .map(|_| addr as *mut u8)
        .ok_or(Status::RmaRange)
}

impl Window {
    /// Collective: every rank of `comm` must call it in the same order.
    #[track_caller]
    pub fn create_dynamic(comm: &Comm, info: &Info) -> Result<Self> {
        let shared = (comm.rank() == 0).then(|| {
            Arc::new(WindowShared {
                tables: (0..comm.size()).map(|_| RwLock::new(SmallVec::new())).collect(),
            })
        });
        let shared = match comm.broadcast(shared, 0) {
            Ok(shared) => shared,
            Err(_) => return Err(RmaError::runtime("create RMA window", Status::Win)),
        };
        let no_locks = info.flag(NO_LOCKS);
        debug!(rank = comm.rank(), no_locks, "window created");
        Ok(Self {
            comm: comm.clone(),
            shared,
            no_locks,
        })
    }

    fn table(&self, rank: Rank) -> RwLockReadGuard<'_, Attachments> {
        self.shared.tables[rank]
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Expose `region` to the other ranks and return its base address.
    #[track_caller]
    pub fn attach(&self, region: &Region) -> Result<u64> {
        let mut table = self.shared.tables[self.comm.rank()]
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let base = region.address();
        let end = base + region.len() as u64;
        if table
            .iter()
            .any(|a| base < a.base + a.len as u64 && a.base < end)
        {
            return Err(RmaError::runtime("attach overlapping region", Status::RmaAttach));
        }
        table.push(Attachment {
            base,
            len: region.len(),
        });
        trace!(rank = self.comm.rank(), base, len = region.len(), "region attached");
        Ok(base)
    }

    #[track_caller]
    pub fn detach(&self, region: &Region) -> Result<()> {
        let mut table = self.shared.tables[self.comm.rank()]
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(pos) = table.iter().position(|a| a.base == region.address()) else {
            return Err(RmaError::runtime("detach unattached region", Status::RmaAttach));
        };
        table.remove(pos);
        trace!(rank = self.comm.rank(), base = region.address(), "region detached");
        Ok(())
    }

    /// Open a shared access epoch on `target`.
    #[track_caller]
    pub fn lock_shared(&self, target: Rank) -> Result<Epoch<'_>> {
        if target >= self.comm.size() {
            return Err(RmaError::runtime(
                format_smolstr!("lock window on rank {target}"),
                Status::Rank,
            ));
        }
        let guard = (!self.no_locks).then(|| self.table(target));
        Ok(Epoch {
            window: self,
            target,
            guard,
        })
    }

    /// Collective teardown. Regions must be detached and freed by their
    /// owners after this call returns.
    pub fn free(self) -> Result<()> {
        self.comm.barrier()?;
        debug!(rank = self.comm.rank(), "window freed");
        Ok(())
    }
}

impl<'win> Epoch<'win> {
    #[track_caller]
    fn with_target<R>(
        &self,
        addr: u64,
        len: usize,
        align: usize,
        op: impl FnOnce(*mut u8) -> R,
    ) -> Result<R> {
        let resolved = match &self.guard {
            Some(table) => resolve(table, addr, len, align).map(op),
            None => {
                let table = self.window.table(self.target);
                resolve(&table, addr, len, align).map(op)
            }
        };
        match resolved {
            Ok(value) => Ok(value),
            Err(status) => Err(RmaError::runtime(
                format_smolstr!("access {len} bytes at {addr:#x} on rank {}", self.target),
                status,
            )),
        }
    }

    #[track_caller]
    fn atomic<A, R>(&self, addr: u64, op: impl FnOnce(&A) -> R) -> Result<R> {
        // Safety: the address lies inside an attachment of the target that
        // cannot be detached while `with_target` holds its table.
        self.with_target(addr, size_of::<A>(), align_of::<A>(), |p| {
            op(unsafe { &*(p as *const A) })
        })
    }

    #[track_caller]
    pub fn fetch_u64(&self, addr: u64) -> Result<u64> {
        self.atomic(addr, |a: &AtomicU64| a.load(Ordering::SeqCst))
    }

    #[track_caller]
    pub fn fetch_u32(&self, addr: u64) -> Result<u32> {
        self.atomic(addr, |a: &AtomicU32| a.load(Ordering::SeqCst))
    }

    #[track_caller]
    pub fn put_u64(&self, addr: u64, value: u64) -> Result<()> {
        self.atomic(addr, |a: &AtomicU64| a.store(value, Ordering::SeqCst))
    }

    /// Returns the value observed before the operation.
    #[track_caller]
    pub fn compare_and_swap_u64(&self, addr: u64, expected: u64, new: u64) -> Result<u64> {
        self.atomic(addr, |a: &AtomicU64| {
            match a.compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(v) | Err(v) => v,
            }
        })
    }

    /// Returns the value observed before the operation.
    #[track_caller]
    pub fn compare_and_swap_u32(&self, addr: u64, expected: u32, new: u32) -> Result<u32> {
        self.atomic(addr, |a: &AtomicU32| {
            match a.compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(v) | Err(v) => v,
            }
        })
    }

    /// Wrapping add; returns the value observed before the operation.
    #[track_caller]
    pub fn fetch_and_add_i32(&self, addr: u64, delta: i32) -> Result<i32> {
        self.atomic(addr, |a: &AtomicI32| a.fetch_add(delta, Ordering::SeqCst))
    }

    /// Returns the value observed before the operation.
    #[track_caller]
    pub fn replace_u32(&self, addr: u64, value: u32) -> Result<u32> {
        self.atomic(addr, |a: &AtomicU32| a.swap(value, Ordering::SeqCst))
    }

    /// Non-atomic bulk read.
    #[track_caller]
    pub fn get_bytes(&self, addr: u64, out: &mut [u8]) -> Result<()> {
        self.with_target(addr, out.len(), 1, |p| unsafe {
            ptr::copy_nonoverlapping(p as *const u8, out.as_mut_ptr(), out.len())
        })
    }

    /// Non-atomic bulk write.
    #[track_caller]
    pub fn put_bytes(&self, addr: u64, input: &[u8]) -> Result<()> {
        self.with_target(addr, input.len(), 1, |p| unsafe {
            ptr::copy_nonoverlapping(input.as_ptr(), p, input.len())
        })
    }

    /// Complete every operation issued in this epoch at the target.
    pub fn flush(&self) {
        fence(Ordering::SeqCst);
    }
}
