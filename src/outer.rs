use crate::address::GlobalAddress;
use crate::backoff::ExponentialBackoff;
use crate::config::StackConfig;
use crate::interface::Stack;
use crate::layout::{payload_address, payload_array_layout};
use crate::stack::{owns_node_array, InnerStack};
use common::{RmaError, Result, Status};
use rma::{Comm, Info, Rank, Region, Window};
use smallvec::SmallVec;
use smol_str::format_smolstr;
use std::marker::PhantomData;
use std::mem::{size_of, ManuallyDrop, MaybeUninit};
use std::slice;
use tracing::debug;

/// Payload that can be copied between ranks as raw bytes.
///
/// # Safety
/// Implementors must be inhabited by every bit pattern of their size, carry
/// no padding and hold no pointers or other process-local handles.
pub unsafe trait Plain: Copy + Send + 'static {}

macro_rules! impl_plain {
    ($($t:ty),* $(,)?) => {
        $(unsafe impl Plain for $t {})*
    };
}

impl_plain!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64);

unsafe impl<T: Plain, const N: usize> Plain for [T; N] {}

/// Typed distributed stack: the engine plus one payload slot per node.
pub struct RmaTreiberStack<T: Plain> {
    inner: InnerStack,
    payload_win: Window,
    // Other ranks address this memory until the collective release, so it is
    // never unmapped implicitly.
    payload_region: Option<ManuallyDrop<Region>>,
    payload_bases: SmallVec<[Option<u64>; 8]>,
    backoff: ExponentialBackoff,
    _marker: PhantomData<T>,
}

fn payload_base(bases: &[Option<u64>], rank: Rank) -> Result<u64> {
    match bases.get(rank).copied().flatten() {
        Some(base) => Ok(base),
        None => Err(RmaError::runtime(
            format_smolstr!("resolve the payload array of rank {rank}"),
            Status::Rank,
        )),
    }
}

fn write_payload<T: Plain>(
    win: &Window,
    bases: &[Option<u64>],
    address: GlobalAddress,
    value: &T,
) -> Result<()> {
    let rank = address.rank() as Rank;
    let addr = payload_address::<T>(payload_base(bases, rank)?, address.offset());
    // Safety: `T: Plain` has no padding, so all of its bytes are initialized.
    let bytes = unsafe { slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()) };
    let epoch = win.lock_shared(rank)?;
    epoch.put_bytes(addr, bytes)?;
    epoch.flush();
    Ok(())
}

fn read_payload<T: Plain>(
    win: &Window,
    bases: &[Option<u64>],
    address: GlobalAddress,
) -> Result<T> {
    let rank = address.rank() as Rank;
    let addr = payload_address::<T>(payload_base(bases, rank)?, address.offset());
    let mut value = MaybeUninit::<T>::zeroed();
    // Safety: the buffer covers exactly the (zeroed) storage of `value`.
    let bytes =
        unsafe { slice::from_raw_parts_mut(value.as_mut_ptr() as *mut u8, size_of::<T>()) };
    let epoch = win.lock_shared(rank)?;
    epoch.get_bytes(addr, bytes)?;
    epoch.flush();
    // Safety: every byte was written and any bit pattern is a valid `T`.
    Ok(unsafe { value.assume_init() })
}

impl<T: Plain> RmaTreiberStack<T> {
    /// Collective: every rank of `comm` must call it with the same config.
    pub fn create(comm: &Comm, info: &Info, config: &StackConfig) -> Result<Self> {
        config.validate()?;
        if size_of::<T>() == 0 {
            return Err(RmaError::InvalidConfig(
                "payload".into(),
                "zero sized payloads cannot be stored".into(),
            ));
        }
        let backoff = ExponentialBackoff::new(config.backoff_min, config.backoff_max)?;
        let inner = InnerStack::new(comm, info, config.topology, config.elems_up_limit)?;

        let payload_win = Window::create_dynamic(comm, info)?;
        let payload_region = if owns_node_array(config.topology, comm.rank()) {
            let layout = payload_array_layout::<T>(config.elems_up_limit)
                .map_err(anyhow::Error::from)?;
            Some(Region::alloc(layout.size())?)
        } else {
            None
        };
        let payload_base = payload_region
            .as_ref()
            .map(|region| payload_win.attach(region))
            .transpose()?;
        let payload_bases: SmallVec<[Option<u64>; 8]> =
            comm.all_gather(payload_base)?.into_iter().collect();
        debug!(rank = comm.rank(), ?payload_base, "payload window attached");

        Ok(Self {
            inner,
            payload_win,
            payload_region: payload_region.map(ManuallyDrop::new),
            payload_bases,
            backoff,
            _marker: PhantomData,
        })
    }

    /// Returns `false` when no slot was free.
    pub fn push(&mut self, value: T) -> Result<bool> {
        let Self {
            inner,
            payload_win,
            payload_bases,
            backoff,
            ..
        } = self;
        let mut accepted = false;
        inner.push(
            &mut |address: GlobalAddress| -> Result<()> {
                if address.is_dummy() {
                    return Ok(());
                }
                write_payload(payload_win, payload_bases, address, &value)?;
                accepted = true;
                Ok(())
            },
            || backoff.backoff(),
        )?;
        Ok(accepted)
    }

    pub fn try_pop(&mut self) -> Result<Option<T>> {
        let Self {
            inner,
            payload_win,
            payload_bases,
            backoff,
            ..
        } = self;
        let mut value = None;
        inner.pop(
            &mut |address: GlobalAddress| -> Result<()> {
                if !address.is_dummy() {
                    value = Some(read_payload::<T>(payload_win, payload_bases, address)?);
                }
                Ok(())
            },
            || backoff.backoff(),
        )?;
        Ok(value)
    }

    /// Returns `default` when the stack was empty.
    pub fn pop(&mut self, default: T) -> Result<T> {
        Ok(self.try_pop()?.unwrap_or(default))
    }

    pub fn inner(&self) -> &InnerStack {
        &self.inner
    }

    /// Collective teardown of the engine and the payload window.
    pub fn release(self) -> Result<()> {
        let Self {
            inner,
            payload_win,
            payload_region,
            ..
        } = self;
        // Waits for every rank, so nobody reads payloads past this point.
        inner.release()?;
        if let Some(region) = payload_region {
            let region = ManuallyDrop::into_inner(region);
            payload_win.detach(&region)?;
            region.free()?;
        }
        payload_win.free()
    }
}

impl<T: Plain> Stack for RmaTreiberStack<T> {
    type Value = T;

    fn push(&mut self, value: T) -> Result<bool> {
        RmaTreiberStack::push(self, value)
    }

    fn pop(&mut self, default: T) -> Result<T> {
        RmaTreiberStack::pop(self, default)
    }
}
