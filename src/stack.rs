use crate::address::{GlobalAddress, DUMMY_RANK, OFFSET_LIMIT};
use crate::counted::CountedNodePtr;
use crate::fsm::engine::StateMachine;
use crate::fsm::{Action, EngineEvent, EngineState};
use crate::layout::{
    acquired_address, head_layout, init_head, init_node_array, internal_counter_address,
    next_address, node_array_layout,
};
use crate::node::{ACQUIRED, FREE};
use common::{RmaError, Result, Status};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rma::{Comm, Epoch, Info, Rank, Region, Window};
use smallvec::SmallVec;
use smol_str::format_smolstr;
use std::fmt;
use std::mem;
use std::str::FromStr;
use tracing::{debug, info, trace, warn};

/// Rank that owns the head cell (and every node in the centralized topology).
pub const HEAD_RANK: Rank = 0;

/// Share of the slots probed at random before the linear scan.
pub const RANDOM_TRIES_SHARE: f64 = 0.05;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Topology {
    /// Head and every node live on [`HEAD_RANK`].
    Centralized,
    /// Every rank owns a node array; pushes allocate on the caller's rank.
    Decentralized,
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topology::Centralized => write!(f, "centralized"),
            Topology::Decentralized => write!(f, "decentralized"),
        }
    }
}

impl FromStr for Topology {
    type Err = RmaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "centralized" => Ok(Topology::Centralized),
            "decentralized" => Ok(Topology::Decentralized),
            other => Err(RmaError::InvalidConfig(
                "topology".into(),
                format_smolstr!("unknown topology '{other}'"),
            )),
        }
    }
}

/// Whether `rank` holds a node array under `topology`.
pub fn owns_node_array(topology: Topology, rank: Rank) -> bool {
    match topology {
        Topology::Centralized => rank == HEAD_RANK,
        Topology::Decentralized => true,
    }
}

/// Stores the caller's value into a freshly reserved slot.
///
/// Called exactly once per push, before the slot is published. A dummy
/// address means the stack had no free slot.
pub trait PutData {
    fn put(&mut self, address: GlobalAddress) -> Result<()>;
}

/// Copies the value out of an unlinked slot.
///
/// Called exactly once per pop, before the slot may be released. A dummy
/// address means the stack was empty.
pub trait GetData {
    fn get(&mut self, address: GlobalAddress) -> Result<()>;
}

impl<F> PutData for F
where
    F: FnMut(GlobalAddress) -> Result<()>,
{
    fn put(&mut self, address: GlobalAddress) -> Result<()> {
        self(address)
    }
}

impl<F> GetData for F
where
    F: FnMut(GlobalAddress) -> Result<()>,
{
    fn get(&mut self, address: GlobalAddress) -> Result<()> {
        self(address)
    }
}

struct SharedMemory {
    nodes_win: Window,
    head_win: Window,
    nodes_region: Option<Region>,
    head_region: Option<Region>,
}

/// Payload-agnostic lock-free stack engine shared by a group of ranks.
///
/// The head is a [`CountedNodePtr`] on [`HEAD_RANK`]; nodes are reclaimed
/// with split reference counting: every reference taken through the head
/// bumps the external counter in the head word, and every dropped reference
/// is settled in the node's internal counter. The rank whose settlement
/// brings the internal counter to zero releases the slot.
///
/// Construction and [`InnerStack::release`] are collective.
pub struct InnerStack {
    comm: Comm,
    topology: Topology,
    elems_up_limit: usize,
    // Node array base address per rank, `None` for ranks without an array.
    node_bases: SmallVec<[Option<u64>; 8]>,
    head_address: u64,
    memory: Option<SharedMemory>,
    state: StateMachine,
    rng: SmallRng,
}

impl InnerStack {
    /// Collective: every rank of `comm` must call it with the same arguments.
    pub fn new(
        comm: &Comm,
        info: &Info,
        topology: Topology,
        elems_up_limit: usize,
    ) -> Result<Self> {
        if elems_up_limit == 0 {
            return Err(RmaError::InvalidConfig(
                "elems_up_limit".into(),
                "must be positive".into(),
            ));
        }
        if elems_up_limit as u64 > OFFSET_LIMIT {
            return Err(RmaError::InvalidConfig(
                "elems_up_limit".into(),
                format_smolstr!("{elems_up_limit} slots do not fit the offset field"),
            ));
        }
        if comm.size() as u64 >= DUMMY_RANK {
            return Err(RmaError::runtime(
                format_smolstr!("build a stack over {} ranks", comm.size()),
                Status::Size,
            ));
        }
        let rank = comm.rank();

        let nodes_win = Window::create_dynamic(comm, info)?;
        let head_win = Window::create_dynamic(comm, info)?;

        let nodes_region = if owns_node_array(topology, rank) {
            let layout = node_array_layout(elems_up_limit).map_err(anyhow::Error::from)?;
            let region = Region::alloc(layout.layout.size())?;
            // Safety: the region is page aligned, large enough for the array
            // and not attached yet.
            unsafe { init_node_array(region.as_ptr(), layout) };
            Some(region)
        } else {
            None
        };
        let node_base = nodes_region
            .as_ref()
            .map(|region| nodes_win.attach(region))
            .transpose()?;

        let head_region = if rank == HEAD_RANK {
            let region = Region::alloc(head_layout().size())?;
            // Safety: same as above, a page easily holds the head word.
            unsafe { init_head(region.as_ptr()) };
            Some(region)
        } else {
            None
        };
        let head_base = head_region
            .as_ref()
            .map(|region| head_win.attach(region))
            .transpose()?;

        let node_bases: SmallVec<[Option<u64>; 8]> =
            comm.all_gather(node_base)?.into_iter().collect();
        let head_address = comm.broadcast(head_base, HEAD_RANK)?;
        comm.barrier()?;
        debug!(rank, %topology, elems_up_limit, head_address, "stack created");

        Ok(Self {
            comm: comm.clone(),
            topology,
            elems_up_limit,
            node_bases,
            head_address,
            memory: Some(SharedMemory {
                nodes_win,
                head_win,
                nodes_region,
                head_region,
            }),
            state: StateMachine::new(),
            rng: SmallRng::from_os_rng(),
        })
    }

    pub fn rank(&self) -> Rank {
        self.comm.rank()
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Slots per node array.
    pub fn elems_up_limit(&self) -> usize {
        self.elems_up_limit
    }

    /// Rank whose node array serves pushes issued by this rank.
    pub fn push_target(&self) -> Rank {
        match self.topology {
            Topology::Centralized => HEAD_RANK,
            Topology::Decentralized => self.comm.rank(),
        }
    }

    pub fn push<P>(&mut self, put: &mut P, mut backoff: impl FnMut()) -> Result<()>
    where
        P: PutData + ?Sized,
    {
        self.transition(EngineEvent::Operate)?;
        let result = self.push_inner(put, &mut backoff);
        self.poison_on_error(result)
    }

    pub fn pop<G>(&mut self, get: &mut G, mut backoff: impl FnMut()) -> Result<()>
    where
        G: GetData + ?Sized,
    {
        self.transition(EngineEvent::Operate)?;
        let result = self.pop_inner(get, &mut backoff);
        self.poison_on_error(result)
    }

    fn push_inner<P>(&mut self, put: &mut P, backoff: &mut impl FnMut()) -> Result<()>
    where
        P: PutData + ?Sized,
    {
        let rank = self.comm.rank();
        let target = self.push_target();
        let address = self.acquire_node(target)?;
        if address.is_dummy() {
            debug!(rank, target, "push rejected, no free slot");
            return put.put(address);
        }

        // Read before the payload write; a stale head only costs a retry.
        let mut observed = self.fetch_head()?;
        if let Err(err) = put.put(address) {
            self.release_node(address)?;
            return Err(err);
        }

        let new_head = CountedNodePtr::to_node(address)?;
        let next = next_address(self.node_base(target)?, address.offset());
        loop {
            self.with_nodes(target, |epoch| epoch.put_u64(next, observed.to_bits()))?;
            let current = self.compare_and_swap_head(observed, new_head)?;
            if current == observed {
                trace!(rank, ?address, previous = ?observed, "node pushed");
                return Ok(());
            }
            trace!(rank, expected = ?observed, ?current, "push lost the head race");
            backoff();
            observed = current;
        }
    }

    fn pop_inner<G>(&mut self, get: &mut G, backoff: &mut impl FnMut()) -> Result<()>
    where
        G: GetData + ?Sized,
    {
        let rank = self.comm.rank();
        let mut observed = self.fetch_head()?;
        loop {
            let claimed = self.increase_head_count(observed)?;
            if claimed.is_dummy() {
                trace!(rank, "pop found the stack empty");
                return get.get(GlobalAddress::dummy());
            }

            let address = claimed.address();
            let owner = address.rank() as Rank;
            let base = self.node_base(owner)?;
            let next = self.with_nodes(owner, |epoch| {
                epoch.fetch_u64(next_address(base, address.offset()))
            })?;
            let next = CountedNodePtr::from_bits(next);

            let current = self.compare_and_swap_head(claimed, next)?;
            if current == claimed {
                let read = get.get(address);
                self.settle_unlinked(claimed)?;
                return read;
            }

            self.settle_lost_claim(address)?;
            backoff();
            observed = current;
        }
    }

    /// Settle the references of a node this rank unlinked from the head.
    /// Returns whether the slot was released.
    fn settle_unlinked(&self, claimed: CountedNodePtr) -> Result<bool> {
        let address = claimed.address();
        let owner = address.rank() as Rank;
        let counter = internal_counter_address(self.node_base(owner)?, address.offset());
        // The unlink consumed this rank's own claim and the reference held by
        // the head itself.
        let delta = claimed.external_counter() as i32 - 2;
        let prev = self.with_nodes(owner, |epoch| epoch.fetch_and_add_i32(counter, delta))?;
        trace!(
            rank = self.comm.rank(),
            ?address,
            ext_cnt = claimed.external_counter(),
            prev,
            "node unlinked"
        );
        if prev == -delta {
            self.release_node(address)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Drop the reference a pop claimed on a node it failed to unlink.
    /// Returns whether the slot was released.
    fn settle_lost_claim(&self, address: GlobalAddress) -> Result<bool> {
        let owner = address.rank() as Rank;
        let counter = internal_counter_address(self.node_base(owner)?, address.offset());
        let prev = self.with_nodes(owner, |epoch| epoch.fetch_and_add_i32(counter, -1))?;
        trace!(rank = self.comm.rank(), ?address, prev, "pop lost the head race");
        if prev == 1 {
            self.release_node(address)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Internal reference counter of the node at `address`.
    fn internal_counter(&self, address: GlobalAddress) -> Result<i32> {
        let owner = address.rank() as Rank;
        let base = self.node_base(owner)?;
        let bits = self.with_nodes(owner, |epoch| {
            epoch.fetch_u32(internal_counter_address(base, address.offset()))
        })?;
        Ok(bits as i32)
    }

    /// Take a reference on the head node by bumping the head's external
    /// counter. A dummy head is returned as is.
    fn increase_head_count(&self, observed: CountedNodePtr) -> Result<CountedNodePtr> {
        let mut observed = observed;
        loop {
            if observed.is_dummy() {
                return Ok(observed);
            }
            let mut claimed = observed;
            claimed.inc_external_counter()?;
            let current = self.compare_and_swap_head(observed, claimed)?;
            if current == observed {
                return Ok(claimed);
            }
            observed = current;
        }
    }

    /// Reserve a free slot on `rank`, or return the dummy address when the
    /// rank has no free slot or no node array at all.
    fn acquire_node(&mut self, rank: Rank) -> Result<GlobalAddress> {
        let Some(base) = self.node_bases.get(rank).copied().flatten() else {
            debug!(rank = self.comm.rank(), target = rank, "no node array on target rank");
            return Ok(GlobalAddress::dummy());
        };
        let capacity = self.elems_up_limit;
        let random_tries = (capacity as f64 * RANDOM_TRIES_SHARE).ceil() as usize;
        for _ in 0..random_tries {
            let offset = self.rng.random_range(0..capacity);
            if self.try_acquire(rank, base, offset)? {
                return GlobalAddress::new(rank as u64, offset as u64);
            }
        }
        for offset in 0..capacity {
            if self.try_acquire(rank, base, offset)? {
                return GlobalAddress::new(rank as u64, offset as u64);
            }
        }
        Ok(GlobalAddress::dummy())
    }

    fn try_acquire(&self, rank: Rank, base: u64, offset: usize) -> Result<bool> {
        let addr = acquired_address(base, offset as u64);
        let prev = self.with_nodes(rank, |epoch| {
            epoch.compare_and_swap_u32(addr, FREE, ACQUIRED)
        })?;
        if prev == FREE {
            trace!(rank = self.comm.rank(), target = rank, offset, "slot acquired");
        }
        Ok(prev == FREE)
    }

    fn release_node(&self, address: GlobalAddress) -> Result<()> {
        let owner = address.rank() as Rank;
        let base = self.node_base(owner)?;
        let null = CountedNodePtr::default().to_bits();
        self.with_nodes(owner, |epoch| {
            epoch.put_u64(next_address(base, address.offset()), null)
        })?;
        self.with_nodes(owner, |epoch| {
            epoch.replace_u32(acquired_address(base, address.offset()), FREE)
        })?;
        trace!(rank = self.comm.rank(), ?address, "slot released");
        Ok(())
    }

    fn node_base(&self, rank: Rank) -> Result<u64> {
        match self.node_bases.get(rank).copied().flatten() {
            Some(base) => Ok(base),
            None => Err(RmaError::runtime(
                format_smolstr!("resolve the node array of rank {rank}"),
                Status::Rank,
            )),
        }
    }

    fn memory(&self) -> Result<&SharedMemory> {
        match &self.memory {
            Some(memory) => Ok(memory),
            None => Err(RmaError::runtime("access a released stack", Status::Win)),
        }
    }

    /// Run one operation in its own epoch on `target`'s node window.
    fn with_nodes<R>(
        &self,
        target: Rank,
        op: impl FnOnce(&Epoch<'_>) -> Result<R>,
    ) -> Result<R> {
        let epoch = self.memory()?.nodes_win.lock_shared(target)?;
        let value = op(&epoch)?;
        epoch.flush();
        Ok(value)
    }

    fn with_head<R>(&self, op: impl FnOnce(&Epoch<'_>) -> Result<R>) -> Result<R> {
        let epoch = self.memory()?.head_win.lock_shared(HEAD_RANK)?;
        let value = op(&epoch)?;
        epoch.flush();
        Ok(value)
    }

    fn fetch_head(&self) -> Result<CountedNodePtr> {
        let bits = self.with_head(|epoch| epoch.fetch_u64(self.head_address))?;
        Ok(CountedNodePtr::from_bits(bits))
    }

    /// Returns the head value observed by the operation.
    fn compare_and_swap_head(
        &self,
        expected: CountedNodePtr,
        new: CountedNodePtr,
    ) -> Result<CountedNodePtr> {
        let bits = self.with_head(|epoch| {
            epoch.compare_and_swap_u64(self.head_address, expected.to_bits(), new.to_bits())
        })?;
        Ok(CountedNodePtr::from_bits(bits))
    }

    /// Walk the list from the head and log every node.
    ///
    /// Only meaningful while no rank pushes or pops.
    pub fn dump(&self) -> Result<Vec<GlobalAddress>> {
        let rank = self.comm.rank();
        let limit = self.node_bases.iter().flatten().count() * self.elems_up_limit;
        let mut addresses = Vec::new();
        let mut current = self.fetch_head()?;
        info!(rank, head = ?current, "stack dump");
        while !current.is_dummy() {
            if addresses.len() >= limit {
                return Err(RmaError::runtime("walk the stack list", Status::Intern));
            }
            let address = current.address();
            let owner = address.rank() as Rank;
            let base = self.node_base(owner)?;
            let next = self.with_nodes(owner, |epoch| {
                epoch.fetch_u64(next_address(base, address.offset()))
            })?;
            let internal = self.internal_counter(address)?;
            current = CountedNodePtr::from_bits(next);
            info!(rank, ?address, internal, next = ?current, "stack node");
            addresses.push(address);
        }
        Ok(addresses)
    }

    /// Number of slots marked acquired across every node array.
    pub fn acquired_slots(&self) -> Result<usize> {
        let mut acquired = 0;
        for (owner, base) in self.node_bases.iter().enumerate() {
            let Some(base) = *base else { continue };
            for offset in 0..self.elems_up_limit as u64 {
                let flag = self.with_nodes(owner, |epoch| {
                    epoch.fetch_u32(acquired_address(base, offset))
                })?;
                if flag & ACQUIRED != 0 {
                    acquired += 1;
                }
            }
        }
        Ok(acquired)
    }

    fn transition(&mut self, event: EngineEvent) -> Result<Option<Action>> {
        match self.state.consume(&event) {
            Ok(action) => Ok(action),
            Err(_) => Err(RmaError::InvalidTransition(format_smolstr!(
                "{event:?} on a stack in state {:?}",
                self.state.state()
            ))),
        }
    }

    fn poison_on_error<R>(&mut self, result: Result<R>) -> Result<R> {
        if let Err(err) = &result {
            warn!(rank = self.comm.rank(), error = %err, "stack poisoned");
            // Fault is accepted from every state but Released, which is
            // unreachable while `self` is alive.
            let _ = self.state.consume(&EngineEvent::Fault);
        }
        result
    }

    pub fn is_poisoned(&self) -> bool {
        self.state.state() == &EngineState::Poisoned
    }

    /// Collective teardown: detach and free every region and window.
    pub fn release(mut self) -> Result<()> {
        let action = self.transition(EngineEvent::Release)?;
        let rank = self.comm.rank();
        debug!(rank, ?action, "releasing stack");
        // Nobody may touch the shared memory once it starts to go away. If
        // the group broke up, dropping `self` leaks the memory instead.
        self.comm.barrier()?;
        let Some(memory) = self.memory.take() else {
            return Err(RmaError::runtime("release a released stack", Status::Win));
        };
        let SharedMemory {
            nodes_win,
            head_win,
            nodes_region,
            head_region,
        } = memory;
        if let Some(region) = nodes_region {
            nodes_win.detach(&region)?;
            region.free()?;
        }
        if let Some(region) = head_region {
            head_win.detach(&region)?;
            region.free()?;
        }
        nodes_win.free()?;
        head_win.free()?;
        debug!(rank, "stack released");
        Ok(())
    }
}

impl Drop for InnerStack {
    fn drop(&mut self) {
        if let Some(memory) = self.memory.take() {
            // Other ranks may still address this memory.
            warn!(
                rank = self.comm.rank(),
                "stack dropped without release, leaking its shared memory"
            );
            mem::forget(memory);
        }
    }
}
