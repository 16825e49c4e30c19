use common::{RmaError, Result, Status};
use std::any::Any;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use tracing::{trace, warn};

pub type Rank = usize;

type Slot = Option<Box<dyn Any + Send>>;

struct Rendezvous {
    arrived: usize,
    generation: u64,
    // Once a rank has left, no later barrier can complete.
    departed: bool,
}

struct Shared {
    size: usize,
    rendezvous: Mutex<Rendezvous>,
    wake: Condvar,
    // One deposit slot per rank for collective exchanges.
    board: Mutex<Vec<Slot>>,
}

impl Shared {
    fn rendezvous(&self) -> MutexGuard<'_, Rendezvous> {
        self.rendezvous
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn depart(&self) {
        self.rendezvous().departed = true;
        self.wake.notify_all();
    }
}

/// Marks its rank as gone when the rank body returns or unwinds.
struct Departure {
    rank: Rank,
    shared: Arc<Shared>,
}

impl Drop for Departure {
    fn drop(&mut self) {
        if thread::panicking() {
            warn!(rank = self.rank, "rank panicked, aborting the group");
        }
        self.shared.depart();
    }
}

/// Process group handle of a single rank.
#[derive(Clone)]
pub struct Comm {
    rank: Rank,
    shared: Arc<Shared>,
}

/// Bootstrap of a group of ranks.
pub struct World;

impl World {
    /// Start `size` ranks, run `f` on every one of them and return the
    /// per-rank results in rank order.
    ///
    /// Every collective operation must be called by all ranks in the same
    /// order. When a rank returns or panics, barriers still waiting for it
    /// fail with [`Status::Aborted`] on the other ranks. The first panic in
    /// rank order is resumed on the caller's thread after every rank has
    /// finished.
    pub fn run<F, R>(size: usize, f: F) -> Result<Vec<R>>
    where
        F: Fn(Comm) -> R + Sync,
        R: Send,
    {
        if size == 0 {
            return Err(RmaError::runtime("start a world without ranks", Status::Size));
        }
        let shared = Arc::new(Shared {
            size,
            rendezvous: Mutex::new(Rendezvous {
                arrived: 0,
                generation: 0,
                departed: false,
            }),
            wake: Condvar::new(),
            board: Mutex::new((0..size).map(|_| None).collect()),
        });

        thread::scope(|scope| {
            let f = &f;
            let mut handles = Vec::with_capacity(size);
            for rank in 0..size {
                let comm = Comm {
                    rank,
                    shared: Arc::clone(&shared),
                };
                let departure = Departure {
                    rank,
                    shared: Arc::clone(&shared),
                };
                let spawned = thread::Builder::new()
                    .name(format!("rank-{rank}"))
                    .spawn_scoped(scope, move || {
                        let _departure = departure;
                        f(comm)
                    });
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(_) => {
                        // Release the ranks already waiting for this one.
                        shared.depart();
                        return Err(RmaError::runtime("spawn rank", Status::Intern));
                    }
                }
            }
            let mut results = Vec::with_capacity(size);
            let mut panic = None;
            for handle in handles {
                match handle.join() {
                    Ok(result) => results.push(result),
                    Err(payload) => {
                        panic.get_or_insert(payload);
                    }
                }
            }
            if let Some(payload) = panic {
                std::panic::resume_unwind(payload);
            }
            Ok(results)
        })
    }
}

impl Comm {
    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Block until every rank of the group reaches the barrier.
    ///
    /// Fails with [`Status::Aborted`] if some rank left the group before the
    /// barrier could complete.
    #[track_caller]
    pub fn barrier(&self) -> Result<()> {
        trace!(rank = self.rank, "barrier");
        let mut rendezvous = self.shared.rendezvous();
        rendezvous.arrived += 1;
        if rendezvous.arrived == self.shared.size {
            rendezvous.arrived = 0;
            rendezvous.generation = rendezvous.generation.wrapping_add(1);
            drop(rendezvous);
            self.shared.wake.notify_all();
            return Ok(());
        }
        let generation = rendezvous.generation;
        while rendezvous.generation == generation && !rendezvous.departed {
            rendezvous = self
                .shared
                .wake
                .wait(rendezvous)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if rendezvous.generation != generation {
            return Ok(());
        }
        rendezvous.arrived -= 1;
        Err(RmaError::runtime(
            "wait for every rank at the barrier",
            Status::Aborted,
        ))
    }

    fn board(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.shared
            .board
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Distribute the value supplied by `root` to every rank.
    ///
    /// Non-root ranks pass `None`. The root passing `None` is reported to
    /// every rank as [`Status::Buffer`].
    #[track_caller]
    pub fn broadcast<T>(&self, value: Option<T>, root: Rank) -> Result<T>
    where
        T: Clone + Send + 'static,
    {
        if root >= self.size() {
            return Err(RmaError::runtime("broadcast", Status::Root));
        }
        if self.rank == root {
            self.board()[root] = value.map(|v| Box::new(v) as Box<dyn Any + Send>);
        }
        self.barrier()?;
        let received = self.board()[root]
            .as_ref()
            .and_then(|slot| slot.downcast_ref::<T>())
            .cloned();
        self.barrier()?;
        match received {
            Some(value) => Ok(value),
            None => Err(RmaError::runtime("receive broadcast value", Status::Buffer)),
        }
    }

    /// Collect one value from every rank, in rank order, on every rank.
    #[track_caller]
    pub fn all_gather<T>(&self, value: T) -> Result<Vec<T>>
    where
        T: Clone + Send + 'static,
    {
        self.board()[self.rank] = Some(Box::new(value));
        self.barrier()?;
        let gathered = self
            .board()
            .iter()
            .map(|slot| slot.as_ref().and_then(|s| s.downcast_ref::<T>()).cloned())
            .collect::<Option<Vec<T>>>();
        self.barrier()?;
        match gathered {
            Some(values) => Ok(values),
            None => Err(RmaError::runtime("gather values", Status::Buffer)),
        }
    }

    #[track_caller]
    pub fn all_reduce_max(&self, value: f64) -> Result<f64> {
        let values = self.all_gather(value)?;
        Ok(values.into_iter().fold(f64::MIN, f64::max))
    }
}
