use crate::address::GlobalAddress;
use crate::backoff::ExponentialBackoff;
use crate::interface::Stack;
use crate::stack::InnerStack;
use common::Result;
use rand::Rng;
use rma::Comm;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Operations shared by all ranks in every benchmark.
pub const TOTAL_OPS: usize = 15_000;
/// Simulated application work between two stack operations.
pub const WORKLOAD: Duration = Duration::from_micros(1);
const WARM_UP_SHARE: f64 = 0.1;

#[derive(Clone, Debug, Default)]
pub struct InnerTaskReport {
    pub pushed: Vec<GlobalAddress>,
    pub dumped: Vec<GlobalAddress>,
    pub popped: Vec<GlobalAddress>,
}

/// Push five slots per rank, dump the list, then pop five.
pub fn inner_simple_push_pop_task(stack: &mut InnerStack, comm: &Comm) -> Result<InnerTaskReport> {
    debug!(rank = comm.rank(), "started inner simple push/pop task");
    const ELEMS: usize = 5;
    let mut report = InnerTaskReport::default();
    for _ in 0..ELEMS {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_micros(100), Duration::from_micros(1000))?;
        let mut pushed = GlobalAddress::dummy();
        stack.push(
            &mut |address: GlobalAddress| -> Result<()> {
                pushed = address;
                Ok(())
            },
            || backoff.backoff(),
        )?;
        debug!(rank = comm.rank(), address = ?pushed, "received address by push");
        report.pushed.push(pushed);
    }
    comm.barrier()?;
    report.dumped = stack.dump()?;
    comm.barrier()?;
    for _ in 0..ELEMS {
        let mut popped = GlobalAddress::dummy();
        stack.pop(
            &mut |address: GlobalAddress| -> Result<()> {
                popped = address;
                Ok(())
            },
            || {},
        )?;
        debug!(rank = comm.rank(), address = ?popped, "received address by pop");
        report.popped.push(popped);
    }
    debug!(rank = comm.rank(), "finished inner simple push/pop task");
    Ok(report)
}

/// Push `i * size + rank` for five values of `i`, then pop five values.
pub fn simple_push_pop_task<S>(stack: &mut S, comm: &Comm) -> Result<Vec<i32>>
where
    S: Stack<Value = i32>,
{
    info!(rank = comm.rank(), "started simple push/pop task");
    const ELEMS: i32 = 5;
    let (rank, size) = (comm.rank() as i32, comm.size() as i32);
    for i in 0..ELEMS {
        let elem = i * size + rank;
        stack.push(elem)?;
        debug!(rank, elem, "pushed");
    }
    let mut popped = Vec::with_capacity(ELEMS as usize);
    for _ in 0..ELEMS {
        let elem = stack.pop(-1)?;
        debug!(rank, elem, "popped");
        popped.push(elem);
    }
    info!(rank, "finished simple push/pop task");
    Ok(popped)
}

#[derive(Clone, Debug, PartialEq)]
pub struct BenchmarkReport {
    pub procs: usize,
    pub rank: usize,
    /// Seconds spent in stack operations on this rank.
    pub elapsed: f64,
    /// Maximum of `elapsed` over all ranks.
    pub total_elapsed: f64,
    pub total_ops: usize,
    pub ops: usize,
    pub push_count: usize,
    pub pop_count: usize,
    pub warm_up: usize,
}

impl BenchmarkReport {
    fn log(&self) {
        info!(
            target: "benchmark",
            procs = self.procs,
            rank = self.rank,
            elapsed = self.elapsed,
            total = self.total_elapsed,
            "elapsed (sec)"
        );
        info!(target: "benchmark", total_ops = self.total_ops, ops = self.ops, "operations");
        info!(
            target: "benchmark",
            push_count = self.push_count,
            pop_count = self.pop_count,
            warm_up = self.warm_up,
            "operation mix"
        );
    }
}

fn warm_up<S>(stack: &mut S, ops: usize) -> Result<usize>
where
    S: Stack<Value = i32>,
{
    let warm_up = (ops as f64 * WARM_UP_SHARE).ceil() as usize;
    for _ in 0..warm_up {
        stack.push(1)?;
    }
    Ok(warm_up)
}

/// Time `ops` iterations of `step`, net of the simulated workload, and
/// reduce the result over all ranks.
fn measure(comm: &Comm, ops: usize, mut step: impl FnMut() -> Result<()>) -> Result<(f64, f64)> {
    let begin = Instant::now();
    for _ in 0..ops {
        step()?;
        thread::sleep(WORKLOAD);
    }
    let elapsed = begin.elapsed().as_secs_f64() - ops as f64 * WORKLOAD.as_secs_f64();
    let total_elapsed = comm.all_reduce_max(elapsed)?;
    Ok((elapsed, total_elapsed))
}

/// Equally likely pushes and pops of random values.
pub fn random_operation_benchmark<S>(
    stack: &mut S,
    comm: &Comm,
    total_ops: usize,
) -> Result<BenchmarkReport>
where
    S: Stack<Value = i32>,
{
    info!(rank = comm.rank(), "started random operation benchmark");
    let ops = total_ops.div_ceil(comm.size());
    let warm_up = warm_up(stack, ops)?;
    comm.barrier()?;

    let mut rng = rand::rng();
    let (mut push_count, mut pop_count) = (0, 0);
    let (elapsed, total_elapsed) = measure(comm, ops, || {
        let elem = rng.random_range(0..=50);
        if elem > 25 {
            stack.push(elem)?;
            push_count += 1;
        } else {
            stack.pop(-1)?;
            pop_count += 1;
        }
        Ok(())
    })?;

    let report = BenchmarkReport {
        procs: comm.size(),
        rank: comm.rank(),
        elapsed,
        total_elapsed,
        total_ops,
        ops,
        push_count,
        pop_count,
        warm_up,
    };
    report.log();
    info!(rank = comm.rank(), "finished random operation benchmark");
    Ok(report)
}

pub fn only_push_benchmark<S>(
    stack: &mut S,
    comm: &Comm,
    total_ops: usize,
) -> Result<BenchmarkReport>
where
    S: Stack<Value = i32>,
{
    info!(rank = comm.rank(), "started push only benchmark");
    let ops = total_ops / comm.size();
    let mut next = 0;
    let (elapsed, total_elapsed) = measure(comm, ops, || {
        stack.push(next)?;
        next += 1;
        Ok(())
    })?;

    let report = BenchmarkReport {
        procs: comm.size(),
        rank: comm.rank(),
        elapsed,
        total_elapsed,
        total_ops,
        ops,
        push_count: ops,
        pop_count: 0,
        warm_up: 0,
    };
    report.log();
    info!(rank = comm.rank(), "finished push only benchmark");
    Ok(report)
}

pub fn only_pop_benchmark<S>(
    stack: &mut S,
    comm: &Comm,
    total_ops: usize,
) -> Result<BenchmarkReport>
where
    S: Stack<Value = i32>,
{
    info!(rank = comm.rank(), "started pop only benchmark");
    let ops = total_ops / comm.size();
    let warm_up = warm_up(stack, ops)?;
    comm.barrier()?;
    let (elapsed, total_elapsed) = measure(comm, ops, || stack.pop(-1).map(|_| ()))?;

    let report = BenchmarkReport {
        procs: comm.size(),
        rank: comm.rank(),
        elapsed,
        total_elapsed,
        total_ops,
        ops,
        push_count: warm_up,
        pop_count: ops,
        warm_up,
    };
    report.log();
    info!(rank = comm.rank(), "finished pop only benchmark");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Single-rank in-memory stand-in for the distributed stack.
    #[derive(Default)]
    struct VecStack {
        items: Vec<i32>,
        capacity: usize,
    }

    impl Stack for VecStack {
        type Value = i32;

        fn push(&mut self, value: i32) -> Result<bool> {
            if self.items.len() == self.capacity {
                return Ok(false);
            }
            self.items.push(value);
            Ok(true)
        }

        fn pop(&mut self, default: i32) -> Result<i32> {
            Ok(self.items.pop().unwrap_or(default))
        }
    }

    #[test]
    fn simple_task_pops_in_reverse() {
        let popped = rma::World::run(1, |comm| {
            let mut stack = VecStack {
                capacity: 10,
                ..VecStack::default()
            };
            simple_push_pop_task(&mut stack, &comm).expect("task")
        })
        .expect("run");
        assert_eq!(popped[0], vec![4, 3, 2, 1, 0]);
    }

    #[test]
    fn benchmarks_count_their_operations() {
        let reports = rma::World::run(2, |comm| {
            let mut stack = VecStack {
                capacity: 1000,
                ..VecStack::default()
            };
            let random = random_operation_benchmark(&mut stack, &comm, 41).expect("random");
            let pushes = only_push_benchmark(&mut stack, &comm, 41).expect("push");
            let pops = only_pop_benchmark(&mut stack, &comm, 41).expect("pop");
            (random, pushes, pops)
        })
        .expect("run");
        for (random, pushes, pops) in reports {
            assert_eq!(random.ops, 21);
            assert_eq!(random.warm_up, 3);
            assert_eq!(random.push_count + random.pop_count, 21);
            assert_eq!(pushes.ops, 20);
            assert_eq!(pops.ops, 20);
            assert_eq!(pops.warm_up, 2);
            assert!(random.total_elapsed >= random.elapsed);
        }
    }
}
