use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rma::info::NO_LOCKS;
use rma::{Comm, Info, World};
use rma_stack::config::{BACKOFF_MAX_ENV, BACKOFF_MIN_ENV, CAPACITY_ENV, TOPOLOGY_ENV};
use rma_stack::tasks::{self, TOTAL_OPS};
use rma_stack::{InnerStack, RmaTreiberStack, StackConfig, Topology};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum Task {
    /// Push and pop raw slots on the engine, dumping the list in between
    InnerSimple,
    /// Push five integers per rank and pop five
    #[default]
    Simple,
    /// Random mix of pushes and pops
    Random,
    /// Pushes only
    PushOnly,
    /// Pops only, after a warm-up
    PopOnly,
}

impl Task {
    fn name(self) -> &'static str {
        match self {
            Task::InnerSimple => "inner_simple_push_pop",
            Task::Simple => "simple_push_pop",
            Task::Random => "random_operation_benchmark",
            Task::PushOnly => "only_push_benchmark",
            Task::PopOnly => "only_pop_benchmark",
        }
    }
}

/// Run a distributed stack task over a group of in-process ranks.
///
/// Stack parameters come from the flags, then from the RMA_STACK_*
/// environment variables, then from the built-in defaults.
#[derive(Parser)]
struct Args {
    /// Number of ranks
    #[arg(long, default_value_t = 2)]
    ranks: usize,

    #[arg(long, value_enum, default_value_t = Task::Simple)]
    task: Task,

    /// centralized or decentralized
    #[arg(long, env = TOPOLOGY_ENV)]
    topology: Option<Topology>,

    /// Slots per node array
    #[arg(long, env = CAPACITY_ENV)]
    capacity: Option<usize>,

    #[arg(long, env = BACKOFF_MIN_ENV)]
    backoff_min_ns: Option<u64>,

    #[arg(long, env = BACKOFF_MAX_ENV)]
    backoff_max_ns: Option<u64>,

    /// Operations shared by all ranks in the benchmarks
    #[arg(long, default_value_t = TOTAL_OPS)]
    total_ops: usize,

    /// Skip window locking; ranks never open conflicting epochs
    #[arg(long, default_value_t = false)]
    no_locks: bool,

    /// Log to stderr instead of per-rank files
    #[arg(long, default_value_t = false)]
    stderr: bool,
}

impl Args {
    fn config(&self) -> Result<StackConfig> {
        let defaults = StackConfig::default();
        let config = StackConfig {
            topology: self.topology.unwrap_or(defaults.topology),
            elems_up_limit: self.capacity.unwrap_or(defaults.elems_up_limit),
            backoff_min: self
                .backoff_min_ns
                .map_or(defaults.backoff_min, Duration::from_nanos),
            backoff_max: self
                .backoff_max_ns
                .map_or(defaults.backoff_max, Duration::from_nanos),
        };
        config.validate().context("validate stack config")?;
        Ok(config)
    }
}

fn run_inner(comm: &Comm, config: &StackConfig, info: &Info) -> Result<()> {
    let mut stack = InnerStack::new(comm, info, config.topology, config.elems_up_limit)?;
    let report = tasks::inner_simple_push_pop_task(&mut stack, comm)?;
    info!(rank = comm.rank(), pushed = ?report.pushed, popped = ?report.popped, "inner task done");
    stack.release()?;
    Ok(())
}

fn run_rank(comm: Comm, args: &Args, config: &StackConfig, info: &Info) -> Result<()> {
    let mut stack = match args.task {
        Task::InnerSimple => return run_inner(&comm, config, info),
        _ => RmaTreiberStack::<i32>::create(&comm, info, config)?,
    };
    let report = match args.task {
        Task::Simple => {
            let popped = tasks::simple_push_pop_task(&mut stack, &comm)?;
            println!("rank {}: popped {popped:?}", comm.rank());
            None
        }
        Task::Random => Some(tasks::random_operation_benchmark(
            &mut stack,
            &comm,
            args.total_ops,
        )?),
        Task::PushOnly => Some(tasks::only_push_benchmark(&mut stack, &comm, args.total_ops)?),
        Task::PopOnly => Some(tasks::only_pop_benchmark(&mut stack, &comm, args.total_ops)?),
        Task::InnerSimple => None,
    };
    if let Some(report) = report.filter(|_| comm.rank() == 0) {
        println!("total elapsed (sec) {}", report.total_elapsed);
    }

    comm.barrier()?;
    if comm.rank() == 0 {
        let acquired = stack.inner().acquired_slots()?;
        info!(acquired, "slots still acquired after the task");
    }
    comm.barrier()?;
    stack.release()?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.config()?;

    if args.stderr {
        rma_stack::logging::init_stderr_logger();
    } else if let Some(dir) = rma_stack::logging::init_file_logger(args.ranks, args.task.name())? {
        eprintln!("logging to {}", dir.display());
    }

    let info = if args.no_locks {
        Info::null().with(NO_LOCKS, "true")
    } else {
        Info::null()
    };
    info!(ranks = args.ranks, task = args.task.name(), ?config, "starting");

    let results = World::run(args.ranks, |comm| run_rank(comm, &args, &config, &info))?;
    for (rank, result) in results.into_iter().enumerate() {
        result.with_context(|| format!("rank {rank} failed"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn flags_win_over_environment() {
        // The only test here that touches the process environment.
        std::env::set_var(CAPACITY_ENV, "16");
        std::env::set_var(TOPOLOGY_ENV, "decentralized");
        let from_env = Args::try_parse_from(["rma_stack"]).expect("args");
        let config = from_env.config().expect("config");
        assert_eq!(config.elems_up_limit, 16);
        assert_eq!(config.topology, Topology::Decentralized);

        let from_flags = Args::try_parse_from([
            "rma_stack",
            "--capacity",
            "8",
            "--topology",
            "centralized",
        ])
        .expect("args");
        let config = from_flags.config().expect("config");
        assert_eq!(config.elems_up_limit, 8);
        assert_eq!(config.topology, Topology::Centralized);

        std::env::set_var(TOPOLOGY_ENV, "mesh");
        assert!(Args::try_parse_from(["rma_stack"]).is_err());

        std::env::remove_var(CAPACITY_ENV);
        std::env::remove_var(TOPOLOGY_ENV);
        let defaults = Args::try_parse_from(["rma_stack"]).expect("args");
        assert_eq!(defaults.config().expect("config"), StackConfig::default());
        let inverted =
            Args::try_parse_from(["rma_stack", "--backoff-min-ns", "500"]).expect("args");
        assert!(inverted.config().is_err());
    }
}
