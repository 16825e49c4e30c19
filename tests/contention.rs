use rand::Rng;
use rma::info::NO_LOCKS;
use rma::{Info, World};
use rma_stack::{GlobalAddress, InnerStack, RmaTreiberStack, StackConfig, Topology};
use std::collections::HashSet;

const RANKS: usize = 4;
const OPS_PER_RANK: usize = 2_000;

/// Every rank runs a random mix of pushes and pops on a small stack so that
/// the head is contended and slots are reused constantly. Afterwards rank 0
/// drains the stack; every accepted value must come back exactly once.
fn random_mix(topology: Topology, info: Info) -> anyhow::Result<()> {
    let config = StackConfig {
        topology,
        elems_up_limit: 16,
        ..StackConfig::default()
    };
    let results = World::run(RANKS, |comm| -> anyhow::Result<(Vec<u64>, Vec<u64>)> {
        let mut stack = RmaTreiberStack::<u64>::create(&comm, &info, &config)?;
        let mut rng = rand::rng();
        let mut pushed = Vec::new();
        let mut popped = Vec::new();
        let mut next = (comm.rank() as u64) << 32;
        comm.barrier()?;
        for _ in 0..OPS_PER_RANK {
            if rng.random_bool(0.5) {
                if stack.push(next)? {
                    pushed.push(next);
                }
                next += 1;
            } else if let Some(value) = stack.try_pop()? {
                popped.push(value);
            }
        }
        comm.barrier()?;
        if comm.rank() == 0 {
            while let Some(value) = stack.try_pop()? {
                popped.push(value);
            }
            assert_eq!(stack.inner().acquired_slots()?, 0);
        }
        comm.barrier()?;
        stack.release()?;
        Ok((pushed, popped))
    })?;

    let mut pushed = Vec::new();
    let mut popped = Vec::new();
    for result in results {
        let (p, q) = result?;
        pushed.extend(p);
        popped.extend(q);
    }
    let unique = popped.iter().collect::<HashSet<_>>();
    assert_eq!(unique.len(), popped.len(), "a value was popped twice");
    pushed.sort_unstable();
    popped.sort_unstable();
    assert_eq!(pushed, popped);
    Ok(())
}

#[test]
fn test_random_mix_centralized() -> anyhow::Result<()> {
    random_mix(Topology::Centralized, Info::null())
}

#[test]
fn test_random_mix_decentralized_without_locks() -> anyhow::Result<()> {
    random_mix(Topology::Decentralized, Info::null().with(NO_LOCKS, "true"))
}

/// Pushers race on the head while poppers keep unlinking, so `next` fields
/// are rewritten after lost CAS attempts while other ranks walk the list.
#[test]
fn test_pushers_against_poppers() -> anyhow::Result<()> {
    // Room for every value, so pushes never depend on the poppers' progress.
    let config = StackConfig {
        elems_up_limit: 1024,
        ..StackConfig::default()
    };
    let per_pusher = 500u32;
    let results = World::run(RANKS, |comm| -> anyhow::Result<Vec<u32>> {
        let mut stack = RmaTreiberStack::<u32>::create(&comm, &Info::null(), &config)?;
        let pusher = comm.rank() % 2 == 0;
        let mut popped = Vec::new();
        comm.barrier()?;
        if pusher {
            for i in 0..per_pusher {
                let value = (comm.rank() as u32) * per_pusher + i;
                assert!(stack.push(value)?);
            }
        } else {
            for _ in 0..per_pusher {
                if let Some(value) = stack.try_pop()? {
                    popped.push(value);
                }
            }
        }
        comm.barrier()?;
        if comm.rank() == 1 {
            while let Some(value) = stack.try_pop()? {
                popped.push(value);
            }
        }
        comm.barrier()?;
        stack.release()?;
        Ok(popped)
    })?;

    let mut popped = Vec::new();
    for result in results {
        popped.extend(result?);
    }
    popped.sort_unstable();
    let expected = (0..RANKS as u32)
        .filter(|rank| rank % 2 == 0)
        .flat_map(|rank| rank * per_pusher..(rank + 1) * per_pusher)
        .collect::<Vec<_>>();
    assert_eq!(popped, expected);
    Ok(())
}

/// Every round each rank reads the head, then all ranks line up inside the
/// put callback before racing for it. Only one compare-and-swap per round
/// can win, so the others must rewrite `next` and retry.
#[test]
fn test_lined_up_pushes_retry_and_keep_the_list_intact() -> anyhow::Result<()> {
    const ROUNDS: usize = 100;
    let results = World::run(RANKS, |comm| -> anyhow::Result<(usize, usize)> {
        let mut stack = InnerStack::new(
            &comm,
            &Info::null(),
            Topology::Centralized,
            RANKS * ROUNDS,
        )?;
        let mut retries = 0;
        for _ in 0..ROUNDS {
            let mut pushed = GlobalAddress::dummy();
            stack.push(
                &mut |address: GlobalAddress| -> common::Result<()> {
                    pushed = address;
                    comm.barrier()
                },
                || retries += 1,
            )?;
            anyhow::ensure!(!pushed.is_dummy(), "push rejected");
        }
        comm.barrier()?;
        let listed = stack.dump()?;
        anyhow::ensure!(
            listed.iter().collect::<HashSet<_>>().len() == listed.len(),
            "a node is listed twice"
        );
        comm.barrier()?;
        if comm.rank() == 0 {
            let mut drained = 0;
            loop {
                let mut popped = GlobalAddress::dummy();
                stack.pop(
                    &mut |address: GlobalAddress| -> common::Result<()> {
                        popped = address;
                        Ok(())
                    },
                    || {},
                )?;
                if popped.is_dummy() {
                    break;
                }
                drained += 1;
            }
            anyhow::ensure!(drained == RANKS * ROUNDS, "drained {drained} nodes");
            anyhow::ensure!(stack.acquired_slots()? == 0, "slots leaked");
        }
        comm.barrier()?;
        stack.release()?;
        Ok((retries, listed.len()))
    })?;

    let mut retries = 0;
    for result in results {
        let (lost, listed) = result?;
        assert_eq!(listed, RANKS * ROUNDS);
        retries += lost;
    }
    assert!(retries >= ROUNDS * (RANKS - 1), "only {retries} retries");
    Ok(())
}
