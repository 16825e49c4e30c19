use common::{RmaError, Result};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use smol_str::format_smolstr;
use std::thread;
use std::time::Duration;

/// Largest delay bound in nanoseconds.
pub const DELAY_LIMIT_NS: u64 = u32::MAX as u64;

/// Randomized exponential backoff between failed compare-and-swap retries.
///
/// Every call sleeps for a duration drawn uniformly from `[0, bound]` and
/// then doubles the bound, saturating at the configured maximum.
pub struct ExponentialBackoff {
    max_ns: u64,
    bound_ns: u64,
    rng: SmallRng,
}

impl ExponentialBackoff {
    /// A zero `min` starts the bound at one nanosecond so that it can still
    /// grow; only a zero `max` disables sleeping altogether.
    pub fn new(min: Duration, max: Duration) -> Result<Self> {
        let min_ns = u64::try_from(min.as_nanos()).unwrap_or(u64::MAX);
        let max_ns = u64::try_from(max.as_nanos()).unwrap_or(u64::MAX);
        if min_ns > DELAY_LIMIT_NS {
            return Err(RmaError::InvalidDelay(format_smolstr!(
                "the min delay {min:?} is out of bounds"
            )));
        }
        if max_ns > DELAY_LIMIT_NS {
            return Err(RmaError::InvalidDelay(format_smolstr!(
                "the max delay {max:?} is out of bounds"
            )));
        }
        if min_ns > max_ns {
            return Err(RmaError::InvalidDelay(format_smolstr!(
                "the max delay {max:?} is lower than the min delay {min:?}"
            )));
        }
        Ok(Self {
            max_ns,
            bound_ns: min_ns.max(1).min(max_ns),
            rng: SmallRng::from_os_rng(),
        })
    }

    /// Current upper bound of the next sampled delay.
    pub fn bound(&self) -> Duration {
        Duration::from_nanos(self.bound_ns)
    }

    /// Sample the next delay and grow the bound, without sleeping.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.rng.random_range(0..=self.bound_ns);
        self.bound_ns = self.bound_ns.saturating_mul(2).min(self.max_ns);
        Duration::from_nanos(delay)
    }

    pub fn backoff(&mut self) {
        let delay = self.next_delay();
        thread::sleep(delay);
    }
}
