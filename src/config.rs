use crate::stack::Topology;
use common::{RmaError, Result};
use smol_str::format_smolstr;
use std::time::Duration;

// Read by the driver's command line parser; flags take precedence.
pub const TOPOLOGY_ENV: &str = "RMA_STACK_TOPOLOGY";
pub const CAPACITY_ENV: &str = "RMA_STACK_CAPACITY";
pub const BACKOFF_MIN_ENV: &str = "RMA_STACK_BACKOFF_MIN_NS";
pub const BACKOFF_MAX_ENV: &str = "RMA_STACK_BACKOFF_MAX_NS";

/// Parameters every rank must agree on when building a stack.
#[derive(Clone, Debug, PartialEq)]
pub struct StackConfig {
    pub topology: Topology,
    /// Slots per node array.
    pub elems_up_limit: usize,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            topology: Topology::Centralized,
            elems_up_limit: 100,
            backoff_min: Duration::from_nanos(1),
            backoff_max: Duration::from_nanos(100),
        }
    }
}

impl StackConfig {
    pub fn validate(&self) -> Result<()> {
        if self.elems_up_limit == 0 {
            return Err(RmaError::InvalidConfig(
                "elems_up_limit".into(),
                "must be positive".into(),
            ));
        }
        if self.backoff_min > self.backoff_max {
            return Err(RmaError::InvalidConfig(
                "backoff".into(),
                format_smolstr!(
                    "min delay {:?} exceeds max delay {:?}",
                    self.backoff_min,
                    self.backoff_max
                ),
            ));
        }
        Ok(())
    }
}
