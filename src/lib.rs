//! Lock-free Treiber stack shared by a group of ranks through one-sided
//! remote memory access.
//!
//! [`stack::InnerStack`] is the payload-agnostic engine; [`outer::RmaTreiberStack`]
//! adds a typed payload window on top of it.

pub mod address;
pub mod backoff;
pub mod config;
pub mod counted;
pub mod fsm;
pub mod interface;
pub mod layout;
pub mod logging;
pub mod node;
pub mod outer;
pub mod stack;
pub mod tasks;

pub use address::GlobalAddress;
pub use backoff::ExponentialBackoff;
pub use config::StackConfig;
pub use counted::CountedNodePtr;
pub use interface::Stack;
pub use outer::{Plain, RmaTreiberStack};
pub use stack::{GetData, InnerStack, PutData, Topology, HEAD_RANK};
