//! One-sided communication runtime.
//!
//! Every participating rank runs on its own thread and owns a [`Comm`]
//! handle. Ranks expose memory [`Region`]s through dynamic [`Window`]s, and
//! any rank can then read, write or atomically update another rank's memory
//! inside an access [`Epoch`] without the owner executing matching code.

pub mod info;
pub mod region;
pub mod window;
pub mod world;

pub use info::Info;
pub use region::Region;
pub use window::{Epoch, Window};
pub use world::{Comm, Rank, World};
