//! Process groups and collective communication.
//!
//! A process group is the set of ranks taking part in a collective. Every
//! collective returns a [`Work`] handle; the data is only guaranteed to be
//! available once [`Work::wait`] returns.

mod local;
mod process_group;
mod threaded;

pub use local::*;
pub use process_group::*;
pub use threaded::*;
