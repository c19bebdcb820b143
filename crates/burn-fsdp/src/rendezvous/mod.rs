//! Bootstrap: key-value stores, store barriers, environment configuration and
//! device mesh initialization.

mod launcher;
mod store;

pub use launcher::*;
pub use store::*;
