//! Sharding propagation: inferring output placements of operators on
//! distributed tensors, and running them.

mod dispatch;
pub mod ops;
mod propagator;
mod schema;

pub use dispatch::*;
pub use propagator::*;
pub use schema::*;
