//! Device meshes, placements and the per-rank shard math built on them.

mod local_shape;
mod mesh;
mod placement;
mod redistribute;
mod spec;

pub use local_shape::*;
pub use mesh::*;
pub use placement::*;
pub use redistribute::*;
pub use spec::*;
