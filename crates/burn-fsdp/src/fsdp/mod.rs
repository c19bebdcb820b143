//! Fully sharded data parallelism.
//!
//! A [`FsdpModel`] owns a [`ModuleTree`] and a set of units created by
//! [`FsdpModel::fully_shard`]. Each unit packs the parameters of its subtree,
//! minus nested units and ignored modules, into a [`FlatParamHandle`] sharded
//! across a process group. Forward and backward are driven through closures
//! so the model can all-gather parameters right before a unit runs and
//! reshard or reduce-scatter right after.

mod config;
mod flat_param;
mod hooks;
mod module;
mod runtime;
mod state;
mod state_dict;
mod wrap;

pub use config::*;
pub use flat_param::*;
pub use hooks::*;
pub use module::*;
pub use runtime::*;
pub use state::*;
pub use state_dict::*;
pub use wrap::*;
