#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Burn fully sharded data parallel.
//!
//! This crate provides the pieces needed to train a model whose parameters are
//! sharded across a group of ranks:
//!
//! - [`sharding`]: device meshes, placements and the local shard math.
//! - [`DTensor`]: a tensor whose data is split across a device mesh.
//! - [`propagation`]: output placement inference for operators.
//! - [`comm`] and [`rendezvous`]: process groups, collectives and bootstrap.
//! - [`fsdp`]: the fully sharded data parallel runtime.
//! - [`optim`]: optimizers acting on flat local shards.

mod error;
mod tensor;

pub mod comm;
pub mod fsdp;
pub mod optim;
pub mod propagation;
pub mod rendezvous;
pub mod sharding;

pub use error::*;
pub use tensor::*;
