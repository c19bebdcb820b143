use std::sync::Arc;

use candle_core::{DType, Tensor};

use crate::sharding::{
    DTensorSpec, DeviceMesh, Placement, TensorMeta, redistribute_local_tensor,
};
use crate::{DistError, Result};

/// Represents a tensor that is distributed (sharded or replicated) across a device mesh.
///
/// A `DTensor` contains the calling rank's shard of a global tensor, along with
/// a [`DTensorSpec`] describing how the full tensor is partitioned: one
/// [`Placement`] per mesh dimension and the global tensor meta.
#[derive(Clone, Debug)]
pub struct DTensor {
    /// Local shard of the tensor
    local_tensor: Tensor,
    /// Specification of how this tensor is sharded
    spec: DTensorSpec,
}

/// Splits a full tensor held by every rank according to `placements` and keeps
/// the calling rank's shard. No communication happens.
pub fn distribute_tensor(
    tensor: &Tensor,
    mesh: Arc<DeviceMesh>,
    placements: &[Placement],
) -> Result<DTensor> {
    let coordinate = mesh.coordinate().map(|c| c.to_vec()).ok_or_else(|| {
        DistError::Configuration(format!(
            "rank {} cannot distribute a tensor over mesh {:?} it does not belong to",
            mesh.rank(),
            mesh.ranks()
        ))
    })?;
    let spec = DTensorSpec::new(
        mesh.clone(),
        placements.to_vec(),
        Some(TensorMeta::from_tensor(tensor)),
    )?;

    let mut local = tensor.clone();
    for (mesh_dim, placement) in placements.iter().enumerate() {
        if placement.is_shard() {
            local = placement.shard_local(&local, mesh.size(mesh_dim), coordinate[mesh_dim])?;
        }
    }

    Ok(DTensor {
        local_tensor: local,
        spec,
    })
}

impl DTensor {
    /// Same as [`distribute_tensor`].
    pub fn distribute(
        tensor: &Tensor,
        mesh: Arc<DeviceMesh>,
        placements: &[Placement],
    ) -> Result<Self> {
        distribute_tensor(tensor, mesh, placements)
    }

    /// Wraps the calling rank's shard.
    ///
    /// Without `global_shape`, every sharded dimension is assumed evenly split,
    /// so its global size is the local size times the number of shards.
    pub fn from_local(
        local: Tensor,
        mesh: Arc<DeviceMesh>,
        placements: &[Placement],
        global_shape: Option<Vec<usize>>,
    ) -> Result<Self> {
        let shape = match global_shape {
            Some(shape) => shape,
            None => {
                let mut shape = local.dims().to_vec();
                for (mesh_dim, placement) in placements.iter().enumerate() {
                    if let Some(dim) = placement.shard_dim() {
                        let size = shape.get_mut(dim).ok_or_else(|| {
                            DistError::Configuration(format!(
                                "{placement} on a local tensor of shape {:?}",
                                local.dims()
                            ))
                        })?;
                        *size *= mesh.size(mesh_dim);
                    }
                }
                shape
            }
        };
        let spec = DTensorSpec::new(
            mesh,
            placements.to_vec(),
            Some(TensorMeta::contiguous(shape, local.dtype())),
        )?;
        Self::from_parts(local, spec)
    }

    /// Wraps a local shard and its spec, checking the shard has the expected shape.
    pub fn from_parts(local: Tensor, spec: DTensorSpec) -> Result<Self> {
        let expected = spec.local_shape()?;
        if spec.mesh().coordinate().is_some() && local.dims() != expected.as_slice() {
            return Err(DistError::Configuration(format!(
                "local shard of shape {:?} does not match {spec}, expected {expected:?}",
                local.dims()
            )));
        }
        Ok(Self {
            local_tensor: local,
            spec,
        })
    }

    /// The calling rank's shard.
    pub fn to_local(&self) -> &Tensor {
        &self.local_tensor
    }

    /// Consumes the tensor, returning the calling rank's shard.
    pub fn into_local(self) -> Tensor {
        self.local_tensor
    }

    /// Sharding metadata.
    pub fn spec(&self) -> &DTensorSpec {
        &self.spec
    }

    /// The device mesh.
    pub fn mesh(&self) -> &Arc<DeviceMesh> {
        self.spec.mesh()
    }

    /// Placement per mesh dimension.
    pub fn placements(&self) -> &[Placement] {
        self.spec.placements()
    }

    /// Global shape.
    pub fn shape(&self) -> &[usize] {
        self.spec
            .tensor_meta()
            .map(|meta| meta.shape.as_slice())
            .unwrap_or_else(|| self.local_tensor.dims())
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        self.local_tensor.dtype()
    }

    /// A DTensor with the same global data laid out with `placements`.
    pub fn redistribute(&self, placements: &[Placement]) -> Result<DTensor> {
        let local = redistribute_local_tensor(&self.local_tensor, &self.spec, placements)?;
        let spec = self.spec.with_placements(placements.to_vec())?;
        Ok(DTensor {
            local_tensor: local,
            spec,
        })
    }

    /// The full global tensor, gathered on every rank.
    pub fn full_tensor(&self) -> Result<Tensor> {
        let replicated = vec![Placement::Replicate; self.placements().len()];
        Ok(self.redistribute(&replicated)?.into_local())
    }
}
