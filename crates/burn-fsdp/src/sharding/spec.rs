use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use candle_core::{DType, Tensor};

use super::{DeviceMesh, Placement, compute_local_shape, compute_local_shape_and_global_offset};
use crate::{DistError, Result};

/// Global shape, stride and dtype of a distributed tensor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorMeta {
    /// Global shape.
    pub shape: Vec<usize>,
    /// Strides of the global tensor.
    pub stride: Vec<usize>,
    /// Element type.
    pub dtype: DType,
}

impl TensorMeta {
    /// Meta of a contiguous tensor.
    pub fn contiguous(shape: Vec<usize>, dtype: DType) -> Self {
        let mut stride = vec![1; shape.len()];
        for dim in (0..shape.len().saturating_sub(1)).rev() {
            stride[dim] = stride[dim + 1] * shape[dim + 1];
        }
        Self {
            shape,
            stride,
            dtype,
        }
    }

    /// Meta of `tensor` seen as a global tensor.
    pub fn from_tensor(tensor: &Tensor) -> Self {
        Self::contiguous(tensor.dims().to_vec(), tensor.dtype())
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

impl Hash for TensorMeta {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shape.hash(state);
        self.stride.hash(state);
        self.dtype.as_str().hash(state);
    }
}

/// Describes how a tensor is distributed across a device mesh.
///
/// One placement per mesh dimension; the tensor meta describes the global
/// tensor and is absent only while a spec is being built by propagation.
#[derive(Clone, Debug)]
pub struct DTensorSpec {
    mesh: Arc<DeviceMesh>,
    placements: Vec<Placement>,
    tensor_meta: Option<TensorMeta>,
}

impl DTensorSpec {
    /// Creates a spec, checking there is one placement per mesh dimension.
    pub fn new(
        mesh: Arc<DeviceMesh>,
        placements: Vec<Placement>,
        tensor_meta: Option<TensorMeta>,
    ) -> Result<Self> {
        if placements.len() != mesh.ndim() {
            return Err(DistError::Configuration(format!(
                "{} placements for a mesh of {} dimensions",
                placements.len(),
                mesh.ndim()
            )));
        }
        if let Some(meta) = &tensor_meta {
            for placement in &placements {
                if placement.shard_dim().is_some_and(|dim| dim >= meta.shape.len()) {
                    return Err(DistError::Configuration(format!(
                        "{placement} on a tensor of shape {:?}",
                        meta.shape
                    )));
                }
            }
        }
        Ok(Self {
            mesh,
            placements,
            tensor_meta,
        })
    }

    /// Same mesh and meta, other placements.
    pub fn with_placements(&self, placements: Vec<Placement>) -> Result<Self> {
        Self::new(self.mesh.clone(), placements, self.tensor_meta.clone())
    }

    /// The device mesh.
    pub fn mesh(&self) -> &Arc<DeviceMesh> {
        &self.mesh
    }

    /// Placement per mesh dimension.
    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }

    /// Global tensor meta, if known.
    pub fn tensor_meta(&self) -> Option<&TensorMeta> {
        self.tensor_meta.as_ref()
    }

    /// Sets the global tensor meta.
    pub fn set_tensor_meta(&mut self, meta: TensorMeta) {
        self.tensor_meta = Some(meta);
    }

    /// Global tensor meta, failing when it was never set.
    pub fn meta(&self) -> Result<&TensorMeta> {
        self.tensor_meta.as_ref().ok_or_else(|| {
            DistError::Configuration(format!("spec {self} has no tensor meta"))
        })
    }

    /// Global shape.
    pub fn shape(&self) -> Result<&[usize]> {
        Ok(&self.meta()?.shape)
    }

    /// Number of dimensions of the global tensor.
    pub fn ndim(&self) -> Result<usize> {
        Ok(self.shape()?.len())
    }

    /// Product of the mesh sizes sharding tensor dimension `dim`.
    pub fn num_shards_on(&self, dim: usize) -> usize {
        self.placements
            .iter()
            .enumerate()
            .filter(|(_, p)| p.shard_dim() == Some(dim))
            .map(|(mesh_dim, _)| self.mesh.size(mesh_dim))
            .product()
    }

    /// Total number of shards.
    pub fn num_shards(&self) -> usize {
        self.placements
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_shard())
            .map(|(mesh_dim, _)| self.mesh.size(mesh_dim))
            .product()
    }

    /// Whether every placement is [`Placement::Replicate`].
    pub fn is_replicated(&self) -> bool {
        self.placements.iter().all(Placement::is_replicate)
    }

    /// Shape of the calling rank's shard.
    pub fn local_shape(&self) -> Result<Vec<usize>> {
        compute_local_shape(self.shape()?, &self.mesh, &self.placements)
    }

    /// Shape and global offset of the calling rank's shard.
    pub fn local_shape_and_offset(&self) -> Result<(Vec<usize>, Vec<usize>)> {
        compute_local_shape_and_global_offset(self.shape()?, &self.mesh, &self.placements)
    }
}

impl PartialEq for DTensorSpec {
    fn eq(&self, other: &Self) -> bool {
        (Arc::ptr_eq(&self.mesh, &other.mesh) || self.mesh == other.mesh)
            && self.placements == other.placements
            && self.tensor_meta == other.tensor_meta
    }
}

impl Eq for DTensorSpec {}

impl Hash for DTensorSpec {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.mesh.hash(state);
        self.placements.hash(state);
        self.tensor_meta.hash(state);
    }
}

impl fmt::Display for DTensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let placements: Vec<String> = self.placements.iter().map(|p| p.to_string()).collect();
        write!(f, "Spec([{}]", placements.join(", "))?;
        if let Some(meta) = &self.tensor_meta {
            write!(f, " on {:?} {}", meta.shape, meta.dtype.as_str())?;
        }
        write!(f, ")")
    }
}
