use std::fmt;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use super::DeviceMesh;
use crate::{DistError, Result};

/// How a tensor is laid out along one mesh dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Placement {
    /// Every rank along the mesh dimension holds the full data.
    Replicate,
    /// The tensor dimension is split into balanced contiguous chunks, one per rank.
    Shard(usize),
    /// The tensor dimension is split into `n * split_factor` pieces and rank `i`
    /// holds pieces `i, i + n, i + 2n, ...` concatenated.
    ///
    /// This is the layout left behind when a dimension sharded on a later mesh
    /// dimension gets sharded again on an earlier one.
    StridedShard {
        /// Tensor dimension being split.
        dim: usize,
        /// Number of pieces each rank holds.
        split_factor: usize,
    },
}

impl Placement {
    /// The sharded tensor dimension, if any.
    pub fn shard_dim(&self) -> Option<usize> {
        match self {
            Placement::Replicate => None,
            Placement::Shard(dim) | Placement::StridedShard { dim, .. } => Some(*dim),
        }
    }

    /// Whether the placement splits a tensor dimension.
    pub fn is_shard(&self) -> bool {
        self.shard_dim().is_some()
    }

    /// Whether the placement is [`Placement::Replicate`].
    pub fn is_replicate(&self) -> bool {
        matches!(self, Placement::Replicate)
    }

    /// Size and start offset of chunk `index` when `size` is split into
    /// `num_chunks` balanced chunks.
    ///
    /// The first `size % num_chunks` chunks get one extra element.
    pub fn local_shard_size_on_dim(size: usize, num_chunks: usize, index: usize) -> (usize, usize) {
        let base = size / num_chunks;
        let extra = size % num_chunks;
        let len = base + usize::from(index < extra);
        let start = index * base + index.min(extra);
        (len, start)
    }

    fn split_factor(&self) -> Result<usize> {
        match self {
            Placement::StridedShard { split_factor: 0, .. } => Err(DistError::Configuration(
                format!("{self} has a zero split factor"),
            )),
            Placement::StridedShard { split_factor, .. } => Ok(*split_factor),
            _ => Ok(1),
        }
    }

    /// Splits a full tensor into the chunk held by each of `num_chunks` ranks.
    ///
    /// Returns the chunks together with, for every chunk, how many rows it
    /// lacks compared with the largest one.
    pub fn split_tensor(&self, tensor: &Tensor, num_chunks: usize) -> Result<(Vec<Tensor>, Vec<usize>)> {
        let Some(dim) = self.shard_dim() else {
            return Ok((vec![tensor.clone(); num_chunks], vec![0; num_chunks]));
        };
        check_dim(tensor, dim, self)?;
        if num_chunks == 0 {
            return Err(DistError::Configuration(format!(
                "cannot split with {self} into zero chunks"
            )));
        }

        let split_factor = self.split_factor()?;
        let size = tensor.dim(dim)?;
        let pieces = num_chunks * split_factor;

        let mut chunks = Vec::with_capacity(num_chunks);
        for rank in 0..num_chunks {
            let parts = (0..split_factor)
                .map(|j| {
                    let (len, start) = Self::local_shard_size_on_dim(size, pieces, rank + j * num_chunks);
                    Ok(tensor.narrow(dim, start, len)?)
                })
                .collect::<Result<Vec<_>>>()?;
            chunks.push(concat(&parts, dim)?);
        }

        let max = chunks.iter().map(|c| c.dims()[dim]).max().unwrap_or(0);
        let padding = chunks.iter().map(|c| max - c.dims()[dim]).collect();
        Ok((chunks, padding))
    }

    /// The chunk of a full tensor held by rank `index` out of `num_chunks`.
    pub fn shard_local(&self, tensor: &Tensor, num_chunks: usize, index: usize) -> Result<Tensor> {
        let (mut chunks, _) = self.split_tensor(tensor, num_chunks)?;
        if index >= chunks.len() {
            return Err(DistError::Configuration(format!(
                "chunk index {index} out of {num_chunks} chunks"
            )));
        }
        Ok(chunks.swap_remove(index))
    }

    /// Rebuilds the tensor replicated along `mesh_dim` from the local chunk.
    ///
    /// Chunks are padded to the size of the largest one, all-gathered along
    /// the mesh dimension, unpadded and, for strided shards, put back in
    /// logical order. `logical_shape` is the shape of the tensor before it was
    /// split along this mesh dimension.
    pub fn to_replicate_tensor(
        &self,
        local: &Tensor,
        mesh: &DeviceMesh,
        mesh_dim: usize,
        logical_shape: &[usize],
    ) -> Result<Tensor> {
        let Some(dim) = self.shard_dim() else {
            return Ok(local.clone());
        };
        check_dim(local, dim, self)?;
        let group = mesh.group(mesh_dim)?;
        let num_chunks = group.size();
        let split_factor = self.split_factor()?;
        let size = *logical_shape.get(dim).ok_or_else(|| {
            DistError::Configuration(format!("{self} on a logical shape {logical_shape:?}"))
        })?;
        let pieces = num_chunks * split_factor;

        let piece_len = |piece: usize| Self::local_shard_size_on_dim(size, pieces, piece).0;
        let chunk_len =
            |rank: usize| (0..split_factor).map(|j| piece_len(rank + j * num_chunks)).sum::<usize>();
        let max = (0..num_chunks).map(chunk_len).max().unwrap_or(0);

        let local_len = local.dim(dim)?;
        if local_len != chunk_len(group.rank()) {
            return Err(DistError::Collective(format!(
                "local chunk of size {local_len} does not match {self} of logical size {size} on rank {}",
                group.rank()
            )));
        }

        let padded = pad_dim(local, dim, max - local_len)?;
        let moved = if dim == 0 {
            padded
        } else {
            padded.transpose(0, dim)?.contiguous()?
        };
        let gathered = group.all_gather_into_tensor(&moved)?.wait()?;

        // Rows of rank `rank` start at `rank * max` in the gathered buffer.
        let mut ordered = Vec::with_capacity(pieces);
        for piece in 0..pieces {
            let rank = piece % num_chunks;
            let j = piece / num_chunks;
            let start = rank * max + (0..j).map(|k| piece_len(rank + k * num_chunks)).sum::<usize>();
            ordered.push(gathered.narrow(0, start, piece_len(piece))?);
        }
        let full = concat(&ordered, 0)?;

        if dim == 0 {
            Ok(full)
        } else {
            Ok(full.transpose(0, dim)?.contiguous()?)
        }
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::Replicate => write!(f, "Replicate()"),
            Placement::Shard(dim) => write!(f, "Shard(dim={dim})"),
            Placement::StridedShard { dim, split_factor } => {
                write!(f, "_StridedShard(dim={dim}, sf={split_factor})")
            }
        }
    }
}

fn check_dim(tensor: &Tensor, dim: usize, placement: &Placement) -> Result<()> {
    if dim >= tensor.rank() {
        return Err(DistError::Configuration(format!(
            "{placement} on a tensor of rank {}",
            tensor.rank()
        )));
    }
    Ok(())
}

/// Appends `extra` zero rows along `dim`.
pub(crate) fn pad_dim(tensor: &Tensor, dim: usize, extra: usize) -> Result<Tensor> {
    if extra == 0 {
        return Ok(tensor.clone());
    }
    let mut shape = tensor.dims().to_vec();
    shape[dim] = extra;
    let zeros = Tensor::zeros(shape, tensor.dtype(), tensor.device())?;
    concat(&[tensor.clone(), zeros], dim)
}

/// Concatenates along `dim`, skipping empty parts.
pub(crate) fn concat(parts: &[Tensor], dim: usize) -> Result<Tensor> {
    let non_empty: Vec<&Tensor> = parts.iter().filter(|t| t.dims()[dim] > 0).collect();
    match non_empty.as_slice() {
        [] => {
            let first = parts.first().ok_or_else(|| {
                DistError::Configuration("cannot concatenate an empty list of tensors".into())
            })?;
            let mut shape = first.dims().to_vec();
            shape[dim] = 0;
            Ok(Tensor::zeros(shape, first.dtype(), first.device())?)
        }
        [single] => Ok((*single).clone()),
        many => Ok(Tensor::cat(many, dim)?),
    }
}
