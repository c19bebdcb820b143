use candle_core::Tensor;

use super::{DTensorSpec, Placement, local_shape_for};
use crate::{DistError, Result};

/// Converts the calling rank's shard from `current` placements to `target`.
///
/// Mesh dimensions are gathered in reverse order when their placement changes
/// or when the tensor dimension they shard is changed at an earlier mesh
/// dimension, since nested shards are only meaningful relative to the outer
/// ones. The new shards are then cut locally in mesh dimension order, so
/// going from `Replicate` to `Shard` never communicates.
pub fn redistribute_local_tensor(
    local: &Tensor,
    current: &DTensorSpec,
    target: &[Placement],
) -> Result<Tensor> {
    let mesh = current.mesh();
    let source = current.placements();
    if target.len() != source.len() {
        return Err(DistError::Configuration(format!(
            "cannot redistribute {} placements into {}",
            source.len(),
            target.len()
        )));
    }
    if source == target {
        return Ok(local.clone());
    }
    let Some(coordinate) = mesh.coordinate() else {
        return Ok(local.clone());
    };
    let global_shape = current.shape()?;
    let changed = |mesh_dim: usize| source[mesh_dim] != target[mesh_dim];

    let mut placements = source.to_vec();
    let mut tensor = local.clone();

    for mesh_dim in (0..placements.len()).rev() {
        let Some(dim) = placements[mesh_dim].shard_dim() else {
            continue;
        };
        let resharded_earlier = (0..mesh_dim).any(|earlier| {
            changed(earlier)
                && (source[earlier].shard_dim() == Some(dim) || target[earlier].shard_dim() == Some(dim))
        });
        if !changed(mesh_dim) && !resharded_earlier {
            continue;
        }

        let logical_shape = local_shape_for(
            global_shape,
            &mesh.shape()[..mesh_dim],
            &coordinate[..mesh_dim],
            &placements[..mesh_dim],
        )?;
        log::debug!(
            "redistribute: gathering mesh dim {mesh_dim} ({}) of logical shape {logical_shape:?}",
            placements[mesh_dim]
        );
        tensor = placements[mesh_dim].to_replicate_tensor(&tensor, mesh, mesh_dim, &logical_shape)?;
        placements[mesh_dim] = Placement::Replicate;
    }

    for mesh_dim in 0..placements.len() {
        if placements[mesh_dim] == target[mesh_dim] {
            continue;
        }
        tensor = target[mesh_dim].shard_local(&tensor, mesh.size(mesh_dim), coordinate[mesh_dim])?;
        placements[mesh_dim] = target[mesh_dim];
    }

    Ok(tensor)
}
