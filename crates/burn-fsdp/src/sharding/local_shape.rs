use super::{DeviceMesh, Placement};
use crate::{DistError, Result};

/// Shape of the calling rank's shard.
///
/// A rank outside the mesh holds nothing and gets an empty shape.
pub fn compute_local_shape(
    global_shape: &[usize],
    mesh: &DeviceMesh,
    placements: &[Placement],
) -> Result<Vec<usize>> {
    match mesh.coordinate() {
        Some(coordinate) => local_shape_for(global_shape, mesh.shape(), coordinate, placements),
        None => Ok(Vec::new()),
    }
}

/// Shape of the calling rank's shard and the global index of its first element.
///
/// A rank outside the mesh gets two empty vectors.
pub fn compute_local_shape_and_global_offset(
    global_shape: &[usize],
    mesh: &DeviceMesh,
    placements: &[Placement],
) -> Result<(Vec<usize>, Vec<usize>)> {
    match mesh.coordinate() {
        Some(coordinate) => {
            local_shape_and_global_offset_for(global_shape, mesh.shape(), coordinate, placements)
        }
        None => Ok((Vec::new(), Vec::new())),
    }
}

/// [`compute_local_shape`] for an explicit mesh shape and coordinate.
pub fn local_shape_for(
    global_shape: &[usize],
    mesh_shape: &[usize],
    coordinate: &[usize],
    placements: &[Placement],
) -> Result<Vec<usize>> {
    check_lengths(global_shape, mesh_shape, coordinate, placements)?;

    let mut local_shape = global_shape.to_vec();
    for (mesh_dim, placement) in placements.iter().enumerate() {
        if let Some(dim) = placement.shard_dim() {
            let (len, _) = Placement::local_shard_size_on_dim(
                local_shape[dim],
                mesh_shape[mesh_dim],
                coordinate[mesh_dim],
            );
            local_shape[dim] = len;
        }
    }
    Ok(local_shape)
}

/// [`compute_local_shape_and_global_offset`] for an explicit mesh shape and coordinate.
///
/// Offsets accumulate the chunk start of every sharding mesh dimension. When a
/// strided shard is present, the shard index of each tensor dimension is
/// rebuilt from per-mesh-dimension strides instead: a strided shard on `d`
/// interleaves with the later shards on `d`, so its stride is the number of
/// shards of `d` divided by `split_factor * mesh size`, and plain shards
/// contribute the product of the mesh sizes still sharding `d` after them.
pub fn local_shape_and_global_offset_for(
    global_shape: &[usize],
    mesh_shape: &[usize],
    coordinate: &[usize],
    placements: &[Placement],
) -> Result<(Vec<usize>, Vec<usize>)> {
    check_lengths(global_shape, mesh_shape, coordinate, placements)?;

    let ndim = global_shape.len();
    let mut local_shape = global_shape.to_vec();
    let mut global_offset = vec![0; ndim];
    let mut num_shards = vec![1usize; ndim];

    for (mesh_dim, placement) in placements.iter().enumerate() {
        if let Some(dim) = placement.shard_dim() {
            let (len, start) = Placement::local_shard_size_on_dim(
                local_shape[dim],
                mesh_shape[mesh_dim],
                coordinate[mesh_dim],
            );
            local_shape[dim] = len;
            global_offset[dim] += start;
            num_shards[dim] *= mesh_shape[mesh_dim];
        }
    }

    let has_strided = placements
        .iter()
        .any(|p| matches!(p, Placement::StridedShard { .. }));
    if !has_strided {
        return Ok((local_shape, global_offset));
    }

    let mut strides = vec![vec![0usize; placements.len()]; ndim];
    let mut strided_seen = vec![false; ndim];
    let mut strided_ended = vec![false; ndim];

    for (mesh_dim, placement) in placements.iter().enumerate() {
        let Some(dim) = placement.shard_dim() else {
            continue;
        };
        if strided_ended[dim] {
            return Err(DistError::NotImplemented(format!(
                "strided sharding does not allow Shard() to appear after the strided part has ended. \
                 {placement} at mesh dim {mesh_dim} in {placements:?} violates this assumption \
                 for tensor dim {dim}"
            )));
        }
        if strided_seen[dim] {
            strided_ended[dim] = true;
        }

        let mesh_size = mesh_shape[mesh_dim];
        match placement {
            Placement::StridedShard { split_factor, .. } => {
                if *split_factor == 0 {
                    return Err(DistError::Configuration(format!(
                        "{placement} has a zero split factor"
                    )));
                }
                strided_seen[dim] = true;
                strides[dim][mesh_dim] = num_shards[dim] / (split_factor * mesh_size);
            }
            _ => {
                num_shards[dim] /= mesh_size;
                strides[dim][mesh_dim] = num_shards[dim];
            }
        }
    }

    for dim in 0..ndim {
        let shard_index: usize = strides[dim]
            .iter()
            .zip(coordinate)
            .map(|(stride, c)| stride * c)
            .sum();
        global_offset[dim] = local_shape[dim] * shard_index;
    }

    Ok((local_shape, global_offset))
}

fn check_lengths(
    global_shape: &[usize],
    mesh_shape: &[usize],
    coordinate: &[usize],
    placements: &[Placement],
) -> Result<()> {
    if placements.len() != mesh_shape.len() || coordinate.len() != mesh_shape.len() {
        return Err(DistError::Configuration(format!(
            "{} placements and coordinate {coordinate:?} for a mesh of shape {mesh_shape:?}",
            placements.len()
        )));
    }
    for placement in placements {
        if let Some(dim) = placement.shard_dim() {
            if dim >= global_shape.len() {
                return Err(DistError::Configuration(format!(
                    "{placement} on a tensor of shape {global_shape:?}"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharding::mesh::unravel;

    const S0: Placement = Placement::Shard(0);
    const S1: Placement = Placement::Shard(1);
    const R: Placement = Placement::Replicate;

    fn coordinates(mesh_shape: &[usize]) -> Vec<Vec<usize>> {
        let n: usize = mesh_shape.iter().product();
        (0..n).map(|i| unravel(i, mesh_shape)).collect()
    }

    /// Every element of the global tensor is owned by exactly one coordinate
    /// once replicated mesh dims are pinned to 0.
    fn assert_partition(global_shape: &[usize], mesh_shape: &[usize], placements: &[Placement]) {
        let numel: usize = global_shape.iter().product();
        let mut owners = vec![0usize; numel];
        for coordinate in coordinates(mesh_shape) {
            let replicated = placements
                .iter()
                .zip(&coordinate)
                .any(|(p, &c)| p.is_replicate() && c != 0);
            if replicated {
                continue;
            }
            let (shape, offset) =
                local_shape_and_global_offset_for(global_shape, mesh_shape, &coordinate, placements)
                    .unwrap();
            for local in 0..shape.iter().product::<usize>() {
                let local_index = unravel(local, &shape);
                let flat = local_index
                    .iter()
                    .zip(&offset)
                    .zip(global_shape)
                    .fold(0, |acc, ((&i, &o), &size)| acc * size + i + o);
                owners[flat] += 1;
            }
        }
        assert!(owners.iter().all(|&n| n == 1), "{placements:?}: {owners:?}");
    }

    #[test]
    fn test_local_shape_uneven() {
        let shape = local_shape_for(&[7, 3], &[4], &[3], &[S0]).unwrap();
        assert_eq!(shape, vec![1, 3]);

        let shape = local_shape_for(&[7, 3], &[4], &[0], &[S0]).unwrap();
        assert_eq!(shape, vec![2, 3]);
    }

    #[test]
    fn test_local_shape_nested_shards_on_same_dim() {
        let shape = local_shape_for(&[10], &[2, 3], &[1, 2], &[S0, S0]).unwrap();
        // 10 -> [5, 5] -> [2, 2, 1]
        assert_eq!(shape, vec![1]);
    }

    #[test]
    fn test_partition_property() {
        assert_partition(&[7, 5], &[4], &[S0]);
        assert_partition(&[7, 5], &[2, 3], &[S0, S1]);
        assert_partition(&[9, 4], &[2, 2], &[S0, S0]);
        assert_partition(&[3, 4], &[2, 2], &[R, S1]);
        assert_partition(&[2, 2], &[4], &[S0]);
        assert_partition(&[0, 2], &[2], &[S0]);

        let strided = |dim, split_factor| Placement::StridedShard { dim, split_factor };
        assert_partition(&[8], &[2, 2], &[strided(0, 2), S0]);
        assert_partition(&[12, 3], &[2, 3], &[strided(0, 3), S0]);
        assert_partition(&[2, 12], &[2, 3], &[strided(1, 3), S1]);
        assert_partition(&[16, 2], &[2, 2, 2], &[R, strided(0, 2), S0]);
    }

    #[test]
    fn test_offsets_are_deterministic() {
        let a = local_shape_and_global_offset_for(&[11, 6], &[2, 2], &[1, 1], &[S0, S0]).unwrap();
        let b = local_shape_and_global_offset_for(&[11, 6], &[2, 2], &[1, 1], &[S0, S0]).unwrap();

        assert_eq!(a, b);
        // 11 -> [6, 5] -> second half split [3, 2]: offset 6 + 3
        assert_eq!(a, (vec![2, 6], vec![9, 0]));
    }

    #[test]
    fn test_strided_offsets_follow_interleaving() {
        let placements = [
            Placement::StridedShard {
                dim: 0,
                split_factor: 2,
            },
            S0,
        ];
        // 1-D tensor of 8 over a 2x2 mesh: the strided shard on mesh dim 0 holds
        // chunks {0, 2} / {1, 3} of the 4 chunks, then mesh dim 1 picks one.
        let expected = [
            ([0, 0], 0),
            ([0, 1], 4),
            ([1, 0], 2),
            ([1, 1], 6),
        ];
        for (coordinate, offset) in expected {
            let (shape, got) =
                local_shape_and_global_offset_for(&[8], &[2, 2], &coordinate, &placements).unwrap();
            assert_eq!(shape, vec![2]);
            assert_eq!(got, vec![offset], "coordinate {coordinate:?}");
        }
    }

    #[test]
    fn test_strided_part_must_not_restart() {
        let placements = [
            Placement::StridedShard {
                dim: 0,
                split_factor: 2,
            },
            S0,
            S0,
        ];
        let err =
            local_shape_and_global_offset_for(&[16], &[2, 2, 2], &[0, 0, 0], &placements).unwrap_err();

        match err {
            DistError::NotImplemented(msg) => assert!(msg.contains("the strided part has ended")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_placement_count_must_match_mesh() {
        assert!(local_shape_for(&[4], &[2, 2], &[0, 0], &[S0]).is_err());
        assert!(local_shape_for(&[4], &[2], &[0], &[S1]).is_err());
    }
}
