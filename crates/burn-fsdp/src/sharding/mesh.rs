use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use thiserror::Error;

use crate::comm::{GroupFactory, ProcessGroup};
use crate::{DistError, Result};

/// Represents a logical mesh dimension, identified by a unique name.
///
/// Mesh dimensions are used to define the logical structure of a device mesh.
/// They help organize and partition parallel computation workloads, such as data,
/// tensor, or pipeline parallelism, across the mesh. Each dimension is named
/// to provide unambiguous mapping during sharding operations.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct MeshDim {
    /// A name that uniquely identifies the mesh dimension.
    name: String,
}

impl MeshDim {
    /// Constructs a new [`MeshDim`] with the given name.
    pub fn new<S: Into<String>>(name: S) -> Self {
        MeshDim { name: name.into() }
    }

    /// The dimension name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for MeshDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Represents a logical arrangement of ranks used for parallel computation.
///
/// A `DeviceMesh` defines a structured, N-dimensional topology over a set of ranks,
/// where each dimension can be given a unique name (e.g., `"replicate"`, `"shard"`).
/// Placements refer to mesh dimensions by index; names are a convenience to look
/// indices up and to slice out one dimension with [`DeviceMesh::sub_mesh`].
///
/// For example, a 2D mesh with shape `[2, 4]` and dimensions `["dp", "fsdp"]`
/// represents 2 replicas, each sharding its parameters over 4 ranks.
///
/// The calling rank's process group along every mesh dimension is created once
/// when the mesh is built and reused by every collective on that dimension.
#[derive(Clone)]
pub struct DeviceMesh {
    /// Global ranks in row-major order.
    ranks: Vec<usize>,
    /// Shape of the logical mesh.
    shape: Vec<usize>,
    /// Dimension names by index, empty when the mesh is positional.
    names: Vec<MeshDim>,
    /// Global rank of the caller.
    rank: usize,
    /// Coordinate of the caller, `None` when it is not part of the mesh.
    coordinate: Option<Vec<usize>>,
    /// The caller's group along each mesh dimension.
    groups: Vec<Arc<dyn ProcessGroup>>,
    factory: Option<Arc<dyn GroupFactory>>,
}

/// Represents errors that can occur when constructing a `DeviceMesh`.
///
/// These errors are typically related to invalid dimension mappings or mismatches
/// between the rank count and the mesh shape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceMeshError {
    /// An invalid dimension was specified.
    #[error("invalid mesh dimension: {0}")]
    InvalidDimension(String),
    /// The mesh configuration is invalid.
    #[error("invalid mesh: {0}")]
    InvalidMesh(String),
}

/// A builder for constructing a [`DeviceMesh`].
///
/// This builder allows you to define a logical mesh structure with a shape and
/// specific dimension mappings. Once all dimensions are mapped (or none are), the
/// builder can be used to construct the [`DeviceMesh`] instance.
#[derive(Clone, Debug)]
pub struct DeviceMeshBuilder {
    /// Global ranks in an n-dimensional logical arrangement.
    ranks: Vec<usize>,
    /// Shape of the logical mesh.
    shape: Vec<usize>,
    /// Maps dimension names to their indices in the mesh.
    dims: HashMap<MeshDim, usize>,
}

impl DeviceMeshBuilder {
    /// Creates a new [`DeviceMeshBuilder`] with the given ranks and shape.
    ///
    /// # Arguments
    /// * `ranks` - Global ranks to be arranged in the mesh, in row-major order.
    /// * `shape` - A vector representing the shape (dimensions) of the mesh.
    pub fn new<S: Into<Vec<usize>>>(ranks: Vec<usize>, shape: S) -> Self {
        Self {
            ranks,
            shape: shape.into(),
            dims: HashMap::new(),
        }
    }

    /// Adds a dimension to the logical mesh, associating it with a specific index.
    ///
    /// Each dimension represents a logical axis of parallelism and should
    /// correspond to a unique index in the shape of the mesh.
    ///
    /// # Arguments
    /// * `idx` - The index of the dimension in the mesh shape.
    /// * `dim` - The mesh dimension to be assigned.
    ///
    /// # Example
    ///
    /// ```rust
    /// use burn_fsdp::comm::ThreadedWorld;
    /// use burn_fsdp::sharding::{DeviceMeshBuilder, MeshDim};
    ///
    /// let world = ThreadedWorld::new(4);
    /// let rank = world.rank(0).unwrap();
    /// let mesh = DeviceMeshBuilder::new(vec![0, 1, 2, 3], [2, 2])
    ///     .with_dim(0, MeshDim::new("replicate"))
    ///     .with_dim(1, MeshDim::new("shard"))
    ///     .build(rank.factory())
    ///     .unwrap();
    /// assert_eq!(mesh.coordinate(), Some(&[0, 0][..]));
    /// ```
    pub fn with_dim(mut self, idx: usize, dim: MeshDim) -> Self {
        self.dims.insert(dim, idx);
        self
    }

    /// Checks the dimension mapping and the rank count.
    pub fn validate(&self) -> std::result::Result<(), DeviceMeshError> {
        let ndim = self.shape.len();
        let mut seen_indices = HashSet::new();

        for &idx in self.dims.values() {
            if idx >= ndim {
                return Err(DeviceMeshError::InvalidDimension(format!(
                    "Index {} exceeds mesh shape {:?}",
                    idx, self.shape
                )));
            }
            if !seen_indices.insert(idx) {
                return Err(DeviceMeshError::InvalidDimension(format!(
                    "Dimension {} already mapped",
                    idx
                )));
            }
        }

        if !self.dims.is_empty() && seen_indices.len() != ndim {
            return Err(DeviceMeshError::InvalidMesh(format!(
                "Not all mesh dimensions are mapped. Got {}, expected {}",
                seen_indices.len(),
                ndim
            )));
        }

        let expected_ranks = self.shape.iter().product::<usize>();
        if self.ranks.len() != expected_ranks {
            return Err(DeviceMeshError::InvalidMesh(format!(
                "Device count ({}) doesn't match mesh shape {:?}",
                self.ranks.len(),
                self.shape,
            )));
        }

        let unique: HashSet<_> = self.ranks.iter().collect();
        if unique.len() != self.ranks.len() {
            return Err(DeviceMeshError::InvalidMesh(format!(
                "Ranks {:?} contain duplicates",
                self.ranks
            )));
        }

        Ok(())
    }

    /// Builds a [`DeviceMesh`] for the rank owning `factory`.
    ///
    /// This performs validation, then creates the caller's process group along
    /// every mesh dimension.
    pub fn build(self, factory: Arc<dyn GroupFactory>) -> Result<DeviceMesh> {
        self.validate()?;

        let mut names = Vec::new();
        if !self.dims.is_empty() {
            let mut by_index: Vec<(usize, MeshDim)> =
                self.dims.into_iter().map(|(dim, idx)| (idx, dim)).collect();
            by_index.sort_by_key(|(idx, _)| *idx);
            names = by_index.into_iter().map(|(_, dim)| dim).collect();
        }

        let rank = factory.global_rank();
        let coordinate = self
            .ranks
            .iter()
            .position(|&r| r == rank)
            .map(|index| unravel(index, &self.shape));

        let mut groups = Vec::new();
        if let Some(coordinate) = &coordinate {
            for dim in 0..self.shape.len() {
                let members = group_ranks(&self.ranks, &self.shape, coordinate, dim);
                groups.push(factory.new_group(&members)?);
            }
        }

        Ok(DeviceMesh {
            ranks: self.ranks,
            shape: self.shape,
            names,
            rank,
            coordinate,
            groups,
            factory: Some(factory),
        })
    }
}

impl DeviceMesh {
    /// A 1-D mesh over an existing process group.
    pub fn from_group(group: Arc<dyn ProcessGroup>, name: Option<MeshDim>) -> Self {
        let ranks = group.ranks().to_vec();
        let rank = group.global_rank();
        Self {
            shape: vec![ranks.len()],
            coordinate: Some(vec![group.rank()]),
            names: name.into_iter().collect(),
            ranks,
            rank,
            groups: vec![group],
            factory: None,
        }
    }

    /// Number of mesh dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Shape of the mesh.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Size of mesh dimension `dim`.
    pub fn size(&self, dim: usize) -> usize {
        self.shape.get(dim).copied().unwrap_or(1)
    }

    /// Number of ranks in the mesh.
    pub fn num_ranks(&self) -> usize {
        self.ranks.len()
    }

    /// Global ranks in row-major order.
    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    /// Global rank of the caller.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Coordinate of the caller, `None` when the caller is not part of the mesh.
    pub fn coordinate(&self) -> Option<&[usize]> {
        self.coordinate.as_deref()
    }

    /// Coordinate of the caller along mesh dimension `dim`.
    pub fn local_rank(&self, dim: usize) -> Option<usize> {
        self.coordinate.as_ref().and_then(|c| c.get(dim).copied())
    }

    /// Name of mesh dimension `dim`, if the mesh is named.
    pub fn dim_name(&self, dim: usize) -> Option<&MeshDim> {
        self.names.get(dim)
    }

    /// Index of the dimension called `name`.
    pub fn dim_index(&self, name: &str) -> Result<usize> {
        self.names
            .iter()
            .position(|dim| dim.name() == name)
            .ok_or_else(|| {
                DeviceMeshError::InvalidDimension(format!(
                    "No mesh dimension named {name} in {:?}",
                    self.names
                ))
                .into()
            })
    }

    /// The caller's process group along mesh dimension `dim`.
    pub fn group(&self, dim: usize) -> Result<&Arc<dyn ProcessGroup>> {
        if self.coordinate.is_none() {
            return Err(DistError::Configuration(format!(
                "rank {} is not part of mesh {:?}",
                self.rank, self.ranks
            )));
        }
        self.groups.get(dim).ok_or_else(|| {
            DeviceMeshError::InvalidDimension(format!(
                "Index {} exceeds mesh shape {:?}",
                dim, self.shape
            ))
            .into()
        })
    }

    /// The 1-D mesh along the dimension called `name`, sharing its process group.
    pub fn sub_mesh(&self, name: &str) -> Result<Arc<DeviceMesh>> {
        let dim = self.dim_index(name)?;
        let group = self.group(dim)?.clone();
        let mut mesh = DeviceMesh::from_group(group, self.names.get(dim).cloned());
        mesh.factory = self.factory.clone();
        Ok(Arc::new(mesh))
    }

    /// Creates a new process group through the factory the mesh was built with.
    pub fn new_group(&self, ranks: &[usize]) -> Result<Arc<dyn ProcessGroup>> {
        match &self.factory {
            Some(factory) => factory.new_group(ranks),
            None => Err(DistError::Configuration(
                "this mesh was created from a process group and cannot create new groups"
                    .to_string(),
            )),
        }
    }
}

impl fmt::Debug for DeviceMesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceMesh")
            .field("shape", &self.shape)
            .field("ranks", &self.ranks)
            .field("names", &self.names)
            .field("coordinate", &self.coordinate)
            .finish()
    }
}

impl PartialEq for DeviceMesh {
    fn eq(&self, other: &Self) -> bool {
        self.ranks == other.ranks && self.shape == other.shape && self.names == other.names
    }
}

impl Eq for DeviceMesh {}

impl Hash for DeviceMesh {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ranks.hash(state);
        self.shape.hash(state);
        self.names.hash(state);
    }
}

/// Row-major coordinate of flat index `index`.
pub(crate) fn unravel(mut index: usize, shape: &[usize]) -> Vec<usize> {
    let mut coordinate = vec![0; shape.len()];
    for (dim, &size) in shape.iter().enumerate().rev() {
        coordinate[dim] = index % size;
        index /= size;
    }
    coordinate
}

/// Flat index of a row-major coordinate.
pub(crate) fn ravel(coordinate: &[usize], shape: &[usize]) -> usize {
    coordinate
        .iter()
        .zip(shape)
        .fold(0, |index, (&c, &size)| index * size + c)
}

/// Ranks sharing every coordinate of `coordinate` except along `dim`.
fn group_ranks(ranks: &[usize], shape: &[usize], coordinate: &[usize], dim: usize) -> Vec<usize> {
    let mut coordinate = coordinate.to_vec();
    (0..shape[dim])
        .map(|c| {
            coordinate[dim] = c;
            ranks[ravel(&coordinate, shape)]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ThreadedWorld;

    fn factory(world_size: usize, rank: usize) -> Arc<dyn GroupFactory> {
        ThreadedWorld::new(world_size).rank(rank).unwrap().factory()
    }

    #[test]
    fn test_device_mesh_2x2() {
        let mesh = DeviceMeshBuilder::new(vec![0, 1, 2, 3], [2, 2])
            .with_dim(0, MeshDim::new("x"))
            .with_dim(1, MeshDim::new("y"))
            .build(factory(4, 3));

        assert!(mesh.is_ok());
    }

    #[test]
    #[should_panic = "InvalidDimension(\"Index 2 exceeds mesh shape [2, 2]\")"]
    fn test_device_mesh_dim_should_be_in_bound() {
        let _mesh = DeviceMeshBuilder::new(vec![0, 1, 2, 3], [2, 2])
            .with_dim(0, MeshDim::new("x"))
            .with_dim(2, MeshDim::new("y")) // out of bounds
            .build(factory(4, 0))
            .unwrap();
    }

    #[test]
    #[should_panic = "InvalidDimension(\"Dimension 0 already mapped\")"]
    fn test_device_mesh_dim_should_be_unique() {
        let _mesh = DeviceMeshBuilder::new(vec![0, 1, 2, 3], [2, 2])
            .with_dim(0, MeshDim::new("x"))
            .with_dim(0, MeshDim::new("y")) // already mapped
            .build(factory(4, 0))
            .unwrap();
    }

    #[test]
    #[should_panic = "InvalidMesh(\"Not all mesh dimensions are mapped."]
    fn test_device_mesh_dim_should_be_all_mapped() {
        let _mesh = DeviceMeshBuilder::new(vec![0, 1, 2, 3], [2, 2])
            .with_dim(0, MeshDim::new("x"))
            .build(factory(4, 0))
            .unwrap();
    }

    #[test]
    #[should_panic = "InvalidMesh(\"Not all mesh dimensions are mapped."]
    fn test_device_mesh_dim_name_should_be_unique() {
        let _mesh = DeviceMeshBuilder::new(vec![0, 1, 2, 3], [2, 2])
            .with_dim(0, MeshDim::new("x"))
            .with_dim(1, MeshDim::new("x")) // same name is invalid
            .build(factory(4, 0))
            .unwrap();
    }

    #[test]
    #[should_panic = "InvalidMesh(\"Device count (4) doesn't match mesh shape [3, 2]"]
    fn test_device_mesh_devices_should_match_shape() {
        let _mesh = DeviceMeshBuilder::new(vec![0, 1, 2, 3], [3, 2])
            .with_dim(0, MeshDim::new("x"))
            .with_dim(1, MeshDim::new("y"))
            .build(factory(4, 0))
            .unwrap();
    }

    #[test]
    fn test_device_mesh_positional_dims() {
        let mesh = DeviceMeshBuilder::new(vec![0, 1, 2, 3], [4])
            .build(factory(4, 2))
            .unwrap();

        assert_eq!(mesh.coordinate(), Some(&[2][..]));
        assert!(mesh.dim_name(0).is_none());
        assert!(mesh.dim_index("x").is_err());
    }

    #[test]
    fn test_device_mesh_groups_follow_coordinates() {
        let mesh = DeviceMeshBuilder::new(vec![0, 1, 2, 3, 4, 5], [2, 3])
            .with_dim(0, MeshDim::new("replicate"))
            .with_dim(1, MeshDim::new("shard"))
            .build(factory(6, 4))
            .unwrap();

        assert_eq!(mesh.coordinate(), Some(&[1, 1][..]));
        assert_eq!(mesh.group(0).unwrap().ranks(), &[1, 4]);
        assert_eq!(mesh.group(1).unwrap().ranks(), &[3, 4, 5]);

        let shard = mesh.sub_mesh("shard").unwrap();
        assert_eq!(shard.shape(), &[3]);
        assert_eq!(shard.ranks(), &[3, 4, 5]);
        assert_eq!(shard.coordinate(), Some(&[1][..]));
    }

    #[test]
    fn test_rank_outside_mesh_has_no_coordinate() {
        let mesh = DeviceMeshBuilder::new(vec![0, 1], [2])
            .build(factory(4, 3))
            .unwrap();

        assert!(mesh.coordinate().is_none());
        assert!(mesh.group(0).is_err());
    }

    #[test]
    fn test_ravel_unravel() {
        let shape = [2, 3, 4];
        for index in 0..24 {
            assert_eq!(ravel(&unravel(index, &shape), &shape), index);
        }
    }
}
