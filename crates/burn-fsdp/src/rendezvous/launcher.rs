//! Launch configuration and device mesh initialization.
//!
//! The launcher reads the standard distributed training environment variables:
//! - `RANK`: Global rank of this process (0..WORLD_SIZE)
//! - `WORLD_SIZE`: Total number of processes
//! - `LOCAL_RANK`: Local rank on this node
//! - `MASTER_ADDR`: Address of rank 0 for coordination (default: 127.0.0.1)
//! - `MASTER_PORT`: Port for coordination (default: 29500)

use std::env;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::comm::GroupFactory;
use crate::sharding::{DeviceMesh, DeviceMeshBuilder, MeshDim};
use crate::{DistError, Result};

/// Distributed configuration from the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// Global rank of this process.
    pub rank: usize,
    /// Total number of processes.
    pub world_size: usize,
    /// Local rank on this node.
    pub local_rank: usize,
    /// Master address for coordination.
    pub master_addr: String,
    /// Master port for coordination.
    pub master_port: u16,
    /// Bootstrap deadline.
    pub timeout: Duration,
}

impl DistributedConfig {
    /// Create from environment variables.
    ///
    /// Falls back to single-process defaults if not set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: Option<String>) -> Result<Option<T>> {
            value
                .map(|v| {
                    v.trim().parse::<T>().map_err(|_| {
                        DistError::Configuration(format!("{key}={v} is not a valid value"))
                    })
                })
                .transpose()
        }

        let rank = parse("RANK", lookup("RANK"))?.unwrap_or(0);
        let world_size = parse("WORLD_SIZE", lookup("WORLD_SIZE"))?.unwrap_or(1);
        let local_rank = parse("LOCAL_RANK", lookup("LOCAL_RANK"))?.unwrap_or(rank);
        let master_addr = lookup("MASTER_ADDR").unwrap_or_else(|| "127.0.0.1".to_string());
        let master_port = parse("MASTER_PORT", lookup("MASTER_PORT"))?.unwrap_or(29500);

        let config = Self {
            rank,
            world_size,
            local_rank,
            master_addr,
            master_port,
            timeout: Duration::from_secs(1800),
        };
        config.validate()?;
        Ok(config)
    }

    /// Configuration of a single process.
    pub fn single_process() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            local_rank: 0,
            master_addr: "127.0.0.1".to_string(),
            master_port: 29500,
            timeout: Duration::from_secs(1800),
        }
    }

    /// Checks the rank is inside the world.
    pub fn validate(&self) -> Result<()> {
        if self.world_size == 0 {
            return Err(DistError::Configuration("WORLD_SIZE must be > 0".to_string()));
        }
        if self.rank >= self.world_size {
            return Err(DistError::Configuration(format!(
                "RANK {} is outside WORLD_SIZE {}",
                self.rank, self.world_size
            )));
        }
        Ok(())
    }

    /// Whether more than one process takes part.
    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }
}

/// Builds a device mesh over ranks `0..prod(mesh_shape)` for the rank owning `factory`.
///
/// The mesh must cover the whole world.
pub fn init_device_mesh(
    factory: Arc<dyn GroupFactory>,
    mesh_shape: &[usize],
    mesh_dim_names: Option<&[&str]>,
) -> Result<Arc<DeviceMesh>> {
    let num_ranks: usize = mesh_shape.iter().product();
    if num_ranks != factory.world_size() {
        return Err(DistError::Configuration(format!(
            "mesh shape {mesh_shape:?} covers {num_ranks} ranks but the world has {}",
            factory.world_size()
        )));
    }

    let mut builder = DeviceMeshBuilder::new((0..num_ranks).collect(), mesh_shape.to_vec());
    if let Some(names) = mesh_dim_names {
        if names.len() != mesh_shape.len() {
            return Err(DistError::Configuration(format!(
                "{} mesh dimension names for mesh shape {mesh_shape:?}",
                names.len()
            )));
        }
        for (idx, name) in names.iter().enumerate() {
            builder = builder.with_dim(idx, MeshDim::new(*name));
        }
    }

    let mesh = builder.build(factory)?;
    log::info!(
        "rank {} initialized device mesh {mesh_shape:?} at coordinate {:?}",
        mesh.rank(),
        mesh.coordinate()
    );
    Ok(Arc::new(mesh))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ThreadedWorld;
    use hashbrown::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = DistributedConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config, DistributedConfig::single_process());
        assert!(!config.is_distributed());
    }

    #[test]
    fn test_from_lookup_reads_variables() {
        let config = DistributedConfig::from_lookup(lookup(&[
            ("RANK", "3"),
            ("WORLD_SIZE", "4"),
            ("MASTER_ADDR", "10.0.0.1"),
            ("MASTER_PORT", "1234"),
        ]))
        .unwrap();

        assert_eq!(config.rank, 3);
        assert_eq!(config.local_rank, 3);
        assert_eq!(config.master_addr, "10.0.0.1");
        assert_eq!(config.master_port, 1234);
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        assert!(DistributedConfig::from_lookup(lookup(&[("RANK", "x")])).is_err());
        assert!(DistributedConfig::from_lookup(lookup(&[("RANK", "2"), ("WORLD_SIZE", "2")])).is_err());
    }

    #[test]
    fn test_init_device_mesh_names() {
        let world = ThreadedWorld::new(4);
        let mesh = init_device_mesh(
            world.rank(1).unwrap().factory(),
            &[2, 2],
            Some(&["replicate", "shard"]),
        )
        .unwrap();

        assert_eq!(mesh.dim_index("shard").unwrap(), 1);
        assert_eq!(mesh.coordinate(), Some(&[0, 1][..]));
    }

    #[test]
    fn test_init_device_mesh_must_cover_world() {
        let world = ThreadedWorld::new(4);

        assert!(init_device_mesh(world.rank(0).unwrap().factory(), &[2], None).is_err());
    }
}
