use std::sync::Arc;

use candle_core::Tensor;

use super::{GroupFactory, ProcessGroup, ReduceOp, Work, validate_group_ranks};
use crate::{DistError, Result};

/// A process group containing only the calling rank.
///
/// Every collective is the identity, so it is used for single-rank runs and as
/// the shard group of replicate-only units.
#[derive(Debug, Clone)]
pub struct LocalProcessGroup {
    ranks: [usize; 1],
}

impl LocalProcessGroup {
    /// A single-rank world.
    pub fn new() -> Self {
        Self::for_rank(0)
    }

    /// A group made only of global rank `rank`.
    pub fn for_rank(rank: usize) -> Self {
        Self { ranks: [rank] }
    }
}

impl Default for LocalProcessGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    fn all_gather_into_tensor(&self, input: &Tensor) -> Result<Work> {
        Ok(Work::completed("all_gather_into_tensor", input.clone()))
    }

    fn all_gather(&self, input: &Tensor) -> Result<Work<Vec<Tensor>>> {
        Ok(Work::completed("all_gather", vec![input.clone()]))
    }

    fn reduce_scatter_tensor(&self, input: &Tensor, _op: ReduceOp) -> Result<Work> {
        Ok(Work::completed("reduce_scatter_tensor", input.clone()))
    }

    fn all_reduce(&self, input: &Tensor, _op: ReduceOp) -> Result<Work> {
        Ok(Work::completed("all_reduce", input.clone()))
    }

    fn broadcast(&self, input: &Tensor, src: usize) -> Result<Work> {
        if src != 0 {
            return Err(DistError::Collective(format!(
                "broadcast source {src} is outside a single-rank group"
            )));
        }
        Ok(Work::completed("broadcast", input.clone()))
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

impl GroupFactory for LocalProcessGroup {
    fn global_rank(&self) -> usize {
        self.ranks[0]
    }

    fn world_size(&self) -> usize {
        1
    }

    fn new_group(&self, ranks: &[usize]) -> Result<Arc<dyn ProcessGroup>> {
        validate_group_ranks(ranks, self.ranks[0] + 1, self.ranks[0])?;
        if ranks.len() != 1 {
            return Err(DistError::Configuration(format!(
                "a single-rank world cannot create group {ranks:?}"
            )));
        }
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_local_group_collectives_are_identity() {
        let pg = LocalProcessGroup::new();
        let x = Tensor::new(&[1f32, 2.0, 3.0], &Device::Cpu).unwrap();

        let gathered = pg.all_gather_into_tensor(&x).unwrap().wait().unwrap();
        let reduced = pg.all_reduce(&x, ReduceOp::Avg).unwrap().wait().unwrap();

        assert_eq!(gathered.to_vec1::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(reduced.to_vec1::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(ProcessGroup::global_rank(&pg), 0);
    }

    #[test]
    fn test_local_factory_only_creates_itself() {
        let pg = LocalProcessGroup::for_rank(3);

        assert!(pg.new_group(&[3]).is_ok());
        assert!(pg.new_group(&[0]).is_err());
    }
}
