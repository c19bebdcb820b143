use std::fmt;
use std::sync::Arc;

use candle_core::Tensor;
use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};

use crate::{DistError, Result};

/// Reduction applied element-wise by reducing collectives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum ReduceOp {
    /// Element-wise sum.
    Sum,
    /// Element-wise mean over the participating ranks.
    Avg,
    /// Element-wise maximum.
    Max,
    /// Element-wise minimum.
    Min,
}

impl ReduceOp {
    /// Reduces same-shaped tensors in rank order.
    pub fn reduce(self, tensors: &[Tensor]) -> Result<Tensor> {
        let (first, rest) = tensors.split_first().ok_or_else(|| {
            DistError::Collective(format!("cannot {self}-reduce an empty list of tensors"))
        })?;
        let mut acc = first.clone();
        for tensor in rest {
            if tensor.dims() != acc.dims() {
                return Err(DistError::Collective(format!(
                    "{self}-reduce over mismatched shapes {:?} and {:?}",
                    acc.dims(),
                    tensor.dims()
                )));
            }
            acc = match self {
                ReduceOp::Sum | ReduceOp::Avg => acc.add(tensor)?,
                ReduceOp::Max => acc.maximum(tensor)?,
                ReduceOp::Min => acc.minimum(tensor)?,
            };
        }
        if self == ReduceOp::Avg {
            acc = acc.affine(1.0 / tensors.len() as f64, 0.0)?;
        }
        Ok(acc)
    }
}

enum WorkState<T> {
    Ready(Result<T>),
    Pending(Receiver<Result<T>>),
}

/// Handle to an issued collective.
///
/// Collectives on one process group complete in issue order. Waiting on a
/// handle is the point where the caller depends on the communication result.
pub struct Work<T = Tensor> {
    op: &'static str,
    state: WorkState<T>,
}

impl<T> Work<T> {
    /// A handle whose result is already available.
    pub fn completed(op: &'static str, value: T) -> Self {
        Self {
            op,
            state: WorkState::Ready(Ok(value)),
        }
    }

    /// A handle that failed at issue time.
    pub fn failed(op: &'static str, err: DistError) -> Self {
        Self {
            op,
            state: WorkState::Ready(Err(err)),
        }
    }

    pub(crate) fn pending(op: &'static str, receiver: Receiver<Result<T>>) -> Self {
        Self {
            op,
            state: WorkState::Pending(receiver),
        }
    }

    /// Name of the collective.
    pub fn op(&self) -> &'static str {
        self.op
    }

    /// Whether the result is available without blocking.
    pub fn is_completed(&self) -> bool {
        match &self.state {
            WorkState::Ready(_) => true,
            WorkState::Pending(receiver) => !receiver.is_empty(),
        }
    }

    /// Blocks until the collective finished and returns its result.
    pub fn wait(self) -> Result<T> {
        match self.state {
            WorkState::Ready(result) => result,
            WorkState::Pending(receiver) => receiver.recv().map_err(|_| {
                DistError::Collective(format!(
                    "{}: the communication worker exited before completing",
                    self.op
                ))
            })?,
        }
    }
}

impl<T> fmt::Debug for Work<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Work")
            .field("op", &self.op)
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// A set of ranks that take part in collectives together.
///
/// All member ranks must issue the same collectives in the same order.
pub trait ProcessGroup: Send + Sync + fmt::Debug {
    /// Rank of the caller within this group.
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// Global ranks of the members, indexed by group rank.
    fn ranks(&self) -> &[usize];

    /// Gathers equally shaped tensors from every rank, concatenated on dim 0 in group rank order.
    fn all_gather_into_tensor(&self, input: &Tensor) -> Result<Work>;

    /// Gathers tensors from every rank; shapes may differ.
    fn all_gather(&self, input: &Tensor) -> Result<Work<Vec<Tensor>>>;

    /// Reduces the input across ranks, then returns this rank's dim-0 block.
    ///
    /// The input's dim 0 must be divisible by the group size.
    fn reduce_scatter_tensor(&self, input: &Tensor, op: ReduceOp) -> Result<Work>;

    /// Reduces the input across ranks.
    fn all_reduce(&self, input: &Tensor, op: ReduceOp) -> Result<Work>;

    /// Returns the tensor held by group rank `src`.
    fn broadcast(&self, input: &Tensor, src: usize) -> Result<Work>;

    /// Blocks until all ranks reached the barrier.
    fn barrier(&self) -> Result<()>;

    /// Global rank of the caller.
    fn global_rank(&self) -> usize {
        self.ranks()[self.rank()]
    }
}

/// Creates process groups over subsets of the world.
///
/// Groups are created once and shared; asking twice for the same ranks returns
/// the same group.
pub trait GroupFactory: Send + Sync {
    /// Global rank of the caller.
    fn global_rank(&self) -> usize;

    /// Number of ranks in the world.
    fn world_size(&self) -> usize;

    /// The group over `ranks`, which must contain the caller.
    fn new_group(&self, ranks: &[usize]) -> Result<Arc<dyn ProcessGroup>>;
}

pub(crate) fn validate_group_ranks(ranks: &[usize], world_size: usize, caller: usize) -> Result<()> {
    if ranks.is_empty() {
        return Err(DistError::Configuration(
            "a process group needs at least one rank".to_string(),
        ));
    }
    let mut seen = hashbrown::HashSet::new();
    for &rank in ranks {
        if rank >= world_size {
            return Err(DistError::Configuration(format!(
                "rank {rank} is outside the world of size {world_size}"
            )));
        }
        if !seen.insert(rank) {
            return Err(DistError::Configuration(format!(
                "rank {rank} appears twice in group {ranks:?}"
            )));
        }
    }
    if !seen.contains(&caller) {
        return Err(DistError::Configuration(format!(
            "rank {caller} cannot create group {ranks:?} it does not belong to"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_reduce_op_avg() {
        let a = Tensor::new(&[1f32, 2.0], &Device::Cpu).unwrap();
        let b = Tensor::new(&[3f32, 6.0], &Device::Cpu).unwrap();
        let out = ReduceOp::Avg.reduce(&[a, b]).unwrap();

        assert_eq!(out.to_vec1::<f32>().unwrap(), vec![2.0, 4.0]);
    }

    #[test]
    fn test_reduce_op_max_min() {
        let a = Tensor::new(&[1f32, 7.0], &Device::Cpu).unwrap();
        let b = Tensor::new(&[3f32, 6.0], &Device::Cpu).unwrap();

        let max = ReduceOp::Max.reduce(&[a.clone(), b.clone()]).unwrap();
        let min = ReduceOp::Min.reduce(&[a, b]).unwrap();

        assert_eq!(max.to_vec1::<f32>().unwrap(), vec![3.0, 7.0]);
        assert_eq!(min.to_vec1::<f32>().unwrap(), vec![1.0, 6.0]);
    }

    #[test]
    fn test_reduce_op_rejects_mismatched_shapes() {
        let a = Tensor::new(&[1f32, 7.0], &Device::Cpu).unwrap();
        let b = Tensor::new(&[3f32], &Device::Cpu).unwrap();

        assert!(ReduceOp::Sum.reduce(&[a, b]).is_err());
    }

    #[test]
    fn test_completed_work() {
        let work = Work::completed("noop", 3usize);

        assert!(work.is_completed());
        assert_eq!(work.wait().unwrap(), 3);
    }

    #[test]
    fn test_group_ranks_validation() {
        assert!(validate_group_ranks(&[0, 1], 2, 0).is_ok());
        assert!(validate_group_ranks(&[0, 0], 2, 0).is_err());
        assert!(validate_group_ranks(&[0, 2], 2, 0).is_err());
        assert!(validate_group_ranks(&[1], 2, 0).is_err());
    }
}
