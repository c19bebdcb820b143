//! Flat parameters: the parameters of one FSDP unit packed into a single
//! buffer that is sharded, all-gathered and reduce-scattered as a whole.
//!
//! Every parameter is split along dim 0 across the shard group with the
//! balanced rule of [`Placement::local_shard_size_on_dim`]. Each rank reserves
//! `ceil(dim0 / world_size)` rows per parameter (its *slot*), so that all ranks'
//! local buffers have the same length and the full buffer is simply the
//! concatenation of the local buffers in rank order.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};

use super::{FsdpConfig, ModuleId, Parameter, ReshardAfterForward};
use crate::comm::{ProcessGroup, ReduceOp, Work};
use crate::sharding::{DTensorSpec, DeviceMesh, Placement, TensorMeta, concat, pad_dim};
use crate::{DTensor, DistError, Result};

/// Where a parameter lives inside the flat buffers.
#[derive(Clone, Debug)]
pub struct FlatParamInfo {
    /// Fully qualified name.
    pub fqn: String,
    /// Owning module.
    pub module: ModuleId,
    /// Name local to the owning module.
    pub name: String,
    /// Original shape.
    pub shape: Vec<usize>,
    /// Whether gradients may be accumulated.
    pub requires_grad: bool,
    slot_rows: usize,
    row_numel: usize,
    local_rows: usize,
    row_offset: usize,
    slot_offset: usize,
}

impl FlatParamInfo {
    /// Shape of this rank's shard.
    pub fn local_shape(&self) -> Vec<usize> {
        let mut shape = self.shape.clone();
        shape[0] = self.local_rows;
        shape
    }

    /// Global row offset of this rank's shard.
    pub fn row_offset(&self) -> usize {
        self.row_offset
    }

    fn slot_numel(&self) -> usize {
        self.slot_rows * self.row_numel
    }

    fn local_numel(&self) -> usize {
        self.local_rows * self.row_numel
    }
}

/// Process groups and mesh a unit is sharded over.
#[derive(Clone, Debug)]
pub(crate) struct ShardingGroups {
    /// Group the flat parameter is sharded across.
    pub shard: Arc<dyn ProcessGroup>,
    /// Group the sharded gradients are all-reduced across, if any.
    pub replicate: Option<Arc<dyn ProcessGroup>>,
    /// Mesh of the sharded parameter views.
    pub mesh: Arc<DeviceMesh>,
    /// Placements of the sharded parameter views.
    pub placements: Vec<Placement>,
}

impl ShardingGroups {
    /// Rank within the shard group.
    pub fn shard_rank(&self) -> usize {
        self.shard.rank()
    }

    /// Number of ranks holding one shard each.
    pub fn shard_size(&self) -> usize {
        self.shard.size()
    }
}

/// Keeps the shard needed by a smaller post-forward group.
#[derive(Clone, Debug)]
struct PostForwardGroup {
    group: Arc<dyn ProcessGroup>,
    /// Index of the first local block kept.
    first_block: usize,
    /// Number of local blocks kept.
    num_blocks: usize,
}

enum UnshardState {
    Sharded,
    Gathering { work: Work, prefetched: bool },
    Unsharded,
    PostForward(Tensor),
}

impl UnshardState {
    fn name(&self) -> &'static str {
        match self {
            UnshardState::Sharded => "sharded",
            UnshardState::Gathering { .. } => "gathering",
            UnshardState::Unsharded => "unsharded",
            UnshardState::PostForward(_) => "post-forward",
        }
    }
}

struct PendingReduce {
    work: Work,
    all_reduce: bool,
}

/// Owns the flat parameter of one unit and drives its collectives.
pub struct FlatParamHandle {
    params: Vec<FlatParamInfo>,
    groups: ShardingGroups,
    post_forward: Option<PostForwardGroup>,
    dtype: DType,
    param_dtype: DType,
    reduce_dtype: DType,
    compute_device: Device,
    storage_device: Device,
    block_numel: usize,
    /// This rank's padded slots, in the original dtype on the storage device.
    local_shard: Tensor,
    state: UnshardState,
    views: Vec<Tensor>,
    unsharded_grads: Vec<Option<Tensor>>,
    pending_reduce: Option<PendingReduce>,
    partial_reduce: Option<Tensor>,
    sharded_grad: Option<Tensor>,
}

impl FlatParamHandle {
    /// Shards `params` across `groups`, keeping this rank's slots.
    ///
    /// The parameters hold full values, identical on every rank.
    pub(crate) fn new(
        params: Vec<(String, ModuleId, Parameter)>,
        groups: ShardingGroups,
        config: &FsdpConfig,
        compute_device: Device,
    ) -> Result<Self> {
        let dtype = match params.first() {
            Some((_, _, param)) => param.data.dtype(),
            None => DType::F32,
        };
        if let Some((fqn, _, param)) = params.iter().find(|(_, _, p)| p.data.dtype() != dtype) {
            return Err(DistError::Configuration(format!(
                "parameter {fqn} has dtype {:?} but the unit's parameters are {dtype:?}",
                param.data.dtype()
            )));
        }
        let storage_device = match config.cpu_offload.offload_params {
            true => Device::Cpu,
            false => compute_device.clone(),
        };

        let world_size = groups.shard_size();
        let shard_rank = groups.shard_rank();
        let mut infos = Vec::with_capacity(params.len());
        let mut slots = Vec::with_capacity(params.len());
        let mut slot_offset = 0;
        for (fqn, module, param) in params {
            let shape = param.data.dims().to_vec();
            let row_numel: usize = shape[1..].iter().product();
            let slot_rows = shape[0].div_ceil(world_size);
            let (local_rows, row_offset) =
                Placement::local_shard_size_on_dim(shape[0], world_size, shard_rank);

            let rows = param
                .data
                .reshape((shape[0], row_numel))?
                .narrow(0, row_offset, local_rows)?;
            slots.push(pad_dim(&rows, 0, slot_rows - local_rows)?.flatten_all()?);

            infos.push(FlatParamInfo {
                fqn,
                module,
                name: param.name,
                shape,
                requires_grad: param.requires_grad,
                slot_rows,
                row_numel,
                local_rows,
                row_offset,
                slot_offset,
            });
            slot_offset += slot_rows * row_numel;
        }

        let local_shard = match slots.is_empty() {
            true => Tensor::zeros(0, dtype, &storage_device)?,
            false => concat(&slots, 0)?.to_device(&storage_device)?,
        };
        log::debug!(
            "flat parameter with {} parameters, {} local elements, shard rank {shard_rank}/{world_size}",
            infos.len(),
            slot_offset
        );

        Ok(Self {
            unsharded_grads: vec![None; infos.len()],
            params: infos,
            groups,
            post_forward: None,
            dtype,
            param_dtype: config.mixed_precision.param_dtype().unwrap_or(dtype),
            reduce_dtype: config.mixed_precision.reduce_dtype().unwrap_or(dtype),
            compute_device,
            storage_device,
            block_numel: slot_offset,
            local_shard,
            state: UnshardState::Sharded,
            views: Vec::new(),
            pending_reduce: None,
            partial_reduce: None,
            sharded_grad: None,
        })
    }

    /// Sets up the post-forward group of a [`ReshardAfterForward::ToWorldSize`] policy.
    pub(crate) fn init_post_forward(&mut self, policy: ReshardAfterForward, mesh: &DeviceMesh) -> Result<()> {
        let ReshardAfterForward::ToWorldSize(size) = policy else {
            return Ok(());
        };
        let world_size = self.groups.shard_size();
        policy.validate(world_size)?;

        let shard_rank = self.groups.shard_rank();
        let base = (shard_rank / size) * size;
        let ranks = &self.groups.shard.ranks()[base..base + size];
        let group = mesh.new_group(ranks)?;
        let num_blocks = world_size / size;
        self.post_forward = Some(PostForwardGroup {
            group,
            first_block: (shard_rank % size) * num_blocks,
            num_blocks,
        });
        log::debug!("post-forward group {ranks:?} keeps {num_blocks} of {world_size} blocks");
        Ok(())
    }

    /// Parameters of the flat buffer, in order.
    pub fn params(&self) -> &[FlatParamInfo] {
        &self.params
    }

    /// Position of the parameter named `fqn`.
    pub fn index_of(&self, fqn: &str) -> Option<usize> {
        self.params.iter().position(|p| p.fqn == fqn)
    }

    /// Whether the unit owns no parameter.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Dtype parameters are stored in.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub(crate) fn groups(&self) -> &ShardingGroups {
        &self.groups
    }

    /// This rank's padded flat shard.
    pub fn local_shard(&self) -> &Tensor {
        &self.local_shard
    }

    /// Whether the full parameters are materialized.
    pub fn is_unsharded(&self) -> bool {
        matches!(self.state, UnshardState::Unsharded)
    }

    /// Whether only this rank's shard is materialized.
    pub fn is_sharded(&self) -> bool {
        matches!(self.state, UnshardState::Sharded)
    }

    /// Whether the next use needs an all-gather.
    pub fn needs_unshard(&self) -> bool {
        matches!(self.state, UnshardState::Sharded | UnshardState::PostForward(_))
    }

    /// Whether a prefetched all-gather was issued and not consumed yet.
    pub fn is_prefetched(&self) -> bool {
        matches!(self.state, UnshardState::Gathering { prefetched: true, .. })
    }

    /// Issues the all-gather of the full parameters, unless already issued or done.
    pub fn unshard(&mut self, prefetched: bool) -> Result<()> {
        if self.is_empty() {
            self.state = UnshardState::Unsharded;
            return Ok(());
        }
        let work = match &self.state {
            UnshardState::Sharded => {
                let input = self
                    .local_shard
                    .to_device(&self.compute_device)?
                    .to_dtype(self.param_dtype)?;
                self.groups.shard.all_gather_into_tensor(&input)?
            }
            UnshardState::PostForward(intermediate) => {
                let group = self.post_forward.as_ref().ok_or_else(|| {
                    DistError::InvalidState("post-forward shard without a post-forward group".into())
                })?;
                group.group.all_gather_into_tensor(intermediate)?
            }
            UnshardState::Gathering { .. } | UnshardState::Unsharded => return Ok(()),
        };
        log::debug!("issued unshard of {} parameters (prefetch: {prefetched})", self.params.len());
        self.state = UnshardState::Gathering { work, prefetched };
        Ok(())
    }

    /// Waits for the all-gather and rebuilds the unsharded views.
    pub fn wait_unshard(&mut self) -> Result<()> {
        if matches!(self.state, UnshardState::Sharded | UnshardState::PostForward(_)) {
            self.unshard(false)?;
        }
        let state = std::mem::replace(&mut self.state, UnshardState::Unsharded);
        if let UnshardState::Gathering { work, .. } = state {
            let full = work.wait()?;
            self.views = self.views_from_full(&full)?;
        }
        Ok(())
    }

    /// Unsharded parameters with their original shapes, in `param_dtype`.
    pub fn views(&self) -> Result<&[Tensor]> {
        match self.state {
            UnshardState::Unsharded => Ok(&self.views),
            ref other => Err(DistError::InvalidState(format!(
                "unsharded parameters are not available while {}",
                other.name()
            ))),
        }
    }

    /// Frees the unsharded parameters according to `policy`.
    ///
    /// A pending all-gather is dropped; its collective still completes on the
    /// communication worker.
    pub fn reshard(&mut self, policy: ReshardAfterForward) -> Result<()> {
        if policy == ReshardAfterForward::Never {
            return Ok(());
        }
        let state = std::mem::replace(&mut self.state, UnshardState::Sharded);
        match (state, &self.post_forward, policy) {
            (UnshardState::Unsharded, Some(group), ReshardAfterForward::ToWorldSize(_))
                if !self.is_empty() =>
            {
                let full = concat(&self.views_to_blocks()?, 0)?;
                let intermediate = full.narrow(
                    0,
                    group.first_block * self.block_numel,
                    group.num_blocks * self.block_numel,
                )?;
                self.state = UnshardState::PostForward(intermediate);
            }
            (UnshardState::PostForward(intermediate), _, ReshardAfterForward::ToWorldSize(_)) => {
                self.state = UnshardState::PostForward(intermediate);
            }
            (state, _, _) => {
                if !matches!(state, UnshardState::Sharded) {
                    log::debug!("resharded {} parameters from {}", self.params.len(), state.name());
                }
            }
        }
        self.views.clear();
        Ok(())
    }

    /// Drops any unsharded or intermediate copy after the local shard changed.
    fn invalidate(&mut self) {
        self.state = UnshardState::Sharded;
        self.views.clear();
    }

    fn views_from_full(&self, full: &Tensor) -> Result<Vec<Tensor>> {
        let world_size = self.groups.shard_size();
        self.params
            .iter()
            .map(|info| {
                let parts = (0..world_size)
                    .map(|rank| {
                        let (rows, _) =
                            Placement::local_shard_size_on_dim(info.shape[0], world_size, rank);
                        Ok(full.narrow(
                            0,
                            rank * self.block_numel + info.slot_offset,
                            rows * info.row_numel,
                        )?)
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(concat(&parts, 0)?.reshape(info.shape.as_slice())?)
            })
            .collect()
    }

    /// Packs per-parameter full tensors into per-rank padded blocks.
    fn pack_blocks(&self, tensors: &[Option<Tensor>], dtype: DType, device: &Device) -> Result<Vec<Tensor>> {
        let world_size = self.groups.shard_size();
        (0..world_size)
            .map(|rank| {
                let slots = self
                    .params
                    .iter()
                    .zip(tensors)
                    .map(|(info, tensor)| {
                        let (rows, start) =
                            Placement::local_shard_size_on_dim(info.shape[0], world_size, rank);
                        let slot = match tensor {
                            Some(t) => {
                                let rows_2d = t
                                    .to_dtype(dtype)?
                                    .to_device(device)?
                                    .reshape((info.shape[0], info.row_numel))?
                                    .narrow(0, start, rows)?;
                                pad_dim(&rows_2d, 0, info.slot_rows - rows)?.flatten_all()?
                            }
                            None => Tensor::zeros(info.slot_numel(), dtype, device)?,
                        };
                        Ok(slot)
                    })
                    .collect::<Result<Vec<_>>>()?;
                concat(&slots, 0)
            })
            .collect()
    }

    fn views_to_blocks(&self) -> Result<Vec<Tensor>> {
        let views: Vec<Option<Tensor>> = self.views.iter().cloned().map(Some).collect();
        self.pack_blocks(&views, self.param_dtype, &self.compute_device)
    }

    /// Adds `grad` to the unsharded gradient of parameter `index`.
    pub fn accumulate_grad(&mut self, index: usize, grad: &Tensor) -> Result<()> {
        let info = self.params.get(index).ok_or_else(|| {
            DistError::Configuration(format!("no parameter at index {index}"))
        })?;
        if !info.requires_grad {
            return Err(DistError::Configuration(format!(
                "parameter {} does not require gradients",
                info.fqn
            )));
        }
        if grad.dims() != info.shape.as_slice() {
            return Err(DistError::Configuration(format!(
                "gradient of shape {:?} for parameter {} of shape {:?}",
                grad.dims(),
                info.fqn,
                info.shape
            )));
        }
        let slot = &mut self.unsharded_grads[index];
        *slot = Some(match slot.take() {
            Some(acc) => acc.add(&grad.to_dtype(acc.dtype())?)?,
            None => grad.clone(),
        });
        Ok(())
    }

    /// Whether any unsharded gradient is waiting for reduction.
    pub fn has_unsharded_grads(&self) -> bool {
        self.unsharded_grads.iter().any(Option::is_some)
    }

    /// Issues the reduce-scatter of the accumulated unsharded gradients.
    ///
    /// `all_reduce` tells whether the result is all-reduced across the
    /// replicate group once it arrives. Returns false when there was nothing
    /// to reduce.
    pub fn reduce_grad(&mut self, all_reduce: bool) -> Result<bool> {
        if !self.has_unsharded_grads() {
            return Ok(false);
        }
        // At most one reduce-scatter in flight per handle.
        self.finish_reduce()?;

        let grads = std::mem::replace(&mut self.unsharded_grads, vec![None; self.params.len()]);
        let packed = concat(
            &self.pack_blocks(&grads, self.reduce_dtype, &self.compute_device)?,
            0,
        )?;
        let work = self.groups.shard.reduce_scatter_tensor(&packed, ReduceOp::Avg)?;
        log::debug!("issued reduce-scatter of {} gradient elements", packed.elem_count());
        self.pending_reduce = Some(PendingReduce { work, all_reduce });
        Ok(true)
    }

    /// Waits for the in-flight reduce-scatter and folds it into the sharded gradient.
    pub fn finish_reduce(&mut self) -> Result<()> {
        let Some(pending) = self.pending_reduce.take() else {
            return Ok(());
        };
        let mut reduced = pending.work.wait()?;

        if let Some(replicate) = &self.groups.replicate {
            if let Some(partial) = self.partial_reduce.take() {
                reduced = reduced.add(&partial)?;
            }
            if !pending.all_reduce {
                self.partial_reduce = Some(reduced);
                return Ok(());
            }
            reduced = replicate.all_reduce(&reduced, ReduceOp::Avg)?.wait()?;
        }

        let reduced = reduced.to_dtype(self.dtype)?.to_device(&self.storage_device)?;
        self.sharded_grad = Some(match self.sharded_grad.take() {
            Some(acc) => acc.add(&reduced)?,
            None => reduced,
        });
        Ok(())
    }

    /// Whether a reduce-scatter is in flight.
    pub fn has_pending_reduce(&self) -> bool {
        self.pending_reduce.is_some()
    }

    /// Reduced gradients not all-reduced across replicas yet.
    pub fn partial_reduce(&self) -> Option<&Tensor> {
        self.partial_reduce.as_ref()
    }

    /// This rank's padded flat gradient shard.
    pub fn sharded_grad(&self) -> Option<&Tensor> {
        self.sharded_grad.as_ref()
    }

    /// Multiplies the sharded gradient by `factor`.
    pub fn scale_grad(&mut self, factor: f64) -> Result<()> {
        if let Some(grad) = self.sharded_grad.take() {
            self.sharded_grad = Some(grad.affine(factor, 0.0)?);
        }
        Ok(())
    }

    /// Drops every gradient.
    pub fn zero_grad(&mut self) {
        self.unsharded_grads = vec![None; self.params.len()];
        self.partial_reduce = None;
        self.sharded_grad = None;
    }

    /// Moves the sharded gradient to the storage device.
    pub(crate) fn sync_offload(&mut self) -> Result<()> {
        if let Some(grad) = self.sharded_grad.take() {
            self.sharded_grad = Some(grad.to_device(&self.storage_device)?);
        }
        Ok(())
    }

    fn local_rows(&self, flat: &Tensor, info: &FlatParamInfo) -> Result<Tensor> {
        Ok(flat
            .narrow(0, info.slot_offset, info.local_numel())?
            .reshape(info.local_shape())?)
    }

    fn param_info(&self, index: usize) -> Result<&FlatParamInfo> {
        self.params
            .get(index)
            .ok_or_else(|| DistError::Configuration(format!("no parameter at index {index}")))
    }

    /// This rank's rows of parameter `index`.
    pub fn param_local(&self, index: usize) -> Result<Tensor> {
        self.local_rows(&self.local_shard, self.param_info(index)?)
    }

    /// This rank's rows of the gradient of parameter `index`.
    pub fn grad_local(&self, index: usize) -> Result<Option<Tensor>> {
        let info = self.param_info(index)?;
        self.sharded_grad
            .as_ref()
            .map(|grad| self.local_rows(grad, info))
            .transpose()
    }

    /// Replaces this rank's rows of parameter `index`.
    pub fn set_param_local(&mut self, index: usize, value: &Tensor) -> Result<()> {
        let info = self.param_info(index)?;
        if value.dims() != info.local_shape().as_slice() {
            return Err(DistError::Configuration(format!(
                "local value of shape {:?} for {} whose shard is {:?}",
                value.dims(),
                info.fqn,
                info.local_shape()
            )));
        }
        let (start, len) = (info.slot_offset, info.local_numel());
        let total = self.local_shard.elem_count();
        let value = value
            .flatten_all()?
            .to_dtype(self.dtype)?
            .to_device(&self.storage_device)?;
        self.local_shard = concat(
            &[
                self.local_shard.narrow(0, 0, start)?,
                value,
                self.local_shard.narrow(0, start + len, total - start - len)?,
            ],
            0,
        )?;
        self.invalidate();
        Ok(())
    }

    /// Keeps this rank's rows of the full value of parameter `index`.
    pub fn set_param_full(&mut self, index: usize, full: &Tensor) -> Result<()> {
        let local = self.shard_of(index, full)?;
        self.set_param_local(index, &local)
    }

    /// This rank's rows of `full`, shaped like parameter `index`.
    pub fn shard_of(&self, index: usize, full: &Tensor) -> Result<Tensor> {
        let info = self.param_info(index)?;
        if full.dims() != info.shape.as_slice() {
            return Err(DistError::Configuration(format!(
                "value of shape {:?} for parameter {} of shape {:?}",
                full.dims(),
                info.fqn,
                info.shape
            )));
        }
        Ok(full.narrow(0, info.row_offset, info.local_rows)?)
    }

    /// Global offset of this rank's rows of parameter `index`.
    pub fn global_offset(&self, index: usize) -> Result<Vec<usize>> {
        let info = self.param_info(index)?;
        let mut offset = vec![0; info.shape.len()];
        offset[0] = info.row_offset;
        Ok(offset)
    }

    /// Sharded view of parameter `index` as a distributed tensor.
    pub fn sharded_param(&self, index: usize) -> Result<DTensor> {
        let info = self.param_info(index)?;
        let spec = DTensorSpec::new(
            self.groups.mesh.clone(),
            self.groups.placements.clone(),
            Some(TensorMeta::contiguous(info.shape.clone(), self.dtype)),
        )?;
        DTensor::from_parts(self.param_local(index)?, spec)
    }

    /// All-gathers `local`, shaped like this rank's rows of parameter `index`,
    /// into the full tensor. Collective over the shard group.
    pub fn gather_param(&self, index: usize, local: &Tensor) -> Result<Tensor> {
        let info = self.param_info(index)?;
        let world_size = self.groups.shard_size();
        let rows = local.reshape((info.local_rows, info.row_numel))?;
        let slot = pad_dim(&rows, 0, info.slot_rows - info.local_rows)?.flatten_all()?;
        let gathered = self.groups.shard.all_gather_into_tensor(&slot)?.wait()?;

        let parts = (0..world_size)
            .map(|rank| {
                let (rows, _) = Placement::local_shard_size_on_dim(info.shape[0], world_size, rank);
                Ok(gathered.narrow(0, rank * info.slot_numel(), rows * info.row_numel)?)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(concat(&parts, 0)?.reshape(info.shape.as_slice())?)
    }

    /// All-gathers every parameter in its original dtype, without touching the
    /// unshard state. Collective over the shard group.
    pub fn gather_full_params(&self) -> Result<Vec<Tensor>> {
        if self.is_empty() {
            return Ok(Vec::new());
        }
        let full = self
            .groups
            .shard
            .all_gather_into_tensor(&self.local_shard)?
            .wait()?;
        self.views_from_full(&full)
    }

    /// All-gathers every gradient, zeros where none was reduced yet.
    pub fn gather_full_grads(&self) -> Result<Vec<Tensor>> {
        if self.is_empty() {
            return Ok(Vec::new());
        }
        let local = match &self.sharded_grad {
            Some(grad) => grad.clone(),
            None => self.local_shard.zeros_like()?,
        };
        let full = self.groups.shard.all_gather_into_tensor(&local)?.wait()?;
        self.views_from_full(&full)
    }

    /// Broadcasts `tensor` from the first rank of the replicate group, then
    /// from the first rank of the shard group.
    pub(crate) fn broadcast_from_first(groups: &ShardingGroups, tensor: &Tensor) -> Result<Tensor> {
        let mut value = tensor.clone();
        if let Some(replicate) = &groups.replicate {
            value = replicate.broadcast(&value, 0)?.wait()?;
        }
        Ok(groups.shard.broadcast(&value, 0)?.wait()?)
    }
}

impl std::fmt::Debug for FlatParamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlatParamHandle")
            .field("params", &self.params.iter().map(|p| &p.fqn).collect::<Vec<_>>())
            .field("state", &self.state.name())
            .field("block_numel", &self.block_numel)
            .field("dtype", &self.dtype)
            .finish()
    }
}
