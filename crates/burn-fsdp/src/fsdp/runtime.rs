use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use candle_core::{DType, Device, Tensor};
use hashbrown::{HashMap, HashSet};

use super::{
    BackwardPrefetch, FlatParamHandle, FsdpConfig, FullyShardOptions, HookHandle, HookKind,
    HookRegistry, ModuleId, ModuleTree, Parameter, ReshardAfterForward, RootRole,
    ShardingGroups, ShardingStrategy, TrainingState, UnitState, plan_wrapping,
};
use crate::comm::{LocalProcessGroup, ProcessGroup, ReduceOp};
use crate::sharding::{DeviceMesh, Placement};
use crate::{DTensor, DistError, Result};

/// Values made of tensors, walked when inputs are moved or cast.
pub trait TensorTree: Sized {
    /// Applies `f` to every tensor.
    fn map_tensors<F: FnMut(Tensor) -> Result<Tensor>>(self, f: &mut F) -> Result<Self>;
}

impl TensorTree for Tensor {
    fn map_tensors<F: FnMut(Tensor) -> Result<Tensor>>(self, f: &mut F) -> Result<Self> {
        f(self)
    }
}

impl TensorTree for () {
    fn map_tensors<F: FnMut(Tensor) -> Result<Tensor>>(self, _f: &mut F) -> Result<Self> {
        Ok(())
    }
}

impl<T: TensorTree> TensorTree for Vec<T> {
    fn map_tensors<F: FnMut(Tensor) -> Result<Tensor>>(self, f: &mut F) -> Result<Self> {
        self.into_iter().map(|item| item.map_tensors(f)).collect()
    }
}

impl<T: TensorTree> TensorTree for Option<T> {
    fn map_tensors<F: FnMut(Tensor) -> Result<Tensor>>(self, f: &mut F) -> Result<Self> {
        self.map(|item| item.map_tensors(f)).transpose()
    }
}

impl<A: TensorTree, B: TensorTree> TensorTree for (A, B) {
    fn map_tensors<F: FnMut(Tensor) -> Result<Tensor>>(self, f: &mut F) -> Result<Self> {
        Ok((self.0.map_tensors(f)?, self.1.map_tensors(f)?))
    }
}

impl<A: TensorTree, B: TensorTree, C: TensorTree> TensorTree for (A, B, C) {
    fn map_tensors<F: FnMut(Tensor) -> Result<Tensor>>(self, f: &mut F) -> Result<Self> {
        Ok((
            self.0.map_tensors(f)?,
            self.1.map_tensors(f)?,
            self.2.map_tensors(f)?,
        ))
    }
}

fn cast_floats<T: TensorTree>(value: T, dtype: DType) -> Result<T> {
    value.map_tensors(&mut |t: Tensor| -> Result<Tensor> {
        match t.dtype().is_float() {
            true => Ok(t.to_dtype(dtype)?),
            false => Ok(t),
        }
    })
}

/// Parameters visible to a unit's closure, looked up by name relative to the
/// unit's module or by fully qualified name.
#[derive(Clone, Debug, Default)]
pub struct ParamViews {
    prefix: String,
    entries: Vec<(String, Tensor)>,
}

impl ParamViews {
    /// The parameter called `name`.
    pub fn get(&self, name: &str) -> Result<&Tensor> {
        let qualified = ModuleTree::join(&self.prefix, name);
        self.entries
            .iter()
            .find(|(fqn, _)| *fqn == qualified)
            .or_else(|| self.entries.iter().find(|(fqn, _)| fqn == name))
            .map(|(_, tensor)| tensor)
            .ok_or_else(|| {
                DistError::Configuration(format!("no parameter {name} under {:?}", self.prefix))
            })
    }

    /// Fully qualified names in flat parameter order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(fqn, _)| fqn.as_str())
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the unit exposes no parameter.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A parameter as seen from outside the runtime.
#[derive(Clone, Debug)]
pub enum ParamValue {
    /// Sharded view with the original global shape.
    DTensor(DTensor),
    /// Flattened local shard, with the original shape recorded.
    Plain {
        /// This rank's rows, flattened.
        local: Tensor,
        /// Original shape.
        shape: Vec<usize>,
    },
    /// Parameter of an ignored module, held in full by every rank.
    Unmanaged(Tensor),
}

/// Where the runtime keeps a parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ParamSlot {
    Managed { unit: usize, index: usize },
    Unmanaged { module: ModuleId, index: usize },
}

pub(crate) struct FsdpUnit {
    pub module: ModuleId,
    pub name: String,
    pub config: FsdpConfig,
    pub reshard_after_forward: ReshardAfterForward,
    pub device: Device,
    pub state: UnitState,
    pub handle: FlatParamHandle,
    /// Parameters of ignored modules in the unit's subtree.
    pub unmanaged: Vec<(String, ModuleId, usize)>,
}

#[derive(Default)]
struct ExecOrder {
    recorded: Arc<Mutex<Vec<ModuleId>>>,
    recorder: Option<HookHandle>,
    order: Vec<usize>,
    frozen: bool,
}

/// Options of [`FsdpModel::summon_full_params`].
#[derive(Clone, Copy, Debug)]
pub struct SummonOptions {
    /// Include nested units.
    pub recurse: bool,
    /// Write modified values back into the shards.
    pub writeback: bool,
    /// Only rank 0 receives the full parameters.
    pub rank0_only: bool,
    /// Move the full parameters to the CPU.
    pub offload_to_cpu: bool,
    /// Also gather the sharded gradients.
    pub with_grads: bool,
}

impl Default for SummonOptions {
    fn default() -> Self {
        Self {
            recurse: true,
            writeback: true,
            rank0_only: false,
            offload_to_cpu: false,
            with_grads: false,
        }
    }
}

/// Full parameters handed to a [`FsdpModel::summon_full_params`] closure.
#[derive(Debug, Default)]
pub struct FullParams {
    /// Full parameter values keyed by fully qualified name.
    pub params: BTreeMap<String, Tensor>,
    /// Full gradients, when requested.
    pub grads: BTreeMap<String, Tensor>,
}

/// A module tree trained with fully sharded data parallelism.
pub struct FsdpModel {
    tree: ModuleTree,
    mesh: Arc<DeviceMesh>,
    units: Vec<FsdpUnit>,
    unit_of: HashMap<ModuleId, usize>,
    managed: HashMap<String, (usize, usize)>,
    ignored: HashSet<ModuleId>,
    param_order: Vec<String>,
    hooks: HookRegistry,
    exec_order: ExecOrder,
    initialized: bool,
}

impl FsdpModel {
    /// Takes ownership of `tree`, sharding over `mesh` unless a unit says otherwise.
    pub fn new(tree: ModuleTree, mesh: Arc<DeviceMesh>) -> Result<Self> {
        let param_order = tree
            .named_parameters(tree.root())?
            .into_iter()
            .map(|(fqn, _)| fqn)
            .collect();
        Ok(Self {
            tree,
            mesh,
            units: Vec::new(),
            unit_of: HashMap::new(),
            managed: HashMap::new(),
            ignored: HashSet::new(),
            param_order,
            hooks: HookRegistry::default(),
            exec_order: ExecOrder::default(),
            initialized: false,
        })
    }

    /// The module tree. Parameters managed by a unit are not part of it anymore.
    pub fn tree(&self) -> &ModuleTree {
        &self.tree
    }

    /// Default mesh.
    pub fn mesh(&self) -> &Arc<DeviceMesh> {
        &self.mesh
    }

    /// Hooks fired around every unit.
    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Number of units.
    pub fn num_units(&self) -> usize {
        self.units.len()
    }

    /// Whether `module` is the module of a unit.
    pub fn is_unit(&self, module: ModuleId) -> bool {
        self.unit_of.contains_key(&module)
    }

    /// Modules of the units in forward execution order, once recorded.
    pub fn execution_order(&self) -> Option<Vec<ModuleId>> {
        self.exec_order
            .frozen
            .then(|| self.exec_order.order.iter().map(|&u| self.units[u].module).collect())
    }

    /// Training state of the unit of `module`.
    pub fn training_state(&self, module: ModuleId) -> Result<TrainingState> {
        Ok(self.units[self.unit_index(module)?].state.training_state)
    }

    /// Root role of the unit of `module`, `None` before the first forward.
    pub fn root_role(&self, module: ModuleId) -> Result<Option<RootRole>> {
        Ok(self.units[self.unit_index(module)?].state.role())
    }

    /// Flat parameter of the unit of `module`.
    pub fn handle(&self, module: ModuleId) -> Result<&FlatParamHandle> {
        Ok(&self.units[self.unit_index(module)?].handle)
    }

    fn unit_index(&self, module: ModuleId) -> Result<usize> {
        self.unit_of.get(&module).copied().ok_or_else(|| {
            DistError::Configuration(format!(
                "module {:?} is not an FSDP unit",
                self.tree.fqn(module).unwrap_or_default()
            ))
        })
    }

    /// Turns `module` into an FSDP unit, wrapping descendants selected by the
    /// policy first.
    pub fn fully_shard(&mut self, module: ModuleId, options: FullyShardOptions) -> Result<()> {
        if self.initialized {
            return Err(DistError::InvalidState(
                "fully_shard must be called before the first forward".to_string(),
            ));
        }
        if let Some(policy) = &options.policy {
            policy.validate()?;
        }
        for &ignored in &options.ignored_modules {
            self.ignored.extend(self.tree.descendants(ignored));
        }
        if self.ignored.contains(&module) {
            return Err(DistError::Configuration(format!(
                "module {:?} is ignored and cannot be sharded",
                self.tree.fqn(module)?
            )));
        }

        if let Some(policy) = &options.policy {
            let wrapped: HashSet<ModuleId> = self.unit_of.keys().copied().collect();
            let plan = plan_wrapping(&self.tree, module, policy.as_ref(), &self.ignored, &wrapped);
            for child in plan {
                log::info!("auto-wrapping {:?} ({})", self.tree.fqn(child)?, self.tree.kind(child)?);
                self.shard_unit(child, &options)?;
            }
        }
        self.shard_unit(module, &options)
    }

    fn sharding_groups(&self, options: &FullyShardOptions) -> Result<ShardingGroups> {
        let mesh = match (&options.process_group, &options.mesh) {
            (Some(group), _) => Arc::new(DeviceMesh::from_group(group.clone(), None)),
            (None, Some(mesh)) => mesh.clone(),
            (None, None) => self.mesh.clone(),
        };
        let strategy = options.config.sharding_strategy;
        let expected_ndim = if strategy.is_hybrid() { 2 } else { 1 };
        if mesh.ndim() != expected_ndim {
            return Err(DistError::Configuration(format!(
                "{strategy} needs a {expected_ndim}-D mesh, got shape {:?}",
                mesh.shape()
            )));
        }

        Ok(match strategy {
            ShardingStrategy::FullShard | ShardingStrategy::ShardGradOp => ShardingGroups {
                shard: mesh.group(0)?.clone(),
                replicate: None,
                placements: vec![Placement::Shard(0)],
                mesh,
            },
            ShardingStrategy::HybridShard | ShardingStrategy::HybridShardZero2 => ShardingGroups {
                shard: mesh.group(1)?.clone(),
                replicate: Some(mesh.group(0)?.clone()),
                placements: vec![Placement::Replicate, Placement::Shard(0)],
                mesh,
            },
            ShardingStrategy::NoShard => ShardingGroups {
                shard: Arc::new(LocalProcessGroup::for_rank(mesh.rank())) as Arc<dyn ProcessGroup>,
                replicate: Some(mesh.group(0)?.clone()),
                placements: vec![Placement::Replicate],
                mesh,
            },
        })
    }

    fn shard_unit(&mut self, module: ModuleId, options: &FullyShardOptions) -> Result<()> {
        if self.unit_of.contains_key(&module) {
            return Err(DistError::Configuration(format!(
                "module {:?} is already an FSDP unit",
                self.tree.fqn(module)?
            )));
        }
        let config = options.config.clone();
        let groups = self.sharding_groups(options)?;
        let reshard_after_forward = config.resolved_reshard_after_forward();
        reshard_after_forward.validate(groups.shard_size())?;
        if config.cpu_offload.offload_params {
            log::debug!("offloading parameters of {:?} to the CPU", self.tree.fqn(module)?);
        }

        // Modules of this unit: stop at nested units and ignored modules.
        let mut modules = Vec::new();
        let mut unmanaged = Vec::new();
        let mut stack = vec![module];
        while let Some(id) = stack.pop() {
            if id != module && self.unit_of.contains_key(&id) {
                continue;
            }
            if self.ignored.contains(&id) {
                let prefix = self.tree.fqn(id)?;
                for (index, param) in self.tree.parameters(id)?.iter().enumerate() {
                    unmanaged.push((ModuleTree::join(&prefix, &param.name), id, index));
                }
            } else {
                modules.push(id);
            }
            stack.extend(self.tree.children(id).iter().rev());
        }

        let mut params = Vec::new();
        for &id in &modules {
            let prefix = self.tree.fqn(id)?;
            for mut param in self.tree.take_parameters(id)? {
                if config.sync_module_states {
                    param.data = FlatParamHandle::broadcast_from_first(&groups, &param.data)?;
                }
                params.push((ModuleTree::join(&prefix, &param.name), id, param));
            }
            if config.sync_module_states {
                let buffers = self.tree.buffers(id)?.to_vec();
                for (name, data) in buffers {
                    let synced = FlatParamHandle::broadcast_from_first(&groups, &data)?;
                    self.tree.set_buffer(id, &name, synced)?;
                }
            }
        }

        let unit = self.units.len();
        for (index, (fqn, _, _)) in params.iter().enumerate() {
            self.managed.insert(fqn.clone(), (unit, index));
        }
        let device = options.device.clone().unwrap_or(Device::Cpu);
        let mesh = groups.mesh.clone();
        let mut handle = FlatParamHandle::new(params, groups, &config, device.clone())?;
        handle.init_post_forward(reshard_after_forward, &mesh)?;

        let name = match self.tree.fqn(module)? {
            fqn if fqn.is_empty() => "<root>".to_string(),
            fqn => fqn,
        };
        log::info!(
            "wrapped {name:?} as FSDP unit {unit} with {} parameters ({}, reshard after forward: {:?})",
            handle.params().len(),
            config.sharding_strategy,
            reshard_after_forward
        );
        self.unit_of.insert(module, unit);
        self.units.push(FsdpUnit {
            module,
            name,
            config,
            reshard_after_forward,
            device,
            state: UnitState::default(),
            handle,
            unmanaged,
        });
        Ok(())
    }

    fn lazy_init(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        if self.units.is_empty() {
            return Err(DistError::Configuration(
                "forward called on a model without FSDP units".to_string(),
            ));
        }
        for unit in 0..self.units.len() {
            let module = self.units[unit].module;
            let nested = self
                .units
                .iter()
                .any(|other| other.module != module && self.tree.is_ancestor(other.module, module));
            let role = if nested { RootRole::NonRoot } else { RootRole::Root };
            if self.units[unit].state.init_role(role) != role {
                return Err(DistError::InvalidState(format!(
                    "unit {:?} already has a different root role",
                    self.units[unit].name
                )));
            }
            if role == RootRole::Root {
                log::info!(
                    "lazy init: {:?} is a root unit over {} units",
                    self.units[unit].name,
                    self.units.len()
                );
            }
        }

        let recorded = self.exec_order.recorded.clone();
        self.exec_order.recorder = Some(self.hooks.register(
            HookKind::PreForward,
            None,
            Arc::new(move |_: HookKind, module: ModuleId| {
                if let Ok(mut order) = recorded.lock() {
                    order.push(module);
                }
            }),
        ));
        self.initialized = true;
        Ok(())
    }

    fn freeze_execution_order(&mut self) {
        if self.exec_order.frozen {
            return;
        }
        let recorded = match self.exec_order.recorded.lock() {
            Ok(mut recorded) => std::mem::take(&mut *recorded),
            Err(_) => Vec::new(),
        };
        let mut seen = HashSet::new();
        self.exec_order.order = recorded
            .into_iter()
            .filter_map(|module| self.unit_of.get(&module).copied())
            .filter(|unit| seen.insert(*unit))
            .collect();
        self.exec_order.recorder = None;
        self.exec_order.frozen = true;
        log::debug!(
            "recorded execution order {:?}",
            self.exec_order
                .order
                .iter()
                .map(|&u| self.units[u].name.as_str())
                .collect::<Vec<_>>()
        );
    }

    fn neighbor(&self, unit: usize, forward: bool) -> Option<usize> {
        if !self.exec_order.frozen {
            return None;
        }
        let order = &self.exec_order.order;
        let position = order.iter().position(|&u| u == unit)?;
        match forward {
            true => order.get(position + 1).copied(),
            false => position.checked_sub(1).map(|p| order[p]),
        }
    }

    fn prefetch(&mut self, target: usize) -> Result<()> {
        if !self.units[target].handle.needs_unshard() {
            return Ok(());
        }
        if self.units[target].config.limit_all_gathers
            && self.units.iter().any(|u| u.handle.is_prefetched())
        {
            log::debug!("skipping prefetch of {:?}: an all-gather is in flight", self.units[target].name);
            return Ok(());
        }
        log::debug!("prefetching {:?}", self.units[target].name);
        self.units[target].handle.unshard(true)
    }

    fn param_views(&self, unit: usize) -> Result<ParamViews> {
        let unit = &self.units[unit];
        let mut entries: Vec<(String, Tensor)> = unit
            .handle
            .params()
            .iter()
            .zip(unit.handle.views()?)
            .map(|(info, view)| (info.fqn.clone(), view.clone()))
            .collect();
        for (fqn, module, index) in &unit.unmanaged {
            let param = &self.tree.parameters(*module)?[*index];
            entries.push((fqn.clone(), param.data.clone()));
        }
        Ok(ParamViews {
            prefix: self.tree.fqn(unit.module)?,
            entries,
        })
    }

    fn pre_forward<I: TensorTree>(&mut self, unit: usize, input: I) -> Result<I> {
        self.hooks.fire(HookKind::PreForward, self.units[unit].module);
        let FsdpUnit { name, state, .. } = &mut self.units[unit];
        state.transition(name, &[TrainingState::Idle], TrainingState::Forward)?;

        self.units[unit].handle.unshard(false)?;
        if self.units[unit].config.forward_prefetch {
            if let Some(next) = self.neighbor(unit, true) {
                self.prefetch(next)?;
            }
        }
        self.units[unit].handle.wait_unshard()?;

        let mixed = &self.units[unit].config.mixed_precision;
        match (mixed.cast_forward_inputs, mixed.param_dtype()) {
            (true, Some(dtype)) => cast_floats(input, dtype),
            _ => Ok(input),
        }
    }

    fn post_forward<R: TensorTree>(&mut self, unit: usize, output: R) -> Result<R> {
        let FsdpUnit { name, state, .. } = &mut self.units[unit];
        state.transition(name, &[TrainingState::Forward], TrainingState::Idle)?;

        // The root's parameters are needed right away by backward.
        if !self.units[unit].state.is_root() {
            let policy = self.units[unit].reshard_after_forward;
            self.units[unit].handle.reshard(policy)?;
        }
        self.hooks.fire(HookKind::PostForward, self.units[unit].module);

        match self.units[unit].config.mixed_precision.output_dtype {
            Some(precision) => cast_floats(output, precision.dtype()),
            None => Ok(output),
        }
    }

    fn pre_backward(&mut self, unit: usize) -> Result<()> {
        self.hooks.fire(HookKind::PreBackward, self.units[unit].module);
        let FsdpUnit { name, state, .. } = &mut self.units[unit];
        state.transition(name, &[TrainingState::Idle], TrainingState::BackwardPre)?;

        self.units[unit].handle.unshard(false)?;
        if self.units[unit].config.backward_prefetch == Some(BackwardPrefetch::BackwardPre) {
            if let Some(previous) = self.neighbor(unit, false) {
                self.prefetch(previous)?;
            }
        }
        self.units[unit].handle.wait_unshard()
    }

    fn post_backward(&mut self, unit: usize) -> Result<()> {
        let FsdpUnit { name, state, .. } = &mut self.units[unit];
        state.transition(name, &[TrainingState::BackwardPre], TrainingState::BackwardPost)?;

        if self.units[unit].config.backward_prefetch == Some(BackwardPrefetch::BackwardPost) {
            if let Some(previous) = self.neighbor(unit, false) {
                self.prefetch(previous)?;
            }
        }

        let unit_ref = &mut self.units[unit];
        if unit_ref.state.requires_gradient_sync {
            unit_ref.handle.reduce_grad(unit_ref.state.requires_all_reduce)?;
        }
        if unit_ref.state.reshard_after_backward {
            unit_ref.handle.reshard(ReshardAfterForward::Always)?;
        }
        self.hooks.fire(HookKind::PostBackward, self.units[unit].module);
        Ok(())
    }

    /// Finishes an iteration's backward: waits for reductions, reshards units
    /// backward did not reach and resets every unit to idle.
    fn wait_for_post_backward(&mut self) -> Result<()> {
        let mut first_error = None;
        for unit in &mut self.units {
            let result = unit
                .handle
                .finish_reduce()
                .and_then(|_| unit.handle.sync_offload())
                .and_then(|_| match unit.state.reshard_after_backward {
                    true if !unit.handle.is_sharded() => {
                        log::debug!("catch-all reshard of {:?}", unit.name);
                        unit.handle.reshard(ReshardAfterForward::Always)
                    }
                    _ => Ok(()),
                });
            if let Err(err) = result {
                log::error!("post-backward of unit {:?} failed: {err}", unit.name);
                first_error.get_or_insert(err);
            }
            unit.state.training_state = TrainingState::Idle;
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Runs the forward of root unit `module` through `f`.
    ///
    /// Inputs are moved to the root's compute device. Nested units must be run
    /// through [`ForwardContext::call`] so that their parameters get gathered.
    pub fn forward<I, R, F>(&mut self, module: ModuleId, input: I, f: F) -> Result<R>
    where
        I: TensorTree,
        R: TensorTree,
        F: FnOnce(&mut ForwardContext<'_>, &ParamViews, I) -> Result<R>,
    {
        let unit = self.unit_index(module)?;
        self.lazy_init()?;
        if !self.units[unit].state.is_root() {
            return Err(DistError::InvalidState(format!(
                "forward must start at a root unit, {:?} is nested",
                self.units[unit].name
            )));
        }

        let device = self.units[unit].device.clone();
        let input = input.map_tensors(&mut |t: Tensor| -> Result<Tensor> { Ok(t.to_device(&device)?) })?;
        let output = ForwardContext { model: self }.call(module, input, f)?;
        self.freeze_execution_order();
        Ok(output)
    }

    /// Runs the backward of the iteration through `f`, then waits for every
    /// gradient reduction.
    pub fn backward<R, F>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&mut BackwardContext<'_>) -> Result<R>,
    {
        if !self.initialized {
            return Err(DistError::InvalidState("backward before the first forward".to_string()));
        }
        let result = f(&mut BackwardContext { model: self });
        let finished = self.wait_for_post_backward();
        let value = result?;
        finished?;
        Ok(value)
    }

    /// Runs `f` without reducing gradients; they accumulate unsharded until
    /// the next synchronized backward.
    pub fn no_sync<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let previous: Vec<bool> = self
            .units
            .iter()
            .map(|u| u.state.requires_gradient_sync)
            .collect();
        for unit in &mut self.units {
            unit.state.requires_gradient_sync = false;
        }
        let result = f(self);
        for (unit, sync) in self.units.iter_mut().zip(previous) {
            unit.state.requires_gradient_sync = sync;
        }
        result
    }

    fn units_under(&self, module: ModuleId, recurse: bool) -> Result<Vec<usize>> {
        if !recurse {
            return Ok(vec![self.unit_index(module)?]);
        }
        let units: Vec<usize> = self
            .units
            .iter()
            .enumerate()
            .filter(|(_, u)| self.tree.is_ancestor(module, u.module))
            .map(|(i, _)| i)
            .collect();
        if units.is_empty() {
            return Err(DistError::Configuration(format!(
                "no FSDP unit under {:?}",
                self.tree.fqn(module)?
            )));
        }
        Ok(units)
    }

    /// Whether backward reduces gradients of the units under `module`.
    pub fn set_requires_gradient_sync(&mut self, module: ModuleId, value: bool, recurse: bool) -> Result<()> {
        for unit in self.units_under(module, recurse)? {
            self.units[unit].state.requires_gradient_sync = value;
        }
        Ok(())
    }

    /// Whether backward all-reduces gradients across replicas. Reduce-scatter
    /// still happens; its result is kept until all-reduce is enabled again.
    pub fn set_requires_all_reduce(&mut self, module: ModuleId, value: bool, recurse: bool) -> Result<()> {
        for unit in self.units_under(module, recurse)? {
            self.units[unit].state.requires_all_reduce = value;
        }
        Ok(())
    }

    /// Whether backward frees the full parameters of the units under `module`.
    pub fn set_reshard_after_backward(&mut self, module: ModuleId, value: bool, recurse: bool) -> Result<()> {
        for unit in self.units_under(module, recurse)? {
            self.units[unit].state.reshard_after_backward = value;
        }
        Ok(())
    }

    /// Gathers the full parameters of the unit of `module` now.
    pub fn unshard(&mut self, module: ModuleId) -> Result<()> {
        let unit = self.unit_index(module)?;
        self.units[unit].handle.unshard(false)?;
        self.units[unit].handle.wait_unshard()
    }

    /// Frees the full parameters of the unit of `module`.
    pub fn reshard(&mut self, module: ModuleId) -> Result<()> {
        let unit = self.unit_index(module)?;
        self.units[unit].handle.reshard(ReshardAfterForward::Always)
    }

    /// Exposes the full parameters of the units under `module` to `f`.
    ///
    /// Collective over every shard group involved, even with `rank0_only`.
    pub fn summon_full_params<R>(
        &mut self,
        module: ModuleId,
        options: SummonOptions,
        f: impl FnOnce(&mut FullParams) -> Result<R>,
    ) -> Result<R> {
        if options.writeback && options.rank0_only {
            return Err(DistError::Configuration(
                "writeback and rank0_only cannot be combined".to_string(),
            ));
        }
        if options.offload_to_cpu && !options.rank0_only {
            log::warn!("offload_to_cpu without rank0_only keeps a full copy on the CPU of every rank");
        }
        let units = self.units_under(module, options.recurse)?;
        for &unit in &units {
            let FsdpUnit { name, state, .. } = &mut self.units[unit];
            state.assert_state(name, &[TrainingState::Idle])?;
        }
        for &unit in &units {
            self.units[unit].state.training_state = TrainingState::SummonFullParams;
        }

        let result = self.run_summoned(&units, options, f);
        for &unit in &units {
            self.units[unit].state.training_state = TrainingState::Idle;
        }
        result
    }

    fn run_summoned<R>(
        &mut self,
        units: &[usize],
        options: SummonOptions,
        f: impl FnOnce(&mut FullParams) -> Result<R>,
    ) -> Result<R> {
        let keep = !options.rank0_only || self.mesh.rank() == 0;
        let place = |t: Tensor| -> Result<Tensor> {
            match options.offload_to_cpu {
                true => Ok(t.to_device(&Device::Cpu)?),
                false => Ok(t),
            }
        };

        let mut full = FullParams::default();
        for &unit in units {
            let handle = &self.units[unit].handle;
            let params = handle.gather_full_params()?;
            let grads = match options.with_grads {
                true => handle.gather_full_grads()?,
                false => Vec::new(),
            };
            if !keep {
                continue;
            }
            for (info, value) in handle.params().iter().zip(params) {
                full.params.insert(info.fqn.clone(), place(value)?);
            }
            for (info, grad) in handle.params().iter().zip(grads) {
                full.grads.insert(info.fqn.clone(), place(grad)?);
            }
        }

        let output = f(&mut full)?;

        if options.writeback {
            for (fqn, value) in &full.params {
                if let Some(&(unit, index)) = self.managed.get(fqn) {
                    self.units[unit].handle.set_param_full(index, value)?;
                }
            }
        }
        Ok(output)
    }

    /// Clips the gradient norm of every parameter to `max_norm` and returns
    /// the norm before clipping. Collective over every shard group.
    pub fn clip_grad_norm(&mut self, max_norm: f64, norm_type: f64) -> Result<f64> {
        let infinite = norm_type.is_infinite();
        let local_norm = |grad: &Tensor| -> Result<f64> {
            if grad.elem_count() == 0 {
                return Ok(0.0);
            }
            let abs = grad.to_dtype(DType::F64)?.abs()?.flatten_all()?;
            Ok(match infinite {
                true => abs.max(0)?.to_scalar::<f64>()?,
                false => abs.powf(norm_type)?.sum_all()?.to_scalar::<f64>()?,
            })
        };
        let combine = |a: f64, b: f64| if infinite { a.max(b) } else { a + b };

        let mut total = 0.0;
        for unit in &self.units {
            let local = match unit.handle.sharded_grad() {
                Some(grad) => local_norm(grad)?,
                None => 0.0,
            };
            let op = if infinite { ReduceOp::Max } else { ReduceOp::Sum };
            let value = Tensor::new(&[local], &Device::Cpu)?;
            let reduced = unit.handle.groups().shard.all_reduce(&value, op)?.wait()?;
            total = combine(total, reduced.to_vec1::<f64>()?[0]);
        }
        for fqn in &self.param_order {
            if let Some((module, index)) = self.unmanaged_position(fqn) {
                if let Some(grad) = &self.tree.parameters(module)?[index].grad {
                    total = combine(total, local_norm(grad)?);
                }
            }
        }

        let total_norm = if infinite { total } else { total.powf(1.0 / norm_type) };
        let clip_coef = max_norm / (total_norm + 1e-6);
        if clip_coef < 1.0 {
            for unit in &mut self.units {
                unit.handle.scale_grad(clip_coef)?;
            }
            for id in self.tree.descendants(self.tree.root()) {
                for param in self.tree.parameters_mut(id)? {
                    if let Some(grad) = param.grad.take() {
                        param.grad = Some(grad.affine(clip_coef, 0.0)?);
                    }
                }
            }
        }
        Ok(total_norm)
    }

    fn unmanaged_position(&self, fqn: &str) -> Option<(ModuleId, usize)> {
        match self.managed.contains_key(fqn) {
            true => None,
            false => self.tree.find_parameter(fqn),
        }
    }

    /// Every parameter in registration order.
    pub fn named_parameters(&self) -> Result<Vec<(String, ParamValue)>> {
        self.param_order
            .iter()
            .map(|fqn| {
                let value = match self.slot(fqn)? {
                    ParamSlot::Managed { unit, index } => {
                        let unit = &self.units[unit];
                        match unit.config.use_orig_params {
                            true => ParamValue::DTensor(unit.handle.sharded_param(index)?),
                            false => ParamValue::Plain {
                                local: unit.handle.param_local(index)?.flatten_all()?,
                                shape: unit.handle.params()[index].shape.clone(),
                            },
                        }
                    }
                    ParamSlot::Unmanaged { module, index } => {
                        ParamValue::Unmanaged(self.tree.parameters(module)?[index].data.clone())
                    }
                };
                Ok((fqn.clone(), value))
            })
            .collect()
    }

    /// Drops every gradient.
    pub fn zero_grad(&mut self) -> Result<()> {
        for unit in &mut self.units {
            unit.handle.zero_grad();
        }
        for id in self.tree.descendants(self.tree.root()) {
            for param in self.tree.parameters_mut(id)? {
                param.grad = None;
            }
        }
        Ok(())
    }

    pub(crate) fn param_order(&self) -> &[String] {
        &self.param_order
    }

    pub(crate) fn slot(&self, fqn: &str) -> Result<ParamSlot> {
        if let Some(&(unit, index)) = self.managed.get(fqn) {
            return Ok(ParamSlot::Managed { unit, index });
        }
        self.tree
            .find_parameter(fqn)
            .map(|(module, index)| ParamSlot::Unmanaged { module, index })
            .ok_or_else(|| DistError::Configuration(format!("unknown parameter {fqn}")))
    }

    pub(crate) fn unit_handle(&self, unit: usize) -> &FlatParamHandle {
        &self.units[unit].handle
    }

    pub(crate) fn unit_handle_mut(&mut self, unit: usize) -> &mut FlatParamHandle {
        &mut self.units[unit].handle
    }

    pub(crate) fn unmanaged_param(&self, module: ModuleId, index: usize) -> Result<&Parameter> {
        self.tree
            .parameters(module)?
            .get(index)
            .ok_or_else(|| DistError::Configuration(format!("no parameter at index {index}")))
    }

    pub(crate) fn unmanaged_param_mut(&mut self, module: ModuleId, index: usize) -> Result<&mut Parameter> {
        self.tree
            .parameters_mut(module)?
            .get_mut(index)
            .ok_or_else(|| DistError::Configuration(format!("no parameter at index {index}")))
    }

    pub(crate) fn tree_mut(&mut self) -> &mut ModuleTree {
        &mut self.tree
    }
}

impl std::fmt::Debug for FsdpModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsdpModel")
            .field("mesh", &self.mesh)
            .field("units", &self.units.iter().map(|u| &u.name).collect::<Vec<_>>())
            .field("initialized", &self.initialized)
            .finish()
    }
}

/// Forward pass in progress.
pub struct ForwardContext<'a> {
    model: &'a mut FsdpModel,
}

impl ForwardContext<'_> {
    /// Runs nested unit `module`: gathers its parameters, calls `f` and
    /// reshards according to the unit's policy.
    pub fn call<I, R, F>(&mut self, module: ModuleId, input: I, f: F) -> Result<R>
    where
        I: TensorTree,
        R: TensorTree,
        F: FnOnce(&mut ForwardContext<'_>, &ParamViews, I) -> Result<R>,
    {
        let unit = self.model.unit_index(module)?;
        let input = self.model.pre_forward(unit, input)?;
        let views = self.model.param_views(unit)?;
        let output = f(self, &views, input)?;
        self.model.post_forward(unit, output)
    }

    /// The model being run.
    pub fn model(&self) -> &FsdpModel {
        self.model
    }
}

/// Backward pass in progress.
pub struct BackwardContext<'a> {
    model: &'a mut FsdpModel,
}

impl BackwardContext<'_> {
    /// Runs the gradient computation of unit `module`: gathers its
    /// parameters again if needed, calls `f` and hands the accumulated
    /// gradients to reduction.
    ///
    /// Units must be called in reverse forward order.
    pub fn call<G, R, F>(&mut self, module: ModuleId, grad_output: G, f: F) -> Result<R>
    where
        F: FnOnce(&ParamViews, &mut GradSink<'_>, G) -> Result<R>,
    {
        let unit = self.model.unit_index(module)?;
        self.model.pre_backward(unit)?;
        let views = self.model.param_views(unit)?;

        let FsdpModel { units, tree, .. } = &mut *self.model;
        let mut sink = GradSink {
            prefix: views.prefix.clone(),
            unit: &mut units[unit],
            tree,
        };
        let output = f(&views, &mut sink, grad_output)?;

        self.model.post_backward(unit)?;
        Ok(output)
    }

    /// The model being run.
    pub fn model(&self) -> &FsdpModel {
        self.model
    }
}

/// Receives the gradients a unit's backward closure computes.
pub struct GradSink<'a> {
    prefix: String,
    unit: &'a mut FsdpUnit,
    tree: &'a mut ModuleTree,
}

impl GradSink<'_> {
    /// Adds `grad` to the gradient of parameter `name`, relative to the
    /// unit's module or fully qualified.
    pub fn accumulate(&mut self, name: &str, grad: &Tensor) -> Result<()> {
        let qualified = ModuleTree::join(&self.prefix, name);
        for candidate in [qualified.as_str(), name] {
            if let Some(index) = self.unit.handle.index_of(candidate) {
                return self.unit.handle.accumulate_grad(index, grad);
            }
            if let Some((_, module, index)) =
                self.unit.unmanaged.iter().find(|(fqn, _, _)| fqn == candidate)
            {
                let param = &mut self.tree.parameters_mut(*module)?[*index];
                param.grad = Some(match param.grad.take() {
                    Some(acc) => acc.add(grad)?,
                    None => grad.clone(),
                });
                return Ok(());
            }
        }
        Err(DistError::Configuration(format!(
            "unit {:?} has no parameter {name}",
            self.unit.name
        )))
    }
}
