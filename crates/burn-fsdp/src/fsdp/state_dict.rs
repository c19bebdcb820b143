use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use super::{FsdpModel, ModuleTree, ParamSlot};
use crate::optim::{Optimizer, ParamState};
use crate::sharding::{Placement, concat};
use crate::{DistError, Result};

/// One tensor of a checkpoint.
#[derive(Clone, Debug)]
pub enum StateDictEntry {
    /// The full tensor.
    Full(Tensor),
    /// This rank's shard of a tensor.
    Sharded {
        /// Local shard.
        local: Tensor,
        /// Shape of the full tensor.
        global_shape: Vec<usize>,
        /// Position of the shard inside the full tensor.
        global_offset: Vec<usize>,
        /// Placements the shard was taken with.
        placements: Vec<Placement>,
    },
}

impl StateDictEntry {
    /// Shape of the full tensor.
    pub fn global_shape(&self) -> &[usize] {
        match self {
            StateDictEntry::Full(tensor) => tensor.dims(),
            StateDictEntry::Sharded { global_shape, .. } => global_shape,
        }
    }

    fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(match self {
            StateDictEntry::Full(tensor) => StateDictEntry::Full(tensor.to_device(device)?),
            StateDictEntry::Sharded {
                local,
                global_shape,
                global_offset,
                placements,
            } => StateDictEntry::Sharded {
                local: local.to_device(device)?,
                global_shape: global_shape.clone(),
                global_offset: global_offset.clone(),
                placements: placements.clone(),
            },
        })
    }
}

/// Tensors keyed by fully qualified name.
#[derive(Clone, Debug, Default)]
pub struct StateDict {
    /// Entries in name order.
    pub entries: BTreeMap<String, StateDictEntry>,
}

impl StateDict {
    /// Entry called `name`.
    pub fn get(&self, name: &str) -> Option<&StateDictEntry> {
        self.entries.get(name)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there is no entry.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes the state dict as JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let record = entries_to_record(&self.entries)?;
        fs::write(path, serde_json::to_string(&record)?)?;
        Ok(())
    }

    /// Reads a state dict written by [`StateDict::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let record: BTreeMap<String, EntryRecord> = serde_json::from_str(&fs::read_to_string(path)?)?;
        Ok(Self {
            entries: entries_from_record(record)?,
        })
    }

    /// Merges the sharded state dicts of every rank into full tensors.
    pub fn consolidate(parts: &[StateDict]) -> Result<StateDict> {
        let mut names: Vec<&String> = parts.iter().flat_map(|p| p.entries.keys()).collect();
        names.sort();
        names.dedup();

        let mut entries = BTreeMap::new();
        for name in names {
            let shards: Vec<&StateDictEntry> = parts.iter().filter_map(|p| p.entries.get(name)).collect();
            entries.insert(name.clone(), StateDictEntry::Full(consolidate_entry(name, &shards)?));
        }
        Ok(StateDict { entries })
    }
}

fn consolidate_entry(name: &str, shards: &[&StateDictEntry]) -> Result<Tensor> {
    if let Some(StateDictEntry::Full(tensor)) = shards.first() {
        return Ok(tensor.clone());
    }

    let mut pieces: Vec<(usize, &Tensor)> = Vec::new();
    let mut global = None;
    for shard in shards {
        let StateDictEntry::Sharded {
            local,
            global_shape,
            global_offset,
            ..
        } = shard
        else {
            return Err(DistError::Configuration(format!(
                "{name} is stored both full and sharded"
            )));
        };
        if global_offset.iter().skip(1).any(|&o| o != 0) {
            return Err(DistError::NotImplemented(format!(
                "consolidating {name} sharded beyond dim 0 at offset {global_offset:?}"
            )));
        }
        global.get_or_insert_with(|| global_shape.clone());
        // Replicas hold the same rows; keep one copy per offset.
        if local.dims()[0] > 0 && !pieces.iter().any(|(o, _)| *o == global_offset[0]) {
            pieces.push((global_offset[0], local));
        }
    }
    let global_shape = global.ok_or_else(|| {
        DistError::Configuration(format!("no shard of {name} to consolidate"))
    })?;
    pieces.sort_by_key(|(offset, _)| *offset);

    let mut next_row = 0;
    for (offset, local) in &pieces {
        if *offset != next_row {
            return Err(DistError::Configuration(format!(
                "shards of {name} do not cover rows {next_row}..{offset}"
            )));
        }
        next_row += local.dims()[0];
    }
    if next_row != global_shape[0] {
        return Err(DistError::Configuration(format!(
            "shards of {name} cover {next_row} of {} rows",
            global_shape[0]
        )));
    }
    match pieces.first() {
        Some((_, first)) => {
            let parts: Vec<Tensor> = pieces.iter().map(|(_, t)| (*t).clone()).collect();
            let full = concat(&parts, 0)?;
            Ok(full.to_dtype(first.dtype())?)
        }
        None => Ok(Tensor::zeros(global_shape, DType::F32, &Device::Cpu)?),
    }
}

#[derive(Serialize, Deserialize)]
struct TensorRecord {
    shape: Vec<usize>,
    dtype: String,
    data: Vec<f64>,
}

impl TensorRecord {
    fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let dtype = match tensor.dtype() {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::U8 => "u8",
            DType::U32 => "u32",
            DType::I64 => "i64",
        };
        Ok(Self {
            shape: tensor.dims().to_vec(),
            dtype: dtype.to_string(),
            data: tensor
                .to_device(&Device::Cpu)?
                .to_dtype(DType::F64)?
                .flatten_all()?
                .to_vec1::<f64>()?,
        })
    }

    fn into_tensor(self) -> Result<Tensor> {
        let dtype = match self.dtype.as_str() {
            "f16" => DType::F16,
            "bf16" => DType::BF16,
            "f32" => DType::F32,
            "f64" => DType::F64,
            "u8" => DType::U8,
            "u32" => DType::U32,
            "i64" => DType::I64,
            other => {
                return Err(DistError::Configuration(format!("unknown dtype {other} in checkpoint")));
            }
        };
        Ok(Tensor::from_vec(self.data, self.shape, &Device::Cpu)?.to_dtype(dtype)?)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum EntryRecord {
    Full {
        tensor: TensorRecord,
    },
    Sharded {
        local: TensorRecord,
        global_shape: Vec<usize>,
        global_offset: Vec<usize>,
        placements: Vec<Placement>,
    },
}

fn entries_to_record(
    entries: &BTreeMap<String, StateDictEntry>,
) -> Result<BTreeMap<String, EntryRecord>> {
    entries
        .iter()
        .map(|(name, entry)| {
            let record = match entry {
                StateDictEntry::Full(tensor) => EntryRecord::Full {
                    tensor: TensorRecord::from_tensor(tensor)?,
                },
                StateDictEntry::Sharded {
                    local,
                    global_shape,
                    global_offset,
                    placements,
                } => EntryRecord::Sharded {
                    local: TensorRecord::from_tensor(local)?,
                    global_shape: global_shape.clone(),
                    global_offset: global_offset.clone(),
                    placements: placements.clone(),
                },
            };
            Ok((name.clone(), record))
        })
        .collect()
}

fn entries_from_record(
    record: BTreeMap<String, EntryRecord>,
) -> Result<BTreeMap<String, StateDictEntry>> {
    record
        .into_iter()
        .map(|(name, entry)| {
            let entry = match entry {
                EntryRecord::Full { tensor } => StateDictEntry::Full(tensor.into_tensor()?),
                EntryRecord::Sharded {
                    local,
                    global_shape,
                    global_offset,
                    placements,
                } => StateDictEntry::Sharded {
                    local: local.into_tensor()?,
                    global_shape,
                    global_offset,
                    placements,
                },
            };
            Ok((name, entry))
        })
        .collect()
}

/// How state dicts are produced and consumed.
#[derive(Clone, Copy, Debug)]
pub struct StateDictOptions {
    /// Gather full tensors instead of keeping local shards. Collective.
    pub full_state_dict: bool,
    /// Move every tensor to the CPU.
    pub cpu_offload: bool,
    /// Fail on missing or unexpected keys when loading.
    pub strict: bool,
}

impl Default for StateDictOptions {
    fn default() -> Self {
        Self {
            full_state_dict: false,
            cpu_offload: false,
            strict: true,
        }
    }
}

fn entry_for(
    model: &FsdpModel,
    slot: ParamSlot,
    local: &Tensor,
    options: StateDictOptions,
) -> Result<StateDictEntry> {
    let entry = match slot {
        ParamSlot::Managed { unit, index } => {
            let handle = model.unit_handle(unit);
            match options.full_state_dict {
                true => StateDictEntry::Full(handle.gather_param(index, local)?),
                false => StateDictEntry::Sharded {
                    local: local.clone(),
                    global_shape: handle.params()[index].shape.clone(),
                    global_offset: handle.global_offset(index)?,
                    placements: handle.groups().placements.clone(),
                },
            }
        }
        ParamSlot::Unmanaged { .. } => StateDictEntry::Full(local.clone()),
    };
    match options.cpu_offload {
        true => entry.to_device(&Device::Cpu),
        false => Ok(entry),
    }
}

fn local_from_entry(model: &FsdpModel, fqn: &str, slot: ParamSlot, entry: &StateDictEntry) -> Result<Tensor> {
    match (slot, entry) {
        (ParamSlot::Managed { unit, index }, StateDictEntry::Full(full)) => {
            model.unit_handle(unit).shard_of(index, full)
        }
        (
            ParamSlot::Managed { unit, index },
            StateDictEntry::Sharded {
                local,
                global_shape,
                global_offset,
                ..
            },
        ) => {
            let handle = model.unit_handle(unit);
            let info = &handle.params()[index];
            if *global_shape != info.shape
                || *global_offset != handle.global_offset(index)?
                || local.dims() != info.local_shape().as_slice()
            {
                return Err(DistError::Configuration(format!(
                    "{fqn} was saved with a different sharding, consolidate the state dict first"
                )));
            }
            Ok(local.clone())
        }
        (ParamSlot::Unmanaged { .. }, StateDictEntry::Full(full)) => Ok(full.clone()),
        (ParamSlot::Unmanaged { .. }, StateDictEntry::Sharded { .. }) => Err(
            DistError::Configuration(format!("{fqn} is not sharded but its entry is")),
        ),
    }
}

fn current_local(model: &FsdpModel, slot: ParamSlot) -> Result<Tensor> {
    match slot {
        ParamSlot::Managed { unit, index } => model.unit_handle(unit).param_local(index),
        ParamSlot::Unmanaged { module, index } => Ok(model.unmanaged_param(module, index)?.data.clone()),
    }
}

fn named_buffers(tree: &ModuleTree) -> Result<Vec<(String, crate::fsdp::ModuleId, String, Tensor)>> {
    let mut buffers = Vec::new();
    for (prefix, module) in tree.named_modules()? {
        for (name, data) in tree.buffers(module)? {
            buffers.push((ModuleTree::join(&prefix, name), module, name.clone(), data.clone()));
        }
    }
    Ok(buffers)
}

/// Parameters and buffers of `model`, keyed by fully qualified name.
pub fn get_model_state_dict(model: &FsdpModel, options: StateDictOptions) -> Result<StateDict> {
    let mut entries = BTreeMap::new();
    for fqn in model.param_order() {
        let slot = model.slot(fqn)?;
        let local = current_local(model, slot)?;
        entries.insert(fqn.clone(), entry_for(model, slot, &local, options)?);
    }
    for (fqn, _, _, data) in named_buffers(model.tree())? {
        let entry = StateDictEntry::Full(data);
        let entry = match options.cpu_offload {
            true => entry.to_device(&Device::Cpu)?,
            false => entry,
        };
        entries.insert(fqn, entry);
    }
    Ok(StateDict { entries })
}

/// Loads parameters and buffers from `state_dict`.
///
/// Full entries are sliced to this rank's rows; sharded entries must match
/// the current sharding.
pub fn set_model_state_dict(
    model: &mut FsdpModel,
    state_dict: &StateDict,
    options: StateDictOptions,
) -> Result<()> {
    let mut expected = Vec::new();
    for fqn in model.param_order().to_vec() {
        expected.push(fqn.clone());
        let Some(entry) = state_dict.get(&fqn) else {
            if options.strict {
                return Err(DistError::Configuration(format!("missing key {fqn} in state dict")));
            }
            continue;
        };
        let slot = model.slot(&fqn)?;
        let local = local_from_entry(model, &fqn, slot, entry)?;
        match slot {
            ParamSlot::Managed { unit, index } => {
                model.unit_handle_mut(unit).set_param_local(index, &local)?
            }
            ParamSlot::Unmanaged { module, index } => {
                let param = model.unmanaged_param_mut(module, index)?;
                if param.data.dims() != local.dims() {
                    return Err(DistError::Configuration(format!(
                        "{fqn} has shape {:?} but the state dict holds {:?}",
                        param.data.dims(),
                        local.dims()
                    )));
                }
                param.data = local.to_dtype(param.data.dtype())?.to_device(param.data.device())?;
            }
        }
    }

    for (fqn, module, name, current) in named_buffers(model.tree())? {
        expected.push(fqn.clone());
        match state_dict.get(&fqn) {
            Some(StateDictEntry::Full(value)) => {
                let value = value.to_dtype(current.dtype())?.to_device(current.device())?;
                model.tree_mut().set_buffer(module, &name, value)?;
            }
            Some(StateDictEntry::Sharded { .. }) => {
                return Err(DistError::Configuration(format!("buffer {fqn} cannot be sharded")));
            }
            None if options.strict => {
                return Err(DistError::Configuration(format!("missing key {fqn} in state dict")));
            }
            None => {}
        }
    }

    if options.strict {
        if let Some(unexpected) = state_dict.entries.keys().find(|k| !expected.contains(k)) {
            return Err(DistError::Configuration(format!("unexpected key {unexpected} in state dict")));
        }
    }
    Ok(())
}

/// Per-parameter optimizer state of a checkpoint.
#[derive(Clone, Debug, Default)]
pub struct OptimizerStateEntry {
    /// Number of steps taken.
    pub step: u64,
    /// State tensors, shaped like the parameter.
    pub tensors: BTreeMap<String, StateDictEntry>,
}

/// Optimizer state keyed by parameter fully qualified name.
#[derive(Clone, Debug, Default)]
pub struct OptimizerStateDict {
    /// Entries in name order.
    pub state: BTreeMap<String, OptimizerStateEntry>,
}

#[derive(Serialize, Deserialize)]
struct OptimizerEntryRecord {
    step: u64,
    tensors: BTreeMap<String, EntryRecord>,
}

impl OptimizerStateDict {
    /// Writes the state dict as JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let record = self
            .state
            .iter()
            .map(|(name, entry)| {
                Ok((
                    name.clone(),
                    OptimizerEntryRecord {
                        step: entry.step,
                        tensors: entries_to_record(&entry.tensors)?,
                    },
                ))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        fs::write(path, serde_json::to_string(&record)?)?;
        Ok(())
    }

    /// Reads a state dict written by [`OptimizerStateDict::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let record: BTreeMap<String, OptimizerEntryRecord> =
            serde_json::from_str(&fs::read_to_string(path)?)?;
        let state = record
            .into_iter()
            .map(|(name, entry)| {
                Ok((
                    name,
                    OptimizerStateEntry {
                        step: entry.step,
                        tensors: entries_from_record(entry.tensors)?,
                    },
                ))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self { state })
    }

    /// Merges the sharded optimizer state of every rank into full tensors.
    pub fn consolidate(parts: &[OptimizerStateDict]) -> Result<OptimizerStateDict> {
        let mut state = BTreeMap::new();
        let names: std::collections::BTreeSet<&String> =
            parts.iter().flat_map(|p| p.state.keys()).collect();
        for name in names {
            let entries: Vec<&OptimizerStateEntry> =
                parts.iter().filter_map(|p| p.state.get(name)).collect();
            let step = entries.iter().map(|e| e.step).max().unwrap_or(0);
            let tensors = StateDict::consolidate(
                &entries
                    .iter()
                    .map(|e| StateDict {
                        entries: e.tensors.clone(),
                    })
                    .collect::<Vec<_>>(),
            )?;
            state.insert(
                name.clone(),
                OptimizerStateEntry {
                    step,
                    tensors: tensors.entries,
                },
            );
        }
        Ok(OptimizerStateDict { state })
    }
}

/// Optimizer state of `optim`, keyed by parameter fully qualified name.
///
/// Collective with `full_state_dict`: every rank must hold state for the same
/// parameters.
pub fn get_optimizer_state_dict(
    model: &FsdpModel,
    optim: &dyn Optimizer,
    options: StateDictOptions,
) -> Result<OptimizerStateDict> {
    let mut state = BTreeMap::new();
    for (fqn, param_state) in optim.state() {
        let slot = model.slot(fqn)?;
        let mut tensors = BTreeMap::new();
        for (name, local) in &param_state.tensors {
            tensors.insert(name.clone(), entry_for(model, slot, local, options)?);
        }
        state.insert(
            fqn.clone(),
            OptimizerStateEntry {
                step: param_state.step,
                tensors,
            },
        );
    }
    Ok(OptimizerStateDict { state })
}

/// Loads optimizer state for the current sharding of `model`.
pub fn set_optimizer_state_dict(
    model: &FsdpModel,
    optim: &mut dyn Optimizer,
    state_dict: &OptimizerStateDict,
) -> Result<()> {
    let mut state = BTreeMap::new();
    for (fqn, entry) in &state_dict.state {
        let slot = model.slot(fqn)?;
        let mut tensors = BTreeMap::new();
        for (name, value) in &entry.tensors {
            tensors.insert(name.clone(), local_from_entry(model, fqn, slot, value)?);
        }
        state.insert(
            fqn.clone(),
            ParamState {
                step: entry.step,
                tensors,
            },
        );
    }
    optim.load_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sharded(rows: std::ops::Range<u32>, offset: usize) -> StateDictEntry {
        let values: Vec<f32> = rows.flat_map(|r| [r as f32, r as f32 + 0.5]).collect();
        let len = values.len() / 2;
        StateDictEntry::Sharded {
            local: Tensor::from_vec(values, (len, 2), &Device::Cpu).unwrap(),
            global_shape: vec![5, 2],
            global_offset: vec![offset, 0],
            placements: vec![Placement::Shard(0)],
        }
    }

    fn dict(entry: StateDictEntry) -> StateDict {
        StateDict {
            entries: BTreeMap::from([("w".to_string(), entry)]),
        }
    }

    #[test]
    fn test_consolidate_orders_and_dedups_shards() {
        let parts = vec![dict(sharded(3..5, 3)), dict(sharded(0..3, 0)), dict(sharded(3..5, 3))];

        let full = StateDict::consolidate(&parts).unwrap();

        let StateDictEntry::Full(tensor) = full.get("w").unwrap() else {
            panic!("expected a full entry");
        };
        let rows: Vec<f32> = tensor.to_vec2::<f32>().unwrap().into_iter().map(|r| r[0]).collect();
        assert_eq!(rows, vec![0., 1., 2., 3., 4.]);
    }

    #[test]
    fn test_consolidate_detects_missing_rows() {
        let parts = vec![dict(sharded(0..3, 0))];

        assert!(matches!(
            StateDict::consolidate(&parts),
            Err(DistError::Configuration(_))
        ));
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let mut state_dict = dict(sharded(0..3, 0));
        state_dict.entries.insert(
            "b".to_string(),
            StateDictEntry::Full(Tensor::new(&[1.5f64, -2.0], &Device::Cpu).unwrap()),
        );

        state_dict.save(&path).unwrap();
        let loaded = StateDict::load(&path).unwrap();

        let Some(StateDictEntry::Full(bias)) = loaded.get("b") else {
            panic!("expected a full entry");
        };
        assert_eq!(bias.dtype(), DType::F64);
        assert_eq!(bias.to_vec1::<f64>().unwrap(), vec![1.5, -2.0]);
        let Some(StateDictEntry::Sharded {
            local, global_offset, placements, ..
        }) = loaded.get("w")
        else {
            panic!("expected a sharded entry");
        };
        assert_eq!(local.dims(), &[3, 2]);
        assert_eq!(global_offset, &vec![0, 0]);
        assert_eq!(placements, &vec![Placement::Shard(0)]);
    }
}
