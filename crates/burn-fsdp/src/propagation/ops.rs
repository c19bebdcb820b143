//! Built-in sharding strategies, rules and shape functions.

use std::sync::Arc;

use super::{
    ArgSchema, OpSchema, OpStrategy, OutputMeta, OutputSharding, PlacementStrategy,
    RuntimeSchemaInfo, ShardingPropagator, StrategySchema, StrategyType, TupleStrategy,
};
use super::propagator::common_mesh;
use crate::sharding::{DTensorSpec, DeviceMesh, Placement, TensorMeta};
use crate::{DistError, Result};

/// `aten.add.Tensor`
pub const ADD: &str = "aten.add.Tensor";
/// `aten.mul.Tensor`
pub const MUL: &str = "aten.mul.Tensor";
/// `aten.sub.Tensor`
pub const SUB: &str = "aten.sub.Tensor";
/// `aten.mm.default`
pub const MM: &str = "aten.mm.default";
/// `aten.t.default`
pub const T: &str = "aten.t.default";
/// `aten.sum.dim_IntList`
pub const SUM_DIM: &str = "aten.sum.dim_IntList";
/// `aten.split.Tensor`
pub const SPLIT: &str = "aten.split.Tensor";
/// `aten.cat.default`
pub const CAT: &str = "aten.cat.default";
/// `aten._foreach_mul.Scalar`
pub const FOREACH_MUL_SCALAR: &str = "aten._foreach_mul.Scalar";
/// `aten.view.default`
pub const VIEW: &str = "aten.view.default";

/// Elementwise binary operators.
pub const POINTWISE_OPS: [&str; 3] = [ADD, MUL, SUB];

/// Fixed cost of one collective, in the unit of one GB moved.
const COLLECTIVE_LATENCY: f64 = 1.0;

/// Registers the built-in strategies, rules and metas.
pub fn register_default_ops(propagator: &mut ShardingPropagator) {
    for op in POINTWISE_OPS {
        propagator.register_op_strategy(op.into(), Arc::new(pointwise_strategy), None);
        propagator.register_meta(op.into(), Arc::new(pointwise_meta));
    }

    propagator.register_op_strategy(MM.into(), Arc::new(mm_strategy), None);
    propagator.register_meta(MM.into(), Arc::new(mm_meta));

    propagator.register_op_strategy(T.into(), Arc::new(transpose_strategy), None);
    propagator.register_meta(T.into(), Arc::new(transpose_meta));

    let static_after_tensor = Some(RuntimeSchemaInfo::new(1, false));

    propagator.register_op_strategy(SUM_DIM.into(), Arc::new(sum_strategy), static_after_tensor.clone());
    propagator.register_meta(SUM_DIM.into(), Arc::new(sum_meta));

    propagator.register_op_strategy(SPLIT.into(), Arc::new(split_strategy), static_after_tensor.clone());
    propagator.register_meta(SPLIT.into(), Arc::new(split_meta));

    propagator.register_op_strategy(CAT.into(), Arc::new(cat_strategy), static_after_tensor.clone());
    propagator.register_meta(CAT.into(), Arc::new(cat_meta));

    propagator.register_op_strategy(
        FOREACH_MUL_SCALAR.into(),
        Arc::new(foreach_strategy),
        static_after_tensor.clone(),
    );
    propagator.register_meta(FOREACH_MUL_SCALAR.into(), Arc::new(foreach_meta));

    propagator.register_sharding_prop_rule(VIEW.into(), Arc::new(view_rule), static_after_tensor);
    propagator.register_meta(VIEW.into(), Arc::new(view_meta));

    for op in super::SKIP_PROPAGATION_OPS {
        propagator.register_meta(op.into(), Arc::new(|_: &OpSchema| -> Result<OutputMeta> { Ok(OutputMeta::None) }));
    }
}

/// Estimated cost of redistributing `current` to `target`.
///
/// Zero when nothing changes. Every mesh dimension that has to communicate
/// adds a fixed latency plus the gigabytes it moves: an all-gather moves
/// `(n - 1) / n` of the tensor, a shard-to-shard all-to-all `1 / n`. Cutting
/// a replicated tensor is free.
pub fn redistribute_cost(current: &DTensorSpec, target: &[Placement]) -> f64 {
    if current.placements() == target {
        return 0.0;
    }
    let gigabytes = current
        .tensor_meta()
        .map(|meta| (meta.numel() * meta.dtype.size_in_bytes()) as f64 / 1e9)
        .unwrap_or(0.0);

    let mut cost = 0.0;
    for (mesh_dim, (from, to)) in current.placements().iter().zip(target).enumerate() {
        if from == to {
            continue;
        }
        let n = current.mesh().size(mesh_dim) as f64;
        match (from.is_shard(), to.is_shard()) {
            (true, false) => cost += COLLECTIVE_LATENCY + gigabytes * (n - 1.0) / n,
            (true, true) => cost += COLLECTIVE_LATENCY + gigabytes / n,
            (false, _) => {}
        }
    }
    cost
}

fn failed(op: impl ToString, reason: impl Into<String>) -> DistError {
    DistError::PropagationFailed {
        op: op.to_string(),
        reason: reason.into(),
    }
}

fn normalize_dim(op: &impl ToString, dim: i64, ndim: usize) -> Result<usize> {
    let ndim_i = ndim as i64;
    let normalized = if dim < 0 { dim + ndim_i } else { dim };
    if normalized < 0 || normalized >= ndim_i.max(1) {
        return Err(failed(op.to_string(), format!("dimension {dim} out of range for {ndim} dims")));
    }
    Ok(normalized as usize)
}

fn with_shard_dim(placement: Placement, dim: usize) -> Placement {
    match placement {
        Placement::Replicate => Placement::Replicate,
        Placement::Shard(_) => Placement::Shard(dim),
        Placement::StridedShard { split_factor, .. } => Placement::StridedShard { dim, split_factor },
    }
}

fn replicate_dims(placements: &[Placement], dims: &[usize]) -> Vec<Placement> {
    placements
        .iter()
        .map(|p| match p.shard_dim() {
            Some(dim) if dims.contains(&dim) => Placement::Replicate,
            _ => *p,
        })
        .collect()
}

fn push_unique(candidates: &mut Vec<Vec<Placement>>, placements: Vec<Placement>) {
    if !candidates.contains(&placements) {
        candidates.push(placements);
    }
}

/// Current specs of the tensor inputs, in order.
fn tensor_inputs(schema: &StrategySchema) -> Result<Vec<&DTensorSpec>> {
    schema
        .args
        .iter()
        .filter_map(|arg| arg.as_op_strategy())
        .map(|strategy| {
            strategy
                .output_spec()
                .ok_or_else(|| failed(&schema.op, "input has no strategy"))
        })
        .collect()
}

/// Current specs of the elements of the tensor-list argument `index`.
fn list_inputs(schema: &StrategySchema, index: usize) -> Result<Vec<&DTensorSpec>> {
    let tuple = schema
        .args
        .get(index)
        .and_then(|arg| arg.as_tuple_strategy())
        .ok_or_else(|| failed(&schema.op, format!("argument {index} is not a tensor list")))?;
    tuple
        .children
        .iter()
        .map(|child| match child {
            StrategyType::Op(strategy) => strategy
                .output_spec()
                .ok_or_else(|| failed(&schema.op, "list element has no strategy")),
            StrategyType::Tuple(_) => Err(failed(&schema.op, "nested tensor lists")),
        })
        .collect()
}

/// A candidate that redistributes input `i` to `input_placements[i]`.
fn candidate(
    mesh: &Arc<DeviceMesh>,
    output_placements: Vec<Placement>,
    inputs: &[&DTensorSpec],
    input_placements: &[Vec<Placement>],
) -> Result<PlacementStrategy> {
    let output_spec = DTensorSpec::new(mesh.clone(), output_placements, None)?;
    let mut input_specs = Vec::with_capacity(inputs.len());
    let mut costs = Vec::with_capacity(inputs.len());
    for (spec, placements) in inputs.iter().zip(input_placements) {
        costs.push(vec![redistribute_cost(spec, placements)]);
        input_specs.push(spec.with_placements(placements.clone())?);
    }
    Ok(PlacementStrategy::new(output_spec, Some(input_specs), Some(costs)))
}

fn pointwise_strategy(_mesh: &DeviceMesh, schema: &StrategySchema) -> Result<StrategyType> {
    let inputs = tensor_inputs(schema)?;
    let mesh = common_mesh(&schema.op, &inputs)?;

    let mut candidates = Vec::new();
    for spec in &inputs {
        push_unique(&mut candidates, spec.placements().to_vec());
    }
    push_unique(&mut candidates, vec![Placement::Replicate; mesh.ndim()]);

    let strategies = candidates
        .into_iter()
        .map(|placements| {
            let per_input = vec![placements.clone(); inputs.len()];
            candidate(mesh, placements, &inputs, &per_input)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(StrategyType::Op(OpStrategy::new(strategies)))
}

fn mm_strategy(_mesh: &DeviceMesh, schema: &StrategySchema) -> Result<StrategyType> {
    // (lhs, rhs, out) per mesh dimension; partial sums are not modeled.
    const CHOICES: [[Placement; 3]; 3] = [
        [Placement::Replicate, Placement::Replicate, Placement::Replicate],
        [Placement::Shard(0), Placement::Replicate, Placement::Shard(0)],
        [Placement::Replicate, Placement::Shard(1), Placement::Shard(1)],
    ];

    let inputs = tensor_inputs(schema)?;
    if inputs.len() != 2 {
        return Err(failed(&schema.op, format!("expected 2 tensors, got {}", inputs.len())));
    }
    let mesh = common_mesh(&schema.op, &inputs)?;
    let ndim = mesh.ndim();

    let mut strategies = Vec::new();
    for combo in 0..3usize.pow(ndim as u32) {
        let mut lhs = Vec::with_capacity(ndim);
        let mut rhs = Vec::with_capacity(ndim);
        let mut out = Vec::with_capacity(ndim);
        let mut digits = combo;
        for _ in 0..ndim {
            let [l, r, o] = CHOICES[digits % 3];
            digits /= 3;
            lhs.push(l);
            rhs.push(r);
            out.push(o);
        }
        strategies.push(candidate(mesh, out, &inputs, &[lhs, rhs])?);
    }
    Ok(StrategyType::Op(OpStrategy::new(strategies)))
}

fn transpose_strategy(_mesh: &DeviceMesh, schema: &StrategySchema) -> Result<StrategyType> {
    let input = *tensor_inputs(schema)?
        .first()
        .ok_or_else(|| failed(&schema.op, "missing input"))?;
    let swap = input.ndim()? == 2;
    let output = input
        .placements()
        .iter()
        .map(|p| match p.shard_dim() {
            Some(dim) if swap && dim < 2 => with_shard_dim(*p, 1 - dim),
            _ => *p,
        })
        .collect();
    let strategy = candidate(input.mesh(), output, &[input], &[input.placements().to_vec()])?;
    Ok(StrategyType::Op(OpStrategy::new(vec![strategy])))
}

/// Reduced dims of `aten.sum.dim_IntList`, every dim when absent or empty.
pub(crate) fn sum_dims(op: &impl ToString, dims: Option<&ArgSchema>, ndim: usize) -> Result<Vec<usize>> {
    match dims.and_then(ArgSchema::as_int_list) {
        Some(list) if !list.is_empty() => {
            list.iter().map(|d| normalize_dim(op, *d, ndim)).collect()
        }
        _ => Ok((0..ndim).collect()),
    }
}

fn sum_strategy(_mesh: &DeviceMesh, schema: &StrategySchema) -> Result<StrategyType> {
    let input = schema
        .op_strategy(0)?
        .output_spec()
        .ok_or_else(|| failed(&schema.op, "missing input"))?;
    let ndim = input.ndim()?;
    let dims = sum_dims(&schema.op, schema.value(1), ndim)?;
    let keepdim = schema.value(2).and_then(ArgSchema::as_bool).unwrap_or(false);

    let input_placements = replicate_dims(input.placements(), &dims);
    let output = input_placements
        .iter()
        .map(|p| match p.shard_dim() {
            Some(dim) if !keepdim => {
                with_shard_dim(*p, dim - dims.iter().filter(|d| **d < dim).count())
            }
            _ => *p,
        })
        .collect();
    let strategy = candidate(input.mesh(), output, &[input], &[input_placements])?;
    Ok(StrategyType::Op(OpStrategy::new(vec![strategy])))
}

fn split_strategy(_mesh: &DeviceMesh, schema: &StrategySchema) -> Result<StrategyType> {
    let input = schema
        .op_strategy(0)?
        .output_spec()
        .ok_or_else(|| failed(&schema.op, "missing input"))?;
    let dim = normalize_dim(
        &schema.op,
        schema.value(2).and_then(ArgSchema::as_int).unwrap_or(0),
        input.ndim()?,
    )?;
    let placements = replicate_dims(input.placements(), &[dim]);
    let strategy = candidate(input.mesh(), placements.clone(), &[input], &[placements])?;
    Ok(StrategyType::Op(OpStrategy::new(vec![strategy])))
}

fn cat_strategy(_mesh: &DeviceMesh, schema: &StrategySchema) -> Result<StrategyType> {
    let inputs = list_inputs(schema, 0)?;
    let mesh = common_mesh(&schema.op, &inputs)?;
    let ndim = inputs[0].ndim()?;
    let dim = normalize_dim(
        &schema.op,
        schema.value(1).and_then(ArgSchema::as_int).unwrap_or(0),
        ndim,
    )?;

    let mut candidates = Vec::new();
    for spec in &inputs {
        push_unique(&mut candidates, replicate_dims(spec.placements(), &[dim]));
    }
    push_unique(&mut candidates, vec![Placement::Replicate; mesh.ndim()]);

    let strategies = candidates
        .into_iter()
        .map(|placements| {
            let per_input = vec![placements.clone(); inputs.len()];
            candidate(mesh, placements, &inputs, &per_input)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(StrategyType::Op(OpStrategy::new(strategies)))
}

fn foreach_strategy(_mesh: &DeviceMesh, schema: &StrategySchema) -> Result<StrategyType> {
    let children = list_inputs(schema, 0)?
        .into_iter()
        .map(|spec| {
            let placements = spec.placements().to_vec();
            let strategy = candidate(spec.mesh(), placements.clone(), &[spec], &[placements])?;
            Ok(StrategyType::Op(OpStrategy::new(vec![strategy])))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(StrategyType::Tuple(TupleStrategy::new(children)))
}

/// Resolves a view shape, allowing one `-1`.
fn infer_view_shape(op: &impl ToString, numel: usize, shape: &[i64]) -> Result<Vec<usize>> {
    let mut inferred = None;
    let mut known = 1usize;
    for (idx, size) in shape.iter().enumerate() {
        match *size {
            -1 if inferred.is_none() => inferred = Some(idx),
            size if size >= 0 => known *= size as usize,
            _ => return Err(failed(op.to_string(), format!("invalid view shape {shape:?}"))),
        }
    }

    let mut resolved: Vec<usize> = shape.iter().map(|s| (*s).max(0) as usize).collect();
    if let Some(idx) = inferred {
        if known == 0 || numel % known != 0 {
            return Err(failed(op.to_string(), format!("shape {shape:?} is invalid for input of size {numel}")));
        }
        resolved[idx] = numel / known;
    } else if known != numel {
        return Err(failed(op.to_string(), format!("shape {shape:?} is invalid for input of size {numel}")));
    }
    Ok(resolved)
}

/// A shard on dim `d` survives a view only when the sizes up to `d` are unchanged.
fn view_rule(schema: &OpSchema) -> Result<OutputSharding> {
    let input = schema.spec_arg(0)?;
    let old_shape = input.shape()?;
    let shape_arg = schema
        .arg(1)?
        .as_int_list()
        .ok_or_else(|| failed(schema.op(), "argument 1 is not a shape"))?;
    let new_shape = infer_view_shape(schema.op(), input.meta()?.numel(), shape_arg)?;

    let mut placements = input.placements().to_vec();
    let mut needs_reshard = false;
    for placement in placements.iter_mut() {
        if let Some(dim) = placement.shard_dim() {
            let keeps = new_shape.len() > dim && new_shape[..=dim] == old_shape[..=dim];
            if !keeps {
                *placement = Placement::Replicate;
                needs_reshard = true;
            }
        }
    }

    if needs_reshard {
        let suggested = input.with_placements(placements)?;
        return Ok(OutputSharding::suggest(vec![schema.rewrap_with_specs(&[suggested])?]));
    }
    Ok(OutputSharding::single(DTensorSpec::new(input.mesh().clone(), placements, None)?))
}

fn first_meta<'a>(schema: &'a OpSchema) -> Result<&'a TensorMeta> {
    schema.spec_arg(0)?.meta()
}

fn pointwise_meta(schema: &OpSchema) -> Result<OutputMeta> {
    let metas = schema.args_meta()?;
    let first = metas
        .first()
        .ok_or_else(|| failed(schema.op(), "no tensor arguments"))?;
    if let Some(other) = metas.iter().find(|m| m.shape != first.shape) {
        return Err(failed(
            schema.op(),
            format!("broadcasting {:?} with {:?} is not supported", first.shape, other.shape),
        ));
    }
    Ok(OutputMeta::Single(TensorMeta::contiguous(first.shape.clone(), first.dtype)))
}

fn mm_meta(schema: &OpSchema) -> Result<OutputMeta> {
    let metas = schema.args_meta()?;
    match metas.as_slice() {
        [lhs, rhs] if lhs.shape.len() == 2 && rhs.shape.len() == 2 && lhs.shape[1] == rhs.shape[0] => {
            Ok(OutputMeta::Single(TensorMeta::contiguous(vec![lhs.shape[0], rhs.shape[1]], lhs.dtype)))
        }
        _ => Err(failed(
            schema.op(),
            format!(
                "cannot multiply shapes {:?}",
                metas.iter().map(|m| &m.shape).collect::<Vec<_>>()
            ),
        )),
    }
}

fn transpose_meta(schema: &OpSchema) -> Result<OutputMeta> {
    let meta = first_meta(schema)?;
    let shape = match meta.shape.as_slice() {
        [rows, cols] => vec![*cols, *rows],
        [_] | [] => meta.shape.clone(),
        _ => return Err(failed(schema.op(), format!("t() expects <= 2-D tensor, got {:?}", meta.shape))),
    };
    Ok(OutputMeta::Single(TensorMeta::contiguous(shape, meta.dtype)))
}

fn sum_meta(schema: &OpSchema) -> Result<OutputMeta> {
    let meta = first_meta(schema)?;
    let dims = sum_dims(schema.op(), schema.args_schema().get(1), meta.shape.len())?;
    let keepdim = schema
        .args_schema()
        .get(2)
        .and_then(ArgSchema::as_bool)
        .unwrap_or(false);

    let shape = meta
        .shape
        .iter()
        .enumerate()
        .filter_map(|(dim, size)| match (dims.contains(&dim), keepdim) {
            (false, _) => Some(*size),
            (true, true) => Some(1),
            (true, false) => None,
        })
        .collect();
    Ok(OutputMeta::Single(TensorMeta::contiguous(shape, meta.dtype)))
}

/// Sizes of the pieces of `aten.split.Tensor`.
pub(crate) fn split_sizes(schema: &OpSchema, size: usize) -> Result<Vec<usize>> {
    let split_size = schema.int_arg(1)?;
    if split_size <= 0 {
        return Err(failed(schema.op(), format!("split size must be positive, got {split_size}")));
    }
    let split_size = split_size as usize;
    let mut sizes = vec![split_size; size / split_size];
    if size % split_size != 0 || size == 0 {
        sizes.push(size % split_size);
    }
    Ok(sizes)
}

/// Normalized dimension of `aten.split.Tensor`.
pub(crate) fn split_dim(schema: &OpSchema, ndim: usize) -> Result<usize> {
    let dim = schema.args_schema().get(2).and_then(ArgSchema::as_int).unwrap_or(0);
    normalize_dim(schema.op(), dim, ndim)
}

fn split_meta(schema: &OpSchema) -> Result<OutputMeta> {
    let meta = first_meta(schema)?;
    let dim = split_dim(schema, meta.shape.len())?;
    let metas = split_sizes(schema, meta.shape[dim])?
        .into_iter()
        .map(|len| {
            let mut shape = meta.shape.clone();
            shape[dim] = len;
            TensorMeta::contiguous(shape, meta.dtype)
        })
        .collect();
    Ok(OutputMeta::Tuple(metas))
}

/// Normalized dimension of `aten.cat.default`.
pub(crate) fn cat_dim(schema: &OpSchema, ndim: usize) -> Result<usize> {
    let dim = schema.args_schema().get(1).and_then(ArgSchema::as_int).unwrap_or(0);
    normalize_dim(schema.op(), dim, ndim)
}

fn cat_meta(schema: &OpSchema) -> Result<OutputMeta> {
    let metas = schema.args_meta()?;
    let first = metas
        .first()
        .ok_or_else(|| failed(schema.op(), "expected a non-empty list of tensors"))?;
    let dim = cat_dim(schema, first.shape.len())?;

    let mut shape = first.shape.clone();
    shape[dim] = 0;
    for meta in &metas {
        let compatible = meta.shape.len() == shape.len()
            && meta
                .shape
                .iter()
                .zip(&first.shape)
                .enumerate()
                .all(|(d, (a, b))| d == dim || a == b);
        if !compatible {
            return Err(failed(
                schema.op(),
                format!("cannot concatenate {:?} with {:?} on dim {dim}", first.shape, meta.shape),
            ));
        }
        shape[dim] += meta.shape[dim];
    }
    Ok(OutputMeta::Single(TensorMeta::contiguous(shape, first.dtype)))
}

fn foreach_meta(schema: &OpSchema) -> Result<OutputMeta> {
    let metas = schema
        .args_meta()?
        .into_iter()
        .map(|meta| TensorMeta::contiguous(meta.shape.clone(), meta.dtype))
        .collect();
    Ok(OutputMeta::List(metas))
}

fn view_meta(schema: &OpSchema) -> Result<OutputMeta> {
    let meta = first_meta(schema)?;
    let shape_arg = schema
        .arg(1)?
        .as_int_list()
        .ok_or_else(|| failed(schema.op(), "argument 1 is not a shape"))?;
    let shape = infer_view_shape(schema.op(), meta.numel(), shape_arg)?;
    Ok(OutputMeta::Single(TensorMeta::contiguous(shape, meta.dtype)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ThreadedWorld;
    use crate::propagation::{OpInfo, OutputSpec};
    use crate::sharding::DeviceMeshBuilder;
    use candle_core::DType;
    use std::collections::BTreeMap;

    fn mesh_1d(rank: usize) -> Arc<DeviceMesh> {
        let world = ThreadedWorld::new(2);
        Arc::new(
            DeviceMeshBuilder::new(vec![0, 1], [2])
                .build(world.rank(rank).unwrap().factory())
                .unwrap(),
        )
    }

    fn spec(mesh: &Arc<DeviceMesh>, shape: &[usize], placements: &[Placement]) -> DTensorSpec {
        DTensorSpec::new(
            mesh.clone(),
            placements.to_vec(),
            Some(TensorMeta::contiguous(shape.to_vec(), DType::F32)),
        )
        .unwrap()
    }

    fn propagator() -> ShardingPropagator {
        let mut propagator = ShardingPropagator::new();
        register_default_ops(&mut propagator);
        propagator
    }

    fn run(propagator: &ShardingPropagator, op: &str, args: Vec<ArgSchema>) -> OutputSharding {
        let mut info = OpInfo::new(OpSchema::new(op.into(), args, BTreeMap::new()));
        propagator.propagate(&mut info).unwrap();
        info.output_sharding.unwrap()
    }

    fn single(output: &OutputSharding) -> &DTensorSpec {
        match &output.output_spec {
            Some(OutputSpec::Single(spec)) => spec,
            other => panic!("expected a single output, got {other:?}"),
        }
    }

    #[test]
    fn test_redistribute_cost() {
        let mesh = mesh_1d(0);
        let sharded = spec(&mesh, &[4, 4], &[Placement::Shard(0)]);
        let replicated = spec(&mesh, &[4, 4], &[Placement::Replicate]);

        assert_eq!(redistribute_cost(&sharded, &[Placement::Shard(0)]), 0.0);
        assert_eq!(redistribute_cost(&replicated, &[Placement::Shard(1)]), 0.0);
        assert!(redistribute_cost(&sharded, &[Placement::Replicate]) > 1.0);
        assert!(redistribute_cost(&sharded, &[Placement::Shard(1)]) >= 1.0);
    }

    #[test]
    fn test_pointwise_follows_sharded_input() {
        let mesh = mesh_1d(0);
        let a = spec(&mesh, &[4, 2], &[Placement::Shard(0)]);
        let b = spec(&mesh, &[4, 2], &[Placement::Replicate]);

        let out = run(&propagator(), ADD, vec![ArgSchema::Spec(a), ArgSchema::Spec(b)]);

        assert_eq!(single(&out).placements(), &[Placement::Shard(0)]);
        assert_eq!(single(&out).shape().unwrap(), &[4, 2]);
        assert!(out.needs_redistribute);
        let suggestion = &out.schema_suggestions.as_ref().unwrap()[0];
        assert_eq!(suggestion.args_spec()[1].placements(), &[Placement::Shard(0)]);
    }

    #[test]
    fn test_pointwise_rejects_broadcast() {
        let mesh = mesh_1d(0);
        let a = spec(&mesh, &[4, 2], &[Placement::Replicate]);
        let b = spec(&mesh, &[2], &[Placement::Replicate]);
        let mut info = OpInfo::new(OpSchema::new(
            MUL.into(),
            vec![ArgSchema::Spec(a), ArgSchema::Spec(b)],
            BTreeMap::new(),
        ));

        assert!(matches!(
            propagator().propagate(&mut info),
            Err(DistError::PropagationFailed { .. })
        ));
    }

    #[test]
    fn test_mm_row_sharded_lhs() {
        let mesh = mesh_1d(1);
        let a = spec(&mesh, &[6, 4], &[Placement::Shard(0)]);
        let b = spec(&mesh, &[4, 3], &[Placement::Replicate]);

        let out = run(&propagator(), MM, vec![ArgSchema::Spec(a), ArgSchema::Spec(b)]);

        assert_eq!(single(&out).placements(), &[Placement::Shard(0)]);
        assert_eq!(single(&out).shape().unwrap(), &[6, 3]);
        assert!(!out.needs_redistribute);
    }

    #[test]
    fn test_mm_contracting_shard_is_gathered() {
        let mesh = mesh_1d(0);
        let a = spec(&mesh, &[6, 4], &[Placement::Shard(1)]);
        let b = spec(&mesh, &[4, 3], &[Placement::Shard(0)]);

        let out = run(&propagator(), MM, vec![ArgSchema::Spec(a), ArgSchema::Spec(b)]);

        assert!(out.needs_redistribute);
        let suggestion = &out.schema_suggestions.as_ref().unwrap()[0];
        let lhs = suggestion.args_spec()[0].placements().to_vec();
        let rhs = suggestion.args_spec()[1].placements().to_vec();
        assert!(!(lhs[0] == Placement::Shard(1) && rhs[0] == Placement::Shard(0)));
    }

    #[test]
    fn test_transpose_swaps_shard_dim() {
        let mesh = mesh_1d(0);
        let a = spec(&mesh, &[6, 4], &[Placement::Shard(0)]);

        let out = run(&propagator(), T, vec![ArgSchema::Spec(a)]);

        assert_eq!(single(&out).placements(), &[Placement::Shard(1)]);
        assert_eq!(single(&out).shape().unwrap(), &[4, 6]);
    }

    #[test]
    fn test_transpose_keeps_1d_shard() {
        let mesh = mesh_1d(0);
        let a = spec(&mesh, &[4], &[Placement::Shard(0)]);

        let out = run(&propagator(), T, vec![ArgSchema::Spec(a)]);

        assert_eq!(single(&out).placements(), &[Placement::Shard(0)]);
        assert_eq!(single(&out).shape().unwrap(), &[4]);
        assert!(!out.needs_redistribute);
    }

    #[test]
    fn test_sum_replicates_reduced_dim() {
        let mesh = mesh_1d(0);
        let a = spec(&mesh, &[4, 6], &[Placement::Shard(1)]);
        let b = spec(&mesh, &[4, 6], &[Placement::Shard(1)]);
        let propagator = propagator();

        let reduced = run(
            &propagator,
            SUM_DIM,
            vec![ArgSchema::Spec(a), ArgSchema::IntList(vec![1]), ArgSchema::Bool(false)],
        );
        assert_eq!(single(&reduced).placements(), &[Placement::Replicate]);
        assert_eq!(single(&reduced).shape().unwrap(), &[4]);
        assert!(reduced.needs_redistribute);

        let kept = run(
            &propagator,
            SUM_DIM,
            vec![ArgSchema::Spec(b), ArgSchema::IntList(vec![0]), ArgSchema::Bool(false)],
        );
        assert_eq!(single(&kept).placements(), &[Placement::Shard(0)]);
        assert_eq!(single(&kept).shape().unwrap(), &[6]);
    }

    #[test]
    fn test_split_outputs_tuple() {
        let mesh = mesh_1d(0);
        let a = spec(&mesh, &[5, 4], &[Placement::Shard(1)]);

        let out = run(
            &propagator(),
            SPLIT,
            vec![ArgSchema::Spec(a), ArgSchema::Int(2), ArgSchema::Int(0)],
        );

        let Some(OutputSpec::Tuple(specs)) = &out.output_spec else {
            panic!("expected a tuple output");
        };
        let shapes: Vec<_> = specs
            .iter()
            .map(|s| s.as_ref().unwrap().shape().unwrap().to_vec())
            .collect();
        assert_eq!(shapes, vec![vec![2, 4], vec![2, 4], vec![1, 4]]);
        assert!(specs.iter().all(|s| s.as_ref().unwrap().placements() == [Placement::Shard(1)]));
    }

    #[test]
    fn test_cat_replicates_cat_dim() {
        let mesh = mesh_1d(0);
        let a = spec(&mesh, &[2, 4], &[Placement::Shard(0)]);
        let b = spec(&mesh, &[3, 4], &[Placement::Shard(0)]);

        let out = run(
            &propagator(),
            CAT,
            vec![ArgSchema::SpecList(vec![a, b]), ArgSchema::Int(0)],
        );

        assert_eq!(single(&out).placements(), &[Placement::Replicate]);
        assert_eq!(single(&out).shape().unwrap(), &[5, 4]);
        assert!(out.needs_redistribute);
    }

    #[test]
    fn test_foreach_keeps_each_placement() {
        let mesh = mesh_1d(0);
        let a = spec(&mesh, &[2, 4], &[Placement::Shard(0)]);
        let b = spec(&mesh, &[3], &[Placement::Replicate]);

        let out = run(
            &propagator(),
            FOREACH_MUL_SCALAR,
            vec![ArgSchema::SpecList(vec![a, b]), ArgSchema::float(0.5)],
        );

        let Some(OutputSpec::Tuple(specs)) = &out.output_spec else {
            panic!("expected a tuple output");
        };
        assert_eq!(specs[0].as_ref().unwrap().placements(), &[Placement::Shard(0)]);
        assert_eq!(specs[1].as_ref().unwrap().shape().unwrap(), &[3]);
        assert!(!out.needs_redistribute);
    }

    #[test]
    fn test_view_keeps_shard_with_same_prefix() {
        let mesh = mesh_1d(0);
        let a = spec(&mesh, &[4, 6], &[Placement::Shard(0)]);

        let out = run(
            &propagator(),
            VIEW,
            vec![ArgSchema::Spec(a), ArgSchema::IntList(vec![4, 2, -1])],
        );

        assert_eq!(single(&out).placements(), &[Placement::Shard(0)]);
        assert_eq!(single(&out).shape().unwrap(), &[4, 2, 3]);
        assert!(!out.needs_redistribute);
    }

    #[test]
    fn test_view_suggests_replicate_when_prefix_changes() {
        let mesh = mesh_1d(0);
        let a = spec(&mesh, &[4, 6], &[Placement::Shard(1)]);

        let out = run(
            &propagator(),
            VIEW,
            vec![ArgSchema::Spec(a), ArgSchema::IntList(vec![24])],
        );

        assert_eq!(single(&out).placements(), &[Placement::Replicate]);
        assert!(out.needs_redistribute);
        let suggestion = &out.schema_suggestions.as_ref().unwrap()[0];
        assert_eq!(suggestion.args_spec()[0].placements(), &[Placement::Replicate]);
    }

    #[test]
    fn test_infer_view_shape_errors() {
        assert!(infer_view_shape(&"view", 24, &[5, -1]).is_err());
        assert!(infer_view_shape(&"view", 24, &[-1, -1]).is_err());
        assert_eq!(infer_view_shape(&"view", 24, &[2, -1, 3]).unwrap(), vec![2, 4, 3]);
    }
}
