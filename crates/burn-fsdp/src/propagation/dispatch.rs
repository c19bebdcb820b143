use std::collections::BTreeMap;
use std::sync::Arc;

use candle_core::Tensor;
use hashbrown::HashMap;

use super::ops::{self, register_default_ops};
use super::{ArgSchema, OpInfo, OpOverload, OpSchema, OutputSpec, ShardingPropagator};
use crate::sharding::DTensorSpec;
use crate::{DTensor, DistError, Result};

/// Local computation of an operator on the calling rank's shards.
///
/// Receives the local tensors in argument order (lists flattened) and the
/// schema the inputs were redistributed to.
pub type Kernel = Arc<dyn Fn(&[Tensor], &OpSchema, &KernelContext) -> Result<Vec<Tensor>> + Send + Sync>;

/// What a kernel knows about its outputs.
#[derive(Clone, Debug, Default)]
pub struct KernelContext {
    /// Expected local shape of every tensor output.
    pub output_local_shapes: Vec<Vec<usize>>,
}

/// An argument of a dispatched call.
#[derive(Clone, Debug)]
pub enum DArg {
    /// A distributed tensor.
    Tensor(DTensor),
    /// A list of distributed tensors.
    TensorList(Vec<DTensor>),
    /// Any other argument.
    Value(ArgSchema),
}

impl DArg {
    fn to_schema(&self) -> ArgSchema {
        match self {
            DArg::Tensor(tensor) => ArgSchema::Spec(tensor.spec().clone()),
            DArg::TensorList(list) => ArgSchema::SpecList(list.iter().map(|t| t.spec().clone()).collect()),
            DArg::Value(value) => value.clone(),
        }
    }
}

impl From<DTensor> for DArg {
    fn from(tensor: DTensor) -> Self {
        DArg::Tensor(tensor)
    }
}

impl From<ArgSchema> for DArg {
    fn from(value: ArgSchema) -> Self {
        DArg::Value(value)
    }
}

/// Result of a dispatched call.
#[derive(Clone, Debug)]
pub enum DispatchOutput {
    /// No tensor output.
    None,
    /// One tensor.
    Tensor(DTensor),
    /// Several tensors.
    Tuple(Vec<DTensor>),
}

impl DispatchOutput {
    /// The single output tensor.
    pub fn into_tensor(self) -> Result<DTensor> {
        match self {
            DispatchOutput::Tensor(tensor) => Ok(tensor),
            other => Err(DistError::InvalidState(format!("expected one output tensor, got {other:?}"))),
        }
    }

    /// The output tensors.
    pub fn into_tuple(self) -> Result<Vec<DTensor>> {
        match self {
            DispatchOutput::Tuple(tensors) => Ok(tensors),
            DispatchOutput::Tensor(tensor) => Ok(vec![tensor]),
            DispatchOutput::None => Ok(Vec::new()),
        }
    }
}

/// Runs operators on distributed tensors.
///
/// A call is propagated, its inputs are redistributed to the suggested
/// layout when needed, the local kernel runs on the shards and the outputs
/// are wrapped with the propagated specs.
pub struct OpDispatcher {
    propagator: ShardingPropagator,
    kernels: HashMap<OpOverload, Kernel>,
}

impl OpDispatcher {
    /// A dispatcher without kernels.
    pub fn new(propagator: ShardingPropagator) -> Self {
        Self {
            propagator,
            kernels: HashMap::new(),
        }
    }

    /// A dispatcher knowing the built-in ops and their candle kernels.
    pub fn with_default_ops() -> Self {
        let mut propagator = ShardingPropagator::new();
        register_default_ops(&mut propagator);
        let mut dispatcher = Self::new(propagator);
        register_default_kernels(&mut dispatcher);
        dispatcher
    }

    /// The propagator.
    pub fn propagator(&self) -> &ShardingPropagator {
        &self.propagator
    }

    /// The propagator, for registering more ops.
    pub fn propagator_mut(&mut self) -> &mut ShardingPropagator {
        &mut self.propagator
    }

    /// Registers the local kernel of `op`.
    pub fn register_kernel(&mut self, op: OpOverload, kernel: Kernel) {
        self.kernels.insert(op, kernel);
    }

    /// Runs `op` on `args`.
    pub fn dispatch(&self, op: impl Into<OpOverload>, args: Vec<DArg>) -> Result<DispatchOutput> {
        let op = op.into();
        let kernel = self
            .kernels
            .get(&op)
            .ok_or_else(|| DistError::NotImplemented(format!("no local kernel registered for {op}")))?;

        let schema = OpSchema::new(op.clone(), args.iter().map(DArg::to_schema).collect(), BTreeMap::new());
        let mut info = OpInfo::new(schema);
        self.propagator.propagate(&mut info)?;
        let sharding = info.output_sharding.take().ok_or_else(|| {
            DistError::InvalidState(format!("propagation of {op} produced no result"))
        })?;

        let inputs: Vec<&DTensor> = args
            .iter()
            .flat_map(|arg| match arg {
                DArg::Tensor(tensor) => vec![tensor],
                DArg::TensorList(list) => list.iter().collect(),
                DArg::Value(_) => Vec::new(),
            })
            .collect();

        let suggested = sharding
            .schema_suggestions
            .as_ref()
            .and_then(|suggestions| suggestions.first());
        let (locals, run_schema) = match (sharding.needs_redistribute, suggested) {
            (true, Some(suggested)) => {
                let targets = suggested.args_spec();
                let locals = inputs
                    .iter()
                    .zip(targets)
                    .map(|(tensor, target)| {
                        if tensor.placements() == target.placements() {
                            return Ok(tensor.to_local().clone());
                        }
                        log::debug!(
                            "{op}: redistributing input {} to {target}",
                            tensor.spec()
                        );
                        Ok(tensor.redistribute(target.placements())?.into_local())
                    })
                    .collect::<Result<Vec<_>>>()?;
                (locals, suggested)
            }
            (true, None) => {
                return Err(DistError::InvalidState(format!(
                    "{op} needs a redistribution but no layout was suggested"
                )));
            }
            (false, _) => (
                inputs.iter().map(|t| t.to_local().clone()).collect(),
                &info.schema,
            ),
        };

        let is_tuple = matches!(sharding.output_spec, Some(OutputSpec::Tuple(_)));
        let output_specs: Vec<DTensorSpec> = match sharding.output_spec {
            None => Vec::new(),
            Some(OutputSpec::Single(spec)) => vec![spec],
            Some(OutputSpec::Tuple(specs)) => specs.into_iter().flatten().collect(),
        };
        let ctx = KernelContext {
            output_local_shapes: output_specs
                .iter()
                .map(DTensorSpec::local_shape)
                .collect::<Result<_>>()?,
        };

        let outputs = kernel(&locals, run_schema, &ctx)?;
        if outputs.len() != output_specs.len() {
            return Err(DistError::InvalidState(format!(
                "kernel of {op} returned {} tensors for {} output specs",
                outputs.len(),
                output_specs.len()
            )));
        }

        let mut wrapped = outputs
            .into_iter()
            .zip(output_specs)
            .map(|(local, spec)| DTensor::from_parts(local, spec))
            .collect::<Result<Vec<_>>>()?;
        Ok(match (is_tuple, wrapped.pop()) {
            (_, None) => DispatchOutput::None,
            (false, Some(tensor)) => DispatchOutput::Tensor(tensor),
            (true, Some(last)) => {
                wrapped.push(last);
                DispatchOutput::Tuple(wrapped)
            }
        })
    }
}

fn unary(op: &OpOverload, locals: &[Tensor]) -> Result<Tensor> {
    match locals {
        [x] => Ok(x.clone()),
        _ => Err(DistError::PropagationFailed {
            op: op.to_string(),
            reason: format!("expected 1 tensor, got {}", locals.len()),
        }),
    }
}

fn binary<'a>(op: &OpOverload, locals: &'a [Tensor]) -> Result<(&'a Tensor, &'a Tensor)> {
    match locals {
        [a, b] => Ok((a, b)),
        _ => Err(DistError::PropagationFailed {
            op: op.to_string(),
            reason: format!("expected 2 tensors, got {}", locals.len()),
        }),
    }
}

fn register_default_kernels(dispatcher: &mut OpDispatcher) {
    dispatcher.register_kernel(
        ops::ADD.into(),
        Arc::new(|locals: &[Tensor], schema: &OpSchema, _: &KernelContext| -> Result<Vec<Tensor>> {
            let (a, b) = binary(schema.op(), locals)?;
            Ok(vec![a.add(b)?])
        }),
    );
    dispatcher.register_kernel(
        ops::MUL.into(),
        Arc::new(|locals: &[Tensor], schema: &OpSchema, _: &KernelContext| -> Result<Vec<Tensor>> {
            let (a, b) = binary(schema.op(), locals)?;
            Ok(vec![a.mul(b)?])
        }),
    );
    dispatcher.register_kernel(
        ops::SUB.into(),
        Arc::new(|locals: &[Tensor], schema: &OpSchema, _: &KernelContext| -> Result<Vec<Tensor>> {
            let (a, b) = binary(schema.op(), locals)?;
            Ok(vec![a.sub(b)?])
        }),
    );
    dispatcher.register_kernel(
        ops::MM.into(),
        Arc::new(|locals: &[Tensor], schema: &OpSchema, _: &KernelContext| -> Result<Vec<Tensor>> {
            let (a, b) = binary(schema.op(), locals)?;
            Ok(vec![a.matmul(b)?])
        }),
    );
    dispatcher.register_kernel(
        ops::T.into(),
        Arc::new(|locals: &[Tensor], schema: &OpSchema, _: &KernelContext| -> Result<Vec<Tensor>> {
            let x = unary(schema.op(), locals)?;
            if x.rank() < 2 {
                return Ok(vec![x]);
            }
            Ok(vec![x.t()?.contiguous()?])
        }),
    );
    dispatcher.register_kernel(
        ops::SUM_DIM.into(),
        Arc::new(|locals: &[Tensor], schema: &OpSchema, _: &KernelContext| -> Result<Vec<Tensor>> {
            let x = unary(schema.op(), locals)?;
            let dims = ops::sum_dims(schema.op(), schema.args_schema().get(1), x.rank())?;
            let keepdim = schema
                .args_schema()
                .get(2)
                .and_then(ArgSchema::as_bool)
                .unwrap_or(false);
            let out = if keepdim { x.sum_keepdim(dims)? } else { x.sum(dims)? };
            Ok(vec![out])
        }),
    );
    dispatcher.register_kernel(
        ops::SPLIT.into(),
        Arc::new(|locals: &[Tensor], schema: &OpSchema, ctx: &KernelContext| -> Result<Vec<Tensor>> {
            let x = unary(schema.op(), locals)?;
            let dim = ops::split_dim(schema, x.rank())?;
            let mut start = 0;
            let mut pieces = Vec::with_capacity(ctx.output_local_shapes.len());
            for shape in &ctx.output_local_shapes {
                let len = shape[dim];
                pieces.push(x.narrow(dim, start, len)?);
                start += len;
            }
            Ok(pieces)
        }),
    );
    dispatcher.register_kernel(
        ops::CAT.into(),
        Arc::new(|locals: &[Tensor], schema: &OpSchema, _: &KernelContext| -> Result<Vec<Tensor>> {
            let first = locals.first().ok_or_else(|| DistError::PropagationFailed {
                op: schema.op().to_string(),
                reason: "expected a non-empty list of tensors".to_string(),
            })?;
            let dim = ops::cat_dim(schema, first.rank())?;
            Ok(vec![Tensor::cat(locals, dim)?])
        }),
    );
    dispatcher.register_kernel(
        ops::FOREACH_MUL_SCALAR.into(),
        Arc::new(|locals: &[Tensor], schema: &OpSchema, _: &KernelContext| -> Result<Vec<Tensor>> {
            let scalar = schema.arg(1)?.as_float().ok_or_else(|| DistError::PropagationFailed {
                op: schema.op().to_string(),
                reason: "argument 1 is not a float".to_string(),
            })?;
            locals
                .iter()
                .map(|x| Ok(x.affine(scalar, 0.0)?))
                .collect()
        }),
    );
    dispatcher.register_kernel(
        ops::VIEW.into(),
        Arc::new(|locals: &[Tensor], schema: &OpSchema, ctx: &KernelContext| -> Result<Vec<Tensor>> {
            let x = unary(schema.op(), locals)?;
            let shape = ctx.output_local_shapes.first().cloned().unwrap_or_default();
            Ok(vec![x.reshape(shape)?])
        }),
    );
}
