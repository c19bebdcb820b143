use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use derive_new::new;

use crate::sharding::{DTensorSpec, DeviceMesh, TensorMeta};
use crate::{DistError, Result};

/// Handle to one operator overload, such as `aten.mm.default`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpOverload(Arc<str>);

impl OpOverload {
    /// Creates a handle from the qualified overload name.
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    /// Qualified overload name.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OpOverload {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for OpOverload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One argument of an operator call as seen by sharding propagation.
///
/// Tensors are replaced by their [`DTensorSpec`]; floats are stored by bit
/// pattern so that arguments can be hashed.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ArgSchema {
    /// A distributed tensor.
    Spec(DTensorSpec),
    /// A list of distributed tensors.
    SpecList(Vec<DTensorSpec>),
    /// An integer.
    Int(i64),
    /// A symbolic integer, which makes the call uncacheable.
    SymInt(String),
    /// A list of integers.
    IntList(Vec<i64>),
    /// A float, stored as its bit pattern.
    Float(u64),
    /// A boolean.
    Bool(bool),
    /// A string.
    Str(String),
    /// An absent optional argument.
    None,
}

impl ArgSchema {
    /// A float argument.
    pub fn float(value: f64) -> Self {
        ArgSchema::Float(value.to_bits())
    }

    /// Whether the argument is a tensor or a list of tensors.
    pub fn is_tensor_like(&self) -> bool {
        matches!(self, ArgSchema::Spec(_) | ArgSchema::SpecList(_))
    }

    /// The spec of a tensor argument.
    pub fn as_spec(&self) -> Option<&DTensorSpec> {
        match self {
            ArgSchema::Spec(spec) => Some(spec),
            _ => None,
        }
    }

    /// The integer value.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ArgSchema::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The integer list value.
    pub fn as_int_list(&self) -> Option<&[i64]> {
        match self {
            ArgSchema::IntList(v) => Some(v),
            _ => None,
        }
    }

    /// The float value.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            ArgSchema::Float(bits) => Some(f64::from_bits(*bits)),
            _ => None,
        }
    }

    /// The boolean value.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ArgSchema::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

/// Which non-tensor arguments take part in the propagation cache key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, new)]
pub struct RuntimeSchemaInfo {
    /// Positional arguments at or after this index are hashed even when they are not tensors.
    pub static_argnum: usize,
    /// Whether keyword arguments are hashed too.
    pub needs_pytree: bool,
}

/// An operator call described by argument specs.
///
/// Equality and hashing define the propagation cache key: the op, every
/// tensor argument, the positional arguments from `static_argnum` on and, when
/// `needs_pytree` is set, the keyword arguments.
#[derive(Clone, Debug)]
pub struct OpSchema {
    op: OpOverload,
    args_schema: Vec<ArgSchema>,
    kwargs_schema: BTreeMap<String, ArgSchema>,
    schema_info: Option<RuntimeSchemaInfo>,
}

impl OpSchema {
    /// Creates a schema without runtime schema info.
    pub fn new(op: OpOverload, args_schema: Vec<ArgSchema>, kwargs_schema: BTreeMap<String, ArgSchema>) -> Self {
        Self {
            op,
            args_schema,
            kwargs_schema,
            schema_info: None,
        }
    }

    /// The operator.
    pub fn op(&self) -> &OpOverload {
        &self.op
    }

    /// Positional arguments.
    pub fn args_schema(&self) -> &[ArgSchema] {
        &self.args_schema
    }

    /// Keyword arguments.
    pub fn kwargs_schema(&self) -> &BTreeMap<String, ArgSchema> {
        &self.kwargs_schema
    }

    /// Runtime schema info, attached by the propagator.
    pub fn schema_info(&self) -> Option<&RuntimeSchemaInfo> {
        self.schema_info.as_ref()
    }

    pub(crate) fn set_schema_info(&mut self, info: Option<RuntimeSchemaInfo>) {
        self.schema_info = info;
    }

    /// Positional argument `index`, failing with a propagation error when absent.
    pub fn arg(&self, index: usize) -> Result<&ArgSchema> {
        self.args_schema.get(index).ok_or_else(|| DistError::PropagationFailed {
            op: self.op.to_string(),
            reason: format!("missing positional argument {index}"),
        })
    }

    /// Positional argument `index` as a tensor spec.
    pub fn spec_arg(&self, index: usize) -> Result<&DTensorSpec> {
        self.arg(index)?.as_spec().ok_or_else(|| DistError::PropagationFailed {
            op: self.op.to_string(),
            reason: format!("argument {index} is not a tensor"),
        })
    }

    /// Positional argument `index` as an integer.
    pub fn int_arg(&self, index: usize) -> Result<i64> {
        self.arg(index)?.as_int().ok_or_else(|| DistError::PropagationFailed {
            op: self.op.to_string(),
            reason: format!("argument {index} is not an integer"),
        })
    }

    /// Every tensor argument in order, lists flattened.
    pub fn args_spec(&self) -> Vec<&DTensorSpec> {
        let mut specs = Vec::new();
        for arg in &self.args_schema {
            match arg {
                ArgSchema::Spec(spec) => specs.push(spec),
                ArgSchema::SpecList(list) => specs.extend(list.iter()),
                _ => {}
            }
        }
        specs
    }

    /// Global metas of the tensor arguments in order.
    pub fn args_meta(&self) -> Result<Vec<&TensorMeta>> {
        self.args_spec().into_iter().map(|spec| spec.meta()).collect()
    }

    /// Whether any argument is a symbolic integer.
    pub fn has_symints(&self) -> bool {
        self.args_schema
            .iter()
            .chain(self.kwargs_schema.values())
            .any(|arg| matches!(arg, ArgSchema::SymInt(_)))
    }

    /// Mesh of the first tensor argument.
    pub fn mesh(&self) -> Option<&Arc<DeviceMesh>> {
        self.args_spec().first().map(|spec| spec.mesh())
    }

    /// A copy of this schema whose tensor arguments are replaced, in order, by `specs`.
    ///
    /// Non-tensor arguments and keyword arguments are kept.
    pub fn rewrap_with_specs(&self, specs: &[DTensorSpec]) -> Result<OpSchema> {
        let mut specs = specs.iter();
        let mut next = || {
            specs.next().cloned().ok_or_else(|| DistError::PropagationFailed {
                op: self.op.to_string(),
                reason: "fewer suggested specs than tensor arguments".to_string(),
            })
        };
        let args_schema = self
            .args_schema
            .iter()
            .map(|arg| match arg {
                ArgSchema::Spec(_) => Ok(ArgSchema::Spec(next()?)),
                ArgSchema::SpecList(list) => Ok(ArgSchema::SpecList(
                    list.iter().map(|_| next()).collect::<Result<Vec<_>>>()?,
                )),
                other => Ok(other.clone()),
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(OpSchema {
            op: self.op.clone(),
            args_schema,
            kwargs_schema: self.kwargs_schema.clone(),
            schema_info: self.schema_info.clone(),
        })
    }

    fn hashed_args(&self) -> impl Iterator<Item = (usize, &ArgSchema)> {
        let static_argnum = self
            .schema_info
            .as_ref()
            .map(|info| info.static_argnum)
            .unwrap_or(self.args_schema.len());
        self.args_schema
            .iter()
            .enumerate()
            .filter(move |(index, arg)| arg.is_tensor_like() || *index >= static_argnum)
    }

    fn hashes_kwargs(&self) -> bool {
        self.schema_info
            .as_ref()
            .is_some_and(|info| info.needs_pytree)
    }
}

impl PartialEq for OpSchema {
    fn eq(&self, other: &Self) -> bool {
        if self.op != other.op || self.args_schema.len() != other.args_schema.len() {
            return false;
        }
        if !self.hashed_args().eq(other.hashed_args()) {
            return false;
        }
        !self.hashes_kwargs() || self.kwargs_schema == other.kwargs_schema
    }
}

impl Eq for OpSchema {}

impl Hash for OpSchema {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.op.hash(state);
        self.args_schema.len().hash(state);
        for (index, arg) in self.hashed_args() {
            index.hash(state);
            arg.hash(state);
        }
        if self.hashes_kwargs() {
            self.kwargs_schema.hash(state);
        }
    }
}

impl fmt::Display for OpSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Op(op={}, args_schema=[", self.op)?;
        for (index, arg) in self.args_schema.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            match arg {
                ArgSchema::Spec(spec) => write!(f, "{spec}")?,
                ArgSchema::SpecList(list) => {
                    let list: Vec<String> = list.iter().map(|s| s.to_string()).collect();
                    write!(f, "[{}]", list.join(", "))?
                }
                ArgSchema::Float(bits) => write!(f, "{}", f64::from_bits(*bits))?,
                other => write!(f, "{other:?}")?,
            }
        }
        write!(f, "])")
    }
}

/// One way to run an operator: output spec, required input specs and the
/// cost of redistributing every input to them.
#[derive(Clone, Debug, PartialEq, new)]
pub struct PlacementStrategy {
    /// Output spec, tensor meta unset.
    pub output_spec: DTensorSpec,
    /// Required input specs, defaulting to the output spec.
    pub input_specs: Option<Vec<DTensorSpec>>,
    /// Per input, the redistribution cost of each candidate of that input.
    pub redistribute_cost: Option<Vec<Vec<f64>>>,
}

impl PlacementStrategy {
    /// A strategy that is only an output spec.
    pub fn from_output(output_spec: DTensorSpec) -> Self {
        Self::new(output_spec, None, None)
    }

    /// Required spec of input `index`.
    pub fn input_spec(&self, index: usize) -> Option<&DTensorSpec> {
        match &self.input_specs {
            Some(specs) => specs.get(index),
            None => Some(&self.output_spec),
        }
    }

    /// Summed redistribution cost.
    pub fn total_cost(&self) -> Option<f64> {
        self.redistribute_cost
            .as_ref()
            .map(|costs| costs.iter().flatten().sum())
    }
}

/// Candidate strategies of a single-output operator.
#[derive(Clone, Debug, PartialEq, new)]
pub struct OpStrategy {
    /// Candidates.
    pub strategies: Vec<PlacementStrategy>,
}

impl OpStrategy {
    /// Output spec of the first candidate.
    pub fn output_spec(&self) -> Option<&DTensorSpec> {
        self.strategies.first().map(|s| &s.output_spec)
    }
}

/// Strategies of a tensor-list operator, one child per list element.
#[derive(Clone, Debug, PartialEq, new)]
pub struct TupleStrategy {
    /// Per element strategy.
    pub children: Vec<StrategyType>,
}

/// A strategy generator result.
#[derive(Clone, Debug, PartialEq)]
pub enum StrategyType {
    /// Single output.
    Op(OpStrategy),
    /// Tensor list.
    Tuple(TupleStrategy),
}

/// An argument of a strategy schema: tensors are replaced by their current strategy.
#[derive(Clone, Debug, PartialEq)]
pub enum ArgStrategy {
    /// A tensor or tensor list.
    Strategy(StrategyType),
    /// Any other argument.
    Value(ArgSchema),
}

impl ArgStrategy {
    /// The single-output strategy of a tensor argument.
    pub fn as_op_strategy(&self) -> Option<&OpStrategy> {
        match self {
            ArgStrategy::Strategy(StrategyType::Op(strategy)) => Some(strategy),
            _ => None,
        }
    }

    /// The per element strategies of a tensor-list argument.
    pub fn as_tuple_strategy(&self) -> Option<&TupleStrategy> {
        match self {
            ArgStrategy::Strategy(StrategyType::Tuple(strategy)) => Some(strategy),
            _ => None,
        }
    }
}

/// An operator call whose tensors are described by strategies, the input of
/// strategy generators.
#[derive(Clone, Debug, PartialEq)]
pub struct StrategySchema {
    /// The operator.
    pub op: OpOverload,
    /// Positional arguments.
    pub args: Vec<ArgStrategy>,
    /// Keyword arguments.
    pub kwargs: BTreeMap<String, ArgStrategy>,
}

impl StrategySchema {
    /// Strategy of positional tensor argument `index`.
    pub fn op_strategy(&self, index: usize) -> Result<&OpStrategy> {
        self.args
            .get(index)
            .and_then(ArgStrategy::as_op_strategy)
            .ok_or_else(|| DistError::PropagationFailed {
                op: self.op.to_string(),
                reason: format!("argument {index} is not a tensor"),
            })
    }

    /// Non-tensor positional argument `index`.
    pub fn value(&self, index: usize) -> Option<&ArgSchema> {
        match self.args.get(index) {
            Some(ArgStrategy::Value(value)) => Some(value),
            _ => None,
        }
    }
}

/// Output placement of an operator.
#[derive(Clone, Debug, PartialEq)]
pub enum OutputSpec {
    /// One output tensor.
    Single(DTensorSpec),
    /// Several outputs; `None` marks a non-tensor output.
    Tuple(Vec<Option<DTensorSpec>>),
}

/// Result of sharding propagation.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputSharding {
    /// Output placement, `None` when the operator produces no tensor or when
    /// only suggestions could be made.
    pub output_spec: Option<OutputSpec>,
    /// Input layouts to redistribute to before running the operator.
    pub schema_suggestions: Option<Vec<OpSchema>>,
    /// Why a rule could not produce an output.
    pub failed_reason: Option<String>,
    /// Whether inputs must be redistributed to the first suggestion.
    pub needs_redistribute: bool,
}

impl OutputSharding {
    /// An output spec without suggestions.
    pub fn new(output_spec: Option<OutputSpec>) -> Self {
        Self {
            output_spec,
            schema_suggestions: None,
            failed_reason: None,
            needs_redistribute: false,
        }
    }

    /// A single output spec.
    pub fn single(output_spec: DTensorSpec) -> Self {
        Self::new(Some(OutputSpec::Single(output_spec)))
    }

    /// No output, only suggested input layouts.
    pub fn suggest(schema_suggestions: Vec<OpSchema>) -> Self {
        Self {
            output_spec: None,
            schema_suggestions: Some(schema_suggestions),
            failed_reason: None,
            needs_redistribute: false,
        }
    }

    /// A failed propagation.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            output_spec: None,
            schema_suggestions: None,
            failed_reason: Some(reason.into()),
            needs_redistribute: false,
        }
    }
}

/// Output of meta propagation: the global metas an operator would produce.
#[derive(Clone, Debug, PartialEq)]
pub enum OutputMeta {
    /// No tensor output.
    None,
    /// One tensor.
    Single(TensorMeta),
    /// A tuple of tensors.
    Tuple(Vec<TensorMeta>),
    /// A list of tensors.
    List(Vec<TensorMeta>),
}

/// An operator call together with its propagated output sharding.
#[derive(Clone, Debug, new)]
pub struct OpInfo {
    /// The call.
    pub schema: OpSchema,
    /// Filled by propagation.
    #[new(default)]
    pub output_sharding: Option<OutputSharding>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(schema: &OpSchema) -> u64 {
        let mut hasher = DefaultHasher::new();
        schema.hash(&mut hasher);
        hasher.finish()
    }

    fn schema(args: Vec<ArgSchema>, info: Option<RuntimeSchemaInfo>) -> OpSchema {
        let mut schema = OpSchema::new("aten.sum.dim_IntList".into(), args, BTreeMap::new());
        schema.set_schema_info(info);
        schema
    }

    #[test]
    fn test_non_tensor_args_ignored_without_schema_info() {
        let a = schema(vec![ArgSchema::Int(0)], None);
        let b = schema(vec![ArgSchema::Int(1)], None);

        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn test_static_argnum_hashes_trailing_args() {
        let info = Some(RuntimeSchemaInfo::new(1, false));
        let a = schema(vec![ArgSchema::Int(0), ArgSchema::IntList(vec![0])], info.clone());
        let b = schema(vec![ArgSchema::Int(5), ArgSchema::IntList(vec![1])], info.clone());
        let c = schema(vec![ArgSchema::Int(5), ArgSchema::IntList(vec![0])], info);

        assert_ne!(a, b);
        assert_eq!(a, c);
        assert_eq!(hash_of(&a), hash_of(&c));
    }

    #[test]
    fn test_kwargs_hashed_only_with_pytree() {
        let mut kwargs = BTreeMap::new();
        kwargs.insert("keepdim".to_string(), ArgSchema::Bool(true));
        let mut a = OpSchema::new("aten.x".into(), vec![], kwargs);
        let mut b = OpSchema::new("aten.x".into(), vec![], BTreeMap::new());

        assert_eq!(a, b);

        a.set_schema_info(Some(RuntimeSchemaInfo::new(0, true)));
        b.set_schema_info(Some(RuntimeSchemaInfo::new(0, true)));
        assert_ne!(a, b);
    }

    #[test]
    fn test_symint_detection() {
        let a = schema(vec![ArgSchema::SymInt("s0".into())], None);

        assert!(a.has_symints());
        assert!(!schema(vec![ArgSchema::Int(3)], None).has_symints());
    }

    #[test]
    fn test_float_round_trips_through_bits() {
        assert_eq!(ArgSchema::float(0.25).as_float(), Some(0.25));
    }
}
