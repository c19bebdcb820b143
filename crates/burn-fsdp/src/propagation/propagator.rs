use std::sync::{Arc, Mutex, MutexGuard};

use hashbrown::{HashMap, HashSet};

use super::{
    ArgSchema, ArgStrategy, OpInfo, OpOverload, OpSchema, OpStrategy, OutputMeta, OutputSharding,
    OutputSpec, PlacementStrategy, RuntimeSchemaInfo, StrategySchema, StrategyType,
    TupleStrategy,
};
use crate::sharding::{DTensorSpec, DeviceMesh};
use crate::{DistError, Result};

/// A sharding rule: given input specs, produce output specs or suggestions.
pub type ShardingRule = Arc<dyn Fn(&OpSchema) -> Result<OutputSharding> + Send + Sync>;

/// A strategy generator: given the input strategies, enumerate output candidates.
pub type StrategyFn = Arc<dyn Fn(&DeviceMesh, &StrategySchema) -> Result<StrategyType> + Send + Sync>;

/// Shape-only evaluation of an operator on global metas.
pub type MetaFn = Arc<dyn Fn(&OpSchema) -> Result<OutputMeta> + Send + Sync>;

/// Ops whose output needs no propagation, they run on local shards.
pub const SKIP_PROPAGATION_OPS: [&str; 3] = [
    "aten._local_scalar_dense.default",
    "aten.equal.default",
    "aten.is_same_size.default",
];

/// Infers output placements of operators on distributed tensors.
///
/// Each operator is handled by a strategy generator, which enumerates
/// candidate layouts and lets the propagator pick the cheapest one, or by a
/// legacy rule, which either produces the output layout directly or suggests
/// input layouts to redistribute to. Results are memoized per
/// [`OpSchema`] cache key.
pub struct ShardingPropagator {
    op_to_rules: HashMap<OpOverload, ShardingRule>,
    op_strategy_funcs: HashMap<OpOverload, StrategyFn>,
    op_to_meta: HashMap<OpOverload, MetaFn>,
    op_to_schema_info: HashMap<OpOverload, RuntimeSchemaInfo>,
    skip_list: HashSet<OpOverload>,
    cache: Mutex<HashMap<OpSchema, OutputSharding>>,
}

impl Default for ShardingPropagator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardingPropagator {
    /// An empty propagator, only knowing the ops that skip propagation.
    pub fn new() -> Self {
        Self {
            op_to_rules: HashMap::new(),
            op_strategy_funcs: HashMap::new(),
            op_to_meta: HashMap::new(),
            op_to_schema_info: HashMap::new(),
            skip_list: SKIP_PROPAGATION_OPS.iter().map(|op| OpOverload::new(op)).collect(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a legacy sharding rule.
    pub fn register_sharding_prop_rule(
        &mut self,
        op: OpOverload,
        rule: ShardingRule,
        schema_info: Option<RuntimeSchemaInfo>,
    ) {
        self.op_to_rules.insert(op.clone(), rule);
        if let Some(info) = schema_info {
            self.op_to_schema_info.insert(op, info);
        }
        self.clear_cache();
    }

    /// Registers a strategy generator.
    pub fn register_op_strategy(
        &mut self,
        op: OpOverload,
        strategy: StrategyFn,
        schema_info: Option<RuntimeSchemaInfo>,
    ) {
        self.op_strategy_funcs.insert(op.clone(), strategy);
        if let Some(info) = schema_info {
            self.op_to_schema_info.insert(op, info);
        }
        self.clear_cache();
    }

    /// Registers the shape function of an operator.
    pub fn register_meta(&mut self, op: OpOverload, meta: MetaFn) {
        self.op_to_meta.insert(op, meta);
        self.clear_cache();
    }

    /// Whether any rule or strategy handles `op`.
    pub fn is_registered(&self, op: &OpOverload) -> bool {
        self.op_strategy_funcs.contains_key(op) || self.op_to_rules.contains_key(op)
    }

    /// Number of memoized results.
    pub fn cache_len(&self) -> usize {
        self.lock_cache().map(|cache| cache.len()).unwrap_or(0)
    }

    /// Forgets every memoized result.
    pub fn clear_cache(&self) {
        match self.cache.lock() {
            Ok(mut cache) => cache.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    fn lock_cache(&self) -> Result<MutexGuard<'_, HashMap<OpSchema, OutputSharding>>> {
        self.cache
            .lock()
            .map_err(|_| DistError::InvalidState("sharding propagation cache poisoned".to_string()))
    }

    /// Fills `op_info.output_sharding`.
    ///
    /// Calls with symbolic integers cannot be hashed meaningfully and bypass
    /// the cache.
    pub fn propagate(&self, op_info: &mut OpInfo) -> Result<()> {
        let info = self.op_to_schema_info.get(op_info.schema.op()).cloned();
        op_info.schema.set_schema_info(info);

        let output_sharding = if op_info.schema.has_symints() {
            self.propagate_op_sharding_non_cached(&op_info.schema)?
        } else {
            self.propagate_op_sharding(&op_info.schema)?
        };
        op_info.output_sharding = Some(output_sharding);
        Ok(())
    }

    /// Memoized [`ShardingPropagator::propagate_op_sharding_non_cached`].
    ///
    /// Failures are not memoized.
    pub fn propagate_op_sharding(&self, op_schema: &OpSchema) -> Result<OutputSharding> {
        if let Some(hit) = self.lock_cache()?.get(op_schema) {
            return Ok(hit.clone());
        }
        let output_sharding = self.propagate_op_sharding_non_cached(op_schema)?;
        self.lock_cache()?
            .insert(op_schema.clone(), output_sharding.clone());
        Ok(output_sharding)
    }

    /// Propagates the sharding of one operator call.
    pub fn propagate_op_sharding_non_cached(&self, op_schema: &OpSchema) -> Result<OutputSharding> {
        let op = op_schema.op();
        if self.skip_list.contains(op) {
            return Ok(OutputSharding::suggest(vec![op_schema.clone()]));
        }

        let out_tensor_meta = self.propagate_tensor_meta(op_schema)?;

        if let Some(strategy_fn) = self.op_strategy_funcs.get(op) {
            let mesh: &DeviceMesh = op_schema.mesh().ok_or_else(|| DistError::PropagationFailed {
                op: op.to_string(),
                reason: format!("Cannot find mesh for op {op}"),
            })?;

            let strategy_schema = StrategySchema {
                op: op.clone(),
                args: op_schema.args_schema().iter().map(spec_to_strategy).collect(),
                kwargs: op_schema
                    .kwargs_schema()
                    .iter()
                    .map(|(k, v)| (k.clone(), spec_to_strategy(v)))
                    .collect(),
            };

            let mut output_sharding = match strategy_fn(mesh, &strategy_schema)? {
                StrategyType::Op(strategy) => {
                    self.op_strategy_output(op_schema, &strategy, &out_tensor_meta)?
                }
                StrategyType::Tuple(strategy) => {
                    self.tuple_strategy_output(op_schema, &strategy, &out_tensor_meta)?
                }
            };

            wrap_output_spec_tensor_meta(op, &mut output_sharding.output_spec, &out_tensor_meta)?;
            return Ok(output_sharding);
        }

        if let Some(rule) = self.op_to_rules.get(op) {
            let mut output_sharding = rule(op_schema).map_err(|err| match err {
                DistError::NotImplemented(_) => err,
                other => DistError::PropagationFailed {
                    op: op_schema.to_string(),
                    reason: other.to_string(),
                },
            })?;

            if output_sharding.output_spec.is_none() {
                match &output_sharding.schema_suggestions {
                    None => {
                        if let Some(reason) = &output_sharding.failed_reason {
                            return Err(DistError::PropagationFailed {
                                op: op_schema.to_string(),
                                reason: reason.clone(),
                            });
                        }
                    }
                    Some(suggestions) => {
                        let suggested = suggestions.first().ok_or_else(|| {
                            DistError::PropagationFailed {
                                op: op_schema.to_string(),
                                reason: "empty schema suggestions".to_string(),
                            }
                        })?;
                        // One more round on the suggested inputs; both the output
                        // spec and the suggestions being set means a reshard is needed.
                        let retried = rule(suggested)?;
                        output_sharding.output_spec = retried.output_spec;
                        output_sharding.needs_redistribute = true;
                    }
                }
            }

            wrap_output_spec_tensor_meta(op, &mut output_sharding.output_spec, &out_tensor_meta)?;
            return Ok(output_sharding);
        }

        Err(DistError::NoShardingStrategy(op.to_string()))
    }

    fn propagate_tensor_meta(&self, op_schema: &OpSchema) -> Result<OutputMeta> {
        match self.op_to_meta.get(op_schema.op()) {
            Some(meta) => meta(op_schema),
            None => {
                log::debug!("no meta function for {}, assuming no tensor output", op_schema.op());
                Ok(OutputMeta::None)
            }
        }
    }

    fn op_strategy_output(
        &self,
        op_schema: &OpSchema,
        strategy: &OpStrategy,
        out_tensor_meta: &OutputMeta,
    ) -> Result<OutputSharding> {
        let selected = select_strategy(op_schema.op(), strategy)?;

        let mut needs_redistribute = false;
        let mut expected_input_specs = Vec::new();
        for (idx, input_spec) in op_schema.args_spec().into_iter().enumerate() {
            let desired = selected.input_spec(idx).ok_or_else(|| DistError::PropagationFailed {
                op: op_schema.op().to_string(),
                reason: format!("selected strategy has no spec for input {idx}"),
            })?;
            if input_spec.placements() != desired.placements() {
                needs_redistribute = true;
            }
            expected_input_specs.push(desired.clone());
        }

        let schema_suggestions = if needs_redistribute {
            Some(vec![op_schema.rewrap_with_specs(&expected_input_specs)?])
        } else {
            None
        };

        let output_spec = match out_tensor_meta {
            OutputMeta::Tuple(metas) | OutputMeta::List(metas) => OutputSpec::Tuple(
                metas
                    .iter()
                    .map(|_| Some(selected.output_spec.clone()))
                    .collect(),
            ),
            _ => OutputSpec::Single(selected.output_spec.clone()),
        };

        Ok(OutputSharding {
            output_spec: Some(output_spec),
            schema_suggestions,
            failed_reason: None,
            needs_redistribute,
        })
    }

    fn tuple_strategy_output(
        &self,
        op_schema: &OpSchema,
        strategy: &TupleStrategy,
        out_tensor_meta: &OutputMeta,
    ) -> Result<OutputSharding> {
        let op = op_schema.op();
        let mut out_spec_list = Vec::with_capacity(strategy.children.len());
        for child in &strategy.children {
            let StrategyType::Op(child) = child else {
                return Err(DistError::PropagationFailed {
                    op: op.to_string(),
                    reason: "nested tuple strategies are not supported".to_string(),
                });
            };
            out_spec_list.push(select_strategy(op, child)?.output_spec.clone());
        }
        let spec_at = |idx: usize| {
            out_spec_list.get(idx).ok_or_else(|| DistError::PropagationFailed {
                op: op.to_string(),
                reason: format!("tuple strategy has no child for element {idx}"),
            })
        };

        let mut needs_redistribute = false;
        let mut suggestion_args = Vec::with_capacity(op_schema.args_schema().len());
        for arg in op_schema.args_schema() {
            match arg {
                ArgSchema::SpecList(list) => {
                    let mut expected = Vec::with_capacity(list.len());
                    for (idx, spec) in list.iter().enumerate() {
                        let desired = spec_at(idx)?;
                        if spec.placements() != desired.placements() {
                            needs_redistribute = true;
                        }
                        expected.push(desired.clone());
                    }
                    suggestion_args.push(ArgSchema::SpecList(expected));
                }
                ArgSchema::Spec(spec) => {
                    let desired = spec_at(0)?;
                    if spec.placements() != desired.placements() {
                        needs_redistribute = true;
                    }
                    suggestion_args.push(ArgSchema::Spec(desired.clone()));
                }
                other => suggestion_args.push(other.clone()),
            }
        }

        let schema_suggestions = needs_redistribute.then(|| {
            vec![OpSchema::new(
                op.clone(),
                suggestion_args,
                op_schema.kwargs_schema().clone(),
            )]
        });

        let output_spec = match out_tensor_meta {
            OutputMeta::None => None,
            _ => Some(OutputSpec::Tuple(out_spec_list.into_iter().map(Some).collect())),
        };

        Ok(OutputSharding {
            output_spec,
            schema_suggestions,
            failed_reason: None,
            needs_redistribute,
        })
    }
}

fn spec_to_strategy(arg: &ArgSchema) -> ArgStrategy {
    match arg {
        ArgSchema::Spec(spec) => ArgStrategy::Strategy(StrategyType::Op(OpStrategy::new(vec![
            PlacementStrategy::from_output(spec.clone()),
        ]))),
        ArgSchema::SpecList(list) if !list.is_empty() => {
            ArgStrategy::Strategy(StrategyType::Tuple(TupleStrategy::new(
                list.iter()
                    .map(|spec| {
                        StrategyType::Op(OpStrategy::new(vec![PlacementStrategy::from_output(
                            spec.clone(),
                        )]))
                    })
                    .collect(),
            )))
        }
        other => ArgStrategy::Value(other.clone()),
    }
}

/// Picks the candidate with the lowest total redistribution cost, the first
/// one on ties.
pub fn select_strategy<'a>(op: &OpOverload, strategy: &'a OpStrategy) -> Result<&'a PlacementStrategy> {
    match strategy.strategies.as_slice() {
        [] => Err(DistError::PropagationFailed {
            op: op.to_string(),
            reason: "strategy generator returned no candidate".to_string(),
        }),
        [only] => Ok(only),
        candidates => {
            let mut best: Option<(f64, &PlacementStrategy)> = None;
            for candidate in candidates {
                let cost = candidate.total_cost().ok_or_else(|| DistError::PropagationFailed {
                    op: op.to_string(),
                    reason: "must set redistribute cost each strategy!".to_string(),
                })?;
                if best.is_none_or(|(best_cost, _)| cost < best_cost) {
                    best = Some((cost, candidate));
                }
            }
            best.map(|(_, candidate)| candidate)
                .ok_or_else(|| DistError::PropagationFailed {
                    op: op.to_string(),
                    reason: "no candidate selected".to_string(),
                })
        }
    }
}

fn wrap_output_spec_tensor_meta(
    op: &OpOverload,
    output_spec: &mut Option<OutputSpec>,
    out_tensor_meta: &OutputMeta,
) -> Result<()> {
    let fail = |reason: String| DistError::PropagationFailed {
        op: op.to_string(),
        reason,
    };

    match output_spec {
        None => Ok(()),
        Some(OutputSpec::Single(spec)) => match out_tensor_meta {
            OutputMeta::Single(meta) => {
                spec.set_tensor_meta(meta.clone());
                Ok(())
            }
            OutputMeta::Tuple(metas) | OutputMeta::List(metas) => Err(fail(format!(
                "`output_spec` has 1 output which does not equal the number of op outputs: {}.",
                metas.len()
            ))),
            OutputMeta::None => Err(fail(
                "output does not have an associated TensorMeta".to_string(),
            )),
        },
        Some(OutputSpec::Tuple(specs)) => {
            let metas = match out_tensor_meta {
                OutputMeta::Tuple(metas) | OutputMeta::List(metas) => metas,
                OutputMeta::Single(_) => {
                    return Err(fail(format!(
                        "`output_spec` has {} outputs which does not equal the number of op outputs 1.",
                        specs.len()
                    )));
                }
                OutputMeta::None => {
                    return Err(fail(format!(
                        "`output_spec` has {} outputs which does not equal the number of op outputs 0.",
                        specs.len()
                    )));
                }
            };
            if metas.len() != specs.len() {
                return Err(fail(format!(
                    "`output_spec` has {} outputs which does not equal the number of op outputs {}.",
                    specs.len(),
                    metas.len()
                )));
            }
            for (spec, meta) in specs.iter_mut().zip(metas) {
                if let Some(spec) = spec {
                    spec.set_tensor_meta(meta.clone());
                }
            }
            Ok(())
        }
    }
}

/// Specs of every tensor argument must share one mesh.
pub(crate) fn common_mesh<'a>(op: &OpOverload, specs: &[&'a DTensorSpec]) -> Result<&'a Arc<DeviceMesh>> {
    let first = specs.first().ok_or_else(|| DistError::PropagationFailed {
        op: op.to_string(),
        reason: "no tensor arguments".to_string(),
    })?;
    for spec in &specs[1..] {
        if spec.mesh() != first.mesh() {
            return Err(DistError::PropagationFailed {
                op: op.to_string(),
                reason: "tensor arguments live on different meshes".to_string(),
            });
        }
    }
    Ok(first.mesh())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalProcessGroup;
    use crate::sharding::{Placement, TensorMeta};
    use candle_core::DType;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mesh() -> Arc<DeviceMesh> {
        Arc::new(DeviceMesh::from_group(Arc::new(LocalProcessGroup::new()), None))
    }

    fn spec(mesh: &Arc<DeviceMesh>, shape: &[usize]) -> DTensorSpec {
        DTensorSpec::new(
            mesh.clone(),
            vec![Placement::Replicate],
            Some(TensorMeta::contiguous(shape.to_vec(), DType::F32)),
        )
        .unwrap()
    }

    fn same_meta(schema: &OpSchema) -> Result<OutputMeta> {
        Ok(OutputMeta::Single(schema.spec_arg(0)?.meta()?.clone()))
    }

    /// Registers `op` as an identity op whose strategy counts its invocations.
    fn counting_propagator(op: &str, calls: Arc<AtomicUsize>) -> ShardingPropagator {
        let mut propagator = ShardingPropagator::new();
        propagator.register_op_strategy(
            op.into(),
            Arc::new(move |_: &DeviceMesh, schema: &StrategySchema| -> Result<StrategyType> {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(StrategyType::Op(schema.op_strategy(0)?.clone()))
            }),
            None,
        );
        propagator.register_meta(op.into(), Arc::new(same_meta));
        propagator
    }

    fn op_info(op: &str, args: Vec<ArgSchema>) -> OpInfo {
        OpInfo::new(OpSchema::new(op.into(), args, BTreeMap::new()))
    }

    #[test]
    fn test_cache_hit_skips_strategy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let propagator = counting_propagator("aten.relu.default", calls.clone());
        let mesh = mesh();

        for _ in 0..3 {
            let mut info = op_info("aten.relu.default", vec![ArgSchema::Spec(spec(&mesh, &[4]))]);
            propagator.propagate(&mut info).unwrap();
            assert!(info.output_sharding.is_some());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(propagator.cache_len(), 1);

        let mut info = op_info("aten.relu.default", vec![ArgSchema::Spec(spec(&mesh, &[8]))]);
        propagator.propagate(&mut info).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        propagator.clear_cache();
        assert_eq!(propagator.cache_len(), 0);
    }

    #[test]
    fn test_symints_bypass_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let propagator = counting_propagator("aten.relu.default", calls.clone());
        let mesh = mesh();

        for _ in 0..2 {
            let mut info = op_info(
                "aten.relu.default",
                vec![ArgSchema::Spec(spec(&mesh, &[4])), ArgSchema::SymInt("s0".into())],
            );
            propagator.propagate(&mut info).unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(propagator.cache_len(), 0);
    }

    #[test]
    fn test_output_meta_is_stitched() {
        let propagator = counting_propagator("aten.relu.default", Arc::new(AtomicUsize::new(0)));
        let mut info = op_info("aten.relu.default", vec![ArgSchema::Spec(spec(&mesh(), &[3, 5]))]);

        propagator.propagate(&mut info).unwrap();

        let Some(OutputSpec::Single(out)) = info.output_sharding.unwrap().output_spec else {
            panic!("expected a single output");
        };
        assert_eq!(out.shape().unwrap(), &[3, 5]);
    }

    #[test]
    fn test_skip_list_suggests_input_schema() {
        let propagator = ShardingPropagator::new();
        let schema = OpSchema::new(
            "aten.equal.default".into(),
            vec![ArgSchema::Spec(spec(&mesh(), &[2]))],
            BTreeMap::new(),
        );

        let out = propagator.propagate_op_sharding_non_cached(&schema).unwrap();

        assert!(out.output_spec.is_none());
        assert_eq!(out.schema_suggestions, Some(vec![schema]));
    }

    #[test]
    fn test_unregistered_op() {
        let propagator = ShardingPropagator::new();
        let mut info = op_info("aten.cos.default", vec![ArgSchema::Spec(spec(&mesh(), &[2]))]);

        match propagator.propagate(&mut info) {
            Err(DistError::NoShardingStrategy(op)) => assert_eq!(op, "aten.cos.default"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_rule_failures() {
        let mut propagator = ShardingPropagator::new();
        propagator.register_sharding_prop_rule(
            "aten.fail.default".into(),
            Arc::new(|_: &OpSchema| -> Result<OutputSharding> { Ok(OutputSharding::failed("no layout")) }),
            None,
        );
        propagator.register_sharding_prop_rule(
            "aten.todo.default".into(),
            Arc::new(|_: &OpSchema| -> Result<OutputSharding> {
                Err(DistError::NotImplemented("todo".to_string()))
            }),
            None,
        );
        let mesh = mesh();

        let mut info = op_info("aten.fail.default", vec![ArgSchema::Spec(spec(&mesh, &[2]))]);
        match propagator.propagate(&mut info) {
            Err(DistError::PropagationFailed { reason, .. }) => assert_eq!(reason, "no layout"),
            other => panic!("unexpected {other:?}"),
        }

        let mut info = op_info("aten.todo.default", vec![ArgSchema::Spec(spec(&mesh, &[2]))]);
        assert!(matches!(propagator.propagate(&mut info), Err(DistError::NotImplemented(_))));
        assert_eq!(propagator.cache_len(), 0);
    }

    #[test]
    fn test_select_strategy_prefers_lowest_cost_then_first() {
        let mesh = mesh();
        let op = OpOverload::new("aten.x");
        let costly = PlacementStrategy::new(spec(&mesh, &[1]), None, Some(vec![vec![2.0]]));
        let cheap = PlacementStrategy::new(spec(&mesh, &[2]), None, Some(vec![vec![0.5, 0.5]]));
        let tie = PlacementStrategy::new(spec(&mesh, &[3]), None, Some(vec![vec![1.0]]));

        let strategy = OpStrategy::new(vec![costly, cheap.clone(), tie]);
        assert_eq!(select_strategy(&op, &strategy).unwrap(), &cheap);

        let missing = OpStrategy::new(vec![
            PlacementStrategy::from_output(spec(&mesh, &[1])),
            PlacementStrategy::from_output(spec(&mesh, &[2])),
        ]);
        assert!(select_strategy(&op, &missing).is_err());
    }

    #[test]
    fn test_output_count_mismatch() {
        let mesh = mesh();
        let op = OpOverload::new("aten.x");
        let mut output = Some(OutputSpec::Tuple(vec![Some(spec(&mesh, &[1]))]));
        let metas = OutputMeta::Tuple(vec![
            TensorMeta::contiguous(vec![1], DType::F32),
            TensorMeta::contiguous(vec![1], DType::F32),
        ]);

        assert!(wrap_output_spec_tensor_meta(&op, &mut output, &metas).is_err());
    }
}
