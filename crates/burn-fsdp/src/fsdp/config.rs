use std::fs;
use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use strum::Display;

use super::{ModuleId, WrapPolicy};
use crate::comm::ProcessGroup;
use crate::sharding::DeviceMesh;
use crate::{DistError, Result};

/// How parameters, gradients and optimizer state are split across ranks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum ShardingStrategy {
    /// Parameters are resharded after forward and after backward.
    #[default]
    FullShard,
    /// Parameters stay unsharded between forward and backward.
    ShardGradOp,
    /// Plain data parallelism: nothing is sharded, gradients are all-reduced.
    NoShard,
    /// [`ShardingStrategy::FullShard`] inside a shard group, replicated across groups.
    HybridShard,
    /// [`ShardingStrategy::ShardGradOp`] inside a shard group, replicated across groups.
    HybridShardZero2,
}

impl ShardingStrategy {
    /// Whether the strategy needs a 2-D `(replicate, shard)` mesh.
    pub fn is_hybrid(&self) -> bool {
        matches!(self, ShardingStrategy::HybridShard | ShardingStrategy::HybridShardZero2)
    }

    /// Reshard policy implied by the strategy.
    pub fn default_reshard_after_forward(&self) -> ReshardAfterForward {
        match self {
            ShardingStrategy::FullShard | ShardingStrategy::HybridShard => ReshardAfterForward::Always,
            _ => ReshardAfterForward::Never,
        }
    }
}

/// What happens to the unsharded parameters after a unit's forward.
///
/// Serialized as `true`, `false` or the post-forward world size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "ReshardRepr", into = "ReshardRepr")]
pub enum ReshardAfterForward {
    /// Free the full parameters, backward gathers them again.
    Always,
    /// Keep the full parameters until backward.
    Never,
    /// Keep a shard for a smaller group of this many ranks, so that the
    /// backward all-gather only spans that group.
    ToWorldSize(usize),
}

impl ReshardAfterForward {
    /// Checks the policy against the shard group size.
    pub fn validate(&self, shard_world_size: usize) -> Result<()> {
        match self {
            ReshardAfterForward::ToWorldSize(n)
                if *n == 0 || *n > shard_world_size || shard_world_size % n != 0 =>
            {
                Err(DistError::Configuration(format!(
                    "reshard_after_forward={n} must divide the shard world size {shard_world_size}"
                )))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ReshardRepr {
    Flag(bool),
    WorldSize(usize),
}

impl From<ReshardRepr> for ReshardAfterForward {
    fn from(repr: ReshardRepr) -> Self {
        match repr {
            ReshardRepr::Flag(true) => ReshardAfterForward::Always,
            ReshardRepr::Flag(false) => ReshardAfterForward::Never,
            ReshardRepr::WorldSize(n) => ReshardAfterForward::ToWorldSize(n),
        }
    }
}

impl From<ReshardAfterForward> for ReshardRepr {
    fn from(value: ReshardAfterForward) -> Self {
        match value {
            ReshardAfterForward::Always => ReshardRepr::Flag(true),
            ReshardAfterForward::Never => ReshardRepr::Flag(false),
            ReshardAfterForward::ToWorldSize(n) => ReshardRepr::WorldSize(n),
        }
    }
}

impl From<bool> for ReshardAfterForward {
    fn from(value: bool) -> Self {
        ReshardRepr::Flag(value).into()
    }
}

/// Floating point precision of parameters, gradients or outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Precision {
    /// 16-bit brain float.
    Bf16,
    /// 16-bit float.
    F16,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
}

impl Precision {
    /// The matching candle dtype.
    pub fn dtype(&self) -> DType {
        match self {
            Precision::Bf16 => DType::BF16,
            Precision::F16 => DType::F16,
            Precision::F32 => DType::F32,
            Precision::F64 => DType::F64,
        }
    }
}

/// Mixed precision policy of a unit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixedPrecision {
    /// Dtype parameters are all-gathered and computed in.
    pub param_dtype: Option<Precision>,
    /// Dtype gradients are reduced in, `param_dtype` when unset.
    pub reduce_dtype: Option<Precision>,
    /// Dtype forward outputs are cast to.
    pub output_dtype: Option<Precision>,
    /// Whether floating point forward inputs are cast to `param_dtype`.
    pub cast_forward_inputs: bool,
}

impl MixedPrecision {
    pub(crate) fn param_dtype(&self) -> Option<DType> {
        self.param_dtype.map(|p| p.dtype())
    }

    pub(crate) fn reduce_dtype(&self) -> Option<DType> {
        self.reduce_dtype.or(self.param_dtype).map(|p| p.dtype())
    }
}

/// CPU offload policy of a unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuOffload {
    /// Whether sharded parameters and gradients live on the CPU between uses.
    pub offload_params: bool,
}

/// When backward prefetches the next all-gather.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum BackwardPrefetch {
    /// Before the current unit's gradient computation.
    #[default]
    BackwardPre,
    /// After the current unit's gradient computation.
    BackwardPost,
}

/// Per-unit FSDP configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsdpConfig {
    /// Sharding strategy.
    pub sharding_strategy: ShardingStrategy,
    /// Reshard policy after forward, derived from the strategy when unset.
    pub reshard_after_forward: Option<ReshardAfterForward>,
    /// Mixed precision policy.
    pub mixed_precision: MixedPrecision,
    /// CPU offload policy.
    pub cpu_offload: CpuOffload,
    /// Backward prefetch policy, `None` disables it.
    pub backward_prefetch: Option<BackwardPrefetch>,
    /// Whether forward prefetches the next unit in execution order.
    pub forward_prefetch: bool,
    /// Whether parameters are broadcast from rank 0 before sharding.
    pub sync_module_states: bool,
    /// Whether parameters are exposed as distributed tensors with their original shapes.
    pub use_orig_params: bool,
    /// Whether at most one prefetched all-gather may be in flight.
    pub limit_all_gathers: bool,
}

impl Default for FsdpConfig {
    fn default() -> Self {
        Self {
            sharding_strategy: ShardingStrategy::FullShard,
            reshard_after_forward: None,
            mixed_precision: MixedPrecision::default(),
            cpu_offload: CpuOffload::default(),
            backward_prefetch: Some(BackwardPrefetch::BackwardPre),
            forward_prefetch: false,
            sync_module_states: false,
            use_orig_params: true,
            limit_all_gathers: true,
        }
    }
}

impl FsdpConfig {
    /// Sets the sharding strategy.
    pub fn with_sharding_strategy(mut self, strategy: ShardingStrategy) -> Self {
        self.sharding_strategy = strategy;
        self
    }

    /// Sets the reshard policy after forward.
    pub fn with_reshard_after_forward(mut self, value: impl Into<ReshardAfterForward>) -> Self {
        self.reshard_after_forward = Some(value.into());
        self
    }

    /// Sets the mixed precision policy.
    pub fn with_mixed_precision(mut self, mixed_precision: MixedPrecision) -> Self {
        self.mixed_precision = mixed_precision;
        self
    }

    /// Sets the CPU offload policy.
    pub fn with_cpu_offload(mut self, cpu_offload: CpuOffload) -> Self {
        self.cpu_offload = cpu_offload;
        self
    }

    /// Sets the backward prefetch policy.
    pub fn with_backward_prefetch(mut self, prefetch: Option<BackwardPrefetch>) -> Self {
        self.backward_prefetch = prefetch;
        self
    }

    /// Enables forward prefetch.
    pub fn with_forward_prefetch(mut self, enabled: bool) -> Self {
        self.forward_prefetch = enabled;
        self
    }

    /// Enables broadcasting rank 0's parameters before sharding.
    pub fn with_sync_module_states(mut self, enabled: bool) -> Self {
        self.sync_module_states = enabled;
        self
    }

    /// Chooses between distributed tensor and flat parameter views.
    pub fn with_use_orig_params(mut self, enabled: bool) -> Self {
        self.use_orig_params = enabled;
        self
    }

    /// Limits in-flight prefetched all-gathers to one.
    pub fn with_limit_all_gathers(mut self, enabled: bool) -> Self {
        self.limit_all_gathers = enabled;
        self
    }

    /// The effective reshard policy after forward.
    pub fn resolved_reshard_after_forward(&self) -> ReshardAfterForward {
        self.reshard_after_forward
            .unwrap_or_else(|| self.sharding_strategy.default_reshard_after_forward())
    }

    /// Writes the configuration as pretty JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Reads a configuration written by [`FsdpConfig::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

/// Everything `fully_shard` needs besides the module.
#[derive(Clone, Default)]
pub struct FullyShardOptions {
    /// Unit configuration.
    pub config: FsdpConfig,
    /// Mesh to shard over, the model's mesh when unset.
    pub mesh: Option<Arc<DeviceMesh>>,
    /// Explicit shard group, turned into a 1-D mesh.
    pub process_group: Option<Arc<dyn ProcessGroup>>,
    /// Auto-wrap policy for descendants.
    pub policy: Option<Arc<dyn WrapPolicy>>,
    /// Modules whose parameters stay unmanaged.
    pub ignored_modules: Vec<ModuleId>,
    /// Compute device, the CPU when unset.
    pub device: Option<Device>,
}

impl FullyShardOptions {
    /// Options with `config`.
    pub fn new(config: FsdpConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Shards over `mesh`.
    pub fn with_mesh(mut self, mesh: Arc<DeviceMesh>) -> Self {
        self.mesh = Some(mesh);
        self
    }

    /// Shards over `group`.
    pub fn with_process_group(mut self, group: Arc<dyn ProcessGroup>) -> Self {
        self.process_group = Some(group);
        self
    }

    /// Wraps descendants selected by `policy` first.
    pub fn with_policy(mut self, policy: Arc<dyn WrapPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Leaves the parameters of `modules` unmanaged.
    pub fn with_ignored_modules(mut self, modules: Vec<ModuleId>) -> Self {
        self.ignored_modules = modules;
        self
    }

    /// Computes on `device`.
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }
}

impl std::fmt::Debug for FullyShardOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FullyShardOptions")
            .field("config", &self.config)
            .field("mesh", &self.mesh)
            .field("process_group", &self.process_group)
            .field("policy", &self.policy)
            .field("ignored_modules", &self.ignored_modules)
            .field("device", &self.device)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("true", ReshardAfterForward::Always)]
    #[case("false", ReshardAfterForward::Never)]
    #[case("2", ReshardAfterForward::ToWorldSize(2))]
    fn test_reshard_after_forward_untagged(#[case] json: &str, #[case] expected: ReshardAfterForward) {
        let parsed: ReshardAfterForward = serde_json::from_str(json).unwrap();

        assert_eq!(parsed, expected);
        assert_eq!(serde_json::to_string(&parsed).unwrap(), json);
    }

    #[test]
    fn test_reshard_after_forward_validation() {
        assert!(ReshardAfterForward::ToWorldSize(2).validate(4).is_ok());
        assert!(ReshardAfterForward::ToWorldSize(3).validate(4).is_err());
        assert!(ReshardAfterForward::ToWorldSize(0).validate(4).is_err());
        assert!(ReshardAfterForward::Always.validate(1).is_ok());
    }

    #[test]
    fn test_strategy_defaults() {
        let config = FsdpConfig::default();

        assert_eq!(config.resolved_reshard_after_forward(), ReshardAfterForward::Always);
        assert_eq!(
            config
                .with_sharding_strategy(ShardingStrategy::ShardGradOp)
                .resolved_reshard_after_forward(),
            ReshardAfterForward::Never
        );
        assert_eq!(ShardingStrategy::HybridShard.to_string(), "HybridShard");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: FsdpConfig = serde_json::from_str(
            r#"{"sharding_strategy": "hybrid_shard", "reshard_after_forward": 2,
                "mixed_precision": {"param_dtype": "bf16"}}"#,
        )
        .unwrap();

        assert_eq!(config.sharding_strategy, ShardingStrategy::HybridShard);
        assert_eq!(config.reshard_after_forward, Some(ReshardAfterForward::ToWorldSize(2)));
        assert_eq!(config.mixed_precision.param_dtype(), Some(DType::BF16));
        assert_eq!(config.mixed_precision.reduce_dtype(), Some(DType::BF16));
        assert!(config.use_orig_params);
        assert_eq!(config.backward_prefetch, Some(BackwardPrefetch::BackwardPre));
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fsdp.json");
        let config = FsdpConfig::default()
            .with_reshard_after_forward(false)
            .with_cpu_offload(CpuOffload { offload_params: true })
            .with_forward_prefetch(true);

        config.save(&path).unwrap();

        assert_eq!(FsdpConfig::load(&path).unwrap(), config);
    }
}
