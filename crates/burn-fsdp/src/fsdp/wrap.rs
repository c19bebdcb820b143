use std::fmt;
use std::sync::Arc;

use derive_new::new;
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};

use super::{ModuleId, ModuleTree};
use crate::{DistError, Result};

/// Decides which descendants of a sharded module become their own FSDP unit.
pub trait WrapPolicy: Send + Sync + fmt::Debug {
    /// Whether `module` is wrapped, given the parameter elements in its subtree
    /// not already claimed by a wrapped descendant.
    fn should_wrap(&self, tree: &ModuleTree, module: ModuleId, unwrapped_numel: usize) -> bool;

    /// Rejects malformed policies before any wrapping happens.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Wraps every module whose kind is listed.
#[derive(Clone, Debug)]
pub struct ModuleKindPolicy {
    kinds: HashSet<String>,
}

impl ModuleKindPolicy {
    /// Wraps modules of these kinds.
    pub fn new<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kinds: kinds.into_iter().map(Into::into).collect(),
        }
    }
}

impl WrapPolicy for ModuleKindPolicy {
    fn should_wrap(&self, tree: &ModuleTree, module: ModuleId, _unwrapped_numel: usize) -> bool {
        tree.kind(module)
            .map(|kind| self.kinds.contains(kind))
            .unwrap_or(false)
    }

    fn validate(&self) -> Result<()> {
        if self.kinds.is_empty() {
            return Err(DistError::InvalidPolicy(
                "module kind policy without any module kind".to_string(),
            ));
        }
        Ok(())
    }
}

/// Wraps a module once its unwrapped subtree holds at least `min_num_params` elements.
#[derive(new, Clone, Copy, Debug)]
pub struct SizeBasedPolicy {
    min_num_params: usize,
}

impl WrapPolicy for SizeBasedPolicy {
    fn should_wrap(&self, _tree: &ModuleTree, _module: ModuleId, unwrapped_numel: usize) -> bool {
        unwrapped_numel >= self.min_num_params
    }

    fn validate(&self) -> Result<()> {
        if self.min_num_params == 0 {
            return Err(DistError::InvalidPolicy(
                "size based policy needs min_num_params > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Wraps every descendant.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysWrap;

impl WrapPolicy for AlwaysWrap {
    fn should_wrap(&self, _tree: &ModuleTree, _module: ModuleId, _unwrapped_numel: usize) -> bool {
        true
    }
}

type WrapFn = dyn Fn(&ModuleTree, ModuleId, usize) -> bool + Send + Sync;

/// Wraps modules selected by an arbitrary function.
#[derive(Clone)]
pub struct CustomPolicy {
    lambda: Arc<WrapFn>,
}

impl CustomPolicy {
    /// Wraps modules for which `lambda` returns true.
    pub fn new<F>(lambda: F) -> Self
    where
        F: Fn(&ModuleTree, ModuleId, usize) -> bool + Send + Sync + 'static,
    {
        Self {
            lambda: Arc::new(lambda),
        }
    }
}

impl fmt::Debug for CustomPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomPolicy")
    }
}

impl WrapPolicy for CustomPolicy {
    fn should_wrap(&self, tree: &ModuleTree, module: ModuleId, unwrapped_numel: usize) -> bool {
        (self.lambda)(tree, module, unwrapped_numel)
    }
}

/// Serializable description of a built-in wrap policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum WrapPolicyConfig {
    /// See [`ModuleKindPolicy`].
    ModuleKinds {
        /// Module kinds to wrap.
        kinds: Vec<String>,
    },
    /// See [`SizeBasedPolicy`].
    SizeBased {
        /// Minimum unwrapped parameter elements.
        min_num_params: usize,
    },
    /// See [`AlwaysWrap`].
    Always,
}

impl WrapPolicyConfig {
    /// Parses a policy, reporting any malformed or unknown policy as invalid.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|err| DistError::InvalidPolicy(err.to_string()))
    }

    /// Builds and validates the policy.
    pub fn into_policy(self) -> Result<Arc<dyn WrapPolicy>> {
        let policy: Arc<dyn WrapPolicy> = match self {
            WrapPolicyConfig::ModuleKinds { kinds } => Arc::new(ModuleKindPolicy::new(kinds)),
            WrapPolicyConfig::SizeBased { min_num_params } => {
                Arc::new(SizeBasedPolicy::new(min_num_params))
            }
            WrapPolicyConfig::Always => Arc::new(AlwaysWrap),
        };
        policy.validate()?;
        Ok(policy)
    }
}

/// Descendants of `root` to wrap, children before parents.
///
/// `root` itself is never part of the plan. Ignored subtrees and modules in
/// `wrapped` contribute no unwrapped parameters to their ancestors.
pub(crate) fn plan_wrapping(
    tree: &ModuleTree,
    root: ModuleId,
    policy: &dyn WrapPolicy,
    ignored: &HashSet<ModuleId>,
    wrapped: &HashSet<ModuleId>,
) -> Vec<ModuleId> {
    let mut remaining: HashMap<ModuleId, usize> = HashMap::new();
    let mut plan = Vec::new();

    for module in tree.post_order(root) {
        if ignored.contains(&module) {
            remaining.insert(module, 0);
            continue;
        }
        let numel = tree.numel(module)
            + tree
                .children(module)
                .iter()
                .map(|child| remaining.get(child).copied().unwrap_or(0))
                .sum::<usize>();

        if module != root && !wrapped.contains(&module) && policy.should_wrap(tree, module, numel) {
            plan.push(module);
            remaining.insert(module, 0);
        } else if wrapped.contains(&module) {
            remaining.insert(module, 0);
        } else {
            remaining.insert(module, numel);
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};

    fn tree() -> (ModuleTree, Vec<ModuleId>) {
        let mut tree = ModuleTree::new("Transformer");
        let root = tree.root();
        let mut blocks = Vec::new();
        for i in 0..2 {
            let block = tree.add_child(root, format!("block{i}"), "Block").unwrap();
            let attn = tree.add_child(block, "attn", "Linear").unwrap();
            let mlp = tree.add_child(block, "mlp", "Linear").unwrap();
            let zeros = |n: usize| Tensor::zeros((n, 10), DType::F32, &Device::Cpu).unwrap();
            tree.add_parameter(attn, "weight", zeros(10)).unwrap();
            tree.add_parameter(mlp, "weight", zeros(40)).unwrap();
            blocks.extend([block, attn, mlp]);
        }
        let head = tree.add_child(root, "head", "Linear").unwrap();
        tree.add_parameter(
            head,
            "weight",
            Tensor::zeros((5, 10), DType::F32, &Device::Cpu).unwrap(),
        )
        .unwrap();
        blocks.push(head);
        (tree, blocks)
    }

    #[test]
    fn test_module_kind_policy_wraps_matching_blocks() {
        let (tree, modules) = tree();
        let policy = ModuleKindPolicy::new(["Block"]);

        let plan = plan_wrapping(&tree, tree.root(), &policy, &HashSet::new(), &HashSet::new());

        assert_eq!(plan, vec![modules[3], modules[0]]);
    }

    #[test]
    fn test_size_policy_counts_only_unwrapped_params() {
        let (tree, modules) = tree();
        let policy = SizeBasedPolicy::new(300);

        let plan = plan_wrapping(&tree, tree.root(), &policy, &HashSet::new(), &HashSet::new());

        // Each mlp (400) is wrapped, leaving its block with only the attn (100).
        assert_eq!(plan, vec![modules[5], modules[2]]);
    }

    #[test]
    fn test_ignored_subtree_is_skipped() {
        let (tree, modules) = tree();
        let ignored: HashSet<ModuleId> = tree.descendants(modules[0]).into_iter().collect();

        let plan = plan_wrapping(&tree, tree.root(), &AlwaysWrap, &ignored, &HashSet::new());

        assert!(plan.iter().all(|m| !ignored.contains(m)));
        assert!(!plan.contains(&tree.root()));
        assert_eq!(plan.len(), 4);
    }

    #[test]
    fn test_policy_config_parsing() {
        let policy = WrapPolicyConfig::from_json(r#"{"type": "size_based", "min_num_params": 5}"#)
            .unwrap();
        assert_eq!(policy, WrapPolicyConfig::SizeBased { min_num_params: 5 });
        assert!(policy.into_policy().is_ok());

        let unknown = WrapPolicyConfig::from_json(r#"{"type": "transformer_auto_wrap"}"#);
        assert!(matches!(unknown, Err(DistError::InvalidPolicy(_))));

        let empty = WrapPolicyConfig::ModuleKinds { kinds: vec![] }.into_policy();
        assert!(matches!(empty, Err(DistError::InvalidPolicy(_))));
    }

    #[test]
    fn test_custom_policy() {
        let (tree, modules) = tree();
        let policy = CustomPolicy::new(|tree, module, _| tree.name(module).is_ok_and(|name| name == "head"));

        let plan = plan_wrapping(&tree, tree.root(), &policy, &HashSet::new(), &HashSet::new());

        assert_eq!(plan, vec![modules[6]]);
    }
}
