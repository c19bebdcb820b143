use candle_core::Tensor;
use derive_new::new;

use crate::{DistError, Result};

/// Index of a module inside a [`ModuleTree`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(usize);

impl ModuleId {
    /// Position of the module in creation order.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// A named trainable tensor of a module.
#[derive(new, Clone, Debug)]
pub struct Parameter {
    /// Name local to the owning module.
    pub name: String,
    /// Current value.
    pub data: Tensor,
    /// Whether the parameter receives gradients.
    #[new(value = "true")]
    pub requires_grad: bool,
    /// Gradient of parameters not managed by FSDP.
    #[new(default)]
    pub grad: Option<Tensor>,
}

#[derive(Debug)]
struct ModuleNode {
    name: String,
    kind: String,
    parent: Option<ModuleId>,
    children: Vec<ModuleId>,
    params: Vec<Parameter>,
    buffers: Vec<(String, Tensor)>,
}

/// Arena of modules forming a tree, each with its own parameters and buffers.
///
/// Fully qualified names join the module names from the root down, the root
/// itself contributing nothing: a parameter `weight` of child `fc1` is `fc1.weight`.
#[derive(Debug)]
pub struct ModuleTree {
    nodes: Vec<ModuleNode>,
}

impl ModuleTree {
    /// A tree with a single root module of kind `kind`.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            nodes: vec![ModuleNode {
                name: String::new(),
                kind: kind.into(),
                parent: None,
                children: Vec::new(),
                params: Vec::new(),
                buffers: Vec::new(),
            }],
        }
    }

    /// The root module.
    pub fn root(&self) -> ModuleId {
        ModuleId(0)
    }

    /// Number of modules.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false, the root exists from construction.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn node(&self, id: ModuleId) -> Result<&ModuleNode> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| DistError::Configuration(format!("unknown module {id:?}")))
    }

    fn node_mut(&mut self, id: ModuleId) -> Result<&mut ModuleNode> {
        self.nodes
            .get_mut(id.0)
            .ok_or_else(|| DistError::Configuration(format!("unknown module {id:?}")))
    }

    /// Adds a child called `name` of kind `kind` under `parent`.
    pub fn add_child(
        &mut self,
        parent: ModuleId,
        name: impl Into<String>,
        kind: impl Into<String>,
    ) -> Result<ModuleId> {
        let name = name.into();
        if name.is_empty() || name.contains('.') {
            return Err(DistError::Configuration(format!(
                "invalid module name {name:?}"
            )));
        }
        let node = self.node(parent)?;
        if node
            .children
            .iter()
            .any(|child| self.nodes[child.0].name == name)
        {
            return Err(DistError::Configuration(format!(
                "module {:?} already has a child named {name}",
                self.fqn(parent)?
            )));
        }

        let id = ModuleId(self.nodes.len());
        self.nodes.push(ModuleNode {
            name,
            kind: kind.into(),
            parent: Some(parent),
            children: Vec::new(),
            params: Vec::new(),
            buffers: Vec::new(),
        });
        self.node_mut(parent)?.children.push(id);
        Ok(id)
    }

    /// Registers parameter `name` on `module`.
    pub fn add_parameter(&mut self, module: ModuleId, name: impl Into<String>, data: Tensor) -> Result<()> {
        self.push_parameter(module, Parameter::new(name.into(), data))
    }

    /// Registers a parameter excluded from gradient computation.
    pub fn add_frozen_parameter(
        &mut self,
        module: ModuleId,
        name: impl Into<String>,
        data: Tensor,
    ) -> Result<()> {
        let mut param = Parameter::new(name.into(), data);
        param.requires_grad = false;
        self.push_parameter(module, param)
    }

    fn push_parameter(&mut self, module: ModuleId, param: Parameter) -> Result<()> {
        if param.data.rank() == 0 {
            return Err(DistError::Configuration(format!(
                "parameter {} is a scalar, FSDP shards along dim 0",
                param.name
            )));
        }
        let node = self.node_mut(module)?;
        if node.params.iter().any(|p| p.name == param.name) {
            return Err(DistError::Configuration(format!(
                "parameter {} is registered twice",
                param.name
            )));
        }
        node.params.push(param);
        Ok(())
    }

    /// Registers buffer `name` on `module`.
    pub fn add_buffer(&mut self, module: ModuleId, name: impl Into<String>, data: Tensor) -> Result<()> {
        let name = name.into();
        let node = self.node_mut(module)?;
        if node.buffers.iter().any(|(n, _)| *n == name) {
            return Err(DistError::Configuration(format!("buffer {name} is registered twice")));
        }
        node.buffers.push((name, data));
        Ok(())
    }

    /// Children of `module` in insertion order.
    pub fn children(&self, module: ModuleId) -> &[ModuleId] {
        self.nodes
            .get(module.0)
            .map(|n| n.children.as_slice())
            .unwrap_or_default()
    }

    /// Parent of `module`, `None` for the root.
    pub fn parent(&self, module: ModuleId) -> Option<ModuleId> {
        self.nodes.get(module.0).and_then(|n| n.parent)
    }

    /// Kind of `module`, such as `Linear`.
    pub fn kind(&self, module: ModuleId) -> Result<&str> {
        Ok(&self.node(module)?.kind)
    }

    /// Local name of `module`.
    pub fn name(&self, module: ModuleId) -> Result<&str> {
        Ok(&self.node(module)?.name)
    }

    /// Own parameters of `module`.
    pub fn parameters(&self, module: ModuleId) -> Result<&[Parameter]> {
        Ok(&self.node(module)?.params)
    }

    /// Mutable own parameters of `module`.
    pub fn parameters_mut(&mut self, module: ModuleId) -> Result<&mut [Parameter]> {
        Ok(&mut self.node_mut(module)?.params)
    }

    /// Removes and returns the own parameters of `module`.
    pub fn take_parameters(&mut self, module: ModuleId) -> Result<Vec<Parameter>> {
        Ok(std::mem::take(&mut self.node_mut(module)?.params))
    }

    /// Own buffers of `module`.
    pub fn buffers(&self, module: ModuleId) -> Result<&[(String, Tensor)]> {
        Ok(&self.node(module)?.buffers)
    }

    /// Replaces the value of buffer `name` of `module`.
    pub fn set_buffer(&mut self, module: ModuleId, name: &str, data: Tensor) -> Result<()> {
        let node = self.node_mut(module)?;
        let slot = node
            .buffers
            .iter_mut()
            .find(|(n, _)| n == name)
            .ok_or_else(|| DistError::Configuration(format!("unknown buffer {name}")))?;
        slot.1 = data;
        Ok(())
    }

    /// Whether `ancestor` is `module` or one of its ancestors.
    pub fn is_ancestor(&self, ancestor: ModuleId, module: ModuleId) -> bool {
        let mut current = Some(module);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.parent(id);
        }
        false
    }

    /// Fully qualified name of `module`, empty for the root.
    pub fn fqn(&self, module: ModuleId) -> Result<String> {
        let mut names = Vec::new();
        let mut current = Some(module);
        while let Some(id) = current {
            let node = self.node(id)?;
            if node.parent.is_some() {
                names.push(node.name.as_str());
            }
            current = node.parent;
        }
        names.reverse();
        Ok(names.join("."))
    }

    /// Joins a module name prefix with a local name.
    pub fn join(prefix: &str, name: &str) -> String {
        match prefix.is_empty() {
            true => name.to_string(),
            false => format!("{prefix}.{name}"),
        }
    }

    /// `module` and its descendants in pre-order.
    pub fn descendants(&self, module: ModuleId) -> Vec<ModuleId> {
        let mut order = Vec::new();
        let mut stack = vec![module];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.children(id).iter().rev());
        }
        order
    }

    /// `module` and its descendants in post-order, children before parents.
    pub fn post_order(&self, module: ModuleId) -> Vec<ModuleId> {
        let mut order = self.descendants(module);
        order.reverse();
        order
    }

    /// Every module with its fully qualified name, in pre-order.
    pub fn named_modules(&self) -> Result<Vec<(String, ModuleId)>> {
        self.descendants(self.root())
            .into_iter()
            .map(|id| Ok((self.fqn(id)?, id)))
            .collect()
    }

    /// Every parameter under `module` with its fully qualified name.
    pub fn named_parameters(&self, module: ModuleId) -> Result<Vec<(String, &Parameter)>> {
        let mut named = Vec::new();
        for id in self.descendants(module) {
            let prefix = self.fqn(id)?;
            for param in &self.node(id)?.params {
                named.push((Self::join(&prefix, &param.name), param));
            }
        }
        Ok(named)
    }

    /// Module with fully qualified name `fqn`.
    pub fn find(&self, fqn: &str) -> Option<ModuleId> {
        let mut current = self.root();
        if fqn.is_empty() {
            return Some(current);
        }
        for part in fqn.split('.') {
            current = *self
                .children(current)
                .iter()
                .find(|child| self.nodes[child.0].name == part)?;
        }
        Some(current)
    }

    /// Resolves a parameter's fully qualified name to its module and position.
    pub fn find_parameter(&self, fqn: &str) -> Option<(ModuleId, usize)> {
        let (prefix, name) = match fqn.rsplit_once('.') {
            Some((prefix, name)) => (prefix, name),
            None => ("", fqn),
        };
        let module = self.find(prefix)?;
        let index = self.nodes[module.0].params.iter().position(|p| p.name == name)?;
        Some((module, index))
    }

    /// Number of parameter elements owned directly by `module`.
    pub fn numel(&self, module: ModuleId) -> usize {
        self.nodes
            .get(module.0)
            .map(|n| n.params.iter().map(|p| p.data.elem_count()).sum())
            .unwrap_or(0)
    }
}
