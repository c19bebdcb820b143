use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use strum::Display;

use super::ModuleId;

/// Points of a unit's lifecycle at which hooks fire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum HookKind {
    /// Before a unit's forward computation.
    PreForward,
    /// After a unit's forward computation.
    PostForward,
    /// Before a unit's gradient computation.
    PreBackward,
    /// After a unit's gradient computation.
    PostBackward,
}

/// Callback invoked with the hook kind and the unit's module.
pub type HookFn = Arc<dyn Fn(HookKind, ModuleId) + Send + Sync>;

struct HookEntry {
    id: u64,
    kind: HookKind,
    module: Option<ModuleId>,
    hook: HookFn,
}

#[derive(Default)]
struct HookTable {
    next_id: u64,
    entries: Vec<HookEntry>,
}

/// Hooks registered on a model, fired in registration order.
#[derive(Clone, Default)]
pub struct HookRegistry {
    table: Arc<Mutex<HookTable>>,
}

impl HookRegistry {
    /// Registers `hook` for `kind`, on every unit or only on `module`.
    ///
    /// The hook stays registered until the returned handle is dropped.
    #[must_use = "the hook is removed when the handle is dropped"]
    pub fn register(&self, kind: HookKind, module: Option<ModuleId>, hook: HookFn) -> HookHandle {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let id = table.next_id;
        table.next_id += 1;
        table.entries.push(HookEntry {
            id,
            kind,
            module,
            hook,
        });
        HookHandle {
            id,
            table: Arc::downgrade(&self.table),
        }
    }

    /// Number of registered hooks.
    pub fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    /// Whether no hook is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls every hook registered for `kind` on `module`.
    pub fn fire(&self, kind: HookKind, module: ModuleId) {
        // Hooks may register or drop hooks themselves.
        let hooks: Vec<HookFn> = {
            let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table
                .entries
                .iter()
                .filter(|e| e.kind == kind && e.module.is_none_or(|m| m == module))
                .map(|e| e.hook.clone())
                .collect()
        };
        for hook in hooks {
            hook(kind, module);
        }
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry").field("len", &self.len()).finish()
    }
}

/// Removes its hook from the registry when dropped.
#[derive(Debug)]
pub struct HookHandle {
    id: u64,
    table: Weak<Mutex<HookTable>>,
}

impl HookHandle {
    /// Removes the hook now.
    pub fn remove(self) {}
}

impl Drop for HookHandle {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            let mut table = table.lock().unwrap_or_else(|e| e.into_inner());
            table.entries.retain(|e| e.id != self.id);
        }
    }
}
