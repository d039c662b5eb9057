//! Process-wide table of operator implementation bundles.

use crate::op_impl::OpImplFunctions;
use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::collections::HashMap;
use std::sync::OnceLock;
use tessera_core::PrivateAttr;

/// Maps operator type names to their implementation bundles.
///
/// Registrations made by static initialisers go to [`OpImplRegistry::global`].
/// Independent instances can be created with [`OpImplRegistry::new`] for
/// isolated lookups.
///
/// Guards returned by [`create_or_get`](Self::create_or_get) and
/// [`get`](Self::get) hold the registry lock; drop them before calling back
/// into the same registry.
pub struct OpImplRegistry {
    types_to_impl: RwLock<HashMap<String, OpImplFunctions>>,
}

impl OpImplRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            types_to_impl: RwLock::new(HashMap::new()),
        }
    }

    /// The registry populated by this process's own registrations.
    pub fn global() -> &'static OpImplRegistry {
        static GLOBAL: OnceLock<OpImplRegistry> = OnceLock::new();
        GLOBAL.get_or_init(OpImplRegistry::new)
    }

    /// The bundle for `op_type`, created empty if absent.
    pub fn create_or_get(&self, op_type: &str) -> MappedRwLockWriteGuard<'_, OpImplFunctions> {
        RwLockWriteGuard::map(self.types_to_impl.write(), |types| {
            types.entry(op_type.to_string()).or_default()
        })
    }

    /// The bundle for `op_type`, if registered.
    pub fn get(&self, op_type: &str) -> Option<MappedRwLockReadGuard<'_, OpImplFunctions>> {
        RwLockReadGuard::try_map(self.types_to_impl.read(), |types| types.get(op_type)).ok()
    }

    /// Private attributes of `op_type`; empty when unregistered.
    pub fn private_attrs(&self, op_type: &str) -> Vec<PrivateAttr> {
        self.get(op_type)
            .map(|funcs| funcs.private_attrs().to_vec())
            .unwrap_or_default()
    }

    pub fn contains(&self, op_type: &str) -> bool {
        self.types_to_impl.read().contains_key(op_type)
    }

    pub fn len(&self) -> usize {
        self.types_to_impl.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.types_to_impl.read().is_empty()
    }

    /// Registered operator types, sorted.
    pub fn op_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.types_to_impl.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// A copy of every registered bundle.
    pub fn snapshot(&self) -> HashMap<String, OpImplFunctions> {
        self.types_to_impl.read().clone()
    }

    pub fn clear(&self) {
        self.types_to_impl.write().clear();
    }
}

impl Default for OpImplRegistry {
    fn default() -> Self {
        Self::new()
    }
}
