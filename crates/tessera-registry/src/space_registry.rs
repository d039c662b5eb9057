//! Ordered lookup over several holders.
//!
//! A space registry is what graph passes consult. It lists holders in the
//! order they were added; a lookup returns the first holder that knows the
//! op type, so a later library cannot override an earlier one.

use crate::holder::{OpImplRegistryHolder, OppSoBlob, SoInfo};
use crate::holder_manager::OpImplRegistryHolderManager;
use crate::op_impl::OpImplFunctions;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::fmt;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;
use tessera_core::PrivateAttr;

/// A looked-up bundle that keeps its holder, and so its library, alive.
#[derive(Clone)]
pub struct OpImplHandle {
    funcs: Arc<OpImplFunctions>,
    holder: Arc<OpImplRegistryHolder>,
}

impl OpImplHandle {
    pub fn holder(&self) -> &Arc<OpImplRegistryHolder> {
        &self.holder
    }
}

impl Deref for OpImplHandle {
    type Target = OpImplFunctions;

    fn deref(&self) -> &Self::Target {
        &self.funcs
    }
}

impl fmt::Debug for OpImplHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpImplHandle")
            .field("origin", self.holder.origin())
            .field("funcs", &self.funcs)
            .finish()
    }
}

/// Holders in lookup order.
#[derive(Default)]
pub struct SpaceRegistry {
    holders: RwLock<Vec<Arc<OpImplRegistryHolder>>>,
}

impl SpaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A space registry holding a copy of the process-wide registrations.
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.add_registry(Arc::new(OpImplRegistryHolder::builtin()));
        registry
    }

    /// Append `holder`. Returns `false` if this exact holder is already
    /// present.
    pub fn add_registry(&self, holder: Arc<OpImplRegistryHolder>) -> bool {
        let mut holders = self.holders.write();
        if holders.iter().any(|existing| Arc::ptr_eq(existing, &holder)) {
            return false;
        }
        tracing::debug!(origin = ?holder.origin(), op_types = holder.len(), "adding holder");
        holders.push(holder);
        true
    }

    /// The bundle for `op_type` from the first holder that has one.
    pub fn get_op_impl(&self, op_type: &str) -> Option<OpImplHandle> {
        self.holders.read().iter().find_map(|holder| {
            holder.shared_op_impl(op_type).map(|funcs| OpImplHandle {
                funcs,
                holder: Arc::clone(holder),
            })
        })
    }

    /// Private attributes of `op_type`; empty when no holder has it.
    pub fn private_attrs(&self, op_type: &str) -> Vec<PrivateAttr> {
        self.get_op_impl(op_type)
            .map(|funcs| funcs.private_attrs().to_vec())
            .unwrap_or_default()
    }

    /// Whether a holder loaded from the shared object `name` is present.
    pub fn contains_so(&self, name: &str) -> bool {
        self.holders
            .read()
            .iter()
            .any(|holder| holder.so_name() == Some(name))
    }

    pub fn holders(&self) -> Vec<Arc<OpImplRegistryHolder>> {
        self.holders.read().clone()
    }

    pub fn len(&self) -> usize {
        self.holders.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.read().is_empty()
    }

    /// Load each blob through the process-wide manager and add it.
    pub fn get_or_create_registry(&self, blobs: &[OppSoBlob], so_info: &SoInfo) -> Result<()> {
        self.get_or_create_registry_with(OpImplRegistryHolderManager::global(), blobs, so_info)
    }

    /// Load each blob through `manager` and add it. Blobs already present in
    /// this registry by name are skipped, so repeating a call is a no-op.
    ///
    /// Stops at the first blob that fails to load; blobs before it stay added.
    #[tracing::instrument(skip_all, fields(blobs = blobs.len()))]
    pub fn get_or_create_registry_with(
        &self,
        manager: &OpImplRegistryHolderManager,
        blobs: &[OppSoBlob],
        so_info: &SoInfo,
    ) -> Result<()> {
        for blob in blobs {
            if self.contains_so(&blob.name) {
                tracing::trace!(name = %blob.name, "already in space registry");
                continue;
            }
            let holder = manager.get_or_create_holder(blob, so_info)?;
            self.add_registry(holder);
        }
        Ok(())
    }

    /// Load the shared object at `path` into the default space registry,
    /// creating that registry if unset.
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyLoaded` if `path` was loaded this way before.
    pub fn load_so_and_save_to_registry(path: &Path) -> Result<()> {
        Self::load_so_and_save_to_registry_with(OpImplRegistryHolderManager::global(), path)
    }

    pub fn load_so_and_save_to_registry_with(
        manager: &OpImplRegistryHolderManager,
        path: &Path,
    ) -> Result<()> {
        let registry = DefaultSpaceRegistry::get_or_init();
        let name = path.display().to_string();
        if registry.contains_so(&name) {
            return Err(Error::AlreadyLoaded(name));
        }
        let blob = OppSoBlob::from_path(path)?;
        let holder = manager.get_or_create_holder(&blob, &SoInfo::default())?;
        registry.add_registry(holder);
        tracing::info!(%name, "loaded shared object into default space registry");
        Ok(())
    }
}

impl fmt::Debug for SpaceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.holders.read().iter()).finish()
    }
}

static DEFAULT_SPACE_REGISTRY: RwLock<Option<Arc<SpaceRegistry>>> = RwLock::new(None);

/// The space registry used when callers do not pass one explicitly.
pub struct DefaultSpaceRegistry;

impl DefaultSpaceRegistry {
    pub fn get() -> Option<Arc<SpaceRegistry>> {
        DEFAULT_SPACE_REGISTRY.read().clone()
    }

    /// Replace the default. `None` unsets it.
    pub fn set(registry: Option<Arc<SpaceRegistry>>) {
        *DEFAULT_SPACE_REGISTRY.write() = registry;
    }

    /// The default, created empty if unset.
    pub fn get_or_init() -> Arc<SpaceRegistry> {
        if let Some(registry) = Self::get() {
            return registry;
        }
        let mut slot = DEFAULT_SPACE_REGISTRY.write();
        Arc::clone(slot.get_or_insert_with(|| Arc::new(SpaceRegistry::new())))
    }
}
