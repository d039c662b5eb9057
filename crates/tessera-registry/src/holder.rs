//! A set of registrations and the library they came from.

use crate::config::LoaderConfig;
use crate::ffi::{STATUS_COUNT_MISMATCH, STATUS_SUCCESS, TypesToImpl};
use crate::loader::{DynamicLoader, LoadedLibrary};
use crate::op_impl::OpImplFunctions;
use crate::registry::OpImplRegistry;
use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tessera_core::PrivateAttr;

/// A shared object held in memory.
#[derive(Debug, Clone)]
pub struct OppSoBlob {
    pub name: String,
    pub data: Arc<[u8]>,
}

impl OppSoBlob {
    pub fn new(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Read a shared object from disk, named by its path.
    pub fn from_path(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        Ok(Self::new(path.display().to_string(), data))
    }
}

/// Platform and version information a blob was built for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SoInfo {
    pub cpu_info: String,
    pub os_info: String,
    pub opp_version: String,
}

impl SoInfo {
    pub fn new(
        cpu_info: impl Into<String>,
        os_info: impl Into<String>,
        opp_version: impl Into<String>,
    ) -> Self {
        Self {
            cpu_info: cpu_info.into(),
            os_info: os_info.into(),
            opp_version: opp_version.into(),
        }
    }

    /// `cpu/os`, used as the platform part of a fingerprint.
    pub fn platform(&self) -> String {
        format!("{}/{}", self.cpu_info, self.os_info)
    }
}

/// Where a holder's registrations came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HolderOrigin {
    /// Registrations compiled into this process.
    BuiltIn,
    /// Registrations exported by a loaded shared object.
    SharedObject { name: String },
}

/// Registrations from one source, plus the library handle that keeps their
/// callbacks valid.
pub struct OpImplRegistryHolder {
    types_to_impl: HashMap<String, Arc<OpImplFunctions>>,
    origin: HolderOrigin,
    // Declared last so it is dropped after the callbacks that point into it.
    library: Option<Box<dyn LoadedLibrary>>,
}

impl OpImplRegistryHolder {
    /// A holder with a copy of the process-wide registry.
    ///
    /// Registrations made after this call are not seen by the holder.
    pub fn builtin() -> Self {
        Self::from_registry(OpImplRegistry::global())
    }

    /// A holder with a copy of `registry`.
    pub fn from_registry(registry: &OpImplRegistry) -> Self {
        Self::from_functions(HolderOrigin::BuiltIn, registry.snapshot())
    }

    pub fn from_functions(
        origin: HolderOrigin,
        types_to_impl: HashMap<String, OpImplFunctions>,
    ) -> Self {
        Self {
            types_to_impl: types_to_impl
                .into_iter()
                .map(|(op_type, funcs)| (op_type, Arc::new(funcs)))
                .collect(),
            origin,
            library: None,
        }
    }

    /// Stage `blob` in a fresh directory under the configured work path,
    /// load it and import its registrations.
    ///
    /// The staging directory is removed before this returns. On any error
    /// the library, if opened, is closed again.
    #[tracing::instrument(skip_all, fields(name = %blob.name, size = blob.data.len()))]
    pub fn load_so(
        blob: &OppSoBlob,
        loader: &dyn DynamicLoader,
        config: &LoaderConfig,
    ) -> Result<Self> {
        let limit = config.blob_size_limit();
        if blob.data.len() > limit {
            return Err(Error::BlobTooLarge {
                name: blob.name.clone(),
                size: blob.data.len(),
                limit,
            });
        }

        fs::create_dir_all(config.work_dir())?;
        let staging = tempfile::Builder::new()
            .prefix(&format!("{}_", std::process::id()))
            .tempdir_in(config.work_dir())?;
        let path = staging.path().join(staged_file_name(&blob.name));
        fs::write(&path, &blob.data)?;

        let library = loader.open(&path)?;
        let holder = Self::import(&blob.name, library);
        drop(staging);
        holder
    }

    /// Load the shared object at `path` in place and import its registrations.
    pub fn load_path(path: &Path, loader: &dyn DynamicLoader) -> Result<Self> {
        let library = loader.open(path)?;
        Self::import(&path.display().to_string(), library)
    }

    /// Import every registration `library` exports.
    pub fn import(name: &str, library: Box<dyn LoadedLibrary>) -> Result<Self> {
        let count_operators = library.count_operators()?;
        let export_operators = library.export_operators()?;

        let count = unsafe { count_operators() };
        if count == 0 {
            return Err(Error::EmptyExport {
                name: name.to_string(),
            });
        }

        let mut buffer = vec![TypesToImpl::EMPTY; count];
        let status = unsafe { export_operators(buffer.as_mut_ptr(), count) };
        match status {
            STATUS_SUCCESS => {}
            STATUS_COUNT_MISMATCH => {
                return Err(Error::CountMismatch {
                    name: name.to_string(),
                    requested: count,
                    available: unsafe { count_operators() },
                });
            }
            status => {
                return Err(Error::ExportFailed {
                    name: name.to_string(),
                    status,
                });
            }
        }

        let mut types_to_impl = HashMap::with_capacity(count);
        for (index, entry) in buffer.iter().enumerate() {
            if entry.is_empty() {
                return Err(Error::CountMismatch {
                    name: name.to_string(),
                    requested: count,
                    available: index,
                });
            }
            let (op_type, funcs) = unsafe { entry.to_registration(name) }?;
            if types_to_impl.insert(op_type.clone(), Arc::new(funcs)).is_some() {
                tracing::warn!(%op_type, "op type exported twice, keeping the later entry");
            }
        }

        tracing::info!(name, op_types = types_to_impl.len(), "imported op impls");
        Ok(Self {
            types_to_impl,
            origin: HolderOrigin::SharedObject {
                name: name.to_string(),
            },
            library: Some(library),
        })
    }

    pub fn get_op_impl(&self, op_type: &str) -> Option<&OpImplFunctions> {
        self.types_to_impl.get(op_type).map(Arc::as_ref)
    }

    pub(crate) fn shared_op_impl(&self, op_type: &str) -> Option<Arc<OpImplFunctions>> {
        self.types_to_impl.get(op_type).cloned()
    }

    /// Private attributes of `op_type`; empty when unknown.
    pub fn private_attrs(&self, op_type: &str) -> &[PrivateAttr] {
        self.get_op_impl(op_type)
            .map(OpImplFunctions::private_attrs)
            .unwrap_or_default()
    }

    /// Registered operator types, sorted.
    pub fn op_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.types_to_impl.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn origin(&self) -> &HolderOrigin {
        &self.origin
    }

    /// Name of the shared object, if the holder was loaded from one.
    pub fn so_name(&self) -> Option<&str> {
        match &self.origin {
            HolderOrigin::SharedObject { name } => Some(name),
            HolderOrigin::BuiltIn => None,
        }
    }

    pub fn has_library(&self) -> bool {
        self.library.is_some()
    }

    pub fn len(&self) -> usize {
        self.types_to_impl.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types_to_impl.is_empty()
    }
}

impl fmt::Debug for OpImplRegistryHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpImplRegistryHolder")
            .field("origin", &self.origin)
            .field("op_types", &self.op_types())
            .field("has_library", &self.library.is_some())
            .finish()
    }
}

// Keep only the final path component so a blob name cannot escape the
// staging directory.
fn staged_file_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| "op_impl.so".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::OpImplRegister;

    #[test]
    fn test_from_registry_is_a_snapshot() {
        let registry = OpImplRegistry::new();
        OpImplRegister::new("Add")
            .inputs_data_dependency(&[0])
            .register_into(&registry);
        let holder = OpImplRegistryHolder::from_registry(&registry);

        OpImplRegister::new("Mul").register_into(&registry);
        assert!(holder.get_op_impl("Add").is_some());
        assert!(holder.get_op_impl("Mul").is_none());
        assert_eq!(holder.origin(), &HolderOrigin::BuiltIn);
        assert!(!holder.has_library());
        assert!(holder.so_name().is_none());
    }

    #[test]
    fn test_private_attrs_of_unknown_type() {
        let holder = OpImplRegistryHolder::from_functions(HolderOrigin::BuiltIn, HashMap::new());
        assert!(holder.private_attrs("Missing").is_empty());
        assert!(holder.is_empty());
    }

    #[test]
    fn test_staged_file_name() {
        assert_eq!(staged_file_name("libops.so"), "libops.so");
        assert_eq!(staged_file_name("/opt/vendor/libops.so"), "libops.so");
        assert_eq!(staged_file_name("../../etc/libops.so"), "libops.so");
        assert_eq!(staged_file_name(""), "op_impl.so");
        assert_eq!(staged_file_name(".."), "op_impl.so");
    }

    #[test]
    fn test_so_info_platform() {
        let info = SoInfo::new("aarch64", "linux", "7.0");
        assert_eq!(info.platform(), "aarch64/linux");
    }
}
