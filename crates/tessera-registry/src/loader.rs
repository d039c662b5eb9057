//! Dynamic library loading behind a trait, so holders can be tested
//! without real shared objects.

use crate::ffi::{
    COUNT_OPERATORS_SYMBOL, CountOperatorsFn, EXPORT_OPERATORS_SYMBOL, ExportOperatorsFn,
};
use crate::{Error, Result};
use libloading::Library;
use std::path::{Path, PathBuf};

/// An opened library. Dropping it unloads the library.
pub trait LoadedLibrary: Send + Sync {
    /// Resolve `count_operators`.
    fn count_operators(&self) -> Result<CountOperatorsFn>;

    /// Resolve `export_operators`.
    fn export_operators(&self) -> Result<ExportOperatorsFn>;
}

/// Opens libraries by path.
pub trait DynamicLoader: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn LoadedLibrary>>;
}

/// [`DynamicLoader`] backed by the platform loader via `libloading`.
///
/// On Unix libraries are opened with `RTLD_NOW | RTLD_GLOBAL` so missing
/// symbols fail at open time and the library's symbols are visible to
/// libraries loaded after it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LibloadingLoader;

impl DynamicLoader for LibloadingLoader {
    fn open(&self, path: &Path) -> Result<Box<dyn LoadedLibrary>> {
        let library = open_library(path).map_err(|e| Error::OpenFailed {
            name: path.display().to_string(),
            reason: e.to_string(),
        })?;
        tracing::debug!(path = %path.display(), "opened shared object");
        Ok(Box::new(LibloadingLibrary {
            library,
            path: path.to_path_buf(),
        }))
    }
}

#[cfg(unix)]
fn open_library(path: &Path) -> std::result::Result<Library, libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_NOW};
    unsafe { UnixLibrary::open(Some(path), RTLD_NOW | RTLD_GLOBAL) }.map(Library::from)
}

#[cfg(not(unix))]
fn open_library(path: &Path) -> std::result::Result<Library, libloading::Error> {
    unsafe { Library::new(path) }
}

struct LibloadingLibrary {
    library: Library,
    path: PathBuf,
}

impl LibloadingLibrary {
    fn resolve<T: Copy>(&self, symbol: &[u8]) -> Result<T> {
        unsafe { self.library.get::<T>(symbol).map(|symbol| *symbol) }.map_err(|e| {
            Error::SymbolMissing {
                name: self.path.display().to_string(),
                symbol: String::from_utf8_lossy(symbol.strip_suffix(b"\0").unwrap_or(symbol))
                    .into_owned(),
                reason: e.to_string(),
            }
        })
    }
}

impl LoadedLibrary for LibloadingLibrary {
    fn count_operators(&self) -> Result<CountOperatorsFn> {
        self.resolve(COUNT_OPERATORS_SYMBOL)
    }

    fn export_operators(&self) -> Result<ExportOperatorsFn> {
        self.resolve(EXPORT_OPERATORS_SYMBOL)
    }
}

impl Drop for LibloadingLibrary {
    fn drop(&mut self) {
        tracing::debug!(path = %self.path.display(), "closing shared object");
    }
}
