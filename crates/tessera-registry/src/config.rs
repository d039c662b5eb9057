//! Loader configuration.

use std::env;
use std::path::{Path, PathBuf};

/// Environment variable naming the base directory for staged shared objects.
pub const WORK_PATH_ENV: &str = "TESSERA_WORK_PATH";

/// Largest blob accepted for staging.
pub const DEFAULT_MAX_BLOB_SIZE: usize = 1 << 30;

const WORK_SUBDIR: &str = ".tessera_temp";
const OP_IMPL_SUBDIR: &str = ".op_impl";

/// Where in-memory shared objects are staged before loading, and how large
/// they may be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    work_dir: PathBuf,
    max_blob_size: usize,
}

impl LoaderConfig {
    /// Base directory from `TESSERA_WORK_PATH`, then `HOME`, then the system
    /// temp directory.
    pub fn from_env() -> Self {
        let base = [WORK_PATH_ENV, "HOME"]
            .iter()
            .find_map(|key| env::var_os(key).filter(|value| !value.is_empty()))
            .map(PathBuf::from)
            .unwrap_or_else(env::temp_dir);
        Self::with_base_dir(base)
    }

    /// Stage under `<base>/.tessera_temp/.op_impl`.
    pub fn with_base_dir(base: impl AsRef<Path>) -> Self {
        Self {
            work_dir: base.as_ref().join(WORK_SUBDIR).join(OP_IMPL_SUBDIR),
            max_blob_size: DEFAULT_MAX_BLOB_SIZE,
        }
    }

    /// Stage directly under `dir`.
    pub fn work_dir_override(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn max_blob_size(mut self, limit: usize) -> Self {
        self.max_blob_size = limit;
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn blob_size_limit(&self) -> usize {
        self.max_blob_size
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
