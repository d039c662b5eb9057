//! Operator implementation registry for tessera.
//!
//! This crate provides:
//! - `OpImplFunctions`, the per-operator bundle of callbacks and dependency masks
//! - `OpImplRegistry`, the process-wide table populated through `OpImplRegister`
//! - A C ABI (`ffi`) for exporting and importing registrations across shared objects
//! - `OpImplRegistryHolder` and its manager, which own loaded shared objects
//! - `SpaceRegistry`, an ordered view over holders used for lookups
//! - `DataDependentInterpreter`, which decides whether an input's value is needed
//! - `NodeContextFactory`, which builds kernel contexts for graph nodes
//!
//! # Example
//!
//! ```ignore
//! use tessera_registry::OpImplRegister;
//!
//! OpImplRegister::new("Reshape")
//!     .infer_shape(infer_reshape)
//!     .tiling(tiling_reshape)
//!     .inputs_data_dependency(&[1])
//!     .register();
//! ```

pub mod config;
pub mod data_dependent;
pub mod ffi;
pub mod holder;
pub mod holder_manager;
pub mod loader;
pub mod node_context;
pub mod op_impl;
pub mod register;
pub mod registry;
pub mod space_registry;

// Re-export commonly used types
pub use config::LoaderConfig;
pub use data_dependent::{DataDependentInterpreter, DependencySource};
pub use holder::{HolderOrigin, OpImplRegistryHolder, OppSoBlob, SoInfo};
pub use holder_manager::{Fingerprint, OpImplRegistryHolderManager};
pub use loader::{DynamicLoader, LibloadingLoader, LoadedLibrary};
pub use node_context::NodeContextFactory;
pub use op_impl::{DependencyKind, Diagnostic, MAX_DEPENDENCY_INDEX, OpImplFunctions};
pub use register::OpImplRegister;
pub use registry::OpImplRegistry;
pub use space_registry::{DefaultSpaceRegistry, OpImplHandle, SpaceRegistry};
pub use tessera_core::PrivateAttr;

/// Result type using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for registration, loading and dependency resolution.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to open shared object '{name}': {reason}")]
    OpenFailed { name: String, reason: String },

    #[error("Symbol '{symbol}' not found in '{name}': {reason}")]
    SymbolMissing {
        name: String,
        symbol: String,
        reason: String,
    },

    #[error("Exporting operators from '{name}' failed with status {status}")]
    ExportFailed { name: String, status: u32 },

    #[error("'{name}' reported {requested} operators but {available} are available")]
    CountMismatch {
        name: String,
        requested: usize,
        available: usize,
    },

    #[error("'{name}' exports no operators")]
    EmptyExport { name: String },

    #[error("Invalid export entry from '{name}': {reason}")]
    InvalidExport { name: String, reason: String },

    #[error("Blob '{name}' is {size} bytes, over the {limit} byte limit")]
    BlobTooLarge {
        name: String,
        size: usize,
        limit: usize,
    },

    #[error("'{0}' is already loaded into the default space registry")]
    AlreadyLoaded(String),

    #[error("{kind} dependency index {index} is out of range (max {max})")]
    InvalidDependencyIndex {
        kind: DependencyKind,
        index: usize,
        max: usize,
    },

    #[error("Node '{node}': subgraph Data node '{data}' has no parent node index")]
    MissingParentIndex { node: String, data: String },

    #[error("Node '{node}': {reason}")]
    ParentIndexMismatch { node: String, reason: String },

    #[error("No {callback} registered for op type '{op_type}'")]
    MissingCallback {
        op_type: String,
        callback: &'static str,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] tessera_core::Error),
}
