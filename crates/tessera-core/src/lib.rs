//! Value types, graph IR and kernel context layout for tessera.
//!
//! This crate provides the pieces every operator implementation is written
//! against:
//! - Tensor metadata and values (`Shape`, `StorageShape`, `Tensor`, `DataType`)
//! - Graph-based IR (`IrGraph`, `IrNode`, `IrEdge`) with IR input prototypes
//! - `ComputeNodeInfo`, the IR-level side table of a kernel invocation
//! - `KernelContext` and its callback-specific views and builders

pub mod compute_node_info;
pub mod context;
pub mod ir;
pub mod types;

// Re-export commonly used types
pub use compute_node_info::{
    AnchorInstanceInfo, CompileTimeTensorDesc, ComputeNodeInfo, ComputeNodeInfoBuilder, PrivateAttr,
    RuntimeAttrs,
};
pub use context::{
    CompileInfo, CompileInfoCreator, CompileInfoDeleter, ExecuteFn, InferDataTypeContext,
    InferDataTypeFn, InferShapeContext, InferShapeFn, InferShapeRangeContext, InferShapeRangeFn,
    KernelContext, KernelContextBuilder, KernelContextView, PlatformInfo, Slot, TilingContext,
    TilingData, TilingFn, TilingParseContext, TilingParseFn,
};
pub use ir::{AttrValue, EdgeData, IrEdge, IrEdgeId, IrGraph, IrNode, IrNodeId, IrPort, IrPortKind};
pub use types::{
    DataType, Format, Shape, ShapeRange, StorageFormat, StorageShape, Tensor, TensorData,
    TensorPlacement,
};

/// Result type using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for tessera-core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Kernel context layout error: {0}")]
    Layout(String),

    #[error("Tiling data overflow: {requested} bytes requested, capacity is {capacity}")]
    TilingDataOverflow { requested: usize, capacity: usize },

    #[error("Kernel error: {0}")]
    Kernel(String),
}
