//! Tiling-parse view and the compile-info object it produces.
//!
//! Layout: `[compiled json] [platform info] [op type]`, one output holding the
//! [`CompileInfo`] allocated by the implementation's creator.

use super::tiling::PlatformInfo;
use super::{
    CompileInfoCreator, CompileInfoDeleter, KernelContext, KernelContextView, Slot, TilingParseFn,
    kernel_view,
};
use crate::compute_node_info::ComputeNodeInfo;
use crate::{Error, Result};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Type-erased compile info, released through its paired deleter.
pub struct CompileInfo {
    value: Option<Box<dyn Any + Send + Sync>>,
    deleter: Option<CompileInfoDeleter>,
}

impl CompileInfo {
    /// Allocate with `creator`. Without a deleter the value is simply dropped.
    pub fn new(creator: CompileInfoCreator, deleter: Option<CompileInfoDeleter>) -> Self {
        Self {
            value: Some(creator()),
            deleter,
        }
    }

    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.value.as_ref()?.downcast_ref::<T>()
    }

    pub fn get_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.value.as_mut()?.downcast_mut::<T>()
    }
}

impl Drop for CompileInfo {
    fn drop(&mut self) {
        if let (Some(value), Some(deleter)) = (self.value.take(), self.deleter) {
            deleter(value);
        }
    }
}

impl fmt::Debug for CompileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompileInfo")
            .field("allocated", &self.value.is_some())
            .field("has_deleter", &self.deleter.is_some())
            .finish()
    }
}

const COMPILED_JSON: usize = 0;
const PLATFORM_INFO: usize = 1;
const OP_TYPE: usize = 2;

/// Context handed to a [`TilingParseFn`].
#[derive(Debug)]
pub struct TilingParseContext {
    kernel: KernelContext,
}

impl KernelContextView for TilingParseContext {
    const NAME: &'static str = "TilingParseContext";
    const TRAILING_INPUTS: usize = 3;
    const FIXED_OUTPUTS: Option<usize> = Some(1);

    fn leading_inputs(_node: &ComputeNodeInfo) -> usize {
        0
    }

    fn wrap(kernel: KernelContext) -> Self {
        Self { kernel }
    }

    fn kernel(&self) -> &KernelContext {
        &self.kernel
    }

    fn into_kernel(self) -> KernelContext {
        self.kernel
    }
}

kernel_view!(TilingParseContext);

impl TilingParseContext {
    pub fn builder() -> TilingParseContextBuilder {
        TilingParseContextBuilder::default()
    }

    /// The compiled kernel metadata to parse.
    pub fn compiled_json(&self) -> Option<&str> {
        self.kernel
            .input::<String>(COMPILED_JSON)
            .map(String::as_str)
    }

    pub fn platform_info(&self) -> Option<&PlatformInfo> {
        self.kernel
            .input::<Arc<PlatformInfo>>(PLATFORM_INFO)
            .map(Arc::as_ref)
    }

    pub fn op_type(&self) -> Option<&str> {
        self.kernel.input::<String>(OP_TYPE).map(String::as_str)
    }

    pub fn compiled_info<T: 'static>(&self) -> Option<&T> {
        self.kernel.output::<CompileInfo>(0)?.get::<T>()
    }

    /// The compile-info object to fill in, if it has type `T`.
    pub fn compiled_info_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.kernel.output_mut::<CompileInfo>(0)?.get_mut::<T>()
    }

    /// Move the parsed compile info out, for handing to tiling contexts.
    pub fn take_compile_info(&mut self) -> Option<CompileInfo> {
        self.kernel.take_output::<CompileInfo>(0)
    }

    /// Invoke `parse` on this context.
    pub fn run(&mut self, parse: TilingParseFn) -> Result<()> {
        parse(self)
    }
}

/// Builds a [`TilingParseContext`].
#[derive(Debug, Default)]
pub struct TilingParseContextBuilder {
    node: Option<Arc<ComputeNodeInfo>>,
    compiled_json: Option<String>,
    platform_info: Option<Arc<PlatformInfo>>,
    op_type: Option<String>,
    creator: Option<(CompileInfoCreator, Option<CompileInfoDeleter>)>,
}

impl TilingParseContextBuilder {
    pub fn node(mut self, node: impl Into<Arc<ComputeNodeInfo>>) -> Self {
        self.node = Some(node.into());
        self
    }

    pub fn compiled_json(mut self, json: impl Into<String>) -> Self {
        self.compiled_json = Some(json.into());
        self
    }

    pub fn platform_info(mut self, info: Arc<PlatformInfo>) -> Self {
        self.platform_info = Some(info);
        self
    }

    pub fn op_type(mut self, op_type: impl Into<String>) -> Self {
        self.op_type = Some(op_type.into());
        self
    }

    pub fn compile_info_creator(
        mut self,
        creator: CompileInfoCreator,
        deleter: Option<CompileInfoDeleter>,
    ) -> Self {
        self.creator = Some((creator, deleter));
        self
    }

    /// # Errors
    ///
    /// Returns `Error::Layout` if no compile-info creator was supplied.
    pub fn build(self) -> Result<TilingParseContext> {
        let op_type = self.op_type.unwrap_or_default();
        let (creator, deleter) = self.creator.ok_or_else(|| {
            Error::Layout(format!(
                "tiling parse context for '{}' has no compile info creator",
                op_type
            ))
        })?;
        let node = self
            .node
            .unwrap_or_else(|| Arc::new(ComputeNodeInfo::for_op_type(op_type.clone())));

        let inputs = vec![
            self.compiled_json.map(Slot::new).unwrap_or_default(),
            self.platform_info.map(Slot::new).unwrap_or_default(),
            Slot::new(op_type),
        ];
        let outputs = vec![Slot::new(CompileInfo::new(creator, deleter))];
        KernelContext::new(node, inputs, outputs).into_view()
    }
}
