//! Tiling view.
//!
//! Inputs: `[input tensors (n)] [output shapes (m)] [compile info]
//! [platform info] [tiling fn]`.
//! Outputs: `[tiling key] [block dim] [atomic clean flag] [tiling data]
//! [workspace sizes] [tiling cond]`.

use super::tiling_parse::CompileInfo;
use super::{KernelContext, KernelContextView, Slot, TilingFn, kernel_view};
use crate::compute_node_info::ComputeNodeInfo;
use crate::types::{Shape, StorageShape, Tensor, TensorPlacement};
use crate::{Error, Result};
use bytemuck::Pod;
use std::collections::HashMap;
use std::sync::Arc;

/// Tiling data capacity used when an implementation does not declare one.
pub const DEFAULT_MAX_TILING_DATA_SIZE: usize = 2048;

const TILING_KEY: usize = 0;
const BLOCK_DIM: usize = 1;
const ATOMIC_CLEAN_FLAG: usize = 2;
const TILING_DATA: usize = 3;
const WORKSPACE: usize = 4;
const TILING_COND: usize = 5;
const TILING_OUTPUTS: usize = 6;

/// Description of the target device consulted by tiling callbacks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformInfo {
    pub soc_version: String,
    pub core_num: u32,
    pub ub_size: u64,
    pub params: HashMap<String, String>,
}

impl PlatformInfo {
    pub fn new(soc_version: impl Into<String>, core_num: u32) -> Self {
        Self {
            soc_version: soc_version.into(),
            core_num,
            ..Default::default()
        }
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

// ─────────────────────────────── TilingData ──────────────────────────────

/// Bounded byte buffer a tiling callback serializes its parameters into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilingData {
    capacity: usize,
    data: Vec<u8>,
}

impl TilingData {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            data: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes written so far.
    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Append one plain-old-data value.
    ///
    /// # Errors
    ///
    /// Returns `Error::TilingDataOverflow`, leaving the buffer unchanged, if
    /// the value does not fit.
    pub fn append<T: Pod>(&mut self, value: &T) -> Result<()> {
        self.append_bytes(bytemuck::bytes_of(value))
    }

    /// Append a slice of plain-old-data values.
    pub fn append_slice<T: Pod>(&mut self, values: &[T]) -> Result<()> {
        self.append_bytes(bytemuck::cast_slice(values))
    }

    fn append_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let requested = self.data.len().saturating_add(bytes.len());
        if requested > self.capacity {
            return Err(Error::TilingDataOverflow {
                requested,
                capacity: self.capacity,
            });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

// ────────────────────────────── TilingContext ────────────────────────────

/// Context handed to a [`TilingFn`].
#[derive(Debug)]
pub struct TilingContext {
    kernel: KernelContext,
}

impl KernelContextView for TilingContext {
    const NAME: &'static str = "TilingContext";
    const TRAILING_INPUTS: usize = 3;
    const FIXED_OUTPUTS: Option<usize> = Some(TILING_OUTPUTS);

    fn leading_inputs(node: &ComputeNodeInfo) -> usize {
        node.inputs_num() + node.outputs_num()
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

kernel_view!(TilingContext);

impl TilingContext {
    pub fn builder(node: impl Into<Arc<ComputeNodeInfo>>) -> TilingContextBuilder {
        TilingContextBuilder::new(node)
    }

    fn leading(&self) -> usize {
        Self::leading_inputs(self.kernel.compute_node_info())
    }

    fn tensor_at(&self, flat: Option<usize>) -> Option<&Tensor> {
        let flat = flat?;
        if flat >= self.kernel.compute_node_info().inputs_num() {
            return None;
        }
        self.kernel.input::<Tensor>(flat)
    }

    // ── Inputs ──

    /// Flat input `index`. Its `data` is present only when the
    /// implementation declared a tiling dependency on it.
    pub fn input_tensor(&self, index: usize) -> Option<&Tensor> {
        self.tensor_at(Some(index))
    }

    pub fn optional_input_tensor(&self, ir_index: usize) -> Option<&Tensor> {
        self.tensor_at(self.kernel.ir_input_offset(ir_index, 0))
    }

    pub fn dynamic_input_tensor(&self, ir_index: usize, relative: usize) -> Option<&Tensor> {
        self.tensor_at(self.kernel.ir_input_offset(ir_index, relative))
    }

    pub fn input_shape(&self, index: usize) -> Option<&Shape> {
        self.input_tensor(index).map(Tensor::storage_shape)
    }

    pub fn optional_input_shape(&self, ir_index: usize) -> Option<&Shape> {
        self.optional_input_tensor(ir_index).map(Tensor::storage_shape)
    }

    pub fn dynamic_input_shape(&self, ir_index: usize, relative: usize) -> Option<&Shape> {
        self.dynamic_input_tensor(ir_index, relative)
            .map(Tensor::storage_shape)
    }

    /// Shape inferred for node output `index`.
    pub fn output_shape(&self, index: usize) -> Option<&Shape> {
        let node = self.kernel.compute_node_info();
        if index >= node.outputs_num() {
            return None;
        }
        self.kernel
            .input::<StorageShape>(node.inputs_num() + index)
            .map(|shape| &shape.storage)
    }

    /// The parsed compile info, if it has type `T`.
    pub fn compile_info<T: 'static>(&self) -> Option<&T> {
        self.kernel
            .input::<Arc<CompileInfo>>(self.leading())?
            .get::<T>()
    }

    pub fn platform_info(&self) -> Option<&PlatformInfo> {
        self.kernel
            .input::<Arc<PlatformInfo>>(self.leading() + 1)
            .map(Arc::as_ref)
    }

    pub fn tiling_fn(&self) -> Option<TilingFn> {
        self.kernel.input::<TilingFn>(self.leading() + 2).copied()
    }

    // ── Outputs ──

    pub fn tiling_key(&self) -> u64 {
        self.kernel.output::<u64>(TILING_KEY).copied().unwrap_or(0)
    }

    pub fn set_tiling_key(&mut self, key: u64) -> Result<()> {
        self.kernel.set_output(TILING_KEY, key)
    }

    pub fn block_dim(&self) -> u32 {
        self.kernel.output::<u32>(BLOCK_DIM).copied().unwrap_or(0)
    }

    pub fn set_block_dim(&mut self, block_dim: u32) -> Result<()> {
        self.kernel.set_output(BLOCK_DIM, block_dim)
    }

    /// Whether outputs must be zeroed before the kernel runs.
    pub fn need_atomic(&self) -> bool {
        self.kernel
            .output::<bool>(ATOMIC_CLEAN_FLAG)
            .copied()
            .unwrap_or(false)
    }

    pub fn set_need_atomic(&mut self, atomic: bool) -> Result<()> {
        self.kernel.set_output(ATOMIC_CLEAN_FLAG, atomic)
    }

    pub fn tiling_cond(&self) -> i32 {
        self.kernel.output::<i32>(TILING_COND).copied().unwrap_or(0)
    }

    pub fn set_tiling_cond(&mut self, cond: i32) -> Result<()> {
        self.kernel.set_output(TILING_COND, cond)
    }

    pub fn raw_tiling_data(&self) -> Option<&TilingData> {
        self.kernel.output::<TilingData>(TILING_DATA)
    }

    pub fn raw_tiling_data_mut(&mut self) -> Option<&mut TilingData> {
        self.kernel.output_mut::<TilingData>(TILING_DATA)
    }

    pub fn workspace_sizes(&self) -> &[usize] {
        self.kernel
            .output::<Vec<usize>>(WORKSPACE)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Resize the workspace table to `count` entries and return it.
    pub fn workspace_sizes_mut(&mut self, count: usize) -> Option<&mut [usize]> {
        let sizes = self.kernel.output_mut::<Vec<usize>>(WORKSPACE)?;
        sizes.resize(count, 0);
        Some(sizes.as_mut_slice())
    }

    /// Invoke the stored tiling callback on this context.
    pub fn run(&mut self) -> Result<()> {
        let tiling = self.tiling_fn().ok_or_else(|| {
            Error::Kernel(format!(
                "no tiling function in context for '{}'",
                self.kernel.node_type()
            ))
        })?;
        tiling(self)
    }
}

// ───────────────────────────────── Builder ───────────────────────────────

/// Builds a [`TilingContext`].
///
/// When a `value_needed` predicate is set, each input tensor is checked by
/// its IR index: tensors the implementation depends on keep their data and
/// are placed on the host, all others lose their data.
pub struct TilingContextBuilder {
    node: Arc<ComputeNodeInfo>,
    inputs: Vec<Tensor>,
    output_shapes: Vec<StorageShape>,
    compile_info: Option<Arc<CompileInfo>>,
    platform_info: Option<Arc<PlatformInfo>>,
    tiling: Option<TilingFn>,
    max_tiling_data_size: usize,
    value_needed: Option<Box<dyn Fn(usize) -> bool + 'static>>,
}

impl TilingContextBuilder {
    pub fn new(node: impl Into<Arc<ComputeNodeInfo>>) -> Self {
        Self {
            node: node.into(),
            inputs: Vec::new(),
            output_shapes: Vec::new(),
            compile_info: None,
            platform_info: None,
            tiling: None,
            max_tiling_data_size: DEFAULT_MAX_TILING_DATA_SIZE,
            value_needed: None,
        }
    }

    pub fn input_tensor(mut self, tensor: Tensor) -> Self {
        self.inputs.push(tensor);
        self
    }

    pub fn input_tensors(mut self, tensors: impl IntoIterator<Item = Tensor>) -> Self {
        self.inputs.extend(tensors);
        self
    }

    pub fn output_shape(mut self, shape: StorageShape) -> Self {
        self.output_shapes.push(shape);
        self
    }

    pub fn compile_info(mut self, info: Arc<CompileInfo>) -> Self {
        self.compile_info = Some(info);
        self
    }

    pub fn platform_info(mut self, info: Arc<PlatformInfo>) -> Self {
        self.platform_info = Some(info);
        self
    }

    pub fn tiling_fn(mut self, tiling: TilingFn) -> Self {
        self.tiling = Some(tiling);
        self
    }

    pub fn max_tiling_data_size(mut self, size: usize) -> Self {
        self.max_tiling_data_size = size;
        self
    }

    /// Decide per IR input index whether its value must be materialized.
    pub fn value_needed(mut self, predicate: impl Fn(usize) -> bool + 'static) -> Self {
        self.value_needed = Some(Box::new(predicate));
        self
    }

    /// # Errors
    ///
    /// Returns `Error::Layout` when compile info or platform info is missing
    /// or the tensor counts disagree with the node.
    pub fn build(self) -> Result<TilingContext> {
        let node = self.node;
        let compile_info = self.compile_info.ok_or_else(|| {
            Error::Layout(format!("tiling context for '{}' has no compile info", node.node_type()))
        })?;
        let platform_info = self.platform_info.ok_or_else(|| {
            Error::Layout(format!("tiling context for '{}' has no platform info", node.node_type()))
        })?;

        let mut output_shapes = self.output_shapes;
        if output_shapes.is_empty() {
            output_shapes.resize(node.outputs_num(), StorageShape::default());
        }

        let mut inputs = Vec::with_capacity(self.inputs.len() + output_shapes.len() + 3);
        for (flat, mut tensor) in self.inputs.into_iter().enumerate() {
            if let Some(needed) = &self.value_needed {
                let depends = node.ir_index_of_input(flat).is_some_and(|ir| needed(ir));
                if depends {
                    if !tensor.has_data() {
                        tracing::warn!(
                            node = node.node_name(),
                            input = flat,
                            "value-dependent tiling input has no data"
                        );
                    }
                    tensor.placement = TensorPlacement::Host;
                } else {
                    tensor.strip_data();
                }
            }
            inputs.push(Slot::new(tensor));
        }
        inputs.extend(output_shapes.into_iter().map(Slot::new));
        inputs.push(Slot::new(compile_info));
        inputs.push(Slot::new(platform_info));
        inputs.push(self.tiling.map(Slot::new).unwrap_or_default());

        let outputs = vec![
            Slot::new(0u64),
            Slot::new(0u32),
            Slot::new(false),
            Slot::new(TilingData::with_capacity(self.max_tiling_data_size)),
            Slot::new(Vec::<usize>::new()),
            Slot::new(0i32),
        ];

        KernelContext::new(node, inputs, outputs).into_view()
    }
}
