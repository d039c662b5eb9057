//! Data type inference view.
//!
//! Layout: `[input data types (n)]`, outputs are one `DataType` per node
//! output. Absent inputs and outputs read as `DataType::Undefined`.

use super::{InferDataTypeFn, KernelContext, KernelContextView, Slot, kernel_view};
use crate::compute_node_info::ComputeNodeInfo;
use crate::types::DataType;
use crate::{Error, Result};
use std::sync::Arc;

/// Context handed to an [`InferDataTypeFn`].
#[derive(Debug)]
pub struct InferDataTypeContext {
    kernel: KernelContext,
}

impl KernelContextView for InferDataTypeContext {
    const NAME: &'static str = "InferDataTypeContext";
    const TRAILING_INPUTS: usize = 0;

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

kernel_view!(InferDataTypeContext);

impl InferDataTypeContext {
    pub fn builder(node: impl Into<Arc<ComputeNodeInfo>>) -> InferDataTypeContextBuilder {
        InferDataTypeContextBuilder::new(node)
    }

    fn data_type_at(&self, flat: Option<usize>) -> DataType {
        flat.and_then(|i| self.kernel.input::<DataType>(i))
            .copied()
            .unwrap_or_default()
    }

    pub fn input_data_type(&self, index: usize) -> DataType {
        self.data_type_at(Some(index))
    }

    pub fn optional_input_data_type(&self, ir_index: usize) -> DataType {
        self.data_type_at(self.kernel.ir_input_offset(ir_index, 0))
    }

    pub fn dynamic_input_data_type(&self, ir_index: usize, relative: usize) -> DataType {
        self.data_type_at(self.kernel.ir_input_offset(ir_index, relative))
    }

    pub fn output_data_type(&self, index: usize) -> DataType {
        self.kernel
            .output::<DataType>(index)
            .copied()
            .unwrap_or_default()
    }

    /// # Errors
    ///
    /// Returns `Error::Layout` if `index` is not an output of this node.
    pub fn set_output_data_type(&mut self, index: usize, data_type: DataType) -> Result<()> {
        self.kernel.set_output(index, data_type)
    }

    /// Invoke `infer` on this context.
    pub fn run(&mut self, infer: InferDataTypeFn) -> Result<()> {
        infer(self)
    }
}

/// Builds an [`InferDataTypeContext`].
#[derive(Debug)]
pub struct InferDataTypeContextBuilder {
    node: Arc<ComputeNodeInfo>,
    inputs: Vec<DataType>,
    outputs: Vec<DataType>,
}

impl InferDataTypeContextBuilder {
    pub fn new(node: impl Into<Arc<ComputeNodeInfo>>) -> Self {
        Self {
            node: node.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn input_data_types(mut self, types: impl IntoIterator<Item = DataType>) -> Self {
        self.inputs.extend(types);
        self
    }

    /// Seed output data types; unseeded outputs start `Undefined`.
    pub fn output_data_types(mut self, types: impl IntoIterator<Item = DataType>) -> Self {
        self.outputs.extend(types);
        self
    }

    pub fn build(mut self) -> Result<InferDataTypeContext> {
        let outputs_num = self.node.outputs_num();
        if self.outputs.len() > outputs_num {
            return Err(Error::Layout(format!(
                "{} output data types for a node with {} outputs",
                self.outputs.len(),
                outputs_num
            )));
        }
        self.outputs.resize(outputs_num, DataType::Undefined);
        let inputs = self.inputs.into_iter().map(Slot::new).collect();
        let outputs = self.outputs.into_iter().map(Slot::new).collect();
        KernelContext::new(self.node, inputs, outputs).into_view()
    }
}
