//! Shape inference view.
//!
//! Layout: `[input shapes or tensors (n)] [infer-shape fn]`, outputs are one
//! `StorageShape` per node output.

use super::{InferShapeFn, KernelContext, KernelContextView, Slot, kernel_view};
use crate::compute_node_info::ComputeNodeInfo;
use crate::types::{Shape, StorageShape, Tensor};
use crate::{Error, Result};
use std::sync::Arc;

/// Context handed to an [`InferShapeFn`].
#[derive(Debug)]
pub struct InferShapeContext {
    kernel: KernelContext,
}

impl KernelContextView for InferShapeContext {
    const NAME: &'static str = "InferShapeContext";
    const TRAILING_INPUTS: usize = 1;

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

kernel_view!(InferShapeContext);

impl InferShapeContext {
    pub fn builder(node: impl Into<Arc<ComputeNodeInfo>>) -> InferShapeContextBuilder {
        InferShapeContextBuilder::new(node)
    }

    fn node_input<T: 'static>(&self, flat: usize) -> Option<&T> {
        if flat >= self.kernel.compute_node_info().inputs_num() {
            return None;
        }
        self.kernel.input::<T>(flat)
    }

    fn shape_at(&self, flat: usize) -> Option<&Shape> {
        self.node_input::<StorageShape>(flat)
            .map(|shape| &shape.origin)
            .or_else(|| self.node_input::<Tensor>(flat).map(Tensor::origin_shape))
    }

    /// Origin shape of flat input `index`.
    pub fn input_shape(&self, index: usize) -> Option<&Shape> {
        self.shape_at(index)
    }

    /// Origin shape of an optional IR input; `None` when not instantiated.
    pub fn optional_input_shape(&self, ir_index: usize) -> Option<&Shape> {
        self.shape_at(self.kernel.ir_input_offset(ir_index, 0)?)
    }

    /// Origin shape of instance `relative` of a dynamic IR input.
    pub fn dynamic_input_shape(&self, ir_index: usize, relative: usize) -> Option<&Shape> {
        self.shape_at(self.kernel.ir_input_offset(ir_index, relative)?)
    }

    /// Flat input `index` when it was supplied as a full tensor, which is the
    /// case for inputs whose value the implementation depends on.
    pub fn input_tensor(&self, index: usize) -> Option<&Tensor> {
        self.node_input::<Tensor>(index)
    }

    pub fn optional_input_tensor(&self, ir_index: usize) -> Option<&Tensor> {
        self.node_input::<Tensor>(self.kernel.ir_input_offset(ir_index, 0)?)
    }

    pub fn dynamic_input_tensor(&self, ir_index: usize, relative: usize) -> Option<&Tensor> {
        self.node_input::<Tensor>(self.kernel.ir_input_offset(ir_index, relative)?)
    }

    pub fn output_shape(&self, index: usize) -> Option<&Shape> {
        self.kernel
            .output::<StorageShape>(index)
            .map(|shape| &shape.origin)
    }

    /// Writable origin shape of output `index`.
    pub fn output_shape_mut(&mut self, index: usize) -> Option<&mut Shape> {
        self.kernel
            .output_mut::<StorageShape>(index)
            .map(|shape| &mut shape.origin)
    }

    /// The callback stored in the trailing slot.
    pub fn infer_shape_fn(&self) -> Option<InferShapeFn> {
        let slot = self.kernel.compute_node_info().inputs_num();
        self.kernel.input::<InferShapeFn>(slot).copied()
    }

    /// Invoke the stored callback on this context.
    pub fn run(&mut self) -> Result<()> {
        let infer = self.infer_shape_fn().ok_or_else(|| {
            Error::Kernel(format!(
                "no infer-shape function in context for '{}'",
                self.kernel.node_type()
            ))
        })?;
        infer(self)
    }
}

/// Builds an [`InferShapeContext`].
#[derive(Debug)]
pub struct InferShapeContextBuilder {
    node: Arc<ComputeNodeInfo>,
    inputs: Vec<Slot>,
    outputs: Vec<StorageShape>,
    infer_shape: Option<InferShapeFn>,
}

impl InferShapeContextBuilder {
    pub fn new(node: impl Into<Arc<ComputeNodeInfo>>) -> Self {
        Self {
            node: node.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            infer_shape: None,
        }
    }

    /// Append a shape-only input.
    pub fn input_shape(mut self, shape: StorageShape) -> Self {
        self.inputs.push(Slot::new(shape));
        self
    }

    /// Append an input carrying a full tensor.
    pub fn input_tensor(mut self, tensor: Tensor) -> Self {
        self.inputs.push(Slot::new(tensor));
        self
    }

    /// Append several shape-only inputs.
    pub fn input_shapes(mut self, shapes: impl IntoIterator<Item = StorageShape>) -> Self {
        self.inputs.extend(shapes.into_iter().map(Slot::new));
        self
    }

    /// Seed an output shape. Unseeded outputs start empty.
    pub fn output_shape(mut self, shape: StorageShape) -> Self {
        self.outputs.push(shape);
        self
    }

    pub fn infer_shape_fn(mut self, infer: InferShapeFn) -> Self {
        self.infer_shape = Some(infer);
        self
    }

    /// # Errors
    ///
    /// Returns `Error::Layout` if the input or output counts disagree with
    /// the node description.
    pub fn build(mut self) -> Result<InferShapeContext> {
        let outputs_num = self.node.outputs_num();
        if self.outputs.len() > outputs_num {
            return Err(Error::Layout(format!(
                "{} output shapes for a node with {} outputs",
                self.outputs.len(),
                outputs_num
            )));
        }
        self.outputs.resize(outputs_num, StorageShape::default());

        let mut inputs = self.inputs;
        inputs.push(match self.infer_shape {
            Some(infer) => Slot::new(infer),
            None => Slot::empty(),
        });
        let outputs = self.outputs.into_iter().map(Slot::new).collect();

        KernelContext::new(self.node, inputs, outputs).into_view()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, Format, TensorData};

    fn broadcast_like_first(ctx: &mut InferShapeContext) -> Result<()> {
        let shape = ctx
            .input_shape(0)
            .cloned()
            .ok_or_else(|| Error::Kernel("missing input 0".into()))?;
        let out = ctx
            .output_shape_mut(0)
            .ok_or_else(|| Error::Kernel("missing output 0".into()))?;
        *out = shape;
        Ok(())
    }

    #[test]
    fn test_run_stored_function() {
        let node = ComputeNodeInfo::builder()
            .node_type("Identity")
            .node_io_num(1, 1)
            .input_td(0, DataType::F32, Format::Nd, Format::Nd)
            .build()
            .unwrap();
        let mut ctx = InferShapeContext::builder(node)
            .input_shape(StorageShape::uniform(vec![3, 4]))
            .infer_shape_fn(broadcast_like_first)
            .build()
            .unwrap();

        assert_eq!(ctx.input_num(), 2);
        ctx.run().unwrap();
        assert_eq!(ctx.output_shape(0).map(Shape::dims), Some(&[3, 4][..]));
    }

    #[test]
    fn test_run_without_function() {
        let node = ComputeNodeInfo::builder().node_io_num(0, 0).build().unwrap();
        let mut ctx = InferShapeContext::builder(node).build().unwrap();
        assert!(matches!(ctx.run(), Err(Error::Kernel(_))));
    }

    #[test]
    fn test_tensor_inputs_expose_shape_and_value() {
        let node = ComputeNodeInfo::builder().node_io_num(2, 1).build().unwrap();
        let ctx = InferShapeContext::builder(node)
            .input_shape(StorageShape::uniform(vec![2, 5]))
            .input_tensor(Tensor::with_data(
                StorageShape::uniform(vec![2]),
                TensorData::I64(vec![5, 2]),
            ))
            .build()
            .unwrap();

        assert_eq!(ctx.input_shape(1).map(Shape::dims), Some(&[2][..]));
        assert!(ctx.input_tensor(0).is_none());
        let value = ctx.input_tensor(1).and_then(|t| t.data.as_ref());
        assert_eq!(value.and_then(TensorData::as_i64), Some(&[5, 2][..]));
        // The trailing function slot is not a node input.
        assert!(ctx.input_shape(2).is_none());
    }

    #[test]
    fn test_too_many_outputs() {
        let node = ComputeNodeInfo::builder().node_io_num(0, 1).build().unwrap();
        let result = InferShapeContext::builder(node)
            .output_shape(StorageShape::default())
            .output_shape(StorageShape::default())
            .build();
        assert!(result.is_err());
    }
}
