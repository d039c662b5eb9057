//! Shape-range inference view.
//!
//! Layout: `[input ranges (n)] [infer-shape-range fn]`, outputs are one
//! `ShapeRange` per node output.

use super::{InferShapeRangeFn, KernelContext, KernelContextView, Slot, kernel_view};
use crate::compute_node_info::ComputeNodeInfo;
use crate::types::ShapeRange;
use crate::{Error, Result};
use std::sync::Arc;

/// Context handed to an [`InferShapeRangeFn`].
#[derive(Debug)]
pub struct InferShapeRangeContext {
    kernel: KernelContext,
}

impl KernelContextView for InferShapeRangeContext {
    const NAME: &'static str = "InferShapeRangeContext";
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

kernel_view!(InferShapeRangeContext);

impl InferShapeRangeContext {
    pub fn builder(node: impl Into<Arc<ComputeNodeInfo>>) -> InferShapeRangeContextBuilder {
        InferShapeRangeContextBuilder::new(node)
    }

    fn range_at(&self, flat: usize) -> Option<&ShapeRange> {
        if flat >= self.kernel.compute_node_info().inputs_num() {
            return None;
        }
        self.kernel.input::<ShapeRange>(flat)
    }

    pub fn input_shape_range(&self, index: usize) -> Option<&ShapeRange> {
        self.range_at(index)
    }

    pub fn optional_input_shape_range(&self, ir_index: usize) -> Option<&ShapeRange> {
        self.range_at(self.kernel.ir_input_offset(ir_index, 0)?)
    }

    pub fn dynamic_input_shape_range(&self, ir_index: usize, relative: usize) -> Option<&ShapeRange> {
        self.range_at(self.kernel.ir_input_offset(ir_index, relative)?)
    }

    pub fn output_shape_range(&self, index: usize) -> Option<&ShapeRange> {
        self.kernel.output::<ShapeRange>(index)
    }

    pub fn output_shape_range_mut(&mut self, index: usize) -> Option<&mut ShapeRange> {
        self.kernel.output_mut::<ShapeRange>(index)
    }

    pub fn infer_shape_range_fn(&self) -> Option<InferShapeRangeFn> {
        let slot = self.kernel.compute_node_info().inputs_num();
        self.kernel.input::<InferShapeRangeFn>(slot).copied()
    }

    /// Invoke the stored callback on this context.
    pub fn run(&mut self) -> Result<()> {
        let infer = self.infer_shape_range_fn().ok_or_else(|| {
            Error::Kernel(format!(
                "no infer-shape-range function in context for '{}'",
                self.kernel.node_type()
            ))
        })?;
        infer(self)
    }
}

/// Builds an [`InferShapeRangeContext`].
#[derive(Debug)]
pub struct InferShapeRangeContextBuilder {
    node: Arc<ComputeNodeInfo>,
    inputs: Vec<ShapeRange>,
    infer: Option<InferShapeRangeFn>,
}

impl InferShapeRangeContextBuilder {
    pub fn new(node: impl Into<Arc<ComputeNodeInfo>>) -> Self {
        Self {
            node: node.into(),
            inputs: Vec::new(),
            infer: None,
        }
    }

    pub fn input_range(mut self, range: ShapeRange) -> Self {
        self.inputs.push(range);
        self
    }

    pub fn infer_shape_range_fn(mut self, infer: InferShapeRangeFn) -> Self {
        self.infer = Some(infer);
        self
    }

    pub fn build(self) -> Result<InferShapeRangeContext> {
        let mut inputs: Vec<Slot> = self.inputs.into_iter().map(Slot::new).collect();
        inputs.push(self.infer.map(Slot::new).unwrap_or_default());
        let outputs = (0..self.node.outputs_num())
            .map(|_| Slot::new(ShapeRange::default()))
            .collect();
        KernelContext::new(self.node, inputs, outputs).into_view()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Shape;

    fn widen(ctx: &mut InferShapeRangeContext) -> Result<()> {
        let first = ctx
            .dynamic_input_shape_range(0, 0)
            .cloned()
            .ok_or_else(|| Error::Kernel("no first instance".into()))?;
        let last = ctx
            .dynamic_input_shape_range(0, 1)
            .cloned()
            .ok_or_else(|| Error::Kernel("no second instance".into()))?;
        if let Some(out) = ctx.output_shape_range_mut(0) {
            *out = ShapeRange::new(first.min, last.max);
        }
        Ok(())
    }

    #[test]
    fn test_dynamic_ranges() {
        let node = ComputeNodeInfo::builder()
            .ir_instance_num(&[2])
            .node_io_num(2, 1)
            .build()
            .unwrap();
        let mut ctx = InferShapeRangeContext::builder(node)
            .input_range(ShapeRange::new(vec![1, 8], vec![4, 8]))
            .input_range(ShapeRange::new(vec![2, 8], vec![16, 8]))
            .infer_shape_range_fn(widen)
            .build()
            .unwrap();

        assert!(ctx.dynamic_input_shape_range(0, 2).is_none());
        ctx.run().unwrap();
        let out = ctx.output_shape_range(0).unwrap();
        assert_eq!(out.min, Shape::new(vec![1, 8]));
        assert_eq!(out.max, Shape::new(vec![16, 8]));
    }

    #[test]
    fn test_input_count_mismatch() {
        let node = ComputeNodeInfo::builder().node_io_num(2, 1).build().unwrap();
        let result = InferShapeRangeContext::builder(node)
            .input_range(ShapeRange::default())
            .build();
        assert!(matches!(result, Err(Error::Layout(_))));
    }
}
