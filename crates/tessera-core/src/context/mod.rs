//! Kernel contexts: the single layout through which callbacks see their
//! inputs and outputs.
//!
//! A [`KernelContext`] is a flat array of input slots and a flat array of
//! output slots plus the [`ComputeNodeInfo`] side table. Slots are untyped at
//! the layout level; every read names the type it expects and gets `None` on
//! a mismatch instead of reinterpreting memory.
//!
//! The per-callback contexts ([`InferShapeContext`], [`TilingContext`], ...)
//! are views over the same layout. Each view knows how many extra slots it
//! appends after the node's inputs and how many outputs it carries, and
//! `KernelContext::into_view` refuses a context that does not match.

use crate::compute_node_info::{ComputeNodeInfo, RuntimeAttrs};
use crate::{Error, Result};
use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;

mod infer_datatype;
mod infer_shape;
mod infer_shape_range;
mod tiling;
mod tiling_parse;

pub use infer_datatype::{InferDataTypeContext, InferDataTypeContextBuilder};
pub use infer_shape::{InferShapeContext, InferShapeContextBuilder};
pub use infer_shape_range::{InferShapeRangeContext, InferShapeRangeContextBuilder};
pub use tiling::{
    DEFAULT_MAX_TILING_DATA_SIZE, PlatformInfo, TilingContext, TilingContextBuilder, TilingData,
};
pub use tiling_parse::{CompileInfo, TilingParseContext, TilingParseContextBuilder};

// ───────────────────────────── Callback types ────────────────────────────

/// Shape inference callback.
pub type InferShapeFn = fn(&mut InferShapeContext) -> Result<()>;

/// Shape-range inference callback.
pub type InferShapeRangeFn = fn(&mut InferShapeRangeContext) -> Result<()>;

/// Data type inference callback.
pub type InferDataTypeFn = fn(&mut InferDataTypeContext) -> Result<()>;

/// Tiling callback.
pub type TilingFn = fn(&mut TilingContext) -> Result<()>;

/// Parses compiled kernel metadata into a compile-info object.
pub type TilingParseFn = fn(&mut TilingParseContext) -> Result<()>;

/// Kernel execution callback.
pub type ExecuteFn = fn(&mut KernelContext) -> Result<()>;

/// Allocates an empty compile-info object.
pub type CompileInfoCreator = fn() -> Box<dyn Any + Send + Sync>;

/// Releases a compile-info object allocated by the paired creator.
pub type CompileInfoDeleter = fn(Box<dyn Any + Send + Sync>);

/// Creator for a compile-info object of type `T`.
pub fn create_compile_info<T: Default + Send + Sync + 'static>() -> Box<dyn Any + Send + Sync> {
    Box::new(T::default())
}

/// Deleter paired with [`create_compile_info::<T>`].
pub fn delete_compile_info<T: Send + Sync + 'static>(info: Box<dyn Any + Send + Sync>) {
    if info.downcast::<T>().is_err() {
        tracing::error!(
            expected = type_name::<T>(),
            "compile info released by a deleter for another type"
        );
    }
}

// ────────────────────────────────── Slot ─────────────────────────────────

/// One input or output position of a kernel context.
#[derive(Default)]
pub struct Slot {
    value: Option<Box<dyn Any + Send + Sync>>,
    type_name: &'static str,
}

impl Slot {
    /// An unoccupied slot.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A slot holding `value`.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Some(Box::new(value)),
            type_name: type_name::<T>(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }

    /// Name of the stored type, or `""` for an empty slot.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Read the slot as `T`.
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.value.as_ref()?.downcast_ref::<T>()
    }

    /// Mutably access the slot as `T`.
    pub fn get_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.value.as_mut()?.downcast_mut::<T>()
    }

    /// Replace the slot contents.
    pub fn set<T: Any + Send + Sync>(&mut self, value: T) {
        *self = Self::new(value);
    }

    /// Move the value out if it has type `T`, leaving the slot empty.
    pub fn take<T: Any>(&mut self) -> Option<T> {
        if !self.value.as_ref()?.is::<T>() {
            return None;
        }
        let boxed = self.value.take()?.downcast::<T>().ok()?;
        self.type_name = "";
        Some(*boxed)
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("Slot(<empty>)")
        } else {
            write!(f, "Slot({})", self.type_name)
        }
    }
}

// ────────────────────────────── KernelContext ────────────────────────────

/// The flat input/output layout of one callback invocation.
#[derive(Debug)]
pub struct KernelContext {
    node: Arc<ComputeNodeInfo>,
    inputs: Vec<Slot>,
    outputs: Vec<Slot>,
}

impl KernelContext {
    /// Assemble a context from already-filled slots.
    pub fn new(node: impl Into<Arc<ComputeNodeInfo>>, inputs: Vec<Slot>, outputs: Vec<Slot>) -> Self {
        Self {
            node: node.into(),
            inputs,
            outputs,
        }
    }

    pub fn builder(node: impl Into<Arc<ComputeNodeInfo>>) -> KernelContextBuilder {
        KernelContextBuilder::new(node)
    }

    pub fn compute_node_info(&self) -> &ComputeNodeInfo {
        &self.node
    }

    pub fn node_type(&self) -> &str {
        self.node.node_type()
    }

    pub fn node_name(&self) -> &str {
        self.node.node_name()
    }

    pub fn attrs(&self) -> &RuntimeAttrs {
        self.node.attrs()
    }

    /// Number of input slots, including any slots a view appends.
    pub fn input_num(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_num(&self) -> usize {
        self.outputs.len()
    }

    // ── Slot access ──

    pub fn input_slot(&self, index: usize) -> Option<&Slot> {
        self.inputs.get(index)
    }

    pub fn output_slot(&self, index: usize) -> Option<&Slot> {
        self.outputs.get(index)
    }

    /// Read input slot `index` as `T`.
    pub fn input<T: Any>(&self, index: usize) -> Option<&T> {
        self.inputs.get(index)?.get::<T>()
    }

    pub fn input_mut<T: Any>(&mut self, index: usize) -> Option<&mut T> {
        self.inputs.get_mut(index)?.get_mut::<T>()
    }

    /// Read output slot `index` as `T`.
    pub fn output<T: Any>(&self, index: usize) -> Option<&T> {
        self.outputs.get(index)?.get::<T>()
    }

    pub fn output_mut<T: Any>(&mut self, index: usize) -> Option<&mut T> {
        self.outputs.get_mut(index)?.get_mut::<T>()
    }

    /// Replace output slot `index`.
    ///
    /// # Errors
    ///
    /// Returns an error if `index` is outside the output array.
    pub fn set_output<T: Any + Send + Sync>(&mut self, index: usize, value: T) -> Result<()> {
        let count = self.outputs.len();
        let slot = self.outputs.get_mut(index).ok_or_else(|| {
            Error::Layout(format!("output index {} out of {} outputs", index, count))
        })?;
        slot.set(value);
        Ok(())
    }

    /// Move output slot `index` out if it holds a `T`.
    pub fn take_output<T: Any>(&mut self, index: usize) -> Option<T> {
        self.outputs.get_mut(index)?.take::<T>()
    }

    // ── IR translation ──

    /// Flat input offset of instance `relative` of IR input `ir_index`.
    ///
    /// `None` when the IR input is not instantiated or `relative` is past its
    /// instance count.
    pub fn ir_input_offset(&self, ir_index: usize, relative: usize) -> Option<usize> {
        self.node.input_offset(ir_index, relative)
    }

    /// Read instance `relative` of IR input `ir_index` as `T`.
    pub fn ir_input<T: Any>(&self, ir_index: usize, relative: usize) -> Option<&T> {
        self.input::<T>(self.ir_input_offset(ir_index, relative)?)
    }

    // ── Views ──

    /// Reinterpret this context as a callback-specific view.
    ///
    /// # Errors
    ///
    /// Returns `Error::Layout` if the slot counts do not match what `V`
    /// expects for this node.
    pub fn into_view<V: KernelContextView>(self) -> Result<V> {
        let expected_inputs = V::leading_inputs(&self.node) + V::TRAILING_INPUTS;
        let expected_outputs = V::expected_outputs(&self.node);
        if self.inputs.len() != expected_inputs || self.outputs.len() != expected_outputs {
            return Err(Error::Layout(format!(
                "{} for '{}' expects {} inputs and {} outputs, got {} and {}",
                V::NAME,
                self.node.node_type(),
                expected_inputs,
                expected_outputs,
                self.inputs.len(),
                self.outputs.len()
            )));
        }
        Ok(V::wrap(self))
    }
}

/// A callback-specific view over a [`KernelContext`].
pub trait KernelContextView: Sized {
    /// View name used in layout errors.
    const NAME: &'static str;

    /// Slots appended after the leading inputs.
    const TRAILING_INPUTS: usize;

    /// Output count when it does not follow the node's outputs.
    const FIXED_OUTPUTS: Option<usize> = None;

    /// Inputs that precede the trailing slots.
    fn leading_inputs(node: &ComputeNodeInfo) -> usize {
        node.inputs_num()
    }

    fn expected_outputs(node: &ComputeNodeInfo) -> usize {
        Self::FIXED_OUTPUTS.unwrap_or_else(|| node.outputs_num())
    }

    /// Wrap a context whose layout has already been checked.
    fn wrap(kernel: KernelContext) -> Self;

    fn kernel(&self) -> &KernelContext;

    fn into_kernel(self) -> KernelContext;
}

/// Implements the view plumbing for a newtype over `KernelContext`.
macro_rules! kernel_view {
    ($view:ident) => {
        impl std::ops::Deref for $view {
            type Target = $crate::context::KernelContext;

            fn deref(&self) -> &Self::Target {
                &self.kernel
            }
        }

        impl std::ops::DerefMut for $view {
            fn deref_mut(&mut self) -> &mut Self::Target {
                &mut self.kernel
            }
        }
    };
}
pub(crate) use kernel_view;

// ────────────────────────────── Builder ─────────────────────────────

/// Assembles a [`KernelContext`] slot by slot.
#[derive(Debug)]
pub struct KernelContextBuilder {
    node: Arc<ComputeNodeInfo>,
    inputs: Vec<Slot>,
    outputs: Vec<Slot>,
}

impl KernelContextBuilder {
    pub fn new(node: impl Into<Arc<ComputeNodeInfo>>) -> Self {
        Self {
            node: node.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn input<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.inputs.push(Slot::new(value));
        self
    }

    pub fn input_slot(mut self, slot: Slot) -> Self {
        self.inputs.push(slot);
        self
    }

    pub fn output<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.outputs.push(Slot::new(value));
        self
    }

    pub fn output_slot(mut self, slot: Slot) -> Self {
        self.outputs.push(slot);
        self
    }

    pub fn build(self) -> KernelContext {
        KernelContext::new(self.node, self.inputs, self.outputs)
    }

    /// Build and check the layout against view `V`.
    pub fn build_view<V: KernelContextView>(self) -> Result<V> {
        self.build().into_view::<V>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, StorageShape};

    fn node(instances: &[usize], inputs: usize, outputs: usize) -> ComputeNodeInfo {
        ComputeNodeInfo::builder()
            .node_type("Test")
            .ir_instance_num(instances)
            .node_io_num(inputs, outputs)
            .build()
            .unwrap()
    }

    #[test]
    fn test_slot_typed_access() {
        let mut slot = Slot::new(7u64);
        assert_eq!(slot.get::<u64>(), Some(&7));
        assert_eq!(slot.get::<u32>(), None);
        assert!(slot.type_name().contains("u64"));

        *slot.get_mut::<u64>().unwrap() = 9;
        assert_eq!(slot.take::<u32>(), None);
        assert_eq!(slot.take::<u64>(), Some(9));
        assert!(slot.is_empty());
        assert_eq!(slot.get::<u64>(), None);
    }

    #[test]
    fn test_ir_input_translation() {
        let ctx = KernelContext::builder(node(&[1, 2, 0, 1], 4, 0))
            .input(StorageShape::uniform(vec![1]))
            .input(StorageShape::uniform(vec![2]))
            .input(StorageShape::uniform(vec![3]))
            .input(StorageShape::uniform(vec![4]))
            .build();

        let dims = |ir, rel| {
            ctx.ir_input::<StorageShape>(ir, rel)
                .map(|s| s.origin.dims().to_vec())
        };
        assert_eq!(dims(0, 0), Some(vec![1]));
        assert_eq!(dims(1, 0), Some(vec![2]));
        assert_eq!(dims(1, 1), Some(vec![3]));
        assert_eq!(dims(1, 2), None);
        assert_eq!(dims(2, 0), None);
        assert_eq!(dims(3, 0), Some(vec![4]));
    }

    #[test]
    fn test_set_output_bounds() {
        let mut ctx = KernelContext::builder(node(&[], 0, 1))
            .output(DataType::Undefined)
            .build();
        ctx.set_output(0, DataType::F32).unwrap();
        assert_eq!(ctx.output::<DataType>(0), Some(&DataType::F32));
        assert!(ctx.set_output(1, DataType::F32).is_err());
    }

    #[test]
    fn test_into_view_rejects_wrong_layout() {
        // Missing the trailing infer-shape function slot.
        let result = KernelContext::builder(node(&[1], 1, 1))
            .input(StorageShape::uniform(vec![1]))
            .output(StorageShape::default())
            .build_view::<InferShapeContext>();
        assert!(matches!(result, Err(Error::Layout(_))));
    }

    #[test]
    fn test_compile_info_creator_and_deleter_agree() {
        #[derive(Default)]
        struct Info {
            block: u32,
        }
        let info = create_compile_info::<Info>();
        assert_eq!(info.downcast_ref::<Info>().map(|i| i.block), Some(0));
        delete_compile_info::<Info>(info);
    }
}
