//! Fluent registration of operator implementations.

use crate::op_impl::{
    DependencyKind, Diagnostic, MAX_DEPENDENCY_INDEX, OpImplFunctions, mask_indices,
};
use crate::registry::OpImplRegistry;
use tessera_core::context::DEFAULT_MAX_TILING_DATA_SIZE;
use tessera_core::{
    AttrValue, ExecuteFn, InferDataTypeFn, InferShapeFn, InferShapeRangeFn, TilingFn,
    TilingParseFn,
};

/// Collects one operator's callbacks and facts, then merges them into a
/// registry.
///
/// Registering the same op type twice merges: callbacks given here replace
/// the registered ones, unset callbacks are left alone, and dependency
/// indices accumulate unless the matching `reset_*` method was called.
///
/// # Example
///
/// ```ignore
/// OpImplRegister::new("Reshape")
///     .infer_shape(infer_reshape)
///     .tiling_with_max_size(tiling_reshape, 512)
///     .inputs_data_dependency(&[1])
///     .private_attr_with_default("allowzero", AttrValue::Int(0))
///     .register();
/// ```
#[derive(Debug)]
#[must_use = "an OpImplRegister does nothing until `register` is called"]
pub struct OpImplRegister {
    op_type: String,
    funcs: OpImplFunctions,
    declared_private_attrs: bool,
    reset_inputs_dependency: bool,
    reset_tiling_dependency: bool,
}

impl OpImplRegister {
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            funcs: OpImplFunctions::new(),
            declared_private_attrs: false,
            reset_inputs_dependency: false,
            reset_tiling_dependency: false,
        }
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    // ── Callbacks ──

    pub fn infer_shape(mut self, infer: InferShapeFn) -> Self {
        self.funcs.set_infer_shape(infer);
        self
    }

    pub fn infer_shape_range(mut self, infer: InferShapeRangeFn) -> Self {
        self.funcs.set_infer_shape_range(infer);
        self
    }

    pub fn infer_datatype(mut self, infer: InferDataTypeFn) -> Self {
        self.funcs.set_infer_datatype(infer);
        self
    }

    pub fn execute(mut self, execute: ExecuteFn) -> Self {
        self.funcs.set_execute(execute);
        self
    }

    /// Set the tiling callback with the default tiling data capacity.
    pub fn tiling(self, tiling: TilingFn) -> Self {
        self.tiling_with_max_size(tiling, DEFAULT_MAX_TILING_DATA_SIZE)
    }

    /// Set the tiling callback with an explicit tiling data capacity.
    pub fn tiling_with_max_size(mut self, tiling: TilingFn, max_tiling_data_size: usize) -> Self {
        self.funcs.set_tiling(tiling, max_tiling_data_size);
        self
    }

    /// Set the tiling-parse callback for compile info of type `T`.
    pub fn tiling_parse<T: Default + Send + Sync + 'static>(mut self, parse: TilingParseFn) -> Self {
        self.funcs.set_tiling_parse::<T>(parse);
        self
    }

    // ── Dependencies ──

    /// Mark IR inputs as value-dependent for shape inference.
    pub fn inputs_data_dependency(mut self, indices: &[usize]) -> Self {
        for &index in indices {
            self.mark(DependencyKind::Data, index);
        }
        self
    }

    /// Drop the input dependencies already registered for this op type
    /// before merging the ones given here.
    pub fn reset_inputs_data_dependency(mut self) -> Self {
        self.reset_inputs_dependency = true;
        self.funcs.reset_inputs_data_dependency();
        self
    }

    /// Mark IR inputs as value-dependent for tiling.
    pub fn tiling_inputs_data_dependency(mut self, indices: &[usize]) -> Self {
        for &index in indices {
            self.mark(DependencyKind::Tiling, index);
        }
        self
    }

    pub fn reset_tiling_inputs_data_dependency(mut self) -> Self {
        self.reset_tiling_dependency = true;
        self.funcs.reset_tiling_input_data_dependency();
        self
    }

    /// Mark IR inputs that live on the host.
    pub fn host_inputs(mut self, indices: &[usize]) -> Self {
        for &index in indices {
            self.mark(DependencyKind::Host, index);
        }
        self
    }

    // Bits are collected raw here; overlaps are detected against the
    // registered bundle when merging.
    fn mark(&mut self, kind: DependencyKind, index: usize) {
        if index >= MAX_DEPENDENCY_INDEX {
            tracing::error!(
                op_type = %self.op_type,
                %kind,
                index,
                "dependency index out of range, ignored"
            );
            self.funcs
                .diagnostics
                .push(Diagnostic::InvalidDependencyIndex { kind, index });
            return;
        }
        let bit = 1u64 << index;
        match kind {
            DependencyKind::Data => self.funcs.inputs_dependency |= bit,
            DependencyKind::Tiling => self.funcs.tiling_dependency |= bit,
            DependencyKind::Host => self.funcs.host_inputs |= bit,
        }
    }

    // ── Private attributes ──

    /// Declare a private attribute without a default value.
    pub fn private_attr(mut self, name: &str) -> Self {
        self.declared_private_attrs = true;
        self.funcs.add_private_attr(name, None);
        self
    }

    /// Declare a private attribute with a default value.
    pub fn private_attr_with_default(mut self, name: &str, default: impl Into<AttrValue>) -> Self {
        self.declared_private_attrs = true;
        self.funcs.add_private_attr(name, Some(default.into()));
        self
    }

    // ── Registration ──

    /// Merge into the process-wide registry.
    pub fn register(self) {
        self.register_into(OpImplRegistry::global());
    }

    /// Merge into `registry`.
    pub fn register_into(self, registry: &OpImplRegistry) {
        let op_type = self.op_type.clone();
        let mut target = registry.create_or_get(&op_type);
        self.merge_into(&mut target);
        tracing::debug!(
            op_type = %op_type,
            inputs_dependency = target.inputs_dependency_mask(),
            tiling_dependency = target.tiling_dependency_mask(),
            "registered op impl"
        );
    }

    fn merge_into(self, target: &mut OpImplFunctions) {
        let src = self.funcs;

        if src.infer_shape.is_some() {
            target.infer_shape = src.infer_shape;
        }
        if src.infer_shape_range.is_some() {
            target.infer_shape_range = src.infer_shape_range;
        }
        if src.infer_datatype.is_some() {
            target.infer_datatype = src.infer_datatype;
        }
        if src.execute.is_some() {
            target.execute = src.execute;
        }
        if src.tiling.is_some() {
            target.tiling = src.tiling;
            target.max_tiling_data_size = src.max_tiling_data_size;
        }
        if src.tiling_parse.is_some() {
            target.tiling_parse = src.tiling_parse;
            target.compile_info_creator = src.compile_info_creator;
            target.compile_info_deleter = src.compile_info_deleter;
        }

        if self.reset_inputs_dependency {
            target.reset_inputs_data_dependency();
        }
        if self.reset_tiling_dependency {
            target.reset_tiling_input_data_dependency();
        }
        // Indices were range-checked when collected.
        for index in mask_indices(src.inputs_dependency) {
            let _ = target.set_input_data_dependency(index);
        }
        for index in mask_indices(src.tiling_dependency) {
            let _ = target.set_tiling_input_data_dependency(index);
        }
        target.host_inputs |= src.host_inputs;

        if self.declared_private_attrs {
            target.replace_private_attrs(src.private_attrs);
        }
        target.diagnostics.extend(src.diagnostics);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{InferShapeContext, TilingContext, TilingParseContext};

    fn infer_a(_ctx: &mut InferShapeContext) -> tessera_core::Result<()> {
        Ok(())
    }

    fn infer_b(ctx: &mut InferShapeContext) -> tessera_core::Result<()> {
        if let Some(out) = ctx.output_shape_mut(0) {
            out.append_dim(1);
        }
        Ok(())
    }

    fn tiling_a(_ctx: &mut TilingContext) -> tessera_core::Result<()> {
        Ok(())
    }

    fn parse_a(_ctx: &mut TilingParseContext) -> tessera_core::Result<()> {
        Ok(())
    }

    #[test]
    fn test_register_sets_callbacks() {
        let registry = OpImplRegistry::new();
        OpImplRegister::new("Relu")
            .infer_shape(infer_a)
            .tiling(tiling_a)
            .tiling_parse::<u64>(parse_a)
            .register_into(&registry);

        let relu = registry.get("Relu").unwrap();
        assert!(relu.infer_shape().is_some());
        assert!(relu.tiling().is_some());
        assert_eq!(relu.max_tiling_data_size(), DEFAULT_MAX_TILING_DATA_SIZE);
        assert!(relu.tiling_parse().is_some());
        assert!(relu.compile_info_creator().is_some());
        assert!(relu.execute().is_none());
    }

    #[test]
    fn test_tiling_max_size() {
        let registry = OpImplRegistry::new();
        OpImplRegister::new("Conv2D")
            .tiling_with_max_size(tiling_a, 4096)
            .register_into(&registry);
        assert_eq!(registry.get("Conv2D").unwrap().max_tiling_data_size(), 4096);

        // Setting tiling again without a size returns to the default.
        OpImplRegister::new("Conv2D")
            .tiling(tiling_a)
            .register_into(&registry);
        assert_eq!(
            registry.get("Conv2D").unwrap().max_tiling_data_size(),
            DEFAULT_MAX_TILING_DATA_SIZE
        );
    }

    #[test]
    fn test_second_registration_merges() {
        let registry = OpImplRegistry::new();
        OpImplRegister::new("Reshape")
            .infer_shape(infer_a)
            .tiling(tiling_a)
            .inputs_data_dependency(&[1])
            .private_attr_with_default("allowzero", AttrValue::Int(0))
            .register_into(&registry);
        OpImplRegister::new("Reshape")
            .infer_shape(infer_b)
            .inputs_data_dependency(&[2])
            .register_into(&registry);

        let reshape = registry.get("Reshape").unwrap();
        assert!(reshape.tiling().is_some());
        assert_eq!(reshape.inputs_dependency_mask(), 0b110);
        // Not redeclared, so kept.
        assert_eq!(reshape.private_attrs().len(), 1);

        // The second infer-shape callback replaced the first.
        let info = tessera_core::ComputeNodeInfo::builder()
            .node_type("Reshape")
            .node_io_num(0, 1)
            .build()
            .unwrap();
        let mut ctx = InferShapeContext::builder(info).build().unwrap();
        let infer = reshape.infer_shape().unwrap();
        infer(&mut ctx).unwrap();
        assert_eq!(ctx.output_shape(0).map(|s| s.dim_num()), Some(1));
    }

    #[test]
    fn test_reset_dependency_before_merge() {
        let registry = OpImplRegistry::new();
        OpImplRegister::new("Slice")
            .inputs_data_dependency(&[1, 2])
            .register_into(&registry);
        OpImplRegister::new("Slice")
            .reset_inputs_data_dependency()
            .inputs_data_dependency(&[3])
            .register_into(&registry);

        let slice = registry.get("Slice").unwrap();
        assert!(!slice.is_input_data_dependency(1));
        assert!(!slice.is_input_data_dependency(2));
        assert!(slice.is_input_data_dependency(3));
    }

    #[test]
    fn test_private_attrs_replaced_when_redeclared() {
        let registry = OpImplRegistry::new();
        OpImplRegister::new("Gelu")
            .private_attr("approximate")
            .private_attr("fast")
            .register_into(&registry);
        OpImplRegister::new("Gelu")
            .private_attr_with_default("approximate", "tanh".to_string())
            .register_into(&registry);

        let attrs = registry.private_attrs("Gelu");
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs[0].default, Some(AttrValue::String("tanh".into())));
    }

    #[test]
    fn test_overlap_reported_on_merge() {
        let registry = OpImplRegistry::new();
        OpImplRegister::new("TopK")
            .inputs_data_dependency(&[1])
            .tiling_inputs_data_dependency(&[1])
            .register_into(&registry);

        let topk = registry.get("TopK").unwrap();
        assert!(topk.is_input_data_dependency(1));
        assert!(topk.is_tiling_input_data_dependency(1));
        assert_eq!(topk.diagnostics(), &[Diagnostic::DependencyOverlap { index: 1 }]);
    }

    #[test]
    fn test_out_of_range_index_ignored() {
        let registry = OpImplRegistry::new();
        OpImplRegister::new("Pad")
            .inputs_data_dependency(&[1, 64])
            .host_inputs(&[2])
            .register_into(&registry);

        let pad = registry.get("Pad").unwrap();
        assert_eq!(pad.inputs_dependency_mask(), 0b10);
        assert!(pad.is_host_input(2));
        assert_eq!(
            pad.diagnostics(),
            &[Diagnostic::InvalidDependencyIndex {
                kind: DependencyKind::Data,
                index: 64
            }]
        );
    }
}
