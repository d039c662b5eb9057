//! The per-operator implementation bundle.
//!
//! Every callback is optional. Input dependency facts are kept as 64-bit
//! masks over IR input indices: bit `i` set means IR input `i` has the
//! property. Problems found while filling a bundle (an input marked both
//! data-dependent and tiling-dependent, a duplicate private attribute) are
//! logged and kept as [`Diagnostic`]s so callers can inspect them later.

use crate::{Error, Result};
use std::collections::HashSet;
use std::fmt;
use tessera_core::context::{create_compile_info, delete_compile_info};
use tessera_core::{
    AttrValue, CompileInfoCreator, CompileInfoDeleter, ExecuteFn, InferDataTypeFn, InferShapeFn,
    InferShapeRangeFn, PrivateAttr, TilingFn, TilingParseFn,
};

/// Width of the dependency masks; IR indices at or above this are rejected.
pub const MAX_DEPENDENCY_INDEX: usize = 64;

/// Which dependency mask an index refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyKind {
    /// The input's value is needed for shape inference.
    Data,
    /// The input's value is needed for tiling.
    Tiling,
    /// The input is placed on the host.
    Host,
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyKind::Data => write!(f, "data"),
            DependencyKind::Tiling => write!(f, "tiling"),
            DependencyKind::Host => write!(f, "host input"),
        }
    }
}

/// A non-fatal problem recorded while a bundle was filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// IR input `index` is both data-dependent and tiling-dependent.
    DependencyOverlap { index: usize },
    /// A private attribute was declared more than once; the last value won.
    DuplicatePrivateAttr { name: String },
    /// A dependency index was out of range and ignored.
    InvalidDependencyIndex { kind: DependencyKind, index: usize },
    /// A private attribute with an empty name was ignored.
    EmptyPrivateAttrName,
}

/// Callbacks, dependency masks and private attributes of one operator type.
#[derive(Debug, Clone)]
pub struct OpImplFunctions {
    pub(crate) infer_shape: Option<InferShapeFn>,
    pub(crate) infer_shape_range: Option<InferShapeRangeFn>,
    pub(crate) infer_datatype: Option<InferDataTypeFn>,
    pub(crate) execute: Option<ExecuteFn>,

    // Set together.
    pub(crate) tiling: Option<TilingFn>,
    pub(crate) max_tiling_data_size: usize,

    // Set together.
    pub(crate) tiling_parse: Option<TilingParseFn>,
    pub(crate) compile_info_creator: Option<CompileInfoCreator>,
    pub(crate) compile_info_deleter: Option<CompileInfoDeleter>,

    pub(crate) inputs_dependency: u64,
    pub(crate) tiling_dependency: u64,
    pub(crate) host_inputs: u64,

    pub(crate) private_attrs: Vec<PrivateAttr>,
    pub(crate) unique_private_attrs: HashSet<String>,

    pub(crate) diagnostics: Vec<Diagnostic>,
}

impl OpImplFunctions {
    /// An empty bundle: no callbacks, no dependencies.
    pub fn new() -> Self {
        Self {
            infer_shape: None,
            infer_shape_range: None,
            infer_datatype: None,
            execute: None,
            tiling: None,
            max_tiling_data_size: tessera_core::context::DEFAULT_MAX_TILING_DATA_SIZE,
            tiling_parse: None,
            compile_info_creator: None,
            compile_info_deleter: None,
            inputs_dependency: 0,
            tiling_dependency: 0,
            host_inputs: 0,
            private_attrs: Vec::new(),
            unique_private_attrs: HashSet::new(),
            diagnostics: Vec::new(),
        }
    }

    // ── Callbacks ──

    pub fn infer_shape(&self) -> Option<InferShapeFn> {
        self.infer_shape
    }

    pub fn infer_shape_range(&self) -> Option<InferShapeRangeFn> {
        self.infer_shape_range
    }

    pub fn infer_datatype(&self) -> Option<InferDataTypeFn> {
        self.infer_datatype
    }

    pub fn execute(&self) -> Option<ExecuteFn> {
        self.execute
    }

    pub fn tiling(&self) -> Option<TilingFn> {
        self.tiling
    }

    /// Byte capacity of the tiling data buffer handed to the tiling callback.
    pub fn max_tiling_data_size(&self) -> usize {
        self.max_tiling_data_size
    }

    pub fn tiling_parse(&self) -> Option<TilingParseFn> {
        self.tiling_parse
    }

    pub fn compile_info_creator(&self) -> Option<CompileInfoCreator> {
        self.compile_info_creator
    }

    pub fn compile_info_deleter(&self) -> Option<CompileInfoDeleter> {
        self.compile_info_deleter
    }

    pub fn set_infer_shape(&mut self, infer: InferShapeFn) -> &mut Self {
        self.infer_shape = Some(infer);
        self
    }

    pub fn set_infer_shape_range(&mut self, infer: InferShapeRangeFn) -> &mut Self {
        self.infer_shape_range = Some(infer);
        self
    }

    pub fn set_infer_datatype(&mut self, infer: InferDataTypeFn) -> &mut Self {
        self.infer_datatype = Some(infer);
        self
    }

    pub fn set_execute(&mut self, execute: ExecuteFn) -> &mut Self {
        self.execute = Some(execute);
        self
    }

    /// Set the tiling callback and its data capacity.
    pub fn set_tiling(&mut self, tiling: TilingFn, max_tiling_data_size: usize) -> &mut Self {
        self.tiling = Some(tiling);
        self.max_tiling_data_size = max_tiling_data_size;
        self
    }

    /// Set the tiling-parse callback with a creator and deleter for
    /// compile-info objects of type `T`.
    pub fn set_tiling_parse<T: Default + Send + Sync + 'static>(
        &mut self,
        parse: TilingParseFn,
    ) -> &mut Self {
        self.set_tiling_parse_raw(
            parse,
            create_compile_info::<T>,
            Some(delete_compile_info::<T>),
        )
    }

    /// Set the tiling-parse triad from explicit functions.
    pub fn set_tiling_parse_raw(
        &mut self,
        parse: TilingParseFn,
        creator: CompileInfoCreator,
        deleter: Option<CompileInfoDeleter>,
    ) -> &mut Self {
        self.tiling_parse = Some(parse);
        self.compile_info_creator = Some(creator);
        self.compile_info_deleter = deleter;
        self
    }

    // ── Dependency masks ──

    /// Mark IR input `index` as value-dependent for shape inference.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidDependencyIndex` if `index` does not fit the
    /// mask; the bundle is left unchanged apart from a recorded diagnostic.
    pub fn set_input_data_dependency(&mut self, index: usize) -> Result<()> {
        let bit = self.checked_bit(DependencyKind::Data, index)?;
        if self.inputs_dependency & bit != 0 {
            return Ok(());
        }
        self.inputs_dependency |= bit;
        if self.tiling_dependency & bit != 0 {
            self.record_overlap(index);
        }
        Ok(())
    }

    /// Mark IR input `index` as value-dependent for tiling.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidDependencyIndex` if `index` does not fit the mask.
    pub fn set_tiling_input_data_dependency(&mut self, index: usize) -> Result<()> {
        let bit = self.checked_bit(DependencyKind::Tiling, index)?;
        if self.tiling_dependency & bit != 0 {
            return Ok(());
        }
        self.tiling_dependency |= bit;
        if self.inputs_dependency & bit != 0 {
            self.record_overlap(index);
        }
        Ok(())
    }

    /// Mark IR input `index` as a host input.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidDependencyIndex` if `index` does not fit the mask.
    pub fn set_host_input(&mut self, index: usize) -> Result<()> {
        let bit = self.checked_bit(DependencyKind::Host, index)?;
        self.host_inputs |= bit;
        Ok(())
    }

    pub fn reset_inputs_data_dependency(&mut self) {
        self.inputs_dependency = 0;
    }

    pub fn reset_tiling_input_data_dependency(&mut self) {
        self.tiling_dependency = 0;
    }

    pub fn reset_host_inputs(&mut self) {
        self.host_inputs = 0;
    }

    /// Out-of-range indices read as `false`.
    pub fn is_input_data_dependency(&self, index: usize) -> bool {
        mask_bit(index).is_some_and(|bit| self.inputs_dependency & bit != 0)
    }

    pub fn is_tiling_input_data_dependency(&self, index: usize) -> bool {
        mask_bit(index).is_some_and(|bit| self.tiling_dependency & bit != 0)
    }

    pub fn is_host_input(&self, index: usize) -> bool {
        mask_bit(index).is_some_and(|bit| self.host_inputs & bit != 0)
    }

    pub fn inputs_dependency_mask(&self) -> u64 {
        self.inputs_dependency
    }

    pub fn tiling_dependency_mask(&self) -> u64 {
        self.tiling_dependency
    }

    pub fn host_inputs_mask(&self) -> u64 {
        self.host_inputs
    }

    fn checked_bit(&mut self, kind: DependencyKind, index: usize) -> Result<u64> {
        match mask_bit(index) {
            Some(bit) => Ok(bit),
            None => {
                tracing::error!(%kind, index, max = MAX_DEPENDENCY_INDEX, "dependency index out of range");
                self.diagnostics
                    .push(Diagnostic::InvalidDependencyIndex { kind, index });
                Err(Error::InvalidDependencyIndex {
                    kind,
                    index,
                    max: MAX_DEPENDENCY_INDEX,
                })
            }
        }
    }

    fn record_overlap(&mut self, index: usize) {
        tracing::warn!(
            index,
            "input is marked both data-dependent and tiling-dependent"
        );
        self.diagnostics.push(Diagnostic::DependencyOverlap { index });
    }

    // ── Private attributes ──

    /// Declare a private attribute. Declaring a name twice keeps its original
    /// position and replaces the default. An empty name is ignored.
    pub fn add_private_attr(&mut self, name: &str, default: Option<AttrValue>) -> &mut Self {
        if name.is_empty() {
            tracing::error!("private attribute name is empty");
            self.diagnostics.push(Diagnostic::EmptyPrivateAttrName);
            return self;
        }
        if self.unique_private_attrs.insert(name.to_string()) {
            self.private_attrs.push(PrivateAttr::new(name, default));
            return self;
        }

        tracing::warn!(attr = name, "duplicate private attribute, keeping the last default");
        self.diagnostics.push(Diagnostic::DuplicatePrivateAttr {
            name: name.to_string(),
        });
        if let Some(existing) = self.private_attrs.iter_mut().find(|attr| attr.name == name) {
            existing.default = default;
        }
        self
    }

    /// Private attributes in declaration order.
    pub fn private_attrs(&self) -> &[PrivateAttr] {
        &self.private_attrs
    }

    /// Problems recorded while this bundle was filled in.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub(crate) fn replace_private_attrs(&mut self, attrs: Vec<PrivateAttr>) {
        self.unique_private_attrs = attrs.iter().map(|attr| attr.name.clone()).collect();
        self.private_attrs = attrs;
    }
}

impl Default for OpImplFunctions {
    fn default() -> Self {
        Self::new()
    }
}

fn mask_bit(index: usize) -> Option<u64> {
    (index < MAX_DEPENDENCY_INDEX).then(|| 1u64 << index)
}

/// Indices of the set bits of `mask`, lowest first.
pub(crate) fn mask_indices(mask: u64) -> impl Iterator<Item = usize> {
    (0..MAX_DEPENDENCY_INDEX).filter(move |&i| mask & (1u64 << i) != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::InferShapeContext;

    fn noop_infer(_ctx: &mut InferShapeContext) -> tessera_core::Result<()> {
        Ok(())
    }

    #[test]
    fn test_empty_bundle() {
        let funcs = OpImplFunctions::new();
        assert!(funcs.infer_shape().is_none());
        assert!(funcs.tiling().is_none());
        assert_eq!(funcs.inputs_dependency_mask(), 0);
        assert!(!funcs.is_input_data_dependency(0));
        assert!(funcs.private_attrs().is_empty());
        assert!(funcs.diagnostics().is_empty());
    }

    #[test]
    fn test_dependency_bits() {
        let mut funcs = OpImplFunctions::new();
        funcs.set_input_data_dependency(0).unwrap();
        funcs.set_input_data_dependency(2).unwrap();
        funcs.set_host_input(63).unwrap();

        assert_eq!(funcs.inputs_dependency_mask(), 0b101);
        assert!(funcs.is_input_data_dependency(2));
        assert!(!funcs.is_input_data_dependency(1));
        assert!(funcs.is_host_input(63));
        assert!(!funcs.is_input_data_dependency(64));
        assert!(!funcs.is_tiling_input_data_dependency(1000));

        funcs.reset_inputs_data_dependency();
        assert_eq!(funcs.inputs_dependency_mask(), 0);
        assert!(funcs.is_host_input(63));
    }

    #[test]
    fn test_out_of_range_index_rejected() {
        let mut funcs = OpImplFunctions::new();
        let result = funcs.set_input_data_dependency(64);
        assert!(matches!(
            result,
            Err(Error::InvalidDependencyIndex { index: 64, .. })
        ));
        assert_eq!(funcs.inputs_dependency_mask(), 0);
        assert_eq!(
            funcs.diagnostics(),
            &[Diagnostic::InvalidDependencyIndex {
                kind: DependencyKind::Data,
                index: 64
            }]
        );
    }

    #[test]
    fn test_overlap_keeps_both_bits() {
        let mut funcs = OpImplFunctions::new();
        funcs.set_input_data_dependency(1).unwrap();
        funcs.set_tiling_input_data_dependency(1).unwrap();

        assert!(funcs.is_input_data_dependency(1));
        assert!(funcs.is_tiling_input_data_dependency(1));
        assert_eq!(funcs.diagnostics(), &[Diagnostic::DependencyOverlap { index: 1 }]);

        // Setting an already-set bit again does not report twice.
        funcs.set_tiling_input_data_dependency(1).unwrap();
        assert_eq!(funcs.diagnostics().len(), 1);
    }

    fn set(funcs: &mut OpImplFunctions, kind: DependencyKind, index: usize) -> Result<()> {
        match kind {
            DependencyKind::Data => funcs.set_input_data_dependency(index),
            DependencyKind::Tiling => funcs.set_tiling_input_data_dependency(index),
            DependencyKind::Host => funcs.set_host_input(index),
        }
    }

    // (data, tiling, host)
    fn masks(funcs: &OpImplFunctions) -> [u64; 3] {
        [
            funcs.inputs_dependency_mask(),
            funcs.tiling_dependency_mask(),
            funcs.host_inputs_mask(),
        ]
    }

    #[test]
    fn test_masks_are_independent() {
        let cases = [
            (DependencyKind::Data, 0),
            (DependencyKind::Tiling, 1),
            (DependencyKind::Host, 2),
        ];
        for (kind, slot) in cases {
            for index in [0, 3, 63] {
                let mut funcs = OpImplFunctions::new();
                set(&mut funcs, kind, index).unwrap();

                let mut expected = [0u64; 3];
                expected[slot] = 1u64 << index;
                assert_eq!(masks(&funcs), expected, "{kind} index {index}");
                assert!(funcs.diagnostics().is_empty());
            }
        }
    }

    #[test]
    fn test_index_boundary_for_every_kind() {
        for kind in [DependencyKind::Data, DependencyKind::Tiling, DependencyKind::Host] {
            let mut funcs = OpImplFunctions::new();
            set(&mut funcs, kind, MAX_DEPENDENCY_INDEX - 1).unwrap();
            let before = masks(&funcs);

            let result = set(&mut funcs, kind, MAX_DEPENDENCY_INDEX);
            assert!(matches!(
                result,
                Err(Error::InvalidDependencyIndex { kind: k, index: 64, max: 64 }) if k == kind
            ));
            assert_eq!(masks(&funcs), before);
            assert_eq!(
                funcs.diagnostics(),
                &[Diagnostic::InvalidDependencyIndex { kind, index: 64 }]
            );
        }
    }

    #[test]
    fn test_private_attr_duplicate_last_wins() {
        let mut funcs = OpImplFunctions::new();
        funcs
            .add_private_attr("alpha", Some(AttrValue::Float(0.1)))
            .add_private_attr("mode", None)
            .add_private_attr("alpha", Some(AttrValue::Float(0.5)));

        let attrs = funcs.private_attrs();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].name, "alpha");
        assert_eq!(attrs[0].default, Some(AttrValue::Float(0.5)));
        assert_eq!(attrs[1].name, "mode");
        assert_eq!(
            funcs.diagnostics(),
            &[Diagnostic::DuplicatePrivateAttr {
                name: "alpha".into()
            }]
        );
    }

    #[test]
    fn test_empty_private_attr_name_ignored() {
        let mut funcs = OpImplFunctions::new();
        funcs.add_private_attr("", Some(AttrValue::Int(1)));
        assert!(funcs.private_attrs().is_empty());
        assert_eq!(funcs.diagnostics(), &[Diagnostic::EmptyPrivateAttrName]);
    }

    #[test]
    fn test_tiling_parse_triad() {
        #[derive(Default)]
        struct Info;
        fn parse(_ctx: &mut tessera_core::TilingParseContext) -> tessera_core::Result<()> {
            Ok(())
        }

        let mut funcs = OpImplFunctions::new();
        funcs.set_infer_shape(noop_infer).set_tiling_parse::<Info>(parse);
        assert!(funcs.infer_shape().is_some());
        assert!(funcs.tiling_parse().is_some());
        assert!(funcs.compile_info_creator().is_some());
        assert!(funcs.compile_info_deleter().is_some());
    }

    #[test]
    fn test_mask_indices() {
        assert_eq!(mask_indices(0b1010).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(mask_indices(1 << 63).collect::<Vec<_>>(), vec![63]);
        assert_eq!(mask_indices(0).count(), 0);
    }
}
