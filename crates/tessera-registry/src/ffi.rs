//! C ABI for moving registrations across shared-object boundaries.
//!
//! A library built on this crate exports two symbols, normally generated by
//! [`export_op_impls!`](crate::export_op_impls):
//!
//! - `count_operators() -> usize`
//! - `export_operators(buffer: *mut TypesToImpl, count: usize) -> u32`
//!
//! The host calls the first, allocates that many [`TypesToImpl`] entries and
//! calls the second to fill them. Status `0` is success and
//! [`STATUS_COUNT_MISMATCH`] means `count` did not match what the library
//! holds. Entries point at memory owned by the exporting library, which stays
//! valid for as long as the library is loaded.
//!
//! Callback pointers use the Rust calling convention, so host and plugin
//! must be built with the same toolchain and the same `tessera-core`.

#![allow(improper_ctypes_definitions)]

use crate::op_impl::OpImplFunctions;
use crate::registry::OpImplRegistry;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::ffi::{CStr, CString, c_char, c_void};
use std::ptr;
use tessera_core::{
    AttrValue, CompileInfoCreator, CompileInfoDeleter, ExecuteFn, InferDataTypeFn, InferShapeFn,
    InferShapeRangeFn, PrivateAttr, TilingFn, TilingParseFn,
};

/// Return code of `export_operators`.
pub type Status = u32;

pub const STATUS_SUCCESS: Status = 0;
pub const STATUS_FAILED: Status = 1;
pub const STATUS_COUNT_MISMATCH: Status = 2;

pub const COUNT_OPERATORS_SYMBOL: &[u8] = b"count_operators\0";
pub const EXPORT_OPERATORS_SYMBOL: &[u8] = b"export_operators\0";

pub type CountOperatorsFn = unsafe extern "C" fn() -> usize;
pub type ExportOperatorsFn = unsafe extern "C" fn(*mut TypesToImpl, usize) -> Status;

// ──────────────────────────────── Layout ─────────────────────────────────

pub const ATTR_UNSET: u32 = 0;
pub const ATTR_INT: u32 = 1;
pub const ATTR_FLOAT: u32 = 2;
pub const ATTR_BOOL: u32 = 3;
pub const ATTR_STRING: u32 = 4;
pub const ATTR_INTS: u32 = 5;
pub const ATTR_FLOATS: u32 = 6;

/// A private attribute default. `ptr` is a nul-terminated string for
/// `ATTR_STRING` and an array of `len` elements for the list kinds.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FlatAttrValue {
    pub kind: u32,
    pub int_value: i64,
    pub float_value: f32,
    pub ptr: *const c_void,
    pub len: usize,
}

impl FlatAttrValue {
    pub const UNSET: Self = Self {
        kind: ATTR_UNSET,
        int_value: 0,
        float_value: 0.0,
        ptr: ptr::null(),
        len: 0,
    };
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FlatPrivateAttr {
    pub name: *const c_char,
    pub value: FlatAttrValue,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FlatOpImplFunctions {
    pub infer_shape: Option<InferShapeFn>,
    pub infer_shape_range: Option<InferShapeRangeFn>,
    pub infer_datatype: Option<InferDataTypeFn>,
    pub tiling: Option<TilingFn>,
    pub execute: Option<ExecuteFn>,
    pub tiling_parse: Option<TilingParseFn>,
    pub compile_info_creator: Option<CompileInfoCreator>,
    pub compile_info_deleter: Option<CompileInfoDeleter>,
    pub max_tiling_data_size: usize,
    pub inputs_dependency: u64,
    pub tiling_dependency: u64,
    pub host_inputs: u64,
    pub private_attrs: *const FlatPrivateAttr,
    pub private_attrs_num: usize,
}

/// One exported registration.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TypesToImpl {
    pub op_type: *const c_char,
    pub funcs: FlatOpImplFunctions,
}

impl TypesToImpl {
    /// An entry with every pointer null, used to pre-fill export buffers.
    pub const EMPTY: Self = Self {
        op_type: ptr::null(),
        funcs: FlatOpImplFunctions {
            infer_shape: None,
            infer_shape_range: None,
            infer_datatype: None,
            tiling: None,
            execute: None,
            tiling_parse: None,
            compile_info_creator: None,
            compile_info_deleter: None,
            max_tiling_data_size: 0,
            inputs_dependency: 0,
            tiling_dependency: 0,
            host_inputs: 0,
            private_attrs: ptr::null(),
            private_attrs_num: 0,
        },
    };

    pub fn is_empty(&self) -> bool {
        self.op_type.is_null()
    }

    /// Copy the entry into owned types.
    ///
    /// # Safety
    ///
    /// Every pointer in the entry must be null or valid as described in the
    /// module docs, and the memory must stay valid for the duration of the
    /// call.
    pub unsafe fn to_registration(&self, origin: &str) -> Result<(String, OpImplFunctions)> {
        let invalid = |reason: String| Error::InvalidExport {
            name: origin.to_string(),
            reason,
        };

        if self.op_type.is_null() {
            return Err(invalid("entry has no op type".into()));
        }
        let op_type = unsafe { CStr::from_ptr(self.op_type) }
            .to_str()
            .map_err(|e| invalid(format!("op type is not UTF-8: {}", e)))?
            .to_string();

        let flat = &self.funcs;
        let mut funcs = OpImplFunctions::new();
        funcs.infer_shape = flat.infer_shape;
        funcs.infer_shape_range = flat.infer_shape_range;
        funcs.infer_datatype = flat.infer_datatype;
        funcs.execute = flat.execute;
        funcs.tiling = flat.tiling;
        funcs.max_tiling_data_size = flat.max_tiling_data_size;
        funcs.tiling_parse = flat.tiling_parse;
        funcs.compile_info_creator = flat.compile_info_creator;
        funcs.compile_info_deleter = flat.compile_info_deleter;
        funcs.inputs_dependency = flat.inputs_dependency;
        funcs.tiling_dependency = flat.tiling_dependency;
        funcs.host_inputs = flat.host_inputs;

        let flat_attrs = unsafe { raw_slice(flat.private_attrs, flat.private_attrs_num) }
            .ok_or_else(|| invalid(format!("'{}' has a null private attribute table", op_type)))?;
        let mut attrs = Vec::with_capacity(flat_attrs.len());
        for attr in flat_attrs {
            if attr.name.is_null() {
                return Err(invalid(format!("'{}' has an unnamed private attribute", op_type)));
            }
            let name = unsafe { CStr::from_ptr(attr.name) }
                .to_str()
                .map_err(|e| invalid(format!("attribute name is not UTF-8: {}", e)))?;
            let default = unsafe { attr_from_flat(&attr.value) }
                .map_err(|reason| invalid(format!("'{}.{}': {}", op_type, name, reason)))?;
            attrs.push(PrivateAttr::new(name, default));
        }
        funcs.replace_private_attrs(attrs);

        Ok((op_type, funcs))
    }
}

impl Default for TypesToImpl {
    fn default() -> Self {
        Self::EMPTY
    }
}

unsafe fn raw_slice<'a, T>(ptr: *const T, len: usize) -> Option<&'a [T]> {
    if len == 0 {
        Some(&[])
    } else if ptr.is_null() {
        None
    } else {
        Some(unsafe { std::slice::from_raw_parts(ptr, len) })
    }
}

unsafe fn attr_from_flat(flat: &FlatAttrValue) -> std::result::Result<Option<AttrValue>, String> {
    let value = match flat.kind {
        ATTR_UNSET => return Ok(None),
        ATTR_INT => AttrValue::Int(flat.int_value),
        ATTR_FLOAT => AttrValue::Float(flat.float_value),
        ATTR_BOOL => AttrValue::Bool(flat.int_value != 0),
        ATTR_STRING => {
            if flat.ptr.is_null() {
                return Err("null string value".into());
            }
            let s = unsafe { CStr::from_ptr(flat.ptr.cast::<c_char>()) }
                .to_str()
                .map_err(|e| format!("string value is not UTF-8: {}", e))?;
            AttrValue::String(s.to_string())
        }
        ATTR_INTS => {
            let values = unsafe { raw_slice(flat.ptr.cast::<i64>(), flat.len) }
                .ok_or("null int list")?;
            AttrValue::Ints(values.to_vec())
        }
        ATTR_FLOATS => {
            let values = unsafe { raw_slice(flat.ptr.cast::<f32>(), flat.len) }
                .ok_or("null float list")?;
            AttrValue::Floats(values.to_vec())
        }
        other => return Err(format!("unknown attribute kind {}", other)),
    };
    Ok(Some(value))
}

// ──────────────────────────────── Export ─────────────────────────────────

/// Flattened registrations plus the storage their pointers refer to.
#[derive(Default)]
pub struct ExportTable {
    entries: Vec<TypesToImpl>,
    strings: Vec<CString>,
    ints: Vec<Vec<i64>>,
    floats: Vec<Vec<f32>>,
    attrs: Vec<Vec<FlatPrivateAttr>>,
}

// The raw pointers only refer to buffers owned by the table itself.
unsafe impl Send for ExportTable {}

impl ExportTable {
    /// Flatten every bundle in `registry`, ordered by op type.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidExport` if a name or string value contains a
    /// nul byte.
    pub fn from_registry(registry: &OpImplRegistry) -> Result<Self> {
        let mut bundles: Vec<(String, OpImplFunctions)> = registry.snapshot().into_iter().collect();
        bundles.sort_by(|a, b| a.0.cmp(&b.0));

        let mut table = Self::default();
        for (op_type, funcs) in &bundles {
            let name = table.c_string(op_type, op_type)?;

            let mut attrs = Vec::with_capacity(funcs.private_attrs().len());
            for attr in funcs.private_attrs() {
                let attr_name = table.c_string(op_type, &attr.name)?;
                let value = table.flatten_value(op_type, &attr.name, attr.default.as_ref())?;
                attrs.push(FlatPrivateAttr {
                    name: attr_name,
                    value,
                });
            }

            let flat = FlatOpImplFunctions {
                infer_shape: funcs.infer_shape,
                infer_shape_range: funcs.infer_shape_range,
                infer_datatype: funcs.infer_datatype,
                tiling: funcs.tiling,
                execute: funcs.execute,
                tiling_parse: funcs.tiling_parse,
                compile_info_creator: funcs.compile_info_creator,
                compile_info_deleter: funcs.compile_info_deleter,
                max_tiling_data_size: funcs.max_tiling_data_size,
                inputs_dependency: funcs.inputs_dependency,
                tiling_dependency: funcs.tiling_dependency,
                host_inputs: funcs.host_inputs,
                private_attrs: if attrs.is_empty() {
                    ptr::null()
                } else {
                    attrs.as_ptr()
                },
                private_attrs_num: attrs.len(),
            };
            table.attrs.push(attrs);
            table.entries.push(TypesToImpl {
                op_type: name,
                funcs: flat,
            });
        }
        Ok(table)
    }

    pub fn entries(&self) -> &[TypesToImpl] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn c_string(&mut self, op_type: &str, value: &str) -> Result<*const c_char> {
        let s = CString::new(value).map_err(|_| Error::InvalidExport {
            name: op_type.to_string(),
            reason: format!("'{}' contains a nul byte", value.escape_default()),
        })?;
        let ptr = s.as_ptr();
        self.strings.push(s);
        Ok(ptr)
    }

    fn flatten_value(
        &mut self,
        op_type: &str,
        attr: &str,
        value: Option<&AttrValue>,
    ) -> Result<FlatAttrValue> {
        let mut flat = FlatAttrValue::UNSET;
        match value {
            None => {}
            Some(AttrValue::Int(v)) => {
                flat.kind = ATTR_INT;
                flat.int_value = *v;
            }
            Some(AttrValue::Float(v)) => {
                flat.kind = ATTR_FLOAT;
                flat.float_value = *v;
            }
            Some(AttrValue::Bool(v)) => {
                flat.kind = ATTR_BOOL;
                flat.int_value = i64::from(*v);
            }
            Some(AttrValue::String(v)) => {
                flat.kind = ATTR_STRING;
                flat.ptr = self.c_string(op_type, v)?.cast();
            }
            Some(AttrValue::Ints(v)) => {
                let values = v.clone();
                flat.kind = ATTR_INTS;
                flat.ptr = values.as_ptr().cast();
                flat.len = values.len();
                self.ints.push(values);
            }
            Some(AttrValue::Floats(v)) => {
                let values = v.clone();
                flat.kind = ATTR_FLOATS;
                flat.ptr = values.as_ptr().cast();
                flat.len = values.len();
                self.floats.push(values);
            }
            Some(AttrValue::Strings(_) | AttrValue::Graph(_)) => {
                tracing::warn!(
                    op_type,
                    attr,
                    "private attribute default cannot be exported, leaving it unset"
                );
            }
        }
        Ok(flat)
    }
}

// Tables handed out by `export_registry`. Entries point into them, so they
// live until the process exits.
static EXPORTED_TABLES: Mutex<Vec<ExportTable>> = Mutex::new(Vec::new());

/// Number of registrations `export_registry` would write.
pub fn count_registered(registry: &OpImplRegistry) -> usize {
    registry.len()
}

/// Write every registration of `registry` into `buffer`.
///
/// # Safety
///
/// `buffer` must be null or point to `count` writable `TypesToImpl` entries.
pub unsafe fn export_registry(
    registry: &OpImplRegistry,
    buffer: *mut TypesToImpl,
    count: usize,
) -> Status {
    if buffer.is_null() {
        tracing::error!("export buffer is null");
        return STATUS_FAILED;
    }
    let table = match ExportTable::from_registry(registry) {
        Ok(table) => table,
        Err(e) => {
            tracing::error!(error = %e, "failed to flatten op impl registry");
            return STATUS_FAILED;
        }
    };
    if table.len() != count {
        tracing::error!(
            requested = count,
            available = table.len(),
            "export buffer size does not match the registry"
        );
        return STATUS_COUNT_MISMATCH;
    }

    let out = unsafe { std::slice::from_raw_parts_mut(buffer, count) };
    out.copy_from_slice(table.entries());
    EXPORTED_TABLES.lock().push(table);
    tracing::debug!(count, "exported op impls");
    STATUS_SUCCESS
}

/// Define the `count_operators` and `export_operators` symbols for the
/// process-wide registry. Invoke once at the root of a plugin `cdylib`.
#[macro_export]
macro_rules! export_op_impls {
    () => {
        #[unsafe(no_mangle)]
        pub extern "C" fn count_operators() -> usize {
            $crate::ffi::count_registered($crate::OpImplRegistry::global())
        }

        /// # Safety
        ///
        /// `buffer` must point to `count` writable entries.
        #[unsafe(no_mangle)]
        #[allow(improper_ctypes_definitions)]
        pub unsafe extern "C" fn export_operators(
            buffer: *mut $crate::ffi::TypesToImpl,
            count: usize,
        ) -> $crate::ffi::Status {
            unsafe {
                $crate::ffi::export_registry($crate::OpImplRegistry::global(), buffer, count)
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::OpImplRegister;
    use tessera_core::{InferShapeContext, TilingContext};

    fn infer(_ctx: &mut InferShapeContext) -> tessera_core::Result<()> {
        Ok(())
    }

    fn tiling(_ctx: &mut TilingContext) -> tessera_core::Result<()> {
        Ok(())
    }

    fn sample_registry() -> OpImplRegistry {
        let registry = OpImplRegistry::new();
        OpImplRegister::new("Reshape")
            .infer_shape(infer)
            .tiling_with_max_size(tiling, 512)
            .inputs_data_dependency(&[1])
            .tiling_inputs_data_dependency(&[2])
            .private_attr_with_default("allowzero", 0i64)
            .private_attr_with_default("mode", "fast")
            .private_attr_with_default("axes", vec![0i64, 2])
            .private_attr("unset")
            .register_into(&registry);
        OpImplRegister::new("Add")
            .infer_shape(infer)
            .register_into(&registry);
        registry
    }

    #[test]
    fn test_export_then_import() {
        let registry = sample_registry();
        let count = count_registered(&registry);
        assert_eq!(count, 2);

        let mut buffer = vec![TypesToImpl::EMPTY; count];
        let status = unsafe { export_registry(&registry, buffer.as_mut_ptr(), count) };
        assert_eq!(status, STATUS_SUCCESS);
        assert!(buffer.iter().all(|entry| !entry.is_empty()));

        // Ordered by op type.
        let (add, _) = unsafe { buffer[0].to_registration("test") }.unwrap();
        assert_eq!(add, "Add");

        let (op_type, funcs) = unsafe { buffer[1].to_registration("test") }.unwrap();
        assert_eq!(op_type, "Reshape");
        assert!(funcs.infer_shape().is_some());
        assert_eq!(funcs.max_tiling_data_size(), 512);
        assert!(funcs.is_input_data_dependency(1));
        assert!(funcs.is_tiling_input_data_dependency(2));

        let attrs = funcs.private_attrs();
        assert_eq!(attrs.len(), 4);
        assert_eq!(attrs[0].default, Some(AttrValue::Int(0)));
        assert_eq!(attrs[1].default, Some(AttrValue::String("fast".into())));
        assert_eq!(attrs[2].default, Some(AttrValue::Ints(vec![0, 2])));
        assert_eq!(attrs[3].name, "unset");
        assert_eq!(attrs[3].default, None);
    }

    #[test]
    fn test_export_count_mismatch() {
        let registry = sample_registry();
        let mut buffer = vec![TypesToImpl::EMPTY; 1];
        let status = unsafe { export_registry(&registry, buffer.as_mut_ptr(), 1) };
        assert_eq!(status, STATUS_COUNT_MISMATCH);
        assert!(buffer[0].is_empty());
    }

    #[test]
    fn test_export_null_buffer() {
        let registry = sample_registry();
        let status = unsafe { export_registry(&registry, ptr::null_mut(), 2) };
        assert_eq!(status, STATUS_FAILED);
    }

    #[test]
    fn test_import_rejects_empty_entry() {
        let result = unsafe { TypesToImpl::EMPTY.to_registration("libbad.so") };
        assert!(matches!(result, Err(Error::InvalidExport { .. })));
    }

    #[test]
    fn test_nul_in_op_type_fails_export() {
        let registry = OpImplRegistry::new();
        OpImplRegister::new("Bad\0Op").register_into(&registry);
        assert!(ExportTable::from_registry(&registry).is_err());
    }
}
