//! Core value types: data types, formats, shapes and tensors.
//!
//! These are the payloads that travel through kernel context slots. They carry
//! no arithmetic beyond what the registry and context machinery needs.

use crate::{Error, Result};

/// Element data type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataType {
    /// No data type has been assigned (e.g. an uninstantiated optional input).
    #[default]
    Undefined,
    F32,
    F16,
    BF16,
    I4,
    I8,
    I16,
    I32,
    I64,
    U8,
    U32,
    U64,
    Bool,
}

impl DataType {
    /// Size of one element in bits.
    ///
    /// `I4` packs two elements per byte, so sizes are expressed in bits.
    pub fn bit_width(&self) -> usize {
        match self {
            DataType::Undefined => 0,
            DataType::I4 => 4,
            DataType::I8 | DataType::U8 | DataType::Bool => 8,
            DataType::F16 | DataType::BF16 | DataType::I16 => 16,
            DataType::F32 | DataType::I32 | DataType::U32 => 32,
            DataType::I64 | DataType::U64 => 64,
        }
    }

    /// Number of bytes needed to store `elements` values of this type.
    pub fn byte_size(&self, elements: usize) -> usize {
        (elements * self.bit_width()).div_ceil(8)
    }
}

/// Memory layout of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    #[default]
    Nd,
    Nchw,
    Nhwc,
    Hwcn,
    Nc1hwc0,
    FractalZ,
    FractalNz,
}

/// The format a tensor was declared with and the format it is stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StorageFormat {
    pub origin: Format,
    pub storage: Format,
}

impl StorageFormat {
    pub fn new(origin: Format, storage: Format) -> Self {
        Self { origin, storage }
    }
}

// ──────────────────────────────── Shape ──────────────────────────────────

/// A tensor shape. Negative dimensions denote unknown extents.
#[derive(Debug, Clone, PartialEq, Eq, Default, Hash)]
pub struct Shape {
    dims: Vec<i64>,
}

impl Shape {
    /// Create a shape from its dimensions.
    pub fn new(dims: impl Into<Vec<i64>>) -> Self {
        Self { dims: dims.into() }
    }

    /// Create a rank-0 shape.
    pub fn scalar() -> Self {
        Self::default()
    }

    /// Number of dimensions.
    pub fn dim_num(&self) -> usize {
        self.dims.len()
    }

    /// Get a single dimension, if `index` is within rank.
    pub fn dim(&self, index: usize) -> Option<i64> {
        self.dims.get(index).copied()
    }

    /// Overwrite a single dimension.
    pub fn set_dim(&mut self, index: usize, value: i64) -> Result<()> {
        let rank = self.dims.len();
        let dim = self
            .dims
            .get_mut(index)
            .ok_or_else(|| Error::Shape(format!("dim index {} out of rank {}", index, rank)))?;
        *dim = value;
        Ok(())
    }

    /// Append a trailing dimension.
    pub fn append_dim(&mut self, value: i64) -> &mut Self {
        self.dims.push(value);
        self
    }

    /// All dimensions.
    pub fn dims(&self) -> &[i64] {
        &self.dims
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    /// Whether every dimension is known.
    pub fn is_static(&self) -> bool {
        self.dims.iter().all(|&d| d >= 0)
    }

    /// Total number of elements, or `None` if any dimension is unknown or the
    /// product overflows.
    pub fn shape_size(&self) -> Option<usize> {
        self.dims.iter().try_fold(1usize, |acc, &d| {
            let d = usize::try_from(d).ok()?;
            acc.checked_mul(d)
        })
    }
}

impl From<Vec<i64>> for Shape {
    fn from(dims: Vec<i64>) -> Self {
        Self::new(dims)
    }
}

impl From<&[i64]> for Shape {
    fn from(dims: &[i64]) -> Self {
        Self::new(dims.to_vec())
    }
}

/// The shape a tensor was declared with and the shape it is stored in.
///
/// Storage shapes differ from origin shapes once a tensor is laid out in a
/// blocked format such as `Nc1hwc0`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StorageShape {
    pub origin: Shape,
    pub storage: Shape,
}

impl StorageShape {
    pub fn new(origin: impl Into<Shape>, storage: impl Into<Shape>) -> Self {
        Self {
            origin: origin.into(),
            storage: storage.into(),
        }
    }

    /// A storage shape whose origin and storage views are identical.
    pub fn uniform(shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        Self {
            origin: shape.clone(),
            storage: shape,
        }
    }
}

/// Inclusive bounds of a dynamic shape.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShapeRange {
    pub min: Shape,
    pub max: Shape,
}

impl ShapeRange {
    pub fn new(min: impl Into<Shape>, max: impl Into<Shape>) -> Self {
        Self {
            min: min.into(),
            max: max.into(),
        }
    }
}

// ──────────────────────────────── Tensor ─────────────────────────────────

/// Where a tensor's data is resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TensorPlacement {
    Host,
    #[default]
    Device,
}

/// Materialized tensor elements.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    I64(Vec<i64>),
    I32(Vec<i32>),
    F32(Vec<f32>),
    Bool(Vec<bool>),
    U8(Vec<u8>),
}

impl TensorData {
    /// Get the number of elements.
    pub fn len(&self) -> usize {
        match self {
            TensorData::I64(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::F32(v) => v.len(),
            TensorData::Bool(v) => v.len(),
            TensorData::U8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match self {
            TensorData::I64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match self {
            TensorData::I32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }

    /// The data type implied by the element storage.
    pub fn dtype(&self) -> DataType {
        match self {
            TensorData::I64(_) => DataType::I64,
            TensorData::I32(_) => DataType::I32,
            TensorData::F32(_) => DataType::F32,
            TensorData::Bool(_) => DataType::Bool,
            TensorData::U8(_) => DataType::U8,
        }
    }
}

/// A tensor as seen by a kernel callback: shape and format metadata plus,
/// when the consumer depends on it, the materialized value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Tensor {
    pub shape: StorageShape,
    pub format: StorageFormat,
    pub dtype: DataType,
    pub placement: TensorPlacement,
    pub data: Option<TensorData>,
}

impl Tensor {
    /// Create a tensor that carries metadata only.
    pub fn new(shape: StorageShape, dtype: DataType) -> Self {
        Self {
            shape,
            dtype,
            ..Default::default()
        }
    }

    /// Create a host-resident tensor with materialized data.
    pub fn with_data(shape: StorageShape, data: TensorData) -> Self {
        Self {
            shape,
            dtype: data.dtype(),
            placement: TensorPlacement::Host,
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn origin_shape(&self) -> &Shape {
        &self.shape.origin
    }

    pub fn storage_shape(&self) -> &Shape {
        &self.shape.storage
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Drop the materialized value, keeping metadata.
    pub fn strip_data(&mut self) {
        self.data = None;
    }
}
