//! Engine-facing tensor type.
//!
//! A [`Tensor`] is a shape, an element kind, and a little-endian byte buffer.
//! The buffer is a [`Bytes`] so that clones and outer-dimension slices are
//! cheap when state moves between stages.
//!
//! ## Assumptions
//! The `0th` dimension is treated as the batch (outer) dimension by every
//! operation in this module that mentions "outer".

#[cfg(feature = "candle")]
mod candle;

use std::fmt;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::TensorError;

/// Largest rank an engine accepts.
pub const MAX_DIMS: usize = 8;

/// Element type of a tensor, with the engine's wire codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Float32,
    Int32,
    Uint32,
    Int8,
    Uint8,
}

impl ElementKind {
    /// Width of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            ElementKind::Float32 | ElementKind::Int32 | ElementKind::Uint32 => 4,
            ElementKind::Int8 | ElementKind::Uint8 => 1,
        }
    }

    /// Numeric code used on the engine boundary.
    pub fn code(self) -> u32 {
        match self {
            ElementKind::Float32 => 0,
            ElementKind::Int8 => 2,
            ElementKind::Uint8 => 3,
            ElementKind::Int32 => 6,
            ElementKind::Uint32 => 7,
        }
    }

    pub fn from_code(code: u32) -> Result<Self, TensorError> {
        match code {
            0 => Ok(ElementKind::Float32),
            2 => Ok(ElementKind::Int8),
            3 => Ok(ElementKind::Uint8),
            6 => Ok(ElementKind::Int32),
            7 => Ok(ElementKind::Uint32),
            other => Err(TensorError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementKind::Float32 => "float32",
            ElementKind::Int32 => "int32",
            ElementKind::Uint32 => "uint32",
            ElementKind::Int8 => "int8",
            ElementKind::Uint8 => "uint8",
        };
        f.write_str(name)
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Rust scalar types that map onto an [`ElementKind`].
pub trait Element: sealed::Sealed + Copy + Send + Sync + 'static {
    const KIND: ElementKind;

    #[doc(hidden)]
    fn write_le(self, out: &mut BytesMut);

    #[doc(hidden)]
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! element {
    ($ty:ty, $kind:ident) => {
        impl sealed::Sealed for $ty {}

        impl Element for $ty {
            const KIND: ElementKind = ElementKind::$kind;

            fn write_le(self, out: &mut BytesMut) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                buf.copy_from_slice(bytes);
                <$ty>::from_le_bytes(buf)
            }
        }
    };
}

element!(f32, Float32);
element!(i32, Int32);
element!(u32, Uint32);
element!(i8, Int8);
element!(u8, Uint8);

/// Dense tensor exchanged with an inference engine.
#[derive(Clone, PartialEq, Eq)]
pub struct Tensor {
    shape: Vec<u32>,
    kind: ElementKind,
    data: Bytes,
}

fn element_count(shape: &[u32]) -> usize {
    shape.iter().map(|&d| d as usize).product()
}

impl Tensor {
    /// Builds a tensor from raw little-endian bytes, validating rank and length.
    pub fn new(shape: Vec<u32>, kind: ElementKind, data: Bytes) -> Result<Self, TensorError> {
        if shape.len() > MAX_DIMS {
            return Err(TensorError::TooManyDims(shape.len()));
        }
        let expected = element_count(&shape) * kind.size();
        if data.len() != expected {
            return Err(TensorError::ByteLength {
                shape,
                kind,
                expected,
                got: data.len(),
            });
        }
        Ok(Self { shape, kind, data })
    }

    /// Builds a tensor by copying typed values.
    pub fn from_slice<T: Element>(shape: &[u32], values: &[T]) -> Result<Self, TensorError> {
        let mut out = BytesMut::with_capacity(values.len() * T::KIND.size());
        for value in values {
            value.write_le(&mut out);
        }
        Self::new(shape.to_vec(), T::KIND, out.freeze())
    }

    /// One-dimensional tensor holding `values`.
    pub fn vector<T: Element>(values: &[T]) -> Self {
        let mut out = BytesMut::with_capacity(values.len() * T::KIND.size());
        for value in values {
            value.write_le(&mut out);
        }
        Self {
            shape: vec![values.len() as u32],
            kind: T::KIND,
            data: out.freeze(),
        }
    }

    /// Rank-zero tensor holding `value`.
    pub fn scalar<T: Element>(value: T) -> Self {
        let mut out = BytesMut::with_capacity(T::KIND.size());
        value.write_le(&mut out);
        Self {
            shape: Vec::new(),
            kind: T::KIND,
            data: out.freeze(),
        }
    }

    pub fn zeros(shape: &[u32], kind: ElementKind) -> Result<Self, TensorError> {
        let len = element_count(shape) * kind.size();
        Self::new(shape.to_vec(), kind, Bytes::from(vec![0u8; len]))
    }

    pub fn shape(&self) -> &[u32] {
        &self.shape
    }

    /// Shape as `usize`, the form most backends expect.
    pub fn dims(&self) -> Vec<usize> {
        self.shape.iter().map(|&d| d as usize).collect()
    }

    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn element_count(&self) -> usize {
        element_count(&self.shape)
    }

    /// Copies the elements out as `T`, which must match the tensor's kind.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, TensorError> {
        if T::KIND != self.kind {
            return Err(TensorError::KindMismatch {
                actual: self.kind,
                requested: T::KIND,
            });
        }
        Ok(self
            .data
            .chunks_exact(self.kind.size())
            .map(T::read_le)
            .collect())
    }

    /// Size of the outer (batch) dimension.
    pub fn outer_len(&self) -> Result<usize, TensorError> {
        self.shape.first().map(|&d| d as usize).ok_or(TensorError::Scalar)
    }

    fn row_bytes(&self) -> usize {
        element_count(&self.shape[1..]) * self.kind.size()
    }

    /// Rows `start..start + len` of the outer dimension, sharing storage.
    pub fn narrow_outer(&self, start: usize, len: usize) -> Result<Tensor, TensorError> {
        let outer = self.outer_len()?;
        let end = start + len;
        if end > outer {
            return Err(TensorError::OutOfBounds { start, end, len: outer });
        }
        let row = self.row_bytes();
        let mut shape = self.shape.clone();
        shape[0] = len as u32;
        Ok(Tensor {
            shape,
            kind: self.kind,
            data: self.data.slice(start * row..end * row),
        })
    }

    /// Splits along the outer dimension, dropping it from each part.
    ///
    /// A `(batch, ...)` tensor becomes `batch` tensors of shape `(...)`.
    pub fn split_outer(&self) -> Result<Vec<Tensor>, TensorError> {
        let outer = self.outer_len()?;
        let row = self.row_bytes();
        let inner = self.shape[1..].to_vec();
        Ok((0..outer)
            .map(|i| Tensor {
                shape: inner.clone(),
                kind: self.kind,
                data: self.data.slice(i * row..(i + 1) * row),
            })
            .collect())
    }

    /// Adds a leading dimension of size one.
    pub fn unsqueeze_outer(&self) -> Result<Tensor, TensorError> {
        if self.shape.len() + 1 > MAX_DIMS {
            return Err(TensorError::TooManyDims(self.shape.len() + 1));
        }
        let mut shape = Vec::with_capacity(self.shape.len() + 1);
        shape.push(1);
        shape.extend_from_slice(&self.shape);
        Ok(Tensor {
            shape,
            kind: self.kind,
            data: self.data.clone(),
        })
    }

    /// Concatenates tensors along their outer dimension.
    ///
    /// Every part must share the element kind and every non-outer dimension.
    pub fn concat_outer(parts: &[Tensor]) -> Result<Tensor, TensorError> {
        let first = parts
            .first()
            .ok_or_else(|| TensorError::Incompatible("nothing to concatenate".into()))?;
        first.outer_len()?;
        let mut outer = 0usize;
        let mut data = BytesMut::with_capacity(parts.iter().map(|p| p.data.len()).sum());
        for part in parts {
            if part.kind != first.kind {
                return Err(TensorError::KindMismatch {
                    actual: part.kind,
                    requested: first.kind,
                });
            }
            if part.shape.len() != first.shape.len() || part.shape[1..] != first.shape[1..] {
                return Err(TensorError::Incompatible(format!(
                    "shape {:?} does not line up with {:?}",
                    part.shape, first.shape
                )));
            }
            outer += part.shape[0] as usize;
            data.extend_from_slice(&part.data);
        }
        let mut shape = first.shape.clone();
        shape[0] = outer as u32;
        Ok(Tensor {
            shape,
            kind: first.kind,
            data: data.freeze(),
        })
    }

    /// Stacks equally shaped tensors under a new outer dimension.
    pub fn stack_outer(parts: &[Tensor]) -> Result<Tensor, TensorError> {
        let lifted = parts
            .iter()
            .map(Tensor::unsqueeze_outer)
            .collect::<Result<Vec<_>, _>>()?;
        Tensor::concat_outer(&lifted)
    }

    /// Zero-pads the outer dimension up to `rows`.
    ///
    /// Returns a clone when the tensor already has at least `rows` rows.
    pub fn pad_outer(&self, rows: usize) -> Result<Tensor, TensorError> {
        let outer = self.outer_len()?;
        if outer >= rows {
            return Ok(self.clone());
        }
        let mut data = BytesMut::with_capacity(rows * self.row_bytes());
        data.extend_from_slice(&self.data);
        data.resize(rows * self.row_bytes(), 0);
        let mut shape = self.shape.clone();
        shape[0] = rows as u32;
        Ok(Tensor {
            shape,
            kind: self.kind,
            data: data.freeze(),
        })
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("kind", &self.kind)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor({:?}, {})", self.shape, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(rows: u32, cols: u32) -> Tensor {
        let values: Vec<f32> = (0..rows * cols).map(|v| v as f32).collect();
        Tensor::from_slice(&[rows, cols], &values).unwrap()
    }

    #[test]
    fn test_wire_codes() {
        let kinds = [
            (ElementKind::Float32, 0),
            (ElementKind::Int32, 6),
            (ElementKind::Uint32, 7),
            (ElementKind::Int8, 2),
            (ElementKind::Uint8, 3),
        ];
        for (kind, code) in kinds {
            assert_eq!(kind.code(), code);
            assert_eq!(ElementKind::from_code(code), Ok(kind));
        }
        assert_eq!(ElementKind::from_code(1), Err(TensorError::UnknownKind(1)));
    }

    #[test]
    fn test_new_rejects_bad_length() {
        let err = Tensor::new(vec![2, 2], ElementKind::Float32, Bytes::from(vec![0u8; 15])).unwrap_err();
        assert!(matches!(err, TensorError::ByteLength { expected: 16, got: 15, .. }));
    }

    #[test]
    fn test_new_rejects_rank_above_max() {
        let err = Tensor::zeros(&[1; 9], ElementKind::Uint8).unwrap_err();
        assert_eq!(err, TensorError::TooManyDims(9));
        assert!(Tensor::zeros(&[1; 8], ElementKind::Uint8).is_ok());
    }

    #[test]
    fn test_to_vec_checks_kind() {
        let t = Tensor::vector(&[1i32, -2, 3]);
        assert_eq!(t.to_vec::<i32>().unwrap(), vec![1, -2, 3]);
        assert!(matches!(t.to_vec::<f32>(), Err(TensorError::KindMismatch { .. })));
    }

    #[test]
    fn test_split_outer_drops_batch_dim() {
        let rows = grid(3, 2).split_outer().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].shape(), &[2]);
        assert_eq!(rows[1].to_vec::<f32>().unwrap(), vec![2.0, 3.0]);
    }

    #[test]
    fn test_stack_then_split_preserves_rows() {
        let a = Tensor::vector(&[1.0f32, 2.0]);
        let b = Tensor::vector(&[3.0f32, 4.0]);
        let stacked = Tensor::stack_outer(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(stacked.shape(), &[2, 2]);
        assert_eq!(stacked.split_outer().unwrap(), vec![a, b]);
    }

    #[test]
    fn test_concat_outer_rejects_mismatched_inner_shape() {
        let err = Tensor::concat_outer(&[grid(1, 2), grid(1, 3)]).unwrap_err();
        assert!(matches!(err, TensorError::Incompatible(_)));
    }

    #[test]
    fn test_pad_outer_fills_zero_rows() {
        let padded = grid(2, 2).pad_outer(4).unwrap();
        assert_eq!(padded.shape(), &[4, 2]);
        assert_eq!(
            padded.to_vec::<f32>().unwrap(),
            vec![0.0, 1.0, 2.0, 3.0, 0.0, 0.0, 0.0, 0.0]
        );
        assert_eq!(grid(4, 2).pad_outer(2).unwrap().shape(), &[4, 2]);
    }

    #[test]
    fn test_narrow_outer_bounds() {
        let t = grid(4, 1);
        assert_eq!(t.narrow_outer(1, 2).unwrap().to_vec::<f32>().unwrap(), vec![1.0, 2.0]);
        assert!(matches!(t.narrow_outer(3, 2), Err(TensorError::OutOfBounds { .. })));
    }

    #[test]
    fn test_scalar_has_no_outer_dim() {
        let s = Tensor::scalar(7u8);
        assert_eq!(s.element_count(), 1);
        assert_eq!(s.outer_len(), Err(TensorError::Scalar));
    }
}
