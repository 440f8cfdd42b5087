//! Host-side tensors exchanged with the compute engine and the transport.
//!
//! # Why dtype-erased storage?
//!
//! A single coordinated function call mixes element types across its inputs
//! (feature batches in `f32`, index labels in `i64`, ...), and the shared
//! buffers those inputs travel through are raw byte regions. Storage is
//! therefore an enum over flat vectors ([`TensorData`]) with the element type
//! carried as a runtime [`Dtype`], rather than a compile-time parameter.
//! Typed access is still available through the [`Elem`] trait for callers
//! that know what they are holding.
//!
//! The batch axis is always axis 0: partitioning, scattering and gathering
//! all split or concatenate rows.

use crate::collective::ReduceOp;
use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TensorError {
    /// The shape of the data does not match the expected shape.
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// The element type does not match the expected one.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DtypeMismatch { expected: Dtype, got: Dtype },
    /// The element count does not fill the shape.
    #[error("element count {len} does not fill shape {shape:?}")]
    LengthMismatch { len: usize, shape: Vec<usize> },
    /// A byte buffer is not a whole number of elements.
    #[error("byte length {len} is not a multiple of {dtype} element size")]
    ByteLength { len: usize, dtype: Dtype },
}

pub type Result<T> = std::result::Result<T, TensorError>;

/// Element types a tensor can hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dtype {
    F32,
    F64,
    I32,
    I64,
}

impl Dtype {
    /// Size of one element in bytes.
    pub fn size_of(self) -> usize {
        match self {
            Dtype::F32 | Dtype::I32 => 4,
            Dtype::F64 | Dtype::I64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Dtype::F32 => "f32",
            Dtype::F64 => "f64",
            Dtype::I32 => "i32",
            Dtype::I64 => "i64",
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Trait bound for elements stored in a tensor.
///
/// # Requirements
/// - `Num + NumAssign`: arithmetic for reductions and scaling.
/// - `Copy + Send + Sync`: contiguous storage and `rayon` execution.
/// - `PartialOrd`: min/max reductions.
/// - `FromPrimitive + ToPrimitive`: dtype-preserving scaling (the average
///   factor is applied in the element's own type, never widened).
pub trait Elem:
    Num
    + NumAssign
    + Copy
    + fmt::Debug
    + Send
    + Sync
    + PartialOrd
    + FromPrimitive
    + ToPrimitive
    + 'static
{
    const DTYPE: Dtype;

    fn into_data(v: Vec<Self>) -> TensorData;
    fn data_slice(data: &TensorData) -> Option<&[Self]>;
    fn data_slice_mut(data: &mut TensorData) -> Option<&mut [Self]>;
}

macro_rules! impl_elem {
    ($t:ty, $variant:ident) => {
        impl Elem for $t {
            const DTYPE: Dtype = Dtype::$variant;

            fn into_data(v: Vec<Self>) -> TensorData {
                TensorData::$variant(v)
            }

            fn data_slice(data: &TensorData) -> Option<&[Self]> {
                match data {
                    TensorData::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn data_slice_mut(data: &mut TensorData) -> Option<&mut [Self]> {
                match data {
                    TensorData::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_elem!(f32, F32);
impl_elem!(f64, F64);
impl_elem!(i32, I32);
impl_elem!(i64, I64);

/// Flat, contiguous, dtype-erased element storage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TensorData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

/// Dispatches `$body` with `$v` bound to the typed vector inside `$data`.
macro_rules! for_each_variant {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            TensorData::F32($v) => $body,
            TensorData::F64($v) => $body,
            TensorData::I32($v) => $body,
            TensorData::I64($v) => $body,
        }
    };
}

/// Dispatches `$body` with both typed slices bound, or runs `$err` on a
/// dtype mismatch between the two.
macro_rules! for_each_pair {
    ($a:expr, $b:expr, $va:ident, $vb:ident => $body:expr, $err:expr) => {
        match ($a, $b) {
            (TensorData::F32($va), TensorData::F32($vb)) => $body,
            (TensorData::F64($va), TensorData::F64($vb)) => $body,
            (TensorData::I32($va), TensorData::I32($vb)) => $body,
            (TensorData::I64($va), TensorData::I64($vb)) => $body,
            _ => $err,
        }
    };
}

impl TensorData {
    pub fn zeros(dtype: Dtype, len: usize) -> Self {
        match dtype {
            Dtype::F32 => TensorData::F32(vec![0.0; len]),
            Dtype::F64 => TensorData::F64(vec![0.0; len]),
            Dtype::I32 => TensorData::I32(vec![0; len]),
            Dtype::I64 => TensorData::I64(vec![0; len]),
        }
    }

    pub fn dtype(&self) -> Dtype {
        match self {
            TensorData::F32(_) => Dtype::F32,
            TensorData::F64(_) => Dtype::F64,
            TensorData::I32(_) => Dtype::I32,
            TensorData::I64(_) => Dtype::I64,
        }
    }

    pub fn len(&self) -> usize {
        for_each_variant!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn nbytes(&self) -> usize {
        self.len() * self.dtype().size_of()
    }

    /// Raw byte view of the elements, for shared-memory transport.
    pub fn as_bytes(&self) -> &[u8] {
        // Sound because every variant is a dense slice of plain-old-data
        // elements; the transport moves them between mappings on one host.
        for_each_variant!(self, v => unsafe {
            std::slice::from_raw_parts(v.as_ptr() as *const u8, std::mem::size_of_val(v.as_slice()))
        })
    }

    /// Rebuilds typed storage from transport bytes (copies).
    pub fn from_bytes(dtype: Dtype, bytes: &[u8]) -> Result<Self> {
        let elem = dtype.size_of();
        if bytes.len() % elem != 0 {
            return Err(TensorError::ByteLength {
                len: bytes.len(),
                dtype,
            });
        }
        let mut data = Self::zeros(dtype, bytes.len() / elem);
        data.copy_from_bytes(bytes)?;
        Ok(data)
    }

    /// Overwrites the elements from transport bytes of the exact same length.
    pub fn copy_from_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.nbytes() {
            return Err(TensorError::ByteLength {
                len: bytes.len(),
                dtype: self.dtype(),
            });
        }
        for_each_variant!(self, v => unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), v.as_mut_ptr() as *mut u8, bytes.len());
        });
        Ok(())
    }

    /// Elementwise `self[i] = op(self[i], other[i])`.
    pub fn combine_assign(&mut self, other: &TensorData, op: ReduceOp) -> Result<()> {
        if self.len() != other.len() {
            return Err(TensorError::LengthMismatch {
                len: other.len(),
                shape: vec![self.len()],
            });
        }
        let (expected, got) = (self.dtype(), other.dtype());
        for_each_pair!(self, other, a, b => {
            combine_slices(a, b, op);
            Ok(())
        }, Err(TensorError::DtypeMismatch { expected, got }))
    }

    /// In-place scaling in the element's own type. Integer tensors truncate,
    /// which is the dtype-preserving behavior the averaging path relies on.
    pub fn scale(&mut self, factor: f64) {
        for_each_variant!(self, v => scale_slice(v, factor));
    }

    /// Appends `other`'s elements (axis-0 concatenation at the data level).
    pub fn extend_from(&mut self, other: &TensorData) -> Result<()> {
        let (expected, got) = (self.dtype(), other.dtype());
        for_each_pair!(self, other, a, b => {
            a.extend_from_slice(b);
            Ok(())
        }, Err(TensorError::DtypeMismatch { expected, got }))
    }
}

fn combine_slices<T: Elem>(a: &mut [T], b: &[T], op: ReduceOp) {
    match op {
        ReduceOp::Sum => a.iter_mut().zip(b).for_each(|(x, &y)| *x += y),
        ReduceOp::Prod => a.iter_mut().zip(b).for_each(|(x, &y)| *x *= y),
        ReduceOp::Max => a.iter_mut().zip(b).for_each(|(x, &y)| {
            if y > *x {
                *x = y;
            }
        }),
        ReduceOp::Min => a.iter_mut().zip(b).for_each(|(x, &y)| {
            if y < *x {
                *x = y;
            }
        }),
    }
}

fn scale_slice<T: Elem>(v: &mut [T], factor: f64) {
    v.iter_mut().for_each(|x| {
        let scaled = x.to_f64().unwrap_or(0.0) * factor;
        *x = T::from_f64(scaled).unwrap_or_else(T::zero);
    });
}

/// A shaped host tensor: [`TensorData`] plus a shape whose product equals the
/// element count. Axis 0 is the batch axis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HostTensor {
    data: TensorData,
    shape: Vec<usize>,
}

impl HostTensor {
    pub fn new(data: TensorData, shape: Vec<usize>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(TensorError::LengthMismatch {
                len: data.len(),
                shape,
            });
        }
        Ok(Self { data, shape })
    }

    pub fn from_vec<T: Elem>(v: Vec<T>, shape: &[usize]) -> Result<Self> {
        Self::new(T::into_data(v), shape.to_vec())
    }

    pub fn zeros(dtype: Dtype, shape: &[usize]) -> Self {
        Self {
            data: TensorData::zeros(dtype, shape.iter().product()),
            shape: shape.to_vec(),
        }
    }

    pub fn dtype(&self) -> Dtype {
        self.data.dtype()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Extent of the batch axis (1 for a rank-0 tensor).
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    /// Elements per row, i.e. the product of the non-batch dimensions.
    pub fn row_width(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut TensorData {
        &mut self.data
    }

    pub fn into_data(self) -> TensorData {
        self.data
    }

    pub fn as_slice<T: Elem>(&self) -> Option<&[T]> {
        T::data_slice(&self.data)
    }

    pub fn scale(&mut self, factor: f64) {
        self.data.scale(factor);
    }

    /// Elementwise `self += other` (same shape, same dtype).
    pub fn add_assign(&mut self, other: &HostTensor) -> Result<()> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.clone(),
                got: other.shape.clone(),
            });
        }
        self.data.combine_assign(&other.data, ReduceOp::Sum)
    }

    /// Sums over the batch axis, producing the non-batch shape.
    pub fn sum_rows(&self) -> Result<HostTensor> {
        let rows = self.rows();
        let width = self.row_width();
        let data = for_each_variant!(&self.data, v => sum_rows_data(v, rows, width));
        let tail: Vec<usize> = self.shape.iter().skip(1).copied().collect();
        HostTensor::new(data, tail)
    }

    /// Mean over the batch axis; zero rows produce zeros.
    pub fn mean_rows(&self) -> Result<HostTensor> {
        let rows = self.rows();
        let mut sum = self.sum_rows()?;
        if rows > 0 {
            sum.scale(1.0 / rows as f64);
        }
        Ok(sum)
    }

    /// Concatenates parts along axis 0, in the order given. Every part must
    /// share the dtype and non-batch dimensions of the first.
    pub fn concat_rows(parts: &[HostTensor]) -> Result<HostTensor> {
        let first = match parts.first() {
            Some(t) => t,
            None => {
                return Err(TensorError::LengthMismatch {
                    len: 0,
                    shape: vec![],
                })
            }
        };
        let tail: Vec<usize> = first.shape.iter().skip(1).copied().collect();
        let mut rows = 0usize;
        let mut data = TensorData::zeros(first.dtype(), 0);
        for part in parts {
            let part_tail: Vec<usize> = part.shape.iter().skip(1).copied().collect();
            if part_tail != tail {
                return Err(TensorError::ShapeMismatch {
                    expected: first.shape.clone(),
                    got: part.shape.clone(),
                });
            }
            data.extend_from(&part.data)?;
            rows += part.rows();
        }
        let mut shape = vec![rows];
        shape.extend_from_slice(&tail);
        HostTensor::new(data, shape)
    }
}

fn sum_rows_data<T: Elem>(v: &[T], rows: usize, width: usize) -> TensorData {
    if width == 0 {
        return T::into_data(Vec::new());
    }
    let acc = v
        .par_chunks(width)
        .take(rows)
        .fold(
            || vec![T::zero(); width],
            |mut acc, row| {
                for (a, &x) in acc.iter_mut().zip(row) {
                    *a += x;
                }
                acc
            },
        )
        .reduce(
            || vec![T::zero(); width],
            |mut a, b| {
                for (x, y) in a.iter_mut().zip(b) {
                    *x += y;
                }
                a
            },
        );
    T::into_data(acc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_rows_matches_manual() {
        let t = HostTensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], &[3, 2]).unwrap();
        let s = t.sum_rows().unwrap();
        assert_eq!(s.shape(), &[2]);
        assert_eq!(s.as_slice::<f32>().unwrap(), &[9.0, 12.0]);
    }

    #[test]
    fn mean_rows_scales_in_dtype() {
        let t = HostTensor::from_vec(vec![1i64, 2, 3, 4], &[4]).unwrap();
        let m = t.mean_rows().unwrap();
        // 10 / 4 truncates in i64.
        assert_eq!(m.as_slice::<i64>().unwrap(), &[2]);
    }

    #[test]
    fn combine_assign_ops() {
        let mut a = TensorData::F32(vec![1.0, 5.0, 3.0]);
        let b = TensorData::F32(vec![4.0, 2.0, 3.0]);
        a.combine_assign(&b, ReduceOp::Max).unwrap();
        assert_eq!(a, TensorData::F32(vec![4.0, 5.0, 3.0]));
        a.combine_assign(&b, ReduceOp::Sum).unwrap();
        assert_eq!(a, TensorData::F32(vec![8.0, 7.0, 6.0]));
    }

    #[test]
    fn combine_assign_rejects_dtype_mismatch() {
        let mut a = TensorData::F32(vec![1.0]);
        let b = TensorData::I32(vec![1]);
        assert!(a.combine_assign(&b, ReduceOp::Sum).is_err());
    }

    #[test]
    fn bytes_round_trip() {
        let a = TensorData::I64(vec![-1, 0, 1 << 40]);
        let b = TensorData::from_bytes(Dtype::I64, a.as_bytes()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn concat_rows_stacks_parts() {
        let a = HostTensor::from_vec(vec![1.0f32, 2.0], &[1, 2]).unwrap();
        let b = HostTensor::from_vec(vec![3.0f32, 4.0, 5.0, 6.0], &[2, 2]).unwrap();
        let c = HostTensor::concat_rows(&[a, b]).unwrap();
        assert_eq!(c.shape(), &[3, 2]);
        assert_eq!(c.as_slice::<f32>().unwrap(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn concat_rows_rejects_ragged_tail() {
        let a = HostTensor::from_vec(vec![1.0f32, 2.0], &[1, 2]).unwrap();
        let b = HostTensor::from_vec(vec![3.0f32, 4.0, 5.0], &[1, 3]).unwrap();
        assert!(HostTensor::concat_rows(&[a, b]).is_err());
    }
}
