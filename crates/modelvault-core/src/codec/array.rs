//! Typed n-dimensional arrays and the unsigned width squeeze.

use crate::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of an array block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    U8,
    U16,
    U32,
    U64,
    I32,
    I64,
    F32,
    F64,
}

impl Dtype {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Dtype::U8 => "u8",
            Dtype::U16 => "u16",
            Dtype::U32 => "u32",
            Dtype::U64 => "u64",
            Dtype::I32 => "i32",
            Dtype::I64 => "i64",
            Dtype::F32 => "f32",
            Dtype::F64 => "f64",
        }
    }

    /// Size of one element in bytes.
    pub const fn item_size(&self) -> usize {
        match self {
            Dtype::U8 => 1,
            Dtype::U16 => 2,
            Dtype::U32 | Dtype::I32 | Dtype::F32 => 4,
            Dtype::U64 | Dtype::I64 | Dtype::F64 => 8,
        }
    }

    pub const fn is_unsigned(&self) -> bool {
        matches!(self, Dtype::U8 | Dtype::U16 | Dtype::U32 | Dtype::U64)
    }

    /// Narrowest unsigned type such that `max < 2^width`.
    pub fn narrowest_unsigned(max: u64) -> Dtype {
        match 64 - max.leading_zeros() {
            0..=8 => Dtype::U8,
            9..=16 => Dtype::U16,
            17..=32 => Dtype::U32,
            _ => Dtype::U64,
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat, typed element storage.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

macro_rules! with_values {
    ($data:expr, $values:ident => $body:expr) => {
        match $data {
            ArrayData::U8($values) => $body,
            ArrayData::U16($values) => $body,
            ArrayData::U32($values) => $body,
            ArrayData::U64($values) => $body,
            ArrayData::I32($values) => $body,
            ArrayData::I64($values) => $body,
            ArrayData::F32($values) => $body,
            ArrayData::F64($values) => $body,
        }
    };
}

macro_rules! decode_le {
    ($bytes:expr, $ty:ty, $variant:ident) => {{
        const SIZE: usize = std::mem::size_of::<$ty>();
        ArrayData::$variant(
            $bytes
                .chunks_exact(SIZE)
                .map(|chunk| {
                    let mut buf = [0u8; SIZE];
                    buf.copy_from_slice(chunk);
                    <$ty>::from_le_bytes(buf)
                })
                .collect(),
        )
    }};
}

impl ArrayData {
    pub fn dtype(&self) -> Dtype {
        match self {
            ArrayData::U8(_) => Dtype::U8,
            ArrayData::U16(_) => Dtype::U16,
            ArrayData::U32(_) => Dtype::U32,
            ArrayData::U64(_) => Dtype::U64,
            ArrayData::I32(_) => Dtype::I32,
            ArrayData::I64(_) => Dtype::I64,
            ArrayData::F32(_) => Dtype::F32,
            ArrayData::F64(_) => Dtype::F64,
        }
    }

    pub fn len(&self) -> usize {
        with_values!(self, values => values.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Little-endian byte image of the elements.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len() * self.dtype().item_size());
        with_values!(self, values => {
            for value in values {
                out.extend_from_slice(&value.to_le_bytes());
            }
        });
        out
    }

    /// Rebuild elements of `dtype` from their little-endian byte image.
    pub fn from_le_bytes(dtype: Dtype, bytes: &[u8]) -> Result<Self> {
        if bytes.len() % dtype.item_size() != 0 {
            return Err(VaultError::codec(format!(
                "{} bytes is not a whole number of {} elements",
                bytes.len(),
                dtype
            )));
        }
        Ok(match dtype {
            Dtype::U8 => ArrayData::U8(bytes.to_vec()),
            Dtype::U16 => decode_le!(bytes, u16, U16),
            Dtype::U32 => decode_le!(bytes, u32, U32),
            Dtype::U64 => decode_le!(bytes, u64, U64),
            Dtype::I32 => decode_le!(bytes, i32, I32),
            Dtype::I64 => decode_le!(bytes, i64, I64),
            Dtype::F32 => decode_le!(bytes, f32, F32),
            Dtype::F64 => decode_le!(bytes, f64, F64),
        })
    }

    /// Widen an integer array to `u64`. Negative values and floats are rejected.
    pub fn to_u64_vec(&self) -> Result<Vec<u64>> {
        fn non_negative<T: Copy + TryInto<u64> + fmt::Display>(values: &[T]) -> Result<Vec<u64>> {
            values
                .iter()
                .map(|&v| {
                    v.try_into()
                        .map_err(|_| VaultError::codec(format!("{} is not a valid index", v)))
                })
                .collect()
        }
        match self {
            ArrayData::U8(v) => Ok(v.iter().map(|&x| u64::from(x)).collect()),
            ArrayData::U16(v) => Ok(v.iter().map(|&x| u64::from(x)).collect()),
            ArrayData::U32(v) => Ok(v.iter().map(|&x| u64::from(x)).collect()),
            ArrayData::U64(v) => Ok(v.clone()),
            ArrayData::I32(v) => non_negative(v),
            ArrayData::I64(v) => non_negative(v),
            ArrayData::F32(_) | ArrayData::F64(_) => Err(VaultError::codec(format!(
                "expected an integer array, got {}",
                self.dtype()
            ))),
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ArrayData::U8(v) => Some(v),
            _ => None,
        }
    }
}

/// Squeeze non-negative integers into the narrowest unsigned width holding the maximum.
pub fn squeeze_bits(values: &[u64]) -> ArrayData {
    let max = values.iter().copied().max().unwrap_or(0);
    match Dtype::narrowest_unsigned(max) {
        Dtype::U8 => ArrayData::U8(values.iter().map(|&v| v as u8).collect()),
        Dtype::U16 => ArrayData::U16(values.iter().map(|&v| v as u16).collect()),
        Dtype::U32 => ArrayData::U32(values.iter().map(|&v| v as u32).collect()),
        _ => ArrayData::U64(values.to_vec()),
    }
}

/// An n-dimensional array in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    shape: Vec<usize>,
    data: ArrayData,
}

impl NdArray {
    /// Fails unless the product of `shape` equals the element count.
    pub fn new(shape: Vec<usize>, data: ArrayData) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(VaultError::codec(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// One-dimensional array over `data`.
    pub fn vector(data: ArrayData) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    pub fn into_data(self) -> ArrayData {
        self.data
    }

    pub fn dtype(&self) -> Dtype {
        self.data.dtype()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<ArrayData> for NdArray {
    fn from(data: ArrayData) -> Self {
        NdArray::vector(data)
    }
}
