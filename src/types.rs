//! Core data types for BlockFS volumes

use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element types storable in a volume.
///
/// The discriminants are the on-disk dtype codes of the directory-file
/// header and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum DataType {
    /// Unsigned 8-bit integer
    U8 = 0,
    /// Unsigned 16-bit integer
    U16 = 1,
    /// Unsigned 32-bit integer
    U32 = 2,
    /// Unsigned 64-bit integer
    U64 = 3,
    /// Signed 8-bit integer
    I8 = 4,
    /// Signed 16-bit integer
    I16 = 5,
    /// Signed 32-bit integer
    I32 = 6,
    /// Signed 64-bit integer
    I64 = 7,
    /// 32-bit floating point
    F32 = 8,
    /// 64-bit floating point
    F64 = 9,
}

impl DataType {
    /// Size in bytes of one element of this type
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::U8 | DataType::I8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::U32 | DataType::I32 | DataType::F32 => 4,
            DataType::U64 | DataType::I64 | DataType::F64 => 8,
        }
    }

    /// The on-disk code for this type
    pub fn code(&self) -> u16 {
        *self as u16
    }

    /// Decode an on-disk dtype code
    pub fn from_code(code: u16) -> Result<Self> {
        match code {
            0 => Ok(DataType::U8),
            1 => Ok(DataType::U16),
            2 => Ok(DataType::U32),
            3 => Ok(DataType::U64),
            4 => Ok(DataType::I8),
            5 => Ok(DataType::I16),
            6 => Ok(DataType::I32),
            7 => Ok(DataType::I64),
            8 => Ok(DataType::F32),
            9 => Ok(DataType::F64),
            other => Err(Error::Format(format!("unknown dtype code {}", other))),
        }
    }

    /// Check if this is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }

    /// Check if this is an integer type
    pub fn is_integer(&self) -> bool {
        !self.is_float()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::U8 => "u8",
            DataType::U16 => "u16",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
            DataType::I8 => "i8",
            DataType::I16 => "i16",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::F32 => "f32",
            DataType::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// Position of a block in the block grid.
///
/// Grid coordinates are bounded by the grid extent, which the layout
/// guarantees fits in `u32`. Worker routing hashes the 12-byte
/// little-endian `(x, y, z)` encoding, so the field width is part of the
/// format contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockCoord {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl BlockCoord {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Little-endian byte encoding used by worker routing
    pub fn to_le_bytes(&self) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[0..4].copy_from_slice(&self.x.to_le_bytes());
        buf[4..8].copy_from_slice(&self.y.to_le_bytes());
        buf[8..12].copy_from_slice(&self.z.to_le_bytes());
        buf
    }
}

impl fmt::Display for BlockCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// One decoded block of voxel data.
///
/// The shape is `(z, y, x)` element counts; the payload is the
/// little-endian packed voxel array iterated with x fastest, then y,
/// then z.
#[derive(Debug, Clone, PartialEq)]
pub struct RawBlock {
    shape: [u32; 3],
    dtype: DataType,
    data: Bytes,
}

impl RawBlock {
    /// Wrap a voxel payload, validating its length against shape and dtype.
    pub fn new(shape: [u32; 3], dtype: DataType, data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        let expected = shape.iter().map(|&d| d as usize).product::<usize>() * dtype.size_in_bytes();
        if data.len() != expected {
            return Err(Error::ShapeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { shape, dtype, data })
    }

    /// An all-zero block of the given shape
    pub fn zeroed(shape: [u32; 3], dtype: DataType) -> Self {
        let nbytes = shape.iter().map(|&d| d as usize).product::<usize>() * dtype.size_in_bytes();
        Self {
            shape,
            dtype,
            data: Bytes::from(vec![0u8; nbytes]),
        }
    }

    /// Shape as `(z, y, x)` element counts
    pub fn shape(&self) -> [u32; 3] {
        self.shape
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// The packed voxel bytes
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }
}
