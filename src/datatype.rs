//! Scalar data types a matrix can hold
//!
//! The storage is always a raw byte arena; this module is what gives those bytes a
//! meaning. [`MatrixDataType`] is the runtime tag carried around in headers, while
//! [`Scalar`] is the compile time side of it, so the kernels can be written once
//! and monomorphized for both precisions.

use crate::errors::MatrixError;
use serde::{Deserialize, Serialize};

/// Runtime tag for the element type of a matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatrixDataType {
    F32,
    F64,
}

impl MatrixDataType {
    /// Parses a data type from its descriptive name
    ///
    /// # Errors
    /// - if the name is neither `"float32"` nor `"float64"`
    pub fn from_name(name: &str) -> Result<MatrixDataType, MatrixError> {
        match name {
            "float32" => Ok(MatrixDataType::F32),
            "float64" => Ok(MatrixDataType::F64),
            other => Err(MatrixError::InvalidDataType(other.to_string())),
        }
    }

    /// Descriptive name, the same one [`MatrixDataType::from_name`] parses
    pub fn name(self) -> &'static str {
        match self {
            MatrixDataType::F32 => "float32",
            MatrixDataType::F64 => "float64",
        }
    }

    /// Size of one element, in bytes
    pub fn byte_size(self) -> usize {
        match self {
            MatrixDataType::F32 => 4,
            MatrixDataType::F64 => 8,
        }
    }
}

impl Default for MatrixDataType {
    fn default() -> Self {
        MatrixDataType::F32
    }
}

impl std::fmt::Display for MatrixDataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The element types the kernels can be instantiated with
///
/// Every kernel is generic over this trait and gets monomorphized twice, once per
/// precision. The [`bytemuck::Pod`] bound is what allows casting the raw arena
/// bytes into typed slices without copying.
pub trait Scalar:
    bytemuck::Pod
    + PartialOrd
    + std::ops::Add<Output = Self>
    + std::ops::Sub<Output = Self>
    + std::ops::Mul<Output = Self>
    + std::ops::Div<Output = Self>
    + std::ops::Neg<Output = Self>
    + std::ops::AddAssign
    + std::ops::SubAssign
    + std::ops::MulAssign
{
    const DTYPE: MatrixDataType;
    const ZERO: Self;
    const ONE: Self;

    fn from_f64(value: f64) -> Self;
    fn to_f64(self) -> f64;
    fn sqrt(self) -> Self;
}

impl Scalar for f32 {
    const DTYPE: MatrixDataType = MatrixDataType::F32;
    const ZERO: f32 = 0.0;
    const ONE: f32 = 1.0;

    fn from_f64(value: f64) -> f32 {
        value as f32
    }

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn sqrt(self) -> f32 {
        f32::sqrt(self)
    }
}

impl Scalar for f64 {
    const DTYPE: MatrixDataType = MatrixDataType::F64;
    const ZERO: f64 = 0.0;
    const ONE: f64 = 1.0;

    fn from_f64(value: f64) -> f64 {
        value
    }

    fn to_f64(self) -> f64 {
        self
    }

    fn sqrt(self) -> f64 {
        f64::sqrt(self)
    }
}
